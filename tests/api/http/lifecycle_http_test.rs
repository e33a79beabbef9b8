//! GC, engine administration and health HTTP tests

use super::{build_test_router, get_json, post_json, send, TestAppState};
use crate::api::{admin_token, session_token};
use axum::http::{Method, StatusCode};
use chrono::Duration;
use rbac_core::domain::{Policy, RoleTuple};
use serde_json::{json, Value};

fn view_tuple(team: &str, app: &str, env: &str) -> RoleTuple {
    RoleTuple {
        team: team.to_string(),
        entity_name: app.to_string(),
        environment: env.to_string(),
        action: "view".to_string(),
        ..Default::default()
    }
}

async fn reload_engine(state: &TestAppState) {
    state
        .authorization
        .engine()
        .reload()
        .await
        .expect("engine reload");
}

/// A second super-admin that is not the bootstrap admin account.
async fn create_root(state: &TestAppState) -> String {
    let app = build_test_router(state.clone());
    let (status, _): (_, Option<Value>) = post_json(
        &app,
        "/user",
        &admin_token(),
        &json!({ "emailId": "root@x.io", "superAdmin": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    session_token("root@x.io")
}

// ============================================================================
// GC
// ============================================================================

#[tokio::test]
async fn test_gc_collapses_duplicate_roles() {
    let state = TestAppState::new().await;
    let key = "role:view_t1_e1_app1";
    let tuple = view_tuple("t1", "app1", "e1");

    let alice = state.store.add_user("alice@x.io").await;
    let bob = state.store.add_user("bob@x.io").await;
    state.store.add_role(10, key, &tuple, Duration::hours(1)).await;
    state.store.add_role(11, key, &tuple, Duration::hours(1)).await;
    state.store.map_user_role(bob.id, 10).await;
    state.store.map_user_role(alice.id, 11).await;
    state
        .store
        .write()
        .await
        .policies
        .push(Policy::allow(key, "applications", "get", "t1/app1"));

    let report = state.lifecycle_service.run_gc().await.unwrap();

    assert_eq!(report.duplicate_keys, 1);
    assert_eq!(report.duplicate_rows_deleted, 1);
    assert_eq!(report.orphan_roles_deleted, 0);

    let tables = state.store.read().await;
    let ids: Vec<i64> = tables.roles.iter().filter(|r| r.role == key).map(|r| r.id).collect();
    assert_eq!(ids, vec![10]);
    assert!(tables.user_roles.contains(&(alice.id, 10)));
    assert!(tables.user_roles.contains(&(bob.id, 10)));
    drop(tables);

    let token = session_token("alice@x.io");
    assert!(state.enforce(&token, "applications", "get", "t1/app1").await);
}

#[tokio::test]
async fn test_gc_removes_orphans_after_grace_period() {
    let state = TestAppState::new().await;
    let old_key = "role:view_t9_e1_old";
    let fresh_key = "role:view_t9_e1_fresh";
    state
        .store
        .add_role(20, old_key, &view_tuple("t9", "old", "e1"), Duration::hours(1))
        .await;
    state
        .store
        .add_role(21, fresh_key, &view_tuple("t9", "fresh", "e1"), Duration::zero())
        .await;
    {
        let mut tables = state.store.write().await;
        tables
            .policies
            .push(Policy::allow(old_key, "applications", "get", "t9/old"));
        tables
            .policies
            .push(Policy::allow(fresh_key, "applications", "get", "t9/fresh"));
    }
    reload_engine(&state).await;

    let report = state.lifecycle_service.run_gc().await.unwrap();

    assert_eq!(report.orphan_roles_deleted, 1);
    assert_eq!(report.engine_tuples_removed, 1);
    let tables = state.store.read().await;
    assert!(!tables.roles.iter().any(|r| r.role == old_key));
    assert!(tables.roles.iter().any(|r| r.role == fresh_key));
    assert!(!tables.policies.iter().any(|p| p.sub == old_key));
    // The super-admin role is never collected.
    assert!(tables.roles.iter().any(|r| r.id == 1));
}

#[tokio::test]
async fn test_gc_drops_mappings_of_inactive_users() {
    let state = TestAppState::new().await;
    let carol = state.store.add_user("carol@x.io").await;
    state
        .store
        .add_role(30, "role:view_t1_e1_app1", &view_tuple("t1", "app1", "e1"), Duration::zero())
        .await;
    state.store.map_user_role(carol.id, 30).await;
    {
        let mut tables = state.store.write().await;
        if let Some(user) = tables.users.iter_mut().find(|u| u.id == carol.id) {
            user.active = false;
        }
    }

    let report = state.lifecycle_service.run_gc().await.unwrap();

    assert_eq!(report.inactive_mappings_deleted, 1);
    assert!(state.store.role_keys_of_user(carol.id).await.is_empty());
}

#[tokio::test]
async fn test_gc_on_clean_store_is_a_no_op() {
    let state = TestAppState::new().await;

    let report = state.lifecycle_service.run_gc().await.unwrap();

    assert_eq!(report, Default::default());
    assert!(state.enforce(&admin_token(), "applications", "get", "any/app").await);
}

// ============================================================================
// Engine administration
// ============================================================================

#[tokio::test]
async fn test_sync_orchestrator_renders_team_roles() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());
    let dave = state.store.add_user("dave@x.io").await;
    state
        .store
        .add_role(40, "role:view_t5_e1_app5", &view_tuple("t5", "app5", "e1"), Duration::zero())
        .await;
    state.store.map_user_role(dave.id, 40).await;
    reload_engine(&state).await;

    let token = session_token("dave@x.io");
    assert!(!state.enforce(&token, "applications", "get", "t5/app5").await);

    let (status, body): (_, Option<Value>) =
        get_json(&app, "/user/sync/orchestratortocasbin", &admin_token()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["message"], "2 orchestrator policies synced");
    assert!(state.enforce(&token, "applications", "get", "t5/app5").await);
    assert!(state.enforce(&token, "team", "get", "t5").await);
}

#[tokio::test]
async fn test_sync_orchestrator_is_admin_only() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());
    let root = create_root(&state).await;

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/sync/orchestratortocasbin", &root).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_cache_dump_requires_super_admin() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());
    let root = create_root(&state).await;

    let (status, body): (_, Option<Value>) = get_json(&app, "/user/role/cache", &root).await;
    assert_eq!(status, StatusCode::OK);
    let data = &body.unwrap()["data"];
    assert!(data["engine"]["policies"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["sub"] == "role:super-admin___"));
    assert!(data["decisions"].is_string());

    post_json::<_, Value>(
        &app,
        "/user",
        &admin_token(),
        &json!({
            "emailId": "viewer@x.io",
            "roleFilters": [{ "entity": "apps", "team": "t1", "entityName": "app1", "environment": "e1", "action": "view" }]
        }),
    )
    .await;
    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/role/cache", &session_token("viewer@x.io")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invalidate_keeps_decisions_correct() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    let (status, body): (_, Option<Value>) =
        get_json(&app, "/user/role/cache/invalidate", &admin_token()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["message"], "Policy caches invalidated");
    assert!(state.enforce(&admin_token(), "cluster", "delete", "prod/ns").await);
}

#[tokio::test]
async fn test_refresh_templates_picks_up_new_rows() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    let (status, body): (_, Option<Value>) =
        get_json(&app, "/user/role/template/refresh", &admin_token()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.unwrap()["message"]
        .as_str()
        .unwrap()
        .ends_with("role templates loaded"));

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/role/template/refresh", &session_token("nobody@x.io")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_and_readiness() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, body): (_, Option<Value>) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["status"], "healthy");

    let (status, _): (_, Option<Value>) = send(&app, Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_disabled_is_not_found() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, _): (_, Option<Value>) = send(&app, Method::GET, "/metrics", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
