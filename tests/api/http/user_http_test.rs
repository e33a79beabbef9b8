//! User API HTTP tests

use super::{
    build_test_router, delete_json, delete_json_with_body, get_json, post_json, put_json, send,
    TestAppState,
};
use crate::api::{admin_token, api_token, session_token};
use axum::http::{Method, StatusCode};
use chrono::Utc;
use rbac_core::domain::ApiToken;
use serde_json::{json, Value};
use std::time::Duration;

fn app_filter(team: &str, apps: &str, env: &str, action: &str) -> Value {
    json!({
        "entity": "apps",
        "team": team,
        "entityName": apps,
        "environment": env,
        "action": action,
        "accessType": ""
    })
}

fn cluster_filter() -> Value {
    json!({
        "entity": "cluster",
        "cluster": "prod",
        "namespace": "default",
        "group": "apps",
        "kind": "Deployment",
        "resource": "web",
        "action": "clusterAdmin"
    })
}

async fn create_user(app: &axum::Router, token: &str, email: &str, filters: Vec<Value>) -> (StatusCode, Option<Value>) {
    post_json(
        app,
        "/user",
        token,
        &json!({ "emailId": email, "roleFilters": filters, "superAdmin": false }),
    )
    .await
}

fn error_code(body: &Option<Value>) -> String {
    body.as_ref()
        .and_then(|b| b["error"]["code"].as_str())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_create_user_grants_expanded_roles() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    let (status, body) = create_user(
        &app,
        &admin_token(),
        "Alice@X.io",
        vec![app_filter("t1", "app1,app2", "e1", "admin")],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let body = body.unwrap();
    assert_eq!(body["data"][0]["emailId"], "alice@x.io");

    let alice = state.store.user_by_email("alice@x.io").await.unwrap();
    assert_eq!(
        state.store.role_keys_of_user(alice.id).await,
        vec![
            "role:admin_t1_e1_app1".to_string(),
            "role:admin_t1_e1_app2".to_string()
        ]
    );

    let token = session_token("alice@x.io");
    assert!(state.enforce(&token, "applications", "get", "t1/app1").await);
    assert!(state.enforce(&token, "applications", "get", "t1/app2").await);
    assert!(!state.enforce(&token, "applications", "get", "t1/app3").await);

    let caller = state.caller(&token).await;
    let objs: Vec<String> = ["t1/app1", "t1/app2", "t1/app3"]
        .iter()
        .map(|o| o.to_string())
        .collect();
    let decisions = state
        .authorization
        .enforce_batch(&caller, "applications", "get", &objs)
        .await
        .unwrap();
    assert_eq!(decisions["t1/app1"], true);
    assert_eq!(decisions["t1/app2"], true);
    assert_eq!(decisions["t1/app3"], false);
}

#[tokio::test]
async fn test_create_accepts_comma_separated_emails() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    let (status, body) = create_user(
        &app,
        &admin_token(),
        "a@x.io, b@x.io",
        vec![app_filter("t1", "app1", "e1", "view")],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let users = body.unwrap()["data"].as_array().cloned().unwrap();
    assert_eq!(users.len(), 2);
    assert!(state.store.user_by_email("a@x.io").await.is_some());
    assert!(state.store.user_by_email("b@x.io").await.is_some());

    let token = session_token("b@x.io");
    assert!(state.enforce(&token, "applications", "get", "t1/app1").await);
}

#[tokio::test]
async fn test_create_rejects_invalid_email() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, _) = create_user(&app, &admin_token(), "not-an-email", vec![]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_manager_cannot_grant_cluster_access() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    let (status, _) = create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![app_filter("t1", "app1", "e1", "manager")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let policies_before = state.store.read().await.policies.len();

    let alice = session_token("alice@x.io");
    let (status, body) = create_user(&app, &alice, "bob@x.io", vec![cluster_filter()]).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "forbidden");
    assert!(state.store.user_by_email("bob@x.io").await.is_none());
    assert_eq!(state.store.read().await.policies.len(), policies_before);
}

#[tokio::test]
async fn test_manager_grants_within_team() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![app_filter("t1", "app1", "e1", "manager")],
    )
    .await;

    let alice = session_token("alice@x.io");
    let (status, _) = create_user(
        &app,
        &alice,
        "carol@x.io",
        vec![app_filter("t1", "app1", "e1", "view")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // A second team is outside alice's reach.
    let (status, _) = create_user(
        &app,
        &alice,
        "dave@x.io",
        vec![app_filter("t2", "app9", "e1", "view")],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(state.store.user_by_email("dave@x.io").await.is_none());
}

#[tokio::test]
async fn test_groups_field_is_not_acceptable() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, body): (_, Option<Value>) = post_json(
        &app,
        "/user",
        &admin_token(),
        &json!({ "emailId": "alice@x.io", "groups": ["devs"] }),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    assert_eq!(error_code(&body), "not_acceptable");
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, body): (_, Option<Value>) = send(
        &app,
        Method::POST,
        "/user",
        Some(&admin_token()),
        Some("{\"emailId\": ".to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "bad_request");
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, _): (_, Option<Value>) = send(&app, Method::GET, "/user/v2", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_forged_token_is_unauthorized() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, _): (_, Option<Value>) = get_json(&app, "/user/v2", "not.a.jwt").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_user_token_is_unauthorized() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/check/roles", &session_token("ghost@x.io")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_update_replaces_role_filters() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![app_filter("t1", "app1", "e1", "admin")],
    )
    .await;
    let alice = state.store.user_by_email("alice@x.io").await.unwrap();

    let (status, body): (_, Option<Value>) = put_json(
        &app,
        "/user",
        &admin_token(),
        &json!({
            "id": alice.id,
            "emailId": "alice@x.io",
            "roleFilters": [app_filter("t1", "app3", "e1", "view")]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["data"]["id"], alice.id);
    assert_eq!(
        state.store.role_keys_of_user(alice.id).await,
        vec!["role:view_t1_e1_app3".to_string()]
    );

    let token = session_token("alice@x.io");
    assert!(!state.enforce(&token, "applications", "get", "t1/app1").await);
    assert!(state.enforce(&token, "applications", "get", "t1/app3").await);
}

#[tokio::test]
async fn test_create_on_active_user_merges_roles() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![app_filter("t1", "app1", "e1", "admin")],
    )
    .await;
    let (status, _) = create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![app_filter("t1", "app2", "e1", "view")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let alice = state.store.user_by_email("alice@x.io").await.unwrap();
    assert_eq!(
        state.store.role_keys_of_user(alice.id).await,
        vec![
            "role:admin_t1_e1_app1".to_string(),
            "role:view_t1_e1_app2".to_string()
        ]
    );
}

#[tokio::test]
async fn test_concurrent_updates_on_one_user_conflict() {
    let state = TestAppState::with_slow_memberships(Duration::from_millis(300)).await;
    let app = build_test_router(state.clone());

    create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![app_filter("t1", "app1", "e1", "admin")],
    )
    .await;
    let alice = state.store.user_by_email("alice@x.io").await.unwrap();

    let token = admin_token();
    let first = json!({
        "id": alice.id,
        "emailId": "alice@x.io",
        "roleFilters": [app_filter("t1", "app2", "e1", "view")]
    });
    let second = json!({
        "id": alice.id,
        "emailId": "alice@x.io",
        "roleFilters": [app_filter("t1", "app3", "e1", "view")]
    });
    let (a, b) = tokio::join!(
        put_json::<_, Value>(&app, "/user", &token, &first),
        put_json::<_, Value>(&app, "/user", &token, &second),
    );

    let mut statuses = vec![a.0, b.0];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);

    let rejected = if a.0 == StatusCode::CONFLICT { a.1 } else { b.1 };
    let message = rejected.unwrap()["error"]["userMessage"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    assert!(message.contains("concurrent request"));
}

#[tokio::test]
async fn test_delete_revokes_access() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![app_filter("t1", "app1", "e1", "admin")],
    )
    .await;
    let alice = state.store.user_by_email("alice@x.io").await.unwrap();
    let token = session_token("alice@x.io");
    assert!(state.enforce(&token, "applications", "get", "t1/app1").await);
    let caller = state.caller(&token).await;

    let (status, _): (_, Option<Value>) =
        delete_json(&app, &format!("/user/{}", alice.id), &admin_token()).await;
    assert_eq!(status, StatusCode::OK);

    let stored = state.store.user_by_email("alice@x.io").await.unwrap();
    assert!(!stored.active);
    assert!(state.store.role_keys_of_user(alice.id).await.is_empty());
    assert!(!state
        .authorization
        .enforce(&caller, "applications", "get", "t1/app1")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_recreate_reactivates_deleted_user() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(&app, &admin_token(), "alice@x.io", vec![app_filter("t1", "app1", "e1", "admin")]).await;
    let alice = state.store.user_by_email("alice@x.io").await.unwrap();
    delete_json::<Value>(&app, &format!("/user/{}", alice.id), &admin_token()).await;

    let (status, body) = create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![app_filter("t1", "app2", "e1", "view")],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["data"][0]["id"], alice.id);
    let stored = state.store.user_by_email("alice@x.io").await.unwrap();
    assert!(stored.active);
    assert_eq!(
        state.store.role_keys_of_user(alice.id).await,
        vec!["role:view_t1_e1_app2".to_string()]
    );
}

#[tokio::test]
async fn test_protected_users_cannot_be_deleted() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    for id in [1, 2] {
        let (status, _): (_, Option<Value>) =
            delete_json(&app, &format!("/user/{}", id), &admin_token()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    let (status, _): (_, Option<Value>) = delete_json_with_body(
        &app,
        "/user/bulk",
        &admin_token(),
        &json!({ "ids": [2] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(state.store.user_by_email("admin").await.unwrap().active);
}

#[tokio::test]
async fn test_bulk_delete_by_listing_filter() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(&app, &admin_token(), "dev1@x.io, dev2@x.io, ops@x.io", vec![app_filter("t1", "app1", "e1", "view")]).await;

    let (status, body): (_, Option<Value>) = delete_json_with_body(
        &app,
        "/user/bulk",
        &admin_token(),
        &json!({ "listingRequest": { "searchKey": "dev" } }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.unwrap()["message"].as_str().unwrap().contains('2'));
    assert!(!state.store.user_by_email("dev1@x.io").await.unwrap().active);
    assert!(!state.store.user_by_email("dev2@x.io").await.unwrap().active);
    assert!(state.store.user_by_email("ops@x.io").await.unwrap().active);
}

#[tokio::test]
async fn test_listing_excludes_system_and_inactive_users() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(&app, &admin_token(), "alice@x.io, bob@x.io", vec![app_filter("t1", "app1", "e1", "view")]).await;
    let bob = state.store.user_by_email("bob@x.io").await.unwrap();
    delete_json::<Value>(&app, &format!("/user/{}", bob.id), &admin_token()).await;

    let (status, body): (_, Option<Value>) = get_json(&app, "/user/v2", &admin_token()).await;

    assert_eq!(status, StatusCode::OK);
    let body = body.unwrap();
    let emails: Vec<&str> = body["data"]["users"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["emailId"].as_str())
        .collect();
    assert_eq!(emails, vec!["admin", "alice@x.io"]);
    assert_eq!(body["data"]["totalCount"], 2);

    let (_, body): (_, Option<Value>) =
        get_json(&app, "/user/v2?status=inactive", &admin_token()).await;
    assert_eq!(body.unwrap()["data"]["users"][0]["emailId"], "bob@x.io");
}

#[tokio::test]
async fn test_listing_requires_manager() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(&app, &admin_token(), "viewer@x.io", vec![app_filter("t1", "app1", "e1", "view")]).await;

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/v2", &session_token("viewer@x.io")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_listing_rejects_negative_offset() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/v2?offset=-5", &admin_token()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_user_returns_role_filters() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(&app, &admin_token(), "alice@x.io", vec![app_filter("t1", "app1", "e1", "admin")]).await;
    let alice = state.store.user_by_email("alice@x.io").await.unwrap();

    let (status, body): (_, Option<Value>) =
        get_json(&app, &format!("/user/{}", alice.id), &admin_token()).await;

    assert_eq!(status, StatusCode::OK);
    let data = &body.unwrap()["data"];
    assert_eq!(data["emailId"], "alice@x.io");
    assert_eq!(data["superAdmin"], false);
    let filters = data["roleFilters"].as_array().unwrap();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0]["team"], "t1");
    assert_eq!(filters[0]["entityName"], "app1");
    assert_eq!(filters[0]["action"], "admin");
}

#[tokio::test]
async fn test_get_unknown_user_is_not_found() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, _): (_, Option<Value>) = get_json(&app, "/user/999", &admin_token()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_check_roles_reports_best_role_for_app() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(
        &app,
        &admin_token(),
        "alice@x.io",
        vec![
            app_filter("t1", "app1", "e1", "admin"),
            app_filter("t1", "app1", "e2", "view"),
        ],
    )
    .await;
    let token = session_token("alice@x.io");

    let (status, body): (_, Option<Value>) = get_json(&app, "/user/check/roles", &token).await;
    assert_eq!(status, StatusCode::OK);
    let data = &body.unwrap()["data"];
    assert_eq!(data["superAdmin"], false);
    let roles: Vec<&str> = data["roles"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r.as_str())
        .collect();
    assert_eq!(roles, vec!["role:admin_t1_e1_app1", "role:view_t1_e2_app1"]);

    let (_, body): (_, Option<Value>) =
        get_json(&app, "/user/check/roles?appName=app1", &token).await;
    assert_eq!(body.unwrap()["data"]["role"], "Admin");

    let (_, body): (_, Option<Value>) =
        get_json(&app, "/user/check/roles?appName=other", &token).await;
    assert!(body.unwrap()["data"]["role"].is_null());
}

#[tokio::test]
async fn test_admin_check_roles_is_super_admin() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, body): (_, Option<Value>) =
        get_json(&app, "/user/check/roles", &admin_token()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["data"]["superAdmin"], true);
}

#[tokio::test]
async fn test_api_token_requires_current_version() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(&app, &admin_token(), "API-TOKEN:ci-bot", vec![app_filter("t1", "app1", "e1", "view")]).await;
    let user = state.store.user_by_email("API-TOKEN:ci-bot").await.unwrap();
    state
        .store
        .add_api_token(ApiToken {
            id: 1,
            name: "ci-bot".to_string(),
            user_id: user.id,
            version: "2".to_string(),
            expires_at: None,
            active: true,
        })
        .await;

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/check/roles", &api_token("ci-bot", "2")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/check/roles", &api_token("ci-bot", "1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Login audit runs on a background worker.
    for _ in 0..20 {
        if !state.store.read().await.logins.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let logins = state.store.read().await.logins.clone();
    assert!(logins.iter().any(|l| l.user_id == user.id && l.at <= Utc::now()));
}

#[tokio::test]
async fn test_mutations_are_audited() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(&app, &admin_token(), "alice@x.io", vec![app_filter("t1", "app1", "e1", "view")]).await;
    let alice = state.store.user_by_email("alice@x.io").await.unwrap();
    delete_json::<Value>(&app, &format!("/user/{}", alice.id), &admin_token()).await;

    let audits = state.store.read().await.audits.clone();
    assert_eq!(audits.len(), 2);
    assert!(audits.iter().all(|a| a.entity_id == alice.id && a.actor_id == 2));
}

#[tokio::test]
async fn test_viewer_cannot_create_or_delete_roleless_users() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_user(&app, &admin_token(), "carol@x.io", vec![app_filter("t1", "app1", "e1", "view")]).await;
    let victim = state.store.add_user("victim@x.io").await;
    let carol = session_token("carol@x.io");

    let (status, body): (_, Option<Value>) =
        post_json(&app, "/user", &carol, &json!({ "emailId": "eve@x.io" })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "forbidden");
    assert!(state.store.user_by_email("eve@x.io").await.is_none());

    let (status, _): (_, Option<Value>) =
        delete_json(&app, &format!("/user/{}", victim.id), &carol).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(state.store.user_by_email("victim@x.io").await.unwrap().active);

    // The super-admin still may.
    let (status, _): (_, Option<Value>) =
        delete_json(&app, &format!("/user/{}", victim.id), &admin_token()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_failed_assignment_leaves_new_user_inactive() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());
    state.store.write().await.failing_applies = 1;

    let (status, _) = create_user(
        &app,
        &admin_token(),
        "bob@x.io",
        vec![app_filter("t1", "app1", "e1", "view")],
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let bob = state.store.user_by_email("bob@x.io").await.unwrap();
    assert!(!bob.active);
    assert!(state.store.role_keys_of_user(bob.id).await.is_empty());

    // A retry reactivates the same row with the requested roles.
    let (status, _) = create_user(
        &app,
        &admin_token(),
        "bob@x.io",
        vec![app_filter("t1", "app1", "e1", "view")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let retried = state.store.user_by_email("bob@x.io").await.unwrap();
    assert_eq!(retried.id, bob.id);
    assert!(retried.active);
    assert_eq!(
        state.store.role_keys_of_user(bob.id).await,
        vec!["role:view_t1_e1_app1".to_string()]
    );
    assert!(state.enforce(&session_token("bob@x.io"), "applications", "get", "t1/app1").await);
}
