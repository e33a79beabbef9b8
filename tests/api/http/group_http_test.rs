//! Role-group API HTTP tests

use super::{
    build_test_router, create_test_config, delete_json, delete_json_with_body, get_json,
    post_json, put_json, TestAppState,
};
use crate::api::{admin_token, session_token, session_token_with_groups};
use axum::http::StatusCode;
use axum::Router;
use serde_json::{json, Value};

fn view_filter(team: &str, app: &str, env: &str) -> Value {
    json!({
        "entity": "apps",
        "team": team,
        "entityName": app,
        "environment": env,
        "action": "view"
    })
}

async fn create_group(app: &Router, name: &str, filters: Vec<Value>) -> (StatusCode, Option<Value>) {
    post_json(
        app,
        "/user/role/group",
        &admin_token(),
        &json!({ "name": name, "description": "test group", "roleFilters": filters }),
    )
    .await
}

async fn group_id(app: &Router, name: &str) -> i64 {
    let (status, body): (_, Option<Value>) = get_json(
        app,
        &format!("/user/role/group/search?name={}", name),
        &admin_token(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body.unwrap()["data"]["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_group_membership_grants_and_revokes() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    let (status, _) = create_group(&app, "G1", vec![view_filter("t1", "app1", "e1")]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _): (_, Option<Value>) = post_json(
        &app,
        "/user",
        &admin_token(),
        &json!({ "emailId": "bob@x.io", "userRoleGroups": [{ "name": "G1" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let bob = state.store.user_by_email("bob@x.io").await.unwrap();
    assert!(state.store.role_keys_of_user(bob.id).await.is_empty());
    let token = session_token("bob@x.io");
    assert!(state.enforce(&token, "applications", "get", "t1/app1").await);

    let (status, body): (_, Option<Value>) = get_json(
        &app,
        &format!("/user/{}", bob.id),
        &admin_token(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["data"]["userRoleGroups"][0]["name"], "G1");

    let (status, _): (_, Option<Value>) = put_json(
        &app,
        "/user",
        &admin_token(),
        &json!({ "id": bob.id, "emailId": "bob@x.io", "userRoleGroups": [] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!state.enforce(&token, "applications", "get", "t1/app1").await);
}

#[tokio::test]
async fn test_group_filters_update_reaches_members() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_group(&app, "G1", vec![view_filter("t1", "app1", "e1")]).await;
    post_json::<_, Value>(
        &app,
        "/user",
        &admin_token(),
        &json!({ "emailId": "bob@x.io", "userRoleGroups": [{ "name": "G1" }] }),
    )
    .await;
    let id = group_id(&app, "G1").await;

    let (status, body): (_, Option<Value>) = put_json(
        &app,
        "/user/role/group",
        &admin_token(),
        &json!({ "id": id, "name": "G1", "roleFilters": [view_filter("t1", "app2", "e1")] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["data"]["roleFilters"][0]["entityName"], "app2");

    let token = session_token("bob@x.io");
    assert!(!state.enforce(&token, "applications", "get", "t1/app1").await);
    assert!(state.enforce(&token, "applications", "get", "t1/app2").await);
}

#[tokio::test]
async fn test_duplicate_group_name_conflicts() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    create_group(&app, "Backend Devs", vec![view_filter("t1", "app1", "e1")]).await;
    let (status, body) = create_group(&app, "Backend Devs", vec![]).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body.unwrap()["error"]["code"], "conflict");
}

#[tokio::test]
async fn test_group_name_is_validated() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    let (status, _) = create_group(&app, "  ", vec![]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = create_group(&app, "a,b", vec![]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_search_is_exact_name_match() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    create_group(&app, "G1", vec![view_filter("t1", "app1", "e1")]).await;

    let (status, body): (_, Option<Value>) =
        get_json(&app, "/user/role/group/search?name=G1", &admin_token()).await;
    assert_eq!(status, StatusCode::OK);
    let data = &body.unwrap()["data"];
    assert_eq!(data["name"], "G1");
    assert_eq!(data["roleFilters"][0]["team"], "t1");

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/role/group/search?name=G", &admin_token()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deleted_group_stops_granting() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_group(&app, "G1", vec![view_filter("t1", "app1", "e1")]).await;
    post_json::<_, Value>(
        &app,
        "/user",
        &admin_token(),
        &json!({ "emailId": "bob@x.io", "userRoleGroups": [{ "name": "G1" }] }),
    )
    .await;
    let id = group_id(&app, "G1").await;
    let token = session_token("bob@x.io");
    assert!(state.enforce(&token, "applications", "get", "t1/app1").await);

    let (status, _): (_, Option<Value>) =
        delete_json(&app, &format!("/user/role/group/{}", id), &admin_token()).await;
    assert_eq!(status, StatusCode::OK);

    assert!(!state.enforce(&token, "applications", "get", "t1/app1").await);
    let (status, _): (_, Option<Value>) =
        get_json(&app, &format!("/user/role/group/{}", id), &admin_token()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_recreated_group_reuses_row() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    create_group(&app, "G1", vec![view_filter("t1", "app1", "e1")]).await;
    let id = group_id(&app, "G1").await;
    delete_json::<Value>(&app, &format!("/user/role/group/{}", id), &admin_token()).await;

    let (status, body) = create_group(&app, "G1", vec![view_filter("t1", "app2", "e1")]).await;

    assert_eq!(status, StatusCode::OK);
    let data = &body.unwrap()["data"];
    assert_eq!(data["id"], id);
    assert_eq!(data["roleFilters"].as_array().unwrap().len(), 1);
    assert_eq!(data["roleFilters"][0]["entityName"], "app2");
}

#[tokio::test]
async fn test_membership_in_unknown_group_is_not_found() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    let (status, _): (_, Option<Value>) = post_json(
        &app,
        "/user",
        &admin_token(),
        &json!({ "emailId": "bob@x.io", "userRoleGroups": [{ "name": "nope" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(state.store.user_by_email("bob@x.io").await.is_none());
}

#[tokio::test]
async fn test_group_listing_and_bulk_delete() {
    let state = TestAppState::new().await;
    let app = build_test_router(state);

    for name in ["alpha", "beta", "gamma"] {
        create_group(&app, name, vec![view_filter("t1", "app1", "e1")]).await;
    }

    let (status, body): (_, Option<Value>) =
        get_json(&app, "/user/role/group/v2?size=2", &admin_token()).await;
    assert_eq!(status, StatusCode::OK);
    let data = &body.unwrap()["data"];
    assert_eq!(data["totalCount"], 3);
    assert_eq!(data["roleGroups"].as_array().unwrap().len(), 2);
    assert_eq!(data["roleGroups"][0]["name"], "alpha");

    let (status, body): (_, Option<Value>) = delete_json_with_body(
        &app,
        "/user/role/group/bulk",
        &admin_token(),
        &json!({ "listingRequest": { "searchKey": "a" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["message"], "3 role groups deleted");

    let (_, body): (_, Option<Value>) =
        get_json(&app, "/user/role/group", &admin_token()).await;
    assert!(body.unwrap()["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_group_listing_requires_manager() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    post_json::<_, Value>(
        &app,
        "/user",
        &admin_token(),
        &json!({ "emailId": "viewer@x.io", "roleFilters": [view_filter("t1", "app1", "e1")] }),
    )
    .await;

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/role/group/v2", &session_token("viewer@x.io")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_group_claims_grant_without_user_row() {
    let mut config = create_test_config();
    config.authorisation.group_claims_active = true;
    let state = TestAppState::with_config(config).await;
    let app = build_test_router(state.clone());

    create_group(&app, "G1", vec![view_filter("t1", "app1", "e1")]).await;

    let token = session_token_with_groups("sso-user@x.io", &["G1"]);
    let caller = state.caller(&token).await;
    assert!(caller.user_id.is_none());
    assert!(caller.subjects.contains(&"group:g1".to_string()));
    assert!(state.enforce(&token, "applications", "get", "t1/app1").await);
    assert!(!state.enforce(&token, "applications", "get", "t1/app2").await);
}

#[tokio::test]
async fn test_viewer_cannot_create_or_delete_empty_groups() {
    let state = TestAppState::new().await;
    let app = build_test_router(state.clone());

    post_json::<_, Value>(
        &app,
        "/user",
        &admin_token(),
        &json!({ "emailId": "viewer@x.io", "roleFilters": [view_filter("t1", "app1", "e1")] }),
    )
    .await;
    create_group(&app, "Empty", vec![]).await;
    let id = group_id(&app, "Empty").await;
    let viewer = session_token("viewer@x.io");

    let (status, _): (_, Option<Value>) = post_json(
        &app,
        "/user/role/group",
        &viewer,
        &json!({ "name": "Shadow", "description": "", "roleFilters": [] }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _): (_, Option<Value>) =
        delete_json(&app, &format!("/user/role/group/{}", id), &viewer).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/role/group/search?name=Empty", &admin_token()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _): (_, Option<Value>) =
        get_json(&app, "/user/role/group/search?name=Shadow", &admin_token()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
