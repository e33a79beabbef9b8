//! User management API handlers

use crate::api::{MessageResponse, SuccessResponse, ValidatedJson};
use crate::domain::{BulkDeleteRequest, ListingRequest, UserInfo, UserListingResponse};
use crate::error::AppError;
use crate::service::user::CheckRolesResponse;
use crate::service::Caller;
use crate::state::HasServices;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use validator::Validate;

/// Create one or more users (`emailId` may be comma-separated)
pub async fn create<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    ValidatedJson(input): ValidatedJson<UserInfo>,
) -> Result<Json<SuccessResponse<Vec<UserInfo>>>, AppError> {
    let users = state.user_service().create(&caller, input).await?;
    Ok(Json(SuccessResponse::new(users)))
}

pub async fn update<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    ValidatedJson(input): ValidatedJson<UserInfo>,
) -> Result<Json<SuccessResponse<UserInfo>>, AppError> {
    let user = state.user_service().update(&caller, input).await?;
    Ok(Json(SuccessResponse::new(user)))
}

/// Legacy listing of every active user
pub async fn list_all<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
) -> Result<Json<SuccessResponse<Vec<UserInfo>>>, AppError> {
    let users = state.user_service().list_all(&caller).await?;
    Ok(Json(SuccessResponse::new(users)))
}

pub async fn list<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    Query(request): Query<ListingRequest>,
) -> Result<Json<SuccessResponse<UserListingResponse>>, AppError> {
    request.validate()?;
    let listing = state.user_service().list(&caller, &request).await?;
    Ok(Json(SuccessResponse::new(listing)))
}

/// Full listing with role metadata (super-admin only)
pub async fn detail<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    Query(request): Query<ListingRequest>,
) -> Result<Json<SuccessResponse<UserListingResponse>>, AppError> {
    request.validate()?;
    let listing = state.user_service().detail(&caller, request).await?;
    Ok(Json(SuccessResponse::new(listing)))
}

/// Get a user; filters the caller may not see are redacted
pub async fn get<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse<UserInfo>>, AppError> {
    let user = state.user_service().get_by_id(&caller, id).await?;
    Ok(Json(SuccessResponse::new(user)))
}

pub async fn delete<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, AppError> {
    state.user_service().delete(&caller, id).await?;
    Ok(Json(MessageResponse::new("User deleted successfully")))
}

pub async fn bulk_delete<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    ValidatedJson(request): ValidatedJson<BulkDeleteRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    if let Some(listing) = request.listing_request.as_ref() {
        listing.validate()?;
    }
    let deleted = state.user_service().bulk_delete(&caller, request).await?;
    Ok(Json(MessageResponse::new(format!("{} users deleted", deleted))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRolesQuery {
    pub app_name: Option<String>,
}

/// Effective roles of the caller
pub async fn check_roles<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    Query(query): Query<CheckRolesQuery>,
) -> Result<Json<SuccessResponse<CheckRolesResponse>>, AppError> {
    let app_name = query.app_name.as_deref().filter(|name| !name.is_empty());
    let roles = state.user_service().check_roles(&caller, app_name).await?;
    Ok(Json(SuccessResponse::new(roles)))
}

/// Re-render the orchestrator team roles into the engine (admin only)
pub async fn sync_orchestrator<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
) -> Result<Json<MessageResponse>, AppError> {
    let added = state.lifecycle_service().sync_orchestrator(&caller).await?;
    Ok(Json(MessageResponse::new(format!(
        "{} orchestrator policies synced",
        added
    ))))
}
