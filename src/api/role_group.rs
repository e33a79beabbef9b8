//! Role-group API handlers

use crate::api::{MessageResponse, SuccessResponse, ValidatedJson};
use crate::domain::{BulkDeleteRequest, ListingRequest, RoleGroupInfo, RoleGroupListingResponse};
use crate::error::AppError;
use crate::service::Caller;
use crate::state::HasServices;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use validator::Validate;

pub async fn create<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    ValidatedJson(input): ValidatedJson<RoleGroupInfo>,
) -> Result<Json<SuccessResponse<RoleGroupInfo>>, AppError> {
    let group = state.role_group_service().create(&caller, input).await?;
    Ok(Json(SuccessResponse::new(group)))
}

/// Replace a group's filters; the name is immutable
pub async fn update<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    ValidatedJson(input): ValidatedJson<RoleGroupInfo>,
) -> Result<Json<SuccessResponse<RoleGroupInfo>>, AppError> {
    let group = state.role_group_service().update(&caller, input).await?;
    Ok(Json(SuccessResponse::new(group)))
}

pub async fn list_all<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
) -> Result<Json<SuccessResponse<Vec<RoleGroupInfo>>>, AppError> {
    let groups = state.role_group_service().list_all(&caller).await?;
    Ok(Json(SuccessResponse::new(groups)))
}

pub async fn list<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    Query(request): Query<ListingRequest>,
) -> Result<Json<SuccessResponse<RoleGroupListingResponse>>, AppError> {
    request.validate()?;
    let listing = state.role_group_service().list(&caller, &request).await?;
    Ok(Json(SuccessResponse::new(listing)))
}

pub async fn get<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse<RoleGroupInfo>>, AppError> {
    let group = state.role_group_service().get_by_id(&caller, id).await?;
    Ok(Json(SuccessResponse::new(group)))
}

pub async fn delete<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, AppError> {
    state.role_group_service().delete(&caller, id).await?;
    Ok(Json(MessageResponse::new("Role group deleted successfully")))
}

pub async fn bulk_delete<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
    ValidatedJson(request): ValidatedJson<BulkDeleteRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    if let Some(listing) = request.listing_request.as_ref() {
        listing.validate()?;
    }
    let deleted = state.role_group_service().bulk_delete(&caller, request).await?;
    Ok(Json(MessageResponse::new(format!(
        "{} role groups deleted",
        deleted
    ))))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SearchQuery {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
}

/// Exact-name lookup
pub async fn search<S: HasServices>(
    State(state): State<S>,
    _caller: Caller,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SuccessResponse<RoleGroupInfo>>, AppError> {
    query.validate()?;
    let group = state.role_group_service().search(&query.name).await?;
    Ok(Json(SuccessResponse::new(group)))
}
