//! Policy cache and template administration (super-admin)

use crate::api::{MessageResponse, SuccessResponse};
use crate::error::AppError;
use crate::service::lifecycle::CacheDump;
use crate::service::Caller;
use crate::state::HasServices;
use axum::{extract::State, Json};

/// Engine index and decision cache snapshot
pub async fn cache_dump<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
) -> Result<Json<SuccessResponse<CacheDump>>, AppError> {
    let dump = state.lifecycle_service().cache_dump(&caller).await?;
    Ok(Json(SuccessResponse::new(dump)))
}

pub async fn invalidate_cache<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
) -> Result<Json<MessageResponse>, AppError> {
    state.lifecycle_service().invalidate_caches(&caller).await?;
    Ok(Json(MessageResponse::new("Policy caches invalidated")))
}

/// Reload default role templates from the store
pub async fn refresh_templates<S: HasServices>(
    State(state): State<S>,
    caller: Caller,
) -> Result<Json<MessageResponse>, AppError> {
    let count = state.lifecycle_service().refresh_templates(&caller).await?;
    Ok(Json(MessageResponse::new(format!(
        "{} role templates loaded",
        count
    ))))
}
