//! Token authentication extractor
//!
//! Requests carry the session JWT in the `token` header. External CI webhooks
//! send an API token in `api-token` instead. The extractor resolves either into
//! a [`Caller`] with its ordered enforcement subjects.

use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};

use crate::error::AppError;
use crate::middleware::client_ip::extract_ip;
use crate::service::Caller;
use crate::state::HasServices;

pub const TOKEN_HEADER: &str = "token";
pub const API_TOKEN_HEADER: &str = "api-token";

const EXT_CI_WEBHOOK_PATH: &str = "/webhook/ext-ci/";

/// Pick the token header for a request path.
fn extract_token<'a>(path: &str, headers: &'a HeaderMap) -> Result<&'a str, AppError> {
    let header = if path.contains(EXT_CI_WEBHOOK_PATH) {
        API_TOKEN_HEADER
    } else {
        TOKEN_HEADER
    };

    let token = headers
        .get(header)
        .ok_or_else(|| AppError::Unauthorized("Missing token".to_string()))?
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid token header encoding".to_string()))?
        .trim();

    if token.is_empty() {
        return Err(AppError::Unauthorized("Missing token".to_string()));
    }
    Ok(token)
}

impl<S> FromRequestParts<S> for Caller
where
    S: HasServices + Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_token(parts.uri.path(), &parts.headers)?;
        let client_ip = extract_ip(&parts.headers);

        state
            .subject_resolver()
            .resolve(token, &client_ip)
            .await
            .map_err(|e| match e {
                AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => e,
                other => {
                    tracing::debug!(error = %other, "Token rejected");
                    AppError::Unauthorized("Invalid token".to_string())
                }
            })
    }
}
