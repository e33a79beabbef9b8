//! TraceLayer span maker that keeps tokens and user search input out of logs.

use axum::http::{Request, Uri};
use tower_http::trace::MakeSpan;
use tracing::Span;

/// Query parameters carrying credentials.
const SENSITIVE_PARAMS: &[&str] = &["token", "api-token", "api_token", "apitoken"];

/// Query parameters that may carry user emails.
const PERSONAL_PARAMS: &[&str] = &["searchkey", "name"];

#[derive(Clone, Debug)]
pub struct SanitizedMakeSpan;

impl<B> MakeSpan<B> for SanitizedMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %sanitize_uri(request.uri()),
            version = ?request.version(),
            api_token = request.headers().contains_key(super::auth::API_TOKEN_HEADER),
        )
    }
}

fn sanitize_uri(uri: &Uri) -> String {
    let Some(query) = uri.query() else {
        return uri.path().to_string();
    };

    let pairs: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) => {
                let key_lower = key.to_ascii_lowercase();
                if SENSITIVE_PARAMS.contains(&key_lower.as_str()) {
                    format!("{key}=[REDACTED]")
                } else if PERSONAL_PARAMS.contains(&key_lower.as_str()) {
                    format!("{key}=[FILTERED]")
                } else {
                    pair.to_string()
                }
            }
            None => pair.to_string(),
        })
        .collect();

    format!("{}?{}", uri.path(), pairs.join("&"))
}
