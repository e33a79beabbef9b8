//! Middleware that injects `X-Real-IP` header from the socket address
//! when no proxy headers (`X-Forwarded-For`, `X-Real-IP`) are present.
//!
//! Login audit reads the client address through `extract_ip`, so direct
//! connections without a reverse proxy still record an address.

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use std::net::SocketAddr;

pub async fn inject_client_ip(mut request: Request, next: Next) -> Response {
    let headers = request.headers();
    let has_forwarded = headers.contains_key("x-forwarded-for");
    let has_real_ip = headers.contains_key("x-real-ip");

    if !has_forwarded && !has_real_ip {
        if let Some(addr) = request
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
        {
            let ip = addr.0.ip().to_string();
            if let Ok(value) = ip.parse() {
                request.headers_mut().insert("x-real-ip", value);
            }
        }
    }

    next.run(request).await
}

/// First hop of `X-Forwarded-For`, falling back to `X-Real-IP`.
pub fn extract_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        })
        .unwrap_or_default()
}
