//! HTTP middleware for RBAC Core
//!
//! - `Caller` extractor resolving the `token` / `api-token` header
//! - client address injection for login audit
//! - sanitized request tracing

pub mod auth;
pub mod client_ip;
pub mod trace;

pub use client_ip::{extract_ip, inject_client_ip};
pub use trace::SanitizedMakeSpan;
