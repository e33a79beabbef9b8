//! RBAC Core - authorization backend
//!
//! Decides whether a caller may perform an action on a resource instance and
//! owns the role assignments behind those decisions: users, role-groups,
//! default role templates, the in-memory policy engine and its cleanup.

pub mod api;
pub mod cache;
pub mod config;
pub mod domain;
pub mod enforcer;
pub mod error;
pub mod jwt;
pub mod middleware;
pub mod migration;
pub mod repository;
pub mod server;
pub mod service;
pub mod state;
pub mod telemetry;
pub mod template;

// Re-export commonly used types
pub use config::Config;
pub use error::{AppError, Result};
