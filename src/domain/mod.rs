//! Domain models for RBAC Core

pub mod audit;
pub mod rbac;
pub mod role_group;
pub mod user;

pub use audit::*;
pub use rbac::*;
pub use role_group::*;
pub use user::*;
