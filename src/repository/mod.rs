//! Data access layer (Repository pattern)

pub mod api_token;
pub mod assignment;
pub mod audit;
pub mod policy;
pub mod role;
pub mod role_group;
pub mod template;
pub mod user;

pub use api_token::ApiTokenRepository;
pub use assignment::{AssignmentRepository, ChangeSet, DedupReport};
pub use audit::AuditRepository;
pub use policy::PolicyRepository;
pub use role::RoleRepository;
pub use role_group::RoleGroupRepository;
pub use template::{DefaultTemplateRow, TemplateKind, TemplateRepository};
pub use user::UserRepository;

/// `?, ?, ?` placeholder list for an `IN (...)` clause.
pub(crate) fn in_clause(n: usize) -> String {
    vec!["?"; n].join(", ")
}
