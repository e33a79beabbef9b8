//! Business logic layer

pub mod assignment;
pub mod audit;
pub mod authorization;
pub mod display;
pub mod gate;
pub mod lifecycle;
pub mod role_group;
pub mod subject;
pub mod user;

pub use assignment::{AssignmentMerger, MergePlan, Principal};
pub use audit::{spawn_login_audit_worker, AuditSink, LoginAuditQueue};
pub use authorization::AuthorizationService;
pub use gate::RequestGate;
pub use lifecycle::{spawn_gc_scheduler, LifecycleService};
pub use role_group::RoleGroupService;
pub use subject::{Caller, SubjectResolver};
pub use user::UserService;
