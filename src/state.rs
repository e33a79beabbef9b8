//! Application state traits for dependency injection
//!
//! Handlers are generic over `HasServices`, so the same router runs against
//! the production `AppState` and the in-memory test state.

use crate::config::Config;
use crate::repository::{
    ApiTokenRepository, AssignmentRepository, AuditRepository, PolicyRepository,
    RoleGroupRepository, RoleRepository, TemplateRepository, UserRepository,
};
use crate::service::{
    AuthorizationService, LifecycleService, RoleGroupService, SubjectResolver, UserService,
};
use metrics_exporter_prometheus::PrometheusHandle;

pub trait HasServices: Clone + Send + Sync + 'static {
    type UserRepo: UserRepository + 'static;
    type RoleGroupRepo: RoleGroupRepository + 'static;
    type RoleRepo: RoleRepository + 'static;
    type TemplateRepo: TemplateRepository + 'static;
    type AssignmentRepo: AssignmentRepository + 'static;
    type AuditRepo: AuditRepository + 'static;
    type PolicyRepo: PolicyRepository + 'static;
    type ApiTokenRepo: ApiTokenRepository + 'static;

    fn config(&self) -> &Config;

    fn subject_resolver(&self) -> &SubjectResolver<Self::UserRepo, Self::ApiTokenRepo>;

    fn authorization(&self) -> &AuthorizationService;

    fn user_service(
        &self,
    ) -> &UserService<
        Self::UserRepo,
        Self::RoleGroupRepo,
        Self::RoleRepo,
        Self::TemplateRepo,
        Self::AssignmentRepo,
        Self::AuditRepo,
    >;

    fn role_group_service(
        &self,
    ) -> &RoleGroupService<
        Self::RoleGroupRepo,
        Self::RoleRepo,
        Self::TemplateRepo,
        Self::AssignmentRepo,
        Self::AuditRepo,
    >;

    fn lifecycle_service(
        &self,
    ) -> &LifecycleService<Self::AssignmentRepo, Self::RoleRepo, Self::PolicyRepo, Self::TemplateRepo>;

    /// Prometheus handle when metrics are enabled
    fn metrics_handle(&self) -> Option<&PrometheusHandle>;

    /// Check if the system is ready (database and cache are healthy)
    /// Returns (db_ok, cache_ok) tuple
    fn check_ready(&self) -> impl std::future::Future<Output = (bool, bool)> + Send;
}
