//! Store garbage collection, engine convergence and admin maintenance

use super::authorization::AuthorizationService;
use super::subject::Caller;
use crate::config::CleanupConfig;
use crate::domain::{Policy, ACTION_TRIGGER, ACTION_VIEW};
use crate::enforcer::EngineDump;
use crate::error::{AppError, Result};
use crate::repository::{AssignmentRepository, PolicyRepository, RoleRepository, TemplateRepository};
use crate::template::catalog::TemplateCatalog;
use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outcome of one GC pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub duplicate_keys: usize,
    pub duplicate_rows_deleted: usize,
    pub inactive_mappings_deleted: u64,
    pub orphan_roles_deleted: usize,
    pub engine_tuples_removed: usize,
}

/// `/user/role/cache` payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDump {
    pub engine: EngineDump,
    pub decisions: serde_json::Value,
}

pub struct LifecycleService<
    A: AssignmentRepository,
    R: RoleRepository,
    P: PolicyRepository,
    T: TemplateRepository,
> {
    assignment_repo: Arc<A>,
    role_repo: Arc<R>,
    policy_repo: Arc<P>,
    catalog: Arc<TemplateCatalog<T>>,
    authz: Arc<AuthorizationService>,
}

impl<A, R, P, T> LifecycleService<A, R, P, T>
where
    A: AssignmentRepository,
    R: RoleRepository,
    P: PolicyRepository,
    T: TemplateRepository,
{
    pub fn new(
        assignment_repo: Arc<A>,
        role_repo: Arc<R>,
        policy_repo: Arc<P>,
        catalog: Arc<TemplateCatalog<T>>,
        authz: Arc<AuthorizationService>,
    ) -> Self {
        Self {
            assignment_repo,
            role_repo,
            policy_repo,
            catalog,
            authz,
        }
    }

    // ==================== GC ====================

    /// Dedup, drop dead mappings and orphan roles, then converge the engine.
    /// The engine is reloaded even when a phase fails.
    pub async fn run_gc(&self) -> Result<GcReport> {
        let mut report = GcReport::default();
        let phases = self.run_phases(&mut report).await;
        let engine = self.authz.engine();

        if let Err(e) = engine.reload().await {
            error!(error = %e, "Engine reload after GC failed");
        }
        if let Err(e) = self.authz.cache().invalidate_all().await {
            warn!(error = %e, "Decision cache invalidation after GC failed");
        }

        match phases {
            Ok(()) => {
                counter!("rbac_gc_runs_total", "result" => "success").increment(1);
                counter!("rbac_gc_roles_deleted_total").increment(
                    (report.duplicate_rows_deleted + report.orphan_roles_deleted) as u64,
                );
                info!(
                    duplicate_keys = report.duplicate_keys,
                    duplicate_rows = report.duplicate_rows_deleted,
                    inactive_mappings = report.inactive_mappings_deleted,
                    orphan_roles = report.orphan_roles_deleted,
                    "RBAC GC finished"
                );
                Ok(report)
            }
            Err(e) => {
                counter!("rbac_gc_runs_total", "result" => "error").increment(1);
                error!(error = %e, "RBAC GC failed");
                Err(e)
            }
        }
    }

    async fn run_phases(&self, report: &mut GcReport) -> Result<()> {
        let dedup = self.assignment_repo.dedup_roles().await?;
        report.duplicate_keys = dedup.duplicate_keys.len();
        report.duplicate_rows_deleted = dedup.deleted_role_ids.len();

        report.inactive_mappings_deleted = self.assignment_repo.delete_inactive_mappings().await?;

        let gone = self.assignment_repo.delete_unreferenced_roles().await?;
        report.orphan_roles_deleted = gone.len();
        if !gone.is_empty() {
            let removed = self.policy_repo.remove_policies_by_roles(&gone).await?;
            report.engine_tuples_removed = self
                .authz
                .engine()
                .remove_policies_by_roles(&gone)
                .await?;
            if removed > 0 && report.engine_tuples_removed == 0 {
                warn!(
                    store_removed = removed,
                    "Engine removed nothing for orphan roles; relying on reload"
                );
            }
        }
        Ok(())
    }

    // ==================== Maintenance ====================

    /// Re-render the default trigger and view policies of every team role.
    pub async fn sync_orchestrator(&self, caller: &Caller) -> Result<usize> {
        if !caller.is_admin() {
            return Err(AppError::Forbidden(
                "only the admin user may sync orchestrator policies".to_string(),
            ));
        }
        let roles = self.role_repo.list_with_team().await?;
        let mut policies: Vec<Policy> = Vec::new();
        for role in roles
            .iter()
            .filter(|r| r.action == ACTION_TRIGGER || r.action == ACTION_VIEW)
        {
            match self.catalog.render(&role.tuple()).await {
                Ok(rendered) => policies.extend(rendered.policies),
                Err(e) => warn!(role = %role.role, error = %e, "Skipping role without template"),
            }
        }
        if policies.is_empty() {
            return Ok(0);
        }
        self.policy_repo.add_policies(&policies).await?;
        let unapplied = self.authz.engine().add_policies(&policies).await?;
        let added = policies.len() - unapplied.len();
        info!(rendered = policies.len(), added, "Orchestrator policies synced");
        Ok(added)
    }

    pub async fn refresh_templates(&self, caller: &Caller) -> Result<usize> {
        self.authz.require_super_admin(caller).await?;
        self.catalog.refresh().await
    }

    pub async fn cache_dump(&self, caller: &Caller) -> Result<CacheDump> {
        self.authz.require_super_admin(caller).await?;
        Ok(CacheDump {
            engine: self.authz.engine().dump().await?,
            decisions: self.authz.cache().dump().await?,
        })
    }

    pub async fn invalidate_caches(&self, caller: &Caller) -> Result<()> {
        self.authz.require_super_admin(caller).await?;
        self.authz.engine().invalidate_all().await?;
        self.authz.cache().invalidate_all().await?;
        info!(actor = %caller.email, "Policy caches invalidated");
        Ok(())
    }
}

// ==================== Scheduler ====================

/// Parse a five-field cron expression (minute precision).
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&format!("0 {}", expr.trim()))
        .map_err(|e| AppError::BadRequest(format!("invalid cron expression '{}': {}", expr, e)))
}

/// Run GC on the configured schedule until the task is aborted.
pub fn spawn_gc_scheduler<A, R, P, T>(
    service: Arc<LifecycleService<A, R, P, T>>,
    config: &CleanupConfig,
) -> Result<Option<JoinHandle<()>>>
where
    A: AssignmentRepository + 'static,
    R: RoleRepository + 'static,
    P: PolicyRepository + 'static,
    T: TemplateRepository + 'static,
{
    if !config.enabled {
        return Ok(None);
    }
    let schedule = parse_schedule(&config.cron)?;
    info!(cron = %config.cron, "RBAC GC scheduler started");
    Ok(Some(tokio::spawn(async move {
        for next in schedule.upcoming(Utc) {
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            // Failures are counted and logged inside.
            let _ = service.run_gc().await;
        }
    })))
}
