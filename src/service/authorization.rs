//! Authorization facade: request checks and the grant gate

use super::subject::Caller;
use crate::cache::CacheOperations;
use crate::domain::{actions, resources, RoleFilter, ACTION_MANAGER};
use crate::enforcer::PolicyEngine;
use crate::error::{AppError, Result};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Group segment used for core kinds that have no API group.
pub const EMPTY_GROUP: &str = "k8sempty";
const NONE_MARKER: &str = "NONE";

/// Whether a mapping is being added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrantOp {
    Grant,
    Revoke,
}

impl GrantOp {
    fn user_action(&self) -> &'static str {
        match self {
            GrantOp::Grant => actions::CREATE,
            GrantOp::Revoke => actions::DELETE,
        }
    }
}

fn or_star(value: &str) -> String {
    let value = if value == NONE_MARKER { "" } else { value };
    if value.is_empty() {
        "*".to_string()
    } else {
        value.to_string()
    }
}

fn split_or_star(value: &str) -> Vec<String> {
    value.split(',').map(|part| or_star(part.trim())).collect()
}

pub struct AuthorizationService {
    engine: Arc<dyn PolicyEngine>,
    cache: Arc<dyn CacheOperations>,
}

impl AuthorizationService {
    pub fn new(engine: Arc<dyn PolicyEngine>, cache: Arc<dyn CacheOperations>) -> Self {
        Self { engine, cache }
    }

    pub fn engine(&self) -> &Arc<dyn PolicyEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<dyn CacheOperations> {
        &self.cache
    }

    // ==================== Request checks ====================

    pub async fn enforce(&self, caller: &Caller, res: &str, act: &str, obj: &str) -> Result<bool> {
        let decisions = self
            .enforce_batch(caller, res, act, &[obj.to_string()])
            .await?;
        Ok(decisions.get(obj).copied().unwrap_or(false))
    }

    /// Decide every object once; cached decisions are reused when the cache is on.
    pub async fn enforce_batch(
        &self,
        caller: &Caller,
        res: &str,
        act: &str,
        objs: &[String],
    ) -> Result<HashMap<String, bool>> {
        let mut decisions = HashMap::with_capacity(objs.len());
        if objs.is_empty() {
            return Ok(decisions);
        }

        let mut misses: Vec<String> = objs.to_vec();
        if self.cache.is_enabled() {
            match self
                .cache
                .get_decisions(&caller.email, &caller.subjects, res, act, objs)
                .await
            {
                Ok(cached) => {
                    misses.clear();
                    for (obj, hit) in objs.iter().zip(cached) {
                        match hit {
                            Some(allowed) => {
                                decisions.insert(obj.clone(), allowed);
                            }
                            None => misses.push(obj.clone()),
                        }
                    }
                    let hits = objs.len() - misses.len();
                    if hits > 0 {
                        counter!("rbac_decision_cache_hits_total").increment(hits as u64);
                    }
                }
                Err(e) => warn!(error = %e, "Decision cache read failed"),
            }
        }

        if misses.is_empty() {
            return Ok(decisions);
        }

        let fresh = self
            .engine
            .enforce_batch(&caller.subjects, res, act, &misses)
            .await?;
        let fresh: Vec<(String, bool)> = misses.into_iter().zip(fresh).collect();

        if self.cache.is_enabled() {
            if let Err(e) = self
                .cache
                .set_decisions(&caller.email, &caller.subjects, res, act, &fresh)
                .await
            {
                warn!(error = %e, "Decision cache write failed");
            }
        }
        decisions.extend(fresh);
        Ok(decisions)
    }

    pub async fn is_super_admin(&self, caller: &Caller) -> Result<bool> {
        self.enforce(caller, resources::GLOBAL, actions::GET, "*")
            .await
    }

    /// Super-admin, or manager of at least one team.
    pub async fn is_manager_or_above(&self, caller: &Caller) -> Result<bool> {
        if self.is_super_admin(caller).await? {
            return Ok(true);
        }
        let prefix = format!("role:{}_", ACTION_MANAGER);
        for subject in &caller.subjects {
            let roles = self.engine.roles_for_subject(subject).await?;
            if roles.iter().any(|role| role.starts_with(&prefix)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn require_super_admin(&self, caller: &Caller) -> Result<()> {
        if self.is_super_admin(caller).await? {
            Ok(())
        } else {
            Err(AppError::Forbidden("super-admin access required".to_string()))
        }
    }

    pub async fn enforce_for_node(
        &self,
        caller: &Caller,
        cluster: &str,
        node: &str,
        act: &str,
    ) -> Result<bool> {
        let res = format!("{}/*/{}", cluster.to_lowercase(), resources::USER);
        let obj = format!("{}/node/{}", EMPTY_GROUP, or_star(node));
        self.enforce(caller, &res, act, &obj).await
    }

    /// True only when every namespace and resource in the comma lists passes.
    pub async fn enforce_for_cluster_entity(
        &self,
        caller: &Caller,
        cluster: &str,
        namespace: &str,
        group: &str,
        kind: &str,
        resource: &str,
        act: &str,
    ) -> Result<bool> {
        let cluster = or_star(cluster).to_lowercase();
        let group = or_star(group);
        let kind = or_star(kind);
        for namespace in split_or_star(namespace) {
            let res = format!(
                "{}/{}/{}",
                cluster,
                namespace.to_lowercase(),
                resources::USER
            );
            let objs: Vec<String> = split_or_star(resource)
                .into_iter()
                .map(|resource| format!("{}/{}/{}", group, kind, resource))
                .collect();
            let decisions = self.enforce_batch(caller, &res, act, &objs).await?;
            if objs.iter().any(|obj| !decisions.get(obj).copied().unwrap_or(false)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ==================== Grant gate ====================

    async fn permitted(
        &self,
        caller: &Caller,
        filter: &RoleFilter,
        op: GrantOp,
        request_filter_count: usize,
    ) -> Result<bool> {
        if filter.is_super_admin() || filter.is_helm() || filter.is_jobs() {
            return Ok(false);
        }
        if !filter.team.is_empty() {
            return self
                .enforce(caller, resources::USER, op.user_action(), &filter.team.to_lowercase())
                .await;
        }
        if filter.is_cluster() {
            return self.cluster_filter_visible(caller, filter, actions::UPDATE).await;
        }
        if filter.is_chart_group() {
            // Alone in the request it needs super-admin; alongside others it rides along.
            return Ok(request_filter_count > 1);
        }
        Ok(false)
    }

    async fn cluster_filter_visible(
        &self,
        caller: &Caller,
        filter: &RoleFilter,
        act: &str,
    ) -> Result<bool> {
        self.enforce_for_cluster_entity(
            caller,
            &filter.cluster,
            &filter.namespace,
            &filter.group,
            &filter.kind,
            &filter.resource,
            act,
        )
        .await
    }

    /// Creating or removing a principal that carries no roles needs the
    /// capability on every team.
    pub async fn check_principal_op(&self, caller: &Caller, op: GrantOp) -> Result<()> {
        if self.is_super_admin(caller).await?
            || self
                .enforce(caller, resources::USER, op.user_action(), "*")
                .await?
        {
            return Ok(());
        }
        debug!(actor = %caller.email, op = ?op, "Principal operation refused");
        Err(AppError::Forbidden(match op {
            GrantOp::Grant => "unauthorized to create this principal".to_string(),
            GrantOp::Revoke => "unauthorized to delete this principal".to_string(),
        }))
    }

    /// All-or-nothing check that `caller` may apply every change.
    /// `principal_op` is set when the principal itself is being created or
    /// removed.
    pub async fn check_grant(
        &self,
        caller: &Caller,
        changes: &[(RoleFilter, GrantOp)],
        request_filter_count: usize,
        target_is_super_admin: bool,
        principal_op: Option<GrantOp>,
    ) -> Result<()> {
        if changes.is_empty() && !target_is_super_admin {
            return match principal_op {
                Some(op) => self.check_principal_op(caller, op).await,
                None => Ok(()),
            };
        }
        if self.is_super_admin(caller).await? {
            return Ok(());
        }
        if target_is_super_admin {
            return Err(AppError::Forbidden(
                "only a super-admin may modify a super-admin".to_string(),
            ));
        }

        let mut decided: HashMap<(&RoleFilter, GrantOp), bool> = HashMap::new();
        for (filter, op) in changes {
            let permitted = match decided.get(&(filter, *op)) {
                Some(permitted) => *permitted,
                None => {
                    let permitted = self
                        .permitted(caller, filter, *op, request_filter_count)
                        .await?;
                    decided.insert((filter, *op), permitted);
                    permitted
                }
            };
            if !permitted {
                debug!(
                    actor = %caller.email,
                    entity = %filter.entity,
                    team = %filter.team,
                    action = %filter.action,
                    "Grant refused"
                );
                return Err(AppError::Forbidden(
                    "unauthorized to grant or revoke one of the requested roles".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Filters `caller` is allowed to see on another principal.
    pub async fn visible_filters(
        &self,
        caller: &Caller,
        filters: Vec<RoleFilter>,
    ) -> Result<Vec<RoleFilter>> {
        if self.is_super_admin(caller).await? {
            return Ok(filters);
        }
        let mut visible = Vec::with_capacity(filters.len());
        for filter in filters {
            let allowed = if filter.is_super_admin() || filter.is_helm() || filter.is_jobs() {
                false
            } else if filter.is_cluster() {
                self.cluster_filter_visible(caller, &filter, actions::GET).await?
            } else if filter.is_chart_group() {
                true
            } else if !filter.team.is_empty() {
                self.enforce(caller, resources::USER, actions::GET, &filter.team.to_lowercase())
                    .await?
            } else {
                false
            };
            if allowed {
                visible.push(filter);
            }
        }
        Ok(visible)
    }
}
