//! Desired role filters to store and engine changes
//!
//! A mutation is planned first (expand, diff, gate, materialize roles), then
//! committed: the mapping change set goes to the store in one transaction and
//! only afterwards are the engine deltas applied, followed by a reload barrier.

use super::authorization::{AuthorizationService, GrantOp};
use super::subject::Caller;
use crate::cache::CacheOperations;
use crate::domain::{canonical_subject, Grouping, Policy, Role, RoleFilter, RoleGroup, RoleTuple};
use crate::enforcer::PolicyEngine;
use crate::error::{AppError, Result};
use crate::repository::{AssignmentRepository, ChangeSet, RoleRepository, TemplateRepository};
use crate::template::catalog::TemplateCatalog;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Who the mappings belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User { id: i64, email: String },
    Group { id: i64, casbin_name: String },
}

impl Principal {
    /// Engine subject of the principal's `g` edges.
    pub fn subject(&self) -> String {
        match self {
            Principal::User { email, .. } => canonical_subject(email),
            Principal::Group { casbin_name, .. } => casbin_name.clone(),
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Principal::User { id, .. } | Principal::Group { id, .. } => *id,
        }
    }
}

/// What the principal should end up with.
#[derive(Debug, Clone, Default)]
pub struct Desired<'a> {
    pub filters: &'a [RoleFilter],
    pub super_admin: bool,
    /// `None` leaves memberships untouched; only meaningful for users.
    pub memberships: Option<&'a [RoleGroup]>,
    /// Set when the principal itself is being created or removed.
    pub principal_op: Option<GrantOp>,
}

/// What the principal has now.
#[derive(Debug, Clone, Default)]
pub struct Existing<'a> {
    pub roles: &'a [Role],
    pub memberships: &'a [RoleGroup],
}

/// Store and engine changes of one or more principal mutations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub changes: ChangeSet,
    pub policies_added: Vec<Policy>,
    pub groupings_added: Vec<Grouping>,
    pub groupings_removed: Vec<Grouping>,
    /// Subjects retired as roles: every edge pointing at them goes
    pub retired_roles: Vec<String>,
    /// Subjects whose decision cache entries must go
    pub invalidate_subjects: Vec<String>,
    pub invalidate_all: bool,
}

impl MergePlan {
    pub fn new(actor_id: i64) -> Self {
        Self {
            changes: ChangeSet::new(actor_id),
            ..Default::default()
        }
    }

    /// Point the store changes planned for a not-yet-inserted principal
    /// (id 0) at the id it was given.
    pub fn bind_principal(&mut self, id: i64) {
        let c = &mut self.changes;
        for pairs in [
            &mut c.user_roles_added,
            &mut c.group_roles_added,
            &mut c.memberships_added,
        ] {
            for pair in pairs.iter_mut().filter(|(principal, _)| *principal == 0) {
                pair.0 = id;
            }
        }
    }

    /// Fold another principal's plan into this one.
    pub fn absorb(&mut self, other: MergePlan) {
        let c = &mut self.changes;
        let o = other.changes;
        c.user_roles_added.extend(o.user_roles_added);
        c.user_roles_removed.extend(o.user_roles_removed);
        c.group_roles_added.extend(o.group_roles_added);
        c.group_roles_removed.extend(o.group_roles_removed);
        c.memberships_added.extend(o.memberships_added);
        c.memberships_removed.extend(o.memberships_removed);
        c.users_deactivated.extend(o.users_deactivated);
        c.groups_deactivated.extend(o.groups_deactivated);
        self.policies_added.extend(other.policies_added);
        self.groupings_added.extend(other.groupings_added);
        self.groupings_removed.extend(other.groupings_removed);
        self.retired_roles.extend(other.retired_roles);
        self.invalidate_subjects.extend(other.invalidate_subjects);
        self.invalidate_all |= other.invalidate_all;
    }
}

/// Desired tuples in first-seen order, without repeats. Filters without an
/// action grant nothing.
pub fn desired_tuples(filters: &[RoleFilter], super_admin: bool) -> Vec<RoleTuple> {
    let mut seen = HashSet::new();
    let mut tuples = Vec::new();
    let extra = super_admin.then(RoleTuple::super_admin);
    let expanded = filters
        .iter()
        .filter(|f| !f.action.is_empty())
        .flat_map(|f| f.expand());
    for tuple in expanded.chain(extra) {
        if seen.insert(tuple.clone()) {
            tuples.push(tuple);
        }
    }
    tuples
}

pub struct AssignmentMerger<R: RoleRepository, T: TemplateRepository, A: AssignmentRepository> {
    role_repo: Arc<R>,
    catalog: Arc<TemplateCatalog<T>>,
    assignment_repo: Arc<A>,
    authz: Arc<AuthorizationService>,
    engine: Arc<dyn PolicyEngine>,
    cache: Arc<dyn CacheOperations>,
}

impl<R: RoleRepository, T: TemplateRepository, A: AssignmentRepository> AssignmentMerger<R, T, A> {
    pub fn new(
        role_repo: Arc<R>,
        catalog: Arc<TemplateCatalog<T>>,
        assignment_repo: Arc<A>,
        authz: Arc<AuthorizationService>,
        engine: Arc<dyn PolicyEngine>,
        cache: Arc<dyn CacheOperations>,
    ) -> Self {
        Self {
            role_repo,
            catalog,
            assignment_repo,
            authz,
            engine,
            cache,
        }
    }

    pub fn catalog(&self) -> &Arc<TemplateCatalog<T>> {
        &self.catalog
    }

    /// Role row for a tuple, rendering and inserting it when missing.
    /// Returns the policies of a freshly created role.
    pub async fn ensure_role(&self, tuple: &RoleTuple) -> Result<(Role, Vec<Policy>)> {
        if let Some(role) = self.role_repo.find_by_tuple(tuple).await? {
            return Ok((role, Vec::new()));
        }
        let rendered = self.catalog.render(tuple).await?;
        match self
            .role_repo
            .create(&rendered.role, &rendered.policies)
            .await
        {
            Ok(role) => {
                debug!(role = %role.role, policies = rendered.policies.len(), "Role materialized");
                Ok((role, rendered.policies))
            }
            Err(AppError::Conflict(_)) => {
                // Lost an insert race; the winner's row is the one to use.
                self.role_repo
                    .find_by_tuple(tuple)
                    .await?
                    .map(|role| (role, Vec::new()))
                    .ok_or_else(|| {
                        AppError::Conflict(format!("Role {} is being created", rendered.role.role))
                    })
            }
            Err(e) => Err(e),
        }
    }

    /// Diff, gate and materialize one principal's mutation. Nothing is written
    /// except missing role rows.
    pub async fn plan(
        &self,
        actor: &Caller,
        principal: &Principal,
        existing: Existing<'_>,
        desired: Desired<'_>,
    ) -> Result<MergePlan> {
        let wanted = desired_tuples(desired.filters, desired.super_admin);
        let wanted_set: HashSet<&RoleTuple> = wanted.iter().collect();

        let mut held: HashSet<RoleTuple> = HashSet::new();
        let mut kept: Vec<&Role> = Vec::new();
        let mut to_remove: Vec<&Role> = Vec::new();
        for role in existing.roles {
            let tuple = role.tuple();
            if wanted_set.contains(&tuple) {
                kept.push(role);
            } else {
                to_remove.push(role);
            }
            held.insert(tuple);
        }
        let to_add: Vec<&RoleTuple> = wanted.iter().filter(|t| !held.contains(*t)).collect();

        // Memberships
        let (groups_added, groups_kept, groups_removed) = match desired.memberships {
            Some(groups) => {
                let current: HashSet<i64> = existing.memberships.iter().map(|g| g.id).collect();
                let wanted_ids: HashSet<i64> = groups.iter().map(|g| g.id).collect();
                (
                    groups
                        .iter()
                        .filter(|g| !current.contains(&g.id))
                        .collect::<Vec<_>>(),
                    groups
                        .iter()
                        .filter(|g| current.contains(&g.id))
                        .collect::<Vec<_>>(),
                    existing
                        .memberships
                        .iter()
                        .filter(|g| !wanted_ids.contains(&g.id))
                        .collect::<Vec<_>>(),
                )
            }
            None => (Vec::new(), existing.memberships.iter().collect(), Vec::new()),
        };

        // Gate
        let mut gated: Vec<(RoleFilter, GrantOp)> = Vec::new();
        gated.extend(to_add.iter().map(|t| (RoleFilter::from((*t).clone()), GrantOp::Grant)));
        gated.extend(to_remove.iter().map(|r| (RoleFilter::from(*r), GrantOp::Revoke)));
        for (groups, op) in [(&groups_added, GrantOp::Grant), (&groups_removed, GrantOp::Revoke)] {
            for group in groups.iter() {
                for role in self.role_repo.find_by_group_id(group.id).await? {
                    gated.push((RoleFilter::from(&role), op));
                }
            }
        }
        let target_is_super_admin = existing.roles.iter().any(Role::is_super_admin);
        self.authz
            .check_grant(
                actor,
                &gated,
                desired.filters.len(),
                target_is_super_admin,
                desired.principal_op,
            )
            .await?;

        // Materialize
        let subject = principal.subject();
        let mut plan = MergePlan::new(actor.actor_id()?);
        let mut live_keys: HashSet<String> = HashSet::new();
        let mut added_roles = Vec::with_capacity(to_add.len());
        for tuple in to_add {
            let (role, policies) = self.ensure_role(tuple).await?;
            plan.policies_added.extend(policies);
            added_roles.push(role);
        }

        for role in added_roles.iter().chain(kept.iter().copied()) {
            live_keys.insert(role.role.clone());
            plan.groupings_added
                .push(Grouping::new(subject.clone(), role.role.clone()));
        }
        for role in &to_remove {
            if !live_keys.contains(&role.role) {
                plan.groupings_removed
                    .push(Grouping::new(subject.clone(), role.role.clone()));
            }
        }

        let principal_id = principal.id();
        let added_ids = added_roles.iter().map(|r| (principal_id, r.id));
        let removed_ids = to_remove.iter().map(|r| (principal_id, r.id));
        match principal {
            Principal::User { .. } => {
                plan.changes.user_roles_added.extend(added_ids);
                plan.changes.user_roles_removed.extend(removed_ids);
                plan.changes
                    .memberships_added
                    .extend(groups_added.iter().map(|g| (principal_id, g.id)));
                plan.changes
                    .memberships_removed
                    .extend(groups_removed.iter().map(|g| (principal_id, g.id)));
                for group in groups_added.iter().chain(groups_kept.iter()) {
                    plan.groupings_added
                        .push(Grouping::new(subject.clone(), group.casbin_name.clone()));
                }
                for group in &groups_removed {
                    plan.groupings_removed
                        .push(Grouping::new(subject.clone(), group.casbin_name.clone()));
                }
                plan.invalidate_subjects.push(subject);
            }
            Principal::Group { .. } => {
                plan.changes.group_roles_added.extend(added_ids);
                plan.changes.group_roles_removed.extend(removed_ids);
                plan.invalidate_all = true;
            }
        }
        Ok(plan)
    }

    /// Plan that strips every mapping and deactivates the principal.
    pub async fn plan_removal(
        &self,
        actor: &Caller,
        principal: &Principal,
        existing: Existing<'_>,
    ) -> Result<MergePlan> {
        let mut plan = self
            .plan(
                actor,
                principal,
                existing,
                Desired {
                    filters: &[],
                    super_admin: false,
                    memberships: Some(&[]),
                    principal_op: Some(GrantOp::Revoke),
                },
            )
            .await?;
        match principal {
            Principal::User { id, .. } => plan.changes.users_deactivated.push(*id),
            Principal::Group { id, casbin_name } => {
                plan.changes.groups_deactivated.push(*id);
                plan.retired_roles.push(casbin_name.clone());
            }
        }
        Ok(plan)
    }

    /// Commit the store change set, then bring the engine and cache along.
    pub async fn commit(&self, plan: MergePlan) -> Result<()> {
        if !plan.changes.is_empty() {
            self.assignment_repo.apply(&plan.changes).await?;
        }
        self.apply_to_engine(&plan).await;
        self.invalidate(&plan).await;
        info!(
            actor_id = plan.changes.actor_id,
            added = plan.groupings_added.len(),
            removed = plan.groupings_removed.len(),
            "Assignment committed"
        );
        Ok(())
    }

    /// Commit for a principal whose row was written just before. A failed
    /// commit deactivates the row again so it is not left active without roles.
    pub async fn commit_new_principal(&self, plan: MergePlan, principal: &Principal) -> Result<()> {
        let actor_id = plan.changes.actor_id;
        let Err(e) = self.commit(plan).await else {
            return Ok(());
        };
        let mut undo = ChangeSet::new(actor_id);
        match principal {
            Principal::User { id, .. } => undo.users_deactivated.push(*id),
            Principal::Group { id, .. } => undo.groups_deactivated.push(*id),
        }
        match self.assignment_repo.apply(&undo).await {
            Ok(()) => warn!(
                principal_id = principal.id(),
                error = %e,
                "Commit failed, principal deactivated"
            ),
            Err(undo_err) => error!(
                principal_id = principal.id(),
                error = %undo_err,
                "Commit failed and principal could not be deactivated"
            ),
        }
        Err(e)
    }

    async fn apply_to_engine(&self, plan: &MergePlan) {
        if !plan.policies_added.is_empty() {
            match self.engine.add_policies(&plan.policies_added).await {
                Ok(unapplied) if !unapplied.is_empty() => {
                    debug!(count = unapplied.len(), "Policies already present in engine")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Engine add_policies failed"),
            }
        }
        if !plan.groupings_added.is_empty() {
            if let Err(e) = self.engine.add_groupings(&plan.groupings_added).await {
                warn!(error = %e, "Engine add_groupings failed");
            }
        }

        if !plan.groupings_removed.is_empty() {
            if let Err(e) = self.engine.remove_groupings(&plan.groupings_removed).await {
                warn!(error = %e, "Engine remove_groupings failed");
            }
        }
        if !plan.retired_roles.is_empty() {
            if let Err(e) = self.engine.remove_policies_by_roles(&plan.retired_roles).await {
                warn!(error = %e, "Engine removal of retired subjects failed");
            }
        }

        // Barrier: the store is the source of truth from here on.
        if let Err(e) = self.engine.reload().await {
            error!(error = %e, "Engine reload after commit failed");
        }
    }

    async fn invalidate(&self, plan: &MergePlan) {
        let result = if plan.invalidate_all {
            self.cache.invalidate_all().await
        } else {
            let mut result = Ok(());
            for subject in &plan.invalidate_subjects {
                if let Err(e) = self.cache.invalidate(subject).await {
                    result = Err(e);
                }
            }
            result
        };
        if let Err(e) = result {
            warn!(error = %e, "Decision cache invalidation failed");
        }
    }
}
