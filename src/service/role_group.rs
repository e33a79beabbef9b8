//! Role-group business logic

use super::assignment::{AssignmentMerger, Desired, Existing, MergePlan, Principal};
use super::audit::AuditSink;
use super::authorization::{AuthorizationService, GrantOp};
use super::display::display_role_filters;
use super::gate::RequestGate;
use super::subject::Caller;
use super::user::validate_role_filters;
use crate::domain::{
    group_casbin_name, AuditEntity, AuditOp, BulkDeleteRequest, ListingRequest, RoleGroup,
    RoleGroupInfo, RoleGroupListingResponse,
};
use crate::error::{AppError, Result};
use crate::repository::{
    AssignmentRepository, AuditRepository, RoleGroupRepository, RoleRepository,
    TemplateRepository,
};
use std::sync::Arc;
use tracing::info;

fn validate_group_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("role group name is required".to_string()));
    }
    if name.contains(',') {
        return Err(AppError::Validation(format!(
            "invalid role group name '{}'",
            name
        )));
    }
    Ok(())
}

pub struct RoleGroupService<
    G: RoleGroupRepository,
    R: RoleRepository,
    T: TemplateRepository,
    A: AssignmentRepository,
    D: AuditRepository,
> {
    group_repo: Arc<G>,
    role_repo: Arc<R>,
    merger: Arc<AssignmentMerger<R, T, A>>,
    authz: Arc<AuthorizationService>,
    audit: Arc<AuditSink<D>>,
    /// Separate from the user gate; ids of the two tables overlap.
    gate: RequestGate,
}

impl<
        G: RoleGroupRepository,
        R: RoleRepository,
        T: TemplateRepository,
        A: AssignmentRepository,
        D: AuditRepository,
    > RoleGroupService<G, R, T, A, D>
{
    pub fn new(
        group_repo: Arc<G>,
        role_repo: Arc<R>,
        merger: Arc<AssignmentMerger<R, T, A>>,
        authz: Arc<AuthorizationService>,
        audit: Arc<AuditSink<D>>,
        gate: RequestGate,
    ) -> Self {
        Self {
            group_repo,
            role_repo,
            merger,
            authz,
            audit,
            gate,
        }
    }

    pub async fn create(&self, actor: &Caller, info: RoleGroupInfo) -> Result<RoleGroupInfo> {
        validate_group_name(&info.name)?;
        validate_role_filters(&info.role_filters)?;
        let name = info.name.trim();
        let casbin_name = group_casbin_name(name);
        let actor_id = actor.actor_id()?;

        let existing = self.group_repo.find_by_name(name).await?;
        if matches!(&existing, Some(group) if group.active) {
            return Err(AppError::Conflict(format!(
                "Role group '{}' already exists",
                name
            )));
        }

        // Gate before anything is written.
        let pending = Principal::Group {
            id: existing.as_ref().map_or(0, |g| g.id),
            casbin_name: casbin_name.clone(),
        };
        let mut plan = self
            .merger
            .plan(
                actor,
                &pending,
                Existing::default(),
                Desired {
                    filters: &info.role_filters,
                    super_admin: info.super_admin,
                    memberships: None,
                    principal_op: Some(GrantOp::Grant),
                },
            )
            .await?;

        let group = match existing {
            Some(inactive) => {
                let _guard = self.gate.acquire(inactive.id)?;
                let group = self
                    .group_repo
                    .reactivate(inactive.id, &info.description, actor_id)
                    .await?;
                self.merger
                    .commit_new_principal(plan, &principal(&group))
                    .await?;
                info!(group_id = group.id, name = %name, "Role group reactivated");
                group
            }
            None => {
                let group = self
                    .group_repo
                    .create(name, &casbin_name, &info.description, actor_id)
                    .await?;
                let _guard = self.gate.acquire(group.id)?;
                plan.bind_principal(group.id);
                self.merger
                    .commit_new_principal(plan, &principal(&group))
                    .await?;
                info!(group_id = group.id, name = %name, "Role group created");
                group
            }
        };
        self.finish(&group, AuditOp::Create, actor_id).await
    }

    /// Replace the group's filters; the name is immutable.
    pub async fn update(&self, actor: &Caller, info: RoleGroupInfo) -> Result<RoleGroupInfo> {
        validate_role_filters(&info.role_filters)?;
        let group = self.get_active(info.id).await?;
        let _guard = self.gate.acquire(group.id)?;
        let roles = self.role_repo.find_by_group_id(group.id).await?;
        let plan = self
            .merger
            .plan(
                actor,
                &principal(&group),
                Existing {
                    roles: &roles,
                    memberships: &[],
                },
                Desired {
                    filters: &info.role_filters,
                    super_admin: info.super_admin,
                    memberships: None,
                    principal_op: None,
                },
            )
            .await?;
        let actor_id = actor.actor_id()?;
        if group.description.as_deref().unwrap_or_default() != info.description {
            self.group_repo
                .update_description(group.id, &info.description, actor_id)
                .await?;
        }
        self.merger.commit(plan).await?;
        info!(group_id = group.id, "Role group updated");
        self.finish(&group, AuditOp::Update, actor_id).await
    }

    pub async fn delete(&self, actor: &Caller, id: i64) -> Result<()> {
        let group = self.get_active(id).await?;
        let _guard = self.gate.acquire(group.id)?;
        let plan = self.plan_removal(actor, &group).await?;
        let actor_id = actor.actor_id()?;
        self.merger.commit(plan).await?;
        info!(group_id = id, "Role group deleted");
        self.audit
            .record(id, AuditEntity::RoleGroup, AuditOp::Delete, serde_json::json!({}), actor_id)
            .await;
        Ok(())
    }

    pub async fn bulk_delete(&self, actor: &Caller, request: BulkDeleteRequest) -> Result<usize> {
        self.authz.require_super_admin(actor).await?;
        let ids = if !request.ids.is_empty() {
            request.ids
        } else if let Some(listing) = &request.listing_request {
            self.group_repo.list_ids(listing).await?
        } else {
            return Err(AppError::BadRequest(
                "either ids or listingRequest is required".to_string(),
            ));
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let _guards = self.gate.acquire_all(&ids)?;
        let groups: Vec<RoleGroup> = self
            .group_repo
            .find_by_ids(&ids)
            .await?
            .into_iter()
            .filter(|g| g.active)
            .collect();
        let actor_id = actor.actor_id()?;
        let mut combined = MergePlan::new(actor_id);
        for group in &groups {
            combined.absorb(self.plan_removal(actor, group).await?);
        }
        self.merger.commit(combined).await?;
        for group in &groups {
            self.audit
                .record(
                    group.id,
                    AuditEntity::RoleGroup,
                    AuditOp::Delete,
                    serde_json::json!({}),
                    actor_id,
                )
                .await;
        }
        info!(count = groups.len(), "Role groups bulk deleted");
        Ok(groups.len())
    }

    async fn plan_removal(&self, actor: &Caller, group: &RoleGroup) -> Result<MergePlan> {
        let roles = self.role_repo.find_by_group_id(group.id).await?;
        self.merger
            .plan_removal(
                actor,
                &principal(group),
                Existing {
                    roles: &roles,
                    memberships: &[],
                },
            )
            .await
    }

    // ==================== Reads ====================

    pub async fn get_by_id(&self, caller: &Caller, id: i64) -> Result<RoleGroupInfo> {
        let group = self.get_active(id).await?;
        let mut info = self.project(&group).await?;
        info.role_filters = self
            .authz
            .visible_filters(caller, std::mem::take(&mut info.role_filters))
            .await?;
        Ok(info)
    }

    /// Exact-name lookup among active groups.
    pub async fn search(&self, name: &str) -> Result<RoleGroupInfo> {
        match self.group_repo.find_by_name(name.trim()).await? {
            Some(group) if group.active => self.project(&group).await,
            _ => Err(AppError::NotFound(format!("Role group '{}' not found", name))),
        }
    }

    pub async fn list(
        &self,
        caller: &Caller,
        request: &ListingRequest,
    ) -> Result<RoleGroupListingResponse> {
        if !self.authz.is_manager_or_above(caller).await? {
            return Err(AppError::Forbidden("manager access required".to_string()));
        }
        let (groups, total_count) = self.group_repo.list(request).await?;
        let mut role_groups = Vec::with_capacity(groups.len());
        for group in &groups {
            if request.show_all {
                role_groups.push(self.project(group).await?);
            } else {
                role_groups.push(summary(group));
            }
        }
        Ok(RoleGroupListingResponse {
            role_groups,
            total_count,
        })
    }

    /// Every active group with its filters.
    pub async fn list_all(&self, caller: &Caller) -> Result<Vec<RoleGroupInfo>> {
        let request = ListingRequest {
            show_all: true,
            ..Default::default()
        };
        Ok(self.list(caller, &request).await?.role_groups)
    }

    // ==================== Helpers ====================

    async fn get_active(&self, id: i64) -> Result<RoleGroup> {
        match self.group_repo.find_by_id(id).await? {
            Some(group) if group.active => Ok(group),
            _ => Err(AppError::NotFound(format!("Role group {} not found", id))),
        }
    }

    async fn project(&self, group: &RoleGroup) -> Result<RoleGroupInfo> {
        let roles = self.role_repo.find_by_group_id(group.id).await?;
        let (role_filters, super_admin) = display_role_filters(&roles);
        Ok(RoleGroupInfo {
            role_filters,
            super_admin,
            ..summary(group)
        })
    }

    async fn finish(&self, group: &RoleGroup, op: AuditOp, actor_id: i64) -> Result<RoleGroupInfo> {
        let group = self.get_active(group.id).await?;
        let info = self.project(&group).await?;
        self.audit
            .record(
                group.id,
                AuditEntity::RoleGroup,
                op,
                serde_json::json!({
                    "roleFilters": info.role_filters,
                    "superAdmin": info.super_admin,
                }),
                actor_id,
            )
            .await;
        Ok(info)
    }
}

fn principal(group: &RoleGroup) -> Principal {
    Principal::Group {
        id: group.id,
        casbin_name: group.casbin_name.clone(),
    }
}

fn summary(group: &RoleGroup) -> RoleGroupInfo {
    RoleGroupInfo {
        id: group.id,
        name: group.name.clone(),
        description: group.description.clone().unwrap_or_default(),
        ..Default::default()
    }
}
