//! User business logic

use super::assignment::{AssignmentMerger, Desired, Existing, MergePlan, Principal};
use super::audit::AuditSink;
use super::authorization::{AuthorizationService, GrantOp};
use super::display::{display_role_filters, merge_role_filters};
use super::gate::RequestGate;
use super::subject::Caller;
use crate::domain::{
    canonical_subject, is_protected_user_id, is_valid_email, split_emails, AuditEntity, AuditOp,
    BulkDeleteRequest, ListingRequest, RoleFilter, RoleGroup, User, UserInfo, UserListRow,
    UserListingResponse, UserRoleGroup, UserType, ACTION_ADMIN, ACTION_MANAGER,
    ACTION_SUPER_ADMIN, ACTION_TRIGGER, ACTION_VIEW, API_TOKEN_PREFIX, GROUP_PREFIX,
};
use crate::error::{AppError, Result};
use crate::repository::{
    AssignmentRepository, AuditRepository, RoleGroupRepository, RoleRepository,
    TemplateRepository, UserRepository,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// `GET /user/check/roles` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRolesResponse {
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub super_admin: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Effective role labels, lowest first.
const ROLE_LADDER: [(&str, &str); 5] = [
    (ACTION_VIEW, "View"),
    (ACTION_TRIGGER, "Trigger"),
    (ACTION_ADMIN, "Admin"),
    (ACTION_MANAGER, "Manager"),
    (ACTION_SUPER_ADMIN, "SuperAdmin"),
];

/// Rank of the action a role key grants on `app`, if any.
fn role_rank_for_app(role_key: &str, app: &str) -> Option<usize> {
    let body = role_key.strip_prefix("role:")?;
    // helm-app:, jobs: and similar qualifiers sit in front of the action
    let body = body.rsplit_once(':').map_or(body, |(_, rest)| rest);
    let mut fragments = body.split('_');
    let action = fragments.next()?;
    let last = body.rsplit('_').next().unwrap_or_default();
    if action != ACTION_SUPER_ADMIN && !(last.is_empty() || last == app) {
        return None;
    }
    ROLE_LADDER.iter().position(|(a, _)| *a == action)
}

/// Each filter needs a team and action, or an entity. A lone empty filter
/// stands for "no roles".
pub fn validate_role_filters(filters: &[RoleFilter]) -> Result<()> {
    let lone_empty = filters.len() == 1 && {
        let f = &filters[0];
        f.team.is_empty() && f.environment.is_empty() && f.action.is_empty()
    };
    if lone_empty {
        return Ok(());
    }
    for filter in filters {
        let scoped = !filter.team.is_empty() && !filter.action.is_empty();
        if !(scoped || !filter.entity.is_empty() || filter.is_super_admin()) {
            return Err(AppError::Validation(
                "each role filter needs a team and action, or an entity".to_string(),
            ));
        }
    }
    Ok(())
}

/// Shape checks shared by create and update.
pub fn validate_user_request(info: &UserInfo) -> Result<()> {
    if !info.groups.is_empty() {
        return Err(AppError::NotAcceptable(
            "the groups field is no longer supported, use userRoleGroups".to_string(),
        ));
    }
    validate_role_filters(&info.role_filters)?;
    for group in &info.user_role_groups {
        if group.name.contains(',') {
            return Err(AppError::Validation(format!(
                "invalid role group name '{}'",
                group.name
            )));
        }
    }
    Ok(())
}

fn role_group_refs(groups: &[RoleGroup]) -> Vec<UserRoleGroup> {
    groups
        .iter()
        .map(|g| UserRoleGroup {
            id: g.id,
            name: g.name.clone(),
        })
        .collect()
}

fn union_groups(a: &[RoleGroup], b: &[RoleGroup]) -> Vec<RoleGroup> {
    let mut seen = HashSet::new();
    a.iter()
        .chain(b.iter())
        .filter(|g| seen.insert(g.id))
        .cloned()
        .collect()
}

pub struct UserService<
    U: UserRepository,
    G: RoleGroupRepository,
    R: RoleRepository,
    T: TemplateRepository,
    A: AssignmentRepository,
    D: AuditRepository,
> {
    user_repo: Arc<U>,
    group_repo: Arc<G>,
    role_repo: Arc<R>,
    audit_repo: Arc<D>,
    merger: Arc<AssignmentMerger<R, T, A>>,
    authz: Arc<AuthorizationService>,
    audit: Arc<AuditSink<D>>,
    gate: RequestGate,
}

impl<
        U: UserRepository,
        G: RoleGroupRepository,
        R: RoleRepository,
        T: TemplateRepository,
        A: AssignmentRepository,
        D: AuditRepository,
    > UserService<U, G, R, T, A, D>
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_repo: Arc<U>,
        group_repo: Arc<G>,
        role_repo: Arc<R>,
        audit_repo: Arc<D>,
        merger: Arc<AssignmentMerger<R, T, A>>,
        authz: Arc<AuthorizationService>,
        audit: Arc<AuditSink<D>>,
        gate: RequestGate,
    ) -> Self {
        Self {
            user_repo,
            group_repo,
            role_repo,
            audit_repo,
            merger,
            authz,
            audit,
            gate,
        }
    }

    // ==================== Mutations ====================

    /// Create one user per email; existing users are reactivated or merged.
    pub async fn create(&self, actor: &Caller, info: UserInfo) -> Result<Vec<UserInfo>> {
        validate_user_request(&info)?;
        let emails = split_emails(&info.email_id);
        if emails.is_empty() {
            return Err(AppError::BadRequest("emailId is required".to_string()));
        }
        if let Some(bad) = emails.iter().find(|e| !is_valid_email(e)) {
            return Err(AppError::BadRequest(format!("invalid email '{}'", bad)));
        }
        let requested_groups = self.resolve_groups(&info.user_role_groups).await?;

        let mut created = Vec::with_capacity(emails.len());
        for email in emails {
            let email = canonical_subject(&email);
            let user = match self.user_repo.find_by_email(&email).await? {
                Some(user) if user.active => {
                    self.merge_into(actor, &user, &info, &requested_groups).await?
                }
                Some(user) => self.reactivate(actor, user, &info, &requested_groups).await?,
                None => self.insert(actor, &email, &info, &requested_groups).await?,
            };
            created.push(user);
        }
        Ok(created)
    }

    async fn insert(
        &self,
        actor: &Caller,
        email: &str,
        info: &UserInfo,
        groups: &[RoleGroup],
    ) -> Result<UserInfo> {
        let principal = Principal::User {
            id: 0,
            email: email.to_string(),
        };
        let mut plan = self
            .merger
            .plan(
                actor,
                &principal,
                Existing::default(),
                Desired {
                    filters: &info.role_filters,
                    super_admin: info.super_admin,
                    memberships: Some(groups),
                    principal_op: Some(GrantOp::Grant),
                },
            )
            .await?;

        let actor_id = actor.actor_id()?;
        let user_type = email
            .starts_with(API_TOKEN_PREFIX)
            .then(|| UserType::ApiToken.as_str().to_string());
        let user = self.user_repo.create(email, user_type, actor_id).await?;
        let _guard = self.gate.acquire(user.id)?;
        plan.bind_principal(user.id);
        self.merger
            .commit_new_principal(plan, &self.principal(&user))
            .await?;
        self.set_timeout_window(&user, info, actor_id).await?;
        info!(user_id = user.id, email = %email, "User created");
        self.finish(&user, AuditOp::Create, actor_id).await
    }

    async fn reactivate(
        &self,
        actor: &Caller,
        user: User,
        info: &UserInfo,
        groups: &[RoleGroup],
    ) -> Result<UserInfo> {
        let _guard = self.gate.acquire(user.id)?;
        let plan = self
            .plan_replace(
                actor,
                &user,
                &info.role_filters,
                info.super_admin,
                groups,
                Some(GrantOp::Grant),
            )
            .await?;
        let actor_id = actor.actor_id()?;
        let user = self.user_repo.reactivate(user.id, actor_id).await?;
        self.merger
            .commit_new_principal(plan, &self.principal(&user))
            .await?;
        self.set_timeout_window(&user, info, actor_id).await?;
        info!(user_id = user.id, "User reactivated");
        self.finish(&user, AuditOp::Create, actor_id).await
    }

    /// Create on an active user adds to what it already has.
    async fn merge_into(
        &self,
        actor: &Caller,
        user: &User,
        info: &UserInfo,
        groups: &[RoleGroup],
    ) -> Result<UserInfo> {
        let _guard = self.gate.acquire(user.id)?;
        let roles = self.role_repo.find_by_user_id(user.id).await?;
        let memberships = self.user_repo.find_role_groups(user.id).await?;
        let (mut filters, is_super_admin) = merge_role_filters(&roles);
        if info.super_admin && is_super_admin {
            return Err(AppError::BadRequest("User Already A Super Admin".to_string()));
        }
        filters.extend(info.role_filters.iter().cloned());
        let groups = union_groups(&memberships, groups);

        let plan = self
            .merger
            .plan(
                actor,
                &self.principal(user),
                Existing {
                    roles: &roles,
                    memberships: &memberships,
                },
                Desired {
                    filters: &filters,
                    super_admin: info.super_admin || is_super_admin,
                    memberships: Some(&groups),
                    principal_op: Some(GrantOp::Grant),
                },
            )
            .await?;
        let actor_id = actor.actor_id()?;
        self.merger.commit(plan).await?;
        self.set_timeout_window(user, info, actor_id).await?;
        self.finish(user, AuditOp::Update, actor_id).await
    }

    /// Replace the user's filters and memberships with the payload's.
    pub async fn update(&self, actor: &Caller, info: UserInfo) -> Result<UserInfo> {
        validate_user_request(&info)?;
        let user = self.get_user(info.id).await?;
        let _guard = self.gate.acquire(user.id)?;
        let groups = self.resolve_groups(&info.user_role_groups).await?;
        let plan = self
            .plan_replace(actor, &user, &info.role_filters, info.super_admin, &groups, None)
            .await?;
        let actor_id = actor.actor_id()?;
        self.merger.commit(plan).await?;
        self.set_timeout_window(&user, &info, actor_id).await?;
        info!(user_id = user.id, "User updated");
        self.finish(&user, AuditOp::Update, actor_id).await
    }

    async fn plan_replace(
        &self,
        actor: &Caller,
        user: &User,
        filters: &[RoleFilter],
        super_admin: bool,
        groups: &[RoleGroup],
        principal_op: Option<GrantOp>,
    ) -> Result<MergePlan> {
        let roles = self.role_repo.find_by_user_id(user.id).await?;
        let memberships = self.user_repo.find_role_groups(user.id).await?;
        self.merger
            .plan(
                actor,
                &self.principal(user),
                Existing {
                    roles: &roles,
                    memberships: &memberships,
                },
                Desired {
                    filters,
                    super_admin,
                    memberships: Some(groups),
                    principal_op,
                },
            )
            .await
    }

    pub async fn delete(&self, actor: &Caller, id: i64) -> Result<()> {
        if is_protected_user_id(id) {
            return Err(AppError::BadRequest(
                "the system and admin users cannot be deleted".to_string(),
            ));
        }
        let user = self.get_user(id).await?;
        let _guard = self.gate.acquire(user.id)?;
        let plan = self.plan_removal(actor, &user).await?;
        let actor_id = actor.actor_id()?;
        self.merger.commit(plan).await?;
        info!(user_id = id, "User deleted");
        self.audit
            .record(id, AuditEntity::User, AuditOp::Delete, serde_json::json!({}), actor_id)
            .await;
        Ok(())
    }

    /// Delete the listed users, or every user matching the listing filters.
    pub async fn bulk_delete(&self, actor: &Caller, request: BulkDeleteRequest) -> Result<usize> {
        self.authz.require_super_admin(actor).await?;
        let ids = if !request.ids.is_empty() {
            request.ids
        } else if let Some(listing) = &request.listing_request {
            self.user_repo.list_ids(listing).await?
        } else {
            return Err(AppError::BadRequest(
                "either ids or listingRequest is required".to_string(),
            ));
        };
        if ids.iter().any(|id| is_protected_user_id(*id)) {
            return Err(AppError::BadRequest(
                "the system and admin users cannot be deleted".to_string(),
            ));
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let _guards = self.gate.acquire_all(&ids)?;
        let users = self.user_repo.find_by_ids(&ids).await?;
        let actor_id = actor.actor_id()?;
        let mut combined = MergePlan::new(actor_id);
        for user in &users {
            combined.absorb(self.plan_removal(actor, user).await?);
        }
        self.merger.commit(combined).await?;
        for user in &users {
            self.audit
                .record(user.id, AuditEntity::User, AuditOp::Delete, serde_json::json!({}), actor_id)
                .await;
        }
        info!(count = users.len(), "Users bulk deleted");
        Ok(users.len())
    }

    async fn plan_removal(&self, actor: &Caller, user: &User) -> Result<MergePlan> {
        let roles = self.role_repo.find_by_user_id(user.id).await?;
        let memberships = self.user_repo.find_role_groups(user.id).await?;
        self.merger
            .plan_removal(
                actor,
                &self.principal(user),
                Existing {
                    roles: &roles,
                    memberships: &memberships,
                },
            )
            .await
    }

    // ==================== Reads ====================

    /// Display projection of one user, redacted for `caller`.
    pub async fn get_by_id(&self, caller: &Caller, id: i64) -> Result<UserInfo> {
        let user = self.get_user(id).await?;
        let mut info = self.project(&user).await?;
        info.role_filters = self
            .authz
            .visible_filters(caller, std::mem::take(&mut info.role_filters))
            .await?;
        Ok(info)
    }

    pub async fn list(&self, caller: &Caller, request: &ListingRequest) -> Result<UserListingResponse> {
        self.require_manager(caller).await?;
        let (rows, total_count) = self.user_repo.list(request).await?;
        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            let mut info = self.list_info(&row);
            if request.show_all {
                if let Some(user) = self.user_repo.find_by_id(row.id).await? {
                    let projected = self.project(&user).await?;
                    info.role_filters = projected.role_filters;
                    info.user_role_groups = projected.user_role_groups;
                    info.super_admin = projected.super_admin;
                }
            }
            users.push(info);
        }
        Ok(UserListingResponse { users, total_count })
    }

    /// Every active user without pagination.
    pub async fn list_all(&self, caller: &Caller) -> Result<Vec<UserInfo>> {
        let request = ListingRequest {
            size: i64::MAX,
            ..Default::default()
        };
        Ok(self.list(caller, &request).await?.users)
    }

    /// Listing with full role metadata.
    pub async fn detail(&self, caller: &Caller, mut request: ListingRequest) -> Result<UserListingResponse> {
        self.authz.require_super_admin(caller).await?;
        request.show_all = true;
        self.list(caller, &request).await
    }

    /// Roles reachable by the caller, or the best one for an app.
    pub async fn check_roles(&self, caller: &Caller, app_name: Option<&str>) -> Result<CheckRolesResponse> {
        let engine = self.authz.engine();
        let mut roles = BTreeSet::new();
        for subject in &caller.subjects {
            for role in engine.roles_for_subject(subject).await? {
                if !role.starts_with(GROUP_PREFIX) {
                    roles.insert(role);
                }
            }
        }
        let roles: Vec<String> = roles.into_iter().collect();
        self.detect_divergence(&roles).await;

        let super_admin = self.authz.is_super_admin(caller).await?;
        match app_name.filter(|a| !a.is_empty()) {
            Some(app) => {
                let best = if super_admin {
                    Some(ROLE_LADDER.len() - 1)
                } else {
                    roles.iter().filter_map(|r| role_rank_for_app(r, app)).max()
                };
                Ok(CheckRolesResponse {
                    roles,
                    super_admin: None,
                    role: best.map(|rank| ROLE_LADDER[rank].1.to_string()),
                })
            }
            None => Ok(CheckRolesResponse {
                roles,
                super_admin: Some(super_admin),
                role: None,
            }),
        }
    }

    /// A `g`-edge whose role has no row means the engine drifted from the store.
    async fn detect_divergence(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let found = match self.role_repo.find_by_keys(keys).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Divergence check skipped");
                return;
            }
        };
        let known: HashSet<&str> = found.iter().map(|r| r.role.as_str()).collect();
        let missing: Vec<&String> = keys.iter().filter(|k| !known.contains(k.as_str())).collect();
        if missing.is_empty() {
            return;
        }
        let e = AppError::Divergence(format!("{} engine roles have no role row", missing.len()));
        error!(error = %e, missing = ?missing, "Engine diverged from store, reloading");
        if let Err(e) = self.authz.engine().reload().await {
            error!(error = %e, "Engine reload after divergence failed");
        }
    }

    // ==================== Helpers ====================

    async fn get_user(&self, id: i64) -> Result<User> {
        self.user_repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", id)))
    }

    fn principal(&self, user: &User) -> Principal {
        Principal::User {
            id: user.id,
            email: user.email_id.clone(),
        }
    }

    async fn require_manager(&self, caller: &Caller) -> Result<()> {
        if self.authz.is_manager_or_above(caller).await? {
            Ok(())
        } else {
            Err(AppError::Forbidden("manager access required".to_string()))
        }
    }

    async fn resolve_groups(&self, refs: &[UserRoleGroup]) -> Result<Vec<RoleGroup>> {
        let mut groups = Vec::with_capacity(refs.len());
        for r in refs {
            let group = if r.id > 0 {
                self.group_repo.find_by_id(r.id).await?
            } else {
                self.group_repo.find_by_name(&r.name).await?
            };
            match group {
                Some(group) if group.active => groups.push(group),
                _ => {
                    return Err(AppError::NotFound(format!(
                        "Role group '{}' not found",
                        if r.name.is_empty() { r.id.to_string() } else { r.name.clone() }
                    )))
                }
            }
        }
        Ok(union_groups(&groups, &[]))
    }

    async fn set_timeout_window(&self, user: &User, info: &UserInfo, actor_id: i64) -> Result<()> {
        if user.timeout_window_expires_at != info.timeout_window_expression {
            self.user_repo
                .update_timeout_window(user.id, info.timeout_window_expression, actor_id)
                .await?;
        }
        Ok(())
    }

    async fn finish(&self, user: &User, op: AuditOp, actor_id: i64) -> Result<UserInfo> {
        let user = self.get_user(user.id).await?;
        let info = self.project(&user).await?;
        self.audit
            .record(user.id, AuditEntity::User, op, permissions_snapshot(&info), actor_id)
            .await;
        Ok(info)
    }

    /// Unredacted display form, with legacy group edges merged in.
    async fn project(&self, user: &User) -> Result<UserInfo> {
        let roles = self.role_repo.find_by_user_id(user.id).await?;
        let (role_filters, super_admin) = display_role_filters(&roles);
        let memberships = self.user_repo.find_role_groups(user.id).await?;
        let mut user_role_groups = role_group_refs(&memberships);

        let known: HashSet<&str> = memberships.iter().map(|g| g.casbin_name.as_str()).collect();
        let legacy: Vec<String> = self
            .authz
            .engine()
            .roles_for_subject(&canonical_subject(&user.email_id))
            .await?
            .into_iter()
            .filter(|r| r.starts_with(GROUP_PREFIX) && !known.contains(r.as_str()))
            .collect();
        if !legacy.is_empty() {
            let groups = self.group_repo.find_by_casbin_names(&legacy).await?;
            user_role_groups.extend(role_group_refs(&groups));
        }

        let now = Utc::now();
        Ok(UserInfo {
            id: user.id,
            email_id: user.email_id.clone(),
            role_filters,
            groups: Vec::new(),
            user_role_groups,
            super_admin,
            user_status: Some(user.status_at(now)),
            timeout_window_expression: user.timeout_window_expires_at,
            last_login_time: self.audit_repo.find_last_login(user.id).await?,
            user_type: user.user_type.clone(),
        })
    }

    fn list_info(&self, row: &UserListRow) -> UserInfo {
        UserInfo {
            id: row.id,
            email_id: row.email_id.clone(),
            user_status: Some(row.status_at(Utc::now())),
            timeout_window_expression: row.timeout_window_expires_at,
            last_login_time: row.last_login,
            user_type: row.user_type.clone(),
            ..Default::default()
        }
    }
}

fn permissions_snapshot(info: &UserInfo) -> serde_json::Value {
    serde_json::json!({
        "roleFilters": info.role_filters,
        "superAdmin": info.super_admin,
        "userRoleGroups": info.user_role_groups,
    })
}
