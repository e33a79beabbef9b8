//! RBAC domain models: roles, role filters and engine policies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ==================== Vocabulary ====================

pub const ENTITY_APPS: &str = "apps";
pub const ENTITY_CLUSTER: &str = "cluster";
pub const ENTITY_CHART_GROUP: &str = "chart-group";
pub const ENTITY_JOBS: &str = "jobs";

pub const ACCESS_TYPE_DEVTRON_APP: &str = "devtron-app";
pub const ACCESS_TYPE_HELM_APP: &str = "helm-app";

pub const ACTION_SUPER_ADMIN: &str = "super-admin";
pub const ACTION_MANAGER: &str = "manager";
pub const ACTION_ADMIN: &str = "admin";
pub const ACTION_TRIGGER: &str = "trigger";
pub const ACTION_VIEW: &str = "view";

pub const SUPER_ADMIN_ROLE: &str = "role:super-admin___";

/// Subject used by the bootstrap admin account.
pub const ADMIN_SUBJECT: &str = "admin";
pub const SYSTEM_SUBJECT: &str = "system";
pub const API_TOKEN_PREFIX: &str = "API-TOKEN:";
pub const GROUP_PREFIX: &str = "group:";

/// Resource / action pairs the core enforces on its own behalf.
pub mod resources {
    pub const GLOBAL: &str = "global-resource";
    pub const USER: &str = "user";
    pub const APPLICATIONS: &str = "applications";
    pub const ENVIRONMENT: &str = "environment";
    pub const TEAM: &str = "team";
}

pub mod actions {
    pub const GET: &str = "get";
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const ALL: &str = "*";
}

/// Canonical engine subject for a role-group name.
pub fn group_casbin_name(name: &str) -> String {
    format!(
        "{}{}",
        GROUP_PREFIX,
        name.trim().to_lowercase().replace(' ', "_")
    )
}

/// Whether a subject must be kept verbatim instead of lower-cased.
pub fn is_case_preserved_subject(subject: &str) -> bool {
    subject == ADMIN_SUBJECT || subject.starts_with(API_TOKEN_PREFIX)
}

/// Canonical form used for every subject comparison and cache key.
pub fn canonical_subject(subject: &str) -> String {
    if is_case_preserved_subject(subject) {
        subject.to_string()
    } else {
        subject.to_lowercase()
    }
}

// ==================== Role ====================

/// Role row. Identity is the scope tuple; `role` is the engine grouping key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: i64,
    pub role: String,
    pub entity: Option<String>,
    pub access_type: Option<String>,
    pub team: Option<String>,
    pub entity_name: Option<String>,
    pub environment: Option<String>,
    pub action: String,
    pub cluster: Option<String>,
    pub namespace: Option<String>,
    #[sqlx(rename = "group_name")]
    pub group: Option<String>,
    pub kind: Option<String>,
    pub resource: Option<String>,
    pub workflow: Option<String>,
    pub subaction: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Role {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            role: String::new(),
            entity: None,
            access_type: None,
            team: None,
            entity_name: None,
            environment: None,
            action: String::new(),
            cluster: None,
            namespace: None,
            group: None,
            kind: None,
            resource: None,
            workflow: None,
            subaction: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Role {
    pub fn tuple(&self) -> RoleTuple {
        fn s(v: &Option<String>) -> String {
            v.clone().unwrap_or_default()
        }
        RoleTuple {
            entity: s(&self.entity),
            access_type: s(&self.access_type),
            team: s(&self.team),
            entity_name: s(&self.entity_name),
            environment: s(&self.environment),
            action: self.action.clone(),
            cluster: s(&self.cluster),
            namespace: s(&self.namespace),
            group: s(&self.group),
            kind: s(&self.kind),
            resource: s(&self.resource),
            workflow: s(&self.workflow),
            subaction: s(&self.subaction),
        }
    }

    pub fn is_super_admin(&self) -> bool {
        self.action == ACTION_SUPER_ADMIN
    }
}

/// One concrete scope tuple. Empty strings stand for SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleTuple {
    pub entity: String,
    pub access_type: String,
    pub team: String,
    pub entity_name: String,
    pub environment: String,
    pub action: String,
    pub cluster: String,
    pub namespace: String,
    pub group: String,
    pub kind: String,
    pub resource: String,
    pub workflow: String,
    pub subaction: String,
}

impl RoleTuple {
    pub fn super_admin() -> Self {
        Self {
            action: ACTION_SUPER_ADMIN.to_string(),
            ..Default::default()
        }
    }

    pub fn is_super_admin(&self) -> bool {
        self.action == ACTION_SUPER_ADMIN
    }

    /// Entity used to look up default templates.
    pub fn template_entity(&self) -> &str {
        if self.is_super_admin() {
            ""
        } else if self.entity.is_empty() {
            ENTITY_APPS
        } else {
            &self.entity
        }
    }

    /// Access type used to look up default templates.
    pub fn template_access_type(&self) -> &str {
        if self.is_super_admin() {
            ""
        } else if self.template_entity() == ENTITY_APPS && self.access_type.is_empty() {
            ACCESS_TYPE_DEVTRON_APP
        } else {
            &self.access_type
        }
    }

    /// Role type used to look up default templates. Chart-group roles are
    /// keyed by how much of the entity they cover.
    pub fn template_role_type(&self) -> String {
        if self.is_super_admin() {
            return "superAdmin".to_string();
        }
        if self.entity == ENTITY_CHART_GROUP {
            return match (self.action.as_str(), self.entity_name.is_empty()) {
                (ACTION_VIEW, true) => "entityView".to_string(),
                (_, true) => "entityAll".to_string(),
                (_, false) => "entitySpecific".to_string(),
            };
        }
        self.action.clone()
    }

    /// Storage form: devtron apps keep `entity` and `accessType` empty.
    pub fn normalized(mut self) -> Self {
        if self.entity == ENTITY_APPS {
            self.entity.clear();
        }
        if self.entity.is_empty() && self.access_type == ACCESS_TYPE_DEVTRON_APP {
            self.access_type.clear();
        }
        self
    }

    /// Stable identity string for the unique index on the roles table.
    pub fn canonical_key(&self) -> String {
        let parts: [&str; 13] = [
            &self.entity,
            &self.access_type,
            &self.team,
            &self.entity_name,
            &self.environment,
            &self.action,
            &self.cluster,
            &self.namespace,
            &self.group,
            &self.kind,
            &self.resource,
            &self.workflow,
            &self.subaction,
        ];
        parts.join("\u{1f}")
    }
}

// ==================== Role Filter ====================

/// Transport form of a set of desired roles. Comma-separated fields expand
/// into their Cartesian product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleFilter {
    pub entity: String,
    pub team: String,
    pub entity_name: String,
    pub environment: String,
    pub action: String,
    pub access_type: String,
    pub cluster: String,
    pub namespace: String,
    pub group: String,
    pub kind: String,
    pub resource: String,
    pub workflow: String,
    pub subaction: String,
}

fn split_csv(value: &str) -> Vec<String> {
    value.split(',').map(|part| part.trim().to_string()).collect()
}

impl RoleFilter {
    pub fn is_super_admin(&self) -> bool {
        self.action == ACTION_SUPER_ADMIN
    }

    pub fn is_cluster(&self) -> bool {
        self.entity == ENTITY_CLUSTER
    }

    pub fn is_chart_group(&self) -> bool {
        self.entity == ENTITY_CHART_GROUP
    }

    pub fn is_jobs(&self) -> bool {
        self.entity == ENTITY_JOBS
    }

    pub fn is_helm(&self) -> bool {
        self.access_type == ACCESS_TYPE_HELM_APP
    }

    /// Expand into concrete tuples in storage form.
    pub fn expand(&self) -> Vec<RoleTuple> {
        self.expand_raw()
            .into_iter()
            .map(RoleTuple::normalized)
            .collect()
    }

    fn expand_raw(&self) -> Vec<RoleTuple> {
        if self.is_super_admin() {
            return vec![RoleTuple::super_admin()];
        }
        if self.is_chart_group() {
            return split_csv(&self.entity_name)
                .into_iter()
                .map(|entity_name| RoleTuple {
                    entity: self.entity.clone(),
                    entity_name,
                    action: self.action.clone(),
                    ..Default::default()
                })
                .collect();
        }
        if self.is_cluster() {
            let mut tuples = Vec::new();
            for namespace in split_csv(&self.namespace) {
                for group in split_csv(&self.group) {
                    for kind in split_csv(&self.kind) {
                        for resource in split_csv(&self.resource) {
                            tuples.push(RoleTuple {
                                entity: self.entity.clone(),
                                access_type: self.access_type.clone(),
                                action: self.action.clone(),
                                cluster: self.cluster.clone(),
                                namespace: namespace.clone(),
                                group: group.clone(),
                                kind: kind.clone(),
                                resource,
                                ..Default::default()
                            });
                        }
                    }
                }
            }
            return tuples;
        }

        let workflows = if self.is_jobs() {
            split_csv(&self.workflow)
        } else {
            vec![String::new()]
        };
        let mut tuples = Vec::new();
        for environment in split_csv(&self.environment) {
            for entity_name in split_csv(&self.entity_name) {
                for workflow in &workflows {
                    for subaction in split_csv(&self.subaction) {
                        tuples.push(RoleTuple {
                            entity: self.entity.clone(),
                            access_type: self.access_type.clone(),
                            team: self.team.clone(),
                            entity_name: entity_name.clone(),
                            environment: environment.clone(),
                            action: self.action.clone(),
                            workflow: workflow.clone(),
                            subaction,
                            ..Default::default()
                        });
                    }
                }
            }
        }
        tuples
    }
}

impl From<&Role> for RoleFilter {
    fn from(role: &Role) -> Self {
        Self::from(role.tuple())
    }
}

impl From<RoleTuple> for RoleFilter {
    fn from(tuple: RoleTuple) -> Self {
        Self {
            entity: tuple.entity,
            team: tuple.team,
            entity_name: tuple.entity_name,
            environment: tuple.environment,
            action: tuple.action,
            access_type: tuple.access_type,
            cluster: tuple.cluster,
            namespace: tuple.namespace,
            group: tuple.group,
            kind: tuple.kind,
            resource: tuple.resource,
            workflow: tuple.workflow,
            subaction: tuple.subaction,
        }
    }
}

// ==================== Policies ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    #[default]
    P,
    G,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }
}

impl std::str::FromStr for Effect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" | "" => Ok(Effect::Allow),
            "deny" => Ok(Effect::Deny),
            other => Err(format!("unknown effect: {}", other)),
        }
    }
}

/// A `p` tuple evaluated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "type", default)]
    pub ptype: PolicyType,
    pub sub: String,
    pub res: String,
    pub act: String,
    pub obj: String,
    #[serde(default)]
    pub eft: Effect,
}

impl Policy {
    pub fn allow(
        sub: impl Into<String>,
        res: impl Into<String>,
        act: impl Into<String>,
        obj: impl Into<String>,
    ) -> Self {
        Self {
            ptype: PolicyType::P,
            sub: sub.into(),
            res: res.into(),
            act: act.into(),
            obj: obj.into(),
            eft: Effect::Allow,
        }
    }

    pub fn deny(
        sub: impl Into<String>,
        res: impl Into<String>,
        act: impl Into<String>,
        obj: impl Into<String>,
    ) -> Self {
        Self {
            eft: Effect::Deny,
            ..Self::allow(sub, res, act, obj)
        }
    }
}

/// Stored `p` tuple.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PolicyRow {
    pub id: i64,
    pub sub: String,
    pub res: String,
    pub act: String,
    pub obj: String,
    pub eft: String,
}

impl PolicyRow {
    pub fn into_policy(self) -> Policy {
        Policy {
            ptype: PolicyType::P,
            sub: self.sub,
            res: self.res,
            act: self.act,
            obj: self.obj,
            eft: self.eft.parse().unwrap_or_default(),
        }
    }
}

/// A `g` edge: `sub` inherits everything granted to `role`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, FromRow)]
pub struct Grouping {
    pub sub: String,
    pub role: String,
}

impl Grouping {
    pub fn new(sub: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            role: role.into(),
        }
    }
}

/// `{ "data": [ ... ] }` wrapper produced by policy templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyList {
    #[serde(default)]
    pub data: Vec<Policy>,
}

/// Role descriptor produced by role templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleDescriptor {
    pub role: String,
    pub casbin_subjects: Vec<String>,
    pub entity: String,
    pub team: String,
    pub entity_name: String,
    pub environment: String,
    pub action: String,
    pub access_type: String,
    pub cluster: String,
    pub namespace: String,
    pub group: String,
    pub kind: String,
    pub resource: String,
    pub workflow: String,
    pub subaction: String,
}

/// Role row ready for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRole {
    pub role: String,
    pub tuple: RoleTuple,
}
