//! Audit and API-token models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEntity {
    User,
    RoleGroup,
}

impl AuditEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEntity::User => "user",
            AuditEntity::RoleGroup => "role-group",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOp {
    Create,
    Update,
    Delete,
}

impl AuditOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOp::Create => "create",
            AuditOp::Update => "update",
            AuditOp::Delete => "delete",
        }
    }
}

/// Immutable record of one principal mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub entity_id: i64,
    pub entity_type: AuditEntity,
    pub op: AuditOp,
    /// Projected permissions after the mutation
    pub permissions: serde_json::Value,
    pub actor_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Login record; persisted asynchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAuditEvent {
    pub user_id: i64,
    pub client_ip: String,
    pub at: DateTime<Utc>,
}

/// Long-lived API token row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ApiToken {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub version: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl ApiToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }
}
