//! Role-group domain models

use super::rbac::RoleFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Role-group row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RoleGroup {
    pub id: i64,
    pub name: String,
    /// `group:` + lower-cased name with spaces replaced by `_`
    pub casbin_name: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_by: Option<i64>,
    pub updated_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RoleGroup {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: String::new(),
            casbin_name: String::new(),
            description: None,
            active: true,
            created_by: None,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Role-group payload for create/update and the display projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleGroupInfo {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub role_filters: Vec<RoleFilter>,
    pub super_admin: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleGroupListingResponse {
    pub role_groups: Vec<RoleGroupInfo>,
    pub total_count: i64,
}
