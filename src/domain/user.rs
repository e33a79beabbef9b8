//! User domain models

use super::rbac::{RoleFilter, API_TOKEN_PREFIX};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9._%+\-']+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").unwrap();
}

/// Fixed ids of the bootstrap accounts; never deletable.
pub const SYSTEM_USER_ID: i64 = 1;
pub const ADMIN_USER_ID: i64 = 2;

pub fn is_protected_user_id(id: i64) -> bool {
    id == SYSTEM_USER_ID || id == ADMIN_USER_ID
}

/// Validate a principal email. The bootstrap accounts and API tokens are exempt.
pub fn is_valid_email(email: &str) -> bool {
    email == super::rbac::ADMIN_SUBJECT
        || email == super::rbac::SYSTEM_SUBJECT
        || email.starts_with(API_TOKEN_PREFIX)
        || EMAIL_REGEX.is_match(email)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum UserType {
    #[default]
    Normal,
    ApiToken,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Normal => "normal",
            UserType::ApiToken => "apiToken",
        }
    }
}

/// User row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email_id: String,
    pub active: bool,
    pub user_type: Option<String>,
    pub timeout_window_expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<i64>,
    pub updated_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for User {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            email_id: String::new(),
            active: true,
            user_type: None,
            timeout_window_expires_at: None,
            created_by: None,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Status from the active flag and the timeout window.
pub fn user_status(
    active: bool,
    timeout_window_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> UserStatus {
    if !active {
        return UserStatus::Inactive;
    }
    match timeout_window_expires_at {
        None => UserStatus::Active,
        Some(expires) if expires > now => UserStatus::TemporaryAccess,
        Some(_) => UserStatus::Inactive,
    }
}

impl User {
    pub fn status_at(&self, now: DateTime<Utc>) -> UserStatus {
        user_status(self.active, self.timeout_window_expires_at, now)
    }

    pub fn is_api_token(&self) -> bool {
        self.email_id.starts_with(API_TOKEN_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserStatus {
    Active,
    Inactive,
    TemporaryAccess,
}

impl std::str::FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "active" => Ok(UserStatus::Active),
            "inactive" => Ok(UserStatus::Inactive),
            "temporaryAccess" => Ok(UserStatus::TemporaryAccess),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Group membership as carried on user payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRoleGroup {
    pub id: i64,
    pub name: String,
}

/// User payload for create/update and the display projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserInfo {
    pub id: i64,
    pub email_id: String,
    pub role_filters: Vec<RoleFilter>,
    /// Removed in favour of `user_role_groups`; rejected on writes.
    pub groups: Vec<String>,
    pub user_role_groups: Vec<UserRoleGroup>,
    pub super_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_status: Option<UserStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_window_expression: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
}

/// Emails carried by a create payload (`emailId` may be a comma-separated list).
pub fn split_emails(email_id: &str) -> Vec<String> {
    email_id
        .split(',')
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
        .collect()
}

// ==================== Listing ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Listing query shared by users and role-groups.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingRequest {
    /// Comma-separated list of `active | inactive | temporaryAccess`
    pub status: String,
    #[validate(length(max = 255))]
    pub search_key: String,
    pub sort_by: String,
    pub sort_order: SortOrder,
    #[validate(range(min = 0))]
    pub offset: i64,
    #[validate(range(min = 0))]
    pub size: i64,
    pub show_all: bool,
}

impl Default for ListingRequest {
    fn default() -> Self {
        Self {
            status: String::new(),
            search_key: String::new(),
            sort_by: String::new(),
            sort_order: SortOrder::Asc,
            offset: 0,
            size: DEFAULT_LISTING_SIZE,
            show_all: false,
        }
    }
}

pub const DEFAULT_LISTING_SIZE: i64 = 20;

impl ListingRequest {
    pub fn statuses(&self) -> Vec<UserStatus> {
        self.status
            .split(',')
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Sort column for user listings.
    pub fn user_sort_column(&self) -> &'static str {
        match self.sort_by.as_str() {
            "last_login" => "last_login",
            _ => "email_id",
        }
    }

    pub fn effective_size(&self) -> i64 {
        if self.size <= 0 {
            DEFAULT_LISTING_SIZE
        } else {
            self.size
        }
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.max(0)
    }
}

/// User listing row with the latest login.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct UserListRow {
    pub id: i64,
    pub email_id: String,
    pub active: bool,
    pub user_type: Option<String>,
    pub timeout_window_expires_at: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserListRow {
    pub fn status_at(&self, now: DateTime<Utc>) -> UserStatus {
        user_status(self.active, self.timeout_window_expires_at, now)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListingResponse {
    pub users: Vec<UserInfo>,
    pub total_count: i64,
}

/// `DELETE /user/bulk` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkDeleteRequest {
    pub ids: Vec<i64>,
    pub listing_request: Option<ListingRequest>,
}
