//! User repository

use super::in_clause;
use crate::domain::{
    ListingRequest, RoleGroup, User, UserListRow, UserStatus, API_TOKEN_PREFIX, SYSTEM_USER_ID,
};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::MySqlPool;

const USER_COLUMNS: &str = "u.id, u.email_id, u.active, u.user_type, u.timeout_window_expires_at, \
    u.created_by, u.updated_by, u.created_at, u.updated_at";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>>;
    /// Case-insensitive lookup regardless of status
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<User>>;
    async fn create(&self, email: &str, user_type: Option<String>, actor_id: i64) -> Result<User>;
    async fn reactivate(&self, id: i64, actor_id: i64) -> Result<User>;
    async fn update_timeout_window(
        &self,
        id: i64,
        expires_at: Option<DateTime<Utc>>,
        actor_id: i64,
    ) -> Result<()>;
    /// Page of users plus the total match count
    async fn list(&self, request: &ListingRequest) -> Result<(Vec<UserListRow>, i64)>;
    /// Every id matching the listing filters, ignoring pagination
    async fn list_ids(&self, request: &ListingRequest) -> Result<Vec<i64>>;
    /// Active role-groups the user is a member of
    async fn find_role_groups(&self, user_id: i64) -> Result<Vec<RoleGroup>>;
}

pub struct UserRepositoryImpl {
    pool: MySqlPool,
}

impl UserRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn status_predicate(status: UserStatus) -> &'static str {
    match status {
        UserStatus::Active => "(u.active = TRUE AND u.timeout_window_expires_at IS NULL)",
        UserStatus::TemporaryAccess => {
            "(u.active = TRUE AND u.timeout_window_expires_at > NOW())"
        }
        UserStatus::Inactive => {
            "(u.active = FALSE OR u.timeout_window_expires_at <= NOW())"
        }
    }
}

/// WHERE clause and its string binds for a listing request.
pub(crate) fn user_listing_filter(request: &ListingRequest) -> (String, Vec<String>) {
    let mut clauses = vec![
        format!("u.id <> {}", SYSTEM_USER_ID),
        "u.email_id NOT LIKE ?".to_string(),
    ];
    let mut binds = vec![format!("{}%", API_TOKEN_PREFIX)];

    let statuses = request.statuses();
    if statuses.is_empty() {
        clauses.push("u.active = TRUE".to_string());
    } else {
        let any: Vec<&str> = statuses.into_iter().map(status_predicate).collect();
        clauses.push(format!("({})", any.join(" OR ")));
    }

    let search = request.search_key.trim();
    if !search.is_empty() {
        clauses.push("u.email_id LIKE ?".to_string());
        binds.push(format!("%{}%", search.to_lowercase()));
    }
    (clauses.join(" AND "), binds)
}

#[async_trait]
impl UserRepository for UserRepositoryImpl {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users u WHERE u.id = ?", USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!(
            "SELECT {} FROM users u WHERE LOWER(u.email_id) = LOWER(?)",
            USER_COLUMNS
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM users u WHERE u.id IN ({})",
            USER_COLUMNS,
            in_clause(ids.len())
        );
        let mut query = sqlx::query_as::<_, User>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn create(&self, email: &str, user_type: Option<String>, actor_id: i64) -> Result<User> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (email_id, active, user_type, created_by, updated_by, created_at, updated_at)
            VALUES (?, TRUE, ?, ?, ?, NOW(), NOW())
            "#,
        )
        .bind(email)
        .bind(&user_type)
        .bind(actor_id)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        self.find_by_id(result.last_insert_id() as i64)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to create user")))
    }

    async fn reactivate(&self, id: i64, actor_id: i64) -> Result<User> {
        let result = sqlx::query(
            "UPDATE users SET active = TRUE, timeout_window_expires_at = NULL, updated_by = ?, \
             updated_at = NOW() WHERE id = ?",
        )
        .bind(actor_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User {} not found", id)));
        }
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", id)))
    }

    async fn update_timeout_window(
        &self,
        id: i64,
        expires_at: Option<DateTime<Utc>>,
        actor_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET timeout_window_expires_at = ?, updated_by = ?, updated_at = NOW() \
             WHERE id = ?",
        )
        .bind(expires_at)
        .bind(actor_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, request: &ListingRequest) -> Result<(Vec<UserListRow>, i64)> {
        let (filter, binds) = user_listing_filter(request);

        let count_sql = format!("SELECT COUNT(*) FROM users u WHERE {}", filter);
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let order = match request.user_sort_column() {
            "last_login" => "ua.last_login",
            _ => "u.email_id",
        };
        let mut sql = format!(
            "SELECT u.id, u.email_id, u.active, u.user_type, u.timeout_window_expires_at, \
             ua.last_login FROM users u \
             LEFT JOIN (SELECT user_id, MAX(created_on) AS last_login FROM user_audit GROUP BY user_id) ua \
             ON ua.user_id = u.id \
             WHERE {} ORDER BY {} {}",
            filter,
            order,
            request.sort_order.as_sql()
        );
        if !request.show_all {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query = sqlx::query_as::<_, UserListRow>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        if !request.show_all {
            query = query
                .bind(request.effective_size())
                .bind(request.effective_offset());
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok((rows, total))
    }

    async fn list_ids(&self, request: &ListingRequest) -> Result<Vec<i64>> {
        let (filter, binds) = user_listing_filter(request);
        let sql = format!("SELECT u.id FROM users u WHERE {}", filter);
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn find_role_groups(&self, user_id: i64) -> Result<Vec<RoleGroup>> {
        let groups = sqlx::query_as::<_, RoleGroup>(
            r#"
            SELECT g.id, g.name, g.casbin_name, g.description, g.active, g.created_by,
                   g.updated_by, g.created_at, g.updated_at
            FROM role_groups g
            INNER JOIN user_role_groups urg ON urg.role_group_id = g.id
            WHERE urg.user_id = ? AND g.active = TRUE
            ORDER BY g.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }
}
