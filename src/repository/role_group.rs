//! Role-group repository

use super::in_clause;
use crate::domain::{ListingRequest, RoleGroup};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use sqlx::MySqlPool;

const GROUP_COLUMNS: &str = "g.id, g.name, g.casbin_name, g.description, g.active, g.created_by, \
    g.updated_by, g.created_at, g.updated_at";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoleGroupRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<RoleGroup>>;
    /// Exact name lookup regardless of status
    async fn find_by_name(&self, name: &str) -> Result<Option<RoleGroup>>;
    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<RoleGroup>>;
    async fn find_by_casbin_names(&self, names: &[String]) -> Result<Vec<RoleGroup>>;
    async fn create(
        &self,
        name: &str,
        casbin_name: &str,
        description: &str,
        actor_id: i64,
    ) -> Result<RoleGroup>;
    async fn reactivate(&self, id: i64, description: &str, actor_id: i64) -> Result<RoleGroup>;
    async fn update_description(&self, id: i64, description: &str, actor_id: i64) -> Result<()>;
    async fn list(&self, request: &ListingRequest) -> Result<(Vec<RoleGroup>, i64)>;
    async fn list_ids(&self, request: &ListingRequest) -> Result<Vec<i64>>;
}

pub struct RoleGroupRepositoryImpl {
    pool: MySqlPool,
}

impl RoleGroupRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn group_listing_filter(request: &ListingRequest) -> (String, Vec<String>) {
    let mut clauses = vec!["g.active = TRUE".to_string()];
    let mut binds = Vec::new();
    let search = request.search_key.trim();
    if !search.is_empty() {
        clauses.push("LOWER(g.name) LIKE ?".to_string());
        binds.push(format!("%{}%", search.to_lowercase()));
    }
    (clauses.join(" AND "), binds)
}

#[async_trait]
impl RoleGroupRepository for RoleGroupRepositoryImpl {
    async fn find_by_id(&self, id: i64) -> Result<Option<RoleGroup>> {
        let sql = format!("SELECT {} FROM role_groups g WHERE g.id = ?", GROUP_COLUMNS);
        let group = sqlx::query_as::<_, RoleGroup>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<RoleGroup>> {
        let sql = format!("SELECT {} FROM role_groups g WHERE g.name = ?", GROUP_COLUMNS);
        let group = sqlx::query_as::<_, RoleGroup>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<RoleGroup>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM role_groups g WHERE g.id IN ({})",
            GROUP_COLUMNS,
            in_clause(ids.len())
        );
        let mut query = sqlx::query_as::<_, RoleGroup>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn find_by_casbin_names(&self, names: &[String]) -> Result<Vec<RoleGroup>> {
        if names.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM role_groups g WHERE g.active = TRUE AND g.casbin_name IN ({})",
            GROUP_COLUMNS,
            in_clause(names.len())
        );
        let mut query = sqlx::query_as::<_, RoleGroup>(&sql);
        for name in names {
            query = query.bind(name);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn create(
        &self,
        name: &str,
        casbin_name: &str,
        description: &str,
        actor_id: i64,
    ) -> Result<RoleGroup> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_groups (name, casbin_name, description, active, created_by, updated_by, created_at, updated_at)
            VALUES (?, ?, ?, TRUE, ?, ?, NOW(), NOW())
            "#,
        )
        .bind(name)
        .bind(casbin_name)
        .bind(description)
        .bind(actor_id)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        self.find_by_id(result.last_insert_id() as i64)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to create role group")))
    }

    async fn reactivate(&self, id: i64, description: &str, actor_id: i64) -> Result<RoleGroup> {
        sqlx::query(
            "UPDATE role_groups SET active = TRUE, description = ?, updated_by = ?, updated_at = NOW() \
             WHERE id = ?",
        )
        .bind(description)
        .bind(actor_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Role group {} not found", id)))
    }

    async fn update_description(&self, id: i64, description: &str, actor_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE role_groups SET description = ?, updated_by = ?, updated_at = NOW() WHERE id = ?",
        )
        .bind(description)
        .bind(actor_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Role group {} not found", id)));
        }
        Ok(())
    }

    async fn list(&self, request: &ListingRequest) -> Result<(Vec<RoleGroup>, i64)> {
        let (filter, binds) = group_listing_filter(request);

        let count_sql = format!("SELECT COUNT(*) FROM role_groups g WHERE {}", filter);
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let mut sql = format!(
            "SELECT {} FROM role_groups g WHERE {} ORDER BY g.name {}",
            GROUP_COLUMNS,
            filter,
            request.sort_order.as_sql()
        );
        if !request.show_all {
            sql.push_str(" LIMIT ? OFFSET ?");
        }
        let mut query = sqlx::query_as::<_, RoleGroup>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        if !request.show_all {
            query = query
                .bind(request.effective_size())
                .bind(request.effective_offset());
        }
        Ok((query.fetch_all(&self.pool).await?, total))
    }

    async fn list_ids(&self, request: &ListingRequest) -> Result<Vec<i64>> {
        let (filter, binds) = group_listing_filter(request);
        let sql = format!("SELECT g.id FROM role_groups g WHERE {}", filter);
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
