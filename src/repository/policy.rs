//! Durable `p` policies and the `g` edges derived from the mapping tables

use super::in_clause;
use super::role::insert_policies;
use crate::domain::{canonical_subject, Grouping, Policy, PolicyRow};
use crate::enforcer::PolicySource;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::MySqlPool;

/// Users whose temporary access expired lose their edges like inactive ones.
const ACTIVE_USER: &str =
    "u.active = TRUE AND (u.timeout_window_expires_at IS NULL OR u.timeout_window_expires_at > NOW())";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn list_policies(&self) -> Result<Vec<Policy>>;
    /// `(email, role)`, `(group, role)` and `(email, group)` edges of active principals
    async fn list_groupings(&self) -> Result<Vec<Grouping>>;
    async fn add_policies(&self, policies: &[Policy]) -> Result<u64>;
    async fn remove_policies(&self, policies: &[Policy]) -> Result<u64>;
    /// Delete every `p` row whose subject is one of the role keys.
    async fn remove_policies_by_roles(&self, roles: &[String]) -> Result<u64>;
}

pub struct PolicyRepositoryImpl {
    pool: MySqlPool,
}

impl PolicyRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyRepository for PolicyRepositoryImpl {
    async fn list_policies(&self) -> Result<Vec<Policy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT id, sub, res, act, obj, eft FROM rbac_policies ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PolicyRow::into_policy).collect())
    }

    async fn list_groupings(&self) -> Result<Vec<Grouping>> {
        let user_roles = format!(
            "SELECT u.email_id AS sub, r.role AS role FROM user_roles ur \
             INNER JOIN users u ON u.id = ur.user_id \
             INNER JOIN roles r ON r.id = ur.role_id \
             WHERE {}",
            ACTIVE_USER
        );
        let group_roles = "SELECT g.casbin_name AS sub, r.role AS role FROM role_group_role_mappings m \
             INNER JOIN role_groups g ON g.id = m.role_group_id \
             INNER JOIN roles r ON r.id = m.role_id \
             WHERE g.active = TRUE";
        let memberships = format!(
            "SELECT u.email_id AS sub, g.casbin_name AS role FROM user_role_groups urg \
             INNER JOIN users u ON u.id = urg.user_id \
             INNER JOIN role_groups g ON g.id = urg.role_group_id \
             WHERE g.active = TRUE AND {}",
            ACTIVE_USER
        );

        let mut groupings = Vec::new();
        for sql in [user_roles.as_str(), group_roles, memberships.as_str()] {
            let rows = sqlx::query_as::<_, Grouping>(sql)
                .fetch_all(&self.pool)
                .await?;
            groupings.extend(
                rows.into_iter()
                    .map(|g| Grouping::new(canonical_subject(&g.sub), g.role)),
            );
        }
        Ok(groupings)
    }

    async fn add_policies(&self, policies: &[Policy]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_policies(&mut tx, policies).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn remove_policies(&self, policies: &[Policy]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for policy in policies {
            let result = sqlx::query(
                "DELETE FROM rbac_policies WHERE sub = ? AND res = ? AND act = ? AND obj = ? AND eft = ?",
            )
            .bind(&policy.sub)
            .bind(&policy.res)
            .bind(&policy.act)
            .bind(&policy.obj)
            .bind(policy.eft.as_str())
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn remove_policies_by_roles(&self, roles: &[String]) -> Result<u64> {
        if roles.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM rbac_policies WHERE sub IN ({})",
            in_clause(roles.len())
        );
        let mut query = sqlx::query(&sql);
        for role in roles {
            query = query.bind(role);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PolicySource for PolicyRepositoryImpl {
    async fn load_policies(&self) -> Result<Vec<Policy>> {
        self.list_policies().await
    }

    async fn load_groupings(&self) -> Result<Vec<Grouping>> {
        self.list_groupings().await
    }
}
