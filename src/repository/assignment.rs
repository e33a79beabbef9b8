//! Mapping tables: transactional change sets and lifecycle cleanup

use super::in_clause;
use crate::domain::ACTION_SUPER_ADMIN;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::{MySqlConnection, MySqlPool};
use tracing::debug;

/// Every mapping write of one principal mutation. Applied in a single
/// transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub actor_id: i64,
    /// `(user_id, role_id)`
    pub user_roles_added: Vec<(i64, i64)>,
    pub user_roles_removed: Vec<(i64, i64)>,
    /// `(role_group_id, role_id)`
    pub group_roles_added: Vec<(i64, i64)>,
    pub group_roles_removed: Vec<(i64, i64)>,
    /// `(user_id, role_group_id)`
    pub memberships_added: Vec<(i64, i64)>,
    pub memberships_removed: Vec<(i64, i64)>,
    /// Marked inactive; all their role mappings and memberships are dropped.
    pub users_deactivated: Vec<i64>,
    pub groups_deactivated: Vec<i64>,
}

impl ChangeSet {
    pub fn new(actor_id: i64) -> Self {
        Self {
            actor_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_roles_added.is_empty()
            && self.user_roles_removed.is_empty()
            && self.group_roles_added.is_empty()
            && self.group_roles_removed.is_empty()
            && self.memberships_added.is_empty()
            && self.memberships_removed.is_empty()
            && self.users_deactivated.is_empty()
            && self.groups_deactivated.is_empty()
    }
}

/// Outcome of collapsing role rows that share a role key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub duplicate_keys: Vec<String>,
    pub deleted_role_ids: Vec<i64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn apply(&self, changes: &ChangeSet) -> Result<()>;

    /// Keep the lowest id per role key and repoint its mappings.
    async fn dedup_roles(&self) -> Result<DedupReport>;
    /// Drop mappings that reference inactive users or role-groups.
    async fn delete_inactive_mappings(&self) -> Result<u64>;
    /// Delete roles nothing maps to; returns role keys that no longer exist.
    async fn delete_unreferenced_roles(&self) -> Result<Vec<String>>;
}

pub struct AssignmentRepositoryImpl {
    pool: MySqlPool,
}

impl AssignmentRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

async fn delete_in(conn: &mut MySqlConnection, sql_prefix: &str, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!("{} IN ({})", sql_prefix, in_clause(ids.len()));
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

async fn pair_insert(
    conn: &mut MySqlConnection,
    table: &str,
    columns: (&str, &str),
    pairs: &[(i64, i64)],
    actor_id: i64,
) -> Result<()> {
    let sql = format!(
        "INSERT IGNORE INTO {} ({}, {}, created_by, created_at) VALUES (?, ?, ?, NOW())",
        table, columns.0, columns.1
    );
    for (left, right) in pairs {
        sqlx::query(&sql)
            .bind(left)
            .bind(right)
            .bind(actor_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn pair_delete(
    conn: &mut MySqlConnection,
    table: &str,
    columns: (&str, &str),
    pairs: &[(i64, i64)],
) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE {} = ? AND {} = ?", table, columns.0, columns.1);
    for (left, right) in pairs {
        sqlx::query(&sql)
            .bind(left)
            .bind(right)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

const USER_ROLES: (&str, (&str, &str)) = ("user_roles", ("user_id", "role_id"));
const GROUP_ROLES: (&str, (&str, &str)) =
    ("role_group_role_mappings", ("role_group_id", "role_id"));
const MEMBERSHIPS: (&str, (&str, &str)) = ("user_role_groups", ("user_id", "role_group_id"));

#[async_trait]
impl AssignmentRepository for AssignmentRepositoryImpl {
    async fn apply(&self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        pair_delete(&mut tx, USER_ROLES.0, USER_ROLES.1, &changes.user_roles_removed).await?;
        pair_delete(&mut tx, GROUP_ROLES.0, GROUP_ROLES.1, &changes.group_roles_removed).await?;
        pair_delete(&mut tx, MEMBERSHIPS.0, MEMBERSHIPS.1, &changes.memberships_removed).await?;

        pair_insert(
            &mut tx,
            USER_ROLES.0,
            USER_ROLES.1,
            &changes.user_roles_added,
            changes.actor_id,
        )
        .await?;
        pair_insert(
            &mut tx,
            GROUP_ROLES.0,
            GROUP_ROLES.1,
            &changes.group_roles_added,
            changes.actor_id,
        )
        .await?;
        pair_insert(
            &mut tx,
            MEMBERSHIPS.0,
            MEMBERSHIPS.1,
            &changes.memberships_added,
            changes.actor_id,
        )
        .await?;

        if !changes.users_deactivated.is_empty() {
            let ids = &changes.users_deactivated;
            delete_in(&mut tx, "DELETE FROM user_roles WHERE user_id", ids).await?;
            delete_in(&mut tx, "DELETE FROM user_role_groups WHERE user_id", ids).await?;
            let sql = format!(
                "UPDATE users SET active = FALSE, updated_by = ?, updated_at = NOW() WHERE id IN ({})",
                in_clause(ids.len())
            );
            let mut query = sqlx::query(&sql).bind(changes.actor_id);
            for id in ids {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }

        if !changes.groups_deactivated.is_empty() {
            let ids = &changes.groups_deactivated;
            delete_in(
                &mut tx,
                "DELETE FROM role_group_role_mappings WHERE role_group_id",
                ids,
            )
            .await?;
            delete_in(&mut tx, "DELETE FROM user_role_groups WHERE role_group_id", ids).await?;
            let sql = format!(
                "UPDATE role_groups SET active = FALSE, updated_by = ?, updated_at = NOW() WHERE id IN ({})",
                in_clause(ids.len())
            );
            let mut query = sqlx::query(&sql).bind(changes.actor_id);
            for id in ids {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn dedup_roles(&self) -> Result<DedupReport> {
        let mut tx = self.pool.begin().await?;
        let duplicates = sqlx::query_as::<_, (String, i64)>(
            "SELECT role, MIN(id) FROM roles GROUP BY role HAVING COUNT(*) > 1",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut report = DedupReport::default();
        for (role, keep_id) in duplicates {
            let extra = sqlx::query_as::<_, (i64,)>(
                "SELECT id FROM roles WHERE role = ? AND id <> ? ORDER BY id",
            )
            .bind(&role)
            .bind(keep_id)
            .fetch_all(&mut *tx)
            .await?;

            for (dup_id,) in extra {
                for (table, owner) in [
                    ("user_roles", "user_id"),
                    ("role_group_role_mappings", "role_group_id"),
                ] {
                    let repoint = format!(
                        "INSERT IGNORE INTO {table} ({owner}, role_id, created_by, created_at) \
                         SELECT {owner}, ?, created_by, created_at FROM {table} WHERE role_id = ?"
                    );
                    sqlx::query(&repoint)
                        .bind(keep_id)
                        .bind(dup_id)
                        .execute(&mut *tx)
                        .await?;
                    let drop = format!("DELETE FROM {table} WHERE role_id = ?");
                    sqlx::query(&drop).bind(dup_id).execute(&mut *tx).await?;
                }
                sqlx::query("DELETE FROM roles WHERE id = ?")
                    .bind(dup_id)
                    .execute(&mut *tx)
                    .await?;
                report.deleted_role_ids.push(dup_id);
            }
            debug!(role = %role, keep_id, "Collapsed duplicate role rows");
            report.duplicate_keys.push(role);
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn delete_inactive_mappings(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for sql in [
            "DELETE ur FROM user_roles ur INNER JOIN users u ON u.id = ur.user_id WHERE u.active = FALSE",
            "DELETE urg FROM user_role_groups urg INNER JOIN users u ON u.id = urg.user_id WHERE u.active = FALSE",
            "DELETE urg FROM user_role_groups urg INNER JOIN role_groups g ON g.id = urg.role_group_id WHERE g.active = FALSE",
            "DELETE m FROM role_group_role_mappings m INNER JOIN role_groups g ON g.id = m.role_group_id WHERE g.active = FALSE",
        ] {
            deleted += sqlx::query(sql).execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_unreferenced_roles(&self) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        // Freshly created roles may not be mapped yet; leave them for the next run.
        let orphans = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT r.id, r.role FROM roles r
            WHERE r.action <> ?
              AND r.created_at < NOW() - INTERVAL 10 MINUTE
              AND NOT EXISTS (SELECT 1 FROM user_roles ur WHERE ur.role_id = r.id)
              AND NOT EXISTS (SELECT 1 FROM role_group_role_mappings m WHERE m.role_id = r.id)
            "#,
        )
        .bind(ACTION_SUPER_ADMIN)
        .fetch_all(&mut *tx)
        .await?;

        if orphans.is_empty() {
            tx.commit().await?;
            return Ok(vec![]);
        }

        let ids: Vec<i64> = orphans.iter().map(|(id, _)| *id).collect();
        delete_in(&mut tx, "DELETE FROM roles WHERE id", &ids).await?;

        let mut gone = Vec::new();
        for (_, role) in orphans {
            if gone.contains(&role) {
                continue;
            }
            let (remaining,) =
                sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM roles WHERE role = ?")
                    .bind(&role)
                    .fetch_one(&mut *tx)
                    .await?;
            if remaining == 0 {
                sqlx::query("DELETE FROM rbac_policies WHERE sub = ?")
                    .bind(&role)
                    .execute(&mut *tx)
                    .await?;
                gone.push(role);
            }
        }

        tx.commit().await?;
        Ok(gone)
    }
}
