//! Role repository

use super::in_clause;
use crate::domain::{NewRole, Policy, Role, RoleTuple};
use crate::error::{is_unique_violation, AppError, Result};
use async_trait::async_trait;
use sqlx::MySqlPool;
use tracing::warn;

pub(crate) const ROLE_COLUMNS: &str = "r.id, r.role, r.entity, r.access_type, r.team, \
    r.entity_name, r.environment, r.action, r.cluster, r.namespace, r.group_name, r.kind, \
    r.resource, r.workflow, r.subaction, r.created_at, r.updated_at";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// Row whose non-empty fields match and whose empty fields are NULL.
    async fn find_by_tuple(&self, tuple: &RoleTuple) -> Result<Option<Role>>;
    async fn find_by_id(&self, id: i64) -> Result<Option<Role>>;
    /// Insert a role with its `p` policies. A tuple collision is `Conflict`.
    async fn create(&self, role: &NewRole, policies: &[Policy]) -> Result<Role>;
    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<Role>>;
    async fn find_by_group_id(&self, role_group_id: i64) -> Result<Vec<Role>>;
    async fn find_by_group_casbin_names(&self, names: &[String]) -> Result<Vec<Role>>;
    /// Roles scoped to a team (orchestrator re-sync)
    async fn list_with_team(&self) -> Result<Vec<Role>>;
    async fn find_by_keys(&self, keys: &[String]) -> Result<Vec<Role>>;
}

pub struct RoleRepositoryImpl {
    pool: MySqlPool,
}

impl RoleRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn nullable(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn tuple_fields(tuple: &RoleTuple) -> [(&'static str, &str); 13] {
    [
        ("entity", tuple.entity.as_str()),
        ("access_type", tuple.access_type.as_str()),
        ("team", tuple.team.as_str()),
        ("entity_name", tuple.entity_name.as_str()),
        ("environment", tuple.environment.as_str()),
        ("action", tuple.action.as_str()),
        ("cluster", tuple.cluster.as_str()),
        ("namespace", tuple.namespace.as_str()),
        ("group_name", tuple.group.as_str()),
        ("kind", tuple.kind.as_str()),
        ("resource", tuple.resource.as_str()),
        ("workflow", tuple.workflow.as_str()),
        ("subaction", tuple.subaction.as_str()),
    ]
}

/// Insert `p` rows that are not stored yet.
pub(crate) async fn insert_policies(
    conn: &mut sqlx::MySqlConnection,
    policies: &[Policy],
) -> Result<u64> {
    let mut inserted = 0;
    for policy in policies {
        let result = sqlx::query(
            r#"
            INSERT INTO rbac_policies (sub, res, act, obj, eft)
            SELECT ?, ?, ?, ?, ? FROM DUAL
            WHERE NOT EXISTS (
                SELECT 1 FROM rbac_policies
                WHERE sub = ? AND res = ? AND act = ? AND obj = ? AND eft = ?
            )
            "#,
        )
        .bind(&policy.sub)
        .bind(&policy.res)
        .bind(&policy.act)
        .bind(&policy.obj)
        .bind(policy.eft.as_str())
        .bind(&policy.sub)
        .bind(&policy.res)
        .bind(&policy.act)
        .bind(&policy.obj)
        .bind(policy.eft.as_str())
        .execute(&mut *conn)
        .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

#[async_trait]
impl RoleRepository for RoleRepositoryImpl {
    async fn find_by_tuple(&self, tuple: &RoleTuple) -> Result<Option<Role>> {
        let fields = tuple_fields(tuple);
        let predicates: Vec<String> = fields
            .iter()
            .map(|(column, value)| match nullable(value) {
                Some(_) => format!("r.{} = ?", column),
                None => format!("r.{} IS NULL", column),
            })
            .collect();
        let sql = format!(
            "SELECT {} FROM roles r WHERE {} ORDER BY r.id ASC",
            ROLE_COLUMNS,
            predicates.join(" AND ")
        );

        let mut query = sqlx::query_as::<_, Role>(&sql);
        for (_, value) in fields.iter() {
            if let Some(value) = nullable(value) {
                query = query.bind(value);
            }
        }
        let mut rows = query.fetch_all(&self.pool).await?;
        if rows.len() > 1 {
            warn!(
                role = %rows[0].role,
                count = rows.len(),
                "Duplicate role rows for one tuple, using the lowest id"
            );
        }
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Role>> {
        let sql = format!("SELECT {} FROM roles r WHERE r.id = ?", ROLE_COLUMNS);
        let role = sqlx::query_as::<_, Role>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role)
    }

    async fn create(&self, role: &NewRole, policies: &[Policy]) -> Result<Role> {
        let t = &role.tuple;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO roles (role, entity, access_type, team, entity_name, environment, action,
                               cluster, namespace, group_name, kind, resource, workflow, subaction,
                               tuple_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NOW(), NOW())
            "#,
        )
        .bind(&role.role)
        .bind(nullable(&t.entity))
        .bind(nullable(&t.access_type))
        .bind(nullable(&t.team))
        .bind(nullable(&t.entity_name))
        .bind(nullable(&t.environment))
        .bind(&t.action)
        .bind(nullable(&t.cluster))
        .bind(nullable(&t.namespace))
        .bind(nullable(&t.group))
        .bind(nullable(&t.kind))
        .bind(nullable(&t.resource))
        .bind(nullable(&t.workflow))
        .bind(nullable(&t.subaction))
        .bind(t.canonical_key())
        .execute(&mut *tx)
        .await;

        let id = match inserted {
            Ok(result) => result.last_insert_id() as i64,
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::Conflict(format!(
                    "Role {} already exists",
                    role.role
                )));
            }
            Err(e) => return Err(e.into()),
        };

        insert_policies(&mut tx, policies).await?;
        tx.commit().await?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to create role")))
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<Role>> {
        let sql = format!(
            "SELECT {} FROM roles r INNER JOIN user_roles ur ON ur.role_id = r.id \
             WHERE ur.user_id = ? ORDER BY r.id",
            ROLE_COLUMNS
        );
        let roles = sqlx::query_as::<_, Role>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(roles)
    }

    async fn find_by_group_id(&self, role_group_id: i64) -> Result<Vec<Role>> {
        let sql = format!(
            "SELECT {} FROM roles r INNER JOIN role_group_role_mappings m ON m.role_id = r.id \
             WHERE m.role_group_id = ? ORDER BY r.id",
            ROLE_COLUMNS
        );
        let roles = sqlx::query_as::<_, Role>(&sql)
            .bind(role_group_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(roles)
    }

    async fn find_by_group_casbin_names(&self, names: &[String]) -> Result<Vec<Role>> {
        if names.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT DISTINCT {} FROM roles r \
             INNER JOIN role_group_role_mappings m ON m.role_id = r.id \
             INNER JOIN role_groups g ON g.id = m.role_group_id \
             WHERE g.active = TRUE AND g.casbin_name IN ({}) ORDER BY r.id",
            ROLE_COLUMNS,
            in_clause(names.len())
        );
        let mut query = sqlx::query_as::<_, Role>(&sql);
        for name in names {
            query = query.bind(name);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn list_with_team(&self) -> Result<Vec<Role>> {
        let sql = format!(
            "SELECT {} FROM roles r WHERE r.team IS NOT NULL AND r.team <> '' ORDER BY r.id",
            ROLE_COLUMNS
        );
        let roles = sqlx::query_as::<_, Role>(&sql).fetch_all(&self.pool).await?;
        Ok(roles)
    }

    async fn find_by_keys(&self, keys: &[String]) -> Result<Vec<Role>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM roles r WHERE r.role IN ({}) ORDER BY r.id",
            ROLE_COLUMNS,
            in_clause(keys.len())
        );
        let mut query = sqlx::query_as::<_, Role>(&sql);
        for key in keys {
            query = query.bind(key);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }
}
