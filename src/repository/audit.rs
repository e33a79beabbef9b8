//! Mutation and login audit repository

use crate::domain::{AuditRecord, LoginAuditEvent};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::MySqlPool;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record_mutation(&self, record: &AuditRecord) -> Result<()>;
    async fn record_login(&self, event: &LoginAuditEvent) -> Result<()>;
    async fn find_last_login(&self, user_id: i64) -> Result<Option<DateTime<Utc>>>;
}

pub struct AuditRepositoryImpl {
    pool: MySqlPool,
}

impl AuditRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for AuditRepositoryImpl {
    async fn record_mutation(&self, record: &AuditRecord) -> Result<()> {
        let permissions = serde_json::to_string(&record.permissions).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO rbac_audit (entity_id, entity_type, op, permissions, actor_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.entity_id)
        .bind(record.entity_type.as_str())
        .bind(record.op.as_str())
        .bind(&permissions)
        .bind(record.actor_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_login(&self, event: &LoginAuditEvent) -> Result<()> {
        sqlx::query("INSERT INTO user_audit (user_id, client_ip, created_on) VALUES (?, ?, ?)")
            .bind(event.user_id)
            .bind(&event.client_ip)
            .bind(event.at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_last_login(&self, user_id: i64) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, (Option<DateTime<Utc>>,)>(
            "SELECT MAX(created_on) FROM user_audit WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
