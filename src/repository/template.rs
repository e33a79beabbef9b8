//! Default role / policy template repository

use crate::error::Result;
use crate::template::TemplateKey;
use async_trait::async_trait;
use sqlx::{FromRow, MySqlPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Go,
    Indexed,
}

/// One stored template; `index_key_map` is only set for indexed rows.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DefaultTemplateRow {
    pub id: i64,
    pub entity: String,
    pub access_type: String,
    pub role_type: String,
    pub template_kind: String,
    pub value: String,
    pub index_key_map: Option<String>,
}

impl DefaultTemplateRow {
    pub fn key(&self) -> TemplateKey {
        TemplateKey::new(&self.entity, &self.access_type, &self.role_type)
    }

    pub fn kind(&self) -> TemplateKind {
        if self.template_kind.eq_ignore_ascii_case("indexed") {
            TemplateKind::Indexed
        } else {
            TemplateKind::Go
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn list_role_templates(&self) -> Result<Vec<DefaultTemplateRow>>;
    async fn list_policy_templates(&self) -> Result<Vec<DefaultTemplateRow>>;
    async fn find_role_template(
        &self,
        entity: &str,
        access_type: &str,
        role_type: &str,
    ) -> Result<Option<DefaultTemplateRow>>;
    async fn find_policy_template(
        &self,
        entity: &str,
        access_type: &str,
        role_type: &str,
    ) -> Result<Option<DefaultTemplateRow>>;
}

pub struct TemplateRepositoryImpl {
    pool: MySqlPool,
}

impl TemplateRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn list(&self, table: &str) -> Result<Vec<DefaultTemplateRow>> {
        let sql = format!(
            "SELECT id, entity, access_type, role_type, template_kind, value, index_key_map \
             FROM {} WHERE active = TRUE",
            table
        );
        let rows = sqlx::query_as::<_, DefaultTemplateRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn find(
        &self,
        table: &str,
        entity: &str,
        access_type: &str,
        role_type: &str,
    ) -> Result<Option<DefaultTemplateRow>> {
        let sql = format!(
            "SELECT id, entity, access_type, role_type, template_kind, value, index_key_map \
             FROM {} WHERE entity = ? AND access_type = ? AND role_type = ? AND active = TRUE",
            table
        );
        let row = sqlx::query_as::<_, DefaultTemplateRow>(&sql)
            .bind(entity)
            .bind(access_type)
            .bind(role_type)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

const ROLE_TABLE: &str = "default_rbac_role_templates";
const POLICY_TABLE: &str = "default_rbac_policy_templates";

#[async_trait]
impl TemplateRepository for TemplateRepositoryImpl {
    async fn list_role_templates(&self) -> Result<Vec<DefaultTemplateRow>> {
        self.list(ROLE_TABLE).await
    }

    async fn list_policy_templates(&self) -> Result<Vec<DefaultTemplateRow>> {
        self.list(POLICY_TABLE).await
    }

    async fn find_role_template(
        &self,
        entity: &str,
        access_type: &str,
        role_type: &str,
    ) -> Result<Option<DefaultTemplateRow>> {
        self.find(ROLE_TABLE, entity, access_type, role_type).await
    }

    async fn find_policy_template(
        &self,
        entity: &str,
        access_type: &str,
        role_type: &str,
    ) -> Result<Option<DefaultTemplateRow>> {
        self.find(POLICY_TABLE, entity, access_type, role_type).await
    }
}
