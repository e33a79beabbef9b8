use crate::domain::ApiToken;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::MySqlPool;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApiTokenRepository: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<ApiToken>>;
}

pub struct ApiTokenRepositoryImpl {
    pool: MySqlPool,
}

impl ApiTokenRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiTokenRepository for ApiTokenRepositoryImpl {
    async fn find_by_name(&self, name: &str) -> Result<Option<ApiToken>> {
        let token = sqlx::query_as::<_, ApiToken>(
            "SELECT id, name, user_id, version, expires_at, active FROM api_tokens WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }
}
