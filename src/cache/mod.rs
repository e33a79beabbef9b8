//! Redis decision cache

use crate::config::RedisConfig;
use crate::domain::canonical_subject;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Cache key prefixes
mod keys {
    pub const ENFORCE: &str = "rbac:enforce";
}

pub const NOT_ENABLED: &str = "not-enabled";

const SCAN_COUNT: usize = 500;

/// Short digest of the subject list, independent of order and case.
fn subjects_digest(subjects: &[String]) -> String {
    let mut canonical: Vec<String> = subjects.iter().map(|s| canonical_subject(s)).collect();
    canonical.sort();
    canonical.dedup();
    let mut hasher = Sha256::new();
    hasher.update(canonical.join("\n").as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Hash holding one identity's decisions for a `(resource, action)` pair.
/// The identity is the email plus a digest of every subject it resolved to,
/// so a change in group claims lands on a fresh key.
pub fn decision_key(email: &str, subjects: &[String], resource: &str, action: &str) -> String {
    format!(
        "{}:{}:{}:{}$${}",
        keys::ENFORCE,
        canonical_subject(email),
        subjects_digest(subjects),
        resource,
        action
    )
}

/// Escape glob metacharacters so `value` only matches itself in MATCH.
fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// MATCH pattern covering every decision hash of one email.
pub fn subject_pattern(email: &str) -> String {
    format!("{}:{}:*", keys::ENFORCE, escape_glob(&canonical_subject(email)))
}

/// Batch decision cache keyed by subject, resource and action.
#[async_trait]
pub trait CacheOperations: Send + Sync {
    fn is_enabled(&self) -> bool;
    async fn ping(&self) -> Result<()>;
    /// One entry per object; `None` when not cached.
    async fn get_decisions(
        &self,
        email: &str,
        subjects: &[String],
        resource: &str,
        action: &str,
        objs: &[String],
    ) -> Result<Vec<Option<bool>>>;
    async fn set_decisions(
        &self,
        email: &str,
        subjects: &[String],
        resource: &str,
        action: &str,
        decisions: &[(String, bool)],
    ) -> Result<()>;
    async fn invalidate(&self, email: &str) -> Result<()>;
    async fn invalidate_all(&self) -> Result<()>;
    async fn dump(&self) -> Result<serde_json::Value>;
}

/// Cache manager for Redis operations
#[derive(Clone)]
pub struct CacheManager {
    conn: ConnectionManager,
    ttl: Duration,
}

impl CacheManager {
    pub async fn new(config: &RedisConfig, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to create Redis client: {}", e))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self { conn, ttl })
    }

    /// Incremental SCAN so large keyspaces never block the server.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<()> {
        let keys = self.keys_matching(pattern).await?;
        if !keys.is_empty() {
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CacheOperations for CacheManager {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_decisions(
        &self,
        email: &str,
        subjects: &[String],
        resource: &str,
        action: &str,
        objs: &[String],
    ) -> Result<Vec<Option<bool>>> {
        if objs.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(decision_key(email, subjects, resource, action))
            .arg(objs)
            .query_async(&mut conn)
            .await?;
        Ok(values
            .into_iter()
            .map(|v| v.map(|flag| flag == "1"))
            .collect())
    }

    async fn set_decisions(
        &self,
        email: &str,
        subjects: &[String],
        resource: &str,
        action: &str,
        decisions: &[(String, bool)],
    ) -> Result<()> {
        if decisions.is_empty() {
            return Ok(());
        }
        let key = decision_key(email, subjects, resource, action);
        let mut hset = redis::cmd("HSET");
        hset.arg(&key);
        for (obj, allowed) in decisions {
            hset.arg(obj).arg(if *allowed { "1" } else { "0" });
        }

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .add_command(hset)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, email: &str) -> Result<()> {
        self.delete_pattern(&subject_pattern(email)).await
    }

    async fn invalidate_all(&self) -> Result<()> {
        self.delete_pattern(&format!("{}:*", keys::ENFORCE)).await
    }

    async fn dump(&self) -> Result<serde_json::Value> {
        let mut dump = BTreeMap::new();
        for key in self.keys_matching(&format!("{}:*", keys::ENFORCE)).await? {
            let mut conn = self.conn.clone();
            let entries: BTreeMap<String, String> = redis::cmd("HGETALL")
                .arg(&key)
                .query_async(&mut conn)
                .await?;
            dump.insert(key, entries);
        }
        serde_json::to_value(dump)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Cache serialize error: {}", e)))
    }
}

/// Cache used when Redis is not configured. Never stores anything.
#[derive(Clone, Default)]
pub struct NoOpCacheManager;

impl NoOpCacheManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheOperations for NoOpCacheManager {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get_decisions(
        &self,
        _email: &str,
        _subjects: &[String],
        _resource: &str,
        _action: &str,
        objs: &[String],
    ) -> Result<Vec<Option<bool>>> {
        Ok(vec![None; objs.len()])
    }

    async fn set_decisions(
        &self,
        _email: &str,
        _subjects: &[String],
        _resource: &str,
        _action: &str,
        _decisions: &[(String, bool)],
    ) -> Result<()> {
        Ok(())
    }

    async fn invalidate(&self, _email: &str) -> Result<()> {
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<()> {
        Ok(())
    }

    async fn dump(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::String(NOT_ENABLED.to_string()))
    }
}
