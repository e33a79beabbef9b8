//! Configuration management for RBAC Core

use anyhow::{Context, Result};
use std::env;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server host
    pub http_host: String,
    /// HTTP server port
    pub http_port: u16,
    /// Request-scoped deadline applied to every HTTP request
    pub request_timeout_secs: u64,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration (decision cache); `None` disables the cache
    pub redis: Option<RedisConfig>,
    /// JWT configuration
    pub jwt: JwtConfig,
    /// Subject resolution switches
    pub authorisation: AuthorisationConfig,
    /// Policy engine switches
    pub enforcer: EnforcerConfig,
    /// Lifecycle GC schedule
    pub cleanup: CleanupConfig,
    /// Out-of-process policy engine endpoint
    pub remote_engine: Option<RemoteEngineConfig>,
    /// Audit sink configuration
    pub audit: AuditConfig,
    /// Telemetry configuration
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub token_ttl_secs: i64,
    pub private_key_pem: Option<String>,
    pub public_key_pem: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthorisationConfig {
    /// Include the caller's email as an enforcement subject
    pub system_managed_active: bool,
    /// Derive `group:` subjects from the token's group claims
    pub group_claims_active: bool,
}

impl Default for AuthorisationConfig {
    fn default() -> Self {
        Self {
            system_managed_active: true,
            group_claims_active: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    /// Render default templates through the indexed renderer
    pub use_rbac_creation_v2: bool,
    /// Use the subject-indexed policy store
    pub use_casbin_v2: bool,
    /// Use the batch-optimised enforcement path
    pub use_custom_enforcer: bool,
    /// Memoise role closures per subject
    pub custom_role_cache_allowed: bool,
    /// Cache batch decisions in Redis
    pub cache_enabled: bool,
    pub cache_expiration_secs: u64,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            use_rbac_creation_v2: true,
            use_casbin_v2: false,
            use_custom_enforcer: true,
            custom_role_cache_allowed: false,
            cache_enabled: false,
            cache_expiration_secs: 86400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Five-field cron expression
    pub cron: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: "0 0 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteEngineConfig {
    pub url: String,
    /// Max encode/decode message size in MiB
    pub max_message_size_mib: usize,
}

impl RemoteEngineConfig {
    pub fn max_message_size_bytes(&self) -> usize {
        self.max_message_size_mib * 1024 * 1024
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Capacity of the login-audit queue; events beyond it are dropped
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub metrics_enabled: bool,
    /// "json" or "pretty"
    pub log_format: String,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_format: "pretty".to_string(),
            service_name: "rbac-core".to_string(),
        }
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .to_ascii_lowercase()
            .parse()
            .with_context(|| format!("Invalid {}", key)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            http_host: env::var("HTTP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid HTTP_PORT")?,
            request_timeout_secs: env::var("REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid REQUEST_TIMEOUT_SECS")?,
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
            },
            redis: env::var("REDIS_URL")
                .ok()
                .filter(|url| !url.is_empty())
                .map(|url| RedisConfig { url }),
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET").context("JWT_SECRET is required")?,
                issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "rbac-core".to_string()),
                token_ttl_secs: env::var("JWT_TOKEN_TTL_SECS")
                    .unwrap_or_else(|_| "86400".to_string())
                    .parse()
                    .unwrap_or(86400),
                private_key_pem: env::var("JWT_PRIVATE_KEY")
                    .ok()
                    .map(|value| value.replace("\\n", "\n")),
                public_key_pem: env::var("JWT_PUBLIC_KEY")
                    .ok()
                    .map(|value| value.replace("\\n", "\n")),
            },
            authorisation: AuthorisationConfig {
                system_managed_active: env_bool("SYSTEM_MANAGED_CONFIG_ACTIVE", true)?,
                group_claims_active: env_bool("GROUP_CLAIMS_CONFIG_ACTIVE", false)?,
            },
            enforcer: EnforcerConfig {
                use_rbac_creation_v2: env_bool("USE_RBAC_CREATION_V2", true)?,
                use_casbin_v2: env_bool("USE_CASBIN_V2", false)?,
                use_custom_enforcer: env_bool("USE_CUSTOM_ENFORCER", true)?,
                custom_role_cache_allowed: env_bool("CUSTOM_ROLE_CACHE_ALLOWED", false)?,
                cache_enabled: env_bool("ENFORCER_CACHE", false)?,
                cache_expiration_secs: env::var("ENFORCER_CACHE_EXPIRATION_IN_SEC")
                    .unwrap_or_else(|_| "86400".to_string())
                    .parse()
                    .context("Invalid ENFORCER_CACHE_EXPIRATION_IN_SEC")?,
            },
            cleanup: CleanupConfig {
                enabled: env_bool("CLEAN_UP_RBAC_POLICIES", false)?,
                cron: env::var("CLEAN_UP_RBAC_POLICIES_CRON_TIME")
                    .unwrap_or_else(|_| "0 0 * * *".to_string()),
            },
            remote_engine: match env::var("CASBIN_CLIENT_URL") {
                Ok(url) if !url.is_empty() => Some(RemoteEngineConfig {
                    url,
                    max_message_size_mib: env::var("CASBIN_GRPC_DATA_TRANSFER_MAX_SIZE")
                        .unwrap_or_else(|_| "20".to_string())
                        .parse()
                        .context("Invalid CASBIN_GRPC_DATA_TRANSFER_MAX_SIZE")?,
                }),
                _ => None,
            },
            audit: AuditConfig {
                queue_capacity: env::var("AUDIT_QUEUE_CAPACITY")
                    .unwrap_or_else(|_| "1024".to_string())
                    .parse()
                    .context("Invalid AUDIT_QUEUE_CAPACITY")?,
            },
            telemetry: TelemetryConfig {
                metrics_enabled: env_bool("METRICS_ENABLED", true)?,
                log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
                service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "rbac-core".to_string()),
            },
        })
    }

    /// Get HTTP server address
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Whether decision caching is both enabled and backed by Redis
    pub fn decision_cache_enabled(&self) -> bool {
        self.enforcer.cache_enabled && self.redis.is_some()
    }
}
