//! Bearer token to enforcement subjects

use super::audit::LoginAuditQueue;
use crate::config::AuthorisationConfig;
use crate::domain::{
    canonical_subject, group_casbin_name, LoginAuditEvent, UserStatus, ADMIN_SUBJECT,
    ADMIN_USER_ID, API_TOKEN_PREFIX,
};
use crate::error::{AppError, Result};
use crate::jwt::{JwtManager, SessionClaims};
use crate::repository::{ApiTokenRepository, UserRepository};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Subject used by the bootstrap admin login token.
const ADMIN_LOGIN_SUBJECT: &str = "admin:login";

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Canonical email (`admin` and `API-TOKEN:` names verbatim)
    pub email: String,
    /// Ordered enforcement subjects
    pub subjects: Vec<String>,
    /// Store id; absent for identities known only through group claims
    pub user_id: Option<i64>,
}

impl Caller {
    pub fn actor_id(&self) -> Result<i64> {
        self.user_id
            .ok_or_else(|| AppError::Unauthorized("Caller has no user record".to_string()))
    }

    pub fn is_admin(&self) -> bool {
        self.email == ADMIN_SUBJECT
    }

    pub fn is_api_token(&self) -> bool {
        self.email.starts_with(API_TOKEN_PREFIX)
    }

    /// Canonical group subjects derived from claims.
    pub fn group_subjects(&self) -> impl Iterator<Item = &String> {
        self.subjects.iter().filter(|s| s.starts_with(crate::domain::GROUP_PREFIX))
    }
}

/// Email the claims identify, with the admin login fallback.
pub fn claims_email(claims: &SessionClaims) -> Option<String> {
    if !claims.email.is_empty() {
        return Some(canonical_subject(&claims.email));
    }
    if claims.sub == ADMIN_SUBJECT || claims.sub == ADMIN_LOGIN_SUBJECT {
        return Some(ADMIN_SUBJECT.to_string());
    }
    None
}

/// Ordered subject list for an email and its group claims.
pub fn subjects_for(email: &str, groups: &[String], config: &AuthorisationConfig) -> Vec<String> {
    let mut subjects = Vec::with_capacity(1 + groups.len());
    if config.system_managed_active || email == ADMIN_SUBJECT || email.starts_with(API_TOKEN_PREFIX)
    {
        subjects.push(canonical_subject(email));
    }
    if config.group_claims_active {
        for group in groups {
            let name = group_casbin_name(group);
            if !subjects.contains(&name) {
                subjects.push(name);
            }
        }
    }
    subjects
}

pub struct SubjectResolver<U: UserRepository, K: ApiTokenRepository> {
    jwt_manager: JwtManager,
    config: AuthorisationConfig,
    user_repo: Arc<U>,
    api_token_repo: Arc<K>,
    login_audit: LoginAuditQueue,
}

impl<U: UserRepository, K: ApiTokenRepository> SubjectResolver<U, K> {
    pub fn new(
        jwt_manager: JwtManager,
        config: AuthorisationConfig,
        user_repo: Arc<U>,
        api_token_repo: Arc<K>,
        login_audit: LoginAuditQueue,
    ) -> Self {
        Self {
            jwt_manager,
            config,
            user_repo,
            api_token_repo,
            login_audit,
        }
    }

    pub fn config(&self) -> &AuthorisationConfig {
        &self.config
    }

    /// Verify the token and build the caller.
    pub async fn resolve(&self, token: &str, client_ip: &str) -> Result<Caller> {
        let claims = self.jwt_manager.verify_token(token)?;
        let email = claims_email(&claims)
            .ok_or_else(|| AppError::Unauthorized("Token carries no identity".to_string()))?;

        if email.starts_with(API_TOKEN_PREFIX) {
            if let Some(version) = claims.version.as_deref() {
                self.validate_api_token(&email, version).await?;
            }
        }

        let subjects = subjects_for(&email, &claims.groups, &self.config);
        let user_id = self.lookup_user(&email).await?;

        if let Some(user_id) = user_id {
            if email.starts_with(API_TOKEN_PREFIX) {
                self.login_audit.post(LoginAuditEvent {
                    user_id,
                    client_ip: client_ip.to_string(),
                    at: Utc::now(),
                });
            }
        }

        debug!(email = %email, subjects = ?subjects, "Resolved caller");
        Ok(Caller {
            email,
            subjects,
            user_id,
        })
    }

    async fn validate_api_token(&self, email: &str, version: &str) -> Result<()> {
        let name = email.trim_start_matches(API_TOKEN_PREFIX);
        let token = self.api_token_repo.find_by_name(name).await?;
        match token {
            Some(token)
                if token.active && token.version == version && !token.is_expired_at(Utc::now()) =>
            {
                Ok(())
            }
            _ => {
                warn!(token = %name, "Rejected API token with stale or unknown version");
                Err(AppError::Unauthorized("Invalid API token".to_string()))
            }
        }
    }

    async fn lookup_user(&self, email: &str) -> Result<Option<i64>> {
        if email == ADMIN_SUBJECT {
            return Ok(Some(ADMIN_USER_ID));
        }
        match self.user_repo.find_by_email(email).await? {
            Some(user) => {
                if user.status_at(Utc::now()) == UserStatus::Inactive {
                    return Err(AppError::Unauthorized("Inactive user".to_string()));
                }
                Ok(Some(user.id))
            }
            None if self.config.group_claims_active => Ok(None),
            None => Err(AppError::Unauthorized("User not found".to_string())),
        }
    }
}
