//! JWT token handling
//!
//! The core consumes session tokens minted by the login pipeline and long-lived
//! API tokens. Minting is kept here for bootstrap tooling and tests.

use crate::config::JwtConfig;
use crate::error::{AppError, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Deserializer, Serialize};

/// Claims carried by session and API tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user name, `admin`, `admin:login` or `API-TOKEN:<name>`)
    pub sub: String,
    #[serde(default)]
    pub email: String,
    /// API-token version; accepted as number or string
    #[serde(
        default,
        deserialize_with = "deserialize_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    /// Group claims from the identity provider
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

fn deserialize_version<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// JWT token manager
#[derive(Clone)]
pub struct JwtManager {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
}

impl JwtManager {
    pub fn new(config: JwtConfig) -> Result<Self> {
        let algorithm = if config.private_key_pem.is_some() {
            Algorithm::RS256
        } else {
            Algorithm::HS256
        };
        let encoding_key = match config.private_key_pem.as_ref() {
            Some(private_key) => EncodingKey::from_rsa_pem(private_key.as_bytes())?,
            None => EncodingKey::from_secret(config.secret.as_bytes()),
        };
        let decoding_key = match (&config.public_key_pem, &config.private_key_pem) {
            (Some(public_key), _) => DecodingKey::from_rsa_pem(public_key.as_bytes())?,
            (None, Some(private_key)) => DecodingKey::from_rsa_pem(private_key.as_bytes())?,
            (None, None) => DecodingKey::from_secret(config.secret.as_bytes()),
        };
        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            algorithm,
        })
    }

    /// Validation with a 5 second leeway instead of the default 60.
    fn strict_validation(&self) -> Validation {
        let mut v = Validation::new(self.algorithm);
        v.leeway = 5;
        v.set_issuer(&[&self.config.issuer]);
        v.validate_aud = false;
        v
    }

    /// Create a session token for an email with optional group claims
    pub fn create_session_token(&self, email: &str, groups: Vec<String>) -> Result<String> {
        self.encode_claims(email, email, None, groups)
    }

    /// Create a token for the bootstrap `admin` login, which carries no email
    pub fn create_admin_login_token(&self) -> Result<String> {
        self.encode_claims("admin:login", "", None, vec![])
    }

    /// Create an API token (`API-TOKEN:<name>`) pinned to a version
    pub fn create_api_token(&self, name: &str, version: &str) -> Result<String> {
        let subject = format!("{}{}", crate::domain::API_TOKEN_PREFIX, name);
        self.encode_claims(&subject, &subject, Some(version.to_string()), vec![])
    }

    fn encode_claims(
        &self,
        sub: &str,
        email: &str,
        version: Option<String>,
        groups: Vec<String>,
    ) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.config.token_ttl_secs);

        let claims = SessionClaims {
            sub: sub.to_string(),
            email: email.to_string(),
            version,
            groups,
            iss: self.config.issuer.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };
        let header = Header::new(self.algorithm);
        encode(&header, &claims, &self.encoding_key).map_err(|e| AppError::Internal(e.into()))
    }

    /// Verify signature and expiry, returning the claims
    pub fn verify_token(&self, token: &str) -> Result<SessionClaims> {
        let token_data = decode::<SessionClaims>(token, &self.decoding_key, &self.strict_validation())?;
        Ok(token_data.claims)
    }

    pub fn uses_rsa(&self) -> bool {
        self.algorithm == Algorithm::RS256
    }
}
