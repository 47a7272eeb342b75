//! Credential resolution.
//!
//! Two strategies share the [`CredentialResolver`] trait:
//!
//! - [`CredentialPairResolver`]: the bearer token carries AWS credentials as
//!   `access_key@secret_key`, optionally several pairs joined by `|`.
//! - [`ApiKeyResolver`]: the bearer token is an opaque deployment-issued key;
//!   backend calls use the process-wide default credentials.
//!
//! Secret material never reaches the logs: access keys are masked and secret
//! keys live in [`SecretString`].

use crate::core::config::{AuthConfig, AuthMode};
use crate::core::error::Result;
use crate::core::logging::mask_key;
use crate::core::AppError;
use axum::http::HeaderMap;
use rand::seq::SliceRandom;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Where a credential set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Header,
    EnvironmentDefault,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::EnvironmentDefault => "environment-default",
        }
    }
}

/// Credentials for a single backend call. Built per request, never persisted.
pub struct CredentialSet {
    pub access_key: String,
    pub secret_key: SecretString,
    pub session_token: Option<SecretString>,
    /// Region override; the configured default applies when absent
    pub region: Option<String>,
    pub source: CredentialSource,
}

impl CredentialSet {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: SecretString::from(secret_key.into()),
            session_token: None,
            region: None,
            source,
        }
    }

    pub fn masked_access_key(&self) -> String {
        mask_key(&self.access_key)
    }
}

impl Clone for CredentialSet {
    fn clone(&self) -> Self {
        Self {
            access_key: self.access_key.clone(),
            secret_key: SecretString::from(self.secret_key.expose_secret().to_string()),
            session_token: self
                .session_token
                .as_ref()
                .map(|t| SecretString::from(t.expose_secret().to_string())),
            region: self.region.clone(),
            source: self.source,
        }
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_key", &self.masked_access_key())
            .field("secret_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("region", &self.region)
            .field("source", &self.source)
            .finish()
    }
}

/// Resolves the credentials to use for a request.
pub trait CredentialResolver: Send + Sync {
    /// All usable credential sets, in the order they should be tried.
    fn resolve_all(&self, authorization: Option<&str>) -> Result<Vec<CredentialSet>>;

    /// The first usable credential set.
    fn resolve(&self, authorization: Option<&str>) -> Result<CredentialSet> {
        self.resolve_all(authorization)?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Unauthenticated("No credentials available".to_string()))
    }
}

/// Compute SHA-256 hash of an API key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Raw `Authorization` header value, if present and valid UTF-8.
pub fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Token after a case-insensitive `Bearer ` scheme.
pub fn extract_bearer(authorization: &str) -> Option<&str> {
    let (scheme, token) = authorization.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Parse `k1@s1|k2@s2`. Malformed pairs are skipped.
pub fn parse_credential_pairs(token: &str) -> Vec<CredentialSet> {
    token
        .split('|')
        .filter_map(|pair| {
            let (access_key, secret_key) = pair.trim().split_once('@')?;
            let (access_key, secret_key) = (access_key.trim(), secret_key.trim());
            if access_key.is_empty() || secret_key.is_empty() {
                return None;
            }
            Some(CredentialSet::new(access_key, secret_key, CredentialSource::Header))
        })
        .collect()
}

/// Process-wide default credentials.
pub struct DefaultCredentials {
    access_key: String,
    secret_key: SecretString,
    session_token: Option<SecretString>,
}

impl DefaultCredentials {
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        let access_key = config.default_access_key.as_ref()?.trim();
        let secret_key = config.default_secret_key.as_ref()?.trim();
        if access_key.is_empty() || secret_key.is_empty() {
            return None;
        }
        Some(Self {
            access_key: access_key.to_string(),
            secret_key: SecretString::from(secret_key.to_string()),
            session_token: config
                .default_session_token
                .as_ref()
                .filter(|t| !t.is_empty())
                .map(|t| SecretString::from(t.clone())),
        })
    }

    fn credential_set(&self) -> CredentialSet {
        CredentialSet {
            access_key: self.access_key.clone(),
            secret_key: SecretString::from(self.secret_key.expose_secret().to_string()),
            session_token: self
                .session_token
                .as_ref()
                .map(|t| SecretString::from(t.expose_secret().to_string())),
            region: None,
            source: CredentialSource::EnvironmentDefault,
        }
    }
}

/// Bearer token carries `access_key@secret_key` pairs; falls back to defaults.
pub struct CredentialPairResolver {
    defaults: Option<DefaultCredentials>,
}

impl CredentialPairResolver {
    pub fn new(defaults: Option<DefaultCredentials>) -> Self {
        Self { defaults }
    }
}

impl CredentialResolver for CredentialPairResolver {
    fn resolve_all(&self, authorization: Option<&str>) -> Result<Vec<CredentialSet>> {
        let mut pairs = authorization
            .and_then(extract_bearer)
            .map(parse_credential_pairs)
            .unwrap_or_default();

        if !pairs.is_empty() {
            pairs.shuffle(&mut rand::thread_rng());
            tracing::debug!(
                count = pairs.len(),
                first = %pairs[0].masked_access_key(),
                "Resolved credentials from Authorization header"
            );
            return Ok(pairs);
        }

        match &self.defaults {
            Some(defaults) => Ok(vec![defaults.credential_set()]),
            None => Err(AppError::Unauthenticated(
                "Missing or malformed credentials; expected 'Authorization: Bearer <access_key>@<secret_key>'"
                    .to_string(),
            )),
        }
    }
}

/// Bearer token is an opaque API key; backend calls use the default credentials.
pub struct ApiKeyResolver {
    key_hashes: HashSet<String>,
    defaults: Option<DefaultCredentials>,
}

impl ApiKeyResolver {
    pub fn new(api_keys: &[String], defaults: Option<DefaultCredentials>) -> Self {
        Self {
            key_hashes: api_keys.iter().map(|k| hash_key(k)).collect(),
            defaults,
        }
    }
}

impl CredentialResolver for ApiKeyResolver {
    fn resolve_all(&self, authorization: Option<&str>) -> Result<Vec<CredentialSet>> {
        let key = authorization
            .and_then(extract_bearer)
            .ok_or_else(|| AppError::Unauthenticated("Missing API key".to_string()))?;

        if !self.key_hashes.contains(&hash_key(key)) {
            tracing::warn!(key = %mask_key(key), "Rejected unknown API key");
            return Err(AppError::Unauthenticated("Invalid API key".to_string()));
        }

        match &self.defaults {
            Some(defaults) => Ok(vec![defaults.credential_set()]),
            None => Err(AppError::Unauthenticated(
                "No backend credentials configured for API key access".to_string(),
            )),
        }
    }
}

/// Build the resolver for the configured deployment mode.
pub fn resolver_for(config: &AuthConfig) -> Arc<dyn CredentialResolver> {
    let defaults = DefaultCredentials::from_config(config);
    match config.mode {
        AuthMode::CredentialPair => Arc::new(CredentialPairResolver::new(defaults)),
        AuthMode::ApiKey => Arc::new(ApiKeyResolver::new(&config.api_keys, defaults)),
    }
}
