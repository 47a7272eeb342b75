//! Configuration management for the Bedrock proxy.
//!
//! Configuration comes from environment variables (the deployment supplies
//! everything that way), optionally seeded from a YAML file with `${VAR}`
//! expansion. Environment variables always take precedence over the file.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;

/// How inbound bearer tokens are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Token is `access_key@secret_key` (optionally several joined by `|`).
    #[default]
    CredentialPair,
    /// Token is a deployment-issued API key; backend calls use the default credentials.
    ApiKey,
}

impl FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "credential-pair" | "credentials" | "pair" => Ok(AuthMode::CredentialPair),
            "api-key" | "apikey" => Ok(AuthMode::ApiKey),
            other => Err(anyhow::anyhow!("Unknown AUTH_MODE: {}", other)),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend (Bedrock) configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Namespace prefix prepended to model ids that lack it
    #[serde(default = "default_model_prefix")]
    pub model_prefix: String,

    /// Model catalog cache lifetime in seconds (0 disables caching)
    #[serde(default = "default_model_cache_ttl")]
    pub model_cache_ttl_secs: u64,

    /// Worker thread override (0 = auto)
    #[serde(default)]
    pub max_workers: usize,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Default AWS region for backend calls
    #[serde(default = "default_region")]
    pub region: String,

    /// Override for the runtime endpoint (converse / converse-stream)
    #[serde(default)]
    pub runtime_endpoint: Option<String>,

    /// Override for the control-plane endpoint (model listings)
    #[serde(default)]
    pub control_endpoint: Option<String>,

    /// Whether to verify SSL certificates for backend requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Bound for a complete non-streaming backend call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Bound for reading a single chunk of a streaming call
    #[serde(default = "default_stream_read_timeout")]
    pub stream_read_timeout_secs: u64,

    /// TCP connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,

    /// Accepted API keys in api-key mode
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Process-wide default AWS access key id
    #[serde(default)]
    pub default_access_key: Option<String>,

    /// Process-wide default AWS secret access key
    #[serde(default)]
    pub default_secret_key: Option<String>,

    /// Optional session token for temporary default credentials
    #[serde(default)]
    pub default_session_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            runtime_endpoint: None,
            control_endpoint: None,
            verify_ssl: default_verify_ssl(),
            request_timeout_secs: default_request_timeout(),
            stream_read_timeout_secs: default_stream_read_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backend: BackendConfig::default(),
            auth: AuthConfig::default(),
            model_prefix: default_model_prefix(),
            model_cache_ttl_secs: default_model_cache_ttl(),
            max_workers: 0,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    300
}

fn default_stream_read_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_model_prefix() -> String {
    "bedrock/converse/".to_string()
}

fn default_model_cache_ttl() -> u64 {
    60
}

impl AppConfig {
    /// Build configuration purely from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bedrock_proxy::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("proxy.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let expanded = expand_env_vars(&content);

        let mut config: AppConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Override fields with environment variables (env vars take precedence).
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(host) = env_non_empty("HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("PORT")? {
            self.server.port = port;
        }

        if let Some(region) = env_non_empty("AWS_REGION") {
            self.backend.region = region;
        }
        if let Some(endpoint) = env_non_empty("BEDROCK_RUNTIME_ENDPOINT") {
            self.backend.runtime_endpoint = Some(endpoint);
        }
        if let Some(endpoint) = env_non_empty("BEDROCK_ENDPOINT") {
            self.backend.control_endpoint = Some(endpoint);
        }
        if let Some(verify) = env_non_empty("VERIFY_SSL") {
            self.backend.verify_ssl = str_to_bool(&verify);
        }
        if let Some(secs) = env_parse::<u64>("REQUEST_TIMEOUT_SECS")? {
            self.backend.request_timeout_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("STREAM_READ_TIMEOUT_SECS")? {
            self.backend.stream_read_timeout_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("CONNECT_TIMEOUT_SECS")? {
            self.backend.connect_timeout_secs = secs;
        }

        if let Some(mode) = env_non_empty("AUTH_MODE") {
            self.auth.mode = mode.parse()?;
        }
        if let Some(keys) = env_non_empty("API_KEYS") {
            self.auth.api_keys = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        if let Some(key) = env_non_empty("AWS_ACCESS_KEY_ID") {
            self.auth.default_access_key = Some(key);
        }
        if let Some(secret) = env_non_empty("AWS_SECRET_ACCESS_KEY") {
            self.auth.default_secret_key = Some(secret);
        }
        if let Some(token) = env_non_empty("AWS_SESSION_TOKEN") {
            self.auth.default_session_token = Some(token);
        }

        if let Some(prefix) = env_non_empty("MODEL_PREFIX") {
            self.model_prefix = prefix;
        }
        if let Some(ttl) = env_parse::<u64>("MODEL_CACHE_TTL_SECS")? {
            self.model_cache_ttl_secs = ttl;
        }
        if let Some(workers) = env_parse::<usize>("MAX_WORKERS")? {
            self.max_workers = workers;
        }

        if self.auth.mode == AuthMode::ApiKey && self.auth.api_keys.is_empty() {
            return Err(anyhow::anyhow!("AUTH_MODE=api-key requires API_KEYS"));
        }

        Ok(())
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_non_empty(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", name, raw, e)),
        None => Ok(None),
    }
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    static ENV_PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r#"\$\{([^}:]+)(?::-?([^}]*))?\}"#).expect("valid env var pattern")
    });

    ENV_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MANAGED_VARS: &[&str] = &[
        "HOST",
        "PORT",
        "AWS_REGION",
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_SESSION_TOKEN",
        "AUTH_MODE",
        "API_KEYS",
        "REQUEST_TIMEOUT_SECS",
        "STREAM_READ_TIMEOUT_SECS",
        "CONNECT_TIMEOUT_SECS",
        "MODEL_PREFIX",
        "MODEL_CACHE_TTL_SECS",
        "MAX_WORKERS",
        "VERIFY_SSL",
        "BEDROCK_RUNTIME_ENDPOINT",
        "BEDROCK_ENDPOINT",
    ];

    fn clear_env() {
        for var in MANAGED_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("BP_TEST_VAR", "test_value");
        let output = expand_env_vars("region: ${BP_TEST_VAR}");
        assert_eq!(output, "region: test_value");
        std::env::remove_var("BP_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        std::env::remove_var("BP_MISSING_VAR");
        assert_eq!(
            expand_env_vars("region: ${BP_MISSING_VAR:-eu-west-1}"),
            "region: eu-west-1"
        );
        assert_eq!(
            expand_env_vars("region: ${BP_MISSING_VAR:eu-west-1}"),
            "region: eu-west-1"
        );
        assert_eq!(expand_env_vars("region: ${BP_MISSING_VAR:-}"), "region: ");
    }

    #[test]
    fn test_str_to_bool() {
        assert!(str_to_bool("true"));
        assert!(str_to_bool("YES"));
        assert!(str_to_bool("1"));
        assert!(str_to_bool("On"));
        assert!(!str_to_bool("false"));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool(""));
    }

    #[test]
    fn test_auth_mode_parse() {
        assert_eq!(
            "credential-pair".parse::<AuthMode>().unwrap(),
            AuthMode::CredentialPair
        );
        assert_eq!("API_KEY".parse::<AuthMode>().unwrap(), AuthMode::ApiKey);
        assert!("oauth".parse::<AuthMode>().is_err());
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.backend.region, "us-west-2");
        assert_eq!(config.backend.request_timeout_secs, 300);
        assert_eq!(config.model_prefix, "bedrock/converse/");
        assert_eq!(config.auth.mode, AuthMode::CredentialPair);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        std::env::set_var("PORT", "9090");
        std::env::set_var("AWS_REGION", "eu-central-1");
        std::env::set_var("AWS_ACCESS_KEY_ID", "AKIADEFAULT");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "defaultsecret");
        std::env::set_var("REQUEST_TIMEOUT_SECS", "45");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.backend.region, "eu-central-1");
        assert_eq!(config.backend.request_timeout_secs, 45);
        assert_eq!(config.auth.default_access_key.as_deref(), Some("AKIADEFAULT"));
        assert_eq!(
            config.auth.default_secret_key.as_deref(),
            Some("defaultsecret")
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_number() {
        clear_env();
        std::env::set_var("PORT", "not-a-port");
        assert!(AppConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_api_key_mode_requires_keys() {
        clear_env();
        std::env::set_var("AUTH_MODE", "api-key");
        assert!(AppConfig::from_env().is_err());

        std::env::set_var("API_KEYS", "sk-one, sk-two,");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.auth.mode, AuthMode::ApiKey);
        assert_eq!(config.auth.api_keys, vec!["sk-one", "sk-two"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_config_from_file() {
        clear_env();
        std::env::set_var("BP_TEST_SECRET", "file-secret");

        let mut temp_file = NamedTempFile::new().unwrap();
        let config_content = r#"
server:
  host: 127.0.0.1
  port: 8181

backend:
  region: ap-southeast-2
  request_timeout_secs: 30
  verify_ssl: false

auth:
  mode: credential-pair
  default_access_key: AKIAFILE
  default_secret_key: ${BP_TEST_SECRET}

model_cache_ttl_secs: 5
"#;
        temp_file.write_all(config_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8181);
        assert_eq!(config.backend.region, "ap-southeast-2");
        assert_eq!(config.backend.request_timeout_secs, 30);
        assert!(!config.backend.verify_ssl);
        assert_eq!(config.auth.default_secret_key.as_deref(), Some("file-secret"));
        assert_eq!(config.model_cache_ttl_secs, 5);
        assert_eq!(config.model_prefix, "bedrock/converse/");

        std::env::remove_var("BP_TEST_SECRET");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        std::env::set_var("PORT", "9999");
        std::env::set_var("VERIFY_SSL", "false");

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"server:\n  host: 127.0.0.1\n  port: 8080\n")
            .unwrap();
        temp_file.flush().unwrap();

        let config = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9999);
        assert!(!config.backend.verify_ssl);
        clear_env();
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(AppConfig::load("nonexistent_file.yaml").is_err());
    }
}
