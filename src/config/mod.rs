//! Configuration module for Mizuchi S3
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.
//!
//! # Example
//!
//! ```yaml
//! client:
//!   endpoint: "${S3_ENDPOINT:-localhost:9000}"
//!   secure: false
//!   bucket_lookup: path
//!   max_retries: 5
//! credentials:
//!   access_key: "${AWS_ACCESS_KEY_ID}"
//!   secret_key: "${AWS_SECRET_ACCESS_KEY}"
//! health_check:
//!   enabled: true
//!   interval_seconds: 5
//! logging:
//!   level: debug
//!   format: json
//! ```

use std::path::Path;
use std::sync::Arc;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::s3::{
    BucketLookup, ClientOptions, Credentials, CredentialsProvider, EnvironmentCredentials,
    StaticCredentials,
};
use crate::signer::SignatureType;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |cap: &regex_lite::Captures<'_>| {
            let var_name = &cap[1];
            match std::env::var(var_name) {
                Ok(val) => val,
                Err(_) => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    // No env var and no default. Keep the original placeholder.
                    None => cap[0].to_string(),
                },
            }
        })
        .into_owned()
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

fn deserialize_opt_with_env<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.map(|s| expand_env_vars(&s)).filter(|s| !s.is_empty()))
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSection,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.endpoint.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "client.endpoint cannot be empty".into(),
            ));
        }
        if self.client.endpoint.contains("://") {
            return Err(ConfigError::ValidationError(format!(
                "client.endpoint '{}' must be host[:port] without a scheme",
                self.client.endpoint
            )));
        }

        match (&self.credentials.access_key, &self.credentials.secret_key) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::ValidationError(
                    "credentials.access_key and credentials.secret_key must be set together".into(),
                ))
            }
            _ => {}
        }

        if self.health_check.enabled && self.health_check.interval_seconds < 1 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid health_check.interval_seconds {}: must be at least 1",
                self.health_check.interval_seconds
            )));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid logging format '{}': must be 'pretty' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Credentials provider described by the `credentials` section.
    pub fn credentials_provider(&self) -> Arc<dyn CredentialsProvider> {
        let creds = &self.credentials;
        let signature = creds.signature.into();
        if creds.signature == SignatureKind::Anonymous {
            return Arc::new(StaticCredentials::anonymous());
        }
        match (&creds.access_key, &creds.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = match &creds.session_token {
                    Some(token) => Credentials::with_session_token(access_key, secret_key, token),
                    None => Credentials::new(access_key, secret_key),
                };
                Arc::new(StaticCredentials::from_credentials(
                    credentials.with_signature(signature),
                ))
            }
            _ => Arc::new(EnvironmentCredentials::new()),
        }
    }

    /// Client options for [`crate::s3::Client::from_config`].
    pub fn client_options(&self) -> ClientOptions {
        let client = &self.client;
        ClientOptions {
            credentials: Some(self.credentials_provider()),
            secure: client.secure,
            region: client.region.clone(),
            bucket_lookup: client.bucket_lookup,
            trailing_headers: client.trailing_headers,
            max_retries: client.max_retries,
            app_name: client.app_name.clone().unwrap_or_default(),
            app_version: client.app_version.clone().unwrap_or_default(),
            accelerate_endpoint: client.accelerate_endpoint.clone().unwrap_or_default(),
            dualstack: client.dualstack,
            signature: self.credentials.signature.into(),
            ..Default::default()
        }
    }
}

/// Endpoint and request behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// `host[:port]`. Supports ${VAR} and ${VAR:-default} expansion.
    #[serde(deserialize_with = "deserialize_with_env")]
    pub endpoint: String,
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// Fixed region; discovered per bucket when empty.
    #[serde(default, deserialize_with = "deserialize_with_env")]
    pub region: String,
    #[serde(default)]
    pub bucket_lookup: BucketLookup,
    /// Attempts per request. 0 uses the built-in default.
    #[serde(default)]
    pub max_retries: usize,
    #[serde(default)]
    pub trailing_headers: bool,
    #[serde(default)]
    pub accelerate_endpoint: Option<String>,
    #[serde(default)]
    pub dualstack: Option<bool>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

fn default_secure() -> bool {
    true
}

/// Signature protocol requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    #[default]
    V4,
    V2,
    V4streaming,
    Anonymous,
}

impl From<SignatureKind> for SignatureType {
    fn from(kind: SignatureKind) -> Self {
        match kind {
            SignatureKind::V4 => SignatureType::V4,
            SignatureKind::V2 => SignatureType::V2,
            SignatureKind::V4streaming => SignatureType::V4Streaming,
            SignatureKind::Anonymous => SignatureType::Anonymous,
        }
    }
}

/// Static keys; the environment provider is used when both are absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default, deserialize_with = "deserialize_opt_with_env")]
    pub access_key: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_with_env")]
    pub secret_key: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_with_env")]
    pub session_token: Option<String>,
    #[serde(default)]
    pub signature: SignatureKind,
}

/// Endpoint health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_health_interval(),
        }
    }
}

fn default_health_interval() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive. Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json". Default: "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Result<ClientConfig, ConfigError> {
        ClientConfig::from_yaml(yaml)
    }

    #[test]
    fn test_defaults() {
        let config = config("client:\n  endpoint: localhost:9000\n").unwrap();
        assert!(config.client.secure);
        assert_eq!(config.client.bucket_lookup, BucketLookup::Auto);
        assert!(!config.health_check.enabled);
        assert_eq!(config.health_check.interval_seconds, 5);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.credentials.signature, SignatureKind::V4);
    }

    #[test]
    fn test_expand_env_vars_default() {
        assert_eq!(
            expand_env_vars("${MIZUCHI_S3_UNSET_VAR:-fallback}"),
            "fallback"
        );
        assert_eq!(
            expand_env_vars("${MIZUCHI_S3_UNSET_VAR}"),
            "${MIZUCHI_S3_UNSET_VAR}"
        );
    }

    #[test]
    fn test_config_validation_empty_endpoint() {
        assert!(matches!(
            config("client:\n  endpoint: \"\"\n"),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_config_validation_half_keys() {
        let yaml = "client:\n  endpoint: localhost:9000\ncredentials:\n  access_key: minio\n";
        assert!(matches!(config(yaml), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_config_validation_health_interval() {
        let yaml =
            "client:\n  endpoint: localhost:9000\nhealth_check:\n  enabled: true\n  interval_seconds: 0\n";
        assert!(matches!(config(yaml), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_client_options_mapping() {
        let yaml = r#"
client:
  endpoint: localhost:9000
  secure: false
  region: us-west-2
  bucket_lookup: path
  max_retries: 3
  app_name: tool
  app_version: "2.0"
credentials:
  access_key: minio
  secret_key: minio123
  signature: v2
"#;
        let opts = config(yaml).unwrap().client_options();
        assert!(!opts.secure);
        assert_eq!(opts.region, "us-west-2");
        assert_eq!(opts.bucket_lookup, BucketLookup::Path);
        assert_eq!(opts.max_retries, 3);
        assert_eq!(opts.app_name, "tool");
        assert_eq!(opts.signature, SignatureType::V2);
        assert!(opts.credentials.is_some());
    }
}
