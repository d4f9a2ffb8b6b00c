//! Credential providers
//!
//! Key material for request signing, fetched per request through a trait.
//!
//! # Design
//!
//! - [`CredentialsProvider`] is the single interface the client depends on
//! - A provider answers with key material plus the signature protocol it
//!   wants the request signed with
//!
//! # Implementations
//!
//! - `StaticCredentials` - Credentials from configuration
//! - `EnvironmentCredentials` - Credentials from environment variables,
//!   re-read on every fetch
//!
//! # Example
//!
//! ```
//! use mizuchi_s3::s3::{Context, CredentialsProvider, StaticCredentials};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = StaticCredentials::new("access-key", "secret-key");
//! let creds = provider.get(&Context::background()).await?;
//! assert_eq!(creds.access_key_id(), "access-key");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use thiserror::Error;

use super::context::Context;
use crate::signer::{SignatureType, SigningKeys};

/// Provider failures, surfaced to callers as `CredentialFetch`.
#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Credentials for request signing
///
/// Returned by [`CredentialsProvider`] implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    signature_type: SignatureType,
}

impl Credentials {
    /// Create new credentials
    ///
    /// Empty keys produce anonymous credentials.
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        let access_key_id = access_key_id.into();
        let secret_access_key = secret_access_key.into();
        let signature_type = if access_key_id.is_empty() || secret_access_key.is_empty() {
            SignatureType::Anonymous
        } else {
            SignatureType::Default
        };
        Self {
            access_key_id,
            secret_access_key,
            session_token: None,
            signature_type,
        }
    }

    /// Create credentials with session token (for temporary credentials)
    pub fn with_session_token(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        let token = session_token.into();
        let mut creds = Self::new(access_key_id, secret_access_key);
        creds.session_token = Some(token).filter(|t| !t.is_empty());
        creds
    }

    pub fn anonymous() -> Self {
        Self::new("", "")
    }

    /// Request a specific signature protocol; ignored for anonymous credentials.
    pub fn with_signature(mut self, signature_type: SignatureType) -> Self {
        if !self.signature_type.is_anonymous() {
            self.signature_type = signature_type;
        }
        self
    }

    /// Get the access key ID
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Get the secret access key
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    /// Get the session token (if any)
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn signature_type(&self) -> SignatureType {
        self.signature_type
    }

    /// Borrow the key material for the signing functions.
    pub fn signing_keys(&self) -> SigningKeys<'_> {
        SigningKeys::new(
            &self.access_key_id,
            &self.secret_access_key,
            self.session_token.as_deref().unwrap_or_default(),
        )
    }
}

/// Source of signing credentials
///
/// Implement this trait to plug in custom credential loading (IAM, STS, files).
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Fetch credentials, failing when none are available.
    async fn get(&self, ctx: &Context) -> Result<Credentials, CredentialsError>;
}

/// Static credentials provider
///
/// Holds credentials directly. Useful for testing or when credentials
/// come from configuration.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Create a new static credentials provider
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(access_key_id, secret_access_key),
        }
    }

    pub fn from_credentials(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Provider that never signs.
    pub fn anonymous() -> Self {
        Self::from_credentials(Credentials::anonymous())
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn get(&self, _ctx: &Context) -> Result<Credentials, CredentialsError> {
        Ok(self.credentials.clone())
    }
}

/// Environment credentials provider
///
/// Looks for:
/// - `AWS_ACCESS_KEY_ID` (or `AWS_ACCESS_KEY`)
/// - `AWS_SECRET_ACCESS_KEY` (or `AWS_SECRET_KEY`)
/// - `AWS_SESSION_TOKEN` (optional)
#[derive(Debug, Clone, Default)]
pub struct EnvironmentCredentials;

impl EnvironmentCredentials {
    pub fn new() -> Self {
        Self
    }

    fn var(names: &[&str]) -> Option<String> {
        names
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.is_empty())
    }
}

#[async_trait]
impl CredentialsProvider for EnvironmentCredentials {
    async fn get(&self, _ctx: &Context) -> Result<Credentials, CredentialsError> {
        let access_key = Self::var(&["AWS_ACCESS_KEY_ID", "AWS_ACCESS_KEY"]).ok_or_else(|| {
            CredentialsError::MissingCredentials("AWS_ACCESS_KEY_ID not set".into())
        })?;

        let secret_key = Self::var(&["AWS_SECRET_ACCESS_KEY", "AWS_SECRET_KEY"]).ok_or_else(|| {
            CredentialsError::MissingCredentials("AWS_SECRET_ACCESS_KEY not set".into())
        })?;

        Ok(match Self::var(&["AWS_SESSION_TOKEN"]) {
            Some(token) => Credentials::with_session_token(access_key, secret_key, token),
            None => Credentials::new(access_key, secret_key),
        })
    }
}
