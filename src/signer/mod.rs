//! Request signing
//!
//! Stateless signing functions for S3 requests. Every function works on a
//! [`PreparedRequest`] and mutates its headers, URL or payload in place.
//!
//! # Protocols
//!
//! - **Anonymous** - no signature, optional unsigned trailer
//! - **Legacy** - AWS Signature Version 2 (HMAC-SHA1)
//! - **V4 header** - AWS Signature Version 4 `Authorization` header
//! - **V4 streaming** - chunk-signed `aws-chunked` payload
//! - **V4 presign** / **Legacy presign** - query-string signed URLs
//!
//! The protocol is chosen once per request by [`SigningProtocol::select`].

use std::sync::Arc;

use sha2::digest::DynDigest;
use thiserror::Error;

pub mod canonical;
pub mod request;
pub mod streaming;
pub mod v2;
pub mod v4;

pub use request::{ByteStream, Payload, PreparedRequest, TrailerMap};

/// Payload hash sentinel for unsigned bodies.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Payload hash sentinel for unsigned bodies followed by a trailer.
pub const UNSIGNED_PAYLOAD_TRAILER: &str = "STREAMING-UNSIGNED-PAYLOAD-TRAILER";

/// SHA-256 of the empty string, hex encoded.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Produces a fresh rolling hasher.
pub type HasherFactory = Arc<dyn Fn() -> Box<dyn DynDigest + Send> + Send + Sync>;

pub fn sha256_hasher() -> HasherFactory {
    Arc::new(|| Box::new(sha2::Sha256::default()) as Box<dyn DynDigest + Send>)
}

pub fn md5_hasher() -> HasherFactory {
    Arc::new(|| Box::new(md5::Md5::default()) as Box<dyn DynDigest + Send>)
}

/// Signing errors
#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Signature protocol advertised by a credentials provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureType {
    /// Provider has no preference; treated as V4.
    #[default]
    Default,
    V4,
    V2,
    V4Streaming,
    Anonymous,
}

impl SignatureType {
    pub fn is_v4(&self) -> bool {
        matches!(self, SignatureType::V4 | SignatureType::Default)
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, SignatureType::V2)
    }

    pub fn is_streaming_v4(&self) -> bool {
        matches!(self, SignatureType::V4Streaming)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, SignatureType::Anonymous)
    }
}

/// Service name used in the V4 credential scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    S3,
    /// Session-tier ("express") endpoints.
    S3Express,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::S3 => "s3",
            ServiceType::S3Express => "s3express",
        }
    }

    /// Header carrying the session token for this service.
    pub fn session_token_header(&self) -> &'static str {
        match self {
            ServiceType::S3 => "x-amz-security-token",
            ServiceType::S3Express => "x-amz-s3session-token",
        }
    }
}

/// Key material handed to the signing functions.
#[derive(Debug, Clone, Copy)]
pub struct SigningKeys<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: &'a str,
}

impl<'a> SigningKeys<'a> {
    pub fn new(access_key_id: &'a str, secret_access_key: &'a str, session_token: &'a str) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            session_token,
        }
    }

    /// Signing functions leave the request untouched when either key is empty.
    pub fn is_anonymous(&self) -> bool {
        self.access_key_id.is_empty() || self.secret_access_key.is_empty()
    }
}

/// Signing protocol applied to a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningProtocol {
    Anonymous,
    Legacy,
    LegacyPresign,
    V4Header,
    V4Streaming,
    V4Presign,
}

/// Request shape inputs to [`SigningProtocol::select`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestShape {
    pub presign: bool,
    pub stream_sha256: bool,
    pub content_length: i64,
    pub secure: bool,
}

impl SigningProtocol {
    /// Pick the protocol from the effective signature type and the request shape.
    ///
    /// Streaming signatures are only used for bodies of known, positive length
    /// over plain-text connections.
    pub fn select(signature: SignatureType, shape: RequestShape) -> Self {
        if signature.is_anonymous() {
            return SigningProtocol::Anonymous;
        }
        if shape.presign {
            return if signature.is_v2() {
                SigningProtocol::LegacyPresign
            } else {
                SigningProtocol::V4Presign
            };
        }
        if signature.is_v2() {
            return SigningProtocol::Legacy;
        }
        if shape.stream_sha256 && !shape.secure && shape.content_length > 0 {
            return SigningProtocol::V4Streaming;
        }
        SigningProtocol::V4Header
    }
}

/// Resolve the signature type for a request.
///
/// An override wins over the provider's preference, except that anonymous
/// credentials are never signed.
pub fn effective_signature(provider: SignatureType, override_type: SignatureType) -> SignatureType {
    if provider.is_anonymous() {
        return SignatureType::Anonymous;
    }
    if override_type != SignatureType::Default {
        return override_type;
    }
    provider
}
