//! Error model for the S3 client.
//!
//! [`ErrorResponse`] is the structured service error parsed from a failed
//! exchange; [`S3ClientError`] is the error every public operation returns.

use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use super::credentials::CredentialsError;
use crate::post_policy::PolicyError;
use crate::signer::SignerError;

// ============================================================================
// Service error codes
// ============================================================================

pub const NO_SUCH_BUCKET: &str = "NoSuchBucket";
pub const NO_SUCH_KEY: &str = "NoSuchKey";
pub const ACCESS_DENIED: &str = "AccessDenied";
pub const CONFLICT: &str = "Conflict";
pub const PRECONDITION_FAILED: &str = "PreconditionFailed";
pub const AUTHORIZATION_HEADER_MALFORMED: &str = "AuthorizationHeaderMalformed";
pub const INVALID_REGION: &str = "InvalidRegion";
pub const NOT_IMPLEMENTED: &str = "NotImplemented";

/// Longest raw body kept as a message when the error body is not XML.
const MAX_RAW_MESSAGE: usize = 1024;

/// Structured error returned by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename = "Error")]
pub struct ErrorResponse {
    #[serde(rename = "Code", default)]
    pub code: String,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "BucketName", default)]
    pub bucket_name: String,
    #[serde(rename = "Key", default)]
    pub key: String,
    #[serde(rename = "Resource", default)]
    pub resource: String,
    #[serde(rename = "RequestId", default)]
    pub request_id: String,
    #[serde(rename = "HostId", default)]
    pub host_id: String,
    /// Region the bucket actually lives in, when the service reports it.
    #[serde(rename = "Region", default)]
    pub region: String,
    #[serde(skip)]
    pub server: String,
    #[serde(skip)]
    pub status_code: u16,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "Error response code {}.", self.code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ErrorResponse {}

impl ErrorResponse {
    /// Build the structured error for a response.
    ///
    /// Returns `None` for a 2xx response whose body is not an `<Error>` document.
    pub fn from_http(
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
        bucket_name: &str,
        object_name: &str,
    ) -> Option<ErrorResponse> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        let parsed = if is_error_document(body) {
            std::str::from_utf8(body)
                .ok()
                .and_then(|s| quick_xml::de::from_str::<ErrorResponse>(s).ok())
        } else {
            None
        };

        let mut err = match parsed {
            Some(err) => err,
            None if status.is_success() => return None,
            None => synthesize(status, body, bucket_name, object_name),
        };
        err.status_code = status.as_u16();
        err.server = header("server");

        let code = header("x-minio-error-code");
        if !code.is_empty() {
            err.code = code;
        }
        let desc = header("x-minio-error-desc");
        if !desc.is_empty() {
            err.message = desc.trim_matches('"').to_string();
        }
        if err.request_id.is_empty() {
            err.request_id = header("x-amz-request-id");
        }
        if err.host_id.is_empty() {
            err.host_id = header("x-amz-id-2");
        }
        if err.region.is_empty() {
            err.region = header("x-amz-bucket-region");
        }
        if err.code == INVALID_REGION && !err.region.is_empty() {
            err.message = format!("Region does not match, expecting region '{}'.", err.region);
        }
        Some(err)
    }
}

/// Synthesized error for bodies that do not parse.
fn synthesize(status: StatusCode, body: &[u8], bucket_name: &str, object_name: &str) -> ErrorResponse {
    let (code, message) = match status {
        StatusCode::NOT_FOUND if object_name.is_empty() => {
            (NO_SUCH_BUCKET.to_string(), "The specified bucket does not exist.".to_string())
        }
        StatusCode::NOT_FOUND => (NO_SUCH_KEY.to_string(), "The specified key does not exist.".to_string()),
        StatusCode::FORBIDDEN => (ACCESS_DENIED.to_string(), "Access Denied.".to_string()),
        StatusCode::CONFLICT => (CONFLICT.to_string(), "Bucket not empty.".to_string()),
        StatusCode::PRECONDITION_FAILED => (
            PRECONDITION_FAILED.to_string(),
            "At least one of the pre-conditions you specified did not hold".to_string(),
        ),
        _ => {
            let status_line = status.to_string();
            let message = if body.is_empty() {
                status_line.clone()
            } else {
                let text = String::from_utf8_lossy(body);
                if text.len() > MAX_RAW_MESSAGE {
                    let cut = (0..=MAX_RAW_MESSAGE)
                        .rev()
                        .find(|i| text.is_char_boundary(*i))
                        .unwrap_or(0);
                    format!("{}...", &text[..cut])
                } else {
                    text.into_owned()
                }
            };
            (status_line, message)
        }
    };
    ErrorResponse {
        code,
        message,
        bucket_name: bucket_name.to_string(),
        key: object_name.to_string(),
        ..Default::default()
    }
}

/// Whether the first element of `body` is `<Error>`.
fn is_error_document(body: &[u8]) -> bool {
    use quick_xml::events::Event;

    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let mut reader = quick_xml::Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => return e.name().as_ref() == b"Error",
            Ok(Event::Eof) | Err(_) => return false,
            Ok(_) => continue,
        }
    }
}

// ============================================================================
// Transport errors
// ============================================================================

/// Failure of the physical exchange.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Every message in the source chain, lower-cased.
    fn chain_text(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            text.push_str(": ");
            text.push_str(&err.to_string());
            source = err.source();
        }
        text.to_lowercase()
    }

    fn io_kind(&self) -> Option<std::io::ErrorKind> {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                return Some(io.kind());
            }
            source = err.source();
        }
        None
    }

    /// Timeouts and refused/reset connections, DNS failures, abrupt EOF.
    pub fn is_network_or_host_down(&self, expect_timeouts: bool) -> bool {
        use std::io::ErrorKind;

        if let TransportError::Http(e) = self {
            if e.is_timeout() {
                return !expect_timeouts;
            }
            if e.is_connect() {
                return true;
            }
        }
        if let Some(kind) = self.io_kind() {
            if kind == ErrorKind::TimedOut {
                return !expect_timeouts;
            }
            if is_network_kind(kind) {
                return true;
            }
        }
        let text = self.chain_text();
        [
            "connection closed by foreign host",
            "tls handshake timeout",
            "i/o timeout",
            "connection timed out",
            "connection refused",
            "connection reset",
            "broken pipe",
            "dns error",
            "failed to lookup address",
            "503 service unavailable",
        ]
        .iter()
        .any(|needle| text.contains(needle))
    }

    /// Certificate failures and HTTP/HTTPS mismatches never heal on retry.
    pub fn is_retryable(&self) -> bool {
        let text = self.chain_text();
        ![
            "certificate",
            "unknownissuer",
            "client sent an http request to an https server",
            "server gave http response to https client",
        ]
        .iter()
        .any(|needle| text.contains(needle))
    }
}

fn is_network_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;

    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

// ============================================================================
// Client errors
// ============================================================================

/// S3 client errors
#[derive(Error, Debug)]
pub enum S3ClientError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0} is offline.")]
    Offline(String),

    #[error("health check is already running")]
    HealthCheckRunning,

    #[error("health check duration should be at least 1 second")]
    HealthCheckInterval,

    #[error(transparent)]
    Response(#[from] ErrorResponse),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    /// Outcome of a coalesced credential fetch, shared by every waiter.
    #[error("Credential fetch failed: {0}")]
    CredentialFetch(Arc<S3ClientError>),

    #[error("Signing error: {0}")]
    Signing(#[from] SignerError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl S3ClientError {
    /// The structured service error, looking through shared credential failures.
    pub fn error_response(&self) -> Option<&ErrorResponse> {
        match self {
            S3ClientError::Response(e) => Some(e),
            S3ClientError::CredentialFetch(inner) => inner.error_response(),
            _ => None,
        }
    }

    /// Service error code, empty when there is none.
    pub fn code(&self) -> &str {
        self.error_response().map(|e| e.code.as_str()).unwrap_or("")
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, S3ClientError::Canceled | S3ClientError::DeadlineExceeded)
    }

    /// Whether this failure means the endpoint is unreachable.
    pub fn is_network_or_host_down(&self, expect_timeouts: bool) -> bool {
        match self {
            S3ClientError::Transport(e) => e.is_network_or_host_down(expect_timeouts),
            S3ClientError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => !expect_timeouts,
                kind => is_network_kind(kind),
            },
            S3ClientError::CredentialFetch(inner) => inner.is_network_or_host_down(expect_timeouts),
            _ => false,
        }
    }
}
