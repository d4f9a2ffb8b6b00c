//! Per-call request descriptor.

use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::body::RequestBody;
use super::checksum::ChecksumType;
use super::endpoint::has_dot_segment;
use super::error::S3ClientError;
use crate::signer::TrailerMap;

/// Everything needed to build, sign and send one logical request.
///
/// `content_length == -1` means unknown and is sent with chunked transfer.
#[derive(Debug, Default)]
pub struct RequestMetadata {
    /// Build a presigned URL instead of a request to send.
    pub presign_url: bool,

    pub bucket_name: String,
    pub object_name: String,
    pub query_values: BTreeMap<String, String>,
    pub custom_header: HeaderMap,
    /// Extra headers covered by a V4 presigned URL.
    pub extra_presign_header: Option<HeaderMap>,
    /// Presign expiry in seconds.
    pub expires: i64,

    /// Region override; looked up when empty.
    pub bucket_location: String,
    pub content_body: RequestBody,
    pub content_length: i64,
    pub content_md5_base64: String,
    pub content_sha256_hex: String,
    /// Chunk-sign the body when the connection is not TLS.
    pub stream_sha256: bool,
    /// Send this checksum of the body as a trailer.
    pub add_crc: Option<ChecksumType>,
    pub trailer: Option<TrailerMap>,

    /// A 2xx response may still carry an `<Error>` document.
    pub expect_200_ok_with_error: bool,
}

impl RequestMetadata {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket.into(),
            object_name: object.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_values.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, S3ClientError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| S3ClientError::InvalidArgument(format!("header {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| S3ClientError::InvalidArgument(format!("header {name}: {e}")))?;
        self.custom_header.insert(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>, content_length: i64) -> Self {
        self.content_body = body.into();
        self.content_length = content_length;
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumType) -> Self {
        self.add_crc = Some(checksum);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.bucket_location = location.into();
        self
    }

    pub fn expect_200_ok_with_error(mut self) -> Self {
        self.expect_200_ok_with_error = true;
        self
    }

    /// Whether a trailer will be sent for this request.
    pub fn has_trailer(&self) -> bool {
        self.trailer.as_ref().is_some_and(|t| !t.is_empty())
            || (self.add_crc.is_some() && self.content_length > 0)
    }

    /// A precomputed SHA-256 cannot coexist with a trailer.
    pub fn validate(&self) -> Result<(), S3ClientError> {
        if has_dot_segment(&self.object_name) {
            return Err(S3ClientError::InvalidArgument(format!(
                "Object name '{}' contains a '.' or '..' path segment",
                self.object_name
            )));
        }
        if self.has_trailer() && !self.content_sha256_hex.is_empty() {
            return Err(S3ClientError::Internal(
                "contentSHA256Hex with trailer not supported".into(),
            ));
        }
        Ok(())
    }
}
