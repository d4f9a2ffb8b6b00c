//! Browser upload policies
//!
//! [`PostPolicy`] accumulates the conditions of an S3 POST policy document
//! together with the form fields a browser must submit alongside the file.
//! The document serializes to JSON with the length range as the last
//! condition; its base64 form is the `policy` form field.
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::{Duration, Utc};
//! use mizuchi_s3::post_policy::PostPolicy;
//!
//! # fn example() -> Result<(), mizuchi_s3::post_policy::PolicyError> {
//! let mut policy = PostPolicy::new();
//! policy.set_expires(Utc::now() + Duration::hours(1));
//! policy.set_bucket("mymusic")?;
//! policy.set_key_starts_with("uploads/")?;
//! policy.set_content_length_range(0, 10 * 1024 * 1024)?;
//! println!("{}", policy.to_json());
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::s3::ChecksumType;

/// Timestamp layout of the `expiration` field.
pub const EXPIRATION_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

const CHECKSUM_ALGORITHM_FIELD: &str = "x-amz-checksum-algorithm";

const MAX_TAGS: usize = 10;
const MAX_TAG_KEY_LENGTH: usize = 128;
const MAX_TAG_VALUE_LENGTH: usize = 256;

/// Post-policy errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid tagging: {0}")]
    InvalidTagging(String),
}

fn invalid(msg: &str) -> PolicyError {
    PolicyError::InvalidArgument(msg.to_string())
}

/// How a form field is compared against its policy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    StartsWith,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "eq",
            MatchType::StartsWith => "starts-with",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PolicyCondition {
    match_type: MatchType,
    /// Form field name prefixed with `$`.
    condition: String,
    value: String,
}

/// Server-side encryption requested for a browser upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSideEncryption {
    /// SSE-S3, keys managed by the service.
    S3,
    /// SSE-KMS with an optional encryption context.
    Kms {
        key_id: String,
        context: Option<BTreeMap<String, String>>,
    },
    /// SSE-C with a 256-bit customer key.
    Customer { key: [u8; 32] },
}

impl ServerSideEncryption {
    /// Header fields carrying this encryption request.
    fn fields(&self) -> Result<Vec<(&'static str, String)>, PolicyError> {
        let fields = match self {
            ServerSideEncryption::S3 => {
                vec![("X-Amz-Server-Side-Encryption", "AES256".to_string())]
            }
            ServerSideEncryption::Kms { key_id, context } => {
                let mut fields = vec![("X-Amz-Server-Side-Encryption", "aws:kms".to_string())];
                if !key_id.is_empty() {
                    fields.push(("X-Amz-Server-Side-Encryption-Aws-Kms-Key-Id", key_id.clone()));
                }
                if let Some(context) = context {
                    let encoded = serde_json::to_string(context)
                        .map_err(|e| PolicyError::InvalidArgument(e.to_string()))?;
                    fields.push((
                        "X-Amz-Server-Side-Encryption-Context",
                        STANDARD.encode(encoded),
                    ));
                }
                fields
            }
            ServerSideEncryption::Customer { key } => vec![
                (
                    "X-Amz-Server-Side-Encryption-Customer-Algorithm",
                    "AES256".to_string(),
                ),
                ("X-Amz-Server-Side-Encryption-Customer-Key", STANDARD.encode(key)),
                (
                    "X-Amz-Server-Side-Encryption-Customer-Key-Md5",
                    STANDARD.encode(Md5::digest(key)),
                ),
            ],
        };
        Ok(fields)
    }
}

#[derive(Deserialize)]
struct Tagging {
    #[serde(rename = "TagSet")]
    tag_set: TagSet,
}

#[derive(Deserialize)]
struct TagSet {
    #[serde(rename = "Tag", default)]
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
struct Tag {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value", default)]
    value: String,
}

fn validate_tagging(xml: &str) -> Result<(), PolicyError> {
    if !xml.trim_start().starts_with("<Tagging") && !xml.trim_start().starts_with("<?xml") {
        return Err(PolicyError::InvalidTagging("root element must be Tagging".into()));
    }
    let tagging: Tagging =
        quick_xml::de::from_str(xml).map_err(|e| PolicyError::InvalidTagging(e.to_string()))?;
    let tags = tagging.tag_set.tags;
    if tags.len() > MAX_TAGS {
        return Err(PolicyError::InvalidTagging(format!(
            "at most {MAX_TAGS} tags are allowed"
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for tag in &tags {
        if tag.key.is_empty() || tag.key.chars().count() > MAX_TAG_KEY_LENGTH {
            return Err(PolicyError::InvalidTagging(format!("invalid tag key {:?}", tag.key)));
        }
        if tag.value.chars().count() > MAX_TAG_VALUE_LENGTH {
            return Err(PolicyError::InvalidTagging(format!(
                "value of tag {:?} is too long",
                tag.key
            )));
        }
        if !seen.insert(tag.key.as_str()) {
            return Err(PolicyError::InvalidTagging(format!("duplicate tag key {:?}", tag.key)));
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PolicyDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    expiration: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<Value>,
}

/// An S3 POST policy and the form fields that satisfy it.
#[derive(Debug, Clone, Default)]
pub struct PostPolicy {
    expiration: Option<DateTime<Utc>>,
    conditions: Vec<PolicyCondition>,
    content_length_range: (i64, i64),
    form_data: BTreeMap<String, String>,
}

impl PostPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_expires(&mut self, t: DateTime<Utc>) {
        self.expiration = Some(t);
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// Bucket set through [`PostPolicy::set_bucket`].
    pub fn bucket(&self) -> Option<&str> {
        self.form_data.get("bucket").map(String::as_str)
    }

    /// Form fields to submit with the upload.
    pub fn form_data(&self) -> &BTreeMap<String, String> {
        &self.form_data
    }

    pub fn set_key(&mut self, key: &str) -> Result<(), PolicyError> {
        if key.trim().is_empty() {
            return Err(invalid("Object name is empty."));
        }
        self.add_field(MatchType::Exact, "key", key)
    }

    /// An empty prefix admits any key.
    pub fn set_key_starts_with(&mut self, prefix: &str) -> Result<(), PolicyError> {
        self.add_field(MatchType::StartsWith, "key", prefix)
    }

    pub fn set_bucket(&mut self, bucket: &str) -> Result<(), PolicyError> {
        if bucket.trim().is_empty() {
            return Err(invalid("Bucket name is empty."));
        }
        self.add_field(MatchType::Exact, "bucket", bucket)
    }

    /// Exact-match condition on one of the signature fields.
    pub fn set_condition(&mut self, condition: &str, value: &str) -> Result<(), PolicyError> {
        if value.trim().is_empty() {
            return Err(invalid("No value specified for condition"));
        }
        match condition {
            "X-Amz-Credential" | "X-Amz-Date" | "X-Amz-Algorithm" => {
                self.add_field(MatchType::Exact, condition, value)
            }
            _ => Err(invalid("Invalid condition in policy")),
        }
    }

    /// `tagging` must be a `<Tagging>` XML document.
    pub fn set_tagging(&mut self, tagging: &str) -> Result<(), PolicyError> {
        if tagging.trim().is_empty() {
            return Err(invalid("No tagging specified."));
        }
        validate_tagging(tagging)?;
        self.add_field(MatchType::Exact, "tagging", tagging)
    }

    pub fn set_content_type(&mut self, content_type: &str) -> Result<(), PolicyError> {
        if content_type.trim().is_empty() {
            return Err(invalid("No content type specified."));
        }
        self.add_field(MatchType::Exact, "Content-Type", content_type)
    }

    pub fn set_content_type_starts_with(&mut self, prefix: &str) -> Result<(), PolicyError> {
        self.add_field(MatchType::StartsWith, "Content-Type", prefix)
    }

    pub fn set_content_disposition(&mut self, disposition: &str) -> Result<(), PolicyError> {
        if disposition.trim().is_empty() {
            return Err(invalid("No content disposition specified."));
        }
        self.add_field(MatchType::Exact, "Content-Disposition", disposition)
    }

    pub fn set_content_encoding(&mut self, encoding: &str) -> Result<(), PolicyError> {
        if encoding.trim().is_empty() {
            return Err(invalid("No content encoding specified."));
        }
        self.add_field(MatchType::Exact, "Content-Encoding", encoding)
    }

    /// Inclusive bounds on the upload size in bytes.
    pub fn set_content_length_range(&mut self, min: i64, max: i64) -> Result<(), PolicyError> {
        if min > max {
            return Err(invalid("Minimum limit is larger than maximum limit."));
        }
        if min < 0 {
            return Err(invalid("Minimum limit cannot be negative."));
        }
        if max <= 0 {
            return Err(invalid("Maximum limit cannot be non-positive."));
        }
        self.content_length_range = (min, max);
        Ok(())
    }

    pub fn set_success_action_redirect(&mut self, redirect: &str) -> Result<(), PolicyError> {
        if redirect.trim().is_empty() {
            return Err(invalid("Redirect is empty"));
        }
        self.add_field(MatchType::Exact, "success_action_redirect", redirect)
    }

    pub fn set_success_status_action(&mut self, status: &str) -> Result<(), PolicyError> {
        if status.trim().is_empty() {
            return Err(invalid("Status is empty"));
        }
        self.add_field(MatchType::Exact, "success_action_status", status)
    }

    /// `x-amz-meta-<key>` must equal `value`.
    pub fn set_user_metadata(&mut self, key: &str, value: &str) -> Result<(), PolicyError> {
        if key.trim().is_empty() {
            return Err(invalid("Key is empty"));
        }
        if value.trim().is_empty() {
            return Err(invalid("Value is empty"));
        }
        self.add_field(MatchType::Exact, &format!("x-amz-meta-{key}"), value)
    }

    pub fn set_user_metadata_starts_with(&mut self, key: &str, value: &str) -> Result<(), PolicyError> {
        if key.trim().is_empty() {
            return Err(invalid("Key is empty"));
        }
        self.add_field(MatchType::StartsWith, &format!("x-amz-meta-{key}"), value)
    }

    /// `x-amz-<key>` must equal `value`.
    pub fn set_user_data(&mut self, key: &str, value: &str) -> Result<(), PolicyError> {
        if key.is_empty() {
            return Err(invalid("Key is empty"));
        }
        if value.is_empty() {
            return Err(invalid("Value is empty"));
        }
        self.add_field(MatchType::Exact, &format!("x-amz-{key}"), value)
    }

    /// Require the upload to carry the `kind` checksum of `content`.
    pub fn set_checksum(&mut self, kind: ChecksumType, content: &[u8]) -> Result<(), PolicyError> {
        let encoded = kind.encode(content);
        self.add_field(MatchType::Exact, CHECKSUM_ALGORITHM_FIELD, kind.name())?;
        self.add_field(MatchType::Exact, kind.key(), &encoded)
    }

    /// Encryption headers travel as form fields only; they add no condition.
    pub fn set_encryption(&mut self, sse: &ServerSideEncryption) -> Result<(), PolicyError> {
        for (name, value) in sse.fields()? {
            self.form_data.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Record a condition and the form field that satisfies it.
    fn add_field(&mut self, match_type: MatchType, field: &str, value: &str) -> Result<(), PolicyError> {
        self.add_condition(match_type, field, value)?;
        self.form_data.insert(field.to_string(), value.to_string());
        Ok(())
    }

    /// Only `starts-with` accepts an empty value, which admits anything.
    pub(crate) fn add_condition(
        &mut self,
        match_type: MatchType,
        field: &str,
        value: &str,
    ) -> Result<(), PolicyError> {
        if field.is_empty() {
            return Err(invalid("Policy fields are empty."));
        }
        if match_type != MatchType::StartsWith && value.is_empty() {
            return Err(invalid("Policy value is empty."));
        }
        self.conditions.push(PolicyCondition {
            match_type,
            condition: format!("${field}"),
            value: value.to_string(),
        });
        Ok(())
    }

    pub(crate) fn insert_form_field(&mut self, name: &str, value: impl Into<String>) {
        self.form_data.insert(name.to_string(), value.into());
    }

    /// The policy document as compact JSON.
    pub fn to_json(&self) -> String {
        let mut conditions: Vec<Value> = self
            .conditions
            .iter()
            .map(|c| json!([c.match_type.as_str(), c.condition, c.value]))
            .collect();
        let (min, max) = self.content_length_range;
        if min != 0 || max != 0 {
            conditions.push(json!(["content-length-range", min, max]));
        }
        let document = PolicyDocument {
            expiration: self
                .expiration
                .map(|t| t.format(EXPIRATION_DATE_FORMAT).to_string()),
            conditions,
        };
        serde_json::to_string(&document).unwrap_or_default()
    }

    /// Base64 of [`PostPolicy::to_json`], the `policy` form field.
    pub fn base64(&self) -> String {
        STANDARD.encode(self.to_json())
    }
}

impl std::fmt::Display for PostPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_json())
    }
}
