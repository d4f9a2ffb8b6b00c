//! Endpoint & URL-style resolution
//!
//! Pure functions that decide which host a request goes to and whether the
//! bucket is addressed as a subdomain (virtual-host style) or as the first
//! path segment (path style).
//!
//! # Host selection
//!
//! For the flagship provider the host is rewritten per request:
//!
//! | Condition | Host |
//! |-----------|------|
//! | accelerate endpoint set | accelerate endpoint |
//! | FIPS / PrivateLink endpoint | configured host, unchanged |
//! | session-tier regional endpoint | `s3express-control.<region>` or zonal host |
//! | otherwise | `s3[.dualstack].<region>.amazonaws.com[.cn]` |
//!
//! Every other provider keeps the configured host.

use std::collections::BTreeMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex_lite::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use super::error::S3ClientError;
use crate::signer::canonical::{encode_path, query_encode};

lazy_static! {
    static ref AMAZON_S3_HOST_HYPHEN: Regex = Regex::new(r"^s3-(.*?)\.amazonaws\.com$").unwrap();
    static ref AMAZON_S3_HOST_DUALSTACK: Regex =
        Regex::new(r"^s3\.dualstack\.(.*?)\.amazonaws\.com$").unwrap();
    static ref AMAZON_S3_HOST_FIPS: Regex = Regex::new(r"^s3-fips\.(.*?)\.amazonaws\.com$").unwrap();
    static ref AMAZON_S3_HOST_FIPS_DUALSTACK: Regex =
        Regex::new(r"^s3-fips\.dualstack\.(.*?)\.amazonaws\.com$").unwrap();
    static ref AMAZON_S3_HOST_DOT: Regex = Regex::new(r"^s3\.(.*?)\.amazonaws\.com$").unwrap();
    static ref AMAZON_S3_CHINA_HOST: Regex = Regex::new(r"^s3\.(cn.*?)\.amazonaws\.com\.cn$").unwrap();
    static ref AMAZON_S3_CHINA_HOST_DUALSTACK: Regex =
        Regex::new(r"^s3\.dualstack\.(cn.*?)\.amazonaws\.com\.cn$").unwrap();
    static ref ELB_AMAZON: Regex = Regex::new(r"elb(.*?)\.amazonaws\.com$").unwrap();
    static ref ELB_AMAZON_CN: Regex = Regex::new(r"elb(.*?)\.amazonaws\.com\.cn$").unwrap();
    static ref AMAZON_S3_HOST_PRIVATELINK: Regex =
        Regex::new(r"^(?:bucket|accesspoint)\.vpce-.*?\.s3\.(.*?)\.vpce\.amazonaws\.com$").unwrap();
    static ref AMAZON_S3_HOST_EXPRESS_CONTROL: Regex =
        Regex::new(r"^s3express-control\.(.*?)\.amazonaws\.com$").unwrap();
    static ref AMAZON_S3_HOST_EXPRESS: Regex =
        Regex::new(r"^s3express-[a-z0-9]{3,7}-az[1-6]?\.(.*?)\.amazonaws\.com$").unwrap();
    static ref VALID_BUCKET_NAME: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\.\-_:]{1,61}[A-Za-z0-9]$").unwrap();
    static ref IP_ADDRESS: Regex = Regex::new(r"^(\d+\.){3}\d+$").unwrap();
}

/// Suffix marking a session-tier ("directory") bucket.
const S3_EXPRESS_SUFFIX: &str = "--x-s3";

/// Default region when neither configuration nor the endpoint names one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// URL layout the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketLookup {
    /// Virtual-host style for known providers, path style otherwise.
    #[default]
    Auto,
    Dns,
    Path,
}

/// Caller-supplied lookup decision; `Auto` falls through to detection.
pub type LookupFn = Arc<dyn Fn(&Url, &str) -> BucketLookup + Send + Sync>;

// ============================================================================
// Endpoint classification
// ============================================================================

fn capture(re: &Regex, host: &str) -> Option<String> {
    re.captures(host)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Region encoded in a flagship-provider host name, empty when there is none.
pub fn region_from_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    if host == "s3-external-1.amazonaws.com" {
        return String::new();
    }
    // Load balancers hide the region.
    if ELB_AMAZON.is_match(host) || ELB_AMAZON_CN.is_match(host) {
        return String::new();
    }
    // FIPS dual-stack first so the non-greedy FIPS pattern does not swallow it.
    [
        &*AMAZON_S3_HOST_FIPS_DUALSTACK,
        &*AMAZON_S3_HOST_FIPS,
        &*AMAZON_S3_HOST_DUALSTACK,
        &*AMAZON_S3_HOST_HYPHEN,
        &*AMAZON_S3_CHINA_HOST_DUALSTACK,
        &*AMAZON_S3_CHINA_HOST,
        &*AMAZON_S3_HOST_DOT,
        &*AMAZON_S3_HOST_PRIVATELINK,
        &*AMAZON_S3_HOST_EXPRESS_CONTROL,
        &*AMAZON_S3_HOST_EXPRESS,
    ]
    .iter()
    .find_map(|re| capture(re, host))
    .unwrap_or_default()
}

pub fn is_amazon_endpoint(url: &Url) -> bool {
    let host = url.host_str().unwrap_or_default();
    if host == "s3.amazonaws.com" || host == "s3.cn-north-1.amazonaws.com.cn" {
        return true;
    }
    !region_from_url(url).is_empty()
}

pub fn is_amazon_fips_endpoint(url: &Url) -> bool {
    let host = url.host_str().unwrap_or_default();
    host.starts_with("s3-fips") && host.ends_with(".amazonaws.com")
}

pub fn is_amazon_privatelink_endpoint(url: &Url) -> bool {
    AMAZON_S3_HOST_PRIVATELINK.is_match(url.host_str().unwrap_or_default())
}

/// Session-tier regional control endpoint.
pub fn is_amazon_express_regional_endpoint(url: &Url) -> bool {
    AMAZON_S3_HOST_EXPRESS_CONTROL.is_match(url.host_str().unwrap_or_default())
}

pub fn is_google_endpoint(url: &Url) -> bool {
    url.host_str() == Some("storage.googleapis.com")
}

pub fn is_aliyun_oss_endpoint(url: &Url) -> bool {
    url.host_str().is_some_and(|h| h.ends_with("aliyuncs.com"))
}

pub fn is_s3_express_bucket(bucket: &str) -> bool {
    bucket.ends_with(S3_EXPRESS_SUFFIX)
}

/// Default detection for virtual-host style.
///
/// Dotted bucket names break wildcard certificates over TLS, so they always
/// use path style on secure endpoints.
pub fn is_virtual_host_supported(url: &Url, bucket: &str) -> bool {
    if url.scheme() == "https" && bucket.contains('.') {
        return false;
    }
    is_amazon_endpoint(url) || is_google_endpoint(url) || is_aliyun_oss_endpoint(url)
}

// ============================================================================
// Validation
// ============================================================================

/// Relaxed bucket-name check accepted by most S3-compatible servers.
pub fn check_valid_bucket_name(bucket: &str) -> Result<(), S3ClientError> {
    let invalid = |msg: &str| Err(S3ClientError::InvalidArgument(msg.to_string()));
    if bucket.trim().is_empty() {
        return invalid("Bucket name cannot be empty");
    }
    if bucket.len() < 3 {
        return invalid("Bucket name cannot be shorter than 3 characters");
    }
    if bucket.len() > 63 {
        return invalid("Bucket name cannot be longer than 63 characters");
    }
    if IP_ADDRESS.is_match(bucket) {
        return invalid("Bucket name cannot be an ip address");
    }
    if bucket.contains("..") || bucket.contains(".-") || bucket.contains("-.") {
        return invalid("Bucket name contains invalid characters");
    }
    if !VALID_BUCKET_NAME.is_match(bucket) {
        return invalid("Bucket name contains invalid characters");
    }
    Ok(())
}

fn is_valid_domain(host: &str) -> bool {
    if host.is_empty() || host.len() > 255 {
        return false;
    }
    if host.starts_with(['-', '.']) || host.ends_with(['-', '.']) {
        return false;
    }
    host.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Parse `host[:port]` into the endpoint URL for the given scheme.
pub fn endpoint_url(endpoint: &str, secure: bool) -> Result<Url, S3ClientError> {
    if endpoint.is_empty() {
        return Err(S3ClientError::InvalidArgument("Endpoint cannot be empty.".into()));
    }
    if endpoint.contains('/') {
        return Err(S3ClientError::InvalidArgument(
            "Endpoint url cannot have fully qualified paths.".into(),
        ));
    }
    let scheme = if secure { "https" } else { "http" };
    let url = Url::parse(&format!("{scheme}://{endpoint}"))
        .map_err(|e| S3ClientError::InvalidArgument(format!("Endpoint {endpoint}: {e}")))?;

    match url.host() {
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => Ok(url),
        Some(Host::Domain(domain)) if is_valid_domain(domain) => Ok(url),
        _ => Err(S3ClientError::InvalidArgument(format!(
            "Endpoint: {endpoint} does not follow ip address or domain name standards."
        ))),
    }
}

// ============================================================================
// Host construction
// ============================================================================

/// Regional flagship-provider host.
pub fn s3_endpoint(region: &str, dualstack: bool) -> String {
    let mut host = if dualstack {
        format!("s3.dualstack.{region}.amazonaws.com")
    } else {
        format!("s3.{region}.amazonaws.com")
    };
    if region.starts_with("cn-") {
        host.push_str(".cn");
    }
    host
}

/// Availability-zone id of a zonal session-tier bucket (`name--usw2-az1--x-s3`).
fn express_zone(bucket: &str) -> Option<&str> {
    let name = bucket.strip_suffix(S3_EXPRESS_SUFFIX)?;
    let (_, zone) = name.rsplit_once("--")?;
    (!zone.is_empty()).then_some(zone)
}

/// Session-tier host: the zonal endpoint for directory buckets, else the control endpoint.
pub fn s3_express_endpoint(region: &str, bucket: &str) -> String {
    match express_zone(bucket) {
        Some(zone) => format!("s3express-{zone}.{region}.amazonaws.com"),
        None => format!("s3express-control.{region}.amazonaws.com"),
    }
}

/// Region used when nothing more specific is known.
pub fn default_location(url: &Url, region_override: &str) -> String {
    if !region_override.is_empty() {
        return region_override.to_string();
    }
    let region = region_from_url(url);
    if region.is_empty() {
        DEFAULT_REGION.to_string()
    } else {
        region
    }
}

fn split_host_port(host: &str) -> Option<(&str, &str)> {
    if let Some(rest) = host.strip_prefix('[') {
        let (h, port) = rest.split_once("]:")?;
        return Some((h, port));
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') => Some((h, port)),
        _ => None,
    }
}

/// Strip the scheme's default port; IPv6 literals stay bracketed.
pub fn normalize_host(host: &str, scheme: &str) -> String {
    let Some((h, port)) = split_host_port(host) else {
        return host.to_string();
    };
    let default_port = (scheme == "http" && port == "80") || (scheme == "https" && port == "443");
    if !default_port {
        return host.to_string();
    }
    if h.contains(':') {
        format!("[{h}]")
    } else {
        h.to_string()
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Endpoint configuration fixed at client construction.
#[derive(Clone)]
pub struct EndpointResolver {
    url: Url,
    accelerate_endpoint: String,
    dualstack: bool,
    lookup: BucketLookup,
    lookup_fn: Option<LookupFn>,
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("url", &self.url.as_str())
            .field("accelerate_endpoint", &self.accelerate_endpoint)
            .field("dualstack", &self.dualstack)
            .field("lookup", &self.lookup)
            .field("lookup_fn", &self.lookup_fn.is_some())
            .finish()
    }
}

impl EndpointResolver {
    pub fn new(url: Url, lookup: BucketLookup, lookup_fn: Option<LookupFn>) -> Self {
        let dualstack = is_amazon_endpoint(&url);
        Self {
            url,
            accelerate_endpoint: String::new(),
            dualstack,
            lookup,
            lookup_fn,
        }
    }

    /// Only honoured for the flagship provider.
    pub fn with_accelerate_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        if is_amazon_endpoint(&self.url) {
            self.accelerate_endpoint = endpoint.into();
        }
        self
    }

    /// Only honoured for the flagship provider.
    pub fn with_dualstack(mut self, enabled: bool) -> Self {
        if is_amazon_endpoint(&self.url) {
            self.dualstack = enabled;
        }
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Virtual-host decision: lookup function, then policy, then detection.
    pub fn is_virtual_host_style(&self, bucket: &str) -> bool {
        if let Some(lookup_fn) = &self.lookup_fn {
            return match lookup_fn(&self.url, bucket) {
                BucketLookup::Dns => true,
                BucketLookup::Path => false,
                BucketLookup::Auto => is_virtual_host_supported(&self.url, bucket),
            };
        }
        if bucket.is_empty() {
            return false;
        }
        match self.lookup {
            BucketLookup::Dns => true,
            BucketLookup::Path => false,
            BucketLookup::Auto => is_virtual_host_supported(&self.url, bucket),
        }
    }

    /// Bucket creation never uses virtual-host style: the DNS name may not exist yet.
    pub fn use_virtual_host(&self, method: &Method, bucket: &str, object: &str, query_empty: bool) -> bool {
        let is_make_bucket = object.is_empty() && *method == Method::PUT && query_empty;
        !is_make_bucket && self.is_virtual_host_style(bucket)
    }

    fn target_host(&self, bucket: &str, location: &str) -> Result<String, S3ClientError> {
        let mut host = match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or_default(), port),
            None => self.url.host_str().unwrap_or_default().to_string(),
        };
        if !is_amazon_endpoint(&self.url) {
            return Ok(host);
        }

        if !self.accelerate_endpoint.is_empty() && !bucket.is_empty() {
            if bucket.contains('.') {
                return Err(S3ClientError::InvalidArgument(format!(
                    "The specified bucket '{bucket}' contains a period and cannot be used with transfer acceleration"
                )));
            }
            host = self.accelerate_endpoint.clone();
        } else if !is_amazon_fips_endpoint(&self.url) && !is_amazon_privatelink_endpoint(&self.url) {
            host = if is_amazon_express_regional_endpoint(&self.url) {
                s3_express_endpoint(location, bucket)
            } else {
                s3_endpoint(location, self.dualstack)
            };
        }
        Ok(host)
    }

    /// Absolute target URL for a bucket and object.
    ///
    /// URL parsing collapses `.` and `..` segments, so object names carrying
    /// them are refused rather than rewritten into another key.
    pub fn target_url(
        &self,
        bucket: &str,
        object: &str,
        location: &str,
        virtual_host: bool,
        query: &BTreeMap<String, String>,
    ) -> Result<Url, S3ClientError> {
        if has_dot_segment(object) {
            return Err(S3ClientError::InvalidArgument(format!(
                "Object name '{object}' contains a '.' or '..' path segment"
            )));
        }
        let scheme = self.url.scheme();
        let host = normalize_host(&self.target_host(bucket, location)?, scheme);

        let mut target = format!("{scheme}://{host}/");
        if !bucket.is_empty() {
            if virtual_host {
                target = format!("{scheme}://{bucket}.{host}/");
            } else {
                target.push_str(bucket);
                target.push('/');
            }
            if !object.is_empty() {
                target.push_str(&encode_path(object));
            }
        }
        if !query.is_empty() {
            target.push('?');
            target.push_str(&query_encode(query));
        }

        Url::parse(&target).map_err(|e| S3ClientError::InvalidArgument(format!("{target}: {e}")))
    }
}

/// Whether `object` has a `.` or `..` segment between slashes.
pub fn has_dot_segment(object: &str) -> bool {
    object.split('/').any(|segment| segment == "." || segment == "..")
}
