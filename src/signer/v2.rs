//! AWS Signature Version 2
//!
//! ```text
//! Authorization = "AWS" + " " + AccessKeyId + ":" + Signature
//! Signature = Base64(HMAC-SHA1(SecretKey, StringToSign))
//!
//! StringToSign = HTTP-Verb + "\n" +
//!     Content-MD5 + "\n" +
//!     Content-Type + "\n" +
//!     Date + "\n" +
//!     CanonicalizedAmzHeaders +
//!     CanonicalizedResource
//! ```
//!
//! Presigned URLs replace `Date` with the absolute `Expires` epoch.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use sha1::Sha1;

use super::canonical::{encode_path, query_encode};
use super::request::PreparedRequest;
use super::{SignerError, SigningKeys};

type HmacSha1 = Hmac<Sha1>;

const SIGN_V2_ALGORITHM: &str = "AWS";

/// RFC 7231 date used for the `Date` header.
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Sub-resources that take part in the canonical resource, sorted.
const RESOURCE_LIST: [&str; 30] = [
    "acl",
    "cors",
    "delete",
    "encryption",
    "legal-hold",
    "lifecycle",
    "location",
    "logging",
    "notification",
    "partNumber",
    "policy",
    "replication",
    "requestPayment",
    "response-cache-control",
    "response-content-disposition",
    "response-content-encoding",
    "response-content-language",
    "response-content-type",
    "response-expires",
    "retention",
    "select",
    "select-type",
    "tagging",
    "torrent",
    "uploadId",
    "uploads",
    "versionId",
    "versioning",
    "versions",
    "website",
];

fn compute_signature(secret: &str, string_to_sign: &str) -> String {
    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(string_to_sign.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Signature of a base64 POST policy document.
pub fn post_presign_signature_v2(policy_base64: &str, secret: &str) -> String {
    compute_signature(secret, policy_base64)
}

/// Sign with an `Authorization: AWS <key>:<sig>` header.
///
/// Sets `Date` when the request does not carry one.
pub fn sign_v2(
    req: &mut PreparedRequest,
    keys: SigningKeys<'_>,
    virtual_host: bool,
    t: DateTime<Utc>,
) -> Result<(), SignerError> {
    if keys.is_anonymous() {
        return Ok(());
    }
    if req.header("date").map_or(true, str::is_empty) {
        req.set_header("date", &t.format(HTTP_DATE_FORMAT).to_string())?;
    }

    let to_sign = string_to_sign_v2(req, virtual_host);
    let sig = compute_signature(keys.secret_access_key, &to_sign);
    req.set_header(
        "authorization",
        &format!("{} {}:{}", SIGN_V2_ALGORITHM, keys.access_key_id, sig),
    )
}

/// Presign by adding `AWSAccessKeyId`, `Expires` and `Signature` query parameters.
pub fn presign_v2(
    req: &mut PreparedRequest,
    keys: SigningKeys<'_>,
    expires: i64,
    virtual_host: bool,
    t: DateTime<Utc>,
) -> Result<(), SignerError> {
    if keys.is_anonymous() {
        return Ok(());
    }
    let epoch_expires = t.timestamp() + expires;
    if req.header("expires").map_or(true, str::is_empty) {
        req.set_header("expires", &epoch_expires.to_string())?;
    }

    let to_sign = pre_string_to_sign_v2(req, virtual_host);
    let sig = compute_signature(keys.secret_access_key, &to_sign);

    let mut query: BTreeMap<String, String> = req
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let access_param = if req.host().contains(".storage.googleapis.com") {
        "GoogleAccessId"
    } else {
        "AWSAccessKeyId"
    };
    query.insert(access_param.into(), keys.access_key_id.into());
    query.insert("Expires".into(), epoch_expires.to_string());

    let encoded = format!("{}&Signature={}", query_encode(&query), encode_path(&sig));
    req.url.set_query(Some(&encoded));
    req.headers.remove("expires");
    Ok(())
}

fn string_to_sign_v2(req: &PreparedRequest, virtual_host: bool) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}{}",
        req.method.as_str(),
        req.header("content-md5").unwrap_or_default(),
        req.header("content-type").unwrap_or_default(),
        req.header("date").unwrap_or_default(),
        canonicalized_amz_headers(req),
        canonicalized_resource(req, virtual_host)
    )
}

fn pre_string_to_sign_v2(req: &PreparedRequest, virtual_host: bool) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}{}",
        req.method.as_str(),
        req.header("content-md5").unwrap_or_default(),
        req.header("content-type").unwrap_or_default(),
        req.header("expires").unwrap_or_default(),
        canonicalized_amz_headers(req),
        canonicalized_resource(req, virtual_host)
    )
}

/// `x-amz-*` headers, lower-cased and sorted, one `name:v1,v2\n` per header.
fn canonicalized_amz_headers(req: &PreparedRequest) -> String {
    let mut amz: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in req.headers.iter() {
        if name.as_str().starts_with("x-amz-") {
            amz.entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).trim().to_string());
        }
    }
    amz.iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.join(",")))
        .collect()
}

/// `/<bucket>/<key>` plus recognised sub-resources.
fn canonicalized_resource(req: &PreparedRequest, virtual_host: bool) -> String {
    let path = percent_decode_str(req.url.path()).decode_utf8_lossy().to_string();
    let mut resource = String::new();
    if virtual_host {
        let host = req.host();
        if let Some((bucket, _)) = host.split_once('.') {
            resource.push('/');
            resource.push_str(bucket);
        }
    }
    resource.push_str(&encode_path(&path));

    let pairs: Vec<(String, String)> = req
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut sub_resources = Vec::new();
    for name in RESOURCE_LIST {
        for (k, v) in pairs.iter().filter(|(k, _)| k == name) {
            if v.is_empty() {
                sub_resources.push(k.clone());
            } else {
                sub_resources.push(format!("{k}={v}"));
            }
        }
    }
    if !sub_resources.is_empty() {
        resource.push('?');
        resource.push_str(&sub_resources.join("&"));
    }
    resource
}
