//! Canonical forms shared by the signers and the URL builder.
//!
//! ```text
//! HTTPRequestMethod\n
//! CanonicalURI\n
//! CanonicalQueryString\n
//! CanonicalHeaders\n
//! SignedHeaders\n
//! HashedPayload
//! ```

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use sha2::{Digest, Sha256};

use super::request::PreparedRequest;

type HmacSha256 = Hmac<Sha256>;

/// Unreserved characters (`A-Z a-z 0-9 - _ . ~`) stay as is, everything else is encoded.
pub const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Same as [`URI_ENCODE_SET`] but keeps `/` path separators.
pub const PATH_ENCODE_SET: &AsciiSet = &URI_ENCODE_SET.remove(b'/');

/// Headers never included in a V4 signature.
const IGNORED_HEADERS: [&str; 3] = ["accept-encoding", "authorization", "user-agent"];

/// Percent-encode a single URI component.
pub fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, URI_ENCODE_SET).to_string()
}

/// Percent-encode an object path, keeping `/` separators.
pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Encode query values sorted by key, spaces as `%20`.
pub fn query_encode(values: &BTreeMap<String, String>) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonical URI: the decoded path re-encoded with S3 path rules.
pub fn canonical_uri(url: &Url) -> String {
    let decoded = percent_decode_str(url.path()).decode_utf8_lossy();
    if decoded.is_empty() {
        return "/".to_string();
    }
    encode_path(&decoded)
}

/// Canonical query string: decoded pairs re-encoded and sorted.
pub fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Header name to joined, whitespace-collapsed values, `host` included.
fn signable_headers(req: &PreparedRequest) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for name in req.headers.keys() {
        let key = name.as_str();
        if key == "host" || IGNORED_HEADERS.contains(&key) {
            continue;
        }
        let joined = req
            .headers
            .get_all(name)
            .iter()
            .map(|v| trim_all(&String::from_utf8_lossy(v.as_bytes())))
            .collect::<Vec<_>>()
            .join(",");
        headers.insert(key.to_string(), joined);
    }
    headers.insert("host".to_string(), req.host());
    headers
}

/// Collapse runs of whitespace into a single space and trim both ends.
fn trim_all(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `name:value\n` for every signed header.
pub fn canonical_headers(req: &PreparedRequest) -> String {
    signable_headers(req)
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect()
}

/// Sorted header names joined with `;`.
pub fn signed_headers(req: &PreparedRequest) -> String {
    signable_headers(req)
        .keys()
        .cloned()
        .collect::<Vec<_>>()
        .join(";")
}

/// Build the canonical request for V4 signing.
pub fn canonical_request(req: &PreparedRequest, hashed_payload: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        req.method.as_str(),
        canonical_uri(&req.url),
        canonical_query(&req.url),
        canonical_headers(req),
        signed_headers(req),
        hashed_payload
    )
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
