//! AWS Signature Version 4
//!
//! Header signing (optionally announcing an unsigned trailer) and
//! query-string presigning.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::canonical::{canonical_request, hmac_sha256, query_encode, sha256_hex, signed_headers};
use super::request::{PreparedRequest, TrailerMap};
use super::{streaming, ServiceType, SignerError, SigningKeys, UNSIGNED_PAYLOAD};

pub const SIGN_V4_ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// `X-Amz-Date` format.
pub const ISO8601_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Credential scope date format.
pub const YYYYMMDD: &str = "%Y%m%d";

/// Maximum presign expiry (seven days).
pub const MAX_PRESIGN_EXPIRY_SECONDS: i64 = 604_800;

/// `<date>/<region>/<service>/aws4_request`
pub fn credential_scope(t: DateTime<Utc>, region: &str, service: ServiceType) -> String {
    format!(
        "{}/{}/{}/aws4_request",
        t.format(YYYYMMDD),
        region,
        service.as_str()
    )
}

/// `<access key>/<scope>`
pub fn get_credential(
    access_key_id: &str,
    region: &str,
    t: DateTime<Utc>,
    service: ServiceType,
) -> String {
    format!(
        "{}/{}",
        access_key_id,
        credential_scope(t, region, service)
    )
}

/// Derive the signing key: `AWS4<secret>` chained through date, region, service, `aws4_request`.
pub fn signing_key(secret: &str, region: &str, t: DateTime<Utc>, service: ServiceType) -> Vec<u8> {
    let date = hmac_sha256(
        format!("AWS4{secret}").as_bytes(),
        t.format(YYYYMMDD).to_string().as_bytes(),
    );
    let location = hmac_sha256(&date, region.as_bytes());
    let service = hmac_sha256(&location, service.as_str().as_bytes());
    hmac_sha256(&service, b"aws4_request")
}

pub fn signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

pub fn string_to_sign(
    t: DateTime<Utc>,
    region: &str,
    canonical_request: &str,
    service: ServiceType,
) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        SIGN_V4_ALGORITHM,
        t.format(ISO8601_FORMAT),
        credential_scope(t, region, service),
        sha256_hex(canonical_request.as_bytes())
    )
}

/// Payload hash taken from `X-Amz-Content-Sha256`, unsigned when absent.
pub fn hashed_payload(req: &PreparedRequest) -> String {
    req.header("x-amz-content-sha256")
        .filter(|v| !v.is_empty())
        .unwrap_or(UNSIGNED_PAYLOAD)
        .to_string()
}

/// Sign the request in place and return the signature.
///
/// Adds `X-Amz-Date`, the session token header and `Authorization`. The
/// caller is expected to have set `X-Amz-Content-Sha256` beforehand.
pub(crate) fn sign_headers(
    req: &mut PreparedRequest,
    keys: SigningKeys<'_>,
    region: &str,
    service: ServiceType,
    t: DateTime<Utc>,
) -> Result<String, SignerError> {
    req.set_header("x-amz-date", &t.format(ISO8601_FORMAT).to_string())?;
    if !keys.session_token.is_empty() {
        req.set_header(service.session_token_header(), keys.session_token)?;
    }

    let canonical = canonical_request(req, &hashed_payload(req));
    let to_sign = string_to_sign(t, region, &canonical, service);
    let key = signing_key(keys.secret_access_key, region, t, service);
    let sig = signature(&key, &to_sign);

    let authorization = format!(
        "{} Credential={}, SignedHeaders={}, Signature={}",
        SIGN_V4_ALGORITHM,
        get_credential(keys.access_key_id, region, t, service),
        signed_headers(req),
        sig
    );
    req.set_header("authorization", &authorization)?;
    Ok(sig)
}

/// Sign with an `Authorization` header.
pub fn sign_v4(
    req: &mut PreparedRequest,
    keys: SigningKeys<'_>,
    region: &str,
    t: DateTime<Utc>,
) -> Result<(), SignerError> {
    sign_v4_trailer(req, keys, region, None, ServiceType::S3, t)
}

/// Sign with an `Authorization` header, announcing an unsigned trailer when given.
///
/// With a non-empty trailer the payload is re-framed as unsigned
/// `aws-chunked` so the trailer can follow the body.
pub fn sign_v4_trailer(
    req: &mut PreparedRequest,
    keys: SigningKeys<'_>,
    region: &str,
    trailer: Option<&TrailerMap>,
    service: ServiceType,
    t: DateTime<Utc>,
) -> Result<(), SignerError> {
    if keys.is_anonymous() {
        return Ok(());
    }

    let trailer = trailer.filter(|t| !t.is_empty());
    if let Some(trailer) = trailer {
        for name in trailer.names() {
            req.append_header("x-amz-trailer", &name)?;
        }
        req.set_header("content-encoding", "aws-chunked")?;
        let decoded = req.content_length.to_string();
        req.set_header("x-amz-decoded-content-length", &decoded)?;
    }

    sign_headers(req, keys, region, service, t)?;

    if let Some(trailer) = trailer {
        streaming::frame_unsigned(req, trailer.clone());
    }
    Ok(())
}

/// Presign by moving the signature into the query string.
///
/// `X-Amz-SignedHeaders` covers `host` plus whatever headers are already set.
pub fn presign_v4(
    req: &mut PreparedRequest,
    keys: SigningKeys<'_>,
    region: &str,
    expires: i64,
    t: DateTime<Utc>,
) -> Result<(), SignerError> {
    if keys.is_anonymous() {
        return Ok(());
    }

    let mut query: BTreeMap<String, String> = req
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    query.insert("X-Amz-Algorithm".into(), SIGN_V4_ALGORITHM.into());
    query.insert("X-Amz-Date".into(), t.format(ISO8601_FORMAT).to_string());
    query.insert("X-Amz-Expires".into(), expires.to_string());
    query.insert("X-Amz-SignedHeaders".into(), signed_headers(req));
    query.insert(
        "X-Amz-Credential".into(),
        get_credential(keys.access_key_id, region, t, ServiceType::S3),
    );
    if !keys.session_token.is_empty() {
        query.insert("X-Amz-Security-Token".into(), keys.session_token.into());
    }
    let encoded = query_encode(&query);
    req.url.set_query(Some(&encoded));

    let canonical = canonical_request(req, &hashed_payload(req));
    let to_sign = string_to_sign(t, region, &canonical, ServiceType::S3);
    let key = signing_key(keys.secret_access_key, region, t, ServiceType::S3);
    let sig = signature(&key, &to_sign);

    req.url
        .set_query(Some(&format!("{encoded}&X-Amz-Signature={sig}")));
    Ok(())
}

/// Sign a base64 POST policy document with the V4 signing key.
pub fn post_presign_signature_v4(
    policy_base64: &str,
    t: DateTime<Utc>,
    secret: &str,
    region: &str,
) -> String {
    let key = signing_key(secret, region, t, ServiceType::S3);
    signature(&key, policy_base64)
}
