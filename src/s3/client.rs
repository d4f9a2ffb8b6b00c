//! S3 client
//!
//! [`Client`] owns every piece of state shared between concurrent requests
//! and composes the lower layers into two operations:
//!
//! - [`Client::new_request`] resolves region, URL style and credentials and
//!   returns a signed [`PreparedRequest`] (or a presigned URL).
//! - [`Client::execute_method`] runs a request under the retry engine.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mizuchi_s3::s3::{Client, ClientOptions, Context, RequestMetadata, StaticCredentials};
//! use reqwest::Method;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(
//!     "play.min.io",
//!     ClientOptions {
//!         credentials: Some(Arc::new(StaticCredentials::new("minio", "minio123"))),
//!         secure: true,
//!         ..Default::default()
//!     },
//! )?;
//!
//! let ctx = Context::background();
//! let resp = client
//!     .execute_method(&ctx, Method::GET, RequestMetadata::new("my-bucket", "hello.txt"))
//!     .await?;
//! println!("{}", resp.text().await?);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use sha2::digest::DynDigest;
use tracing::{debug, warn};

use super::body::SharedBody;
use super::context::Context;
use super::credentials::{Credentials, CredentialsProvider, StaticCredentials};
use super::dedup::CredentialGate;
use super::endpoint::{
    check_valid_bucket_name, default_location, endpoint_url, is_amazon_endpoint,
    is_amazon_express_regional_endpoint, is_s3_express_bucket, region_from_url, BucketLookup,
    EndpointResolver, LookupFn, DEFAULT_REGION,
};
use super::error::{
    ErrorResponse, S3ClientError, ACCESS_DENIED, AUTHORIZATION_HEADER_MALFORMED, INVALID_REGION,
    NOT_IMPLEMENTED,
};
use super::health::{self, probe_bucket_name, HealthCheckHandle, HealthState, HealthStatus};
use super::region::RegionCache;
use super::request::RequestMetadata;
use super::retry::{
    is_http_status_retryable, is_request_error_retryable, is_s3_code_retryable, is_success_status,
    RetryTimer, SharedRng, MAX_ERROR_BODY_SIZE, MAX_RETRY,
};
use super::transport::{ReqwestTransport, S3Response, Transport};
use crate::config::ClientConfig;
use crate::metrics;
use crate::signer::streaming::{streaming_sign_v4, unsigned_trailer};
use crate::post_policy::{MatchType, PostPolicy};
use crate::signer::v2::{post_presign_signature_v2, presign_v2, sign_v2};
use crate::signer::v4::{
    get_credential, post_presign_signature_v4, presign_v4, sign_v4, sign_v4_trailer,
    ISO8601_FORMAT, MAX_PRESIGN_EXPIRY_SECONDS, SIGN_V4_ALGORITHM,
};
use crate::signer::{
    effective_signature, md5_hasher, sha256_hasher, HasherFactory, Payload, PreparedRequest,
    RequestShape, ServiceType, SignatureType, SigningKeys, SigningProtocol, EMPTY_SHA256,
    UNSIGNED_PAYLOAD, UNSIGNED_PAYLOAD_TRAILER,
};

const LIBRARY_NAME: &str = "mizuchi-s3";
const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");
const PRODUCT_NAME: &str = "MizuchiS3";

const SESSION_MODE_HEADER: &str = "x-amz-create-session-mode";
const SESSION_READ_WRITE: &str = "ReadWrite";

/// Region derived from the endpoint when none is configured.
pub type RegionFn = Arc<dyn Fn(&Url) -> String + Send + Sync>;

/// Construction options. Nothing here can change after [`Client::new`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Anonymous when unset.
    pub credentials: Option<Arc<dyn CredentialsProvider>>,
    pub secure: bool,
    /// [`ReqwestTransport`] when unset.
    pub transport: Option<Arc<dyn Transport>>,
    /// Fixed region; disables location discovery and region correction.
    pub region: String,
    pub bucket_lookup: BucketLookup,
    pub bucket_lookup_fn: Option<LookupFn>,
    pub custom_region_fn: Option<RegionFn>,
    /// Allow checksums to be sent as trailing headers (V4 only).
    pub trailing_headers: bool,
    pub custom_md5: Option<HasherFactory>,
    pub custom_sha256: Option<HasherFactory>,
    /// Attempts per request; 0 means [`MAX_RETRY`].
    pub max_retries: usize,
    pub app_name: String,
    pub app_version: String,
    pub accelerate_endpoint: String,
    pub dualstack: Option<bool>,
    /// Signature override; `Default` defers to the credentials.
    pub signature: SignatureType,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("credentials", &self.credentials.is_some())
            .field("secure", &self.secure)
            .field("transport", &self.transport.is_some())
            .field("region", &self.region)
            .field("bucket_lookup", &self.bucket_lookup)
            .field("trailing_headers", &self.trailing_headers)
            .field("max_retries", &self.max_retries)
            .field("app_name", &self.app_name)
            .field("app_version", &self.app_version)
            .field("accelerate_endpoint", &self.accelerate_endpoint)
            .field("dualstack", &self.dualstack)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Fresh hashers for a request body, chosen from the signing mode.
pub struct HashMaterials {
    pub md5: Option<Box<dyn DynDigest + Send>>,
    pub sha256: Option<Box<dyn DynDigest + Send>>,
}

struct ClientInner {
    endpoint: EndpointResolver,
    credentials: Arc<dyn CredentialsProvider>,
    override_signature: SignatureType,
    transport: Arc<dyn Transport>,
    region: String,
    region_cache: RegionCache,
    cred_gate: CredentialGate,
    rng: SharedRng,
    md5_hasher: HasherFactory,
    sha256_hasher: HasherFactory,
    trailing_header_support: bool,
    max_retries: usize,
    health: HealthState,
    user_agent: String,
}

/// S3 client handle. Clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .field("region", &self.inner.region)
            .field("override_signature", &self.inner.override_signature)
            .field("max_retries", &self.inner.max_retries)
            .field("health", &self.inner.health.status())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct LocationConstraint {
    #[serde(rename = "$text", default)]
    region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "CreateSessionResult")]
struct CreateSessionResult {
    #[serde(rename = "Credentials")]
    credentials: SessionCredentials,
}

#[derive(Debug, Deserialize)]
struct SessionCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken", default)]
    session_token: String,
}

fn user_agent(app_name: &str, app_version: &str) -> String {
    let base = format!(
        "{PRODUCT_NAME} ({}; {}) {LIBRARY_NAME}/{LIBRARY_VERSION}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if app_name.is_empty() || app_version.is_empty() {
        base
    } else {
        format!("{base} {app_name}/{app_version}")
    }
}

impl Client {
    /// Build a client for `endpoint` (`host[:port]`, no scheme or path).
    pub fn new(endpoint: &str, opts: ClientOptions) -> Result<Self, S3ClientError> {
        let url = endpoint_url(endpoint, opts.secure)?;

        let mut resolver = EndpointResolver::new(url.clone(), opts.bucket_lookup, opts.bucket_lookup_fn.clone());
        if let Some(dualstack) = opts.dualstack {
            resolver = resolver.with_dualstack(dualstack);
        }
        if !opts.accelerate_endpoint.is_empty() {
            resolver = resolver.with_accelerate_endpoint(opts.accelerate_endpoint.clone());
        }

        let override_signature = if is_amazon_endpoint(&url) {
            SignatureType::V4
        } else {
            opts.signature
        };

        let region = if !opts.region.is_empty() {
            opts.region.clone()
        } else if let Some(region_fn) = &opts.custom_region_fn {
            region_fn(&url)
        } else {
            region_from_url(&url)
        };

        let transport: Arc<dyn Transport> = match opts.transport.clone() {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let credentials: Arc<dyn CredentialsProvider> = match opts.credentials.clone() {
            Some(provider) => provider,
            None => Arc::new(StaticCredentials::anonymous()),
        };

        let inner = ClientInner {
            endpoint: resolver,
            credentials,
            override_signature,
            transport,
            region,
            region_cache: RegionCache::new(),
            cred_gate: CredentialGate::new(),
            rng: Arc::new(Mutex::new(StdRng::from_os_rng())),
            md5_hasher: opts.custom_md5.clone().unwrap_or_else(md5_hasher),
            sha256_hasher: opts.custom_sha256.clone().unwrap_or_else(sha256_hasher),
            trailing_header_support: opts.trailing_headers && override_signature.is_v4(),
            max_retries: if opts.max_retries > 0 {
                opts.max_retries
            } else {
                MAX_RETRY
            },
            health: HealthState::new(),
            user_agent: user_agent(&opts.app_name, &opts.app_version),
        };

        debug!(
            endpoint = %inner.endpoint.url(),
            region = %inner.region,
            max_retries = inner.max_retries,
            "S3 client created"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Build a client from the YAML configuration model.
    pub fn from_config(config: &ClientConfig) -> Result<Self, S3ClientError> {
        Self::new(&config.client.endpoint, config.client_options())
    }

    pub fn endpoint_url(&self) -> &Url {
        self.inner.endpoint.url()
    }

    /// Fixed region, empty when regions are discovered per bucket.
    pub fn region(&self) -> &str {
        &self.inner.region
    }

    pub fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }

    pub fn region_cache(&self) -> &RegionCache {
        &self.inner.region_cache
    }

    pub fn max_retries(&self) -> usize {
        self.inner.max_retries
    }

    pub fn trailing_header_support(&self) -> bool {
        self.inner.trailing_header_support
    }

    /// True unless the health monitor has the endpoint marked offline.
    pub fn is_online(&self) -> bool {
        self.inner.health.is_online()
    }

    pub fn is_offline(&self) -> bool {
        self.inner.health.is_offline()
    }

    pub fn health_status(&self) -> HealthStatus {
        self.inner.health.status()
    }

    /// Hashers a body upload should feed.
    ///
    /// MD5 is always computed over TLS (and for anonymous requests) so the
    /// server can verify integrity; SHA-256 is only used for plain V4.
    pub fn hash_materials(&self, md5_requested: bool, sha256_requested: bool) -> HashMaterials {
        let signature = self.inner.override_signature;
        let mut md5 = md5_requested;
        let mut sha256 = false;
        if signature.is_v4() {
            if self.inner.endpoint.is_secure() {
                md5 = true;
            } else {
                sha256 = sha256_requested;
            }
        } else if signature.is_anonymous() {
            md5 = true;
        }

        HashMaterials {
            md5: md5.then(|| (self.inner.md5_hasher)()),
            sha256: sha256.then(|| (self.inner.sha256_hasher)()),
        }
    }

    // ========================================================================
    // Region resolution
    // ========================================================================

    /// Region of `bucket`: the fixed region, the cached one, or a discovery call.
    pub async fn get_bucket_location(&self, ctx: &Context, bucket: &str) -> Result<String, S3ClientError> {
        check_valid_bucket_name(bucket)?;
        if !self.inner.region.is_empty() {
            return Ok(self.inner.region.clone());
        }
        self.inner
            .region_cache
            .get_or_discover(bucket, || self.discover_location(ctx, bucket))
            .await
    }

    /// One `GET ?location` exchange, outside the offline gate and retry engine.
    async fn discover_location(&self, ctx: &Context, bucket: &str) -> Result<String, S3ClientError> {
        let endpoint = self.inner.endpoint.url();
        let virtual_host = self.inner.endpoint.is_virtual_host_style(bucket);
        let url = if virtual_host {
            let host = match endpoint.port() {
                Some(port) => format!("{}:{}", endpoint.host_str().unwrap_or_default(), port),
                None => endpoint.host_str().unwrap_or_default().to_string(),
            };
            Url::parse(&format!("{}://{bucket}.{host}/?location=", endpoint.scheme()))
                .map_err(|e| S3ClientError::InvalidArgument(format!("bucket {bucket}: {e}")))?
        } else {
            let mut url = endpoint.clone();
            url.set_path(&format!("{bucket}/"));
            url.set_query(Some("location="));
            url
        };

        let mut req = PreparedRequest::new(Method::GET, url);
        req.set_header("user-agent", &self.inner.user_agent)?;

        let creds = self.inner.credentials.get(ctx).await?;
        let signature = effective_signature(creds.signature_type(), self.inner.override_signature);
        let now = Utc::now();
        if signature.is_v2() {
            sign_v2(&mut req, creds.signing_keys(), virtual_host, now)?;
        } else if !signature.is_anonymous() {
            let content_sha256 = if self.inner.endpoint.is_secure() {
                UNSIGNED_PAYLOAD
            } else {
                EMPTY_SHA256
            };
            req.set_header("x-amz-content-sha256", content_sha256)?;
            sign_v4(&mut req, creds.signing_keys(), DEFAULT_REGION, now)?;
        }

        let mut resp = self.send(ctx, req).await?;
        let body = resp.buffer(MAX_ERROR_BODY_SIZE).await?;

        if resp.status != StatusCode::OK {
            let err = ErrorResponse::from_http(resp.status, &resp.headers, &body, bucket, "")
                .ok_or_else(|| S3ClientError::ResponseError(format!("unexpected status {}", resp.status)))?;
            if err.code == NOT_IMPLEMENTED {
                match err.server.as_str() {
                    "AmazonSnowball" => return Ok("snowball".to_string()),
                    "cloudflare" => return Ok(DEFAULT_REGION.to_string()),
                    _ => {}
                }
            }
            if matches!(
                err.code.as_str(),
                AUTHORIZATION_HEADER_MALFORMED | INVALID_REGION | ACCESS_DENIED
            ) {
                return Ok(if err.region.is_empty() {
                    DEFAULT_REGION.to_string()
                } else {
                    err.region
                });
            }
            return Err(err.into());
        }

        let text = String::from_utf8_lossy(&body);
        let constraint: LocationConstraint = quick_xml::de::from_str(&text)
            .map_err(|e| S3ClientError::ResponseError(format!("LocationConstraint: {e}")))?;
        Ok(match constraint.region.trim() {
            "" => DEFAULT_REGION.to_string(),
            "EU" => "eu-west-1".to_string(),
            region => region.to_string(),
        })
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    /// Credentials for a request against `bucket`, one fetch in flight per bucket.
    ///
    /// The shared fetch runs under its own context; each caller only stops
    /// waiting when its own context ends.
    async fn credentials_for(&self, ctx: &Context, bucket: &str) -> Result<Credentials, S3ClientError> {
        let client = self.clone();
        let bucket_name = bucket.to_string();
        let fetch = self.inner.cred_gate.fetch(bucket, move || async move {
            let ctx = Context::background();
            if is_s3_express_bucket(&bucket_name) && is_amazon_endpoint(client.inner.endpoint.url()) {
                metrics::record_credential_fetch("session");
                client.create_session(&ctx, &bucket_name).await
            } else {
                metrics::record_credential_fetch("provider");
                Ok(client.inner.credentials.get(&ctx).await?)
            }
        });
        tokio::select! {
            result = fetch => result,
            err = ctx.done() => Err(err.into()),
        }
    }

    /// Exchange provider credentials for session credentials on a session-tier bucket.
    async fn create_session(&self, ctx: &Context, bucket: &str) -> Result<Credentials, S3ClientError> {
        let location = self.get_bucket_location(ctx, bucket).await?;
        let virtual_host = self.inner.endpoint.is_virtual_host_style(bucket);
        let mut query = BTreeMap::new();
        query.insert("session".to_string(), String::new());
        let url = self
            .inner
            .endpoint
            .target_url(bucket, "", &location, virtual_host, &query)?;

        let mut req = PreparedRequest::new(Method::GET, url);
        req.set_header("user-agent", &self.inner.user_agent)?;
        req.set_header(SESSION_MODE_HEADER, SESSION_READ_WRITE)?;

        let creds = self.inner.credentials.get(ctx).await?;
        let signature = effective_signature(creds.signature_type(), self.inner.override_signature);
        if signature.is_v2() {
            return Err(S3ClientError::InvalidArgument(
                "CreateSession requires Signature V4".into(),
            ));
        }
        if !signature.is_anonymous() {
            req.set_header("x-amz-content-sha256", EMPTY_SHA256)?;
            let mut keys = creds.signing_keys();
            if !keys.session_token.is_empty() {
                req.set_header(ServiceType::S3.session_token_header(), keys.session_token)?;
                keys.session_token = "";
            }
            sign_v4_trailer(&mut req, keys, &location, None, ServiceType::S3Express, Utc::now())?;
        }

        let mut resp = self.send(ctx, req).await?;
        let body = resp.buffer(MAX_ERROR_BODY_SIZE).await?;
        if resp.status != StatusCode::OK {
            return Err(
                match ErrorResponse::from_http(resp.status, &resp.headers, &body, bucket, "") {
                    Some(err) => err.into(),
                    None => S3ClientError::ResponseError(format!("CreateSession: status {}", resp.status)),
                },
            );
        }

        let text = String::from_utf8_lossy(&body);
        let result: CreateSessionResult = quick_xml::de::from_str(&text)
            .map_err(|e| S3ClientError::ResponseError(format!("CreateSession: {e}")))?;
        let session = result.credentials;
        debug!(bucket = %bucket, "Session credentials issued");
        Ok(Credentials::with_session_token(
            session.access_key_id,
            session.secret_access_key,
            session.session_token,
        ))
    }

    // ========================================================================
    // Request assembly
    // ========================================================================

    /// Build and sign a request, or a presigned request when asked for one.
    pub async fn new_request(
        &self,
        ctx: &Context,
        method: Method,
        mut metadata: RequestMetadata,
    ) -> Result<PreparedRequest, S3ClientError> {
        let body = std::mem::take(&mut metadata.content_body).into_shared();
        let (req, _) = self.build_request(ctx, &method, &metadata, body.payload()).await?;
        Ok(req)
    }

    /// Returns the signed request and the region it was signed for.
    async fn build_request(
        &self,
        ctx: &Context,
        method: &Method,
        metadata: &RequestMetadata,
        payload: Payload,
    ) -> Result<(PreparedRequest, String), S3ClientError> {
        metadata.validate()?;
        let inner = &self.inner;

        let mut location = metadata.bucket_location.clone();
        if location.is_empty() {
            if !metadata.bucket_name.is_empty() {
                location = self.get_bucket_location(ctx, &metadata.bucket_name).await?;
            }
            if location.is_empty() {
                location = default_location(inner.endpoint.url(), &inner.region);
            }
        }

        let virtual_host = inner.endpoint.use_virtual_host(
            method,
            &metadata.bucket_name,
            &metadata.object_name,
            metadata.query_values.is_empty(),
        );
        let url = inner.endpoint.target_url(
            &metadata.bucket_name,
            &metadata.object_name,
            &location,
            virtual_host,
            &metadata.query_values,
        )?;

        let creds = self.credentials_for(ctx, &metadata.bucket_name).await?;
        let mut req = PreparedRequest::new(method.clone(), url);

        let mut keys = creds.signing_keys();
        if is_s3_express_bucket(&metadata.bucket_name) {
            if !keys.session_token.is_empty() {
                req.set_header(ServiceType::S3Express.session_token_header(), keys.session_token)?;
            }
            keys.session_token = "";
        }

        let signature = effective_signature(creds.signature_type(), inner.override_signature);
        let presign = metadata.presign_url && metadata.expires != 0;
        let protocol = SigningProtocol::select(
            signature,
            RequestShape {
                presign,
                stream_sha256: metadata.stream_sha256,
                content_length: metadata.content_length,
                secure: inner.endpoint.is_secure(),
            },
        );
        let now = Utc::now();

        if presign {
            Self::presign_request(&mut req, protocol, keys, &location, metadata, virtual_host, now)?;
            return Ok((req, location));
        }

        req.set_header("user-agent", &inner.user_agent)?;
        for (name, value) in metadata.custom_header.iter() {
            req.headers.insert(name.clone(), value.clone());
        }
        if metadata.content_length != 0 {
            req.payload = payload;
        }
        req.content_length = metadata.content_length;
        if !metadata.content_md5_base64.is_empty() {
            req.set_header("content-md5", &metadata.content_md5_base64)?;
        }

        let trailer = metadata.trailer.clone().filter(|t| !t.is_empty());
        let service = if is_amazon_express_regional_endpoint(inner.endpoint.url()) {
            ServiceType::S3Express
        } else {
            ServiceType::S3
        };

        match protocol {
            SigningProtocol::Anonymous => {
                if let Some(trailer) = trailer {
                    req.set_header("x-amz-content-sha256", UNSIGNED_PAYLOAD_TRAILER)?;
                    unsigned_trailer(&mut req, trailer, now)?;
                }
            }
            SigningProtocol::Legacy | SigningProtocol::LegacyPresign => {
                sign_v2(&mut req, keys, virtual_host, now)?;
            }
            SigningProtocol::V4Streaming => {
                req.trailer = trailer;
                streaming_sign_v4(
                    &mut req,
                    keys,
                    &location,
                    metadata.content_length,
                    now,
                    &inner.sha256_hasher,
                    service,
                )?;
            }
            SigningProtocol::V4Header | SigningProtocol::V4Presign => {
                let content_sha256 = if !metadata.content_sha256_hex.is_empty() {
                    metadata.content_sha256_hex.as_str()
                } else if trailer.is_some() {
                    UNSIGNED_PAYLOAD_TRAILER
                } else {
                    UNSIGNED_PAYLOAD
                };
                req.set_header("x-amz-content-sha256", content_sha256)?;
                sign_v4_trailer(&mut req, keys, &location, trailer.as_ref(), service, now)?;
            }
        }

        Ok((req, location))
    }

    /// Move the signature into the query string. No body, user agent or trailer is attached.
    fn presign_request(
        req: &mut PreparedRequest,
        protocol: SigningProtocol,
        keys: SigningKeys<'_>,
        location: &str,
        metadata: &RequestMetadata,
        virtual_host: bool,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), S3ClientError> {
        match protocol {
            SigningProtocol::Anonymous => Err(S3ClientError::InvalidArgument(
                "Presigned URLs cannot be generated with anonymous credentials.".into(),
            )),
            SigningProtocol::Legacy | SigningProtocol::LegacyPresign => {
                if metadata.extra_presign_header.is_some() {
                    return Err(S3ClientError::InvalidArgument(
                        "Extra signed headers for Presign with Signature V2 is not supported.".into(),
                    ));
                }
                Ok(presign_v2(req, keys, metadata.expires, virtual_host, now)?)
            }
            _ => {
                if let Some(extra) = &metadata.extra_presign_header {
                    for (name, value) in extra.iter() {
                        req.headers.insert(name.clone(), value.clone());
                    }
                }
                Ok(presign_v4(req, keys, location, metadata.expires, now)?)
            }
        }
    }

    /// Presigned URL for `method` on `bucket/object`, valid for `expires`.
    pub async fn presign(
        &self,
        ctx: &Context,
        method: Method,
        bucket: &str,
        object: &str,
        expires: Duration,
        query: BTreeMap<String, String>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<Url, S3ClientError> {
        let expires = i64::try_from(expires.as_secs()).unwrap_or(i64::MAX);
        if expires < 1 {
            return Err(S3ClientError::InvalidArgument(
                "Expires cannot be lesser than 1 second.".into(),
            ));
        }
        if expires > MAX_PRESIGN_EXPIRY_SECONDS {
            return Err(S3ClientError::InvalidArgument(
                "Expires cannot be greater than 7 days.".into(),
            ));
        }
        check_valid_bucket_name(bucket)?;
        if object.is_empty() {
            return Err(S3ClientError::InvalidArgument("Object name cannot be empty".into()));
        }

        let metadata = RequestMetadata {
            presign_url: true,
            bucket_name: bucket.to_string(),
            object_name: object.to_string(),
            query_values: query,
            extra_presign_header: extra_headers,
            expires,
            ..Default::default()
        };
        let req = self.new_request(ctx, method, metadata).await?;
        Ok(req.url)
    }

    /// Sign a browser upload policy.
    ///
    /// Returns the upload URL and every form field the browser must submit,
    /// `policy` and its signature included. Signature fields are appended to
    /// `policy` as conditions before it is encoded.
    pub async fn presigned_post_policy(
        &self,
        ctx: &Context,
        policy: &mut PostPolicy,
    ) -> Result<(Url, BTreeMap<String, String>), S3ClientError> {
        if policy.expiration().is_none() {
            return Err(S3ClientError::InvalidArgument(
                "Expiration time must be specified".into(),
            ));
        }
        let bucket = match policy.bucket() {
            Some(bucket) => bucket.to_string(),
            None => {
                return Err(S3ClientError::InvalidArgument(
                    "bucket name must be specified".into(),
                ))
            }
        };

        let location = self.get_bucket_location(ctx, &bucket).await?;
        let virtual_host = self.inner.endpoint.is_virtual_host_style(&bucket);
        let url = self
            .inner
            .endpoint
            .target_url(&bucket, "", &location, virtual_host, &BTreeMap::new())?;

        let creds = self.inner.credentials.get(ctx).await?;
        let signature = effective_signature(creds.signature_type(), self.inner.override_signature);
        if signature.is_anonymous() {
            return Err(S3ClientError::InvalidArgument(
                "Presigned operations are not supported for anonymous credentials".into(),
            ));
        }
        let keys = creds.signing_keys();

        if signature.is_v2() {
            let encoded = policy.base64();
            policy.insert_form_field("policy", encoded.as_str());
            let host = self.inner.endpoint.url().host_str().unwrap_or_default();
            let access_field = if host.contains(".storage.googleapis.com") {
                "GoogleAccessId"
            } else {
                "AWSAccessKeyId"
            };
            policy.insert_form_field(access_field, keys.access_key_id);
            policy.insert_form_field(
                "signature",
                post_presign_signature_v2(&encoded, keys.secret_access_key),
            );
            return Ok((url, policy.form_data().clone()));
        }

        let now = Utc::now();
        let date = now.format(ISO8601_FORMAT).to_string();
        let credential = get_credential(keys.access_key_id, &location, now, ServiceType::S3);
        policy.add_condition(MatchType::Exact, "x-amz-date", &date)?;
        policy.add_condition(MatchType::Exact, "x-amz-algorithm", SIGN_V4_ALGORITHM)?;
        policy.add_condition(MatchType::Exact, "x-amz-credential", &credential)?;
        if !keys.session_token.is_empty() {
            policy.add_condition(MatchType::Exact, "x-amz-security-token", keys.session_token)?;
        }

        let encoded = policy.base64();
        policy.insert_form_field("policy", encoded.as_str());
        policy.insert_form_field("x-amz-algorithm", SIGN_V4_ALGORITHM);
        policy.insert_form_field("x-amz-credential", credential);
        policy.insert_form_field("x-amz-date", date);
        if !keys.session_token.is_empty() {
            policy.insert_form_field("x-amz-security-token", keys.session_token);
        }
        policy.insert_form_field(
            "x-amz-signature",
            post_presign_signature_v4(&encoded, now, keys.secret_access_key, &location),
        );
        debug!(bucket = %bucket, "Post policy signed");
        Ok((url, policy.form_data().clone()))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// One physical exchange, raced against the context.
    ///
    /// A network-level failure demotes an online endpoint to offline.
    async fn send(&self, ctx: &Context, req: PreparedRequest) -> Result<S3Response, S3ClientError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let method = req.method.clone();
        debug!(method = %method, url = %req.redacted_url(), "Sending request");

        let started = Instant::now();
        let result = tokio::select! {
            res = self.inner.transport.send(req) => res.map_err(S3ClientError::from),
            err = ctx.done() => Err(err.into()),
        };

        match &result {
            Ok(resp) => metrics::record_request(method.as_str(), resp.status.as_u16(), started.elapsed()),
            Err(e) => {
                metrics::record_request(method.as_str(), 0, started.elapsed());
                if e.is_network_or_host_down(false) && self.inner.health.mark_offline() {
                    warn!(error = %e, endpoint = %self.inner.endpoint.url(), "Endpoint marked offline");
                }
            }
        }
        result
    }

    /// Execute a request with retries.
    ///
    /// Only replayable bodies are retried; they are rewound before every
    /// attempt. A response with a non-success status is returned as the
    /// structured [`ErrorResponse`] once it is no longer worth retrying.
    #[tracing::instrument(
        name = "s3.execute",
        skip(self, ctx, metadata),
        fields(
            http.method = %method,
            s3.bucket = %metadata.bucket_name,
            s3.key = %metadata.object_name,
            http.status_code = tracing::field::Empty,
            attempts = tracing::field::Empty
        ),
        err
    )]
    pub async fn execute_method(
        &self,
        ctx: &Context,
        method: Method,
        mut metadata: RequestMetadata,
    ) -> Result<S3Response, S3ClientError> {
        if self.inner.health.is_offline() {
            return Err(S3ClientError::Offline(
                self.inner.endpoint.url().as_str().trim_end_matches('/').to_string(),
            ));
        }

        if metadata.add_crc.is_some() && !self.inner.trailing_header_support {
            debug!("Trailing headers not supported, checksum not sent");
            metadata.add_crc = None;
        }
        metadata.validate()?;

        let max_attempts = if metadata.content_body.is_replayable() {
            self.inner.max_retries
        } else {
            1
        };

        if let Some(checksum) = metadata.add_crc {
            if metadata.content_length > 0 {
                let trailer = metadata.trailer.get_or_insert_with(Default::default).clone();
                let body = std::mem::take(&mut metadata.content_body);
                metadata.content_body = body.with_checksum(checksum, trailer);
            }
        }
        let body: SharedBody = std::mem::take(&mut metadata.content_body).into_shared();

        let span = tracing::Span::current();
        let mut timer = RetryTimer::new(max_attempts, self.inner.rng.clone());
        let mut last_err: Option<S3ClientError> = None;

        while let Some(attempt) = timer.next(ctx).await {
            span.record("attempts", attempt);
            body.rewind().await?;

            let (req, location) = match self.build_request(ctx, &method, &metadata, body.payload()).await {
                Ok(built) => built,
                Err(e) if is_s3_code_retryable(e.code()) => {
                    warn!(attempt, error = %e, "Request construction failed, retrying");
                    metrics::record_retry("request");
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut resp = match self.send(ctx, req).await {
                Ok(resp) => resp,
                Err(e) if is_request_error_retryable(ctx, &e) => {
                    warn!(attempt, error = %e, "Request failed, retrying");
                    metrics::record_retry("network");
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = resp.status;
            span.record("http.status_code", status.as_u16());
            if is_success_status(status) && !metadata.expect_200_ok_with_error {
                return Ok(resp);
            }

            let body_bytes = resp.buffer(MAX_ERROR_BODY_SIZE).await?;
            let Some(err) = ErrorResponse::from_http(
                status,
                &resp.headers,
                &body_bytes,
                &metadata.bucket_name,
                &metadata.object_name,
            ) else {
                return Ok(resp);
            };
            debug!(attempt, code = %err.code, status = status.as_u16(), "Error response");

            if self.inner.region.is_empty()
                && matches!(
                    err.code.as_str(),
                    AUTHORIZATION_HEADER_MALFORMED | INVALID_REGION | ACCESS_DENIED
                )
            {
                if err.region.is_empty() {
                    return Err(err.into());
                }
                if err.region != location {
                    warn!(
                        attempt,
                        signed_for = %location,
                        region = %err.region,
                        "Region mismatch, retrying"
                    );
                    if !metadata.bucket_name.is_empty() {
                        self.inner.region_cache.set(&metadata.bucket_name, &err.region);
                    }
                    // A pinned location outranks the cache in build_request.
                    if metadata.bucket_name.is_empty() || !metadata.bucket_location.is_empty() {
                        metadata.bucket_location = err.region.clone();
                    }
                    metrics::record_retry("region");
                    last_err = Some(err.into());
                    continue;
                }
            }

            if is_s3_code_retryable(&err.code) || is_http_status_retryable(status) {
                warn!(attempt, code = %err.code, status = status.as_u16(), "Retryable error response");
                metrics::record_retry("status");
                last_err = Some(err.into());
                continue;
            }

            return Err(err.into());
        }

        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        Err(last_err.unwrap_or_else(|| S3ClientError::Internal("no attempt was made".into())))
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Start the endpoint health monitor.
    ///
    /// Each probe asks for the location of a random bucket that almost
    /// certainly does not exist; any answer from the server counts as online.
    pub async fn health_check(&self, interval: Duration) -> Result<HealthCheckHandle, S3ClientError> {
        let client = self.clone();
        health::start(self.inner.health.clone(), interval, move |ctx| {
            let client = client.clone();
            async move {
                let bucket = probe_bucket_name(&client.inner.rng);
                client.discover_location(&ctx, &bucket).await
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::error::TransportError;
    use crate::s3::RequestBody;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers from a queue of canned responses and records each request URL.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<(u16, String), std::io::ErrorKind>>>,
        urls: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<(u16, &str), std::io::ErrorKind>>) -> Arc<Self> {
            let mut responses: Vec<_> = responses
                .into_iter()
                .map(|r| r.map(|(status, body)| (status, body.to_string())))
                .collect();
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, req: PreparedRequest) -> Result<S3Response, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(req.url.to_string());
            let next = self.responses.lock().pop().unwrap_or(Ok((200, String::new())));
            match next {
                Ok((status, body)) => Ok(S3Response::from_bytes(
                    StatusCode::from_u16(status).unwrap(),
                    HeaderMap::new(),
                    body,
                )),
                Err(kind) => Err(TransportError::Io(std::io::Error::new(kind, "scripted"))),
            }
        }
    }

    fn client(transport: Arc<ScriptedTransport>, opts: ClientOptions) -> Client {
        Client::new(
            "localhost:9000",
            ClientOptions {
                credentials: Some(Arc::new(StaticCredentials::new("minio", "minio123"))),
                transport: Some(transport),
                region: "us-east-1".into(),
                ..opts
            },
        )
        .unwrap()
    }

    #[test]
    fn test_user_agent_format() {
        let ua = user_agent("", "");
        assert!(ua.starts_with("MizuchiS3 ("));
        assert!(ua.ends_with(&format!("mizuchi-s3/{LIBRARY_VERSION}")));
        assert!(user_agent("app", "1.0").ends_with(" app/1.0"));
        assert!(!user_agent("app", "").contains("app"));
    }

    #[test]
    fn test_amazon_endpoint_forces_v4_and_region() {
        let client = Client::new(
            "s3.eu-west-1.amazonaws.com",
            ClientOptions {
                secure: true,
                signature: SignatureType::V2,
                trailing_headers: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(client.region(), "eu-west-1");
        assert!(client.trailing_header_support());
        assert_eq!(client.max_retries(), MAX_RETRY);
    }

    #[test]
    fn test_rejects_endpoint_with_path() {
        assert!(matches!(
            Client::new("localhost:9000/bucket", ClientOptions::default()),
            Err(S3ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_hash_materials() {
        let transport = ScriptedTransport::new(vec![]);
        let plain = client(transport.clone(), ClientOptions::default());
        let h = plain.hash_materials(false, true);
        assert!(h.md5.is_none());
        assert!(h.sha256.is_some());

        let tls = client(
            transport,
            ClientOptions {
                secure: true,
                ..Default::default()
            },
        );
        let h = tls.hash_materials(false, true);
        assert!(h.md5.is_some());
        assert!(h.sha256.is_none());
    }

    #[tokio::test]
    async fn test_retries_seekable_body_until_success() {
        let transport = ScriptedTransport::new(vec![
            Err(std::io::ErrorKind::ConnectionReset),
            Ok((503, "")),
            Ok((200, "done")),
        ]);
        let client = client(transport.clone(), ClientOptions::default());
        let meta = RequestMetadata::new("bucket", "key")
            .with_body(RequestBody::seekable(Cursor::new(b"abc".to_vec())), 3);

        let resp = client
            .execute_method(&Context::background(), Method::PUT, meta)
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), "done");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stream_body_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok((503, "")), Ok((200, ""))]);
        let client = client(transport.clone(), ClientOptions::default());
        let meta = RequestMetadata::new("bucket", "key")
            .with_body(RequestBody::stream(Cursor::new(b"abc".to_vec())), 3);

        let err = client
            .execute_method(&Context::background(), Method::PUT, meta)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "503 Service Unavailable");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let body = "<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>";
        let transport = ScriptedTransport::new(vec![Ok((404, body))]);
        let client = client(transport.clone(), ClientOptions::default());

        let err = client
            .execute_method(&Context::background(), Method::GET, RequestMetadata::new("bucket", "key"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchKey");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expect_200_with_error_body() {
        let body = "<Error><Code>InternalError</Code></Error>";
        let transport = ScriptedTransport::new(vec![Ok((200, body)), Ok((200, "<Ok/>"))]);
        let client = client(
            transport.clone(),
            ClientOptions {
                max_retries: 2,
                ..Default::default()
            },
        );
        let meta = RequestMetadata::new("bucket", "key").expect_200_ok_with_error();

        let resp = client
            .execute_method(&Context::background(), Method::POST, meta)
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), "<Ok/>");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_context_wins() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(transport.clone(), ClientOptions::default());
        let ctx = Context::background();
        ctx.cancel();

        let err = client
            .execute_method(&ctx, Method::GET, RequestMetadata::new("bucket", "key"))
            .await
            .unwrap_err();
        assert!(matches!(err, S3ClientError::Canceled));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_path_style_for_local_endpoint() {
        let transport = ScriptedTransport::new(vec![Ok((200, ""))]);
        let client = client(transport.clone(), ClientOptions::default());
        client
            .execute_method(&Context::background(), Method::GET, RequestMetadata::new("bucket", "a b.txt"))
            .await
            .unwrap();
        assert_eq!(
            transport.urls.lock()[0],
            "http://localhost:9000/bucket/a%20b.txt"
        );
    }

    #[tokio::test]
    async fn test_presign_rejects_bad_expiry() {
        let client = client(ScriptedTransport::new(vec![]), ClientOptions::default());
        let ctx = Context::background();
        for expires in [Duration::ZERO, Duration::from_secs(604_801)] {
            let err = client
                .presign(&ctx, Method::GET, "bucket", "key", expires, BTreeMap::new(), None)
                .await
                .unwrap_err();
            assert!(matches!(err, S3ClientError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn test_location_constraint_parsing() {
        let transport = ScriptedTransport::new(vec![
            Ok((200, "<LocationConstraint xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">EU</LocationConstraint>")),
            Ok((200, "<LocationConstraint/>")),
        ]);
        let client = Client::new(
            "localhost:9000",
            ClientOptions {
                credentials: Some(Arc::new(StaticCredentials::new("minio", "minio123"))),
                transport: Some(transport.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let ctx = Context::background();
        assert_eq!(client.get_bucket_location(&ctx, "first").await.unwrap(), "eu-west-1");
        assert_eq!(client.get_bucket_location(&ctx, "second").await.unwrap(), "us-east-1");
        assert_eq!(client.get_bucket_location(&ctx, "first").await.unwrap(), "eu-west-1");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(transport.urls.lock()[0].ends_with("/first/?location="));
    }

    #[tokio::test]
    async fn test_presigned_post_policy_v4_fields() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(transport.clone(), ClientOptions::default());
        let mut policy = PostPolicy::new();
        policy.set_expires(Utc::now() + chrono::Duration::minutes(10));
        policy.set_bucket("uploads").unwrap();
        policy.set_key_starts_with("incoming/").unwrap();

        let (url, form) = client
            .presigned_post_policy(&Context::background(), &mut policy)
            .await
            .unwrap();

        assert_eq!(url.as_str(), "http://localhost:9000/uploads/");
        assert_eq!(form["x-amz-algorithm"], "AWS4-HMAC-SHA256");
        assert!(form["x-amz-credential"].starts_with("minio/"));
        assert!(form["x-amz-credential"].ends_with("/us-east-1/s3/aws4_request"));
        assert_eq!(form["x-amz-signature"].len(), 64);
        assert_eq!(form["policy"], policy.base64());
        assert!(policy.to_json().contains("\"$x-amz-credential\""));
        assert!(!form.contains_key("x-amz-security-token"));
        // fixed region, nothing sent
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_presigned_post_policy_v2_and_anonymous() {
        let v2 = Client::new(
            "localhost:9000",
            ClientOptions {
                credentials: Some(Arc::new(StaticCredentials::from_credentials(
                    Credentials::new("minio", "minio123").with_signature(SignatureType::V2),
                ))),
                transport: Some(ScriptedTransport::new(vec![])),
                region: "us-east-1".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let mut policy = PostPolicy::new();
        policy.set_expires(Utc::now() + chrono::Duration::minutes(10));
        policy.set_bucket("uploads").unwrap();
        let (_, form) = v2
            .presigned_post_policy(&Context::background(), &mut policy)
            .await
            .unwrap();
        assert_eq!(form["AWSAccessKeyId"], "minio");
        assert_eq!(form["signature"].len(), 28);
        assert!(!form.contains_key("x-amz-signature"));

        let anonymous = Client::new(
            "localhost:9000",
            ClientOptions {
                transport: Some(ScriptedTransport::new(vec![])),
                region: "us-east-1".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let mut policy = PostPolicy::new();
        policy.set_expires(Utc::now() + chrono::Duration::minutes(10));
        policy.set_bucket("uploads").unwrap();
        let err = anonymous
            .presigned_post_policy(&Context::background(), &mut policy)
            .await
            .unwrap_err();
        assert!(matches!(err, S3ClientError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_presigned_post_policy_requires_expiry_and_bucket() {
        let client = client(ScriptedTransport::new(vec![]), ClientOptions::default());
        let ctx = Context::background();
        let mut policy = PostPolicy::new();
        policy.set_bucket("uploads").unwrap();
        assert!(client.presigned_post_policy(&ctx, &mut policy).await.is_err());

        let mut policy = PostPolicy::new();
        policy.set_expires(Utc::now());
        assert!(client.presigned_post_policy(&ctx, &mut policy).await.is_err());
    }
}
