//! S3 client engine
//!
//! Resolves endpoints and URL style, caches bucket regions, coalesces
//! credential fetches, signs requests and executes them with retries while
//! tracking endpoint liveness.
//!
//! # Tracing
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | Execute | `s3.execute` | http.method, s3.bucket, s3.key, http.status_code, attempts |
//!
//! Signatures never reach log lines: request URLs are logged through
//! [`crate::signer::PreparedRequest::redacted_url`].

pub mod body;
pub mod checksum;
pub mod client;
pub mod context;
pub mod credentials;
pub mod dedup;
pub mod endpoint;
pub mod error;
pub mod health;
pub mod region;
pub mod request;
pub mod retry;
pub mod transport;

pub use body::{RequestBody, SeekableRead};
pub use checksum::ChecksumType;
pub use client::{Client, ClientOptions, HashMaterials, RegionFn};
pub use context::{Context, ContextError};
pub use credentials::{
    Credentials, CredentialsError, CredentialsProvider, EnvironmentCredentials, StaticCredentials,
};
pub use dedup::CredentialGate;
pub use endpoint::{BucketLookup, EndpointResolver, LookupFn};
pub use error::{ErrorResponse, S3ClientError, TransportError};
pub use health::{HealthCheckHandle, HealthStatus};
pub use region::RegionCache;
pub use request::RequestMetadata;
pub use transport::{ReqwestTransport, S3Response, Transport};
