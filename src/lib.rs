//! Mizuchi S3 Library
//!
//! Client engine for S3-compatible object storage.
//!
//! # Features
//!
//! - **Endpoint Resolution**: Virtual-host or path style per bucket, accelerate and dual-stack hosts
//! - **Signing**: Signature V2, V4 header, V4 streaming and presigned URLs
//! - **Retries**: Jittered exponential backoff with region-mismatch recovery
//! - **Health Tracking**: Background probe with an offline fast-fail gate
//! - **Browser Uploads**: Signed POST policies
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_s3::{config::ClientConfig, Client, Context};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::load("config.yaml")?;
//!     let client = Client::from_config(&config)?;
//!     let region = client.get_bucket_location(&Context::background(), "photos").await?;
//!     println!("{region}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod post_policy;
pub mod s3;
pub mod signer;

// Re-export commonly used types
pub use config::ClientConfig;
pub use post_policy::PostPolicy;
pub use s3::{Client, ClientOptions, Context, RequestMetadata, S3ClientError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
