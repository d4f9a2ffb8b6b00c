//! Mizuchi S3 - command line front end for the S3 client engine
//!
//! Presigns URLs, resolves bucket regions, watches endpoint health and
//! builds browser upload policies.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use mizuchi_s3::config::ClientConfig;
use mizuchi_s3::s3::HealthStatus;
use mizuchi_s3::{Client, Context, PostPolicy};
use reqwest::Method;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Mizuchi S3 - S3 client engine CLI
#[derive(Parser, Debug)]
#[command(name = "mizuchi-s3")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a presigned URL for an object
    Presign {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        object: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Validity in seconds
        #[arg(long, default_value_t = 3600)]
        expires: u64,
    },
    /// Print the region of a bucket
    Location {
        #[arg(long)]
        bucket: String,
    },
    /// Run the health monitor and print status transitions
    Health {
        /// Probe interval in seconds
        #[arg(long)]
        interval: Option<u64>,
        /// How long to watch, in seconds
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Print a POST policy document and its base64 form
    Policy {
        #[arg(long)]
        bucket: String,
        #[arg(long, default_value = "")]
        key_prefix: String,
        /// Validity in seconds
        #[arg(long, default_value_t = 3600)]
        expires_in: i64,
        /// Upper bound on the upload size in bytes
        #[arg(long)]
        max_size: Option<i64>,
    },
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);
    // stdout carries command output
    if format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }
    Ok(())
}

fn require_config(config: Option<ClientConfig>) -> anyhow::Result<ClientConfig> {
    match config {
        Some(config) => Ok(config),
        None => bail!("--config is required for this command"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Some(
            ClientConfig::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        ),
        None => None,
    };
    let level = args
        .log_level
        .clone()
        .or_else(|| config.as_ref().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "warn".to_string());
    let format = config
        .as_ref()
        .map(|c| c.logging.format.clone())
        .unwrap_or_else(|| "pretty".to_string());
    init_logging(&level, &format)?;

    info!("Starting Mizuchi S3 v{}", mizuchi_s3::VERSION);

    match args.command {
        Command::Policy {
            bucket,
            key_prefix,
            expires_in,
            max_size,
        } => {
            let mut policy = PostPolicy::new();
            policy.set_expires(chrono::Utc::now() + chrono::Duration::seconds(expires_in));
            policy.set_bucket(&bucket)?;
            policy.set_key_starts_with(&key_prefix)?;
            if let Some(max) = max_size {
                policy.set_content_length_range(0, max)?;
            }
            println!("{}", policy.to_json());
            println!("{}", policy.base64());
        }
        Command::Presign {
            bucket,
            object,
            method,
            expires,
        } => {
            let config = require_config(config)?;
            let client = Client::from_config(&config)?;
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method {method}"))?;
            let url = client
                .presign(
                    &Context::background(),
                    method,
                    &bucket,
                    &object,
                    Duration::from_secs(expires),
                    Default::default(),
                    None,
                )
                .await?;
            println!("{url}");
        }
        Command::Location { bucket } => {
            let config = require_config(config)?;
            let client = Client::from_config(&config)?;
            let region = client
                .get_bucket_location(&Context::background(), &bucket)
                .await?;
            println!("{region}");
        }
        Command::Health { interval, wait } => {
            let config = require_config(config)?;
            let client = Client::from_config(&config)?;
            let interval =
                Duration::from_secs(interval.unwrap_or(config.health_check.interval_seconds));
            let handle = client.health_check(interval).await?;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
            let mut last = HealthStatus::Unknown;
            println!("{}", last);
            while tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let status = client.health_status();
                if status != last {
                    println!("{}", status);
                    last = status;
                }
            }
            handle.stop().await;
        }
    }

    Ok(())
}
