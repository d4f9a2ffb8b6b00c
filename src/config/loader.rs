//! Configuration loader with environment variable expansion

use super::{ClientConfig, ConfigError};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = ClientConfig::from_yaml(&content)?;
        tracing::debug!(path = %path.display(), endpoint = %config.client.endpoint, "Configuration loaded");
        Ok(config)
    }
}
