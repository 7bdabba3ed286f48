//! Engine configuration.
//!
//! Defaults suit a macOS build machine; every field can be overridden
//! through `SIGNPREP_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, SignprepError};

pub const ENV_TEMP_DIR: &str = "SIGNPREP_TEMP_DIR";
pub const ENV_KEYCHAIN_PREFIX: &str = "SIGNPREP_KEYCHAIN_PREFIX";
pub const ENV_KEYCHAIN_TIMEOUT: &str = "SIGNPREP_KEYCHAIN_TIMEOUT";
pub const ENV_SECURITY_PATH: &str = "SIGNPREP_SECURITY_PATH";

/// Settings shared by the keychain, profile and manager components.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Directory for ephemeral keychains, certificate and profile files.
    pub temp_dir: PathBuf,
    /// File name prefix identifying keychains created by this engine.
    pub keychain_prefix: String,
    /// Seconds before an idle ephemeral keychain locks itself.
    pub keychain_unlock_timeout_secs: u64,
    /// Path to the macOS `security` tool.
    pub security_path: PathBuf,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            keychain_prefix: "signprep".to_string(),
            keychain_unlock_timeout_secs: 3600,
            security_path: PathBuf::from("/usr/bin/security"),
        }
    }
}

impl SigningConfig {
    /// Builds a configuration from defaults overridden by environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields with any `SIGNPREP_*` environment variables that are set.
    ///
    /// Unset variables leave the current values alone. Does not validate.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var(ENV_TEMP_DIR) {
            self.temp_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var(ENV_KEYCHAIN_PREFIX) {
            self.keychain_prefix = prefix;
        }
        if let Ok(timeout) = std::env::var(ENV_KEYCHAIN_TIMEOUT) {
            self.keychain_unlock_timeout_secs = timeout.trim().parse().map_err(|_| {
                SignprepError::Configuration(format!(
                    "{} must be a number of seconds, got '{}'",
                    ENV_KEYCHAIN_TIMEOUT, timeout
                ))
            })?;
        }
        if let Ok(path) = std::env::var(ENV_SECURITY_PATH) {
            self.security_path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Checks that the values can be used to name and configure keychains.
    pub fn validate(&self) -> Result<()> {
        if self.keychain_prefix.is_empty() {
            return Err(SignprepError::Configuration(
                "Keychain prefix must not be empty".to_string(),
            ));
        }
        if !self
            .keychain_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SignprepError::Configuration(format!(
                "Keychain prefix '{}' may only contain letters, digits, '-' and '_'",
                self.keychain_prefix
            )));
        }
        if self.keychain_unlock_timeout_secs == 0 {
            return Err(SignprepError::Configuration(
                "Keychain unlock timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
