//! CLI configuration loading and resolution.
//!
//! Reads optional engine settings from `~/.signprep/config.huml` with
//! priority order: CLI flags > environment variables > config file > defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use signprep_core::SigningConfig;
use std::path::{Path, PathBuf};

/// Environment variable pointing at an alternative config file.
pub const ENV_CONFIG: &str = "SIGNPREP_CONFIG";

/// Settings loaded from config.huml. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CliConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keychain_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keychain_unlock_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_path: Option<PathBuf>,
}

/// Values given as command line flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigFlags {
    pub temp_dir: Option<PathBuf>,
    pub keychain_prefix: Option<String>,
    pub security_path: Option<PathBuf>,
}

/// Returns the default config file path (~/.signprep/config.huml).
pub fn default_config_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|h| h.join(".signprep/config.huml"))
        .context("Could not determine home directory")
}

/// Returns the config file in effect, honoring `SIGNPREP_CONFIG`.
pub fn config_path() -> Result<PathBuf> {
    match std::env::var(ENV_CONFIG) {
        Ok(p) => Ok(PathBuf::from(p)),
        Err(_) => default_config_path(),
    }
}

/// Load configuration from the config file.
///
/// Returns `Ok(None)` if the config file doesn't exist.
/// Returns an error if the file exists but is invalid.
pub fn load_config() -> Result<Option<CliConfig>> {
    let path = config_path()?;

    if !path.exists() {
        return Ok(None);
    }

    let content =
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;

    let config: CliConfig = huml_rs::serde::from_str(&content)
        .with_context(|| format!("Invalid HUML in {}", path.display()))?;

    check_file_permissions(&path);

    Ok(Some(config))
}

/// Warn if config file has overly permissive permissions (on Unix).
#[cfg(unix)]
fn check_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        // Check if group or others have any permissions
        if mode & 0o077 != 0 {
            tracing::warn!(
                "{} has overly permissive permissions ({:o}). Consider running: chmod 600 {}",
                path.display(),
                mode & 0o777,
                path.display()
            );
        }
    }
}

#[cfg(not(unix))]
fn check_file_permissions(_path: &Path) {}

/// Resolve configuration by applying priority rules.
///
/// Priority order (highest to lowest):
/// 1. CLI flags (`--temp-dir`, `--keychain-prefix`, `--security-path`)
/// 2. Environment variables (`SIGNPREP_*`)
/// 3. Config file
/// 4. Engine defaults
pub fn resolve_config(flags: &ConfigFlags, file_config: Option<CliConfig>) -> Result<SigningConfig> {
    let mut config = SigningConfig::default();

    // Apply config file (lowest priority)
    if let Some(file) = file_config {
        if let Some(dir) = file.temp_dir {
            config.temp_dir = dir;
        }
        if let Some(prefix) = file.keychain_prefix {
            config.keychain_prefix = prefix;
        }
        if let Some(timeout) = file.keychain_unlock_timeout_secs {
            config.keychain_unlock_timeout_secs = timeout;
        }
        if let Some(path) = file.security_path {
            config.security_path = path;
        }
    }

    // Apply environment variables (medium priority)
    config.apply_env()?;

    // Apply CLI flags (highest priority)
    if let Some(dir) = &flags.temp_dir {
        config.temp_dir = dir.clone();
    }
    if let Some(prefix) = &flags.keychain_prefix {
        config.keychain_prefix = prefix.clone();
    }
    if let Some(path) = &flags.security_path {
        config.security_path = path.clone();
    }

    config.validate().context("Invalid signing configuration")?;
    Ok(config)
}

/// Renders a configuration as HUML.
///
/// huml-rs does not serialize, so the document is generated by hand.
pub fn serialize_to_huml(config: &SigningConfig) -> String {
    let mut output = String::new();
    output.push_str("%HUML v0.2.0\n");
    output.push_str(&format!("temp_dir: \"{}\"\n", config.temp_dir.display()));
    output.push_str(&format!("keychain_prefix: \"{}\"\n", config.keychain_prefix));
    output.push_str(&format!(
        "keychain_unlock_timeout_secs: {}\n",
        config.keychain_unlock_timeout_secs
    ));
    output.push_str(&format!("security_path: \"{}\"\n", config.security_path.display()));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use signprep_core::config::{
        ENV_KEYCHAIN_PREFIX, ENV_KEYCHAIN_TIMEOUT, ENV_SECURITY_PATH, ENV_TEMP_DIR,
    };

    const ALL_ENV: [(&str, Option<&str>); 4] = [
        (ENV_TEMP_DIR, None),
        (ENV_KEYCHAIN_PREFIX, None),
        (ENV_KEYCHAIN_TIMEOUT, None),
        (ENV_SECURITY_PATH, None),
    ];

    #[test]
    fn test_resolve_with_no_config() {
        temp_env::with_vars(ALL_ENV, || {
            let resolved = resolve_config(&ConfigFlags::default(), None).unwrap();
            assert_eq!(resolved, SigningConfig::default());
        });
    }

    #[test]
    fn test_resolve_with_config_file() {
        temp_env::with_vars(ALL_ENV, || {
            let file = CliConfig {
                temp_dir: Some(PathBuf::from("/var/ci/tmp")),
                keychain_prefix: Some("ci".to_string()),
                keychain_unlock_timeout_secs: Some(600),
                security_path: None,
            };

            let resolved = resolve_config(&ConfigFlags::default(), Some(file)).unwrap();
            assert_eq!(resolved.temp_dir, PathBuf::from("/var/ci/tmp"));
            assert_eq!(resolved.keychain_prefix, "ci");
            assert_eq!(resolved.keychain_unlock_timeout_secs, 600);
            assert_eq!(resolved.security_path, PathBuf::from("/usr/bin/security"));
        });
    }

    #[test]
    fn test_env_overrides_file_and_flags_override_env() {
        temp_env::with_vars(
            [
                (ENV_TEMP_DIR, Some("/env/tmp")),
                (ENV_KEYCHAIN_PREFIX, Some("env")),
                (ENV_KEYCHAIN_TIMEOUT, None),
                (ENV_SECURITY_PATH, None),
            ],
            || {
                let file = CliConfig {
                    temp_dir: Some(PathBuf::from("/file/tmp")),
                    keychain_prefix: Some("file".to_string()),
                    ..CliConfig::default()
                };
                let flags = ConfigFlags {
                    keychain_prefix: Some("flag".to_string()),
                    ..ConfigFlags::default()
                };

                let resolved = resolve_config(&flags, Some(file)).unwrap();
                assert_eq!(resolved.temp_dir, PathBuf::from("/env/tmp"));
                assert_eq!(resolved.keychain_prefix, "flag");
            },
        );
    }

    #[test]
    fn test_invalid_timeout_env_is_rejected() {
        temp_env::with_vars(
            [
                (ENV_TEMP_DIR, None),
                (ENV_KEYCHAIN_PREFIX, None),
                (ENV_KEYCHAIN_TIMEOUT, Some("forever")),
                (ENV_SECURITY_PATH, None),
            ],
            || {
                let result = resolve_config(&ConfigFlags::default(), None);
                assert!(result.unwrap_err().to_string().contains(ENV_KEYCHAIN_TIMEOUT));
            },
        );
    }

    #[test]
    fn test_invalid_prefix_flag_is_rejected() {
        temp_env::with_vars(ALL_ENV, || {
            let flags = ConfigFlags {
                keychain_prefix: Some("bad/prefix".to_string()),
                ..ConfigFlags::default()
            };
            assert!(resolve_config(&flags, None).is_err());
        });
    }

    #[test]
    fn test_serialize_to_huml() {
        let config = SigningConfig {
            temp_dir: PathBuf::from("/tmp/signprep"),
            ..SigningConfig::default()
        };

        let huml = serialize_to_huml(&config);
        assert!(huml.starts_with("%HUML v0.2.0\n"));
        assert!(huml.contains("temp_dir: \"/tmp/signprep\""));
        assert!(huml.contains("keychain_prefix: \"signprep\""));
        assert!(huml.contains("keychain_unlock_timeout_secs: 3600"));
        assert!(huml.contains("security_path: \"/usr/bin/security\""));
    }

    #[test]
    fn test_missing_config_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.huml");
        temp_env::with_var(ENV_CONFIG, Some(path.to_str().unwrap()), || {
            assert!(load_config().unwrap().is_none());
        });
    }
}
