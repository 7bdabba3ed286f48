//! Ephemeral keychain management for iOS code signing.
//!
//! Each credentials preparation gets its own temporary keychain with a
//! random name and password, preventing credential persistence and
//! conflicts between concurrent builds.

use regex_lite::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::security::{SecurityTool, path_arg};
use crate::config::SigningConfig;
use crate::crypto::generate_random_password;
use crate::error::{Result, SignprepError};
use crate::models::SigningIdentity;

/// Lifecycle of an [`EphemeralKeychain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeychainState {
    New,
    Created,
    Destroyed,
}

impl std::fmt::Display for KeychainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeychainState::New => "not yet created",
            KeychainState::Created => "created",
            KeychainState::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// A temporary keychain owned by one credentials preparation.
///
/// The path and password are generated once, at construction, and never
/// reused. The keychain is not deleted on drop: whoever owns it must call
/// [`EphemeralKeychain::destroy`].
#[derive(Debug)]
pub struct EphemeralKeychain {
    path: PathBuf,
    password: SecretString,
    unlock_timeout_secs: u64,
    state: KeychainState,
    security: Arc<dyn SecurityTool>,
}

impl EphemeralKeychain {
    /// Prepares a keychain handle; nothing touches the OS until [`create`](Self::create).
    pub fn new(security: Arc<dyn SecurityTool>, config: &SigningConfig) -> Self {
        let path = config.temp_dir.join(format!(
            "{}-{}.keychain-db",
            config.keychain_prefix,
            ulid::Ulid::new()
        ));

        Self {
            path,
            password: SecretString::from(generate_random_password(32)),
            unlock_timeout_secs: config.keychain_unlock_timeout_secs,
            state: KeychainState::New,
            security,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> KeychainState {
        self.state
    }

    fn require_state(&self, operation: &'static str, expected: KeychainState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SignprepError::KeychainState {
                operation,
                state: self.state,
            })
        }
    }

    /// Creates and unlocks the keychain, and puts it on the user search list.
    ///
    /// Once `create-keychain` succeeds the keychain counts as created, so a
    /// later failure in this method still leaves something to destroy.
    pub async fn create(&mut self) -> Result<()> {
        self.require_state("create", KeychainState::New)?;
        let path = path_arg(&self.path)?.to_string();
        let password = self.password.expose_secret();

        self.security
            .run(&["create-keychain", "-p", password, &path])
            .await?
            .check("create keychain")?;
        self.state = KeychainState::Created;

        self.security
            .run(&["unlock-keychain", "-p", password, &path])
            .await?
            .check("unlock keychain")?;

        let timeout = self.unlock_timeout_secs.to_string();
        self.security
            .run(&["set-keychain-settings", "-t", &timeout, "-u", &path])
            .await?
            .check("set keychain settings")?;

        self.add_to_search_list(&path).await?;

        tracing::debug!("Created ephemeral keychain: {}", self.path.display());
        Ok(())
    }

    async fn add_to_search_list(&self, path: &str) -> Result<()> {
        let output = self
            .security
            .run(&["list-keychains", "-d", "user"])
            .await?
            .check("list keychains")?;

        let current_list = parse_keychain_list(&output.stdout);
        let mut args = vec!["list-keychains", "-d", "user", "-s", path];
        args.extend(current_list.iter().map(|s| s.as_str()));

        self.security
            .run(&args)
            .await?
            .check("set keychain search list")?;

        tracing::debug!("Added keychain to search list: {}", path);
        Ok(())
    }

    /// Imports a PKCS#12 file into this keychain with codesign access.
    pub async fn import_certificate(&self, p12_path: &Path, p12_password: &SecretString) -> Result<()> {
        self.require_state("import certificate", KeychainState::Created)?;
        let path = path_arg(&self.path)?;

        self.security
            .run(&[
                "import",
                path_arg(p12_path)?,
                "-k",
                path,
                "-P",
                p12_password.expose_secret(),
                "-f",
                "pkcs12",
                "-T",
                "/usr/bin/codesign",
                "-T",
                "/usr/bin/security",
            ])
            .await?
            .check("import certificate")?;

        // Allows codesign to use the key without a UI prompt on headless machines
        let output = self
            .security
            .run(&[
                "set-key-partition-list",
                "-S",
                "apple-tool:,apple:,codesign:",
                "-s",
                "-k",
                self.password.expose_secret(),
                path,
            ])
            .await?;
        if !output.success {
            tracing::warn!(
                "Failed to set key partition list (may still work): {}",
                output.stderr.trim()
            );
        }

        tracing::debug!("Imported certificate into keychain: {}", self.path.display());
        Ok(())
    }

    /// Lists valid code signing identities belonging to `team_id`.
    pub async fn find_identities(&self, team_id: &str) -> Result<Vec<SigningIdentity>> {
        self.require_state("find identities", KeychainState::Created)?;

        let output = self
            .security
            .run(&["find-identity", "-v", "-p", "codesigning", path_arg(&self.path)?])
            .await?
            .check("find signing identities")?;

        let team_marker = format!("({})", team_id);
        Ok(parse_identities(&output.stdout)
            .into_iter()
            .filter(|identity| identity.name.contains(&team_marker))
            .collect())
    }

    /// Asserts that the certificate with `fingerprint` is usable for `team_id`.
    ///
    /// `security import` can exit successfully without the identity
    /// becoming available, so this is checked separately.
    pub async fn ensure_certificate_imported(&self, team_id: &str, fingerprint: &str) -> Result<()> {
        self.require_state("ensure certificate imported", KeychainState::Created)?;

        let identities = self.find_identities(team_id).await?;
        if identities
            .iter()
            .any(|identity| identity.fingerprint.eq_ignore_ascii_case(fingerprint))
        {
            Ok(())
        } else {
            Err(SignprepError::CertificateNotImported {
                fingerprint: fingerprint.to_string(),
            })
        }
    }

    /// Deletes the keychain, which also removes it from the search list.
    ///
    /// Destroying a keychain that was never created, or twice, only warns.
    pub async fn destroy(&mut self) -> Result<()> {
        match self.state {
            KeychainState::New => {
                tracing::warn!("There is nothing to destroy, a keychain hasn't been created yet");
                return Ok(());
            }
            KeychainState::Destroyed => {
                tracing::warn!("The keychain has already been destroyed: {}", self.path.display());
                return Ok(());
            }
            KeychainState::Created => {}
        }

        self.security
            .run(&["delete-keychain", path_arg(&self.path)?])
            .await?
            .check("delete keychain")?;
        self.state = KeychainState::Destroyed;

        tracing::debug!("Deleted ephemeral keychain: {}", self.path.display());
        Ok(())
    }

    /// Deletes keychains left behind by earlier runs that crashed.
    ///
    /// Candidates are keychains on the search list and keychain files in
    /// the temp directory that match this engine's naming convention.
    /// Entries that cannot be deleted are skipped. Returns how many were
    /// deleted.
    pub async fn clean_up_stale(security: &dyn SecurityTool, config: &SigningConfig) -> Result<usize> {
        let pattern = stale_keychain_pattern(&config.keychain_prefix)?;
        let mut candidates = BTreeSet::new();

        match security.run(&["list-keychains"]).await {
            Ok(output) if output.success => {
                candidates.extend(
                    parse_keychain_list(&output.stdout)
                        .into_iter()
                        .filter(|path| pattern.is_match(path))
                        .map(PathBuf::from),
                );
            }
            Ok(output) => {
                tracing::warn!("Failed to list keychains: {}", output.stderr.trim());
            }
            Err(e) => tracing::warn!("Failed to list keychains: {}", e),
        }

        match tokio::fs::read_dir(&config.temp_dir).await {
            Ok(mut entries) => loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        if path.to_str().is_some_and(|p| pattern.is_match(p)) {
                            candidates.insert(path);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to scan {} for stale keychains: {}",
                            config.temp_dir.display(),
                            e
                        );
                        break;
                    }
                }
            },
            Err(e) => tracing::warn!(
                "Failed to scan {} for stale keychains: {}",
                config.temp_dir.display(),
                e
            ),
        }

        let mut deleted = 0;
        for path in candidates {
            let Some(path_str) = path.to_str() else {
                continue;
            };
            match security.run(&["delete-keychain", path_str]).await {
                Ok(output) if output.success => {
                    tracing::info!("Deleted stale keychain: {}", path.display());
                    deleted += 1;
                }
                Ok(output) => {
                    // Not registered with the keychain service, only a file on disk
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        tracing::info!("Removed stale keychain file: {}", path.display());
                        deleted += 1;
                    } else {
                        tracing::warn!(
                            "Failed to delete stale keychain {}: {}",
                            path.display(),
                            output.stderr.trim()
                        );
                    }
                }
                Err(e) => tracing::warn!("Failed to delete stale keychain {}: {}", path.display(), e),
            }
        }

        Ok(deleted)
    }
}

impl Drop for EphemeralKeychain {
    fn drop(&mut self) {
        if self.state == KeychainState::Created {
            tracing::warn!(
                "Ephemeral keychain dropped without being destroyed: {}",
                self.path.display()
            );
        }
    }
}

fn stale_keychain_pattern(prefix: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"(^|/){}-[0-9A-HJKMNP-TV-Z]{{26}}\.keychain(-db)?$",
        regex_lite::escape(prefix)
    ))
    .map_err(|e| SignprepError::Configuration(format!("Invalid keychain prefix: {}", e)))
}

/// Parses `security list-keychains` output into paths.
fn parse_keychain_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|line| line.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses `security find-identity` output.
///
/// Lines look like `  1) 3F2A...9C "Apple Distribution: Acme Inc (ABCDE12345)"`.
fn parse_identities(stdout: &str) -> Vec<SigningIdentity> {
    let Ok(line_pattern) = Regex::new(r#"^\s*\d+\)\s+([0-9A-Fa-f]{40})\s+"(.*)"\s*$"#) else {
        return Vec::new();
    };

    stdout
        .lines()
        .filter_map(|line| line_pattern.captures(line))
        .map(|caps| SigningIdentity {
            fingerprint: caps[1].to_ascii_uppercase(),
            name: caps[2].to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeSecurity, TestCertificate};

    fn keychain(fake: &Arc<FakeSecurity>, dir: &Path) -> EphemeralKeychain {
        let config = SigningConfig {
            temp_dir: dir.to_path_buf(),
            ..SigningConfig::default()
        };
        EphemeralKeychain::new(fake.clone(), &config)
    }

    #[test]
    fn test_new_keychain_has_unique_path_and_password() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let first = keychain(&fake, dir.path());
        let second = keychain(&fake, dir.path());

        assert_ne!(first.path(), second.path());
        assert_ne!(
            first.password.expose_secret(),
            second.password.expose_secret()
        );
        assert_eq!(first.state(), KeychainState::New);
        assert!(first.path().starts_with(dir.path()));
        let pattern = stale_keychain_pattern("signprep").unwrap();
        assert!(pattern.is_match(first.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_create_runs_security_commands() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let mut kc = keychain(&fake, dir.path());

        kc.create().await.unwrap();
        assert_eq!(kc.state(), KeychainState::Created);

        let subcommands = fake.subcommands();
        assert_eq!(
            subcommands,
            vec![
                "create-keychain",
                "unlock-keychain",
                "set-keychain-settings",
                "list-keychains",
                "list-keychains",
            ]
        );
        assert!(fake.keychain_exists(kc.path()));

        kc.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_failure_is_fatal() {
        let fake = Arc::new(FakeSecurity::new());
        fake.fail_on("create-keychain");
        let dir = tempfile::tempdir().unwrap();
        let mut kc = keychain(&fake, dir.path());

        let err = kc.create().await.unwrap_err();
        assert!(err.to_string().contains("Failed to create keychain"));
        assert_eq!(kc.state(), KeychainState::New);
        assert_eq!(fake.subcommands(), vec!["create-keychain"]);
    }

    #[tokio::test]
    async fn test_import_before_create_is_rejected() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let kc = keychain(&fake, dir.path());

        let err = kc
            .import_certificate(Path::new("/tmp/cert.p12"), &SecretString::from(String::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignprepError::KeychainState {
                state: KeychainState::New,
                ..
            }
        ));
        assert!(fake.subcommands().is_empty());
    }

    #[tokio::test]
    async fn test_operations_after_destroy_are_rejected() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let mut kc = keychain(&fake, dir.path());
        kc.create().await.unwrap();
        kc.destroy().await.unwrap();

        let err = kc.ensure_certificate_imported("ABCDE12345", "00").await.unwrap_err();
        assert!(matches!(
            err,
            SignprepError::KeychainState {
                state: KeychainState::Destroyed,
                ..
            }
        ));
        assert!(kc.create().await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_twice_is_a_noop() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let mut kc = keychain(&fake, dir.path());
        kc.create().await.unwrap();

        kc.destroy().await.unwrap();
        kc.destroy().await.unwrap();

        assert_eq!(kc.state(), KeychainState::Destroyed);
        assert_eq!(fake.count("delete-keychain"), 1);
        assert!(!fake.keychain_exists(kc.path()));
    }

    #[tokio::test]
    async fn test_destroy_before_create_is_a_noop() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let mut kc = keychain(&fake, dir.path());

        kc.destroy().await.unwrap();

        assert_eq!(kc.state(), KeychainState::New);
        assert!(fake.subcommands().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_failure_is_reported() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let mut kc = keychain(&fake, dir.path());
        kc.create().await.unwrap();

        fake.fail_on("delete-keychain");
        assert!(kc.destroy().await.is_err());
        assert_eq!(kc.state(), KeychainState::Created);

        fake.clear_failures();
        kc.destroy().await.unwrap();
        assert_eq!(kc.state(), KeychainState::Destroyed);
    }

    #[tokio::test]
    async fn test_ensure_certificate_imported_detects_missing_identity() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let mut kc = keychain(&fake, dir.path());
        kc.create().await.unwrap();

        let err = kc
            .ensure_certificate_imported("ABCDE12345", "A9993E364706816ABA3E25717850C26C9CD0D89D")
            .await
            .unwrap_err();
        assert!(matches!(err, SignprepError::CertificateNotImported { .. }));
        assert!(err.to_string().contains("hasn't been imported"));

        kc.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_certificate_imported_is_scoped_to_team() {
        let fake = Arc::new(FakeSecurity::new());
        let dir = tempfile::tempdir().unwrap();
        let cert = TestCertificate::generate(
            "Apple Distribution: Other Co (ZYXWV98765)",
            "ZYXWV98765",
            "otherpass",
        );
        let p12_path = dir.path().join("other.p12");
        std::fs::write(&p12_path, &cert.p12).unwrap();

        let mut kc = keychain(&fake, dir.path());
        kc.create().await.unwrap();
        kc.import_certificate(&p12_path, &SecretString::from(cert.password.clone()))
            .await
            .unwrap();

        kc.ensure_certificate_imported("ZYXWV98765", &cert.fingerprint)
            .await
            .unwrap();
        assert!(kc.find_identities("ABCDE12345").await.unwrap().is_empty());

        let err = kc
            .ensure_certificate_imported("ABCDE12345", &cert.fingerprint)
            .await
            .unwrap_err();
        assert!(matches!(err, SignprepError::CertificateNotImported { .. }));

        kc.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_up_stale_deletes_only_matching_keychains() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir
            .path()
            .join("signprep-01HZX3K8Q9V5Y7W2N4M6P8R0T2.keychain-db");
        let foreign = dir.path().join("other-01HZX3K8Q9V5Y7W2N4M6P8R0T2.keychain-db");
        std::fs::write(&stale, b"stale").unwrap();
        std::fs::write(&foreign, b"keep").unwrap();

        let fake = FakeSecurity::new();
        fake.register_keychain(Path::new(
            "/Users/ci/Library/Keychains/signprep-01HZX3K8Q9V5Y7W2N4M6P8R0T3.keychain-db",
        ));
        fake.register_keychain(Path::new("/Users/ci/Library/Keychains/login.keychain-db"));

        let config = SigningConfig {
            temp_dir: dir.path().to_path_buf(),
            ..SigningConfig::default()
        };
        let deleted = EphemeralKeychain::clean_up_stale(&fake, &config).await.unwrap();

        assert_eq!(deleted, 2);
        assert!(!stale.exists());
        assert!(foreign.exists());
        assert!(fake.keychain_exists(Path::new(
            "/Users/ci/Library/Keychains/login.keychain-db"
        )));
    }

    #[tokio::test]
    async fn test_clean_up_stale_tolerates_listing_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSecurity::new();
        fake.fail_on("list-keychains");

        let config = SigningConfig {
            temp_dir: dir.path().join("missing"),
            ..SigningConfig::default()
        };
        let deleted = EphemeralKeychain::clean_up_stale(&fake, &config).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[test]
    fn test_parse_identities() {
        let stdout = "  1) A9993E364706816ABA3E25717850C26C9CD0D89D \"Apple Distribution: Acme Inc (ABCDE12345)\"\n\
                      \x20 2) 84983e441c3bd26ebaae4aa1f95129e5e54670f1 \"Apple Development: Jane Doe (ZYXWV98765)\"\n\
                      \x20    2 valid identities found\n";
        let identities = parse_identities(stdout);
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].name, "Apple Distribution: Acme Inc (ABCDE12345)");
        assert_eq!(
            identities[1].fingerprint,
            "84983E441C3BD26EBAAE4AA1F95129E5E54670F1"
        );
    }

    #[test]
    fn test_parse_keychain_list() {
        let stdout = "    \"/Users/ci/Library/Keychains/login.keychain-db\"\n    \"/Library/Keychains/System.keychain\"\n";
        assert_eq!(
            parse_keychain_list(stdout),
            vec![
                "/Users/ci/Library/Keychains/login.keychain-db",
                "/Library/Keychains/System.keychain",
            ]
        );
    }
}
