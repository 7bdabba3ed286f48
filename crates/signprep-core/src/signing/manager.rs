//! iOS credentials preparation.
//!
//! [`CredentialsManager`] turns per-target certificate and profile pairs
//! into one ephemeral keychain plus materialized profiles, cross-checking
//! every pair. Any failure tears everything down before the error is
//! returned, so callers never see a partially prepared set.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::certificate::inspect_certificate;
use super::keychain::{EphemeralKeychain, KeychainState};
use super::profile::ProvisioningProfile;
use super::security::{SecurityCli, SecurityTool};
use crate::config::SigningConfig;
use crate::error::{Result, SignprepError};
use crate::models::{PreparedCredentials, ProvisioningProfileData, TargetCredentials};

/// Outcome of [`CredentialsManager::clean_up`].
///
/// Profile removal failures are collected in `suppressed`; a keychain that
/// could not be deleted is `fatal`, since it leaks a secret store.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub suppressed: Vec<SignprepError>,
    pub fatal: Option<SignprepError>,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.suppressed.is_empty() && self.fatal.is_none()
    }

    /// Returns the fatal error, if any. Suppressed errors have already been logged.
    pub fn into_result(self) -> Result<()> {
        match self.fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Owns the keychain and profile files of one credentials preparation.
#[derive(Debug)]
pub struct CredentialsManager {
    config: SigningConfig,
    application_target: Option<String>,
    keychain: EphemeralKeychain,
    profiles: Vec<ProvisioningProfile>,
}

impl CredentialsManager {
    pub fn new(security: Arc<dyn SecurityTool>, config: SigningConfig) -> Self {
        let keychain = EphemeralKeychain::new(security, &config);
        Self {
            config,
            application_target: None,
            keychain,
            profiles: Vec::new(),
        }
    }

    /// Creates a manager that drives the `security` binary named in `config`.
    pub fn from_config(config: SigningConfig) -> Self {
        let security = Arc::new(SecurityCli::new(config.security_path.clone()));
        Self::new(security, config)
    }

    /// Names the application target instead of inferring it from bundle identifiers.
    pub fn with_application_target(mut self, target: impl Into<String>) -> Self {
        self.application_target = Some(target.into());
        self
    }

    pub fn keychain_path(&self) -> &Path {
        self.keychain.path()
    }

    pub fn keychain_state(&self) -> KeychainState {
        self.keychain.state()
    }

    /// Prepares signing credentials for every target.
    ///
    /// Targets are processed one at a time in name order because each step
    /// inspects keychain state left by the previous one.
    pub async fn prepare(
        &mut self,
        targets: &BTreeMap<String, TargetCredentials>,
    ) -> Result<PreparedCredentials> {
        if targets.is_empty() {
            return Err(SignprepError::InvalidInput(
                "No build targets to prepare credentials for".to_string(),
            ));
        }
        if let Some(name) = &self.application_target {
            if !targets.contains_key(name) {
                return Err(SignprepError::InvalidInput(format!(
                    "Application target '{}' is not among the targets with credentials",
                    name
                )));
            }
        }

        match self.prepare_all(targets).await {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                tracing::warn!("Credentials preparation failed, cleaning up: {}", e);
                let report = self.clean_up().await;
                if let Some(fatal) = &report.fatal {
                    tracing::error!(
                        "Keychain {} could not be removed after failure: {}",
                        self.keychain.path().display(),
                        fatal
                    );
                }
                Err(e)
            }
        }
    }

    async fn prepare_all(
        &mut self,
        targets: &BTreeMap<String, TargetCredentials>,
    ) -> Result<PreparedCredentials> {
        self.keychain.create().await?;

        let mut prepared = BTreeMap::new();
        for (target, credentials) in targets {
            tracing::info!("Preparing credentials for target {}", target);
            let data = self.prepare_target(target, credentials).await?;
            prepared.insert(target.clone(), data);
        }

        let application_target_profile = self.select_application_target(&prepared)?.clone();
        tracing::info!(
            "Application target is {} ({})",
            application_target_profile.target,
            application_target_profile.bundle_identifier
        );

        for data in prepared.values() {
            if data.distribution_type != application_target_profile.distribution_type {
                tracing::warn!(
                    "Target {} uses a {} profile while the application target uses {}",
                    data.target,
                    data.distribution_type,
                    application_target_profile.distribution_type
                );
            }
        }

        Ok(PreparedCredentials {
            distribution_type: application_target_profile.distribution_type,
            team_id: application_target_profile.team_id.clone(),
            keychain_path: self.keychain.path().to_path_buf(),
            application_target_profile,
            target_provisioning_profiles: prepared,
        })
    }

    async fn prepare_target(
        &mut self,
        target: &str,
        credentials: &TargetCredentials,
    ) -> Result<ProvisioningProfileData> {
        let certificate = &credentials.distribution_certificate;
        let metadata = inspect_certificate(certificate)?;
        tracing::debug!(
            "Distribution certificate for {}: {} ({})",
            target,
            metadata.common_name,
            metadata.fingerprint
        );
        if metadata.expires_at.is_some_and(|expires| expires <= Utc::now()) {
            tracing::warn!(
                "Distribution certificate '{}' for target {} has expired",
                metadata.common_name,
                target
            );
        }

        self.import_certificate(&certificate.data, &certificate.password)
            .await?;

        let mut profile = ProvisioningProfile::load(
            &credentials.provisioning_profile,
            target,
            &metadata.common_name,
            &self.config.temp_dir,
        )
        .await?;

        let checked = match self
            .keychain
            .ensure_certificate_imported(&profile.data().team_id, &metadata.fingerprint)
            .await
        {
            Ok(()) => profile.verify_certificate(&metadata.fingerprint),
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            if let Err(destroy_err) = profile.destroy().await {
                tracing::error!("Failed to remove provisioning profile: {}", destroy_err);
            }
            return Err(e);
        }

        let data = profile.data().clone();
        if data.is_expired(Utc::now()) {
            tracing::warn!(
                "Provisioning profile '{}' for target {} has expired",
                data.name,
                target
            );
        }
        self.profiles.push(profile);

        tracing::info!(
            "Prepared {} profile '{}' for {} ({})",
            data.distribution_type,
            data.name,
            target,
            data.bundle_identifier
        );
        Ok(data)
    }

    /// Writes the PKCS#12 bytes to a private temp directory for the
    /// duration of the import.
    async fn import_certificate(
        &self,
        data: &[u8],
        password: &secrecy::SecretString,
    ) -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("signprep-cert-")
            .tempdir_in(&self.config.temp_dir)?;
        let p12_path = temp_dir.path().join("certificate.p12");
        tokio::fs::write(&p12_path, data).await?;

        let result = self.keychain.import_certificate(&p12_path, password).await;

        if let Err(e) = temp_dir.close() {
            tracing::warn!("Failed to remove temporary certificate file: {}", e);
        }
        result
    }

    /// Picks the target whose profile is for the containing app.
    ///
    /// Without an explicit choice, the lexicographically smallest bundle
    /// identifier wins: extensions conventionally append a suffix to the
    /// app's identifier.
    fn select_application_target<'a>(
        &self,
        prepared: &'a BTreeMap<String, ProvisioningProfileData>,
    ) -> Result<&'a ProvisioningProfileData> {
        if let Some(name) = &self.application_target {
            return prepared.get(name).ok_or_else(|| {
                SignprepError::InvalidInput(format!("Application target '{}' was not prepared", name))
            });
        }

        prepared
            .values()
            .min_by(|a, b| a.bundle_identifier.cmp(&b.bundle_identifier))
            .ok_or_else(|| SignprepError::InvalidInput("No targets were prepared".to_string()))
    }

    /// Destroys the keychain, then every materialized profile.
    ///
    /// Safe to call repeatedly and after a failed preparation.
    pub async fn clean_up(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Err(e) = self.keychain.destroy().await {
            tracing::error!("Failed to destroy keychain: {}", e);
            report.fatal = Some(e);
        }

        let mut remaining = Vec::new();
        for mut profile in self.profiles.drain(..) {
            if let Err(e) = profile.destroy().await {
                tracing::error!(
                    "Failed to remove provisioning profile {}: {}",
                    profile.path().display(),
                    e
                );
                report.suppressed.push(e);
                remaining.push(profile);
            }
        }
        self.profiles = remaining;

        report
    }
}
