//! iOS credential inspection commands.

use anyhow::{Context, Result};
use chrono::Utc;
use signprep_core::SigningConfig;
use signprep_core::models::DistributionCertificate;
use signprep_core::signing::ProvisioningProfile;
use signprep_core::signing::certificate::inspect_certificate;
use std::path::Path;

/// Prints the metadata of a distribution certificate.
pub fn inspect_cert(file: &Path, password: Option<String>) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let cert = DistributionCertificate::new(data, password);
    let metadata = inspect_certificate(&cert).context("Failed to inspect certificate")?;

    println!("Common name:  {}", metadata.common_name);
    println!("Fingerprint:  {}", metadata.fingerprint);
    println!("Team ID:      {}", metadata.team_id.as_deref().unwrap_or("-"));
    println!("Serial:       {}", metadata.serial_number.as_deref().unwrap_or("-"));
    match metadata.expires_at {
        Some(expires) if expires <= Utc::now() => println!("Expires:      {} (expired)", expires),
        Some(expires) => println!("Expires:      {}", expires),
        None => println!("Expires:      -"),
    }

    Ok(())
}

/// Decodes a provisioning profile and prints its data.
///
/// The profile is materialized like a real preparation would, then removed.
pub async fn inspect_profile(file: &Path, config: &SigningConfig) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let target = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut profile = ProvisioningProfile::load(&data, &target, "", &config.temp_dir)
        .await
        .context("Failed to decode provisioning profile")?;
    let info = profile.data().clone();
    profile.destroy().await?;

    println!("Name:               {}", info.name);
    println!("UUID:               {}", info.uuid);
    println!("Bundle identifier:  {}", info.bundle_identifier);
    println!("Team ID:            {}", info.team_id);
    println!("Distribution type:  {}", info.distribution_type);
    match info.expiration_date {
        Some(expires) if info.is_expired(Utc::now()) => {
            println!("Expires:            {} (expired)", expires)
        }
        Some(expires) => println!("Expires:            {}", expires),
        None => println!("Expires:            -"),
    }
    println!("Certificates:");
    for fingerprint in &info.developer_certificate_fingerprints {
        println!("  {}", fingerprint);
    }

    Ok(())
}
