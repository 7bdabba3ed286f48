//! Keychain maintenance commands.

use anyhow::Result;
use signprep_core::SigningConfig;
use signprep_core::signing::{EphemeralKeychain, SecurityCli};

/// Deletes keychains left behind by interrupted preparations.
pub async fn clean_keychains(config: &SigningConfig) -> Result<()> {
    let security = SecurityCli::new(config.security_path.clone());
    let deleted = EphemeralKeychain::clean_up_stale(&security, config).await?;

    match deleted {
        0 => println!("No stale keychains found"),
        1 => println!("Removed 1 stale keychain"),
        n => println!("Removed {} stale keychains", n),
    }
    Ok(())
}
