//! Android keystore commands.

use anyhow::{Context, Result};
use signprep_core::models::{Keystore, KeystoreType};
use signprep_core::signing::android;
use std::path::Path;

/// Classifies a keystore and validates its key entry.
pub fn check_keystore(
    file: &Path,
    keystore_password: String,
    alias: String,
    key_password: Option<String>,
) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let keystore = android::with_type(Keystore::new(data, keystore_password, alias, key_password));

    println!("Keystore type: {}", keystore.keystore_type);
    if keystore.keystore_type == KeystoreType::Unknown {
        println!("The keystore could not be opened as JKS or PKCS#12 with this password.");
    }

    android::validate(&keystore)?;
    if keystore.keystore_type != KeystoreType::Unknown {
        println!("Key '{}' is valid", keystore.keystore.key_alias);
    }

    Ok(())
}
