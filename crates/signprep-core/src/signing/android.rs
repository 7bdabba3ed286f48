//! Android keystore classification and validation.
//!
//! Upload keystores come in two incompatible containers, PKCS#12 and the
//! legacy JKS format. Both are parsed in-process; the input bytes are
//! never modified or written anywhere.

use openssl::pkcs12::Pkcs12;
use secrecy::ExposeSecret;

use super::certificate::{is_mac_failure, load_legacy_provider};
use super::jks::{self, JksEntry, JksError, JksKeystore};
use crate::error::{Result, SignprepError};
use crate::models::{Keystore, KeystoreType, KeystoreWithType};

/// Result of one format probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Detected(KeystoreType),
    TriedNext { reason: String },
}

type Probe = fn(&Keystore) -> ProbeOutcome;

/// Probes in the order they are attempted.
const PROBES: [Probe; 2] = [probe_pkcs12, probe_jks];

fn probe_pkcs12(keystore: &Keystore) -> ProbeOutcome {
    load_legacy_provider();
    let parsed = Pkcs12::from_der(&keystore.data)
        .and_then(|pkcs12| pkcs12.parse2(keystore.keystore_password.expose_secret()));
    match parsed {
        Ok(_) => ProbeOutcome::Detected(KeystoreType::Pkcs12),
        Err(e) => ProbeOutcome::TriedNext {
            reason: format!("not a PKCS#12 keystore with this password: {}", e),
        },
    }
}

fn probe_jks(keystore: &Keystore) -> ProbeOutcome {
    match JksKeystore::parse(&keystore.data, keystore.keystore_password.expose_secret()) {
        Ok(_) => ProbeOutcome::Detected(KeystoreType::Jks),
        Err(e) => ProbeOutcome::TriedNext {
            reason: format!("not a JKS keystore with this password: {}", e),
        },
    }
}

/// Detects the container format of `keystore`.
///
/// Classification is advisory: anything neither probe accepts, including a
/// valid keystore opened with the wrong password, is `Unknown`.
pub fn classify(keystore: &Keystore) -> KeystoreType {
    for probe in PROBES {
        match probe(keystore) {
            ProbeOutcome::Detected(keystore_type) => {
                tracing::debug!("Detected {} keystore", keystore_type);
                return keystore_type;
            }
            ProbeOutcome::TriedNext { reason } => tracing::debug!("{}", reason),
        }
    }

    KeystoreType::Unknown
}

/// Classifies `keystore` and tags it with the detected type.
pub fn with_type(keystore: Keystore) -> KeystoreWithType {
    let keystore_type = classify(&keystore);
    KeystoreWithType {
        keystore,
        keystore_type,
    }
}

/// Checks that the key alias and key password actually work.
pub fn validate(keystore: &KeystoreWithType) -> Result<()> {
    match keystore.keystore_type {
        KeystoreType::Jks => validate_jks(&keystore.keystore),
        KeystoreType::Pkcs12 => validate_pkcs12(&keystore.keystore),
        KeystoreType::Unknown => {
            tracing::warn!(
                "Unknown keystore type, skipping validation of alias '{}'",
                keystore.keystore.key_alias
            );
            Ok(())
        }
    }
}

fn alias_hint() -> String {
    "Run `keytool -list -v -keystore <keystore file>` to see the aliases it contains.".to_string()
}

fn validate_jks(keystore: &Keystore) -> Result<()> {
    let alias = &keystore.key_alias;
    let parsed = JksKeystore::parse(&keystore.data, keystore.keystore_password.expose_secret())
        .map_err(|e| SignprepError::Keystore(format!("Failed to open JKS keystore: {}", e)))?;

    let entry = parsed
        .find(alias)
        .ok_or_else(|| SignprepError::KeystoreAliasNotFound {
            alias: alias.clone(),
            hint: alias_hint(),
        })?;

    let JksEntry::PrivateKey { encrypted_key, .. } = entry else {
        return Err(SignprepError::Keystore(format!(
            "Alias '{}' is a trusted certificate entry, not a private key",
            alias
        )));
    };

    match jks::decrypt_private_key(encrypted_key, keystore.effective_key_password()) {
        Ok(_) => {
            tracing::debug!("Validated JKS key entry '{}'", entry.alias());
            Ok(())
        }
        Err(JksError::KeyDecryption) => Err(SignprepError::KeystoreKeyPassword {
            alias: alias.clone(),
        }),
        Err(e) => Err(SignprepError::Keystore(format!(
            "Failed to read private key '{}': {}",
            alias, e
        ))),
    }
}

fn validate_pkcs12(keystore: &Keystore) -> Result<()> {
    let alias = &keystore.key_alias;
    load_legacy_provider();
    let parsed = Pkcs12::from_der(&keystore.data)
        .and_then(|pkcs12| pkcs12.parse2(keystore.keystore_password.expose_secret()))
        .map_err(|e| {
            if is_mac_failure(&e) {
                SignprepError::InvalidPassword { subject: "keystore" }
            } else {
                SignprepError::Keystore(format!("Failed to open PKCS#12 keystore: {}", e))
            }
        })?;

    let found = parsed
        .cert
        .iter()
        .map(|cert| &**cert)
        .chain(parsed.ca.iter().flat_map(|stack| stack.iter()))
        .filter_map(|cert| cert.alias())
        .any(|friendly_name| String::from_utf8_lossy(friendly_name).eq_ignore_ascii_case(alias));

    if !found {
        return Err(SignprepError::KeystoreAliasNotFound {
            alias: alias.clone(),
            hint: alias_hint(),
        });
    }

    if parsed.pkey.is_none() {
        tracing::warn!("PKCS#12 keystore has no private key for alias '{}'", alias);
    }
    tracing::debug!("Validated PKCS#12 certificate '{}'", alias);
    Ok(())
}
