//! Code signing models for iOS and Android.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Result, SignprepError};

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value.trim())
        .map_err(|e| SignprepError::InvalidInput(format!("{} is not valid base64: {}", field, e)))
}

// ============================================================================
// iOS inputs
// ============================================================================

/// A password-protected PKCS#12 container holding a distribution certificate.
pub struct DistributionCertificate {
    /// Raw PKCS#12 bytes.
    pub data: Vec<u8>,
    /// Unlock password; empty when the container has none.
    pub password: SecretString,
}

impl DistributionCertificate {
    pub fn new(data: Vec<u8>, password: Option<String>) -> Self {
        Self {
            data,
            password: SecretString::from(password.unwrap_or_default()),
        }
    }

    /// Creates a certificate from base64 as stored by the credentials service.
    pub fn from_base64(data_base64: &str, password: Option<String>) -> Result<Self> {
        let data = decode_base64("Distribution certificate", data_base64)?;
        Ok(Self::new(data, password))
    }
}

impl std::fmt::Debug for DistributionCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionCertificate")
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .field("password", &self.password)
            .finish()
    }
}

/// Credentials supplied for one build target.
#[derive(Debug)]
pub struct TargetCredentials {
    pub distribution_certificate: DistributionCertificate,
    /// Raw CMS-signed `.mobileprovision` bytes.
    pub provisioning_profile: Vec<u8>,
}

impl TargetCredentials {
    pub fn from_base64(
        certificate_base64: &str,
        certificate_password: Option<String>,
        profile_base64: &str,
    ) -> Result<Self> {
        Ok(Self {
            distribution_certificate: DistributionCertificate::from_base64(
                certificate_base64,
                certificate_password,
            )?,
            provisioning_profile: decode_base64("Provisioning profile", profile_base64)?,
        })
    }
}

// ============================================================================
// iOS derived data
// ============================================================================

/// How an app signed with a provisioning profile can be distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionType {
    Development,
    AdHoc,
    Enterprise,
    AppStore,
}

impl DistributionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionType::Development => "development",
            DistributionType::AdHoc => "ad-hoc",
            DistributionType::Enterprise => "enterprise",
            DistributionType::AppStore => "app-store",
        }
    }
}

impl std::str::FromStr for DistributionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" => Ok(DistributionType::Development),
            "ad-hoc" | "adhoc" => Ok(DistributionType::AdHoc),
            "enterprise" => Ok(DistributionType::Enterprise),
            "app-store" | "appstore" => Ok(DistributionType::AppStore),
            _ => Err(format!("Unknown distribution type: {}", s)),
        }
    }
}

impl std::fmt::Display for DistributionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata extracted from a distribution certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateMetadata {
    /// SHA-1 of the DER certificate, uppercase hex.
    pub fingerprint: String,
    /// Common name from the certificate subject.
    pub common_name: String,
    /// Team ID (organizational unit from subject).
    pub team_id: Option<String>,
    /// Certificate serial number, uppercase hex.
    pub serial_number: Option<String>,
    /// Certificate expiration date.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Decoded provisioning profile, materialized on disk for the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningProfileData {
    /// Location of the `.mobileprovision` file for the packaging step.
    pub path: PathBuf,
    /// Build target the profile was prepared for.
    pub target: String,
    pub bundle_identifier: String,
    pub team_id: String,
    pub uuid: String,
    pub name: String,
    pub distribution_type: DistributionType,
    /// First DER certificate listed in `DeveloperCertificates`.
    #[serde(skip)]
    pub developer_certificate: Vec<u8>,
    /// Fingerprints of every certificate listed in `DeveloperCertificates`.
    pub developer_certificate_fingerprints: Vec<String>,
    /// Common name of the distribution certificate paired with this profile.
    pub certificate_common_name: String,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl ProvisioningProfileData {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|expires| expires <= now)
    }
}

/// Signing material ready for the packaging step.
///
/// The keychain and profile files referenced here stay valid only until
/// the producing manager's `clean_up` runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedCredentials {
    pub application_target_profile: ProvisioningProfileData,
    pub keychain_path: PathBuf,
    pub target_provisioning_profiles: BTreeMap<String, ProvisioningProfileData>,
    pub distribution_type: DistributionType,
    pub team_id: String,
}

/// A code signing identity listed by the keychain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningIdentity {
    pub fingerprint: String,
    pub name: String,
}

// ============================================================================
// Android
// ============================================================================

/// Binary container format of an Android keystore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeystoreType {
    Jks,
    Pkcs12,
    Unknown,
}

impl KeystoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeystoreType::Jks => "jks",
            KeystoreType::Pkcs12 => "pkcs12",
            KeystoreType::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for KeystoreType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jks" => Ok(KeystoreType::Jks),
            "pkcs12" => Ok(KeystoreType::Pkcs12),
            "unknown" => Ok(KeystoreType::Unknown),
            _ => Err(format!("Unknown keystore type: {}", s)),
        }
    }
}

impl std::fmt::Display for KeystoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An Android upload keystore with the secrets needed to use it.
pub struct Keystore {
    pub data: Vec<u8>,
    pub keystore_password: SecretString,
    pub key_alias: String,
    /// Falls back to the keystore password when absent.
    pub key_password: Option<SecretString>,
}

impl Keystore {
    pub fn new(
        data: Vec<u8>,
        keystore_password: String,
        key_alias: String,
        key_password: Option<String>,
    ) -> Self {
        Self {
            data,
            keystore_password: SecretString::from(keystore_password),
            key_alias,
            key_password: key_password.map(SecretString::from),
        }
    }

    pub fn from_base64(
        data_base64: &str,
        keystore_password: String,
        key_alias: String,
        key_password: Option<String>,
    ) -> Result<Self> {
        let data = decode_base64("Keystore", data_base64)?;
        Ok(Self::new(data, keystore_password, key_alias, key_password))
    }

    /// Password protecting the key entry.
    pub fn effective_key_password(&self) -> &str {
        self.key_password
            .as_ref()
            .unwrap_or(&self.keystore_password)
            .expose_secret()
    }
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore")
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .field("keystore_password", &self.keystore_password)
            .field("key_alias", &self.key_alias)
            .field("key_password", &self.key_password)
            .finish()
    }
}

/// A keystore tagged with its detected container format.
#[derive(Debug)]
pub struct KeystoreWithType {
    pub keystore: Keystore,
    pub keystore_type: KeystoreType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_type_roundtrip_strings() {
        for ty in [
            DistributionType::Development,
            DistributionType::AdHoc,
            DistributionType::Enterprise,
            DistributionType::AppStore,
        ] {
            assert_eq!(ty.as_str().parse::<DistributionType>().unwrap(), ty);
        }
        assert!("internal".parse::<DistributionType>().is_err());
    }

    #[test]
    fn test_distribution_type_serializes_kebab_case() {
        let json = serde_json::to_string(&DistributionType::AdHoc).unwrap();
        assert_eq!(json, "\"ad-hoc\"");
    }

    #[test]
    fn test_keystore_type_parse() {
        assert_eq!("JKS".parse::<KeystoreType>().unwrap(), KeystoreType::Jks);
        assert_eq!("pkcs12".parse::<KeystoreType>().unwrap(), KeystoreType::Pkcs12);
        assert!("bks".parse::<KeystoreType>().is_err());
    }

    #[test]
    fn test_key_password_falls_back_to_keystore_password() {
        let keystore = Keystore::new(vec![1, 2, 3], "store".into(), "upload".into(), None);
        assert_eq!(keystore.effective_key_password(), "store");

        let keystore = Keystore::new(vec![], "store".into(), "upload".into(), Some("key".into()));
        assert_eq!(keystore.effective_key_password(), "key");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cert = DistributionCertificate::new(vec![0; 16], Some("hunter2".into()));
        let debug = format!("{:?}", cert);
        assert!(debug.contains("<16 bytes>"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_from_base64_rejects_garbage() {
        let result = DistributionCertificate::from_base64("not base64!!", None);
        assert!(matches!(result, Err(SignprepError::InvalidInput(_))));
    }
}
