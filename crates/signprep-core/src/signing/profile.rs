//! iOS provisioning profile decoding.
//!
//! A `.mobileprovision` file is a CMS SignedData envelope around an XML
//! plist. The envelope is opened with OpenSSL, the signature is checked
//! against the signer certificate it carries, and the plist is mapped to
//! [`ProvisioningProfileData`]. The original signed bytes are written to
//! a temporary file because the packaging step consumes the file itself.

use chrono::{DateTime, Utc};
use openssl::cms::{CMSOptions, CmsContentInfo};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::certificate::der_certificate_fingerprint;
use crate::error::{Result, SignprepError};
use crate::models::{DistributionType, ProvisioningProfileData};

/// A provisioning profile materialized on disk for one build target.
#[derive(Debug)]
pub struct ProvisioningProfile {
    data: ProvisioningProfileData,
    destroyed: bool,
}

impl ProvisioningProfile {
    /// Decodes `profile` and writes it to a fresh file in `dir`.
    ///
    /// Malformed input never reaches the disk.
    pub async fn load(
        profile: &[u8],
        target: &str,
        certificate_common_name: &str,
        dir: &Path,
    ) -> Result<Self> {
        let plist_bytes = decode_cms(profile)?;
        let path = dir.join(format!("{}.mobileprovision", ulid::Ulid::new()));
        let data = parse_profile_plist(&plist_bytes, path, target, certificate_common_name)?;

        tokio::fs::write(&data.path, profile).await.map_err(|e| {
            SignprepError::ProfileDecode(format!(
                "Failed to write profile to {}: {}",
                data.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            "Materialized provisioning profile '{}' ({}) for target {} at {}",
            data.name,
            data.uuid,
            target,
            data.path.display()
        );

        Ok(Self {
            data,
            destroyed: false,
        })
    }

    pub fn data(&self) -> &ProvisioningProfileData {
        &self.data
    }

    pub fn path(&self) -> &Path {
        &self.data.path
    }

    /// Checks that the certificate with `fingerprint` is one the profile was issued for.
    pub fn verify_certificate(&self, fingerprint: &str) -> Result<()> {
        if self
            .data
            .developer_certificate_fingerprints
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(fingerprint))
        {
            return Ok(());
        }

        Err(SignprepError::CertificateProfileMismatch {
            profile_fingerprints: self.data.developer_certificate_fingerprints.join(", "),
            certificate_fingerprint: fingerprint.to_string(),
        })
    }

    /// Removes the materialized profile file. Calling it again is a no-op.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }

        match tokio::fs::remove_file(&self.data.path).await {
            Ok(()) => {
                tracing::debug!("Removed provisioning profile: {}", self.data.path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.destroyed = true;
        Ok(())
    }
}

/// Opens the CMS envelope and returns the signed plist bytes.
pub fn decode_cms(profile: &[u8]) -> Result<Vec<u8>> {
    let mut cms = CmsContentInfo::from_der(profile)
        .map_err(|e| SignprepError::ProfileDecode(format!("Not a CMS signed document: {}", e)))?;

    // Apple's chain is not evaluated here; the signature must still match the content
    let mut content = Vec::new();
    cms.verify(
        None,
        None,
        None,
        Some(&mut content),
        CMSOptions::NO_SIGNER_CERT_VERIFY | CMSOptions::BINARY,
    )
    .map_err(|e| SignprepError::ProfileDecode(format!("Signature verification failed: {}", e)))?;

    Ok(content)
}

/// Parses profile plist content into profile data.
fn parse_profile_plist(
    plist_bytes: &[u8],
    path: PathBuf,
    target: &str,
    certificate_common_name: &str,
) -> Result<ProvisioningProfileData> {
    let plist: plist::Value = plist::from_bytes(plist_bytes)
        .map_err(|e| SignprepError::ProfileDecode(format!("Failed to parse profile plist: {}", e)))?;

    let dict = plist
        .as_dictionary()
        .ok_or_else(|| SignprepError::ProfileDecode("Profile plist is not a dictionary".to_string()))?;

    let uuid = dict
        .get("UUID")
        .and_then(|v| v.as_string())
        .ok_or_else(|| SignprepError::ProfileDecode("Profile missing UUID".to_string()))?
        .to_string();

    let name = dict
        .get("Name")
        .and_then(|v| v.as_string())
        .unwrap_or("Unnamed Profile")
        .to_string();

    let team_id = dict
        .get("TeamIdentifier")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.as_string())
        .ok_or_else(|| SignprepError::ProfileDecode("Profile missing TeamIdentifier".to_string()))?
        .to_string();

    // application-identifier is "<team prefix>.<bundle id>"
    let bundle_identifier = dict
        .get("Entitlements")
        .and_then(|v| v.as_dictionary())
        .and_then(|ents| ents.get("application-identifier"))
        .and_then(|v| v.as_string())
        .map(|s| match s.split_once('.') {
            Some((_, bundle_id)) => bundle_id.to_string(),
            None => s.to_string(),
        })
        .ok_or_else(|| {
            SignprepError::ProfileDecode(
                "Profile missing application-identifier entitlement".to_string(),
            )
        })?;

    let developer_certificates: Vec<Vec<u8>> = dict
        .get("DeveloperCertificates")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_data())
                .map(|data| data.to_vec())
                .collect()
        })
        .unwrap_or_default();

    let developer_certificate = developer_certificates.first().cloned().ok_or_else(|| {
        SignprepError::ProfileDecode("Profile has no DeveloperCertificates".to_string())
    })?;

    let developer_certificate_fingerprints = developer_certificates
        .iter()
        .map(|der| der_certificate_fingerprint(der))
        .collect::<Result<Vec<_>>>()?;

    let expiration_date = dict
        .get("ExpirationDate")
        .and_then(|v| v.as_date())
        .and_then(|d| {
            let system_time: SystemTime = d.into();
            system_time
                .duration_since(SystemTime::UNIX_EPOCH)
                .ok()
                .and_then(|dur| DateTime::<Utc>::from_timestamp(dur.as_secs() as i64, 0))
        });

    Ok(ProvisioningProfileData {
        path,
        target: target.to_string(),
        bundle_identifier,
        team_id,
        uuid,
        name,
        distribution_type: determine_distribution_type(dict),
        developer_certificate,
        developer_certificate_fingerprints,
        certificate_common_name: certificate_common_name.to_string(),
        expiration_date,
    })
}

/// Determines the distribution type from the plist dictionary.
fn determine_distribution_type(dict: &plist::Dictionary) -> DistributionType {
    if dict.get("ProvisionsAllDevices").and_then(|v| v.as_boolean()) == Some(true) {
        return DistributionType::Enterprise;
    }

    if dict.contains_key("ProvisionedDevices") {
        let get_task_allow = dict
            .get("Entitlements")
            .and_then(|v| v.as_dictionary())
            .and_then(|ents| ents.get("get-task-allow"))
            .and_then(|v| v.as_boolean())
            .unwrap_or(false);

        return if get_task_allow {
            DistributionType::Development
        } else {
            DistributionType::AdHoc
        };
    }

    DistributionType::AppStore
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ProfileSpec, TestCertificate};

    fn signer() -> TestCertificate {
        TestCertificate::generate("Apple Distribution: Acme Inc (ABCDE12345)", "ABCDE12345", "pw")
    }

    #[test]
    fn test_determine_distribution_type_development() {
        let mut dict = plist::Dictionary::new();
        let mut ents = plist::Dictionary::new();
        ents.insert("get-task-allow".to_string(), plist::Value::Boolean(true));
        dict.insert("Entitlements".to_string(), plist::Value::Dictionary(ents));
        dict.insert(
            "ProvisionedDevices".to_string(),
            plist::Value::Array(vec![plist::Value::String("device1".to_string())]),
        );

        assert_eq!(determine_distribution_type(&dict), DistributionType::Development);
    }

    #[test]
    fn test_determine_distribution_type_adhoc() {
        let mut dict = plist::Dictionary::new();
        let mut ents = plist::Dictionary::new();
        ents.insert("get-task-allow".to_string(), plist::Value::Boolean(false));
        dict.insert("Entitlements".to_string(), plist::Value::Dictionary(ents));
        dict.insert(
            "ProvisionedDevices".to_string(),
            plist::Value::Array(vec![plist::Value::String("device1".to_string())]),
        );

        assert_eq!(determine_distribution_type(&dict), DistributionType::AdHoc);
    }

    #[test]
    fn test_determine_distribution_type_enterprise() {
        let mut dict = plist::Dictionary::new();
        dict.insert("ProvisionsAllDevices".to_string(), plist::Value::Boolean(true));

        assert_eq!(determine_distribution_type(&dict), DistributionType::Enterprise);
    }

    #[test]
    fn test_determine_distribution_type_appstore() {
        let mut dict = plist::Dictionary::new();
        let mut ents = plist::Dictionary::new();
        ents.insert("get-task-allow".to_string(), plist::Value::Boolean(false));
        dict.insert("Entitlements".to_string(), plist::Value::Dictionary(ents));

        assert_eq!(determine_distribution_type(&dict), DistributionType::AppStore);
    }

    #[tokio::test]
    async fn test_load_decodes_and_materializes() {
        let cert = signer();
        let dir = tempfile::tempdir().unwrap();
        let spec = ProfileSpec::app_store("com.acme.app", "ABCDE12345", &cert);
        let bytes = spec.sign(&cert);

        let mut profile = ProvisioningProfile::load(&bytes, "Acme", &cert.common_name, dir.path())
            .await
            .unwrap();
        let data = profile.data().clone();

        assert_eq!(data.target, "Acme");
        assert_eq!(data.bundle_identifier, "com.acme.app");
        assert_eq!(data.team_id, "ABCDE12345");
        assert_eq!(data.uuid, spec.uuid);
        assert_eq!(data.name, spec.name);
        assert_eq!(data.distribution_type, DistributionType::AppStore);
        assert_eq!(data.developer_certificate, cert.der);
        assert_eq!(data.certificate_common_name, cert.common_name);
        assert!(data.expiration_date.is_some());
        assert_eq!(std::fs::read(profile.path()).unwrap(), bytes);

        profile.destroy().await.unwrap();
        assert!(!data.path.exists());
        profile.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_certificate() {
        let cert = signer();
        let other = TestCertificate::generate("Apple Distribution: Other (ZYXWV98765)", "ZYXWV98765", "pw");
        let dir = tempfile::tempdir().unwrap();
        let bytes = ProfileSpec::app_store("com.acme.app", "ABCDE12345", &cert).sign(&cert);

        let mut profile = ProvisioningProfile::load(&bytes, "Acme", &cert.common_name, dir.path())
            .await
            .unwrap();

        assert!(profile.verify_certificate(&cert.fingerprint).is_ok());
        assert!(profile.verify_certificate(&cert.fingerprint.to_lowercase()).is_ok());

        let err = profile.verify_certificate(&other.fingerprint).unwrap_err();
        assert!(err.to_string().contains("don't match"));

        profile.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_certificate_accepts_any_listed_certificate() {
        let cert = signer();
        let renewed = TestCertificate::generate("Apple Distribution: Acme Inc (ABCDE12345)", "ABCDE12345", "pw");
        let dir = tempfile::tempdir().unwrap();
        let mut spec = ProfileSpec::app_store("com.acme.app", "ABCDE12345", &cert);
        spec.developer_certificates.push(renewed.der.clone());

        let mut profile =
            ProvisioningProfile::load(&spec.sign(&cert), "Acme", &cert.common_name, dir.path())
                .await
                .unwrap();

        assert_eq!(profile.data().developer_certificate_fingerprints.len(), 2);
        assert!(profile.verify_certificate(&renewed.fingerprint).is_ok());

        profile.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_input_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProvisioningProfile::load(b"<plist>not signed</plist>", "Acme", "CN", dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, SignprepError::ProfileDecode(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_load_rejects_profile_without_bundle_identifier() {
        let cert = signer();
        let dir = tempfile::tempdir().unwrap();
        let mut spec = ProfileSpec::app_store("com.acme.app", "ABCDE12345", &cert);
        spec.application_identifier = None;

        let err = ProvisioningProfile::load(&spec.sign(&cert), "Acme", "CN", dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("application-identifier"));
    }
}
