//! Distribution certificate inspection.
//!
//! Decodes password-protected PKCS#12 containers in-process with OpenSSL
//! and derives the values the rest of the engine keys on: the SHA-1
//! fingerprint and the subject common name.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::provider::Provider;
use openssl::x509::{X509, X509NameRef};
use secrecy::ExposeSecret;

use crate::crypto::sha1_fingerprint;
use crate::error::{Result, SignprepError};
use crate::models::{CertificateMetadata, DistributionCertificate};

static LEGACY_PROVIDER: OnceLock<Option<Provider>> = OnceLock::new();

/// Loads OpenSSL's legacy provider once per process.
///
/// Keychain Access and older keytool releases encrypt PKCS#12 bags with
/// RC2-40 and 3DES, which OpenSSL 3 only offers through this provider.
/// The default provider stays available alongside it.
pub(crate) fn load_legacy_provider() {
    LEGACY_PROVIDER.get_or_init(|| match Provider::try_load(None, "legacy", true) {
        Ok(provider) => {
            tracing::debug!("Loaded OpenSSL legacy provider");
            Some(provider)
        }
        Err(e) => {
            tracing::warn!(
                "OpenSSL legacy provider is unavailable, RC2/3DES encrypted PKCS#12 files cannot be read: {}",
                e
            );
            None
        }
    });
}

/// Returns the SHA-1 fingerprint of the certificate's DER encoding.
pub fn fingerprint(cert: &DistributionCertificate) -> Result<String> {
    let x509 = decode(cert)?;
    der_fingerprint(&x509)
}

/// Returns the common name of the certificate subject.
pub fn common_name(cert: &DistributionCertificate) -> Result<String> {
    let x509 = decode(cert)?;
    subject_common_name(&x509)
}

/// Extracts every piece of metadata in a single decode.
pub fn inspect_certificate(cert: &DistributionCertificate) -> Result<CertificateMetadata> {
    let x509 = decode(cert)?;

    let serial_number = x509
        .serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|hex| hex.to_string()))
        .ok();

    Ok(CertificateMetadata {
        fingerprint: der_fingerprint(&x509)?,
        common_name: subject_common_name(&x509)?,
        team_id: name_entry(x509.subject_name(), Nid::ORGANIZATIONALUNITNAME),
        serial_number,
        expires_at: parse_asn1_time(&x509.not_after().to_string()),
    })
}

/// Fingerprint of a bare DER certificate, as embedded in provisioning profiles.
pub fn der_certificate_fingerprint(der: &[u8]) -> Result<String> {
    let x509 = X509::from_der(der).map_err(|e| {
        SignprepError::ProfileDecode(format!("Embedded developer certificate is invalid: {}", e))
    })?;
    der_fingerprint(&x509)
}

fn decode(cert: &DistributionCertificate) -> Result<X509> {
    let pkcs12 = Pkcs12::from_der(&cert.data).map_err(|e| {
        SignprepError::MalformedCertificate(format!("Not a PKCS#12 container: {}", e))
    })?;

    load_legacy_provider();
    let parsed = pkcs12
        .parse2(cert.password.expose_secret())
        .map_err(|e| {
            if is_mac_failure(&e) {
                SignprepError::InvalidPassword {
                    subject: "distribution certificate",
                }
            } else {
                SignprepError::MalformedCertificate(format!("Failed to decode PKCS#12: {}", e))
            }
        })?;

    parsed.cert.ok_or_else(|| {
        SignprepError::MalformedCertificate("PKCS#12 container has no certificate bag".to_string())
    })
}

/// Whether OpenSSL rejected the container because the MAC did not verify,
/// which is how a wrong password manifests.
pub(crate) fn is_mac_failure(errors: &ErrorStack) -> bool {
    errors
        .errors()
        .iter()
        .any(|e| e.reason().is_some_and(|reason| reason.contains("mac verify failure")))
}

fn der_fingerprint(x509: &X509) -> Result<String> {
    let der = x509.to_der().map_err(|e| {
        SignprepError::MalformedCertificate(format!("Failed to re-encode certificate: {}", e))
    })?;
    Ok(sha1_fingerprint(&der))
}

fn subject_common_name(x509: &X509) -> Result<String> {
    name_entry(x509.subject_name(), Nid::COMMONNAME).ok_or_else(|| {
        SignprepError::MalformedCertificate("Certificate subject has no common name".to_string())
    })
}

fn name_entry(name: &X509NameRef, nid: Nid) -> Option<String> {
    name.entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|value| value.to_string())
}

/// Parses OpenSSL's `Dec 31 23:59:59 2024 GMT` rendering of an ASN.1 time.
fn parse_asn1_time(value: &str) -> Option<DateTime<Utc>> {
    // Single-digit days are space padded
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT")
        .ok()
        .map(|date| DateTime::from_naive_utc_and_offset(date, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestCertificate;
    use chrono::Datelike;

    #[test]
    fn test_fingerprint_is_stable() {
        let test_cert = TestCertificate::generate("Apple Distribution: Acme Inc (ABCDE12345)", "ABCDE12345", "s3cret");
        let cert = test_cert.distribution_certificate();

        let first = fingerprint(&cert).unwrap();
        let second = fingerprint(&cert).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, test_cert.fingerprint);
        assert_eq!(first.len(), 40);
        assert!(first.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_common_name() {
        let test_cert = TestCertificate::generate("Apple Distribution: Acme Inc (ABCDE12345)", "ABCDE12345", "s3cret");
        let cert = test_cert.distribution_certificate();
        assert_eq!(
            common_name(&cert).unwrap(),
            "Apple Distribution: Acme Inc (ABCDE12345)"
        );
    }

    #[test]
    fn test_wrong_password_is_distinguishable() {
        let test_cert = TestCertificate::generate("Apple Distribution: Acme Inc (ABCDE12345)", "ABCDE12345", "s3cret");
        let cert = DistributionCertificate::new(test_cert.p12.clone(), Some("wrong".to_string()));

        let err = fingerprint(&cert).unwrap_err();
        assert!(matches!(err, SignprepError::InvalidPassword { .. }));
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let cert = DistributionCertificate::new(b"definitely not pkcs12".to_vec(), None);
        let err = common_name(&cert).unwrap_err();
        assert!(matches!(err, SignprepError::MalformedCertificate(_)));
    }

    #[test]
    fn test_inspect_certificate() {
        let test_cert = TestCertificate::generate("Apple Distribution: Acme Inc (ABCDE12345)", "ABCDE12345", "s3cret");
        let metadata = inspect_certificate(&test_cert.distribution_certificate()).unwrap();

        assert_eq!(metadata.fingerprint, test_cert.fingerprint);
        assert_eq!(metadata.team_id.as_deref(), Some("ABCDE12345"));
        assert!(metadata.serial_number.is_some());
        let expires_at = metadata.expires_at.unwrap();
        assert!(expires_at > Utc::now());
    }

    #[test]
    fn test_der_certificate_fingerprint_matches_container() {
        let test_cert = TestCertificate::generate("Apple Distribution: Acme Inc (ABCDE12345)", "ABCDE12345", "");
        assert_eq!(
            der_certificate_fingerprint(&test_cert.der).unwrap(),
            test_cert.fingerprint
        );
    }

    const LEGACY_P12: &[u8] = include_bytes!("../../tests/fixtures/legacy.p12");

    #[test]
    fn test_legacy_encrypted_container() {
        // RC2-40 certificate bag and 3DES key bag, as Keychain Access exports them
        let cert = DistributionCertificate::new(LEGACY_P12.to_vec(), Some("legacypass".to_string()));

        assert_eq!(
            fingerprint(&cert).unwrap(),
            "405CC18324328A9E3509FD16642B3BFA7AAADC93"
        );
        assert_eq!(
            common_name(&cert).unwrap(),
            "Apple Distribution: Acme Inc (ABCDE12345)"
        );
        let metadata = inspect_certificate(&cert).unwrap();
        assert_eq!(metadata.team_id.as_deref(), Some("ABCDE12345"));
    }

    #[test]
    fn test_legacy_container_wrong_password() {
        let cert = DistributionCertificate::new(LEGACY_P12.to_vec(), Some("wrong".to_string()));
        let err = fingerprint(&cert).unwrap_err();
        assert!(matches!(err, SignprepError::InvalidPassword { .. }));
    }

    #[test]
    fn test_parse_asn1_time_handles_padded_days() {
        let parsed = parse_asn1_time("Jan  5 10:00:00 2030 GMT").unwrap();
        assert_eq!(parsed.year(), 2030);
        assert_eq!(parsed.day(), 5);
        assert!(parse_asn1_time("not a date").is_none());
    }
}
