//! Error types for the signprep core library.

use thiserror::Error;

use crate::signing::KeychainState;

/// Core error type for credential preparation.
#[derive(Error, Debug)]
pub enum SignprepError {
    #[error("Invalid password for {subject}: the supplied password does not unlock it")]
    InvalidPassword { subject: &'static str },

    #[error("Malformed distribution certificate: {0}")]
    MalformedCertificate(String),

    #[error("Failed to decode provisioning profile: {0}")]
    ProfileDecode(String),

    #[error(
        "Provisioning profile and distribution certificate don't match.\n\
         Profile's certificate fingerprint(s) = {profile_fingerprints}, \
         distribution certificate fingerprint = {certificate_fingerprint}"
    )]
    CertificateProfileMismatch {
        profile_fingerprints: String,
        certificate_fingerprint: String,
    },

    #[error("Distribution certificate with fingerprint {fingerprint} hasn't been imported successfully")]
    CertificateNotImported { fingerprint: String },

    #[error("Keychain operation '{operation}' is not allowed while the keychain is {state}")]
    KeychainState {
        operation: &'static str,
        state: KeychainState,
    },

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Keystore does not contain the alias '{alias}'. {hint}")]
    KeystoreAliasNotFound { alias: String, hint: String },

    #[error(
        "Failed to decrypt the private key for alias '{alias}'. \
         Check that your key password is correct."
    )]
    KeystoreKeyPassword { alias: String },

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SignprepError {
    /// Whether this error means two independently supplied artifacts disagree.
    pub fn is_cross_validation(&self) -> bool {
        matches!(
            self,
            SignprepError::CertificateProfileMismatch { .. }
                | SignprepError::CertificateNotImported { .. }
        )
    }
}

/// Result type alias for signprep operations.
pub type Result<T> = std::result::Result<T, SignprepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_message_says_dont_match() {
        let err = SignprepError::CertificateProfileMismatch {
            profile_fingerprints: "AAAA".to_string(),
            certificate_fingerprint: "BBBB".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("don't match"));
        assert!(message.contains("AAAA"));
        assert!(message.contains("BBBB"));
        assert!(err.is_cross_validation());
    }

    #[test]
    fn test_key_password_message() {
        let err = SignprepError::KeystoreKeyPassword {
            alias: "upload".to_string(),
        };
        assert!(err.to_string().contains("key password"));
        assert!(!err.is_cross_validation());
    }
}
