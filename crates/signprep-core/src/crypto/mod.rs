//! Cryptographic helpers shared by the iOS and Android paths.

use rand::Rng;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// Computes the SHA-1 fingerprint of DER bytes as uppercase hex.
///
/// This is the identity the macOS `security` tool prints for signing
/// identities, so fingerprints from both sides compare directly.
pub fn sha1_fingerprint(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

/// Generates a random alphanumeric password.
pub fn generate_random_password(length: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Constant-time equality comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_fingerprint_known_vector() {
        assert_eq!(
            sha1_fingerprint(b"abc"),
            "A9993E364706816ABA3E25717850C26C9CD0D89D"
        );
    }

    #[test]
    fn test_generate_random_password() {
        let password = generate_random_password(32);
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));

        let password2 = generate_random_password(32);
        assert_ne!(password, password2);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"digest", b"digest"));
        assert!(!constant_time_eq(b"digest", b"digesT"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
