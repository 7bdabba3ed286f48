//! Reader for the legacy Java KeyStore (JKS) container.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! magic u32 = 0xFEEDFEED | version u32 (1 or 2) | count u32
//! entries:
//!   tag u32 = 1 (private key)
//!     alias utf | timestamp u64 | key u32-len + EncryptedPrivateKeyInfo DER
//!     chain count u32 | chain: [v2: type utf] u32-len + DER
//!   tag u32 = 2 (trusted certificate)
//!     alias utf | timestamp u64 | [v2: type utf] u32-len + DER
//! digest [20] = SHA1(password utf-16be || "Mighty Aphrodite" || everything above)
//! ```
//!
//! Private keys are wrapped by Sun's proprietary key protector: a SHA-1
//! keystream derived from the key password and a salt, followed by a
//! SHA-1 check value over the plaintext.

use openssl::pkey::{PKey, Private};
use sha1::{Digest, Sha1};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::constant_time_eq;

const MAGIC: u32 = 0xFEED_FEED;
const DIGEST_LEN: usize = 20;
const INTEGRITY_WHITENER: &[u8] = b"Mighty Aphrodite";

const TAG_PRIVATE_KEY: u32 = 1;
const TAG_TRUSTED_CERT: u32 = 2;

/// DER body of OID 1.3.6.1.4.1.42.2.17.1.1.
const KEY_PROTECTOR_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x2a, 0x02, 0x11, 0x01, 0x01];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JksError {
    #[error("not a JKS keystore")]
    BadMagic,

    #[error("unsupported JKS version {0}")]
    UnsupportedVersion(u32),

    #[error("keystore data is truncated")]
    Truncated,

    #[error("keystore was tampered with, or password was incorrect")]
    IntegrityCheckFailed,

    #[error("unknown keystore entry tag {0}")]
    UnknownEntryTag(u32),

    #[error("private key is not protected with the JKS key protector")]
    UnsupportedKeyProtection,

    #[error("cannot recover key, the key password is incorrect")]
    KeyDecryption,

    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

/// One entry of a JKS keystore.
#[derive(Debug, Clone)]
pub enum JksEntry {
    PrivateKey {
        alias: String,
        timestamp_ms: u64,
        encrypted_key: Vec<u8>,
        certificate_chain: Vec<Vec<u8>>,
    },
    TrustedCertificate {
        alias: String,
        timestamp_ms: u64,
        certificate: Vec<u8>,
    },
}

impl JksEntry {
    pub fn alias(&self) -> &str {
        match self {
            JksEntry::PrivateKey { alias, .. } | JksEntry::TrustedCertificate { alias, .. } => alias,
        }
    }
}

/// A JKS keystore whose integrity digest has been verified.
#[derive(Debug, Clone)]
pub struct JksKeystore {
    pub version: u32,
    pub entries: Vec<JksEntry>,
}

impl JksKeystore {
    /// Whether `data` starts with the JKS magic number.
    pub fn is_jks(data: &[u8]) -> bool {
        data.len() >= 4 && data[..4] == MAGIC.to_be_bytes()
    }

    /// Verifies the integrity digest with `store_password` and parses the entries.
    pub fn parse(data: &[u8], store_password: &str) -> Result<Self, JksError> {
        if !Self::is_jks(data) {
            return Err(JksError::BadMagic);
        }
        if data.len() < 12 + DIGEST_LEN {
            return Err(JksError::Truncated);
        }

        let (body, digest) = data.split_at(data.len() - DIGEST_LEN);
        let password = password_bytes(store_password);
        let mut hasher = Sha1::new();
        hasher.update(password.as_slice());
        hasher.update(INTEGRITY_WHITENER);
        hasher.update(body);
        if !constant_time_eq(&hasher.finalize(), digest) {
            return Err(JksError::IntegrityCheckFailed);
        }

        let mut reader = Reader::new(body);
        reader.u32()?;
        let version = reader.u32()?;
        if version != 1 && version != 2 {
            return Err(JksError::UnsupportedVersion(version));
        }

        let count = reader.u32()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            entries.push(reader.entry(version)?);
        }

        Ok(Self { version, entries })
    }

    /// Looks up an entry by alias. JKS stores aliases lowercased, so the
    /// match ignores case.
    pub fn find(&self, alias: &str) -> Option<&JksEntry> {
        self.entries
            .iter()
            .find(|entry| entry.alias().eq_ignore_ascii_case(alias))
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(JksEntry::alias)
    }
}

/// Recovers a private key protected by the JKS key protector.
pub fn decrypt_private_key(encrypted_key: &[u8], key_password: &str) -> Result<PKey<Private>, JksError> {
    let (tag, info, _) = read_tlv(encrypted_key)?;
    expect_tag(tag, 0x30)?;
    let (tag, algorithm, rest) = read_tlv(info)?;
    expect_tag(tag, 0x30)?;
    let (tag, oid, _) = read_tlv(algorithm)?;
    expect_tag(tag, 0x06)?;
    if oid != KEY_PROTECTOR_OID {
        return Err(JksError::UnsupportedKeyProtection);
    }
    let (tag, protected, _) = read_tlv(rest)?;
    expect_tag(tag, 0x04)?;

    if protected.len() < 2 * DIGEST_LEN {
        return Err(JksError::Truncated);
    }
    let salt = &protected[..DIGEST_LEN];
    let ciphertext = &protected[DIGEST_LEN..protected.len() - DIGEST_LEN];
    let check = &protected[protected.len() - DIGEST_LEN..];

    let password = password_bytes(key_password);
    let mut plaintext = Zeroizing::new(Vec::with_capacity(ciphertext.len()));
    let mut digest = salt.to_vec();
    for chunk in ciphertext.chunks(DIGEST_LEN) {
        let mut hasher = Sha1::new();
        hasher.update(password.as_slice());
        hasher.update(&digest);
        digest = hasher.finalize().to_vec();
        plaintext.extend(chunk.iter().zip(&digest).map(|(c, k)| c ^ k));
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_slice());
    hasher.update(plaintext.as_slice());
    if !constant_time_eq(&hasher.finalize(), check) {
        return Err(JksError::KeyDecryption);
    }

    PKey::private_key_from_pkcs8(&plaintext).map_err(|e| JksError::InvalidKey(e.to_string()))
}

/// Java encodes key store passwords as UTF-16BE code units.
fn password_bytes(password: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(password.encode_utf16().flat_map(u16::to_be_bytes).collect())
}

fn expect_tag(actual: u8, expected: u8) -> Result<(), JksError> {
    if actual == expected {
        Ok(())
    } else {
        Err(JksError::InvalidKey(format!(
            "unexpected DER tag 0x{:02x}, expected 0x{:02x}",
            actual, expected
        )))
    }
}

/// Splits one DER TLV off `input`, returning `(tag, contents, rest)`.
fn read_tlv(input: &[u8]) -> Result<(u8, &[u8], &[u8]), JksError> {
    let (&tag, rest) = input.split_first().ok_or(JksError::Truncated)?;
    let (&first, mut rest) = rest.split_first().ok_or(JksError::Truncated)?;

    let len = if first & 0x80 == 0 {
        first as usize
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 || rest.len() < count {
            return Err(JksError::Truncated);
        }
        let len = rest[..count].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        rest = &rest[count..];
        len
    };

    if rest.len() < len {
        return Err(JksError::Truncated);
    }
    Ok((tag, &rest[..len], &rest[len..]))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], JksError> {
        let end = self.pos.checked_add(len).ok_or(JksError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(JksError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, JksError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, JksError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, JksError> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok((hi << 32) | lo)
    }

    /// Java's `writeUTF`: a u16 length followed by modified UTF-8.
    fn utf(&mut self) -> Result<String, JksError> {
        let len = self.u16()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn blob(&mut self) -> Result<Vec<u8>, JksError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn certificate(&mut self, version: u32) -> Result<Vec<u8>, JksError> {
        if version == 2 {
            // Certificate type, always "X.509"
            self.utf()?;
        }
        self.blob()
    }

    fn entry(&mut self, version: u32) -> Result<JksEntry, JksError> {
        match self.u32()? {
            TAG_PRIVATE_KEY => {
                let alias = self.utf()?;
                let timestamp_ms = self.u64()?;
                let encrypted_key = self.blob()?;
                let chain_len = self.u32()?;
                let certificate_chain = (0..chain_len)
                    .map(|_| self.certificate(version))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(JksEntry::PrivateKey {
                    alias,
                    timestamp_ms,
                    encrypted_key,
                    certificate_chain,
                })
            }
            TAG_TRUSTED_CERT => {
                let alias = self.utf()?;
                let timestamp_ms = self.u64()?;
                let certificate = self.certificate(version)?;
                Ok(JksEntry::TrustedCertificate {
                    alias,
                    timestamp_ms,
                    certificate,
                })
            }
            other => Err(JksError::UnknownEntryTag(other)),
        }
    }
}
