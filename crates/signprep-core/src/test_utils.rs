//! Test utilities for signprep-core unit and integration tests.
//!
//! [`FakeSecurity`] stands in for the macOS `security` tool and keeps an
//! in-memory model of keychains, so keychain and manager logic can be
//! exercised on any platform. [`TestCertificate`] and [`ProfileSpec`]
//! produce real PKCS#12 containers and CMS-signed profiles with OpenSSL.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509, X509NameBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto::sha1_fingerprint;
use crate::error::Result;
use crate::models::{DistributionCertificate, SigningIdentity, TargetCredentials};
use crate::signing::certificate::inspect_certificate;
use crate::signing::security::{CommandOutput, SecurityTool};

// ============================================================================
// Fake `security` tool
// ============================================================================

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<Vec<String>>,
    failing: BTreeSet<String>,
    keychains: BTreeSet<PathBuf>,
    identities: BTreeMap<PathBuf, Vec<SigningIdentity>>,
    silent_imports: bool,
}

/// In-memory stand-in for `/usr/bin/security`.
///
/// `import` really decodes the PKCS#12 file it is given, so a wrong
/// password fails the same way it would on macOS and the imported
/// identity shows up in `find-identity`.
#[derive(Debug, Default)]
pub struct FakeSecurity {
    state: Mutex<FakeState>,
}

impl FakeSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later invocation of `subcommand` exit non-zero.
    pub fn fail_on(&self, subcommand: &str) {
        self.state.lock().unwrap().failing.insert(subcommand.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    /// Makes `import` report success without adding an identity.
    pub fn drop_imports_silently(&self) {
        self.state.lock().unwrap().silent_imports = true;
    }

    pub fn register_keychain(&self, path: &Path) {
        self.state.lock().unwrap().keychains.insert(path.to_path_buf());
    }

    pub fn keychain_exists(&self, path: &Path) -> bool {
        self.state.lock().unwrap().keychains.contains(path)
    }

    /// Paths of all keychains currently known to the fake.
    pub fn keychains(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().keychains.iter().cloned().collect()
    }

    /// First argument of every invocation, in order.
    pub fn subcommands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|args| args.first().cloned())
            .collect()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.subcommands().iter().filter(|s| *s == subcommand).count()
    }

    /// Full argument lists of every invocation, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    fn handle(state: &mut FakeState, args: &[String]) -> CommandOutput {
        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        if state.failing.contains(subcommand) {
            return failure(format!("security: {} failed", subcommand));
        }

        match subcommand {
            "create-keychain" => {
                let path = PathBuf::from(args.last().cloned().unwrap_or_default());
                if !state.keychains.insert(path) {
                    return failure(
                        "security: SecKeychainCreate: A keychain with the same name already exists.",
                    );
                }
                success("")
            }
            "unlock-keychain" | "set-keychain-settings" | "set-key-partition-list" => {
                let path = PathBuf::from(args.last().cloned().unwrap_or_default());
                if !state.keychains.contains(&path) {
                    return failure("security: The specified keychain could not be found.");
                }
                success("")
            }
            "list-keychains" => {
                if args.iter().any(|a| a == "-s") {
                    return success("");
                }
                let listing: String = state
                    .keychains
                    .iter()
                    .map(|path| format!("    \"{}\"\n", path.display()))
                    .collect();
                success(&listing)
            }
            "import" => Self::import(state, args),
            "find-identity" => {
                let path = PathBuf::from(args.last().cloned().unwrap_or_default());
                let identities = state.identities.get(&path).cloned().unwrap_or_default();
                let mut out = String::from("\nPolicy: Code Signing\n  Matching identities\n");
                for (i, identity) in identities.iter().enumerate() {
                    out.push_str(&format!(
                        "  {}) {} \"{}\"\n",
                        i + 1,
                        identity.fingerprint,
                        identity.name
                    ));
                }
                out.push_str(&format!("     {} valid identities found\n", identities.len()));
                success(&out)
            }
            "delete-keychain" => {
                let path = PathBuf::from(args.last().cloned().unwrap_or_default());
                if state.keychains.remove(&path) {
                    state.identities.remove(&path);
                    success("")
                } else {
                    failure("security: SecKeychainDelete: The specified keychain could not be found.")
                }
            }
            other => failure(format!("security: unknown command {}", other)),
        }
    }

    fn import(state: &mut FakeState, args: &[String]) -> CommandOutput {
        let option = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };
        let (Some(file), Some(keychain)) = (args.get(1), option("-k")) else {
            return failure("security: import: missing arguments");
        };
        let keychain = PathBuf::from(keychain);
        if !state.keychains.contains(&keychain) {
            return failure("security: The specified keychain could not be found.");
        }

        let Ok(data) = std::fs::read(file) else {
            return failure(format!("security: {}: no such file", file));
        };
        let cert = DistributionCertificate::new(data, option("-P"));
        let metadata = match inspect_certificate(&cert) {
            Ok(metadata) => metadata,
            Err(_) => {
                return failure(
                    "security: SecKeychainItemImport: MAC verification failed during PKCS12 import (wrong password?)",
                );
            }
        };

        if !state.silent_imports {
            state.identities.entry(keychain).or_default().push(SigningIdentity {
                fingerprint: metadata.fingerprint,
                name: metadata.common_name,
            });
        }
        success("1 identity imported.\n")
    }
}

#[async_trait]
impl SecurityTool for FakeSecurity {
    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let mut state = self.state.lock().unwrap();
        state.calls.push(args.clone());
        Ok(Self::handle(&mut state, &args))
    }
}

fn success(stdout: &str) -> CommandOutput {
    CommandOutput {
        success: true,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failure(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        success: false,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

// ============================================================================
// Certificates and profiles
// ============================================================================

/// A freshly generated self-signed certificate and its PKCS#12 container.
pub struct TestCertificate {
    pub p12: Vec<u8>,
    pub password: String,
    pub der: Vec<u8>,
    pub fingerprint: String,
    pub common_name: String,
    pub team_id: String,
    pub cert: X509,
    pub key: PKey<Private>,
}

impl TestCertificate {
    /// Generates an EC P-256 certificate whose subject carries `team_id` as OU.
    pub fn generate(common_name: &str, team_id: &str, password: &str) -> Self {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
        name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, team_id).unwrap();
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Acme Inc").unwrap();
        name.append_entry_by_nid(Nid::COUNTRYNAME, "US").unwrap();
        let name = name.build();

        let serial = BigNum::from_u32(rand::random::<u32>() | 1)
            .unwrap()
            .to_asn1_integer()
            .unwrap();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let p12 = Pkcs12::builder()
            .name(common_name)
            .pkey(&key)
            .cert(&cert)
            .build2(password)
            .unwrap()
            .to_der()
            .unwrap();
        let der = cert.to_der().unwrap();

        Self {
            p12,
            password: password.to_string(),
            fingerprint: sha1_fingerprint(&der),
            der,
            common_name: common_name.to_string(),
            team_id: team_id.to_string(),
            cert,
            key,
        }
    }

    pub fn distribution_certificate(&self) -> DistributionCertificate {
        DistributionCertificate::new(self.p12.clone(), Some(self.password.clone()))
    }

    /// Pairs this certificate with a signed profile.
    pub fn target_credentials(&self, profile: Vec<u8>) -> TargetCredentials {
        TargetCredentials {
            distribution_certificate: self.distribution_certificate(),
            provisioning_profile: profile,
        }
    }
}

/// Contents of a provisioning profile to be signed into a `.mobileprovision`.
#[derive(Debug, Clone)]
pub struct ProfileSpec {
    pub name: String,
    pub uuid: String,
    pub team_id: String,
    /// `<team>.<bundle id>`; `None` omits the entitlement.
    pub application_identifier: Option<String>,
    pub developer_certificates: Vec<Vec<u8>>,
    pub provisioned_devices: Option<Vec<String>>,
    pub provisions_all_devices: bool,
    pub get_task_allow: bool,
    pub expiration: DateTime<Utc>,
}

impl ProfileSpec {
    pub fn app_store(bundle_identifier: &str, team_id: &str, cert: &TestCertificate) -> Self {
        Self {
            name: format!("{} AppStore", bundle_identifier),
            uuid: ulid::Ulid::new().to_string(),
            team_id: team_id.to_string(),
            application_identifier: Some(format!("{}.{}", team_id, bundle_identifier)),
            developer_certificates: vec![cert.der.clone()],
            provisioned_devices: None,
            provisions_all_devices: false,
            get_task_allow: false,
            expiration: Utc::now() + Duration::days(300),
        }
    }

    pub fn ad_hoc(bundle_identifier: &str, team_id: &str, cert: &TestCertificate) -> Self {
        Self {
            name: format!("{} AdHoc", bundle_identifier),
            provisioned_devices: Some(vec!["00008030-001A2B3C4D5E6F70".to_string()]),
            ..Self::app_store(bundle_identifier, team_id, cert)
        }
    }

    pub fn development(bundle_identifier: &str, team_id: &str, cert: &TestCertificate) -> Self {
        Self {
            name: format!("{} Development", bundle_identifier),
            get_task_allow: true,
            ..Self::ad_hoc(bundle_identifier, team_id, cert)
        }
    }

    pub fn enterprise(bundle_identifier: &str, team_id: &str, cert: &TestCertificate) -> Self {
        Self {
            name: format!("{} InHouse", bundle_identifier),
            provisions_all_devices: true,
            ..Self::app_store(bundle_identifier, team_id, cert)
        }
    }

    /// Renders the profile plist as XML.
    pub fn to_plist_xml(&self) -> Vec<u8> {
        let mut entitlements = plist::Dictionary::new();
        if let Some(app_id) = &self.application_identifier {
            entitlements.insert(
                "application-identifier".to_string(),
                plist::Value::String(app_id.clone()),
            );
        }
        entitlements.insert(
            "get-task-allow".to_string(),
            plist::Value::Boolean(self.get_task_allow),
        );

        let mut dict = plist::Dictionary::new();
        dict.insert("Name".to_string(), plist::Value::String(self.name.clone()));
        dict.insert("UUID".to_string(), plist::Value::String(self.uuid.clone()));
        dict.insert(
            "TeamIdentifier".to_string(),
            plist::Value::Array(vec![plist::Value::String(self.team_id.clone())]),
        );
        dict.insert("Entitlements".to_string(), plist::Value::Dictionary(entitlements));
        dict.insert(
            "DeveloperCertificates".to_string(),
            plist::Value::Array(
                self.developer_certificates
                    .iter()
                    .map(|der| plist::Value::Data(der.clone()))
                    .collect(),
            ),
        );
        if let Some(devices) = &self.provisioned_devices {
            dict.insert(
                "ProvisionedDevices".to_string(),
                plist::Value::Array(devices.iter().cloned().map(plist::Value::String).collect()),
            );
        }
        if self.provisions_all_devices {
            dict.insert("ProvisionsAllDevices".to_string(), plist::Value::Boolean(true));
        }
        let expiration: std::time::SystemTime = self.expiration.into();
        dict.insert(
            "ExpirationDate".to_string(),
            plist::Value::Date(expiration.into()),
        );

        let mut xml = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut xml).unwrap();
        xml
    }

    /// Signs the plist into a DER CMS envelope, like Apple's portal does.
    pub fn sign(&self, signer: &TestCertificate) -> Vec<u8> {
        let xml = self.to_plist_xml();
        CmsContentInfo::sign(
            Some(&signer.cert),
            Some(&signer.key),
            None,
            Some(&xml),
            CMSOptions::BINARY,
        )
        .unwrap()
        .to_der()
        .unwrap()
    }
}
