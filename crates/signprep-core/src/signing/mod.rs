//! Code signing credential preparation for iOS and Android.
//!
//! This module provides functionality for:
//! - distribution certificate inspection
//! - ephemeral macOS keychains driven through the `security` tool
//! - provisioning profile decoding and certificate matching
//! - Android keystore classification and validation

pub mod android;
pub mod certificate;
pub mod jks;
pub mod keychain;
pub mod manager;
pub mod profile;
pub mod security;

pub use keychain::{EphemeralKeychain, KeychainState};
pub use manager::{CleanupReport, CredentialsManager};
pub use profile::ProvisioningProfile;
pub use security::{CommandOutput, SecurityCli, SecurityTool};
