//! Signprep Core Library
//!
//! Prepares code signing credentials for mobile builds: ephemeral iOS
//! keychains with cross-checked certificates and provisioning profiles,
//! and validated Android upload keystores.

pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod signing;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::SigningConfig;
pub use error::{Result, SignprepError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
