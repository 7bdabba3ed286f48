//! CLI command implementations.

pub mod android;
pub mod config;
pub mod ios;
pub mod keychain;
