//! Domain models for credential preparation.

pub mod signing;

pub use signing::*;
