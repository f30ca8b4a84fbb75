//! # idplane
//!
//! A workload identity plane in the SPIFFE model. It provisions
//! short-lived X.509 SVIDs to locally-attested processes, authorizes
//! mutual-TLS peers by the SPIFFE URI carried in their certificate, and
//! answers identity lookups from a registry sealed after startup seeding.
//!
//! ## Architecture
//!
//! ```text
//! workload -> attestor -> registry match -> authority -> SVID
//!                                              |
//!                     rotating source <- upstream provider
//!                           |
//!                  mTLS channel (authorizer on peer URIs)
//! ```
//!
//! ## Core Components
//!
//! - **domain**: trust domains, SPIFFE URIs, selectors, mappers, documents
//! - **ca**: in-memory RSA authority issuing single-URI-SAN leaves
//! - **registry**: startup-seeded, sealed, deterministic AND-matching
//! - **attest**: process credentials to selector strings
//! - **agent**: the attest -> match -> issue pipeline
//! - **tls**: rotating SVID source, authorizer, rustls channel plumbing

pub mod agent;
pub mod attest;
pub mod ca;
pub mod cli;
pub mod config;
pub mod domain;
pub mod errors;
pub mod faults;
pub mod observability;
pub mod registry;
pub mod startup;
pub mod tls;
pub mod utils;

// Re-export commonly used types and traits
pub use errors::{IdPlaneError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_looks_like_semver() {
        let components: Vec<_> = VERSION.split('.').collect();
        assert!(components.len() >= 3, "version should follow semver: {VERSION}");
        assert!(components.iter().all(|part| !part.is_empty()));
        assert_eq!(APP_NAME, "idplane");
    }
}
