//! Trust-domain value object.

use std::fmt;

use crate::errors::{IdPlaneError, Result};

/// Maximum length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Maximum total length of a trust-domain name.
const MAX_NAME_LEN: usize = 253;

/// A validated, case-canonicalized trust-domain name.
///
/// A trust domain is a DNS-like name identifying an administrative boundary:
/// lowercase labels of `[a-z0-9-]` joined by dots, no label longer than 63
/// characters, no more than 253 characters total, no empty or
/// hyphen-bounded labels. Instances can only be obtained through
/// [`TrustDomain::parse`]; once constructed the name is never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Parse and canonicalize a trust-domain name.
    ///
    /// Input is trimmed and lowercased before validation. Rejects names
    /// that carry a scheme or path, contain illegal characters, or violate
    /// the DNS label rules above.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdPlaneError::invalid_trust_domain(input, "name is empty"));
        }
        if trimmed.contains("://") {
            return Err(IdPlaneError::invalid_trust_domain(input, "name must not carry a scheme"));
        }
        if trimmed.contains('/') {
            return Err(IdPlaneError::invalid_trust_domain(input, "name must not carry a path"));
        }

        let name = trimmed.to_ascii_lowercase();
        if name.len() > MAX_NAME_LEN {
            return Err(IdPlaneError::invalid_trust_domain(
                input,
                format!("name exceeds {} characters", MAX_NAME_LEN),
            ));
        }
        if let Some(bad) =
            name.chars().find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.'))
        {
            return Err(IdPlaneError::invalid_trust_domain(
                input,
                format!("illegal character '{}'", bad),
            ));
        }

        // Empty labels cover leading/trailing dots and consecutive dots.
        for label in name.split('.') {
            if label.is_empty() {
                return Err(IdPlaneError::invalid_trust_domain(input, "empty label"));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(IdPlaneError::invalid_trust_domain(
                    input,
                    format!("label '{}' exceeds {} characters", label, MAX_LABEL_LEN),
                ));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(IdPlaneError::invalid_trust_domain(
                    input,
                    format!("label '{}' starts or ends with a hyphen", label),
                ));
            }
        }

        Ok(TrustDomain(name))
    }

    /// The canonical (lowercase) name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TrustDomain {
    type Err = IdPlaneError;

    fn from_str(s: &str) -> Result<Self> {
        TrustDomain::parse(s)
    }
}
