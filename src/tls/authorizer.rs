//! Peer authorization policy.
//!
//! The authorizer consumes only the peer's SPIFFE URI; chain validation
//! belongs to the TLS layer. Misconfiguration is caught at construction,
//! never at verification time.

use std::collections::BTreeSet;
use std::fmt;

use crate::domain::{SpiffeId, TrustDomain};
use crate::errors::{IdPlaneError, Result};

/// A closed-set policy over peer SPIFFE URIs.
#[derive(Debug, Clone)]
enum Policy {
    /// Any syntactically valid SPIFFE URI.
    Any,
    /// Any identity inside the given trust domain.
    TrustDomain(TrustDomain),
    /// Exactly one identity.
    SpecificId(SpiffeId),
    /// One of an explicit set (two or more).
    OneOf(BTreeSet<SpiffeId>),
}

/// Decides accept/reject for a peer URI at TLS verification time.
#[derive(Debug, Clone)]
pub struct Authorizer {
    policy: Policy,
}

impl Authorizer {
    /// Accept any peer that presents a well-formed SPIFFE URI.
    pub fn any() -> Self {
        Authorizer { policy: Policy::Any }
    }

    /// Accept members of `trust_domain`.
    pub fn trust_domain(trust_domain: TrustDomain) -> Self {
        Authorizer { policy: Policy::TrustDomain(trust_domain) }
    }

    /// Accept exactly `id`.
    pub fn specific_id(id: SpiffeId) -> Self {
        Authorizer { policy: Policy::SpecificId(id) }
    }

    /// Accept any of `ids`; fewer than two ids is a configuration error
    /// (use [`Authorizer::specific_id`] for a single identity).
    pub fn one_of<I: IntoIterator<Item = SpiffeId>>(ids: I) -> Result<Self> {
        let set: BTreeSet<SpiffeId> = ids.into_iter().collect();
        if set.len() < 2 {
            return Err(IdPlaneError::config(format!(
                "one-of authorizer requires at least 2 ids, got {}",
                set.len()
            )));
        }
        Ok(Authorizer { policy: Policy::OneOf(set) })
    }

    /// Run the policy against a raw peer URI.
    ///
    /// Returns the parsed identity on acceptance. Total: every input maps
    /// to accept or reject, never a panic.
    pub fn authorize(&self, peer_uri: &str) -> Result<SpiffeId> {
        let id = SpiffeId::parse(peer_uri)
            .map_err(|e| IdPlaneError::unauthenticated(format!("peer URI rejected: {}", e)))?;

        let accepted = match &self.policy {
            Policy::Any => true,
            Policy::TrustDomain(td) => id.trust_domain() == td,
            Policy::SpecificId(expected) => &id == expected,
            Policy::OneOf(set) => set.contains(&id),
        };

        if accepted {
            Ok(id)
        } else {
            Err(IdPlaneError::unauthenticated(format!(
                "peer '{}' not allowed by {} policy",
                id, self
            )))
        }
    }
}

impl fmt::Display for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.policy {
            Policy::Any => write!(f, "any"),
            Policy::TrustDomain(td) => write!(f, "trust-domain({})", td),
            Policy::SpecificId(id) => write!(f, "specific-id({})", id),
            Policy::OneOf(set) => write!(f, "one-of({} ids)", set.len()),
        }
    }
}
