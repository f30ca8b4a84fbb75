//! Registration entries binding selector sets to identities.

use std::fmt;

use crate::domain::{SelectorSet, SpiffeId};
use crate::errors::{IdPlaneError, Result};

/// A seeded registration entry: a workload whose selectors include
/// `required` is entitled to `identity`.
///
/// Matching is AND logic: the mapper matches a presented selector set `S`
/// iff `required ⊆ S`. Immutable after construction; `required` is never
/// empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMapper {
    identity: SpiffeId,
    required: SelectorSet,
}

impl IdentityMapper {
    pub fn new(identity: SpiffeId, required: SelectorSet) -> Result<Self> {
        if required.is_empty() {
            return Err(IdPlaneError::invalid_selectors(format!(
                "mapper for '{}' has no required selectors",
                identity
            )));
        }
        Ok(IdentityMapper { identity, required })
    }

    pub fn identity(&self) -> &SpiffeId {
        &self.identity
    }

    pub fn required(&self) -> &SelectorSet {
        &self.required
    }

    /// AND-match: true iff every required selector is presented.
    pub fn matches(&self, presented: &SelectorSet) -> bool {
        self.required.is_subset(presented)
    }
}

impl fmt::Display for IdentityMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- [{}]", self.identity, self.required)
    }
}
