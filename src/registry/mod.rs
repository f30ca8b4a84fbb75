//! Sealed identity registry.
//!
//! Lifecycle: created unsealed, seeded during bootstrap, sealed, then
//! immutable for the process lifetime. Reseal is a no-op and unseal does
//! not exist. A read that observes a mapper also observes the seal flag
//! (both live under the same lock), so registry reads are linearizable
//! with respect to `seal`.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::domain::{IdentityMapper, SelectorSet};
use crate::errors::{IdPlaneError, Result};

/// Lookup and lifecycle operations of the registration database.
pub trait IdentityRegistry: Send + Sync {
    /// Append a mapper; only admitted before seal, duplicates refused.
    fn seed(&self, mapper: IdentityMapper) -> Result<()>;

    /// One-shot transition to the immutable state; idempotent.
    fn seal(&self);

    fn is_sealed(&self) -> bool;

    /// First mapper (in lexicographic order of `identity.to_string()`)
    /// whose required selectors are all present in `presented`.
    ///
    /// When several mappers match, the lexicographically smallest identity
    /// wins; well-formed deployments keep selector sets unique per mapper.
    fn find_by_selectors(&self, presented: &SelectorSet) -> Result<Arc<IdentityMapper>>;

    /// Every mapper, in the same deterministic order. An empty registry is
    /// an explicit error, distinct from an empty successful result.
    fn list_all(&self) -> Result<Vec<Arc<IdentityMapper>>>;
}

#[derive(Default)]
struct RegistryInner {
    mappers: BTreeMap<String, Arc<IdentityMapper>>,
    sealed: bool,
}

/// The startup-seeded registry implementation.
#[derive(Default)]
pub struct SealedRegistry {
    inner: RwLock<RegistryInner>,
}

impl SealedRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityRegistry for SealedRegistry {
    fn seed(&self, mapper: IdentityMapper) -> Result<()> {
        if mapper.required().is_empty() {
            return Err(IdPlaneError::invalid_selectors(format!(
                "mapper for '{}' has no required selectors",
                mapper.identity()
            )));
        }

        let mut inner = self.inner.write().map_err(|_| IdPlaneError::RegistrySealed)?;
        if inner.sealed {
            return Err(IdPlaneError::RegistrySealed);
        }

        let key = mapper.identity().to_string();
        if inner.mappers.contains_key(&key) {
            return Err(IdPlaneError::config(format!("identity '{}' already exists", key)));
        }
        inner.mappers.insert(key, Arc::new(mapper));
        Ok(())
    }

    fn seal(&self) {
        if let Ok(mut inner) = self.inner.write() {
            if !inner.sealed {
                inner.sealed = true;
                info!(mappers = inner.mappers.len(), "registry sealed");
            }
        }
    }

    fn is_sealed(&self) -> bool {
        self.inner.read().map(|inner| inner.sealed).unwrap_or(true)
    }

    fn find_by_selectors(&self, presented: &SelectorSet) -> Result<Arc<IdentityMapper>> {
        if presented.is_empty() {
            return Err(IdPlaneError::invalid_selectors("selector set is empty"));
        }

        let inner = self
            .inner
            .read()
            .map_err(|_| IdPlaneError::agent_unavailable("registry lock poisoned"))?;
        inner
            .mappers
            .values()
            .find(|mapper| mapper.matches(presented))
            .cloned()
            .ok_or_else(|| IdPlaneError::NoMatchingMapper { selectors: presented.to_string() })
    }

    fn list_all(&self) -> Result<Vec<Arc<IdentityMapper>>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| IdPlaneError::agent_unavailable("registry lock poisoned"))?;
        if inner.mappers.is_empty() {
            return Err(IdPlaneError::RegistryEmpty);
        }
        Ok(inner.mappers.values().cloned().collect())
    }
}
