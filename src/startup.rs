//! Bootstrap sequence for the identity plane.
//!
//! Wires the core components in dependency order: authority, registry
//! (seeded from configuration, then sealed), attestor, agent. The sealed
//! registry is immutable for the rest of the process lifetime.

use std::sync::Arc;

use tracing::info;

use crate::attest::{StaticUidAttestor, WorkloadAttestor};
use crate::ca::{CertificateAuthority, InMemoryCa};
use crate::config::AppConfig;
use crate::agent::IssuanceAgent;
use crate::domain::{IdentityMapper, SelectorSet, SpiffeId, TrustDomain};
use crate::errors::Result;
use crate::registry::{IdentityRegistry, SealedRegistry};

/// The wired identity core.
pub struct Core {
    pub trust_domain: TrustDomain,
    pub ca: Arc<dyn CertificateAuthority>,
    pub registry: Arc<dyn IdentityRegistry>,
    pub attestor: Arc<dyn WorkloadAttestor>,
    pub agent: Arc<IssuanceAgent>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("trust_domain", &self.trust_domain)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

/// Build the core from validated configuration.
///
/// The registry is seeded from `config.registrations` and sealed before
/// the agent goes live, so no registration can be added once issuance is
/// possible.
pub fn bootstrap(config: &AppConfig) -> Result<Core> {
    let trust_domain = TrustDomain::parse(&config.trust_domain)?;
    let ca: Arc<dyn CertificateAuthority> = Arc::new(InMemoryCa::new(trust_domain.clone())?);

    let registry = Arc::new(SealedRegistry::new());
    for entry in &config.registrations {
        let identity = SpiffeId::parse(&entry.spiffe_id)?;
        let required = SelectorSet::parse_all(&entry.selectors)?;
        registry.seed(IdentityMapper::new(identity, required)?)?;
    }
    registry.seal();

    let mut attestor = StaticUidAttestor::new();
    for row in &config.attestor_uids {
        attestor.register(row.uid, row.selectors.clone());
    }
    let attestor: Arc<dyn WorkloadAttestor> = Arc::new(attestor);

    let agent = Arc::new(IssuanceAgent::new(
        &config.agent_spiffe_id,
        ca.clone(),
        registry.clone() as Arc<dyn IdentityRegistry>,
        attestor.clone(),
    )?);

    info!(
        trust_domain = %trust_domain,
        registrations = config.registrations.len(),
        "identity core bootstrapped"
    );

    Ok(Core { trust_domain, ca, registry, attestor, agent })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegistrationEntry, UidSelectors};

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.trust_domain = "example.org".to_string();
        config.agent_spiffe_id = "spiffe://example.org/agent".to_string();
        config.allowed_client_trust_domain = Some("example.org".to_string());
        config.expected_server_trust_domain = Some("example.org".to_string());
        config.registrations = vec![RegistrationEntry {
            spiffe_id: "spiffe://example.org/server".to_string(),
            selectors: vec!["unix:uid:1001".to_string()],
        }];
        config.attestor_uids =
            vec![UidSelectors { uid: 1001, selectors: vec!["unix:uid:1001".to_string()] }];
        config
    }

    #[test]
    fn bootstrap_seeds_and_seals() {
        let core = bootstrap(&config()).unwrap();
        assert!(core.registry.is_sealed());
        assert_eq!(core.registry.list_all().unwrap().len(), 1);
        assert_eq!(core.agent.spiffe_id().to_string(), "spiffe://example.org/agent");
    }

    #[test]
    fn bootstrap_rejects_agent_outside_trust_domain() {
        let mut bad = config();
        bad.agent_spiffe_id = "spiffe://other.org/agent".to_string();
        assert!(bootstrap(&bad).is_err());
    }

    #[test]
    fn bootstrap_rejects_duplicate_registrations() {
        let mut bad = config();
        bad.registrations.push(bad.registrations[0].clone());
        let err = bootstrap(&bad).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
