//! Issuance agent: orchestrates attest -> match -> issue and holds its own
//! SVID.

pub mod endpoint;

pub use endpoint::WorkloadEndpoint;

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::attest::{ProcessIdentity, WorkloadAttestor};
use crate::ca::CertificateAuthority;
use crate::domain::{Identity, SelectorSet, SpiffeId};
use crate::errors::{IdPlaneError, Result};
use crate::registry::IdentityRegistry;

/// The component workloads talk to. Construction validates the agent's
/// identity against the issuing authority and mints the agent's own SVID,
/// which authenticates outbound operations and acts as the parent identity
/// of attested workloads.
pub struct IssuanceAgent {
    identity: SpiffeId,
    ca: Arc<dyn CertificateAuthority>,
    registry: Arc<dyn IdentityRegistry>,
    attestor: Arc<dyn WorkloadAttestor>,
    own: RwLock<Identity>,
}

impl std::fmt::Debug for IssuanceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceAgent")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl IssuanceAgent {
    /// Wire the agent. Fails on a malformed agent URI, on a trust-domain
    /// mismatch with the authority, or when the initial self-SVID cannot
    /// be minted.
    pub fn new(
        agent_uri: &str,
        ca: Arc<dyn CertificateAuthority>,
        registry: Arc<dyn IdentityRegistry>,
        attestor: Arc<dyn WorkloadAttestor>,
    ) -> Result<Self> {
        let identity = SpiffeId::parse(agent_uri)?;
        if identity.trust_domain() != ca.trust_domain() {
            return Err(IdPlaneError::document(format!(
                "trust domain mismatch: authority serves '{}', agent configured for '{}'",
                ca.trust_domain(),
                identity.trust_domain()
            )));
        }

        let document = ca.issue(&identity)?;
        let own = Identity::new(identity.clone(), document);
        info!(identity = %identity, "issuance agent initialized");

        Ok(IssuanceAgent { identity, ca, registry, attestor, own: RwLock::new(own) })
    }

    /// The agent's configured SPIFFE identity.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.identity
    }

    /// Attest a workload process and issue its SVID.
    ///
    /// Strict sequence, first failure wins:
    /// attest -> parse selectors -> registry match -> issue. An empty
    /// attestation result is `NoAttestationData`; `NoMatchingMapper`
    /// propagates verbatim; operational authority failures surface as
    /// `ServerUnavailable`. Cancellation is observed between stages and
    /// never leaves partial state behind.
    #[instrument(
        skip_all,
        fields(uid = process.uid, gid = process.gid, operation_id = %uuid::Uuid::new_v4())
    )]
    pub fn fetch_identity_document(
        &self,
        process: &ProcessIdentity,
        cancel: &CancellationToken,
    ) -> Result<Identity> {
        if cancel.is_cancelled() {
            return Err(IdPlaneError::Cancelled);
        }

        let raw = self.attestor.attest(process)?;
        if raw.is_empty() {
            return Err(IdPlaneError::NoAttestationData);
        }

        if cancel.is_cancelled() {
            return Err(IdPlaneError::Cancelled);
        }

        let presented = SelectorSet::parse_all(&raw)?;
        let mapper = self.registry.find_by_selectors(&presented)?;

        if cancel.is_cancelled() {
            return Err(IdPlaneError::Cancelled);
        }

        let document = self.ca.issue(mapper.identity()).map_err(wrap_issuance_error)?;
        debug!(identity = %mapper.identity(), "workload SVID issued");
        Ok(Identity::new(mapper.identity().clone(), document))
    }

    /// The agent's own identity, refreshed through the issuance path
    /// (bypassing attestation) when the stored document is no longer
    /// valid.
    pub fn get_identity(&self) -> Result<Identity> {
        {
            let own = self
                .own
                .read()
                .map_err(|_| IdPlaneError::agent_unavailable("agent state lock poisoned"))?;
            if own.document().is_valid() {
                return Ok(own.clone());
            }
        }
        self.renew_identity()
    }

    /// Unconditionally mint a fresh self-SVID. The rotating source uses
    /// this as its upstream fetch.
    pub fn renew_identity(&self) -> Result<Identity> {
        let document = self.ca.issue(&self.identity).map_err(wrap_issuance_error)?;
        let fresh = Identity::new(self.identity.clone(), document);
        let mut own = self
            .own
            .write()
            .map_err(|_| IdPlaneError::agent_unavailable("agent state lock poisoned"))?;
        *own = fresh.clone();
        debug!(identity = %self.identity, serial = fresh.document().serial_hex(), "agent SVID refreshed");
        Ok(fresh)
    }
}

/// Issuance-stage error policy: validation results pass through untouched,
/// operational authority failures become `ServerUnavailable`.
fn wrap_issuance_error(err: IdPlaneError) -> IdPlaneError {
    match err {
        IdPlaneError::CaNotInitialized
        | IdPlaneError::Io { .. }
        | IdPlaneError::Transport(_)
        | IdPlaneError::Unavailable { .. } => IdPlaneError::ServerUnavailable {
            message: "certificate authority failed".to_string(),
            source: Some(Box::new(err)),
        },
        other => other,
    }
}
