//! Issued identity documents (X.509 SVIDs) and trust bundles.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use zeroize::Zeroizing;

use crate::domain::SpiffeId;
use crate::errors::{IdPlaneError, Result};
use crate::utils::certificates;

/// An X.509 SVID: leaf certificate, private key, and issuing chain for a
/// single SPIFFE identity.
///
/// The chain is leaf-first and always carries at least one issuer
/// authority. The leaf's subjectAltName holds exactly one URI, equal to
/// `identity`. The private key buffer is zeroized when the document is
/// dropped. Documents are value snapshots; cloning one never hands out a
/// handle into the issuing authority.
#[derive(Debug, Clone)]
pub struct IdentityDocument {
    identity: SpiffeId,
    chain: Vec<CertificateDer<'static>>,
    private_key: Zeroizing<Vec<u8>>,
    serial_hex: String,
    not_before: SystemTime,
    not_after: SystemTime,
}

impl IdentityDocument {
    /// Assemble a document from a leaf-first DER chain and a PKCS#8 key.
    ///
    /// Validates that the chain has at least one issuer behind the leaf
    /// and that the leaf carries exactly one URI SAN equal to `identity`.
    pub fn from_parts(
        identity: SpiffeId,
        chain: Vec<CertificateDer<'static>>,
        private_key: Zeroizing<Vec<u8>>,
    ) -> Result<Self> {
        if chain.len() < 2 {
            return Err(IdPlaneError::document(
                "certificate chain must contain the leaf and at least one issuer",
            ));
        }

        let info = certificates::leaf_info(chain[0].as_ref())?;
        if info.uris.len() != 1 {
            return Err(IdPlaneError::document(format!(
                "leaf must carry exactly one URI SAN, found {}",
                info.uris.len()
            )));
        }
        if info.uris[0] != identity.to_string() {
            return Err(IdPlaneError::IdentityDocumentMismatch {
                expected: identity.to_string(),
                actual: info.uris[0].clone(),
            });
        }

        Ok(IdentityDocument {
            identity,
            chain,
            private_key,
            serial_hex: info.serial_hex,
            not_before: info.not_before,
            not_after: info.not_after,
        })
    }

    pub fn identity(&self) -> &SpiffeId {
        &self.identity
    }

    /// The leaf certificate in DER form.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Leaf-first chain including the issuing authorities.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Owned copy of the chain, for handing to a TLS config.
    pub fn chain_owned(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }

    /// Owned copy of the private key, for handing to a TLS config.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.private_key.to_vec()))
    }

    pub fn serial_hex(&self) -> &str {
        &self.serial_hex
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    pub fn not_after_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.not_after)
    }

    /// Whether the current wall clock falls inside the validity window.
    pub fn is_valid(&self) -> bool {
        let now = SystemTime::now();
        now >= self.not_before && now <= self.not_after
    }

    /// Whether the validity window has ended.
    pub fn is_expired(&self) -> bool {
        SystemTime::now() > self.not_after
    }

    /// The instant at which a rotating holder should refresh: halfway
    /// through the total lifetime.
    pub fn refresh_at(&self) -> SystemTime {
        match self.not_after.duration_since(self.not_before) {
            Ok(lifetime) => self.not_before + lifetime / 2,
            Err(_) => self.not_after,
        }
    }

    /// Time left until expiry, zero once past it.
    pub fn remaining(&self) -> Duration {
        self.not_after.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO)
    }
}

/// The ordered set of root authority certificates for a trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    authorities: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    /// Build a bundle; input order is preserved and an empty authority set
    /// is refused.
    pub fn new(authorities: Vec<CertificateDer<'static>>) -> Result<Self> {
        if authorities.is_empty() {
            return Err(IdPlaneError::chain("trust bundle must contain at least one authority"));
        }
        Ok(TrustBundle { authorities })
    }

    /// Parse a bundle from concatenated PEM blocks.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        TrustBundle::new(certificates::certs_from_pem(pem)?)
    }

    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    /// PEM-encode the authorities, preserving input order.
    pub fn to_pem(&self) -> String {
        self.authorities.iter().map(|der| certificates::der_to_pem(der.as_ref())).collect()
    }
}

/// A workload identity as handed to callers: the SPIFFE URI, its current
/// document, and a short display name (last path segment, or the
/// trust-domain name for root identities).
#[derive(Debug, Clone)]
pub struct Identity {
    spiffe_id: SpiffeId,
    document: IdentityDocument,
    display_name: String,
}

impl Identity {
    pub fn new(spiffe_id: SpiffeId, document: IdentityDocument) -> Self {
        let display_name = spiffe_id.display_name();
        Identity { spiffe_id, document, display_name }
    }

    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    pub fn document(&self) -> &IdentityDocument {
        &self.document
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}
