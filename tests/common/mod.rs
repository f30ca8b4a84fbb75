//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rcgen::{CertificateParams, DnType, Ia5String, KeyPair, SanType, SerialNumber};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use idplane::agent::IssuanceAgent;
use idplane::attest::StaticUidAttestor;
use idplane::ca::InMemoryCa;
use idplane::domain::{
    IdentityDocument, IdentityMapper, SelectorSet, SpiffeId, TrustBundle, TrustDomain,
};
use idplane::errors::Result;
use idplane::registry::{IdentityRegistry, SealedRegistry};
use idplane::tls::{SvidSnapshot, SvidSource, SvidUpstream};

pub fn trust_domain() -> TrustDomain {
    TrustDomain::parse("example.org").unwrap()
}

pub fn spiffe(uri: &str) -> SpiffeId {
    SpiffeId::parse(uri).unwrap()
}

pub fn selectors(items: &[&str]) -> SelectorSet {
    SelectorSet::parse_all(items.iter().copied()).unwrap()
}

pub fn mapper(identity: &str, required: &[&str]) -> IdentityMapper {
    IdentityMapper::new(spiffe(identity), selectors(required)).unwrap()
}

/// A wired issuance core over a fresh in-memory authority.
pub struct TestCore {
    pub ca: Arc<InMemoryCa>,
    pub registry: Arc<SealedRegistry>,
    pub agent: Arc<IssuanceAgent>,
    pub cancel: CancellationToken,
}

/// Seed the registry with `registrations`, register `uids` in the
/// attestor, seal, and stand up an agent at `spiffe://example.org/agent`.
pub fn build_core(
    registrations: &[(&str, &[&str])],
    uids: &[(u32, &[&str])],
) -> TestCore {
    let ca = Arc::new(InMemoryCa::new(trust_domain()).unwrap());
    let registry = Arc::new(SealedRegistry::new());
    for (identity, required) in registrations {
        registry.seed(mapper(identity, required)).unwrap();
    }
    registry.seal();

    let mut attestor = StaticUidAttestor::new();
    for (uid, emitted) in uids {
        attestor.register(*uid, emitted.iter().map(|s| s.to_string()).collect());
    }

    let agent = Arc::new(
        IssuanceAgent::new(
            "spiffe://example.org/agent",
            ca.clone(),
            registry.clone(),
            Arc::new(attestor),
        )
        .unwrap(),
    );

    TestCore { ca, registry, agent, cancel: CancellationToken::new() }
}

/// A fixed-material SVID source for handshake tests: one document, one
/// bundle, no rotation.
pub struct StaticSource {
    snapshot: SvidSnapshot,
    trust_domain: TrustDomain,
}

impl StaticSource {
    pub fn new(svid: IdentityDocument, bundle: TrustBundle) -> Self {
        StaticSource {
            snapshot: SvidSnapshot { svid: Arc::new(svid), bundle: Arc::new(bundle) },
            trust_domain: trust_domain(),
        }
    }
}

impl SvidSource for StaticSource {
    fn current_svid(&self) -> Result<Arc<IdentityDocument>> {
        Ok(self.snapshot.svid.clone())
    }

    fn current_bundle(&self, td: &TrustDomain) -> Result<Arc<TrustBundle>> {
        if td == &self.trust_domain {
            Ok(self.snapshot.bundle.clone())
        } else {
            Err(idplane::IdPlaneError::TrustBundleNotFound { trust_domain: td.to_string() })
        }
    }

    fn close(&self) {}
}

/// Upstream stub issuing certificates whose remaining lifetime is a fixed
/// fraction of their total lifetime, with a deterministic serial per
/// fetch. Lets rotation tests start past the refresh threshold.
pub struct ShortLivedUpstream {
    identity: SpiffeId,
    ca_key: KeyPair,
    ca_cert: rcgen::Certificate,
    ca_der: rustls::pki_types::CertificateDer<'static>,
    pub fetches: AtomicUsize,
    /// Seconds of lifetime already burned at issuance time.
    pub elapsed_secs: i64,
    /// Seconds of lifetime left at issuance time.
    pub remaining_secs: i64,
    pub faults: Arc<idplane::faults::FaultProfile>,
}

impl ShortLivedUpstream {
    pub fn new(identity: &str, elapsed_secs: i64, remaining_secs: i64) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "rotation test authority");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Constrained(0));
        let ca_cert = params.self_signed(&ca_key).unwrap();
        let ca_der = ca_cert.der().clone();

        ShortLivedUpstream {
            identity: spiffe(identity),
            ca_key,
            ca_cert,
            ca_der,
            fetches: AtomicUsize::new(0),
            elapsed_secs,
            remaining_secs,
            faults: idplane::faults::FaultProfile::new(),
        }
    }

    fn issue(&self, serial: usize) -> IdentityDocument {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, self.identity.to_string());
        params.subject_alt_names = vec![SanType::URI(
            Ia5String::try_from(self.identity.to_string()).unwrap(),
        )];
        params.serial_number = Some(SerialNumber::from(serial as u64));
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::seconds(self.elapsed_secs);
        params.not_after = now + time::Duration::seconds(self.remaining_secs);
        let leaf = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        IdentityDocument::from_parts(
            self.identity.clone(),
            vec![leaf.der().clone(), self.ca_der.clone()],
            Zeroizing::new(key.serialize_der()),
        )
        .unwrap()
    }

    pub fn bundle(&self) -> TrustBundle {
        TrustBundle::new(vec![self.ca_der.clone()]).unwrap()
    }
}

#[async_trait]
impl SvidUpstream for ShortLivedUpstream {
    async fn fetch(&self) -> Result<(IdentityDocument, TrustBundle)> {
        self.faults.check(idplane::faults::ops::UPSTREAM_FETCH)?;
        let serial = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((self.issue(serial), self.bundle()))
    }
}
