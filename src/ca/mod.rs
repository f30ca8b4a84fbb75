//! In-memory certificate authority.
//!
//! The authority owns its RSA root key for the process lifetime; the key
//! never leaves this module. Leaf signing serializes behind a mutex, so
//! concurrent issuance is safe but single-file at the signature step.

use std::sync::Mutex;

use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::CertificateDer;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::domain::{IdentityDocument, SpiffeId, TrustBundle, TrustDomain};
use crate::errors::{IdPlaneError, Result};
use crate::faults::{ops, FaultProfile};

/// RSA modulus size for the root and all issued leaves.
const RSA_KEY_BITS: usize = 2048;

/// Leaf validity window.
const LEAF_VALIDITY: time::Duration = time::Duration::hours(24);

/// Root validity window.
const ROOT_VALIDITY: time::Duration = time::Duration::days(365);

/// Clock-skew backdate applied to every NotBefore.
const BACKDATE: time::Duration = time::Duration::minutes(5);

/// Issues X.509 SVIDs for a single trust domain.
///
/// The concrete wiring happens once at startup; everything downstream
/// talks to this seam.
pub trait CertificateAuthority: Send + Sync {
    /// The trust domain this authority serves.
    fn trust_domain(&self) -> &TrustDomain;

    /// Mint a 24-hour leaf whose sole URI SAN is `identity`.
    fn issue(&self, identity: &SpiffeId) -> Result<IdentityDocument>;

    /// The authority certificates in PEM-preserving order; never empty for
    /// an initialized authority.
    fn trust_bundle(&self) -> Result<TrustBundle>;
}

struct Signer {
    cert: Certificate,
    key: KeyPair,
}

/// RSA-2048 in-memory authority. Key material is held in memory only;
/// persistence, if ever needed, is delegated to an external signer behind
/// the same trait.
pub struct InMemoryCa {
    trust_domain: TrustDomain,
    signer: Mutex<Signer>,
    root_der: CertificateDer<'static>,
    faults: std::sync::Arc<FaultProfile>,
}

impl InMemoryCa {
    /// Generate a self-signed root for `trust_domain`: CA=true,
    /// KeyCertSign|CrlSign, path length 1, one year of validity.
    pub fn new(trust_domain: TrustDomain) -> Result<Self> {
        Self::with_faults(trust_domain, FaultProfile::disabled())
    }

    /// Authority with an injectable fault profile (tests only; production
    /// callers go through [`InMemoryCa::new`]).
    pub fn with_faults(
        trust_domain: TrustDomain,
        faults: std::sync::Arc<FaultProfile>,
    ) -> Result<Self> {
        let key = generate_rsa_key_pair()?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| IdPlaneError::document_with_source("bad root parameters", Box::new(e)))?;
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} root authority", trust_domain));
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + ROOT_VALIDITY;

        let cert = params
            .self_signed(&key)
            .map_err(|e| IdPlaneError::document_with_source("failed to self-sign root", Box::new(e)))?;
        let root_der = cert.der().clone();

        info!(trust_domain = %trust_domain, "certificate authority initialized");

        Ok(InMemoryCa { trust_domain, signer: Mutex::new(Signer { cert, key }), root_der, faults })
    }

    /// The root certificate in DER form.
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }
}

impl CertificateAuthority for InMemoryCa {
    fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    fn issue(&self, identity: &SpiffeId) -> Result<IdentityDocument> {
        self.faults.check(ops::CA_ISSUE)?;

        if identity.trust_domain() != &self.trust_domain {
            return Err(IdPlaneError::document(format!(
                "trust domain mismatch: authority serves '{}', identity belongs to '{}'",
                self.trust_domain,
                identity.trust_domain()
            )));
        }

        let leaf_key = generate_rsa_key_pair()?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| IdPlaneError::document_with_source("bad leaf parameters", Box::new(e)))?;
        params.distinguished_name.push(DnType::CommonName, identity.to_string());
        let uri = Ia5String::try_from(identity.to_string()).map_err(|e| {
            IdPlaneError::document_with_source("identity is not IA5-encodable", Box::new(e))
        })?;
        params.subject_alt_names = vec![SanType::URI(uri)];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages =
            vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages =
            vec![ExtendedKeyUsagePurpose::ClientAuth, ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + LEAF_VALIDITY;

        let leaf = {
            let signer = self.signer.lock().map_err(|_| IdPlaneError::CaNotInitialized)?;
            params.signed_by(&leaf_key, &signer.cert, &signer.key).map_err(|e| {
                IdPlaneError::document_with_source("failed to sign leaf", Box::new(e))
            })?
        };

        debug!(identity = %identity, "issued leaf certificate");

        let chain = vec![leaf.der().clone(), self.root_der.clone()];
        let key_der = Zeroizing::new(leaf_key.serialize_der());
        IdentityDocument::from_parts(identity.clone(), chain, key_der)
    }

    fn trust_bundle(&self) -> Result<TrustBundle> {
        TrustBundle::new(vec![self.root_der.clone()])
    }
}

/// Aggregate the bundles of several authorities, preserving input order.
/// Supports federating trust material without sharing signer state.
pub fn aggregate_bundle(authorities: &[&dyn CertificateAuthority]) -> Result<TrustBundle> {
    let mut certs = Vec::new();
    for ca in authorities {
        certs.extend(ca.trust_bundle()?.authorities().to_vec());
    }
    TrustBundle::new(certs)
}

/// Generate an RSA-2048 key pair usable by the rcgen signer.
///
/// ring signs RSA but cannot generate RSA keys, so generation goes through
/// the pure-Rust `rsa` crate and the PKCS#8 DER is handed to rcgen. The
/// intermediate DER buffer is zeroized.
fn generate_rsa_key_pair() -> Result<KeyPair> {
    let mut rng = rand::rngs::OsRng;
    let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| IdPlaneError::document_with_source("RSA key generation failed", Box::new(e)))?;
    let der = private
        .to_pkcs8_der()
        .map_err(|e| IdPlaneError::document_with_source("PKCS#8 encoding failed", Box::new(e)))?;
    let der = Zeroizing::new(der.as_bytes().to_vec());
    KeyPair::try_from(der.as_slice())
        .map_err(|e| IdPlaneError::document_with_source("rcgen rejected RSA key", Box::new(e)))
}

/// Random positive 62-bit serial number.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 0x3f;
    SerialNumber::from(bytes.to_vec())
}
