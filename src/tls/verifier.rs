//! rustls certificate verifiers with SPIFFE authorization.
//!
//! Both directions run standard WebPKI chain validation first and only
//! then consult the [`Authorizer`] with the URI SAN extracted from the
//! peer's leaf. The client-side verifier tolerates exactly one deviation
//! from stock WebPKI behavior: SVIDs carry no DNS names, so the
//! name-mismatch outcome is ignored and replaced by URI policy.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::debug;

use crate::tls::Authorizer;
use crate::utils::certificates;

/// Pull the first SPIFFE URI out of a DER certificate's SAN extension.
pub(crate) fn spiffe_uri_from_der(der: &[u8]) -> Option<String> {
    certificates::leaf_info(der)
        .ok()?
        .uris
        .into_iter()
        .find(|uri| uri.starts_with("spiffe://"))
}

fn reject(reason: &str) -> rustls::Error {
    debug!(reason, "peer certificate rejected");
    rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
}

/// Server-side verifier: WebPKI client-cert validation plus the authorizer
/// on the client's SPIFFE URI.
#[derive(Debug)]
pub struct SpiffeClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    authorizer: Arc<Authorizer>,
}

impl SpiffeClientVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>, authorizer: Arc<Authorizer>) -> Self {
        SpiffeClientVerifier { inner, authorizer }
    }
}

impl ClientCertVerifier for SpiffeClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.inner.verify_client_cert(end_entity, intermediates, now)?;

        let uri = spiffe_uri_from_der(end_entity.as_ref())
            .ok_or_else(|| reject("no SPIFFE URI SAN in client certificate"))?;
        self.authorizer
            .authorize(&uri)
            .map_err(|e| reject(&e.to_string()))?;

        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Client-side verifier: WebPKI chain validation (name check replaced by
/// URI policy) plus the authorizer on the server's SPIFFE URI.
#[derive(Debug)]
pub struct SpiffeServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    authorizer: Arc<Authorizer>,
}

impl SpiffeServerVerifier {
    pub fn new(inner: Arc<WebPkiServerVerifier>, authorizer: Arc<Authorizer>) -> Self {
        SpiffeServerVerifier { inner, authorizer }
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_) => {}
            // The chain is valid at this point; the certificate simply has
            // no DNS identity. SPIFFE authorization decides instead.
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {}
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => {}
            Err(other) => return Err(other),
        }

        let uri = spiffe_uri_from_der(end_entity.as_ref())
            .ok_or_else(|| reject("no SPIFFE URI SAN in server certificate"))?;
        self.authorizer
            .authorize(&uri)
            .map_err(|e| reject(&e.to_string()))?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_spiffe_uri_only() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.subject_alt_names.push(rcgen::SanType::URI(
            rcgen::Ia5String::try_from("spiffe://example.org/server".to_string()).unwrap(),
        ));
        let cert = params.self_signed(&key).unwrap();

        let uri = spiffe_uri_from_der(cert.der().as_ref()).unwrap();
        assert_eq!(uri, "spiffe://example.org/server");
    }

    #[test]
    fn no_uri_yields_none() {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        assert!(spiffe_uri_from_der(cert.der().as_ref()).is_none());
    }

    #[test]
    fn non_spiffe_uri_sans_are_ignored() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.subject_alt_names.push(rcgen::SanType::URI(
            rcgen::Ia5String::try_from("https://example.org/app".to_string()).unwrap(),
        ));
        let cert = params.self_signed(&key).unwrap();
        assert!(spiffe_uri_from_der(cert.der().as_ref()).is_none());
    }
}
