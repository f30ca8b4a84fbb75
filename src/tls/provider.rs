//! mTLS channel construction.
//!
//! Builds rustls server and client configurations from the current SVID
//! source snapshot, wires the SPIFFE verifiers in, and exposes the peer's
//! identity from an established connection. Configs are rebuilt per
//! connection so rotated credentials take effect without restarting
//! listeners.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, CommonState, RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{SpiffeId, TrustBundle, TrustDomain};
use crate::errors::{IdPlaneError, Result};
use crate::tls::verifier::{spiffe_uri_from_der, SpiffeClientVerifier, SpiffeServerVerifier};
use crate::tls::{Authorizer, SvidSource};

/// Channel timeouts with secure non-zero defaults.
#[derive(Debug, Clone)]
pub struct ChannelTimeouts {
    /// Budget for the TLS handshake (the read-header phase of a request).
    pub read_header: Duration,
    /// Budget for reading one peer request after the handshake.
    pub read: Duration,
    /// Budget for writing one response.
    pub write: Duration,
    /// Upper bound on an entire peer session.
    pub idle: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        ChannelTimeouts {
            read_header: Duration::from_secs(5),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
            idle: Duration::from_secs(120),
        }
    }
}

/// The peer's identity as established by the TLS layer.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub uri: SpiffeId,
    /// The peer's presented chain, leaf first.
    pub chain: Vec<CertificateDer<'static>>,
}

/// Builds SPIFFE-authorized TLS configurations from an SVID source.
pub struct MtlsProvider {
    source: Arc<dyn SvidSource>,
    trust_domain: TrustDomain,
    authorizer: Arc<Authorizer>,
}

impl MtlsProvider {
    pub fn new(
        source: Arc<dyn SvidSource>,
        trust_domain: TrustDomain,
        authorizer: Authorizer,
    ) -> Self {
        MtlsProvider { source, trust_domain, authorizer: Arc::new(authorizer) }
    }

    fn root_store(&self, bundle: &TrustBundle) -> Result<Arc<RootCertStore>> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) =
            roots.add_parsable_certificates(bundle.authorities().iter().cloned());
        debug!(added, ignored, "trust bundle loaded into root store");
        if roots.is_empty() {
            return Err(IdPlaneError::chain("trust bundle contains no usable authorities"));
        }
        Ok(Arc::new(roots))
    }

    /// Server configuration: presents the current SVID, requires client
    /// certificates, and authorizes the client's SPIFFE URI after chain
    /// validation. TLS 1.2 is the floor and 1.3 is preferred (rustls
    /// default ordering); session resumption stays enabled.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let svid = self.source.current_svid()?;
        let bundle = self.source.current_bundle(&self.trust_domain)?;
        let roots = self.root_store(&bundle)?;

        let webpki = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| IdPlaneError::chain(format!("client verifier: {}", e)))?;
        let verifier = Arc::new(SpiffeClientVerifier::new(webpki, self.authorizer.clone()));

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(svid.chain_owned(), svid.private_key())?;
        Ok(Arc::new(config))
    }

    /// Client configuration: presents the current SVID and authorizes the
    /// server's SPIFFE URI after chain validation against the bundle.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let svid = self.source.current_svid()?;
        let bundle = self.source.current_bundle(&self.trust_domain)?;
        let roots = self.root_store(&bundle)?;

        let webpki = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| IdPlaneError::chain(format!("server verifier: {}", e)))?;
        let verifier = Arc::new(SpiffeServerVerifier::new(webpki, self.authorizer.clone()));

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(svid.chain_owned(), svid.private_key())?;
        Ok(Arc::new(config))
    }

    /// A connector over the current client configuration.
    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(self.client_config()?))
    }

    /// Connect to `addr` and complete the handshake. `server_name` feeds
    /// SNI only; the server is authorized by its SPIFFE URI.
    pub async fn connect(
        &self,
        addr: &str,
        server_name: &str,
        timeouts: &ChannelTimeouts,
    ) -> Result<(tokio_rustls::client::TlsStream<TcpStream>, PeerIdentity)> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| IdPlaneError::config(format!("invalid server name: {}", e)))?;
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| IdPlaneError::io(e, format!("connecting to {}", addr)))?;

        let handshake = self.connector()?.connect(name, tcp);
        let stream = tokio::time::timeout(timeouts.read_header, handshake)
            .await
            .map_err(|_| {
                IdPlaneError::transport(format!("handshake with {} timed out", addr))
            })?
            .map_err(categorize_handshake_error)?;

        let peer = peer_identity(stream.get_ref().1)?;
        Ok((stream, peer))
    }
}

/// mTLS server channel: accepts connections whose peer passes chain
/// validation and the authorizer.
pub struct MtlsListener {
    listener: TcpListener,
    provider: Arc<MtlsProvider>,
    timeouts: ChannelTimeouts,
}

impl MtlsListener {
    pub async fn bind(
        addr: &str,
        provider: Arc<MtlsProvider>,
        timeouts: ChannelTimeouts,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| IdPlaneError::io(e, format!("binding {}", addr)))?;
        info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "mTLS channel listening");
        Ok(MtlsListener { listener, provider, timeouts })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| IdPlaneError::io(e, "reading local address"))
    }

    /// Accept one connection and run the handshake under the read-header
    /// budget. The server config is rebuilt from the current snapshot so a
    /// rotated SVID is picked up without rebinding.
    pub async fn accept(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(tokio_rustls::server::TlsStream<TcpStream>, PeerIdentity, SocketAddr)> {
        let (tcp, remote) = tokio::select! {
            _ = cancel.cancelled() => return Err(IdPlaneError::Cancelled),
            accepted = self.listener.accept() => {
                accepted.map_err(|e| IdPlaneError::io(e, "accepting connection"))?
            }
        };

        let acceptor = TlsAcceptor::from(self.provider.server_config()?);
        let handshake = acceptor.accept(tcp);
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(IdPlaneError::Cancelled),
            done = tokio::time::timeout(self.timeouts.read_header, handshake) => {
                done.map_err(|_| {
                    IdPlaneError::transport(format!("handshake with {} timed out", remote))
                })?
                .map_err(categorize_handshake_error)?
            }
        };

        let peer = peer_identity(stream.get_ref().1)?;
        debug!(peer = %peer.uri, remote = %remote, "peer authenticated");
        Ok((stream, peer, remote))
    }
}

/// Extract `{uri, chain}` from an established TLS connection.
///
/// Fails with `Unauthenticated` when the peer presented no certificate or
/// the leaf carries no SPIFFE URI SAN.
pub fn peer_identity(conn: &CommonState) -> Result<PeerIdentity> {
    let chain = conn
        .peer_certificates()
        .ok_or_else(|| IdPlaneError::unauthenticated("peer presented no certificate"))?;
    let leaf = chain
        .first()
        .ok_or_else(|| IdPlaneError::unauthenticated("peer chain is empty"))?;

    let uri = spiffe_uri_from_der(leaf.as_ref())
        .ok_or_else(|| IdPlaneError::unauthenticated("peer leaf carries no SPIFFE URI SAN"))?;
    let uri = SpiffeId::parse(&uri)
        .map_err(|e| IdPlaneError::unauthenticated(format!("peer URI rejected: {}", e)))?;

    Ok(PeerIdentity { uri, chain: chain.to_vec() })
}

/// Map a handshake I/O error to the channel's error taxonomy.
fn categorize_handshake_error(error: std::io::Error) -> IdPlaneError {
    let Some(inner) = error.get_ref() else {
        return IdPlaneError::transport(format!("handshake failed: {}", error));
    };
    let Some(tls) = inner.downcast_ref::<rustls::Error>() else {
        return IdPlaneError::transport(format!("handshake failed: {}", error));
    };

    match tls {
        rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure) => {
            IdPlaneError::unauthenticated("peer failed SPIFFE authorization")
        }
        rustls::Error::InvalidCertificate(cert_err) => {
            IdPlaneError::chain(format!("peer certificate rejected: {:?}", cert_err))
        }
        rustls::Error::AlertReceived(alert) => {
            IdPlaneError::unauthenticated(format!("peer sent TLS alert: {:?}", alert))
        }
        other => IdPlaneError::transport(format!("handshake failed: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_are_secure_and_nonzero() {
        let t = ChannelTimeouts::default();
        assert_eq!(t.read_header, Duration::from_secs(5));
        assert_eq!(t.read, Duration::from_secs(30));
        assert_eq!(t.write, Duration::from_secs(30));
        assert_eq!(t.idle, Duration::from_secs(120));
    }

    #[test]
    fn categorize_plain_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(categorize_handshake_error(err), IdPlaneError::Transport(_)));
    }

    #[test]
    fn categorize_policy_rejection() {
        let tls = rustls::Error::InvalidCertificate(
            rustls::CertificateError::ApplicationVerificationFailure,
        );
        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        assert!(matches!(categorize_handshake_error(err), IdPlaneError::Unauthenticated { .. }));
    }

    #[test]
    fn categorize_chain_rejection() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        assert!(matches!(
            categorize_handshake_error(err),
            IdPlaneError::CertificateChainInvalid { .. }
        ));
    }
}
