//! SVID upstream providers for the rotating source.
//!
//! Two implementations of the same seam: [`AgentUpstream`] issues through
//! the in-process agent (dev, tests, single-binary deployments), and
//! [`WorkloadApiClient`] consumes an external identity provider over a
//! local stream socket. Selection happens by injection at the application
//! boundary; there is no build-time variant.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

use crate::agent::IssuanceAgent;
use crate::ca::CertificateAuthority;
use crate::domain::{IdentityDocument, SpiffeId, TrustBundle};
use crate::errors::{IdPlaneError, Result};
use crate::faults::{ops, FaultProfile};
use crate::utils::certificates;

/// What the rotating source's updater fetches.
#[async_trait]
pub trait SvidUpstream: Send + Sync {
    /// Produce a fresh SVID and the accompanying trust bundle.
    async fn fetch(&self) -> Result<(IdentityDocument, TrustBundle)>;
}

/// In-process upstream: every fetch re-issues the agent's SVID through the
/// local authority.
pub struct AgentUpstream {
    agent: Arc<IssuanceAgent>,
    ca: Arc<dyn CertificateAuthority>,
}

impl AgentUpstream {
    pub fn new(agent: Arc<IssuanceAgent>, ca: Arc<dyn CertificateAuthority>) -> Self {
        AgentUpstream { agent, ca }
    }
}

#[async_trait]
impl SvidUpstream for AgentUpstream {
    async fn fetch(&self) -> Result<(IdentityDocument, TrustBundle)> {
        let identity = self.agent.renew_identity()?;
        let bundle = self.ca.trust_bundle()?;
        Ok((identity.document().clone(), bundle))
    }
}

/// One streamed response of the workload-API protocol.
///
/// The provider answers a `fetch_x509_svid` request with one response per
/// rotation: the SVID chain and key as PEM, the identity, the expiry, and
/// the trust bundle.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct X509SvidResponse {
    pub(crate) spiffe_id: String,
    pub(crate) svid_pem: String,
    pub(crate) key_pem: String,
    pub(crate) expires_at_unix: i64,
    pub(crate) bundle_pem: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct X509SvidRequest {
    pub(crate) method: String,
}

pub(crate) const FETCH_METHOD: &str = "fetch_x509_svid";

enum Endpoint {
    #[cfg(unix)]
    Unix(std::path::PathBuf),
    Tcp(String),
}

enum Connection {
    #[cfg(unix)]
    Unix(BufReader<tokio::net::UnixStream>),
    Tcp(BufReader<tokio::net::TcpStream>),
}

impl Connection {
    async fn send_request(&mut self) -> std::io::Result<()> {
        let mut line =
            serde_json::to_vec(&X509SvidRequest { method: FETCH_METHOD.to_string() })
                .unwrap_or_default();
        line.push(b'\n');
        match self {
            #[cfg(unix)]
            Connection::Unix(stream) => stream.get_mut().write_all(&line).await,
            Connection::Tcp(stream) => stream.get_mut().write_all(&line).await,
        }
    }

    async fn read_line(&mut self, buf: &mut String) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Connection::Unix(stream) => stream.read_line(buf).await,
            Connection::Tcp(stream) => stream.read_line(buf).await,
        }
    }
}

/// Client for the upstream workload-API socket.
///
/// Holds at most one connection; the request is sent once per connection
/// and each fetch consumes the next streamed response. Transport failures
/// drop the connection and surface to the caller (the rotating source owns
/// the retry policy).
pub struct WorkloadApiClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    faults: Arc<FaultProfile>,
}

impl WorkloadApiClient {
    /// Build a client from a `unix://` or `tcp://` URL.
    pub fn from_url(socket_url: &str) -> Result<Self> {
        Self::from_url_with_faults(socket_url, FaultProfile::disabled())
    }

    /// Client with an injectable fault profile (tests only).
    pub fn from_url_with_faults(socket_url: &str, faults: Arc<FaultProfile>) -> Result<Self> {
        let url = url::Url::parse(socket_url).map_err(|e| {
            IdPlaneError::config_with_source(
                format!("invalid workload socket URL '{}'", socket_url),
                Box::new(e),
            )
        })?;

        let endpoint = match url.scheme() {
            "unix" => {
                #[cfg(unix)]
                {
                    // unix:///path/agent.sock carries the path in the URL path
                    let path = url.path();
                    if path.is_empty() {
                        return Err(IdPlaneError::config(format!(
                            "workload socket URL '{}' has no path",
                            socket_url
                        )));
                    }
                    Endpoint::Unix(std::path::PathBuf::from(path))
                }
                #[cfg(not(unix))]
                {
                    tracing::warn!("unix domain sockets are unavailable on this platform");
                    return Err(IdPlaneError::config(
                        "unix:// workload sockets require a Unix platform; peer credentials \
                         cannot be read here",
                    ));
                }
            }
            "tcp" => {
                let host = url.host_str().ok_or_else(|| {
                    IdPlaneError::config(format!("workload socket URL '{}' has no host", socket_url))
                })?;
                let port = url.port().ok_or_else(|| {
                    IdPlaneError::config(format!("workload socket URL '{}' has no port", socket_url))
                })?;
                Endpoint::Tcp(format!("{}:{}", host, port))
            }
            other => {
                return Err(IdPlaneError::config(format!(
                    "workload socket scheme must be unix:// or tcp://, got '{}'",
                    other
                )));
            }
        };

        Ok(WorkloadApiClient { endpoint, connection: Mutex::new(None), faults })
    }

    async fn connect(&self) -> Result<Connection> {
        let mut connection = match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| IdPlaneError::io(e, format!("connecting to {}", path.display())))?;
                Connection::Unix(BufReader::new(stream))
            }
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(|e| IdPlaneError::io(e, format!("connecting to {}", addr)))?;
                Connection::Tcp(BufReader::new(stream))
            }
        };
        connection
            .send_request()
            .await
            .map_err(|e| IdPlaneError::io(e, "sending fetch_x509_svid request"))?;
        debug!("workload API connection established");
        Ok(connection)
    }

    fn parse_response(response: &X509SvidResponse) -> Result<(IdentityDocument, TrustBundle)> {
        let identity = SpiffeId::parse(&response.spiffe_id)?;

        let mut chain = certificates::certs_from_pem(response.svid_pem.as_bytes())?;
        // Some providers prepend the leaf to a chain that already starts
        // with it; the wire chain must carry the leaf exactly once.
        if chain.len() >= 2 && chain[0] == chain[1] {
            chain.remove(0);
        }

        let key = certificates::private_key_from_pem(response.key_pem.as_bytes())?;
        let bundle = TrustBundle::from_pem(response.bundle_pem.as_bytes())?;

        // Chains from a provider that sends the bare leaf still need an
        // issuer entry; splice the bundle head in that case.
        if chain.len() < 2 {
            chain.extend(bundle.authorities().iter().cloned());
        }

        debug!(
            spiffe_id = %response.spiffe_id,
            expires_at_unix = response.expires_at_unix,
            "workload API response parsed"
        );

        let document = IdentityDocument::from_parts(identity, chain, key)?;
        if document.is_expired() {
            return Err(IdPlaneError::IdentityDocumentExpired {
                not_after: document.not_after_utc(),
            });
        }
        Ok((document, bundle))
    }
}

#[async_trait]
impl SvidUpstream for WorkloadApiClient {
    async fn fetch(&self) -> Result<(IdentityDocument, TrustBundle)> {
        self.faults.check(ops::UPSTREAM_FETCH)?;

        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(IdPlaneError::transport("workload API connection unavailable"));
        };

        let mut line = String::new();
        let read = connection.read_line(&mut line).await;

        match read {
            Ok(0) => {
                *guard = None;
                Err(IdPlaneError::transport("workload API closed the stream"))
            }
            Ok(_) => {
                let response: X509SvidResponse = serde_json::from_str(line.trim()).map_err(|e| {
                    *guard = None;
                    IdPlaneError::transport(format!("malformed workload API response: {}", e))
                })?;
                Self::parse_response(&response)
            }
            Err(e) => {
                *guard = None;
                Err(IdPlaneError::io(e, "reading workload API response"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attest::StaticUidAttestor;
    use crate::ca::InMemoryCa;
    use crate::domain::TrustDomain;
    use crate::registry::{IdentityRegistry, SealedRegistry};

    fn agent_upstream() -> AgentUpstream {
        let ca = Arc::new(InMemoryCa::new(TrustDomain::parse("example.org").unwrap()).unwrap());
        let registry = Arc::new(SealedRegistry::new());
        registry.seal();
        let attestor = Arc::new(StaticUidAttestor::new());
        let agent = Arc::new(
            IssuanceAgent::new("spiffe://example.org/agent", ca.clone(), registry, attestor)
                .unwrap(),
        );
        AgentUpstream::new(agent, ca)
    }

    #[tokio::test]
    async fn agent_upstream_rotates_serials() {
        let upstream = agent_upstream();
        let (first, bundle) = upstream.fetch().await.unwrap();
        let (second, _) = upstream.fetch().await.unwrap();
        assert_ne!(first.serial_hex(), second.serial_hex());
        assert_eq!(bundle.len(), 1);
        assert!(first.is_valid());
    }

    #[test]
    fn from_url_validates_scheme() {
        assert!(WorkloadApiClient::from_url("tcp://127.0.0.1:9443").is_ok());
        assert!(WorkloadApiClient::from_url("http://127.0.0.1:9443").is_err());
        assert!(WorkloadApiClient::from_url("not a url").is_err());
        assert!(WorkloadApiClient::from_url("tcp://127.0.0.1").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn from_url_accepts_unix_paths() {
        assert!(WorkloadApiClient::from_url("unix:///run/idplane/agent.sock").is_ok());
    }

    #[test]
    fn parse_response_deduplicates_leaf() {
        let ca = InMemoryCa::new(TrustDomain::parse("example.org").unwrap()).unwrap();
        let identity = SpiffeId::parse("spiffe://example.org/server").unwrap();
        let doc = ca.issue(&identity).unwrap();

        let leaf_pem = certificates::der_to_pem(doc.leaf().as_ref());
        let chain_pem: String =
            doc.chain().iter().map(|c| certificates::der_to_pem(c.as_ref())).collect();
        let key_der = match doc.private_key() {
            rustls::pki_types::PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der().to_vec(),
            _ => unreachable!("issuance emits PKCS#8"),
        };
        let key_pem = certificates::key_to_pem(&key_der).to_string();

        // Leaf duplicated at the head of the chain, as the buggy adapter
        // shape would produce.
        let response = X509SvidResponse {
            spiffe_id: identity.to_string(),
            svid_pem: format!("{}{}", leaf_pem, chain_pem),
            key_pem,
            expires_at_unix: 0,
            bundle_pem: ca.trust_bundle().unwrap().to_pem(),
        };

        let (document, _) = WorkloadApiClient::parse_response(&response).unwrap();
        assert_eq!(document.chain().len(), 2);
        assert_eq!(document.leaf(), doc.leaf());
    }
}
