//! Local workload endpoint.
//!
//! The stream socket workloads connect to for their SVIDs. The kernel's
//! peer credentials feed the attestor, the agent runs the issuance flow,
//! and the connection receives one response per rotation until either
//! side goes away. Platforms without peer credentials refuse to start the
//! endpoint.

#[cfg(unix)]
pub use imp::WorkloadEndpoint;

#[cfg(unix)]
mod imp {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    use crate::agent::IssuanceAgent;
    use crate::attest::unix::peer_process_identity;
    use crate::ca::CertificateAuthority;
    use crate::domain::Identity;
    use crate::errors::{IdPlaneError, Result};
    use crate::tls::upstream::{X509SvidRequest, X509SvidResponse, FETCH_METHOD};
    use crate::utils::certificates;

    /// Serves the workload-API protocol on a Unix domain socket.
    pub struct WorkloadEndpoint {
        listener: UnixListener,
        path: PathBuf,
        agent: Arc<IssuanceAgent>,
        ca: Arc<dyn CertificateAuthority>,
    }

    impl WorkloadEndpoint {
        /// Bind the endpoint socket. A stale socket file from a previous
        /// run is removed first.
        pub fn bind(
            path: &Path,
            agent: Arc<IssuanceAgent>,
            ca: Arc<dyn CertificateAuthority>,
        ) -> Result<Self> {
            if path.exists() {
                std::fs::remove_file(path)
                    .map_err(|e| IdPlaneError::io(e, format!("removing stale {}", path.display())))?;
            }
            let listener = UnixListener::bind(path)
                .map_err(|e| IdPlaneError::io(e, format!("binding {}", path.display())))?;
            info!(path = %path.display(), "workload endpoint listening");
            Ok(WorkloadEndpoint { listener, path: path.to_path_buf(), agent, ca })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Accept and serve workloads until cancelled.
        pub async fn serve(&self, cancel: &CancellationToken) -> Result<()> {
            loop {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => stream,
                            Err(e) => {
                                warn!(error = %e, "workload endpoint accept failed");
                                continue;
                            }
                        }
                    }
                };

                let agent = self.agent.clone();
                let ca = self.ca.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_workload(stream, agent, ca, conn_cancel).await {
                        debug!(error = %e, "workload connection ended");
                    }
                });
            }
        }
    }

    async fn handle_workload(
        stream: UnixStream,
        agent: Arc<IssuanceAgent>,
        ca: Arc<dyn CertificateAuthority>,
        cancel: CancellationToken,
    ) -> Result<()> {
        // Attestation input comes from the kernel, never from the peer.
        let process = peer_process_identity(&stream)?;
        let mut reader = BufReader::new(stream);

        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| IdPlaneError::io(e, "reading workload request"))?;
        if read == 0 {
            return Ok(());
        }
        let request: X509SvidRequest = serde_json::from_str(line.trim())?;
        if request.method != FETCH_METHOD {
            return Err(IdPlaneError::transport(format!(
                "unsupported workload API method '{}'",
                request.method
            )));
        }

        // One response now, then one per rotation.
        loop {
            let identity = {
                let span = crate::issuance_span!(FETCH_METHOD, process.uid);
                let _guard = span.enter();
                agent.fetch_identity_document(&process, &cancel)?
            };
            let response = encode_response(&identity, &ca)?;
            reader
                .get_mut()
                .write_all(response.as_bytes())
                .await
                .map_err(|e| IdPlaneError::io(e, "writing workload response"))?;
            debug!(identity = %identity.spiffe_id(), "SVID delivered to workload");

            let wait = identity
                .document()
                .refresh_at()
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::from_millis(50));
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn encode_response(identity: &Identity, ca: &Arc<dyn CertificateAuthority>) -> Result<String> {
        let document = identity.document();
        let svid_pem: String =
            document.chain().iter().map(|der| certificates::der_to_pem(der.as_ref())).collect();
        let key = document.private_key();
        let key_pem = certificates::key_to_pem(key.secret_der()).to_string();

        let expires_at_unix = document
            .not_after()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        let response = X509SvidResponse {
            spiffe_id: identity.spiffe_id().to_string(),
            svid_pem,
            key_pem,
            expires_at_unix,
            bundle_pem: ca.trust_bundle()?.to_pem(),
        };
        let mut line = serde_json::to_string(&response)
            .map_err(|e| IdPlaneError::transport(format!("encoding workload response: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(not(unix))]
pub use fallback::WorkloadEndpoint;

#[cfg(not(unix))]
mod fallback {
    use std::path::Path;
    use std::sync::Arc;

    use crate::agent::IssuanceAgent;
    use crate::ca::CertificateAuthority;
    use crate::errors::{IdPlaneError, Result};

    /// Peer credentials are unavailable here; the endpoint refuses to
    /// start.
    pub struct WorkloadEndpoint;

    impl WorkloadEndpoint {
        pub fn bind(
            _path: &Path,
            _agent: Arc<IssuanceAgent>,
            _ca: Arc<dyn CertificateAuthority>,
        ) -> Result<Self> {
            tracing::warn!(
                "workload endpoint requires kernel peer credentials; unavailable on this platform"
            );
            Err(IdPlaneError::config(
                "workload endpoint requires a Unix platform with SO_PEERCRED",
            ))
        }
    }
}
