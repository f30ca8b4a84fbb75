//! Kernel peer-credential extraction for Unix domain sockets.
//!
//! The local workload endpoint learns who connected from `SO_PEERCRED`;
//! the resulting [`ProcessIdentity`] feeds any
//! [`WorkloadAttestor`](crate::attest::WorkloadAttestor). Platforms
//! without peer credentials never reach this module; the endpoint refuses
//! to start there.

use tokio::net::UnixStream;
use tracing::debug;

use crate::attest::ProcessIdentity;
use crate::errors::{IdPlaneError, Result};

/// Read the peer's credentials off a connected Unix socket.
pub fn peer_process_identity(stream: &UnixStream) -> Result<ProcessIdentity> {
    let cred = stream
        .peer_cred()
        .map_err(|e| IdPlaneError::io(e, "reading SO_PEERCRED from workload socket"))?;

    // The peer pid is only exposed on some Unixes.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let pid = i64::from(cred.pid().unwrap_or(0));
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let pid = 0i64;

    let identity = ProcessIdentity {
        pid,
        uid: i64::from(cred.uid()),
        gid: i64::from(cred.gid()),
        path: executable_path(pid),
    };
    debug!(uid = identity.uid, gid = identity.gid, pid = identity.pid, "peer credentials read");
    Ok(identity)
}

/// Best-effort resolution of the peer's executable. The binary may have
/// exited or be unreadable; that only costs the `unix:path` selector.
#[cfg(target_os = "linux")]
fn executable_path(pid: i64) -> Option<std::path::PathBuf> {
    if pid <= 0 {
        return None;
    }
    std::fs::read_link(format!("/proc/{}/exe", pid)).ok()
}

#[cfg(not(target_os = "linux"))]
fn executable_path(_pid: i64) -> Option<std::path::PathBuf> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attest::{PeerCredAttestor, WorkloadAttestor};

    #[tokio::test]
    async fn reads_own_credentials_over_socketpair() {
        let (left, _right) = UnixStream::pair().unwrap();
        let identity = peer_process_identity(&left).unwrap();
        identity.validate().unwrap();

        // The peer of a socketpair is this very process.
        #[cfg(target_os = "linux")]
        assert_eq!(identity.pid, i64::from(std::process::id()));

        let selectors = PeerCredAttestor::new().attest(&identity).unwrap();
        assert!(selectors.iter().any(|s| s.starts_with("unix:uid:")));
        assert!(selectors.iter().any(|s| s.starts_with("unix:gid:")));
    }
}
