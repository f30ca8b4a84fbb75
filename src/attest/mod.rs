//! Workload attestation: turning observed process attributes into
//! selectors.

#[cfg(unix)]
pub mod unix;

use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::{IdPlaneError, Result};

/// OS-level credentials of a workload process as observed at the local
/// endpoint.
#[derive(Debug, Clone, Default)]
pub struct ProcessIdentity {
    pub pid: i64,
    pub uid: i64,
    pub gid: i64,
    pub path: Option<PathBuf>,
}

impl ProcessIdentity {
    /// Negative numeric fields mean the kernel did not vouch for the peer.
    pub fn validate(&self) -> Result<()> {
        if self.pid < 0 || self.uid < 0 || self.gid < 0 {
            return Err(IdPlaneError::invalid_process_identity(format!(
                "negative credential field (pid={}, uid={}, gid={})",
                self.pid, self.uid, self.gid
            )));
        }
        Ok(())
    }
}

/// Converts process credentials into selector strings.
///
/// Attestors run on the thread holding the peer connection and must not
/// block on the workload.
pub trait WorkloadAttestor: Send + Sync {
    fn attest(&self, process: &ProcessIdentity) -> Result<Vec<String>>;
}

/// Reference attestor: a startup-registered `uid -> selectors` table.
///
/// Production deployments replace this with a peer-credential reader (see
/// [`unix`]); the table variant keeps dev and test wiring hermetic.
#[derive(Debug, Default)]
pub struct StaticUidAttestor {
    table: HashMap<u32, Vec<String>>,
}

impl StaticUidAttestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the selectors emitted for a UID. Later registrations for
    /// the same UID replace earlier ones.
    pub fn register(&mut self, uid: u32, selectors: Vec<String>) {
        self.table.insert(uid, selectors);
    }

    pub fn with_registration(mut self, uid: u32, selectors: Vec<String>) -> Self {
        self.register(uid, selectors);
        self
    }
}

impl WorkloadAttestor for StaticUidAttestor {
    fn attest(&self, process: &ProcessIdentity) -> Result<Vec<String>> {
        process.validate()?;
        // validate() guarantees uid fits in u32 territory for any real OS uid
        let uid = u32::try_from(process.uid).map_err(|_| {
            IdPlaneError::invalid_process_identity(format!("uid {} out of range", process.uid))
        })?;
        self.table.get(&uid).cloned().ok_or_else(|| {
            IdPlaneError::attestation(format!("no selectors registered for uid {}", uid))
        })
    }
}

/// Attestor emitting `unix:uid`, `unix:gid`, and `unix:pid` selectors from
/// kernel-provided peer credentials.
#[derive(Debug, Default)]
pub struct PeerCredAttestor;

impl PeerCredAttestor {
    pub fn new() -> Self {
        Self
    }
}

impl WorkloadAttestor for PeerCredAttestor {
    fn attest(&self, process: &ProcessIdentity) -> Result<Vec<String>> {
        process.validate()?;
        let mut selectors = vec![
            format!("unix:uid:{}", process.uid),
            format!("unix:gid:{}", process.gid),
        ];
        if process.pid > 0 {
            selectors.push(format!("unix:pid:{}", process.pid));
        }
        if let Some(path) = &process.path {
            selectors.push(format!("unix:path:{}", path.display()));
        }
        Ok(selectors)
    }
}
