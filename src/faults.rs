//! Fault injection for tests.
//!
//! A thread-safe profile passed explicitly to the components that consult
//! it; production wiring uses the disabled instance, which answers every
//! check with success at the cost of one atomic load. There is no global
//! or one-shot state: arming is per-profile and per-operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{IdPlaneError, Result};

/// Named injection points.
pub mod ops {
    /// Leaf issuance inside the certificate authority.
    pub const CA_ISSUE: &str = "ca.issue";
    /// One upstream fetch of the rotating source.
    pub const UPSTREAM_FETCH: &str = "upstream.fetch";
}

/// A fault profile: per-operation counters of injected failures.
///
/// `check(op)` consumes one armed failure for `op` if present. A profile
/// constructed with [`FaultProfile::disabled`] never fails and never
/// takes the lock.
#[derive(Debug, Default)]
pub struct FaultProfile {
    enabled: AtomicBool,
    armed: Mutex<HashMap<String, u32>>,
}

impl FaultProfile {
    /// The production instance: every check passes.
    pub fn disabled() -> Arc<Self> {
        Arc::new(FaultProfile::default())
    }

    /// A profile that tests can arm.
    pub fn new() -> Arc<Self> {
        let profile = FaultProfile::default();
        profile.enabled.store(true, Ordering::Release);
        Arc::new(profile)
    }

    /// Make the next `count` checks of `op` fail.
    pub fn arm(&self, op: &str, count: u32) {
        self.enabled.store(true, Ordering::Release);
        if let Ok(mut armed) = self.armed.lock() {
            *armed.entry(op.to_string()).or_insert(0) += count;
        }
    }

    /// Clear any armed failures for `op`.
    pub fn disarm(&self, op: &str) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.remove(op);
        }
    }

    /// Consume one armed failure for `op`, if any.
    pub fn check(&self, op: &str) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut armed = match self.armed.lock() {
            Ok(armed) => armed,
            Err(_) => return Ok(()),
        };
        match armed.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                if *remaining == 0 {
                    armed.remove(op);
                }
                Err(IdPlaneError::transport(format!("injected fault at '{}'", op)))
            }
            _ => Ok(()),
        }
    }

    /// Armed failures left for `op`.
    pub fn remaining(&self, op: &str) -> u32 {
        self.armed.lock().ok().and_then(|armed| armed.get(op).copied()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_profile_always_passes() {
        let profile = FaultProfile::disabled();
        for _ in 0..16 {
            profile.check(ops::CA_ISSUE).unwrap();
        }
    }

    #[test]
    fn armed_faults_are_consumed_in_order() {
        let profile = FaultProfile::new();
        profile.arm(ops::CA_ISSUE, 2);
        assert_eq!(profile.remaining(ops::CA_ISSUE), 2);

        assert!(profile.check(ops::CA_ISSUE).is_err());
        assert!(profile.check(ops::CA_ISSUE).is_err());
        assert!(profile.check(ops::CA_ISSUE).is_ok());
        assert_eq!(profile.remaining(ops::CA_ISSUE), 0);
    }

    #[test]
    fn operations_are_independent() {
        let profile = FaultProfile::new();
        profile.arm(ops::UPSTREAM_FETCH, 1);
        assert!(profile.check(ops::CA_ISSUE).is_ok());
        assert!(profile.check(ops::UPSTREAM_FETCH).is_err());
    }

    #[test]
    fn disarm_clears_pending_faults() {
        let profile = FaultProfile::new();
        profile.arm(ops::CA_ISSUE, 5);
        profile.disarm(ops::CA_ISSUE);
        assert!(profile.check(ops::CA_ISSUE).is_ok());
    }

    #[test]
    fn profile_is_shareable_across_threads() {
        let profile = FaultProfile::new();
        profile.arm(ops::CA_ISSUE, 8);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let profile = profile.clone();
                std::thread::spawn(move || {
                    (0..4).filter(|_| profile.check(ops::CA_ISSUE).is_err()).count()
                })
            })
            .collect();

        let failures: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(failures, 8);
    }
}
