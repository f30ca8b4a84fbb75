//! Rotating X.509 SVID source.
//!
//! A single background updater task fetches `(SVID, trust bundle)` pairs
//! from an upstream provider and publishes them through a watch channel;
//! readers take atomic snapshots and never block on the updater. The
//! updater refreshes once the active SVID has burned half its lifetime,
//! backs off exponentially (with jitter) on failure, and keeps serving the
//! last valid SVID until actual expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{IdentityDocument, TrustBundle, TrustDomain};
use crate::errors::{IdPlaneError, Result};
use crate::tls::upstream::SvidUpstream;

/// Floor applied to idle waits so state churn can never busy-loop the
/// updater.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

/// The pair readers consume.
#[derive(Debug, Clone)]
pub struct SvidSnapshot {
    pub svid: Arc<IdentityDocument>,
    pub bundle: Arc<TrustBundle>,
}

#[derive(Debug, Clone, Default)]
enum SourceState {
    #[default]
    NotReady,
    Active(SvidSnapshot),
    Failed(String),
    Closed,
}

/// Read side of a long-lived SVID provider.
pub trait SvidSource: Send + Sync {
    /// The active leaf, key, and chain.
    fn current_svid(&self) -> Result<Arc<IdentityDocument>>;

    /// The authority set for `trust_domain`.
    fn current_bundle(&self, trust_domain: &TrustDomain) -> Result<Arc<TrustBundle>>;

    /// Stop the updater and release the upstream; subsequent reads fail
    /// with `Closed`.
    fn close(&self);
}

/// Updater cadence knobs. Tests shrink these; production keeps defaults.
#[derive(Debug, Clone)]
pub struct RotationTiming {
    /// Deadline for the very first fetch; construction fails once passed.
    pub initial_fetch_timeout: Duration,
    /// Upper bound between refresh-need checks.
    pub check_interval: Duration,
    /// First retry delay after a failed fetch.
    pub initial_backoff: Duration,
    /// Retry delay ceiling.
    pub max_backoff: Duration,
}

impl Default for RotationTiming {
    fn default() -> Self {
        RotationTiming {
            initial_fetch_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(15),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
        }
    }
}

/// The rotating source implementation.
///
/// The cancellation token is the source's lifetime: `close` (or drop)
/// cancels it, which tears down the updater and the upstream connection it
/// holds.
#[derive(Debug)]
pub struct RotatingSource {
    trust_domain: TrustDomain,
    state: watch::Receiver<SourceState>,
    cancel: CancellationToken,
    closed: AtomicBool,
    updater: JoinHandle<()>,
}

impl RotatingSource {
    /// Start the updater and wait for the initial fetch.
    ///
    /// Fails with `Unavailable` when the deadline passes first; no
    /// background task is left running in that case.
    pub async fn connect(
        upstream: Arc<dyn SvidUpstream>,
        trust_domain: TrustDomain,
        timing: RotationTiming,
    ) -> Result<Self> {
        let (tx, rx) = watch::channel(SourceState::default());
        let cancel = CancellationToken::new();
        let updater = tokio::spawn(run_updater(upstream, tx, cancel.clone(), timing.clone()));

        let source = RotatingSource {
            trust_domain,
            state: rx,
            cancel,
            closed: AtomicBool::new(false),
            updater,
        };

        let mut rx = source.state.clone();
        let wait = tokio::time::timeout(timing.initial_fetch_timeout, async move {
            loop {
                {
                    let state = rx.borrow_and_update();
                    match &*state {
                        SourceState::Active(_) => return Ok(()),
                        SourceState::Closed => return Err(IdPlaneError::Closed),
                        SourceState::NotReady | SourceState::Failed(_) => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(IdPlaneError::unavailable("updater stopped before first fetch"));
                }
            }
        })
        .await;

        match wait {
            Ok(Ok(())) => {
                info!(trust_domain = %source.trust_domain, "SVID source active");
                Ok(source)
            }
            Ok(Err(e)) => {
                source.close();
                Err(e)
            }
            Err(_elapsed) => {
                source.close();
                Err(IdPlaneError::unavailable(format!(
                    "initial SVID fetch exceeded {:?}",
                    timing.initial_fetch_timeout
                )))
            }
        }
    }

    /// Current snapshot regardless of SVID freshness; `None` before the
    /// first successful fetch.
    pub fn snapshot(&self) -> Option<SvidSnapshot> {
        match &*self.state.borrow() {
            SourceState::Active(snapshot) => Some(snapshot.clone()),
            _ => None,
        }
    }
}

impl SvidSource for RotatingSource {
    fn current_svid(&self) -> Result<Arc<IdentityDocument>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IdPlaneError::Closed);
        }
        match &*self.state.borrow() {
            SourceState::NotReady => Err(IdPlaneError::unavailable("initial fetch not complete")),
            SourceState::Failed(message) => Err(IdPlaneError::unavailable(message.clone())),
            SourceState::Closed => Err(IdPlaneError::Closed),
            SourceState::Active(snapshot) => {
                if snapshot.svid.is_expired() {
                    Err(IdPlaneError::IdentityDocumentExpired {
                        not_after: snapshot.svid.not_after_utc(),
                    })
                } else {
                    Ok(snapshot.svid.clone())
                }
            }
        }
    }

    fn current_bundle(&self, trust_domain: &TrustDomain) -> Result<Arc<TrustBundle>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IdPlaneError::Closed);
        }
        match &*self.state.borrow() {
            SourceState::NotReady => Err(IdPlaneError::unavailable("initial fetch not complete")),
            SourceState::Failed(message) => Err(IdPlaneError::unavailable(message.clone())),
            SourceState::Closed => Err(IdPlaneError::Closed),
            SourceState::Active(snapshot) => {
                if trust_domain == &self.trust_domain {
                    Ok(snapshot.bundle.clone())
                } else {
                    Err(IdPlaneError::TrustBundleNotFound {
                        trust_domain: trust_domain.to_string(),
                    })
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

impl Drop for RotatingSource {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.updater.abort();
    }
}

async fn run_updater(
    upstream: Arc<dyn SvidUpstream>,
    tx: watch::Sender<SourceState>,
    cancel: CancellationToken,
    timing: RotationTiming,
) {
    let mut backoff = timing.initial_backoff;

    loop {
        if cancel.is_cancelled() {
            let _ = tx.send(SourceState::Closed);
            return;
        }

        let should_fetch = match &*tx.borrow() {
            SourceState::NotReady | SourceState::Failed(_) => true,
            SourceState::Active(snapshot) => SystemTime::now() >= snapshot.svid.refresh_at(),
            SourceState::Closed => return,
        };

        if should_fetch {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(SourceState::Closed);
                    return;
                }
                result = upstream.fetch() => result,
            };

            match fetched {
                Ok((svid, bundle)) => {
                    debug!(
                        identity = %svid.identity(),
                        serial = svid.serial_hex(),
                        "SVID refreshed"
                    );
                    let _ = tx.send(SourceState::Active(SvidSnapshot {
                        svid: Arc::new(svid),
                        bundle: Arc::new(bundle),
                    }));
                    backoff = timing.initial_backoff;
                    // Fall through to the idle wait: even an upstream that
                    // hands out already-stale documents is paced.
                }
                Err(e) => {
                    let still_valid = matches!(
                        &*tx.borrow(),
                        SourceState::Active(snapshot) if !snapshot.svid.is_expired()
                    );
                    if still_valid {
                        warn!(error = %e, retry_in = ?backoff, "SVID refresh failed, keeping last valid SVID");
                    } else {
                        warn!(error = %e, retry_in = ?backoff, "SVID fetch failed with no valid fallback");
                        let _ = tx.send(SourceState::Failed(e.to_string()));
                    }

                    let jitter = rand::thread_rng()
                        .gen_range(Duration::ZERO..=backoff.mul_f32(0.5).max(MIN_IDLE_WAIT));
                    let delay = backoff + jitter;
                    backoff = (backoff * 2).min(timing.max_backoff);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = tx.send(SourceState::Closed);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }
        }

        // Idle until the refresh point or the next periodic check,
        // whichever comes first.
        let delay = {
            match &*tx.borrow() {
                SourceState::Active(snapshot) => snapshot
                    .svid
                    .refresh_at()
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO)
                    .min(timing.check_interval)
                    .max(MIN_IDLE_WAIT),
                _ => MIN_IDLE_WAIT,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(SourceState::Closed);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
