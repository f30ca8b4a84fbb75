//! # Structured Logging
//!
//! Tracing-subscriber initialization with env-filter control. Components
//! log with structured fields (`identity = %uri`, `trust_domain = %td`)
//! rather than formatted strings; rotation failures surface at `warn`.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Create a tracing span for one issuance request.
///
/// ```rust,ignore
/// let span = issuance_span!("fetch_identity_document", 1001);
/// ```
#[macro_export]
macro_rules! issuance_span {
    ($operation:expr, $uid:expr) => {
        tracing::info_span!(
            "issuance",
            operation = %$operation,
            uid = $uid,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $uid:expr, $($field:tt)*) => {
        tracing::info_span!(
            "issuance",
            operation = %$operation,
            uid = $uid,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for one mTLS channel connection.
#[macro_export]
macro_rules! channel_span {
    ($remote:expr) => {
        tracing::info_span!(
            "mtls_channel",
            remote = %$remote,
            connection_id = %uuid::Uuid::new_v4()
        )
    };
    ($remote:expr, $($field:tt)*) => {
        tracing::info_span!(
            "mtls_channel",
            remote = %$remote,
            connection_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Initialize the global subscriber. Idempotent so tests and the CLI can
/// both call it.
pub fn init_logging() {
    INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("idplane=info"));
        // A second subscriber in the same process is fine to refuse.
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Log the effective configuration at startup.
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        trust_domain = %config.trust_domain,
        agent = %config.agent_spiffe_id,
        listen_addr = %config.listen_addr,
        workload_socket = %config.workload_socket,
        registrations = config.registrations.len(),
        "identity plane configuration"
    );
}
