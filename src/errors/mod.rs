//! # Error Handling
//!
//! This module provides the error taxonomy for the idplane identity plane.
//! It defines custom error types using `thiserror` for all operations.

use chrono::{DateTime, Utc};

/// Custom result type for idplane operations
pub type Result<T> = std::result::Result<T, IdPlaneError>;

/// Main error type for the idplane identity plane.
///
/// Validation errors (`Invalid*`) are fatal to the operation that raised
/// them and are never retried internally. Operational errors (fetch
/// failures, transient socket errors) are retried only inside the rotating
/// SVID source; everywhere else they surface to the caller.
#[derive(thiserror::Error, Debug)]
pub enum IdPlaneError {
    /// Trust-domain parsing failures
    #[error("Invalid trust domain '{input}': {reason}")]
    InvalidTrustDomain { input: String, reason: String },

    /// SPIFFE URI parsing failures
    #[error("Invalid identity credential '{input}': {reason}")]
    InvalidIdentityCredential { input: String, reason: String },

    /// Selector parsing failures and empty selector sets
    #[error("Invalid selectors: {message}")]
    InvalidSelectors { message: String },

    /// Process identity with negative numeric fields
    #[error("Invalid process identity: {message}")]
    InvalidProcessIdentity { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    InvalidConfig {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Mutation attempted on a sealed registry
    #[error("Registry is sealed")]
    RegistrySealed,

    /// Listing an empty registry (distinct from an empty successful result)
    #[error("Registry is empty")]
    RegistryEmpty,

    /// No seeded mapper is satisfied by the presented selector set
    #[error("No matching mapper for selectors [{selectors}]")]
    NoMatchingMapper { selectors: String },

    /// Attestor could not map the process to selectors
    #[error("Workload attestation failed: {message}")]
    WorkloadAttestationFailed { message: String },

    /// Attestation succeeded but produced no selectors
    #[error("No attestation data for workload")]
    NoAttestationData,

    /// Document construction or issuance failures
    #[error("Identity document invalid: {message}")]
    IdentityDocumentInvalid {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Document past its validity window
    #[error("Identity document expired at {not_after}")]
    IdentityDocumentExpired { not_after: DateTime<Utc> },

    /// Document identity does not match the expected identity
    #[error("Identity document mismatch: expected '{expected}', got '{actual}'")]
    IdentityDocumentMismatch { expected: String, actual: String },

    /// Peer chain failed validation against the trust bundle
    #[error("Certificate chain invalid: {message}")]
    CertificateChainInvalid { message: String },

    /// No trust bundle is held for the requested trust domain
    #[error("No trust bundle for trust domain '{trust_domain}'")]
    TrustBundleNotFound { trust_domain: String },

    /// The certificate authority has no usable signer state
    #[error("Certificate authority is not initialized")]
    CaNotInitialized,

    /// Agent-side operational failure
    #[error("Agent unavailable: {message}")]
    AgentUnavailable { message: String },

    /// Server-side (issuing) operational failure
    #[error("Server unavailable: {message}")]
    ServerUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Peer presented no SPIFFE URI or failed the authorizer policy
    #[error("Unauthenticated peer: {message}")]
    Unauthenticated { message: String },

    /// The SVID source has no usable material (initial fetch pending/failed)
    #[error("Identity source unavailable: {message}")]
    Unavailable { message: String },

    /// The SVID source has been closed; all operations refused
    #[error("Identity source is closed")]
    Closed,

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Network transport errors surfaced to the caller (never retried here)
    #[error("Transport error: {0}")]
    Transport(String),
}

impl IdPlaneError {
    /// Create a trust-domain parse error
    pub fn invalid_trust_domain<I: Into<String>, R: Into<String>>(input: I, reason: R) -> Self {
        Self::InvalidTrustDomain { input: input.into(), reason: reason.into() }
    }

    /// Create a SPIFFE URI parse error
    pub fn invalid_identity<I: Into<String>, R: Into<String>>(input: I, reason: R) -> Self {
        Self::InvalidIdentityCredential { input: input.into(), reason: reason.into() }
    }

    /// Create a selector error
    pub fn invalid_selectors<S: Into<String>>(message: S) -> Self {
        Self::InvalidSelectors { message: message.into() }
    }

    /// Create a process-identity error
    pub fn invalid_process_identity<S: Into<String>>(message: S) -> Self {
        Self::InvalidProcessIdentity { message: message.into() }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::InvalidConfig { message: message.into(), source: Some(source) }
    }

    /// Create a document error
    pub fn document<S: Into<String>>(message: S) -> Self {
        Self::IdentityDocumentInvalid { message: message.into(), source: None }
    }

    /// Create a document error with source
    pub fn document_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::IdentityDocumentInvalid { message: message.into(), source: Some(source) }
    }

    /// Create an attestation failure
    pub fn attestation<S: Into<String>>(message: S) -> Self {
        Self::WorkloadAttestationFailed { message: message.into() }
    }

    /// Create a chain-validation error
    pub fn chain<S: Into<String>>(message: S) -> Self {
        Self::CertificateChainInvalid { message: message.into() }
    }

    /// Create an unauthenticated-peer error
    pub fn unauthenticated<S: Into<String>>(message: S) -> Self {
        Self::Unauthenticated { message: message.into() }
    }

    /// Create a source-unavailable error
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Create an agent operational error
    pub fn agent_unavailable<S: Into<String>>(message: S) -> Self {
        Self::AgentUnavailable { message: message.into() }
    }

    /// Create a server operational error
    pub fn server_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ServerUnavailable { message: message.into(), source: None }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Whether the rotating source may retry this error internally.
    ///
    /// Validation and policy errors are never retried; only operational
    /// failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdPlaneError::Io { .. }
                | IdPlaneError::Transport(_)
                | IdPlaneError::AgentUnavailable { .. }
                | IdPlaneError::ServerUnavailable { .. }
                | IdPlaneError::Unavailable { .. }
        )
    }

    /// Process exit code for the CLI surface.
    ///
    /// 0 success, 2 configuration error, 3 upstream unavailable,
    /// 4 verification failure, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            IdPlaneError::InvalidConfig { .. }
            | IdPlaneError::InvalidTrustDomain { .. }
            | IdPlaneError::InvalidIdentityCredential { .. }
            | IdPlaneError::InvalidSelectors { .. } => 2,
            IdPlaneError::Unavailable { .. }
            | IdPlaneError::AgentUnavailable { .. }
            | IdPlaneError::ServerUnavailable { .. }
            | IdPlaneError::Transport(_)
            | IdPlaneError::Io { .. }
            | IdPlaneError::Closed => 3,
            IdPlaneError::Unauthenticated { .. }
            | IdPlaneError::CertificateChainInvalid { .. }
            | IdPlaneError::IdentityDocumentExpired { .. }
            | IdPlaneError::IdentityDocumentInvalid { .. }
            | IdPlaneError::IdentityDocumentMismatch { .. } => 4,
            _ => 1,
        }
    }
}

// Error conversions for common external error types
impl From<std::io::Error> for IdPlaneError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<config::ConfigError> for IdPlaneError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for IdPlaneError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::config(format!("Validation failed: {}", message))
    }
}

impl From<rustls::Error> for IdPlaneError {
    fn from(error: rustls::Error) -> Self {
        Self::chain(error.to_string())
    }
}

impl From<serde_json::Error> for IdPlaneError {
    fn from(error: serde_json::Error) -> Self {
        Self::transport(format!("Malformed upstream payload: {}", error))
    }
}
