//! SPIFFE-authorized mutual TLS.
//!
//! The pieces: a rotating SVID source fed by an upstream provider, an
//! authorizer deciding which peer URIs are acceptable, rustls verifiers
//! that bolt the authorizer onto standard chain validation, and config
//! builders plus peer-identity accessors for servers and clients.

pub mod authorizer;
pub mod provider;
pub mod source;
pub mod upstream;
pub mod verifier;

pub use authorizer::Authorizer;
pub use provider::{peer_identity, ChannelTimeouts, MtlsListener, MtlsProvider, PeerIdentity};
pub use source::{RotatingSource, RotationTiming, SvidSnapshot, SvidSource};
pub use upstream::{AgentUpstream, SvidUpstream, WorkloadApiClient};
