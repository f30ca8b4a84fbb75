//! # Configuration Settings
//!
//! The recognized options of the identity plane, their defaults, and
//! their validation rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::{SpiffeId, TrustDomain};
use crate::errors::{IdPlaneError, Result};
use crate::tls::{Authorizer, ChannelTimeouts};

/// A seeded registration: the identity a workload with these selectors is
/// entitled to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrationEntry {
    pub spiffe_id: String,
    pub selectors: Vec<String>,
}

/// A reference-attestor table row: the selectors emitted for a UID.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UidSelectors {
    pub uid: u32,
    pub selectors: Vec<String>,
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Canonical DNS name of the local trust domain.
    #[validate(length(min = 1, message = "trust_domain cannot be blank"))]
    pub trust_domain: String,

    /// SPIFFE URI of the issuance agent itself.
    #[validate(length(min = 1, message = "agent_spiffe_id cannot be blank"))]
    pub agent_spiffe_id: String,

    /// URL of the upstream identity provider (`unix://` or `tcp://`).
    #[validate(length(min = 1, message = "workload_socket cannot be blank"))]
    pub workload_socket: String,

    /// Deadline for the rotating source's first fetch.
    #[validate(range(min = 1, max = 600, message = "initial_fetch_timeout_seconds must be 1..=600"))]
    #[serde(default = "defaults::initial_fetch_timeout")]
    pub initial_fetch_timeout_seconds: i64,

    /// `host:port` for the server channel.
    #[validate(length(min = 1, message = "listen_addr cannot be blank"))]
    pub listen_addr: String,

    /// Server-side authorizer: accept exactly this client identity.
    #[serde(default)]
    pub allowed_client_spiffe_id: Option<String>,

    /// Server-side authorizer: accept any client in this trust domain.
    #[serde(default)]
    pub allowed_client_trust_domain: Option<String>,

    /// Server-side authorizer: accept any of these client identities
    /// (two or more).
    #[serde(default)]
    pub allowed_client_ids: Vec<String>,

    /// Client-side authorizer: expect exactly this server identity.
    #[serde(default)]
    pub expected_server_spiffe_id: Option<String>,

    /// Client-side authorizer: expect a server in this trust domain.
    #[serde(default)]
    pub expected_server_trust_domain: Option<String>,

    #[validate(range(min = 1, max = 3600, message = "tls_read_header_timeout_seconds must be 1..=3600"))]
    #[serde(default = "defaults::read_header_timeout")]
    pub tls_read_header_timeout_seconds: i64,

    #[validate(range(min = 1, max = 3600, message = "tls_read_timeout_seconds must be 1..=3600"))]
    #[serde(default = "defaults::read_timeout")]
    pub tls_read_timeout_seconds: i64,

    #[validate(range(min = 1, max = 3600, message = "tls_write_timeout_seconds must be 1..=3600"))]
    #[serde(default = "defaults::write_timeout")]
    pub tls_write_timeout_seconds: i64,

    #[validate(range(min = 1, max = 86400, message = "tls_idle_timeout_seconds must be 1..=86400"))]
    #[serde(default = "defaults::idle_timeout")]
    pub tls_idle_timeout_seconds: i64,

    /// Workload registrations seeded into the registry before seal.
    #[serde(default)]
    pub registrations: Vec<RegistrationEntry>,

    /// Reference-attestor table (`uid -> selectors`).
    #[serde(default)]
    pub attestor_uids: Vec<UidSelectors>,
}

mod defaults {
    pub fn initial_fetch_timeout() -> i64 {
        30
    }
    pub fn read_header_timeout() -> i64 {
        5
    }
    pub fn read_timeout() -> i64 {
        30
    }
    pub fn write_timeout() -> i64 {
        30
    }
    pub fn idle_timeout() -> i64 {
        120
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            trust_domain: "idplane.local".to_string(),
            agent_spiffe_id: "spiffe://idplane.local/agent".to_string(),
            workload_socket: "unix:///run/idplane/agent.sock".to_string(),
            initial_fetch_timeout_seconds: defaults::initial_fetch_timeout(),
            listen_addr: "127.0.0.1:8443".to_string(),
            allowed_client_spiffe_id: None,
            allowed_client_trust_domain: Some("idplane.local".to_string()),
            allowed_client_ids: Vec::new(),
            expected_server_spiffe_id: None,
            expected_server_trust_domain: Some("idplane.local".to_string()),
            tls_read_header_timeout_seconds: defaults::read_header_timeout(),
            tls_read_timeout_seconds: defaults::read_timeout(),
            tls_write_timeout_seconds: defaults::write_timeout(),
            tls_idle_timeout_seconds: defaults::idle_timeout(),
            registrations: Vec::new(),
            attestor_uids: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(IdPlaneError::from)?;
        self.validate_custom()
    }

    /// Cross-field rules beyond what the validator derive covers.
    fn validate_custom(&self) -> Result<()> {
        TrustDomain::parse(&self.trust_domain).map_err(|e| {
            IdPlaneError::config(format!("trust_domain: {}", e))
        })?;

        require_spiffe_uri("agent_spiffe_id", &self.agent_spiffe_id)?;

        if !self.workload_socket.starts_with("unix://")
            && !self.workload_socket.starts_with("tcp://")
        {
            return Err(IdPlaneError::config(
                "workload_socket must be a unix:// or tcp:// URL",
            ));
        }

        validate_listen_addr(&self.listen_addr)?;

        // Exactly one server-side client policy. An empty string counts as
        // unset so a file or environment layer can clear a defaulted
        // option (layered sources cannot delete keys).
        let client_policies = [
            set(&self.allowed_client_spiffe_id).is_some(),
            set(&self.allowed_client_trust_domain).is_some(),
            !self.allowed_client_ids.is_empty(),
        ]
        .iter()
        .filter(|on| **on)
        .count();
        if client_policies != 1 {
            return Err(IdPlaneError::config(
                "exactly one of allowed_client_spiffe_id, allowed_client_trust_domain, \
                 allowed_client_ids must be set",
            ));
        }

        // Exactly one client-side server policy.
        let server_policies = [
            set(&self.expected_server_spiffe_id).is_some(),
            set(&self.expected_server_trust_domain).is_some(),
        ]
        .iter()
        .filter(|on| **on)
        .count();
        if server_policies != 1 {
            return Err(IdPlaneError::config(
                "exactly one of expected_server_spiffe_id, expected_server_trust_domain must \
                 be set",
            ));
        }

        if let Some(id) = set(&self.allowed_client_spiffe_id) {
            require_spiffe_uri("allowed_client_spiffe_id", id)?;
        }
        if let Some(id) = set(&self.expected_server_spiffe_id) {
            require_spiffe_uri("expected_server_spiffe_id", id)?;
        }
        for id in &self.allowed_client_ids {
            require_spiffe_uri("allowed_client_ids", id)?;
        }
        if let Some(td) = set(&self.allowed_client_trust_domain) {
            TrustDomain::parse(td).map_err(|e| {
                IdPlaneError::config(format!("allowed_client_trust_domain: {}", e))
            })?;
        }
        if let Some(td) = set(&self.expected_server_trust_domain) {
            TrustDomain::parse(td).map_err(|e| {
                IdPlaneError::config(format!("expected_server_trust_domain: {}", e))
            })?;
        }

        for entry in &self.registrations {
            require_spiffe_uri("registrations.spiffe_id", &entry.spiffe_id)?;
            if entry.selectors.is_empty() {
                return Err(IdPlaneError::config(format!(
                    "registration '{}' has no selectors",
                    entry.spiffe_id
                )));
            }
        }

        Ok(())
    }

    /// The server-side authorizer described by the `allowed_client_*`
    /// options.
    pub fn server_authorizer(&self) -> Result<Authorizer> {
        if let Some(id) = set(&self.allowed_client_spiffe_id) {
            return Ok(Authorizer::specific_id(SpiffeId::parse(id)?));
        }
        if let Some(td) = set(&self.allowed_client_trust_domain) {
            return Ok(Authorizer::trust_domain(TrustDomain::parse(td)?));
        }
        if !self.allowed_client_ids.is_empty() {
            let ids = self
                .allowed_client_ids
                .iter()
                .map(|id| SpiffeId::parse(id))
                .collect::<Result<Vec<_>>>()?;
            return Authorizer::one_of(ids);
        }
        Err(IdPlaneError::config("no client authorizer policy configured"))
    }

    /// The client-side authorizer described by the `expected_server_*`
    /// options.
    pub fn client_authorizer(&self) -> Result<Authorizer> {
        if let Some(id) = set(&self.expected_server_spiffe_id) {
            return Ok(Authorizer::specific_id(SpiffeId::parse(id)?));
        }
        if let Some(td) = set(&self.expected_server_trust_domain) {
            return Ok(Authorizer::trust_domain(TrustDomain::parse(td)?));
        }
        Err(IdPlaneError::config("no server authorizer policy configured"))
    }

    pub fn initial_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_fetch_timeout_seconds.max(0) as u64)
    }

    pub fn channel_timeouts(&self) -> ChannelTimeouts {
        ChannelTimeouts {
            read_header: Duration::from_secs(self.tls_read_header_timeout_seconds.max(0) as u64),
            read: Duration::from_secs(self.tls_read_timeout_seconds.max(0) as u64),
            write: Duration::from_secs(self.tls_write_timeout_seconds.max(0) as u64),
            idle: Duration::from_secs(self.tls_idle_timeout_seconds.max(0) as u64),
        }
    }
}

/// Treat an empty string as an unset option.
fn set(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|v| !v.trim().is_empty())
}

fn require_spiffe_uri(option: &str, value: &str) -> Result<()> {
    if !value.starts_with("spiffe://") {
        return Err(IdPlaneError::config(format!(
            "{}: '{}' is missing the spiffe:// prefix",
            option, value
        )));
    }
    SpiffeId::parse(value)
        .map(|_| ())
        .map_err(|e| IdPlaneError::config(format!("{}: {}", option, e)))
}

fn validate_listen_addr(addr: &str) -> Result<()> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        IdPlaneError::config(format!("listen_addr '{}' must be host:port", addr))
    })?;
    if host.is_empty() {
        return Err(IdPlaneError::config(format!("listen_addr '{}' has no host", addr)));
    }
    let port: u32 = port
        .parse()
        .map_err(|_| IdPlaneError::config(format!("listen_addr '{}' has a bad port", addr)))?;
    if port == 0 || port > 65535 {
        return Err(IdPlaneError::config(format!(
            "listen_addr port must be in 1..=65535, got {}",
            port
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn blank_required_fields_rejected() {
        let mut config = AppConfig::default();
        config.trust_domain = String::new();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.listen_addr = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn spiffe_ids_need_the_prefix() {
        let mut config = AppConfig::default();
        config.agent_spiffe_id = "idplane.local/agent".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("spiffe://"));
    }

    #[test]
    fn trust_domain_with_scheme_rejected() {
        let mut config = AppConfig::default();
        config.trust_domain = "spiffe://idplane.local".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_ports_rejected() {
        for addr in ["127.0.0.1:0", "127.0.0.1:70000", "127.0.0.1:x", "127.0.0.1", ":1000"] {
            let mut config = AppConfig::default();
            config.listen_addr = addr.to_string();
            assert!(config.validate().is_err(), "{} should be rejected", addr);
        }
    }

    #[test]
    fn negative_durations_rejected() {
        let mut config = AppConfig::default();
        config.initial_fetch_timeout_seconds = -5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tls_read_timeout_seconds = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn conflicting_client_policies_rejected() {
        let mut config = AppConfig::default();
        config.allowed_client_spiffe_id = Some("spiffe://idplane.local/client".to_string());
        // allowed_client_trust_domain already set by default
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn missing_client_policy_rejected() {
        let mut config = AppConfig::default();
        config.allowed_client_trust_domain = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_socket_scheme_rejected() {
        let mut config = AppConfig::default();
        config.workload_socket = "http://127.0.0.1:1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn registrations_need_selectors() {
        let mut config = AppConfig::default();
        config.registrations = vec![RegistrationEntry {
            spiffe_id: "spiffe://idplane.local/server".to_string(),
            selectors: Vec::new(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn authorizer_construction_from_options() {
        let mut config = AppConfig::default();
        config.allowed_client_trust_domain = None;
        config.allowed_client_ids = vec![
            "spiffe://idplane.local/a".to_string(),
            "spiffe://idplane.local/b".to_string(),
        ];
        config.validate().unwrap();
        let authorizer = config.server_authorizer().unwrap();
        assert!(authorizer.authorize("spiffe://idplane.local/a").is_ok());
        assert!(authorizer.authorize("spiffe://idplane.local/c").is_err());
    }

    #[test]
    fn one_of_with_single_id_fails_at_construction() {
        let mut config = AppConfig::default();
        config.allowed_client_trust_domain = None;
        config.allowed_client_ids = vec!["spiffe://idplane.local/a".to_string()];
        config.validate().unwrap();
        assert!(config.server_authorizer().is_err());
    }

    #[test]
    fn timeouts_materialize_as_durations() {
        let config = AppConfig::default();
        let timeouts = config.channel_timeouts();
        assert_eq!(timeouts.read_header, Duration::from_secs(5));
        assert_eq!(timeouts.idle, Duration::from_secs(120));
        assert_eq!(config.initial_fetch_timeout(), Duration::from_secs(30));
    }
}
