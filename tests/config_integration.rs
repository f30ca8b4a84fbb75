//! Configuration loader acceptance and rejection matrix.

use std::io::Write;

use tempfile::NamedTempFile;

use idplane::config::{load_config_from_file, AppConfig};

fn write_yaml(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn full_config_loads_with_registrations() -> anyhow::Result<()> {
    let file = write_yaml(
        r#"
trust_domain: "example.org"
agent_spiffe_id: "spiffe://example.org/agent"
workload_socket: "unix:///run/idplane/agent.sock"
listen_addr: "127.0.0.1:8443"
allowed_client_spiffe_id: "spiffe://example.org/client"
allowed_client_trust_domain: ""
expected_server_trust_domain: "example.org"
initial_fetch_timeout_seconds: 10
tls_read_timeout_seconds: 15
registrations:
  - spiffe_id: "spiffe://example.org/server"
    selectors: ["unix:uid:1001"]
attestor_uids:
  - uid: 1001
    selectors: ["unix:uid:1001"]
"#,
    );

    let config = load_config_from_file(file.path())?;
    assert_eq!(config.registrations.len(), 1);
    assert_eq!(config.registrations[0].selectors, vec!["unix:uid:1001".to_string()]);
    assert_eq!(config.attestor_uids[0].uid, 1001);
    assert_eq!(config.initial_fetch_timeout().as_secs(), 10);
    assert_eq!(config.channel_timeouts().read.as_secs(), 15);

    let authorizer = config.server_authorizer()?;
    assert!(authorizer.authorize("spiffe://example.org/client").is_ok());
    assert!(authorizer.authorize("spiffe://example.org/else").is_err());
    Ok(())
}

#[test]
fn rejects_uri_without_spiffe_prefix() {
    let file = write_yaml(
        r#"
agent_spiffe_id: "example.org/agent"
"#,
    );
    let err = load_config_from_file(file.path()).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("spiffe://"));
}

#[test]
fn rejects_trust_domain_with_scheme() {
    let file = write_yaml(
        r#"
trust_domain: "spiffe://example.org"
"#,
    );
    assert!(load_config_from_file(file.path()).is_err());
}

#[test]
fn rejects_out_of_range_port() {
    let file = write_yaml(
        r#"
listen_addr: "0.0.0.0:99999"
"#,
    );
    assert!(load_config_from_file(file.path()).is_err());
}

#[test]
fn rejects_negative_timeout() {
    let file = write_yaml(
        r#"
tls_idle_timeout_seconds: -1
"#,
    );
    assert!(load_config_from_file(file.path()).is_err());
}

#[test]
fn rejects_conflicting_authorizer_modes() {
    let file = write_yaml(
        r#"
allowed_client_spiffe_id: "spiffe://idplane.local/a"
allowed_client_ids: ["spiffe://idplane.local/b", "spiffe://idplane.local/c"]
"#,
    );
    let err = load_config_from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("exactly one"));
}

#[test]
fn rejects_unknown_keys() {
    let file = write_yaml(
        r#"
trust_domain: "example.org"
shiny_new_option: 7
"#,
    );
    assert!(load_config_from_file(file.path()).is_err());
}

#[test]
fn environment_overrides_file() {
    // Process-global environment: pick an option no other test in this
    // binary asserts on, since tests run in parallel threads.
    std::env::set_var("IDPLANE_TLS_WRITE_TIMEOUT_SECONDS", "44");
    let file = write_yaml(
        r#"
trust_domain: "example.org"
agent_spiffe_id: "spiffe://example.org/agent"
allowed_client_trust_domain: "example.org"
expected_server_trust_domain: "example.org"
tls_write_timeout_seconds: 30
"#,
    );

    let config = load_config_from_file(file.path()).unwrap();
    assert_eq!(config.channel_timeouts().write.as_secs(), 44);
    std::env::remove_var("IDPLANE_TLS_WRITE_TIMEOUT_SECONDS");
}

#[test]
fn defaults_are_complete() {
    let config = AppConfig::default();
    config.validate().unwrap();
    assert!(config.server_authorizer().is_ok());
    assert!(config.client_authorizer().is_ok());
}
