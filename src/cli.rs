//! # Command Line Interface
//!
//! Operator tooling for the identity plane: run the mTLS channel, issue a
//! debug SVID, print the trust bundle, verify a certificate against it.
//!
//! Exit codes: 0 success, 2 configuration error, 3 upstream unavailable,
//! 4 verification failure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{load_config, load_config_from_env, AppConfig};
use crate::domain::SpiffeId;
use crate::errors::{IdPlaneError, Result};
use crate::startup::{bootstrap, Core};
use crate::tls::{
    AgentUpstream, ChannelTimeouts, MtlsListener, MtlsProvider, PeerIdentity, RotatingSource,
    RotationTiming, SvidSource, SvidUpstream, WorkloadApiClient,
};
use crate::utils::certificates;

#[derive(Parser)]
#[command(name = "idplane")]
#[command(about = "Workload identity plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (YAML); environment overrides apply on top
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the mTLS server channel
    Serve {
        /// Issue the channel's SVID through the in-process authority
        /// instead of the upstream workload socket
        #[arg(long)]
        local: bool,
    },

    /// Issue a debug SVID for a SPIFFE URI through the agent's authority
    Issue {
        /// The identity to issue, e.g. spiffe://example.org/server
        spiffe_uri: String,
    },

    /// Print the PEM-encoded trust bundle
    ShowBundle,

    /// Validate a PEM certificate against the current trust bundle
    Verify {
        /// Path to a PEM file containing the leaf certificate
        pem_file: PathBuf,
    },
}

/// Run the CLI and return the process exit code.
pub async fn run_cli() -> i32 {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.verbose && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "idplane=debug");
    }
    crate::observability::init_logging();

    match run_command(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            e.exit_code()
        }
    }
}

async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config(Some(path))?,
        None => load_config_from_env()?,
    };
    crate::observability::logging::log_config_info(&config);

    match cli.command {
        Commands::Serve { local } => serve(&config, local).await,
        Commands::Issue { spiffe_uri } => issue(&config, &spiffe_uri),
        Commands::ShowBundle => show_bundle(&config),
        Commands::Verify { pem_file } => verify(&config, &pem_file),
    }
}

async fn serve(config: &AppConfig, local: bool) -> Result<()> {
    let core = bootstrap(config)?;
    let authorizer = config.server_authorizer()?;
    let cancel = CancellationToken::new();

    // In local mode the channel's own SVID comes from the in-process
    // authority and the workload socket is served rather than consumed.
    let upstream: Arc<dyn SvidUpstream> = if local {
        if let Some(path) = config.workload_socket.strip_prefix("unix://") {
            serve_workload_endpoint(path, &core, &cancel)?;
        }
        Arc::new(AgentUpstream::new(core.agent.clone(), core.ca.clone()))
    } else {
        Arc::new(WorkloadApiClient::from_url(&config.workload_socket)?)
    };

    let timing = RotationTiming {
        initial_fetch_timeout: config.initial_fetch_timeout(),
        ..RotationTiming::default()
    };
    let source = Arc::new(
        RotatingSource::connect(upstream, core.trust_domain.clone(), timing).await?,
    );

    let provider = Arc::new(MtlsProvider::new(
        source.clone() as Arc<dyn SvidSource>,
        core.trust_domain.clone(),
        authorizer,
    ));
    let listener =
        MtlsListener::bind(&config.listen_addr, provider, config.channel_timeouts()).await?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    info!(addr = %config.listen_addr, "serving mTLS channel");
    let timeouts = config.channel_timeouts();
    loop {
        match listener.accept(&cancel).await {
            Ok((stream, peer, remote)) => {
                let span = crate::channel_span!(remote, peer = %peer.uri);
                let _guard = span.enter();
                info!("peer connected");
                let timeouts = timeouts.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_channel_peer(stream, &peer, &timeouts).await {
                        warn!(peer = %peer.uri, error = %e, "peer session ended with error");
                    }
                });
            }
            Err(IdPlaneError::Cancelled) => break,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "transient accept failure");
            }
            Err(e) => {
                warn!(error = %e, "connection rejected");
            }
        }
    }

    source.close();
    info!("mTLS channel stopped");
    Ok(())
}

/// Serve one authenticated peer: read its request line, answer with the
/// verified identity, close. The read and write phases are bounded by the
/// configured channel timeouts; the whole session by the idle timeout.
/// (The handshake itself runs under the read-header budget inside the
/// listener.)
async fn handle_channel_peer<S>(
    mut stream: S,
    peer: &PeerIdentity,
    timeouts: &ChannelTimeouts,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = async {
        let mut line = String::new();
        {
            let mut reader = BufReader::new(&mut stream);
            match tokio::time::timeout(timeouts.read, reader.read_line(&mut line)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(IdPlaneError::io(e, "reading peer request")),
                Err(_) => return Err(IdPlaneError::transport("peer request read timed out")),
            }
        }

        let ack = format!("{}\n", peer.uri);
        match tokio::time::timeout(timeouts.write, stream.write_all(ack.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(IdPlaneError::io(e, "acknowledging peer")),
            Err(_) => return Err(IdPlaneError::transport("acknowledgement write timed out")),
        }

        let _ = stream.shutdown().await;
        Ok(())
    };

    match tokio::time::timeout(timeouts.idle, session).await {
        Ok(result) => result,
        Err(_) => Err(IdPlaneError::transport("peer session exceeded the idle timeout")),
    }
}

#[cfg(unix)]
fn serve_workload_endpoint(path: &str, core: &Core, cancel: &CancellationToken) -> Result<()> {
    let endpoint = crate::agent::WorkloadEndpoint::bind(
        std::path::Path::new(path),
        core.agent.clone(),
        core.ca.clone(),
    )?;
    let endpoint_cancel = cancel.child_token();
    tokio::spawn(async move {
        let _ = endpoint.serve(&endpoint_cancel).await;
    });
    Ok(())
}

#[cfg(not(unix))]
fn serve_workload_endpoint(_path: &str, _core: &Core, _cancel: &CancellationToken) -> Result<()> {
    warn!("workload endpoint requires kernel peer credentials; not started on this platform");
    Ok(())
}

fn issue(config: &AppConfig, spiffe_uri: &str) -> Result<()> {
    let core = bootstrap(config)?;
    let identity = SpiffeId::parse(spiffe_uri)?;
    let document = core.ca.issue(&identity)?;

    print!("{}", certificates::der_to_pem(document.leaf().as_ref()));
    let key = document.private_key();
    print!("{}", certificates::key_to_pem(key.secret_der()).as_str());
    info!(
        identity = %identity,
        serial = document.serial_hex(),
        not_after = %document.not_after_utc(),
        "debug SVID issued"
    );
    Ok(())
}

fn show_bundle(config: &AppConfig) -> Result<()> {
    let core = bootstrap(config)?;
    print!("{}", core.ca.trust_bundle()?.to_pem());
    Ok(())
}

fn verify(config: &AppConfig, pem_file: &PathBuf) -> Result<()> {
    let core = bootstrap(config)?;
    let pem = std::fs::read(pem_file)
        .map_err(|e| IdPlaneError::io(e, format!("reading {}", pem_file.display())))?;
    verify_against_core(&core, &pem)
}

fn verify_against_core(core: &Core, pem: &[u8]) -> Result<()> {
    let certs = certificates::certs_from_pem(pem)?;
    let leaf = &certs[0];

    let info = certificates::leaf_info(leaf.as_ref())?;
    let now = std::time::SystemTime::now();
    if now < info.not_before {
        return Err(IdPlaneError::chain("certificate is not yet valid"));
    }
    if now > info.not_after {
        return Err(IdPlaneError::IdentityDocumentExpired {
            not_after: chrono::DateTime::from(info.not_after),
        });
    }

    let bundle = core.ca.trust_bundle()?;
    let verified = bundle
        .authorities()
        .iter()
        .any(|authority| {
            certificates::verify_signed_by(leaf.as_ref(), authority.as_ref()).is_ok()
        });
    if !verified {
        return Err(IdPlaneError::chain(
            "certificate is not signed by any bundle authority",
        ));
    }

    println!("OK: subject={} uris={:?}", info.subject, info.uris);
    Ok(())
}
