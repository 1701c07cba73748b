//! Packlog - Distributed Commit Log
//!
//! Node binary: starts an agent from a TOML configuration, and ships
//! small operator commands for config management and cluster
//! inspection.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use packlog::agent::{Agent, AgentConfig};
use packlog::config::PacklogConfig;
use packlog::error::{Error, Result};
use packlog::server::LogClient;

/// Packlog - Distributed Commit Log
#[derive(Parser)]
#[command(name = "packlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "packlog.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a packlog node
    Start,

    /// Validate the configuration file
    Validate,

    /// Write a starter configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "packlog.toml")]
        output: PathBuf,

        /// Node name
        #[arg(long, default_value = "node-1")]
        node_name: String,
    },

    /// List the cluster's servers via a node's RPC address
    Servers {
        /// Node RPC address to query
        #[arg(short, long, default_value = "127.0.0.1:8400")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Validate => run_validate(cli.config),
        Commands::Init { output, node_name } => run_init(output, node_name),
        Commands::Servers { addr } => run_servers(addr).await,
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start a node and run until interrupted
async fn run_start(config_path: PathBuf) -> Result<()> {
    let config = match PacklogConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!(node = %config.node.name, "starting packlog node");

    std::fs::create_dir_all(&config.node.data_dir)?;

    let (server_tls, peer_tls) = load_tls(&config)?;
    let agent = Agent::new(AgentConfig {
        node_name: config.node.name.clone(),
        bind_addr: config.node.bind_addr.clone(),
        rpc_port: config.node.rpc_port,
        data_dir: config.node.data_dir.clone(),
        bootstrap: config.node.bootstrap,
        start_join_addrs: config.node.start_join_addrs.clone(),
        segment: config.segment,
        consensus: config.consensus.clone(),
        acl_model_file: config.acl.model_file.clone(),
        acl_policy_file: config.acl.policy_file.clone(),
        server_tls,
        peer_tls,
    })
    .await?;

    tracing::info!(rpc_addr = %agent.rpc_addr(), "node ready");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("signal handler failed: {}", e)))?;
    tracing::info!("interrupt received, shutting down");
    agent.shutdown().await
}

/// Validate a configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    let config = PacklogConfig::from_file(&config_path)?;
    println!("configuration valid for node '{}'", config.node.name);
    Ok(())
}

/// Write a starter configuration
fn run_init(output: PathBuf, node_name: String) -> Result<()> {
    let template = format!(
        r#"[node]
name = "{node_name}"
bind_addr = "0.0.0.0:8401"
rpc_port = 8400
data_dir = "/var/lib/packlog"
bootstrap = true
start_join_addrs = []

[segment]
max_store_bytes = 1073741824
max_index_bytes = 1048576

[consensus]
heartbeat_interval_ms = 150
election_timeout_min_ms = 1000
election_timeout_max_ms = 1500

[logging]
level = "info"
"#
    );

    std::fs::write(&output, template)?;
    println!("wrote configuration to {}", output.display());
    Ok(())
}

/// Query a node for the cluster's servers
async fn run_servers(addr: String) -> Result<()> {
    let mut client = LogClient::connect(&addr, None).await?;
    let servers = client.get_servers().await?;

    for server in servers {
        let marker = if server.is_leader { " (leader)" } else { "" };
        println!("{}\t{}{}", server.id, server.rpc_addr, marker);
    }
    Ok(())
}

/// Build rustls configs from the configured PEM paths
fn load_tls(
    config: &PacklogConfig,
) -> Result<(
    Option<Arc<tokio_rustls::rustls::ServerConfig>>,
    Option<Arc<tokio_rustls::rustls::ClientConfig>>,
)> {
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

    let tls = &config.tls;

    let server_tls = match (&tls.server_cert_file, &tls.server_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let certs: Vec<CertificateDer> =
                rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
                    cert_path,
                )?))
                .collect::<std::io::Result<_>>()?;
            let key: PrivateKeyDer = rustls_pemfile::private_key(&mut std::io::BufReader::new(
                std::fs::File::open(key_path)?,
            ))?
            .ok_or_else(|| Error::Config(format!("no private key in {}", key_path.display())))?;

            let builder = ServerConfig::builder();
            let server_config = match &tls.server_ca_file {
                Some(ca_path) => {
                    let mut roots = RootCertStore::empty();
                    for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(
                        std::fs::File::open(ca_path)?,
                    )) {
                        roots
                            .add(cert?)
                            .map_err(|e| Error::Config(format!("bad CA certificate: {}", e)))?;
                    }
                    let verifier = tokio_rustls::rustls::server::WebPkiClientVerifier::builder(
                        Arc::new(roots),
                    )
                    .build()
                    .map_err(|e| Error::Config(format!("client verifier: {}", e)))?;
                    builder
                        .with_client_cert_verifier(verifier)
                        .with_single_cert(certs, key)
                }
                None => builder.with_no_client_auth().with_single_cert(certs, key),
            }
            .map_err(|e| Error::Config(format!("server TLS: {}", e)))?;
            Some(Arc::new(server_config))
        }
        _ => None,
    };

    let peer_tls = match &tls.peer_ca_file {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
                ca_path,
            )?)) {
                roots
                    .add(cert?)
                    .map_err(|e| Error::Config(format!("bad CA certificate: {}", e)))?;
            }

            let builder = ClientConfig::builder().with_root_certificates(roots);
            let client_config = match (&tls.peer_cert_file, &tls.peer_key_file) {
                (Some(cert_path), Some(key_path)) => {
                    let certs: Vec<CertificateDer> = rustls_pemfile::certs(
                        &mut std::io::BufReader::new(std::fs::File::open(cert_path)?),
                    )
                    .collect::<std::io::Result<_>>()?;
                    let key: PrivateKeyDer = rustls_pemfile::private_key(
                        &mut std::io::BufReader::new(std::fs::File::open(key_path)?),
                    )?
                    .ok_or_else(|| {
                        Error::Config(format!("no private key in {}", key_path.display()))
                    })?;
                    builder
                        .with_client_auth_cert(certs, key)
                        .map_err(|e| Error::Config(format!("peer TLS: {}", e)))?
                }
                _ => builder.with_no_client_auth(),
            };
            Some(Arc::new(client_config))
        }
        None => None,
    };

    Ok((server_tls, peer_tls))
}
