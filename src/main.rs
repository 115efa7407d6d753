//! Deskgate - Windows desktop gateway
//!
//! Accepts mutual TLS connections from the proxy and bridges them to Windows
//! desktops, logging users in with short-lived smartcard certificates.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{host_uuid_path, load_or_create_host_uuid, GatewayConfig};
use deskgate_cert::tls::{load_certificate_from_files, load_root_store, mtls_server_config};
use deskgate_cert::LocalAuthority;
use deskgate_directory::{HeartbeatError, OnHeartbeat, ResourceRegistry};
use deskgate_server::{
    ConnectionLimiter, HeartbeatConfig, TlsRelayClient, WindowsService, WindowsServiceConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How often expired directory entries are dropped
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Deskgate - Windows desktop gateway
#[derive(Parser, Debug)]
#[command(name = "deskgate")]
#[command(about = "Deskgate - Windows desktop access gateway")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway
    Serve {
        /// Path to the YAML config file
        #[arg(short, long, env = "DESKGATE_CONFIG")]
        config: PathBuf,

        /// Override the listen address from the config file
        #[arg(long, env = "DESKGATE_LISTEN_ADDR")]
        listen_addr: Option<String>,
    },

    /// Print an annotated config file
    Template,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Load TLS material and assemble the service config
async fn build_service_config(
    config: &GatewayConfig,
    config_path: &Path,
) -> Result<(WindowsServiceConfig, Arc<ResourceRegistry>)> {
    let cert = load_certificate_from_files(&config.tls.cert, &config.tls.key)
        .await
        .context("Failed to load listener certificate")?;
    let client_roots = load_root_store(&config.tls.client_ca)
        .await
        .context("Failed to load proxy client CA")?;
    let tls = mtls_server_config(cert, client_roots)?;

    let authority = LocalAuthority::load(&config.authority.cert, &config.authority.key)
        .await
        .context("Failed to load certificate authority")?;

    let desktop_roots = match &config.desktop_tls {
        Some(desktop_tls) => Some(
            load_root_store(&desktop_tls.ca)
                .await
                .context("Failed to load desktop CA bundle")?,
        ),
        None => {
            warn!("⚠️  No desktop_tls CA configured, desktop certificates will not be verified");
            None
        }
    };

    let host_uuid = match &config.heartbeat.host_uuid {
        Some(id) => id.clone(),
        None => {
            let path = host_uuid_path(config_path);
            let id = load_or_create_host_uuid(&path)?;
            info!("Host UUID {} (stored in {})", id, path.display());
            id
        }
    };

    let on_heartbeat: OnHeartbeat = Arc::new(|err: Option<&HeartbeatError>| {
        if let Some(e) = err {
            debug!("Heartbeat attempt failed: {}", e);
        }
    });

    let heartbeat = HeartbeatConfig {
        host_uuid,
        public_addr: config.heartbeat.public_addr.clone(),
        static_hosts: config.heartbeat.static_host_addrs()?,
        announce_ttl: config.heartbeat.announce_ttl(),
        check_period: config.heartbeat.check_period(),
        on_heartbeat: Some(on_heartbeat),
    };

    let registry = Arc::new(ResourceRegistry::default());
    let mut service_config =
        WindowsServiceConfig::new(config.ldap.to_ldap_config()?, heartbeat);
    service_config.tls = Some(tls);
    service_config.access_point = Some(registry.clone());
    service_config.announcer = Some(registry.clone());
    service_config.authority = Some(Arc::new(authority));
    service_config.conn_limiter = Some(Arc::new(ConnectionLimiter::new(
        config.max_connections_per_ip,
    )));
    let mut relay = TlsRelayClient::new(desktop_roots);
    if let Some(timeout) = config.desktop_connect_timeout() {
        relay = relay.with_connect_timeout(timeout);
    }
    service_config.rdp = Some(Arc::new(relay));
    if let Some(timeout) = config.handshake_timeout() {
        service_config.handshake_timeout = timeout;
    }
    service_config.cluster_name = config.cluster_name.clone();
    if let Some(suffix) = &config.sni_suffix {
        service_config.sni_suffix = suffix.clone();
    }

    Ok((service_config, registry))
}

/// Drop expired desktops and services until cancelled
async fn prune_registry(registry: Arc<ResourceRegistry>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let pruned = registry.prune_expired();
                if pruned > 0 {
                    debug!("Pruned {} expired directory entries", pruned);
                }
            }
        }
    }
}

/// Re-publish the CRL whenever the process receives SIGHUP
#[cfg(unix)]
async fn refresh_crl_on_hangup(service: Arc<WindowsService>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, re-publishing CRL");
        match service.update_crl().await {
            Ok(outcome) => info!("CRL re-published ({:?})", outcome),
            Err(e) => error!("Failed to re-publish CRL: {}", e),
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn refresh_crl_on_hangup(_service: Arc<WindowsService>) -> Result<()> {
    std::future::pending().await
}

async fn serve(config_path: PathBuf, listen_addr: Option<String>) -> Result<()> {
    info!("Deskgate starting...");
    info!("Loading configuration from: {}", config_path.display());

    let config = GatewayConfig::load(&config_path)?;
    let listen_addr = listen_addr.unwrap_or_else(|| config.listen_addr.clone());

    let (service_config, registry) = build_service_config(&config, &config_path).await?;

    info!("Cluster: {}", config.cluster_name);
    info!("Active Directory domain: {}", config.ldap.domain);
    if config.max_connections_per_ip > 0 {
        info!("Connection limit per IP: {}", config.max_connections_per_ip);
    }
    if config.ldap.insecure_skip_verify {
        warn!("⚠️  LDAP certificate verification disabled (insecure mode)");
    }

    let service = Arc::new(
        WindowsService::new(service_config)
            .await
            .context("Failed to start Windows desktop service")?,
    );

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let serving = service.clone();
    let serve_task = tokio::spawn(async move { serving.serve(listener).await });
    let hangup_task = tokio::spawn(refresh_crl_on_hangup(service.clone()));
    let prune_cancel = CancellationToken::new();
    tokio::spawn(prune_registry(registry, prune_cancel.clone()));

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = serve_task => {
            match result {
                Ok(Ok(())) => info!("Gateway stopped"),
                Ok(Err(e)) => {
                    error!("Gateway error: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Gateway task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    service.close();
    prune_cancel.cancel();
    hangup_task.abort();
    info!("Deskgate stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Template => {
            print!("{}", GatewayConfig::template());
            Ok(())
        }
        Commands::Serve {
            config,
            listen_addr,
        } => {
            setup_logging(cli.verbose);
            serve(config, listen_addr).await
        }
    }
}
