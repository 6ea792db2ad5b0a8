use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn, Instrument};

use pglb::config::{ProxyConfig, DEFAULT_PROBE_CREDENTIALS};
use pglb::oracle::OracleHandle;
use pglb::registry::RegistryHandle;
use pglb::{logging, monitor, oracle, proxy, registry};

/// Role-aware load-balancing proxy for PostgreSQL clusters.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// listen for incoming client connections on ip:port
    #[clap(long, default_value = "127.0.0.1:7432")]
    listen: String,

    /// backend server DSN, e.g. "host=10.0.0.1 port=5432"; repeat the flag
    /// for each backend
    #[clap(long = "backend", required = true)]
    backends: Vec<String>,

    /// interval between two health probes of the same backend
    #[clap(long, default_value = "5s", value_parser = humantime::parse_duration)]
    probe_interval: Duration,

    /// libpq keyword/value pairs prepended to a backend DSN when probing it
    #[clap(long, default_value = DEFAULT_PROBE_CREDENTIALS)]
    probe_credentials: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logging = logging::init()?;
    let args = Args::parse();

    let config: &'static ProxyConfig = Box::leak(Box::new(ProxyConfig {
        listen: args.listen,
        backends: args.backends,
        probe_interval: args.probe_interval,
        probe_credentials: args.probe_credentials,
    }));

    let oracle = oracle::spawn();
    let registry = registry::spawn();

    for backend in &config.backends {
        tokio::spawn(monitor::monitor_backend(
            backend.clone(),
            config.probe_dsn(backend),
            config.probe_interval,
            oracle.clone(),
        ));
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(addr = %config.listen, backends = config.backends.len(), "accepting client connections");

    tokio::select! {
        result = accept_loop(listener, oracle, registry) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            Ok(())
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    oracle: OracleHandle,
    registry: RegistryHandle,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer_addr) = listener.accept().await.context("accept failed")?;
        if let Err(err) = socket.set_nodelay(true) {
            warn!(%peer_addr, %err, "could not set TCP_NODELAY");
        }

        let session_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("client", %session_id, %peer_addr);
        let (oracle, registry) = (oracle.clone(), registry.clone());
        tokio::spawn(
            async move {
                info!("accepted connection");
                if let Err(err) = proxy::handle_client(&oracle, &registry, socket).await {
                    warn!("session ended with error: {err:#}");
                }
            }
            .instrument(span),
        );
    }
}
