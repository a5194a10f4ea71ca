//! # Loopback: a reverse shell that heals itself
//!
//! Runs a rendezvous server and a dial-home host in one process over the
//! in-process transport, then cuts the tunnel a few times to show the
//! supervisor rebuilding it.
//!
//! Demonstrates:
//! - Dial home, remote bind, `rs-info` announcement
//! - Registry tracking on the rendezvous side
//! - Liveness probing and reconnection after an outage
//!
//! `--server-config` and `--client-config` take the same TOML files as a
//! deployed rendezvous host and reverse peer. Their ports, password, retry
//! and monitor settings apply; the generated client key is always
//! authorized and the client's key path is ignored.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rssh_client::{
    ClientConfig, ConfigOverrides, ConnectionHandler, MonitorPolicy, ReversePipeline, Supervisor,
    SupervisorState, SupervisorStatus,
};
use rssh_core::keys::generate_ed25519;
use rssh_core::memory::{MemoryConnection, MemoryNetwork};
use rssh_core::Credentials;
use rssh_server::{PeerRegistry, RendezvousServer, ServerConfig};
use ssh_key::PrivateKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const HOME_HOST: &str = "rendezvous";
const DEFAULT_INTERVAL_SECS: u64 = 2;

/// loopback — reverse-shell lifecycle walkthrough
#[derive(Parser, Debug)]
#[command(name = "loopback", version, about = "Reverse-shell lifecycle walkthrough")]
struct Cli {
    /// Number of simulated tunnel outages
    #[arg(long, default_value_t = 2)]
    outages: u32,

    /// Liveness probe period in seconds [default: 2, or the client config]
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Probing after a reconnect: "rearm" or "once"
    #[arg(long)]
    policy: Option<String>,

    /// Port requested for the remote bind (0 = any)
    #[arg(short, long)]
    bind_port: Option<u16>,

    /// Rendezvous config file (server.toml)
    #[arg(long)]
    server_config: Option<PathBuf>,

    /// Reverse peer config file (client.toml)
    #[arg(long)]
    client_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Echoes whatever arrives through the tunnel.
struct Echo;

impl ConnectionHandler<DuplexStream> for Echo {
    async fn handle(&self, mut stream: DuplexStream, origin: String) {
        info!(%origin, "tunnelled connection");
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn sep(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("  {title}");
    println!("{}\n", "=".repeat(60));
}

async fn print_registry(registry: &PeerRegistry<Arc<MemoryConnection>>) -> Result<()> {
    let snapshot = registry.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Send a line through the reverse-bound port and read the echo.
async fn ping_tunnel(net: &MemoryNetwork, port: u16) -> Result<String> {
    let mut stream = net
        .connect(&format!("{HOME_HOST}:{port}"))
        .context("tunnel refused connection")?;
    stream.write_all(b"hello through the tunnel").await?;
    let mut buf = vec![0u8; 24];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn wait_connected(status: &SupervisorStatus, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = status.wait_for(SupervisorState::Connected) => Ok(()),
        _ = cancel.cancelled() => bail!("interrupted"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let monitor = match cli.policy.as_deref() {
        None => None,
        Some("rearm") => Some(MonitorPolicy::Rearm),
        Some("once") => Some(MonitorPolicy::StopAfterFirstReconnect),
        Some(other) => bail!("unknown policy {other:?}, expected \"rearm\" or \"once\""),
    };

    println!("==========================================================");
    println!("  LOOPBACK: reverse shell over an in-process network");
    println!("==========================================================");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    sep("1. Keys and rendezvous server");
    let private_key = generate_ed25519().context("generating client key")?;
    let public_key = PrivateKey::from_openssh(&private_key)
        .context("parsing generated key")?
        .public_key()
        .clone();
    println!("client key: {}", rssh_core::keys::fingerprint(&public_key));

    let mut server_cfg = match &cli.server_config {
        Some(path) => ServerConfig::load(Some(path.as_path()), None, false)
            .context("loading server config")?,
        None => ServerConfig::from_toml("[auth]\npassword = \"loopback\"\n", None, false)?,
    };
    server_cfg.authorized_key = Some(public_key);
    let home_port = server_cfg.params.home_port;
    println!("rendezvous: {HOME_HOST}:{home_port}");

    let net = MemoryNetwork::new();
    let endpoint = net
        .bind(
            &rssh_core::join_host_port(HOME_HOST, home_port),
            Arc::new(server_cfg.policy()),
        )
        .context("binding rendezvous endpoint")?;
    let server = Arc::new(RendezvousServer::<MemoryConnection>::new());
    let serving = {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.run(endpoint, &cancel).await })
    };

    sep("2. Dial home");
    let client_cfg = ClientConfig::load(
        cli.client_config.as_deref(),
        ConfigOverrides {
            host: Some(HOME_HOST.to_string()),
            port: Some(home_port),
            bind_port: cli.bind_port,
            password: server_cfg.password.clone(),
            ..Default::default()
        },
    )
    .context("loading client config")?;
    let mut config = client_cfg.supervisor.clone();
    let interval = cli
        .interval_secs
        .or(cli.client_config.is_none().then_some(DEFAULT_INTERVAL_SECS));
    if let Some(secs) = interval {
        config.probe_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(monitor) = monitor {
        config.monitor = monitor;
    }
    let monitor = config.monitor;
    let probe_interval = config.probe_interval;

    let credentials = Credentials::new(private_key, client_cfg.password.clone());
    let pipeline = ReversePipeline::new(
        client_cfg.connector(net.dialer()),
        client_cfg.target(credentials),
        Arc::new(Echo),
    );
    let supervisor = Supervisor::new(pipeline, net.clone(), config);
    let status = supervisor.status();
    let supervising = {
        let cancel = cancel.clone();
        tokio::spawn(async move { supervisor.run(&cancel).await })
    };

    let result = async {
        wait_connected(&status, &cancel).await?;
        let binding = status.binding().context("connected without a binding")?;
        println!("reverse port: {}", binding.actual_port);
        println!("echo: {}", ping_tunnel(&net, binding.actual_port).await?);
        print_registry(server.registry()).await?;

        for outage in 1..=cli.outages {
            sep(&format!("{}. Outage {outage}", outage + 2));
            let port = status.binding().context("no binding")?.actual_port;
            net.sever(port);
            println!("severed tunnel on port {port}, waiting for the probe");

            let waited = tokio::time::timeout(
                probe_interval * 3,
                wait_connected_after(&status, &cancel),
            )
            .await;
            if waited.is_err() {
                println!("no reconnection (policy {:?}), monitoring has stopped", monitor);
                break;
            }
            waited??;

            let binding = status.binding().context("no binding")?;
            println!(
                "back on port {} after {} launches",
                binding.actual_port,
                status.launches()
            );
            println!("echo: {}", ping_tunnel(&net, binding.actual_port).await?);
            print_registry(server.registry()).await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    sep("Shutdown");
    cancel.cancel();
    supervising.await?.context("supervisor")?;
    serving.await?.context("rendezvous server")?;
    print_registry(server.registry()).await?;
    result
}

async fn wait_connected_after(status: &SupervisorStatus, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = status.wait_for(SupervisorState::Reconnecting) => {}
        _ = cancel.cancelled() => bail!("interrupted"),
    }
    wait_connected(status, cancel).await
}
