//! Callback websocket mediation server.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use callback::api::{create_router, parse_local_networks, ApiSettings};
use callback::cli::{parse_duration, shutdown_signal, LoggingArgs};
use callback::connman::{ConnectionManager, ManagerSettings};

/// Events buffered per SSE subscriber before older ones are dropped.
const SUBSCRIBER_BUFFER: usize = 16;

#[derive(Debug, Parser)]
#[command(
    name = "callbackserver",
    version,
    about = "Callback websocket mediation server"
)]
struct Cli {
    /// Address to listen on for the API, repeatable, e.g. tcp://0.0.0.0:8080
    #[arg(long = "listen.addr", value_name = "URL", default_value = "tcp://0.0.0.0:8080")]
    listen_addr: Vec<String>,
    /// Subpath the application is being hosted under
    #[arg(long = "http.context-path", default_value = "")]
    context_path: String,
    /// Comma separated list of local networks which can set forwarded headers
    #[arg(long = "http.local-networks", default_value = "127.0.0.0/8")]
    local_networks: String,
    /// Size in bytes of connection buffers
    #[arg(long = "proxy.buffer-size", default_value_t = 1024)]
    proxy_buffer_size: usize,
    /// Maximum time to wait for an agent to accept a new stream
    #[arg(long = "proxy.timeout", value_name = "DURATION", default_value = "3s")]
    proxy_timeout: String,
    #[command(flatten)]
    logging: LoggingArgs,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init()?;
    run(cli)
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let open_timeout = parse_duration(&cli.proxy_timeout).context("invalid --proxy.timeout")?;
    let local_networks =
        parse_local_networks(&cli.local_networks).context("invalid --http.local-networks")?;

    info!("starting connection manager");
    let connman = ConnectionManager::new(ManagerSettings {
        proxy_buffer_size: cli.proxy_buffer_size,
        open_timeout,
    });

    let settings = ApiSettings {
        connman,
        context_path: cli.context_path.clone(),
        local_networks: Arc::new(local_networks),
        subscriber_buffer: SUBSCRIBER_BUFFER,
        read_buffer_size: cli.proxy_buffer_size,
        write_buffer_size: cli.proxy_buffer_size,
    };

    let router = create_router(settings);
    let make_service = router.into_make_service_with_connect_info::<SocketAddr>();

    let shutdown = CancellationToken::new();
    let mut servers = Vec::new();
    for listen_addr in &cli.listen_addr {
        let socket_addr = parse_listen_addr(listen_addr)?;
        let listener = TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("binding {listen_addr}"))?;
        info!(addr = %socket_addr, "listening");
        let make_service = make_service.clone();
        let shutdown = shutdown.clone();
        servers.push(tokio::spawn(async move {
            axum::serve(listener, make_service)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }));
    }

    shutdown_signal().await;
    info!("terminating on signal");
    shutdown.cancel();
    for server in servers {
        server.await.context("server task failed")??;
    }
    Ok(())
}

/// Accepts `tcp://host:port` listen specs (plain `host:port` also works).
fn parse_listen_addr(spec: &str) -> Result<SocketAddr> {
    let hostport = spec.strip_prefix("tcp://").unwrap_or(spec);
    hostport
        .to_socket_addrs()
        .with_context(|| format!("invalid listen address: {spec}"))?
        .next()
        .ok_or_else(|| anyhow!("listen address resolved to nothing: {spec}"))
}
