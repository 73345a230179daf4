//! Reverse proxy agent: registers with a callback server under an id and
//! forwards every accepted logical stream to a local TCP endpoint.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use callback::carrier::{self, Carrier};
use callback::cli::{parse_duration, shutdown_signal, LoggingArgs};
use callback::mux::MuxServer;
use callback::proxy;

const CALLBACK_API_PATH: &str = "api/v1/callback";

#[derive(Debug, Parser)]
#[command(
    name = "callbackreverse",
    version,
    about = "Callback server reverse proxy agent"
)]
struct Cli {
    /// Callback server to connect to
    #[arg(long, value_name = "URL")]
    server: Url,
    /// Callback id to register as
    #[arg(long)]
    id: String,
    /// Address and port to forward accepted streams to
    #[arg(long, value_name = "HOST:PORT")]
    connect: String,
    /// Automatically reconnect on disconnect
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    forever: bool,
    /// Delay between reconnect attempts
    #[arg(long = "reconnect-interval", value_name = "DURATION", default_value = "1s")]
    reconnect_interval: String,
    /// Connection timeout
    #[arg(long, value_name = "DURATION", default_value = "5s")]
    timeout: String,
    /// Size in bytes of connection buffers
    #[arg(long = "proxy.buffer-size", default_value_t = 1024)]
    proxy_buffer_size: usize,
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
    if cli.id.is_empty() {
        bail!("cannot use a blank id");
    }
    run(cli)
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let reconnect_interval =
        parse_duration(&cli.reconnect_interval).context("invalid --reconnect-interval")?;
    let connect_timeout = parse_duration(&cli.timeout).context("invalid --timeout")?;
    let endpoint = callback::cli::websocket_api_url(&cli.server, CALLBACK_API_PATH, &cli.id)?;
    info!(endpoint = %endpoint, "callback server endpoint");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutting down on user request");
                return Ok(());
            }
            outcome = serve_connection(&cli, &endpoint, connect_timeout, &shutdown) => outcome,
        };

        match outcome {
            Ok(()) => {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                info!("server connection closed");
            }
            Err(err) => {
                error!(error = format!("{err:#}"), "disconnected due to error");
                if !cli.forever {
                    bail!("exiting due to server disconnect");
                }
            }
        }
        info!("attempting to reconnect");
        tokio::time::sleep(reconnect_interval).await;
    }
}

/// One registration: dial, run the mux in server role, forward each accepted
/// stream to the configured TCP target.
async fn serve_connection(
    cli: &Cli,
    endpoint: &Url,
    connect_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    let (socket, _response) = tokio::time::timeout(connect_timeout, connect_async(endpoint.as_str()))
        .await
        .map_err(|_| anyhow!("timed out connecting to callback server"))?
        .context("failed to connect to callback server")?;

    let Carrier { stream, done } = carrier::wrap_websocket(socket);
    let mut mux = MuxServer::new(stream);
    info!("registered with callback server");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("shutting down mux server");
                mux.close().await;
                return Ok(());
            }
            _ = done.cancelled() => None,
            accepted = mux.accept() => accepted,
        };
        let Some(stream) = accepted else {
            bail!("callback server connection closed");
        };

        debug!("accepting connection on mux");
        let forward_addr = cli.connect.clone();
        let buffer_size = cli.proxy_buffer_size;
        let stream_shutdown = shutdown.child_token();
        tokio::spawn(async move {
            let outgoing = match TcpStream::connect(&forward_addr).await {
                Ok(connection) => connection,
                Err(err) => {
                    // Dropping the stream closes it; keep accepting others.
                    warn!(forwarding_addr = %forward_addr, error = %err,
                        "error establishing outgoing proxy connection");
                    return;
                }
            };
            debug!("proxy connected");
            match proxy::run(buffer_size, stream, outgoing, stream_shutdown, None, None).await {
                Ok(()) => debug!("proxy connection exited normally"),
                Err(err) => warn!(error = %err, "proxy connection terminated with error"),
            }
        });
    }
}
