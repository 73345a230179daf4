//! Stdio proxy client: connects to a callback endpoint and pumps the local
//! stdin/stdout through it.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use callback::carrier::{self, Carrier};
use callback::cli::{parse_duration, shutdown_signal, websocket_api_url, LoggingArgs};
use callback::proxy;

const CONNECT_API_PATH: &str = "api/v1/connect";

#[derive(Debug, Parser)]
#[command(
    name = "callbackproxy",
    version,
    about = "Websocket stdio proxy client for the callback server"
)]
struct Cli {
    /// Callback server to connect to
    #[arg(long, value_name = "URL")]
    server: Url,
    /// Connection timeout
    #[arg(long, value_name = "DURATION", default_value = "5s")]
    timeout: String,
    /// Basic authentication user to use for the connection
    #[arg(long = "http.user", env = "CALLBACKPROXY_USER", default_value = "")]
    http_user: String,
    /// Basic authentication password to use for the connection
    #[arg(long = "http.password", env = "CALLBACKPROXY_PASSWORD", default_value = "")]
    http_password: String,
    /// Prefix to remove from the supplied callback id
    #[arg(long = "strip-prefix", default_value = "")]
    strip_prefix: String,
    /// Suffix to remove from the supplied callback id
    #[arg(long = "strip-suffix", default_value = "")]
    strip_suffix: String,
    /// Size in bytes of connection buffers
    #[arg(long = "proxy.buffer-size", default_value_t = 1024)]
    proxy_buffer_size: usize,
    /// Id of the endpoint on the callback server to connect to
    #[arg(value_name = "CALLBACK_ID")]
    callback_id: String,
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
    let connect_timeout = parse_duration(&cli.timeout).context("invalid --timeout")?;
    let callback_id = effective_callback_id(&cli);
    if callback_id.is_empty() {
        bail!("cannot use a blank id");
    }

    let endpoint = websocket_api_url(&cli.server, CONNECT_API_PATH, &callback_id)?;
    info!(endpoint = %endpoint, "callback server endpoint");

    let mut request = endpoint.as_str().into_client_request()?;
    if !cli.http_user.is_empty() || !cli.http_password.is_empty() {
        debug!("setting HTTP basic auth");
        let token = BASE64.encode(format!("{}:{}", cli.http_user, cli.http_password));
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {token}"))
                .context("basic auth credentials are not header-safe")?,
        );
    }

    let (socket, _response) = tokio::time::timeout(connect_timeout, connect_async(request))
        .await
        .map_err(|_| anyhow!("timed out connecting to callback server"))?
        .context("failed to connect to callback server")?;

    let Carrier { stream, done: _done } = carrier::wrap_websocket(socket);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("exiting on user request");
            shutdown.cancel();
        });
    }

    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    match proxy::run(cli.proxy_buffer_size, stdio, stream, shutdown, None, None).await {
        Ok(()) => {
            debug!("connection closed");
            Ok(())
        }
        Err(err) => Err(err).context("connection closed with error"),
    }
}

fn effective_callback_id(cli: &Cli) -> String {
    let mut callback_id = cli.callback_id.clone();
    if !cli.strip_suffix.is_empty() {
        if let Some(trimmed) = callback_id.strip_suffix(&cli.strip_suffix) {
            callback_id = trimmed.to_string();
        }
    }
    if !cli.strip_prefix.is_empty() {
        if let Some(trimmed) = callback_id.strip_prefix(&cli.strip_prefix) {
            callback_id = trimmed.to_string();
        }
    }
    callback_id
}
