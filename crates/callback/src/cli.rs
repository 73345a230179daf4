//! Shared command-line plumbing for the server and client binaries.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use url::Url;

/// Logging flags shared by every binary.
#[derive(Debug, Clone, Args)]
pub struct LoggingArgs {
    /// Logging level (error, warn, info, debug, trace)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
    /// Log output format: text or json
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: String,
}

impl LoggingArgs {
    /// Installs the global tracing subscriber.
    pub fn init(&self) -> Result<()> {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env().or_else(|_| {
            EnvFilter::try_new(&self.log_level)
                .with_context(|| format!("invalid --log-level: {}", self.log_level))
        })?;

        match self.log_format.as_str() {
            "json" => tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|err| anyhow!("installing logger: {err}"))?,
            "text" => tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|err| anyhow!("installing logger: {err}"))?,
            other => bail!("unrecognized --log-format: {other} (use text or json)"),
        }
        Ok(())
    }
}

/// Parses durations like `500ms`, `3s`, `2m`, `1h`.
pub fn parse_duration(spec: &str) -> Result<Duration> {
    let spec = spec.trim();
    if spec.is_empty() {
        bail!("empty duration");
    }
    if let Some(millis) = spec.strip_suffix("ms") {
        let millis: u64 = millis.parse().context("invalid duration number")?;
        return Ok(Duration::from_millis(millis));
    }
    let (number, unit) = spec.split_at(spec.len() - 1);
    let number: u64 = number.parse().context("invalid duration number")?;
    let seconds = match unit {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        _ => bail!("invalid duration unit '{unit}', use ms/s/m/h"),
    };
    Ok(Duration::from_secs(seconds))
}

/// Resolves the websocket endpoint for an API path plus callback id on
/// `server`, rewriting `http(s)` schemes to `ws(s)` and keeping any context
/// path the server URL carries.
pub fn websocket_api_url(server: &Url, api_path: &str, callback_id: &str) -> Result<Url> {
    let mut url = server.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unrecognized scheme for callback server: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("could not derive websocket scheme for {server}"))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| anyhow!("callback server URL cannot be a base"))?;
        segments.pop_if_empty();
        for part in api_path.split('/').filter(|part| !part.is_empty()) {
            segments.push(part);
        }
        segments.push(callback_id);
    }
    Ok(url)
}

/// Resolves once the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
