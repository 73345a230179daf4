//! Trusted forwarded-header handling.
//!
//! `X-Forwarded-For` and `X-Forwarded-Protocol` are honored only when the
//! direct peer belongs to one of the configured local networks; everyone else
//! is identified by their socket address.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use ipnet::IpNet;
use tracing::trace;

use super::settings::ApiSettings;

/// Effective client address as seen by the handlers.
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub String);

/// Parses a comma separated CIDR list such as `127.0.0.0/8,10.0.0.0/8`.
pub fn parse_local_networks(spec: &str) -> Result<Vec<IpNet>, ipnet::AddrParseError> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

/// Resolves the client address for the request and stores it as a
/// [`RemoteAddr`] extension.
pub async fn forwarded_middleware(
    State(settings): State<ApiSettings>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let mut remote = peer.map(|addr| addr.to_string()).unwrap_or_default();

    if let Some(peer) = peer {
        let trusted = settings
            .local_networks
            .iter()
            .any(|network| network.contains(&peer.ip()));
        if trusted {
            let headers = request.headers();
            if let Some(forwarded) = headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
            {
                if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
                    remote = first.to_string();
                }
            }
            if let Some(proto) = headers
                .get("x-forwarded-protocol")
                .and_then(|value| value.to_str().ok())
            {
                trace!(peer = %peer, proto, "trusted forwarded protocol");
            }
        }
    }

    request.extensions_mut().insert(RemoteAddr(remote));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_lists() {
        let networks = parse_local_networks("127.0.0.0/8, 10.0.0.0/8").unwrap();
        assert_eq!(networks.len(), 2);
        assert!(networks[0].contains(&"127.0.0.1".parse::<std::net::IpAddr>().unwrap()));
        assert!(!networks[0].contains(&"192.168.1.1".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn rejects_bad_network_lists() {
        assert!(parse_local_networks("not-a-network").is_err());
    }
}
