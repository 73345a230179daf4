//! Settings record injected into every handler.

use std::sync::Arc;

use ipnet::IpNet;

use crate::connman::ConnectionManager;

/// Shared state for the HTTP layer.
#[derive(Clone)]
pub struct ApiSettings {
    /// Handle to the backend connection manager.
    pub connman: Arc<ConnectionManager>,
    /// URL prefix the application is hosted under, e.g. behind a reverse
    /// proxy. Empty for none.
    pub context_path: String,
    /// Networks whose members may set the forwarded headers.
    pub local_networks: Arc<Vec<IpNet>>,
    /// Event buffer handed to each SSE subscriber.
    pub subscriber_buffer: usize,
    /// Websocket read buffer size.
    pub read_buffer_size: usize,
    /// Websocket write buffer size.
    pub write_buffer_size: usize,
}
