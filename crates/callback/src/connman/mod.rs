//! Connection manager: the registry of callback (agent) sessions and the
//! client sessions bridged onto them.
//!
//! One manager exists per process. Registry mutations publish their lifecycle
//! event while holding the map write lock, so a list snapshot (taken under
//! the read lock) always pairs with the event sequence number it reports.

mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use session::{CallbackSession, CallbackSessionDesc, ClientSession, ClientSessionDesc};

use crate::carrier::Carrier;
use crate::events::{EventBus, EventKind, Subscription};
use crate::mux::{MuxClient, MuxError};
use crate::proxy::{self, ProxyError};

#[derive(Debug, Error)]
pub enum ConnmanError {
    #[error("callback session already exists: {0}")]
    SessionExists(String),
    #[error("callback session does not exist: {0}")]
    SessionUnknown(String),
    #[error("callback session is disconnecting: {0}")]
    SessionDisconnected(String),
    #[error("could not open mux stream: {0}")]
    MuxOpen(#[from] MuxError),
    #[error("proxy failed: {0}")]
    Proxy(#[from] ProxyError),
}

/// Tuning knobs for the manager, fixed at construction.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Per-direction proxy buffer in bytes.
    pub proxy_buffer_size: usize,
    /// How long to wait for the agent to accept a new logical stream.
    pub open_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            proxy_buffer_size: proxy::DEFAULT_BUFFER_SIZE,
            open_timeout: Duration::from_secs(3),
        }
    }
}

/// Point-in-time snapshot of the agent registry, paired with the event
/// sequence it corresponds to.
#[derive(Debug, Serialize)]
pub struct CallbackSessionList {
    pub sequence_num: u64,
    pub sessions: HashMap<String, CallbackSessionDesc>,
}

/// Point-in-time snapshot of the client registry.
#[derive(Debug, Serialize)]
pub struct ClientSessionList {
    pub sequence_num: u64,
    pub sessions: Vec<ClientSessionDesc>,
}

pub struct ConnectionManager {
    callback_sessions: RwLock<HashMap<String, Arc<CallbackSession>>>,
    client_sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    callback_events: EventBus<CallbackSessionDesc>,
    client_events: EventBus<ClientSessionDesc>,
    settings: ManagerSettings,
}

impl ConnectionManager {
    pub fn new(settings: ManagerSettings) -> Arc<Self> {
        Arc::new(Self {
            callback_sessions: RwLock::new(HashMap::new()),
            client_sessions: RwLock::new(HashMap::new()),
            callback_events: EventBus::new(),
            client_events: EventBus::new(),
            settings,
        })
    }

    /// Registers an agent carrier under `callback_id`.
    ///
    /// Returns immediately; the receiver resolves with the session's terminal
    /// result once it ends (or with the registration error). Dropping the
    /// refused carrier closes the underlying websocket.
    pub fn callback_connection(
        self: &Arc<Self>,
        callback_id: String,
        remote_addr: String,
        carrier: Carrier,
    ) -> oneshot::Receiver<Result<(), ConnmanError>> {
        let (result_tx, result_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let Carrier { stream, done } = carrier;
            let mut sessions = manager.callback_sessions.write().await;
            if let Some(existing) = sessions.get(&callback_id) {
                if !existing.mux.is_closed() {
                    warn!(callback_id, "callback session already exists and is active");
                    let _ = result_tx.send(Err(ConnmanError::SessionExists(callback_id)));
                    return;
                }
                debug!(callback_id, "replacing stale callback session");
            }

            let mux = MuxClient::new(stream);
            let session = Arc::new(CallbackSession::new(
                callback_id.clone(),
                remote_addr,
                mux,
                result_tx,
            ));
            sessions.insert(callback_id.clone(), Arc::clone(&session));
            manager
                .callback_events
                .publish(EventKind::Connected, session.describe());
            drop(sessions);
            info!(callback_id, "established callback mux session");

            let watchdog = Arc::clone(&manager);
            tokio::spawn(async move {
                let shutdown = session.shutdown_token();
                tokio::select! {
                    _ = done.cancelled() => debug!(callback_id = session.callback_id(), "callback carrier closed"),
                    _ = session.mux.closed() => debug!(callback_id = session.callback_id(), "callback mux closed"),
                    _ = shutdown.cancelled() => debug!(callback_id = session.callback_id(), "callback disconnect requested"),
                }
                watchdog.teardown_callback(&session, Ok(())).await;
            });
        });
        result_rx
    }

    /// Bridges a client carrier onto the agent registered under
    /// `callback_id`. Returns immediately; the receiver resolves with the
    /// stream's terminal result.
    pub fn client_connection(
        self: &Arc<Self>,
        callback_id: String,
        remote_addr: String,
        carrier: Carrier,
    ) -> oneshot::Receiver<Result<(), ConnmanError>> {
        let (result_tx, result_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager
                .bridge_client(callback_id, remote_addr, carrier)
                .await;
            let _ = result_tx.send(result);
        });
        result_rx
    }

    /// Force-terminates the agent session registered under `callback_id`.
    pub async fn disconnect(&self, callback_id: &str) -> Result<(), ConnmanError> {
        let session = {
            let sessions = self.callback_sessions.read().await;
            sessions.get(callback_id).cloned()
        };
        match session {
            Some(session) => {
                self.teardown_callback(&session, Ok(())).await;
                Ok(())
            }
            None => Err(ConnmanError::SessionUnknown(callback_id.to_string())),
        }
    }

    pub async fn lookup_callback_session(&self, callback_id: &str) -> Option<Arc<CallbackSession>> {
        self.callback_sessions.read().await.get(callback_id).cloned()
    }

    pub async fn list_callback_sessions(&self) -> CallbackSessionList {
        let sessions = self.callback_sessions.read().await;
        let snapshot = sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.describe()))
            .collect();
        CallbackSessionList {
            sequence_num: self.callback_events.sequence(),
            sessions: snapshot,
        }
    }

    pub async fn list_client_sessions(&self) -> ClientSessionList {
        let sessions = self.client_sessions.read().await;
        let mut snapshot: Vec<_> = sessions.values().map(|session| session.describe()).collect();
        snapshot.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        ClientSessionList {
            sequence_num: self.client_events.sequence(),
            sessions: snapshot,
        }
    }

    pub fn subscribe_callback_events(&self, buffer: usize) -> Subscription<CallbackSessionDesc> {
        self.callback_events.subscribe(buffer)
    }

    pub fn subscribe_client_events(&self, buffer: usize) -> Subscription<ClientSessionDesc> {
        self.client_events.subscribe(buffer)
    }

    async fn bridge_client(
        &self,
        callback_id: String,
        remote_addr: String,
        carrier: Carrier,
    ) -> Result<(), ConnmanError> {
        let agent = {
            let sessions = self.callback_sessions.read().await;
            sessions.get(&callback_id).cloned()
        };
        let Some(agent) = agent else {
            warn!(callback_id, "requested callback session does not exist");
            return Err(ConnmanError::SessionUnknown(callback_id));
        };
        if !agent.is_live() {
            return Err(ConnmanError::SessionDisconnected(callback_id));
        }

        let stream = match tokio::time::timeout(self.settings.open_timeout, agent.mux.open()).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                // The agent may have started draining between the lookup and
                // the open; report that rather than a bare open failure.
                if !agent.is_live() {
                    return Err(ConnmanError::SessionDisconnected(callback_id));
                }
                warn!(callback_id, error = %err, "establishing reverse connection failed");
                return Err(err.into());
            }
            Err(_) => {
                warn!(callback_id, "establishing reverse connection timed out");
                return Err(MuxError::OpenTimeout.into());
            }
        };

        let client = Arc::new(ClientSession::new(callback_id.clone(), remote_addr));
        {
            let mut clients = self.client_sessions.write().await;
            clients.insert(client.key().to_string(), Arc::clone(&client));
            self.client_events
                .publish(EventKind::Connected, client.describe());
        }
        let attached = agent.client_attached();
        self.publish_callback_updated(&agent).await;
        info!(callback_id, num_clients = attached, "client connected to session");

        // Either end going away stops the pumps: the client websocket closing
        // or the agent session draining.
        let pump_shutdown = CancellationToken::new();
        {
            let trigger = pump_shutdown.clone();
            let client_done = carrier.done.clone();
            let agent_done = agent.shutdown_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = client_done.cancelled() => {}
                    _ = agent_done.cancelled() => {}
                }
                trigger.cancel();
            });
        }

        let result = proxy::run(
            self.settings.proxy_buffer_size,
            carrier.stream,
            stream,
            pump_shutdown,
            Some(Arc::clone(&client.bytes_out)),
            Some(Arc::clone(&client.bytes_in)),
        )
        .await;

        {
            let mut clients = self.client_sessions.write().await;
            clients.remove(client.key());
            self.client_events
                .publish(EventKind::Disconnected, client.describe());
        }
        let remaining = agent.client_detached();
        self.publish_callback_updated(&agent).await;
        info!(
            callback_id = client.callback_id(),
            num_clients = remaining,
            "client disconnected"
        );

        result.map_err(ConnmanError::from)
    }

    /// Removes the session, publishes `disconnected`, and delivers the
    /// terminal result; every path after the first is a no-op.
    async fn teardown_callback(
        &self,
        session: &Arc<CallbackSession>,
        result: Result<(), ConnmanError>,
    ) {
        let Some(result_tx) = session.begin_teardown() else {
            return;
        };
        session.mux.close().await;
        let mut sessions = self.callback_sessions.write().await;
        let installed = sessions
            .get(session.callback_id())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if installed {
            sessions.remove(session.callback_id());
            // A session that was already replaced by a fresh registration
            // publishes nothing: the replacement's `connected` supersedes it
            // in replay order.
            self.callback_events
                .publish(EventKind::Disconnected, session.describe());
        }
        drop(sessions);
        info!(callback_id = session.callback_id(), "callback session ended");
        let _ = result_tx.send(result);
    }

    /// Reflects a `num_clients` change on the agent event stream, provided
    /// the session is still the registered one.
    async fn publish_callback_updated(&self, agent: &Arc<CallbackSession>) {
        let sessions = self.callback_sessions.read().await;
        let installed = sessions
            .get(agent.callback_id())
            .is_some_and(|current| Arc::ptr_eq(current, agent));
        if installed {
            self.callback_events
                .publish(EventKind::Updated, agent.describe());
        }
    }
}
