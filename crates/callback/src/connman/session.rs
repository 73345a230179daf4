//! Session records and their wire descriptors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ConnmanError;
use crate::mux::MuxClient;

pub(crate) type ResultSender = oneshot::Sender<Result<(), ConnmanError>>;

/// Wire descriptor of an agent (callback) session.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackSessionDesc {
    pub connected_at: DateTime<Utc>,
    pub remote_addr: String,
    pub callback_id: String,
    pub num_clients: u64,
}

/// Wire descriptor of a client session.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSessionDesc {
    pub connected_at: DateTime<Utc>,
    pub remote_addr: String,
    pub callback_id: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Live state of a registered agent session.
///
/// Shared between the registry and the task servicing the registering HTTP
/// request; whichever teardown path wins takes the result sender and performs
/// the removal exactly once.
pub struct CallbackSession {
    callback_id: String,
    remote_addr: String,
    connected_at: DateTime<Utc>,
    num_clients: AtomicU64,
    pub(crate) mux: MuxClient,
    shutdown: CancellationToken,
    result_tx: Mutex<Option<ResultSender>>,
}

impl CallbackSession {
    pub(crate) fn new(
        callback_id: String,
        remote_addr: String,
        mux: MuxClient,
        result_tx: ResultSender,
    ) -> Self {
        Self {
            callback_id,
            remote_addr,
            connected_at: Utc::now(),
            num_clients: AtomicU64::new(0),
            mux,
            shutdown: CancellationToken::new(),
            result_tx: Mutex::new(Some(result_tx)),
        }
    }

    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    pub fn num_clients(&self) -> u64 {
        self.num_clients.load(Ordering::SeqCst)
    }

    /// Clone of the done signal; fires when the session starts tearing down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// True once teardown has begun.
    pub fn is_draining(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// True while the session can still serve new client streams.
    pub fn is_live(&self) -> bool {
        !self.is_draining() && !self.mux.is_closed()
    }

    /// Marks the session as draining and hands out the result sender, once.
    pub(crate) fn begin_teardown(&self) -> Option<ResultSender> {
        self.shutdown.cancel();
        self.result_tx
            .lock()
            .expect("session result lock poisoned")
            .take()
    }

    pub(crate) fn client_attached(&self) -> u64 {
        self.num_clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn client_detached(&self) -> u64 {
        self.num_clients.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn describe(&self) -> CallbackSessionDesc {
        CallbackSessionDesc {
            connected_at: self.connected_at,
            remote_addr: self.remote_addr.clone(),
            callback_id: self.callback_id.clone(),
            num_clients: self.num_clients(),
        }
    }
}

/// Live state of a bridged client session.
pub struct ClientSession {
    key: String,
    callback_id: String,
    remote_addr: String,
    connected_at: DateTime<Utc>,
    pub(crate) bytes_in: Arc<AtomicU64>,
    pub(crate) bytes_out: Arc<AtomicU64>,
}

impl ClientSession {
    pub(crate) fn new(callback_id: String, remote_addr: String) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            callback_id,
            remote_addr,
            connected_at: Utc::now(),
            bytes_in: Arc::new(AtomicU64::new(0)),
            bytes_out: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registry key; unrelated to the callback id, which is not unique among
    /// clients.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    pub fn describe(&self) -> ClientSessionDesc {
        ClientSessionDesc {
            connected_at: self.connected_at,
            remote_addr: self.remote_addr.clone(),
            callback_id: self.callback_id.clone(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}
