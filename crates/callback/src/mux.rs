//! Logical stream multiplexing over a single duplex carrier.
//!
//! Thin adapter around the yamux protocol. The server side of a callback
//! registration runs the *client* role (it opens streams toward the agent);
//! the agent runs the *server* role and accepts them. Keepalive pings and
//! dead-peer detection are the library defaults; when the carrier stops
//! responding the driver task exits and the adapter reports closed.

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_yamux::{Config, Control, Session, StreamHandle};
use tracing::{debug, warn};

/// Inbound streams queued on the server role until `accept` picks them up.
const ACCEPT_BACKLOG: usize = 16;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("mux session is closed")]
    Closed,
    #[error("opening mux stream failed: {0}")]
    Open(tokio_yamux::error::Error),
    #[error("opening mux stream timed out")]
    OpenTimeout,
}

/// Client role: opens logical streams toward the remote accept loop.
pub struct MuxClient {
    control: Control,
    closed: CancellationToken,
}

impl MuxClient {
    /// Wraps `carrier` and spawns the driver task servicing the session.
    pub fn new<C>(carrier: C) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut session = Session::new_client(carrier, Config::default());
        let control = session.control();
        let closed = CancellationToken::new();
        let guard = closed.clone();
        tokio::spawn(async move {
            loop {
                match session.next().await {
                    // The agent never opens streams toward the server.
                    Some(Ok(_stream)) => {
                        warn!("dropping unexpected inbound mux stream");
                    }
                    Some(Err(err)) => {
                        debug!(error = ?err, "mux session ended");
                        break;
                    }
                    None => break,
                }
            }
            guard.cancel();
        });
        Self { control, closed }
    }

    /// Opens a new logical stream.
    pub async fn open(&self) -> Result<StreamHandle, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        self.control.clone().open_stream().await.map_err(MuxError::Open)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has shut down, for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Closes the session; safe to call more than once.
    pub async fn close(&self) {
        self.control.clone().close().await;
    }
}

/// Server role: accepts logical streams opened by the remote end.
pub struct MuxServer {
    incoming: mpsc::Receiver<StreamHandle>,
    control: Control,
    closed: CancellationToken,
}

impl MuxServer {
    /// Wraps `carrier` and spawns the driver task servicing the session.
    pub fn new<C>(carrier: C) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut session = Session::new_server(carrier, Config::default());
        let control = session.control();
        let closed = CancellationToken::new();
        let guard = closed.clone();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        tokio::spawn(async move {
            loop {
                match session.next().await {
                    Some(Ok(stream)) => {
                        if tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(error = ?err, "mux session ended");
                        break;
                    }
                    None => break,
                }
            }
            guard.cancel();
        });
        Self {
            incoming: rx,
            control,
            closed,
        }
    }

    /// Waits for the next inbound logical stream; `None` once the session is
    /// finished.
    pub async fn accept(&mut self) -> Option<StreamHandle> {
        self.incoming.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the session; safe to call more than once.
    pub async fn close(&self) {
        self.control.clone().close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn open_and_accept_round_trip() {
        let (near, far) = tokio::io::duplex(4096);
        let client = MuxClient::new(near);
        let mut server = MuxServer::new(far);

        let mut outbound = client.open().await.expect("open stream");
        let mut inbound = tokio::time::timeout(Duration::from_secs(1), server.accept())
            .await
            .expect("accept timed out")
            .expect("session ended before accept");

        outbound.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        inbound.write_all(b"world").await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let (near, far) = tokio::io::duplex(4096);
        let client = MuxClient::new(near);
        let mut server = MuxServer::new(far);

        let mut first = client.open().await.unwrap();
        let mut second = client.open().await.unwrap();
        let mut first_in = server.accept().await.unwrap();
        let mut second_in = server.accept().await.unwrap();

        second.write_all(b"two").await.unwrap();
        first.write_all(b"one").await.unwrap();

        let mut buf = [0u8; 3];
        first_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        second_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[tokio::test]
    async fn close_marks_session_closed() {
        let (near, far) = tokio::io::duplex(4096);
        let client = MuxClient::new(near);
        let mut server = MuxServer::new(far);

        client.close().await;
        let accepted = tokio::time::timeout(Duration::from_secs(1), server.accept())
            .await
            .expect("accept did not observe close");
        assert!(accepted.is_none());

        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .expect("client did not observe close");
        assert!(client.is_closed());
        assert!(matches!(client.open().await, Err(MuxError::Closed)));
    }
}
