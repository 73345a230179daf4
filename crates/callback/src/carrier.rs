//! Bridges a websocket into the plain duplex byte stream consumed by the
//! mux adapter and the proxy engine.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// In-memory buffer between the websocket tasks and the byte-stream side.
const BRIDGE_BUFFER: usize = 64 * 1024;

/// What a websocket frame means to the byte tunnel.
pub enum Payload {
    Data(Bytes),
    Close,
    Control,
}

/// Unifies the server-side and client-side websocket message types.
pub trait BridgeMessage: Send + 'static {
    fn from_data(data: Bytes) -> Self;
    fn close() -> Self;
    fn into_payload(self) -> Payload;
}

impl BridgeMessage for axum::extract::ws::Message {
    fn from_data(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn into_payload(self) -> Payload {
        match self {
            Self::Binary(data) => Payload::Data(data),
            Self::Text(text) => Payload::Data(Bytes::copy_from_slice(text.as_bytes())),
            Self::Close(_) => Payload::Close,
            Self::Ping(_) | Self::Pong(_) => Payload::Control,
        }
    }
}

impl BridgeMessage for tokio_tungstenite::tungstenite::Message {
    fn from_data(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn into_payload(self) -> Payload {
        match self {
            Self::Binary(data) => Payload::Data(data),
            Self::Text(text) => Payload::Data(Bytes::copy_from_slice(text.as_bytes())),
            Self::Close(_) => Payload::Close,
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => Payload::Control,
        }
    }
}

/// A bridged websocket: one side of the byte pipe plus the signal that fires
/// when the socket finishes.
pub struct Carrier {
    pub stream: DuplexStream,
    pub done: CancellationToken,
}

/// Spawns the two bridge tasks and returns the byte-stream side.
///
/// Binary and text frames become payload bytes; ping/pong are left to the
/// websocket layer; a close frame (or a read error) ends the bridge and fires
/// `done`. EOF from the byte-stream side sends a close frame to the peer.
pub fn wrap_websocket<S, M, E>(socket: S) -> Carrier
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + Unpin + 'static,
    M: BridgeMessage,
    E: std::fmt::Display + Send + 'static,
{
    let (stream, bridge) = tokio::io::duplex(BRIDGE_BUFFER);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge);
    let (mut ws_sink, mut ws_stream) = socket.split();
    let done = CancellationToken::new();

    let guard = done.clone();
    tokio::spawn(async move {
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(message) => match message.into_payload() {
                    Payload::Data(data) => {
                        if bridge_write.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Payload::Close => break,
                    Payload::Control => {}
                },
                Err(err) => {
                    debug!(error = %err, "websocket read ended");
                    break;
                }
            }
        }
        let _ = bridge_write.shutdown().await;
        guard.cancel();
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; BRIDGE_BUFFER];
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = ws_sink.send(M::close()).await;
                    let _ = ws_sink.close().await;
                    break;
                }
                Ok(n) => {
                    let frame = M::from_data(Bytes::copy_from_slice(&buf[..n]));
                    if ws_sink.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    Carrier { stream, done }
}
