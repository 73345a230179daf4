//! Bidirectional byte pump between two duplex streams.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default per-direction copy buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// A write accepted fewer bytes than were read.
    #[error("incomplete write")]
    IncompleteWrite,
    /// Terminal read or write failure on either endpoint.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Copies bytes in both directions between `a` and `b` until either side
/// reaches EOF, either direction fails, or `shutdown` fires.
///
/// Each direction runs as its own task with a `buffer_size` byte buffer.
/// Whichever direction finishes first takes the other one down and both
/// endpoints are closed. The result is the first error observed; EOF and
/// shutdown count as a normal close. Counters, when given, accumulate the
/// bytes written in their direction.
pub async fn run<A, B>(
    buffer_size: usize,
    a: A,
    b: B,
    shutdown: CancellationToken,
    a_to_b: Option<Arc<AtomicU64>>,
    b_to_a: Option<Arc<AtomicU64>>,
) -> Result<(), ProxyError>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    // Shared by both pumps: whichever exits first cancels the other.
    let cancel = shutdown.child_token();
    let forward = tokio::spawn(pump(buffer_size, a_read, b_write, cancel.clone(), a_to_b));
    let backward = tokio::spawn(pump(buffer_size, b_read, a_write, cancel, b_to_a));

    let (forward, backward) = tokio::join!(forward, backward);
    let mut result = Ok(());
    for outcome in [forward, backward] {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if result.is_ok() {
                    result = Err(err);
                }
            }
            Err(join_err) => {
                warn!(error = %join_err, "proxy pump task failed");
                if result.is_ok() {
                    result = Err(ProxyError::Io(io::Error::other(join_err)));
                }
            }
        }
    }
    debug!("proxy session finished");
    result
}

async fn pump<R, W>(
    buffer_size: usize,
    mut src: ReadHalf<R>,
    mut dst: WriteHalf<W>,
    cancel: CancellationToken,
    counter: Option<Arc<AtomicU64>>,
) -> Result<(), ProxyError>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; buffer_size];
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("pump shutting down on request");
                break Ok(());
            }
            read = src.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(err) = dst.write_all(&buf[..n]).await {
                        break Err(write_error(err));
                    }
                    if let Some(counter) = &counter {
                        counter.fetch_add(n as u64, Ordering::Relaxed);
                    }
                }
                Err(err) => break Err(ProxyError::Io(err)),
            },
        }
    };
    let _ = dst.shutdown().await;
    cancel.cancel();
    result
}

fn write_error(err: io::Error) -> ProxyError {
    if err.kind() == io::ErrorKind::WriteZero {
        ProxyError::IncompleteWrite
    } else {
        ProxyError::Io(err)
    }
}
