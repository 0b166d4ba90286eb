//! Bidirectional relay between the client and the CONNECT target.
//!
//! The client-to-target pump runs on its own task; the target-to-client pump
//! runs on the caller's task and its failure is what [`relay`] returns.
//! Each pump reads at most [`RELAY_BUFFER_SIZE`] bytes and writes all of
//! them before reading again. End of stream counts as a failure.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::SocksError;

/// Per-read buffer size for each relay direction.
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("client to target"),
            Direction::TargetToClient => f.write_str("target to client"),
        }
    }
}

/// Pump bytes between `client` and `remote` until the target-to-client
/// direction fails.
///
/// The spawned client-to-target pump is aborted on return, which drops its
/// halves of both streams. The caller closes the rest by dropping them.
pub async fn relay<C, R>(client: C, remote: R) -> SocksError
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let bytes_to_target = Arc::new(AtomicU64::new(0));
    let upstream = tokio::spawn({
        let counter = Arc::clone(&bytes_to_target);
        async move {
            let error = pump(&mut client_read, &mut remote_write, &counter).await;
            debug!(
                direction = %Direction::ClientToTarget,
                error = %error,
                "Relay direction ended"
            );
            // Let the target see end of stream so it can close its side.
            let _ = remote_write.shutdown().await;
        }
    });

    let bytes_to_client = AtomicU64::new(0);
    let error = pump(&mut remote_read, &mut client_write, &bytes_to_client).await;
    upstream.abort();

    debug!(
        bytes_to_target = bytes_to_target.load(Ordering::Relaxed),
        bytes_to_client = bytes_to_client.load(Ordering::Relaxed),
        error = %error,
        "Relay finished"
    );

    SocksError::Relay {
        direction: Direction::TargetToClient,
        source: error,
    }
}

/// Copy from `reader` to `writer` until an error or end of stream.
async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Error
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream"),
            Ok(n) => n,
            Err(e) => return e,
        };

        // write_all retries the unwritten tail on partial writes
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return e;
        }
        if let Err(e) = writer.flush().await {
            return e;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
