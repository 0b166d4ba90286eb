//! Replay of the protocol-sniffing byte.
//!
//! The dispatcher consumes exactly one byte to pick a protocol. The chosen
//! handler must still see that byte first, so the stream is wrapped in a
//! [`PeekedConnection`] that hands it back on the first read.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use sockmux_socks5::Conn;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream with one already-consumed byte pushed back in front of it.
///
/// First read: the stored byte goes into the buffer. If the buffer has more
/// room and no stored error exists, the inner stream is polled once in the
/// same call; if it has nothing ready, the read completes with just the
/// byte. An inner error on that read is held back and returned by the next
/// read, since a read cannot report data and an error together.
///
/// Later reads go straight to the inner stream. Writes, flushes, shutdown
/// and `local_addr` always delegate.
#[derive(Debug)]
pub struct PeekedConnection<C> {
    inner: C,
    byte: u8,
    replayed: bool,
    error: Option<io::Error>,
}

impl<C> PeekedConnection<C> {
    /// Wrap `inner`, replaying `byte` on the first read.
    pub fn new(inner: C, byte: u8) -> Self {
        Self {
            inner,
            byte,
            replayed: false,
            error: None,
        }
    }

    /// Wrap `inner`, replaying `byte` and then `error` without touching the
    /// inner stream.
    pub fn with_error(inner: C, byte: u8, error: io::Error) -> Self {
        Self {
            inner,
            byte,
            replayed: false,
            error: Some(error),
        }
    }

    /// The byte consumed for sniffing.
    pub fn peeked_byte(&self) -> u8 {
        self.byte
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for PeekedConnection<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.replayed {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            this.replayed = true;
            buf.put_slice(&[this.byte]);

            if buf.remaining() > 0 && this.error.is_none() {
                if let Poll::Ready(Err(e)) = Pin::new(&mut this.inner).poll_read(cx, buf) {
                    this.error = Some(e);
                }
            }
            return Poll::Ready(Ok(()));
        }

        if let Some(e) = this.error.take() {
            return Poll::Ready(Err(e));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for PeekedConnection<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<C: Conn> Conn for PeekedConnection<C> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
