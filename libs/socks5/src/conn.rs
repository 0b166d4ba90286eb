//! Connection capability shared by client streams, outbound streams and
//! the wrappers layered on top of them.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream that knows its local address.
///
/// Reading, writing and closing come from the tokio I/O traits (closing is
/// `shutdown` or drop). The local address is what the CONNECT reply reports
/// as the bind address.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Local address of the underlying socket.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Type-erased connection, used once a stream may be plain TCP, a replay
/// wrapper or a terminated TLS session.
pub type BoxedConn = Box<dyn Conn>;

impl Conn for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

impl<C: Conn + ?Sized> Conn for Box<C> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}
