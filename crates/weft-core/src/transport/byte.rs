//! Reliable, ordered byte channels.
//!
//! Sessions are built over anything satisfying [`ByteStream`]: a TCP stream
//! for cross-host sessions or an in-process duplex pair for local ones and
//! for tests.  Deadline control wraps individual operations via
//! [`with_deadline`].

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// Marker for byte streams a session can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Buffer size of one direction of an in-process pair.
const LOCAL_PAIR_CAPACITY: usize = 65_536;

/// A reliable, ordered, bidirectional byte channel.
pub struct ByteTransport {
    stream: Box<dyn ByteStream>,
    peer: String,
}

impl ByteTransport {
    /// Dial a TCP peer, bounded by `deadline`.
    pub async fn connect_tcp(addr: SocketAddr, deadline: Duration) -> Result<ByteTransport> {
        let stream = with_deadline(deadline, TcpStream::connect(addr))
            .await?
            .map_err(|e| Error::OpenSocketFailed(format!("connect {addr}: {e}")))?;
        Ok(Self::from_tcp(stream))
    }

    /// Wrap an accepted or connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> ByteTransport {
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "tcp:unknown".to_owned(), |a| a.to_string());
        // Terminal messages are small and latency-sensitive.
        let _ = stream.set_nodelay(true);
        ByteTransport { stream: Box::new(stream), peer }
    }

    /// An in-process pair, each end seeing the other's writes.
    pub fn pair() -> (ByteTransport, ByteTransport) {
        let (a, b) = tokio::io::duplex(LOCAL_PAIR_CAPACITY);
        (
            ByteTransport { stream: Box::new(a), peer: "local:a".to_owned() },
            ByteTransport { stream: Box::new(b), peer: "local:b".to_owned() },
        )
    }

    /// Peer description for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write the whole buffer.
    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(|e| Error::from_io(&e))?;
        self.stream.flush().await.map_err(|e| Error::from_io(&e))?;
        Ok(())
    }

    /// Fill the whole buffer.
    pub async fn receive_all(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).await.map_err(|e| Error::from_io(&e))?;
        Ok(())
    }

    /// Split into independently owned read and write halves for the
    /// framed transport.
    pub fn into_split(self) -> (ReadHalf<Box<dyn ByteStream>>, WriteHalf<Box<dyn ByteStream>>) {
        tokio::io::split(self.stream)
    }
}

/// Run `fut` under a deadline, mapping expiry to [`Error::Timeout`].
pub async fn with_deadline<F>(deadline: Duration, fut: F) -> Result<F::Output>
where
    F: Future,
{
    tokio::time::timeout(deadline, fut).await.map_err(|_| Error::Timeout)
}
