//! Packet sources feeding the trace builder.
//!
//! The rest of the crate only sees the [`PacketSource`] trait. [`UdpSource`]
//! listens on the local port a Raspberry Shake forwards its data to, and
//! [`ReplaySource`] serves datagrams from memory or a capture file.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default UDP port a Shake forwards data to.
pub const DEFAULT_PORT: u16 = 8888;

/// Default time to wait for a packet before declaring the feed dead.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest datagram we expect from the feed.
const MAX_DATAGRAM_LEN: usize = 4096;

/// Failures of the packet feed itself. These are always fatal to a session.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("No packet received within {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Packet source closed")]
    Closed,

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A blocking supplier of raw datagrams.
///
/// `recv` suspends until the next datagram arrives. Implementations are
/// responsible for bounding that wait.
pub trait PacketSource {
    /// Receive the next raw datagram.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, SourceError>> + Send;
}

/// Receives datagrams on a local UDP port.
pub struct UdpSource {
    socket: UdpSocket,
    timeout: Duration,
    buf: Vec<u8>,
}

impl UdpSource {
    /// Bind to `port` on all interfaces.
    pub async fn bind(port: u16, timeout: Duration) -> Result<Self, SourceError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = UdpSocket::bind(addr).await?;
        info!("Listening for packets on udp://{}", addr);

        Ok(Self {
            socket,
            timeout,
            buf: vec![0u8; MAX_DATAGRAM_LEN],
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, SourceError> {
        Ok(self.socket.local_addr()?)
    }
}

impl PacketSource for UdpSource {
    async fn recv(&mut self) -> Result<Vec<u8>, SourceError> {
        let (len, peer) = timeout(self.timeout, self.socket.recv_from(&mut self.buf))
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))??;

        debug!("Received {} bytes from {}", len, peer);
        Ok(self.buf[..len].to_vec())
    }
}

/// Serves a fixed sequence of datagrams, then reports [`SourceError::Closed`].
#[derive(Debug, Default, Clone)]
pub struct ReplaySource {
    datagrams: VecDeque<Vec<u8>>,
}

impl ReplaySource {
    /// Create an empty replay source.
    pub fn new() -> Self {
        Self::default()
    }

    /// One datagram per non-empty line of `content`.
    pub fn from_lines(content: &str) -> Self {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.as_bytes().to_vec())
            .collect()
    }

    /// Load a capture file with one datagram per line.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let source = Self::from_lines(&content);
        info!(
            "Replaying {} packet(s) from {}",
            source.len(),
            path.as_ref().display()
        );
        Ok(source)
    }

    /// Queue another datagram.
    pub fn push(&mut self, datagram: impl Into<Vec<u8>>) {
        self.datagrams.push_back(datagram.into());
    }

    /// Number of datagrams still queued.
    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    /// Whether every datagram has been served.
    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }
}

impl<T: Into<Vec<u8>>> FromIterator<T> for ReplaySource {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            datagrams: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl PacketSource for ReplaySource {
    async fn recv(&mut self) -> Result<Vec<u8>, SourceError> {
        self.datagrams.pop_front().ok_or(SourceError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_serves_in_order_then_closes() {
        let mut source: ReplaySource = ["a", "b"].into_iter().collect();

        assert_eq!(source.recv().await.unwrap(), b"a".to_vec());
        assert_eq!(source.recv().await.unwrap(), b"b".to_vec());
        assert!(matches!(source.recv().await, Err(SourceError::Closed)));
    }

    #[test]
    fn test_replay_from_lines_skips_blank() {
        let source = ReplaySource::from_lines("{'EHZ', 1.0, 1}\n\n  \n{'EHZ', 1.25, 2}\n");
        assert_eq!(source.len(), 2);
    }

    #[tokio::test]
    async fn test_udp_source_receives_datagram() {
        let mut source = UdpSource::bind(0, Duration::from_secs(2)).await.unwrap();
        let port = source.local_addr().unwrap().port();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"{'EHZ', 1.0, 1}", ("127.0.0.1", port))
            .await
            .unwrap();

        assert_eq!(source.recv().await.unwrap(), b"{'EHZ', 1.0, 1}".to_vec());
    }

    #[tokio::test]
    async fn test_udp_source_times_out() {
        let mut source = UdpSource::bind(0, Duration::from_millis(20)).await.unwrap();
        assert!(matches!(source.recv().await, Err(SourceError::Timeout(_))));
    }
}
