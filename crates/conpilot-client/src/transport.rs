//! Transport connectors.
//!
//! The client never opens sockets itself; it asks a [`Connector`] for a
//! fresh byte stream on every connect and reconnect. Production code uses
//! [`TcpConnector`] to reach a serial-to-network gateway, tests plug in
//! in-memory or scripted streams.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A bidirectional console byte stream.
pub trait ConsoleStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ConsoleStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased console stream.
pub type BoxedStream = Box<dyn ConsoleStream>;

/// Opens console transport sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new session. Called once per connect or reconnect.
    async fn connect(&self) -> io::Result<BoxedStream>;

    /// Human-readable endpoint, used in logs and errors.
    fn endpoint(&self) -> String;
}

/// Connects to a telnet console gateway over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        debug!(host = %self.host, port = self.port, "Opening TCP console session");

        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            )
        })??;

        // Console traffic is small interactive writes
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello\n").await.unwrap();
        });

        let connector = TcpConnector::new("127.0.0.1", port, Duration::from_secs(1));
        assert_eq!(connector.endpoint(), format!("127.0.0.1:{port}"));

        let mut stream = connector.connect().await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(connector.connect().await.is_err());
    }
}
