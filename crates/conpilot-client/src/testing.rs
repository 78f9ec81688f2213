//! In-memory connectors for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::DuplexStream;

use crate::transport::{BoxedStream, Connector};

/// Hands out pre-made duplex streams in order, refusing once they run out.
pub(crate) struct DuplexConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
    connects: AtomicU64,
    hang_when_empty: bool,
}

impl DuplexConnector {
    pub(crate) fn new(streams: Vec<DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            connects: AtomicU64::new(0),
            hang_when_empty: false,
        }
    }

    /// Like `new`, but once the streams run out every connect blocks
    /// forever, the way an unreachable gateway swallows SYNs.
    pub(crate) fn hanging_after(streams: Vec<DuplexStream>) -> Self {
        Self {
            hang_when_empty: true,
            ..Self::new(streams)
        }
    }

    /// Number of connect attempts, successful or not.
    pub(crate) fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(stream) => Ok(Box::new(stream)),
            None if self.hang_when_empty => std::future::pending().await,
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no more streams",
            )),
        }
    }

    fn endpoint(&self) -> String {
        "duplex".to_string()
    }
}

/// Server halves paired with a connector that hands out the client halves.
pub(crate) fn duplex_pairs(count: usize) -> (DuplexConnector, Vec<DuplexStream>) {
    let (clients, servers): (Vec<_>, Vec<_>) =
        (0..count).map(|_| tokio::io::duplex(4096)).unzip();
    (DuplexConnector::new(clients), servers)
}
