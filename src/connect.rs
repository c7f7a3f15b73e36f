//! How a session obtains its transport.
//!
//! [`Connect`] is the seam between the protocol session and the network: the
//! session only needs "give me a fresh duplex stream", which lets reconnects and
//! tests swap in other transports. [`TcpConnector`] is the production implementation.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Source of fresh connections to one NBD server.
pub trait Connect {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    /// Opens a new connection; one attempt, no retries.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>>;

    /// Printable peer description for logs.
    fn peer(&self) -> String;
}

/// Connects to `host:port` over TCP with Nagle disabled.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connect for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        // One small request at a time: never wait for Nagle
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Backoff used while the server is not accepting connections yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` keeps trying until the connection succeeds or the caller cancels.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (0-based), doubling up to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Connects, retrying with exponential backoff according to `policy`.
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn connect_with_retry<C>(connector: &C, policy: &RetryPolicy) -> io::Result<C::Stream>
where
    C: Connect,
{
    let mut attempt: u32 = 0;
    loop {
        match connector.connect().await {
            Ok(stream) => {
                debug!(peer = %connector.peer(), attempt, "connected");
                return Ok(stream);
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(e);
                }

                let delay = policy.delay_for(attempt - 1);
                if attempt == 1 {
                    warn!(peer = %connector.peer(), error = %e, "server not reachable yet, retrying");
                } else {
                    debug!(peer = %connector.peer(), error = %e, attempt, ?delay, "connect failed");
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
