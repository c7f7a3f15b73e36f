//! Timeout-bounded duplex channel.
//!
//! Wraps a connected byte stream so that no protocol read can block longer than
//! the configured deadline. Reads go through [`Channel::recv_exact`], which always
//! waits for readability first; there is no way to read from an unready stream.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::trace;

use crate::errors::SessionError;

/// Deadline used when nothing else is configured.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of waiting for the stream to become readable.
#[derive(Debug)]
pub enum Readiness {
    /// Data (or end of stream) is available without blocking.
    Ready,
    TimedOut,
    Error(io::Error),
}

/// A connected stream with a per-wait deadline.
#[derive(Debug)]
pub struct Channel<S> {
    stream: BufReader<S>,
    read_timeout: Duration,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            read_timeout,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Blocks until the stream has data, the deadline passes, or it fails.
    ///
    /// Interrupted waits are retried and never surfaced. End of stream counts as
    /// readable; the read that follows reports it as a short read.
    pub async fn await_readable(&mut self) -> Readiness {
        self.await_readable_until(Instant::now() + self.read_timeout)
            .await
    }

    async fn await_readable_until(&mut self, deadline: Instant) -> Readiness {
        loop {
            let waited = timeout_at(deadline, self.stream.fill_buf())
                .await
                .map(|filled| filled.map(|buffered| buffered.len()));

            match waited {
                Err(_) => return Readiness::TimedOut,
                Ok(Ok(buffered)) => {
                    trace!(buffered, "channel readable");
                    return Readiness::Ready;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Readiness::Error(e),
            }
        }
    }

    /// Waits for readability, then fills `buf` completely.
    ///
    /// `waiting_for` names the field in timeout errors. The whole field shares
    /// one deadline, and a stream that stalls halfway through it is reported as
    /// a timeout as well.
    pub async fn recv_exact(
        &mut self,
        buf: &mut [u8],
        waiting_for: &'static str,
    ) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.read_timeout;
        match self.await_readable_until(deadline).await {
            Readiness::Ready => {}
            Readiness::TimedOut => return Err(SessionError::Timeout { waiting_for }),
            Readiness::Error(e) => return Err(SessionError::Transport(e)),
        }

        match timeout_at(deadline, self.stream.read_exact(buf)).await {
            Err(_) => Err(SessionError::Timeout { waiting_for }),
            Ok(Err(e)) => Err(SessionError::Transport(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Reads a fixed-size field.
    pub async fn recv_array<const N: usize>(
        &mut self,
        waiting_for: &'static str,
    ) -> Result<[u8; N], SessionError> {
        let mut field = [0u8; N];
        self.recv_exact(&mut field, waiting_for).await?;
        Ok(field)
    }

    /// Writes every buffer in order and flushes, bounded by the same deadline.
    pub async fn send(&mut self, parts: &[&[u8]]) -> Result<(), SessionError> {
        let deadline = self.read_timeout;
        let writer = self.stream.get_mut();
        let write_all = async move {
            for part in parts {
                if !part.is_empty() {
                    writer.write_all(part).await?;
                }
            }
            writer.flush().await
        };

        match timeout(deadline, write_all).await {
            Err(_) => Err(SessionError::Timeout {
                waiting_for: "write to complete",
            }),
            Ok(result) => result.map_err(SessionError::Transport),
        }
    }

    /// Shuts the write side down; the stream is dropped with the channel.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.get_mut().shutdown().await
    }
}
