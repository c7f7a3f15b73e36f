//! The client side of one NBD connection.
//!
//! A [`Session`] goes through `Disconnected -> Handshaking -> Ready -> Closed`:
//!
//! 1. [`Session::open`] connects (retrying while the server is not up yet) and
//!    reads the oldstyle greeting, validating every field.
//! 2. In the ready state it issues read, write, flush and discard commands,
//!    strictly one at a time. Each command carries a fresh handle that the
//!    acknowledgement must echo byte for byte.
//! 3. [`Session::close`] sends the disconnect command (which has no reply) and
//!    tears the transport down.
//!
//! [`Session::reconnect`] replaces the transport in place and insists that the
//! new handshake reports exactly the same size and flags as before.
//!
//! Nothing is retried once the session is ready. Any transport, timeout or
//! protocol error leaves the interrupted command marked as in flight, and every
//! later command fails with [`SessionError::CommandInFlight`] until the session
//! is reconnected.

use std::time::Duration;

use tracing::{debug, info};

use crate::channel::{Channel, DEFAULT_READ_TIMEOUT};
use crate::command_request::{CommandRequest, CommandType};
use crate::connect::{connect_with_retry, Connect, RetryPolicy};
use crate::errors::{ProtocolViolation, SessionError};
use crate::flags::TransmissionFlags;
use crate::io::command_reply::SimpleReplyRaw;
use crate::io::handshake::{self, FILLER_LEN, FLAGS_LEN, MAGIC_LEN, PASSWORD_LEN, SIZE_LEN};
use crate::rng::Lrand48;

/// Largest discard span servers were observed to accept in one command.
pub const MAX_DISCARD_CHUNK: u32 = 2_147_479_552;

/// Settings applied to every connection a session makes.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for each wait on the server.
    pub read_timeout: Duration,
    /// Log the negotiated export at info level instead of debug.
    pub verbose: bool,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            verbose: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Size and flags negotiated by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub size: u64,
    pub flags: TransmissionFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    AwaitingReply([u8; 8]),
    Closed,
}

/// An established NBD session over a transport supplied by `C`.
#[derive(Debug)]
pub struct Session<C>
where
    C: Connect,
{
    connector: C,
    config: SessionConfig,
    channel: Option<Channel<C::Stream>>,
    geometry: Geometry,
    state: State,
    handles: Lrand48,
}

impl<C> Session<C>
where
    C: Connect,
{
    /// Connects and performs the handshake, drawing handles from the default seed.
    pub async fn open(connector: C, config: SessionConfig) -> Result<Self, SessionError> {
        Self::open_with_rng(connector, config, Lrand48::default()).await
    }

    /// Like [`Session::open`], with an explicit handle generator.
    pub async fn open_with_rng(
        connector: C,
        config: SessionConfig,
        handles: Lrand48,
    ) -> Result<Self, SessionError> {
        let (channel, geometry) = establish(&connector, &config, config.verbose).await?;
        Ok(Self {
            connector,
            config,
            channel: Some(channel),
            geometry,
            state: State::Ready,
            handles,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Export size in bytes.
    pub fn size(&self) -> u64 {
        self.geometry.size
    }

    pub fn flags(&self) -> TransmissionFlags {
        self.geometry.flags
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Reads `buf.len()` bytes at `offset`.
    ///
    /// A zero-length read still waits for a full acknowledgement. On a non-zero
    /// status no payload follows and `buf` is left untouched.
    pub async fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), SessionError> {
        let length = request_length(buf.len())?;
        let handle = self.submit(CommandRequest::Read(offset, length), &[]).await?;
        let status = self.await_reply(handle).await?;

        if status == 0 && !buf.is_empty() {
            let channel = self.channel.as_mut().ok_or(SessionError::Closed)?;
            channel.recv_exact(buf, "data for read-command").await?;
        }
        self.complete(CommandType::Read, status)
    }

    /// Writes `data` at `offset`; the payload follows the header directly.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), SessionError> {
        let length = request_length(data.len())?;
        let handle = self.submit(CommandRequest::Write(offset, length), data).await?;
        let status = self.await_reply(handle).await?;
        self.complete(CommandType::Write, status)
    }

    pub async fn flush(&mut self) -> Result<(), SessionError> {
        let handle = self.submit(CommandRequest::Flush, &[]).await?;
        let status = self.await_reply(handle).await?;
        self.complete(CommandType::Flush, status)
    }

    /// Discards `length` bytes at `offset`.
    ///
    /// Spans are sent as given; callers split large ranges into pieces of at
    /// most [`MAX_DISCARD_CHUNK`].
    pub async fn discard(&mut self, offset: u64, length: u32) -> Result<(), SessionError> {
        let handle = self.submit(CommandRequest::Trim(offset, length), &[]).await?;
        let status = self.await_reply(handle).await?;
        self.complete(CommandType::Trim, status)
    }

    /// Sends the disconnect command and tears the transport down.
    ///
    /// The server does not acknowledge a disconnect, so nothing is awaited.
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.disconnect().await
    }

    /// Closes the connection, waits `settle_delay`, connects again and checks
    /// that the server still reports the same size and flags.
    pub async fn reconnect(&mut self, settle_delay: Duration) -> Result<(), SessionError> {
        info!(peer = %self.connector.peer(), "closing & reconnecting");
        self.disconnect().await?;

        tokio::time::sleep(settle_delay).await;

        // The export was already announced when the session opened
        let (channel, geometry) = establish(&self.connector, &self.config, false).await?;
        if geometry != self.geometry {
            return Err(SessionError::IdentityChanged {
                previous_size: self.geometry.size,
                size: geometry.size,
                previous_flags: self.geometry.flags,
                flags: geometry.flags,
            });
        }

        self.channel = Some(channel);
        self.state = State::Ready;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        let result = match self.state {
            State::Ready => self.submit(CommandRequest::Disconnect, &[]).await.map(|_| ()),
            // The stream is out of step with the server: just drop it
            State::AwaitingReply(_) | State::Closed => Ok(()),
        };

        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.shutdown().await {
                debug!(error = %e, "shutdown after disconnect failed");
            }
        }
        self.state = State::Closed;
        result
    }

    /// Sends one command header (and payload) with a fresh handle.
    async fn submit(
        &mut self,
        request: CommandRequest,
        payload: &[u8],
    ) -> Result<[u8; 8], SessionError> {
        match self.state {
            State::Ready => {}
            State::AwaitingReply(handle) => return Err(SessionError::CommandInFlight(handle)),
            State::Closed => return Err(SessionError::Closed),
        }
        let channel = self.channel.as_mut().ok_or(SessionError::Closed)?;

        let handle = self.handles.handle();
        let header = request.to_raw(handle).encode();
        debug!(?request, ?handle, "sending command");

        self.state = if request.expects_reply() {
            State::AwaitingReply(handle)
        } else {
            State::Closed
        };
        channel.send(&[&header[..], payload]).await?;
        Ok(handle)
    }

    /// Reads the acknowledgement for `handle` and returns its status.
    async fn await_reply(&mut self, handle: [u8; 8]) -> Result<u32, SessionError> {
        let channel = self.channel.as_mut().ok_or(SessionError::Closed)?;
        let reply: [u8; SimpleReplyRaw::LEN] = channel.recv_array("ack").await?;
        let (status, echoed) = SimpleReplyRaw::decode(&reply).validate()?;

        if echoed != handle {
            return Err(ProtocolViolation::HandleMismatch {
                expected: handle,
                found: echoed,
            }
            .into());
        }
        debug!(status, "received ack");
        Ok(status)
    }

    /// Marks the exchange finished and turns a non-zero status into a rejection.
    fn complete(&mut self, command: CommandType, status: u32) -> Result<(), SessionError> {
        self.state = State::Ready;
        if status != 0 {
            return Err(SessionError::Rejected { command, status });
        }
        Ok(())
    }
}

fn request_length(len: usize) -> Result<u32, SessionError> {
    u32::try_from(len).map_err(|_| SessionError::RequestTooLarge(len))
}

/// Connects and runs the handshake on the new stream.
///
/// `announce` logs the negotiated export at info instead of debug.
async fn establish<C>(
    connector: &C,
    config: &SessionConfig,
    announce: bool,
) -> Result<(Channel<C::Stream>, Geometry), SessionError>
where
    C: Connect,
{
    debug!(peer = %connector.peer(), "connecting");
    let stream = connect_with_retry(connector, &config.retry).await?;
    let mut channel = Channel::new(stream, config.read_timeout);
    let geometry = read_greeting(&mut channel).await?;

    let described = geometry.flags.describe().join(", ");
    if announce {
        info!(peer = %connector.peer(), size = geometry.size, flags = %described, "negotiated export");
    } else {
        debug!(peer = %connector.peer(), size = geometry.size, flags = %described, "negotiated export");
    }
    Ok((channel, geometry))
}

/// Reads and validates the 152 byte greeting, one timeout-guarded field at a time.
async fn read_greeting<S>(channel: &mut Channel<S>) -> Result<Geometry, SessionError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let password: [u8; PASSWORD_LEN] = channel.recv_array("password").await?;
    handshake::check_password(&password)?;

    let magic: [u8; MAGIC_LEN] = channel.recv_array("magic").await?;
    handshake::check_magic(&magic)?;

    let size: [u8; SIZE_LEN] = channel.recv_array("size").await?;
    let size = handshake::decode_size(&size)?;

    let flags: [u8; FLAGS_LEN] = channel.recv_array("flags").await?;
    let flags = handshake::decode_flags(&flags)?;

    let filler: [u8; FILLER_LEN] = channel.recv_array("filler").await?;
    handshake::check_filler(&filler)?;

    Ok(Geometry { size, flags })
}
