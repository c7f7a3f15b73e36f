//! Error types for the NBD (Network Block Device) test client.
//!
//! This module defines the error types used by the protocol session:
//!
//! - [`ReplyError`]: Well-known error codes a server puts into an acknowledgement
//! - [`ProtocolViolation`]: The server sent something the protocol does not allow
//! - [`SessionError`]: Everything a session operation can fail with
//!
//! `SessionError` keeps transport failures, timeouts, protocol violations and
//! application-level rejections apart, so that callers can assert that a command
//! was *rejected* rather than treating every failure as a crash.
//!
//! # Examples
//!
//! ```
//! use tokio_nbd_verify::errors::{ReplyError, SessionError};
//! use tokio_nbd_verify::CommandType;
//!
//! let error = SessionError::Rejected { command: CommandType::Write, status: 22 };
//! assert!(error.is_rejection());
//! assert_eq!(ReplyError::try_from(22u32).ok(), Some(ReplyError::InvalidArgument));
//! ```

use std::fmt;
use std::io;

use int_enum::IntEnum;
use thiserror::Error;

use crate::command_request::CommandType;
use crate::flags::TransmissionFlags;

/// Errors a server reports in the status field of an acknowledgement.
///
/// These errors correspond to the standard NBD error codes defined in the protocol
/// specification. Servers may send codes outside this list; those are still
/// surfaced through [`SessionError::Rejected`] as raw numbers.
///
/// The error codes follow POSIX errno values where possible, as per the NBD protocol
/// specification.
#[repr(u32)]
#[derive(Debug, Error, IntEnum, PartialEq, Eq, Clone, Copy)]
pub enum ReplyError {
    /// Corresponds to POSIX EPERM (1) and NBD_EPERM.
    #[error("Command not permitted (NBD_EPERM)")]
    CommandNotPermitted = 1,

    /// Corresponds to POSIX EIO (5) and NBD_EIO.
    #[error("Input/output error (NBD_EIO)")]
    IO = 5,

    /// Corresponds to POSIX ENOMEM (12) and NBD_ENOMEM.
    #[error("Cannot allocate memory (NBD_ENOMEM)")]
    OutOfMemory = 12,

    /// Typically sent for offsets or lengths outside the export.
    ///
    /// Corresponds to POSIX EINVAL (22) and NBD_EINVAL.
    #[error("Invalid argument (NBD_EINVAL)")]
    InvalidArgument = 22,

    /// Corresponds to POSIX ENOSPC (28) and NBD_ENOSPC.
    #[error("No space left on device (NBD_ENOSPC)")]
    NoSpaceLeft = 28,

    /// Corresponds to POSIX EOVERFLOW (75) and NBD_EOVERFLOW.
    #[error("Value too large (NBD_EOVERFLOW)")]
    ValueTooLarge = 75,

    /// Corresponds to POSIX ENOTSUP (95) and NBD_ENOTSUP.
    #[error("Command not supported (NBD_ENOTSUP)")]
    CommandNotSupported = 95,

    /// Corresponds to POSIX ESHUTDOWN (108) and NBD_ESHUTDOWN.
    #[error("Server is in the process of being shut down (NBD_ESHUTDOWN)")]
    ServerShuttingDown = 108,
}

/// Printable form of a raw acknowledgement status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u32);

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ReplyError::try_from(self.0) {
            Ok(known) => write!(f, "{} ({})", self.0, known),
            Err(_) => write!(f, "{}", self.0),
        }
    }
}

/// The server broke the wire protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("password mismatch: expected \"NBDMAGIC\", got {0:02x?}")]
    BadPassword([u8; 8]),

    #[error("handshake magic mismatch: got {0:016x}")]
    BadHandshakeMagic(u64),

    #[error("strange device size {0} (must be at least 512 bytes)")]
    DeviceTooSmall(u64),

    #[error("invalid value for flags {0:04x}")]
    InvalidFlags(u32),

    #[error("encountered non-zero value {value:02x} in filler at byte {position}")]
    NonZeroFiller { position: usize, value: u8 },

    #[error("ack magic wrong {found:08x} (expected: {expected:08x})")]
    BadReplyMagic { found: u32, expected: u32 },

    #[error("handle incorrect: expected {expected:02x?}, got {found:02x?}")]
    HandleMismatch { expected: [u8; 8], found: [u8; 8] },
}

/// Errors returned by [`crate::session::Session`] operations.
///
/// Nothing is retried internally: every variant aborts the current operation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connect, read or write failure, including short reads and writes.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// No data arrived within the configured read timeout.
    #[error("timeout waiting for {waiting_for}: nbd-server hanging or not sending data?")]
    Timeout { waiting_for: &'static str },

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// A well-formed acknowledgement carried a non-zero status.
    #[error("server rejected {command:?} with status {}", describe_status(.status))]
    Rejected { command: CommandType, status: u32 },

    /// A reconnect negotiated a different export than before.
    #[error(
        "device changed across reconnect: size {previous_size} -> {size}, flags {previous_flags:?} -> {flags:?}"
    )]
    IdentityChanged {
        previous_size: u64,
        size: u64,
        previous_flags: TransmissionFlags,
        flags: TransmissionFlags,
    },

    /// A command was issued while a previous one never received its ack.
    #[error("command issued while handle {0:02x?} is still awaiting its ack")]
    CommandInFlight([u8; 8]),

    /// A read or write buffer longer than the 32-bit length field allows.
    #[error("request of {0} bytes does not fit a single command")]
    RequestTooLarge(usize),

    #[error("session is closed")]
    Closed,
}

fn describe_status(status: &u32) -> Status {
    Status(*status)
}

impl SessionError {
    /// True for a well-formed, non-zero acknowledgement.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// The raw status of a rejection.
    pub fn status(&self) -> Option<u32> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
