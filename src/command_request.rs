/// NBD Command Request Implementation
///
/// This module defines the commands the client sends during the NBD transmission phase
/// according to the protocol specification:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// Only the commands of the oldstyle, simple-reply protocol are used: read, write,
/// disconnect, flush and trim (discard).
use int_enum::IntEnum;

use crate::io::command_request::CommandRequestRaw;

/// Command types used in the NBD transmission phase.
///
/// Values correspond to the command type field in the NBD protocol.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub enum CommandType {
    /// Read data from device (offset, length)
    Read = 0,

    /// Write data to device (offset, data)
    Write = 1,

    /// Terminate the connection, the server sends no reply
    Disconnect = 2,

    /// Flush data to persistent storage
    Flush = 3,

    /// Discard/punch hole (offset, length)
    Trim = 4,
}

/// NBD command requests for the transmission phase.
///
/// Write carries only the payload length; the payload itself follows the
/// header on the wire and is sent by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandRequest {
    /// Read from device: (offset, length)
    Read(u64, u32),

    /// Write to device: (offset, length)
    Write(u64, u32),

    /// Terminate the connection
    Disconnect,

    /// Flush data to persistent storage
    Flush,

    /// Discard/punch hole: (offset, length)
    Trim(u64, u32),
}

impl CommandRequest {
    pub(crate) fn command_type(&self) -> CommandType {
        match self {
            Self::Read(..) => CommandType::Read,
            Self::Write(..) => CommandType::Write,
            Self::Disconnect => CommandType::Disconnect,
            Self::Flush => CommandType::Flush,
            Self::Trim(..) => CommandType::Trim,
        }
    }

    /// Whether the server answers this command with an acknowledgement.
    pub(crate) fn expects_reply(&self) -> bool {
        !matches!(self, Self::Disconnect)
    }

    pub(crate) fn to_raw(self, handle: [u8; 8]) -> CommandRequestRaw {
        let (offset, length) = match self {
            Self::Read(offset, length) | Self::Write(offset, length) | Self::Trim(offset, length) => {
                (offset, length)
            }
            Self::Disconnect | Self::Flush => (0, 0),
        };
        CommandRequestRaw::new(self.command_type().into(), handle, offset, length)
    }
}

/// Server-side parsing, used by the in-memory test server.
#[cfg(test)]
impl TryFrom<&CommandRequestRaw> for CommandRequest {
    type Error = crate::errors::ReplyError;

    fn try_from(command_raw: &CommandRequestRaw) -> Result<Self, Self::Error> {
        use crate::errors::ReplyError;
        use crate::magic::NBD_REQUEST_MAGIC;

        if command_raw.magic != NBD_REQUEST_MAGIC {
            return Err(ReplyError::InvalidArgument);
        }

        let command_type = CommandType::try_from(command_raw.command_type)
            .map_err(|_| ReplyError::CommandNotSupported)?;

        let offset = command_raw.offset;
        let length = command_raw.length;

        Ok(match command_type {
            CommandType::Read => Self::Read(offset, length),
            CommandType::Write => Self::Write(offset, length),
            CommandType::Disconnect => Self::Disconnect,
            CommandType::Flush => Self::Flush,
            CommandType::Trim => Self::Trim(offset, length),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ReplyError;

    #[test]
    fn test_command_type_conversion() {
        assert_eq!(CommandType::Read as u32, 0);
        assert_eq!(CommandType::Write as u32, 1);
        assert_eq!(CommandType::Disconnect as u32, 2);
        assert_eq!(CommandType::Flush as u32, 3);
        assert_eq!(CommandType::Trim as u32, 4);

        match CommandType::try_from(3u32) {
            Ok(cmd_type) => assert!(matches!(cmd_type, CommandType::Flush)),
            Err(_) => panic!("Failed to convert 3 to CommandType::Flush"),
        }

        // Cache, write zeroes and friends are not part of this protocol
        assert!(CommandType::try_from(5u32).is_err());
        assert!(CommandType::try_from(99u32).is_err());
    }

    #[test]
    fn test_to_raw_read() {
        let raw = CommandRequest::Read(1024, 512).to_raw([7; 8]);
        assert_eq!(raw.command_type, 0);
        assert_eq!(raw.handle, [7; 8]);
        assert_eq!(raw.offset, 1024);
        assert_eq!(raw.length, 512);
    }

    #[test]
    fn test_to_raw_flush_and_disconnect_are_empty() {
        for command in [CommandRequest::Flush, CommandRequest::Disconnect] {
            let raw = command.to_raw([1; 8]);
            assert_eq!(raw.offset, 0);
            assert_eq!(raw.length, 0);
        }
        assert!(!CommandRequest::Disconnect.expects_reply());
        assert!(CommandRequest::Flush.expects_reply());
    }

    #[test]
    fn test_try_from_raw_valid_trim() {
        let raw = CommandRequest::Trim(4096, 2_147_479_552).to_raw([0; 8]);
        assert_eq!(
            CommandRequest::try_from(&raw),
            Ok(CommandRequest::Trim(4096, 2_147_479_552))
        );
    }

    #[test]
    fn test_try_from_raw_invalid_magic() {
        let mut raw = CommandRequest::Read(0, 512).to_raw([0; 8]);
        raw.magic = 0x12345678;
        assert_eq!(
            CommandRequest::try_from(&raw),
            Err(ReplyError::InvalidArgument)
        );
    }

    #[test]
    fn test_try_from_raw_unsupported_command() {
        let mut raw = CommandRequest::Read(0, 512).to_raw([0; 8]);
        raw.command_type = 99;
        assert_eq!(
            CommandRequest::try_from(&raw),
            Err(ReplyError::CommandNotSupported)
        );
    }
}
