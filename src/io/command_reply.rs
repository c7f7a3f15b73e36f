/// NBD Command Reply Wire Format Implementation
///
/// This module handles the deserialization of NBD simple replies received by the
/// client during the transmission phase:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// # Wire Format
/// - 32 bits: Magic (0x67446698)
/// - 32 bits: Error (0 for success)
/// - 64 bits: Handle (echo of the request handle)
/// - [Data]: Reply data (only for successful read commands, read separately)
use crate::errors::ProtocolViolation;
use crate::magic::NBD_SIMPLE_REPLY_MAGIC;

/// Raw representation of a simple NBD reply header
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SimpleReplyRaw {
    pub(crate) magic: u32,
    pub(crate) error: u32,
    pub(crate) handle: [u8; 8],
}

impl SimpleReplyRaw {
    pub(crate) const LEN: usize = 16;

    pub(crate) fn decode(bytes: &[u8; Self::LEN]) -> Self {
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&bytes[8..16]);
        Self {
            magic: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            error: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            handle,
        }
    }

    #[cfg(test)]
    pub(crate) fn new(error: u32, handle: [u8; 8]) -> Self {
        Self {
            magic: NBD_SIMPLE_REPLY_MAGIC,
            error,
            handle,
        }
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0..4].copy_from_slice(&self.magic.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.error.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.handle);
        bytes
    }

    /// Checks the magic and returns `(status, handle)`.
    pub(crate) fn validate(&self) -> Result<(u32, [u8; 8]), ProtocolViolation> {
        if self.magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(ProtocolViolation::BadReplyMagic {
                found: self.magic,
                expected: NBD_SIMPLE_REPLY_MAGIC,
            });
        }
        Ok((self.error, self.handle))
    }
}
