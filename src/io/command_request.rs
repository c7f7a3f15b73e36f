/// NBD Command Request Wire Format Implementation
///
/// This module handles the serialization of NBD command requests sent by the
/// client during the transmission phase:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// # Wire Format
/// - 32 bits: Magic (0x25609513)
/// - 32 bits: Command type
/// - 64 bits: Handle (copied verbatim, no byte order conversion)
/// - 64 bits: Offset
/// - 32 bits: Length
/// - [Data]: Command data (only for write commands, sent separately)
use crate::magic::NBD_REQUEST_MAGIC;

/// Raw representation of an NBD command request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandRequestRaw {
    pub(crate) magic: u32,
    pub(crate) command_type: u32,
    pub(crate) handle: [u8; 8],
    pub(crate) offset: u64,
    pub(crate) length: u32,
}

impl CommandRequestRaw {
    pub(crate) const LEN: usize = 28;

    pub(crate) fn new(command_type: u32, handle: [u8; 8], offset: u64, length: u32) -> Self {
        Self {
            magic: NBD_REQUEST_MAGIC,
            command_type,
            handle,
            offset,
            length,
        }
    }

    pub(crate) fn encode(&self) -> [u8; Self::LEN] {
        let mut header = [0u8; Self::LEN];
        header[0..4].copy_from_slice(&self.magic.to_be_bytes());
        header[4..8].copy_from_slice(&self.command_type.to_be_bytes());
        header[8..16].copy_from_slice(&self.handle);
        header[16..24].copy_from_slice(&self.offset.to_be_bytes());
        header[24..28].copy_from_slice(&self.length.to_be_bytes());
        header
    }

    #[cfg(test)]
    pub(crate) fn decode(bytes: &[u8; Self::LEN]) -> Self {
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&bytes[8..16]);
        Self {
            magic: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            command_type: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            handle,
            offset: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
            length: u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let raw = CommandRequestRaw::new(
            1,
            [0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8],
            0x0000_0001_0000_1000,
            4096,
        );

        let bytes = raw.encode();
        assert_eq!(&bytes[0..4], &[0x25, 0x60, 0x95, 0x13]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
        // The handle goes out exactly as stored
        assert_eq!(&bytes[8..16], &[0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8]);
        assert_eq!(&bytes[16..24], &[0, 0, 0, 1, 0, 0, 0x10, 0]);
        assert_eq!(&bytes[24..28], &[0, 0, 0x10, 0]);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let raw = CommandRequestRaw::new(4, [9; 8], u64::MAX - 2047, 0x7fff_f000);
        assert_eq!(CommandRequestRaw::decode(&raw.encode()), raw);
    }
}
