/// NBD Oldstyle Handshake Wire Format Implementation
///
/// The server opens every connection with a fixed 152 byte greeting:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// # Wire Format
/// - 64 bits: "NBDMAGIC"
/// - 64 bits: 0x00420281861253 (oldstyle magic)
/// - 64 bits: Export size in bytes
/// - 32 bits: Export flags
/// - 124 bytes: Zeroes
///
/// Each field is read on its own so that every read can be gated by the
/// channel timeout; the functions here validate one field each.
use crate::errors::ProtocolViolation;
use crate::flags::TransmissionFlags;
use crate::magic::{NBD_CLISERV_MAGIC, NBD_MAGIC};

pub(crate) const PASSWORD_LEN: usize = 8;
pub(crate) const MAGIC_LEN: usize = 8;
pub(crate) const SIZE_LEN: usize = 8;
pub(crate) const FLAGS_LEN: usize = 4;
pub(crate) const FILLER_LEN: usize = 124;

/// Smallest export the client is willing to talk to.
pub(crate) const MIN_DEVICE_SIZE: u64 = 512;

pub(crate) fn check_password(field: &[u8; PASSWORD_LEN]) -> Result<(), ProtocolViolation> {
    if *field != NBD_MAGIC.to_be_bytes() {
        return Err(ProtocolViolation::BadPassword(*field));
    }
    Ok(())
}

pub(crate) fn check_magic(field: &[u8; MAGIC_LEN]) -> Result<(), ProtocolViolation> {
    let magic = u64::from_be_bytes(*field);
    if magic != NBD_CLISERV_MAGIC {
        return Err(ProtocolViolation::BadHandshakeMagic(magic));
    }
    Ok(())
}

pub(crate) fn decode_size(field: &[u8; SIZE_LEN]) -> Result<u64, ProtocolViolation> {
    let size = u64::from_be_bytes(*field);
    if size < MIN_DEVICE_SIZE {
        return Err(ProtocolViolation::DeviceTooSmall(size));
    }
    Ok(size)
}

pub(crate) fn decode_flags(field: &[u8; FLAGS_LEN]) -> Result<TransmissionFlags, ProtocolViolation> {
    TransmissionFlags::try_from(u32::from_be_bytes(*field)).map_err(ProtocolViolation::InvalidFlags)
}

pub(crate) fn check_filler(field: &[u8; FILLER_LEN]) -> Result<(), ProtocolViolation> {
    match field.iter().position(|&byte| byte != 0) {
        Some(position) => Err(ProtocolViolation::NonZeroFiller {
            position,
            value: field[position],
        }),
        None => Ok(()),
    }
}

/// Server side of the greeting, used by the in-memory test server.
#[cfg(test)]
pub(crate) fn encode(size: u64, flags: u32) -> Vec<u8> {
    let mut greeting = Vec::with_capacity(PASSWORD_LEN + MAGIC_LEN + SIZE_LEN + FLAGS_LEN + FILLER_LEN);
    greeting.extend_from_slice(&NBD_MAGIC.to_be_bytes());
    greeting.extend_from_slice(&NBD_CLISERV_MAGIC.to_be_bytes());
    greeting.extend_from_slice(&size.to_be_bytes());
    greeting.extend_from_slice(&flags.to_be_bytes());
    greeting.extend_from_slice(&[0u8; FILLER_LEN]);
    greeting
}
