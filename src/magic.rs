/// NBD Protocol Magic Numbers
///
/// This module contains the magic numbers used by the oldstyle NBD handshake and the
/// simple request/reply framing of the transmission phase:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// Magic numbers are used to identify different parts of the NBD protocol,
/// ensure message integrity, and detect protocol version.

/// Initial handshake identifier (ASCII "NBDMAGIC")
pub(crate) const NBD_MAGIC: u64 = 0x4e42444d41474943;

/// Oldstyle negotiation magic, sent right after "NBDMAGIC"
pub(crate) const NBD_CLISERV_MAGIC: u64 = 0x0000420281861253;

/// NBD Request Magic value from protocol specification
pub(crate) const NBD_REQUEST_MAGIC: u32 = 0x25609513;

/// Simple reply magic, first field of every acknowledgement
pub(crate) const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
