//! Flag definitions for the NBD (Network Block Device) handshake.
//!
//! The oldstyle handshake ends with a 32-bit flags field describing the export.
//! Only the low six bits are defined for this negotiation style:
//!
//! - [`TransmissionFlags::HAS_FLAGS`]: MUST be set whenever any other bit is set
//! - [`TransmissionFlags::READ_ONLY`]: The export rejects writes
//! - [`TransmissionFlags::SEND_FLUSH`]: The server understands `NBD_CMD_FLUSH`
//! - [`TransmissionFlags::SEND_FUA`]: The server understands `NBD_CMD_FLAG_FUA`
//! - [`TransmissionFlags::ROTATIONAL`]: The export behaves like rotational media
//! - [`TransmissionFlags::SEND_TRIM`]: The server understands `NBD_CMD_TRIM` (discard)
//!
//! All flags are implemented using the [`bitflags`](https://docs.rs/bitflags) crate.
//!
//! # Examples
//!
//! ```
//! use tokio_nbd_verify::flags::TransmissionFlags;
//!
//! let flags = TransmissionFlags::try_from(0b0010_0101).unwrap();
//! assert!(flags.contains(TransmissionFlags::SEND_TRIM));
//!
//! // Bit 0 is mandatory as soon as any capability is advertised
//! assert!(TransmissionFlags::try_from(0b0000_0100).is_err());
//! ```

/// Bit values of the handshake flags field.
mod flag_bits {
    /// MUST always be 1 when any other flag is present.
    pub(crate) const HAS_FLAGS: u32 = 0b00000001;

    /// Indicates the export is read-only. If set, the server MUST error on write operations.
    pub(crate) const READ_ONLY: u32 = 0b00000010;

    /// Exposes support for `NBD_CMD_FLUSH`.
    pub(crate) const SEND_FLUSH: u32 = 0b00000100;

    /// Exposes support for `NBD_CMD_FLAG_FUA` (Force Unit Access).
    pub(crate) const SEND_FUA: u32 = 0b00001000;

    /// The export has characteristics of a rotational medium.
    pub(crate) const ROTATIONAL: u32 = 0b00010000;

    /// Exposes support for `NBD_CMD_TRIM`.
    pub(crate) const SEND_TRIM: u32 = 0b00100000;
}

bitflags::bitflags! {
    /// Export flags sent by the server at the end of the oldstyle handshake.
    ///
    /// A value is valid when it is zero, or when `HAS_FLAGS` is set and no bit
    /// above `SEND_TRIM` is set. Anything else is a protocol violation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransmissionFlags: u32 {
        const HAS_FLAGS = flag_bits::HAS_FLAGS;
        const READ_ONLY = flag_bits::READ_ONLY;
        const SEND_FLUSH = flag_bits::SEND_FLUSH;
        const SEND_FUA = flag_bits::SEND_FUA;
        const ROTATIONAL = flag_bits::ROTATIONAL;
        const SEND_TRIM = flag_bits::SEND_TRIM;
    }
}

impl TryFrom<u32> for TransmissionFlags {
    type Error = u32;

    /// Attempts to convert the raw handshake field into TransmissionFlags.
    ///
    /// # Returns
    /// - `Ok(TransmissionFlags)` if the value is zero, or has `HAS_FLAGS` set and only defined bits
    /// - `Err(value)` otherwise
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value == 0 {
            return Ok(Self::empty());
        }
        if value & flag_bits::HAS_FLAGS == 0 {
            return Err(value);
        }
        Self::from_bits(value).ok_or(value)
    }
}

impl TransmissionFlags {
    /// Human readable names of the capabilities that are set.
    pub fn describe(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::HAS_FLAGS) {
            names.push("has flags");
        }
        if self.contains(Self::READ_ONLY) {
            names.push("is R/O");
        }
        if self.contains(Self::SEND_FLUSH) {
            names.push("supports flush");
        }
        if self.contains(Self::SEND_FUA) {
            names.push("supports fua");
        }
        if self.contains(Self::ROTATIONAL) {
            names.push("is rotational media");
        }
        if self.contains(Self::SEND_TRIM) {
            names.push("supports trim");
        }
        names
    }
}
