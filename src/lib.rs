//! Conformance and performance test client for Network Block Device (NBD) servers.
//!
//! This crate speaks the client side of the oldstyle NBD protocol and drives
//! servers through a fixed set of checks:
//!
//! - [`session::Session`]: One connection, handshake validation, and strictly
//!   sequential read, write, flush and discard commands
//! - [`harness::Verifier`]: Ordered conformance scenarios (boundary offsets,
//!   random and dedup fills, sub-block writes, discard, invalid offsets)
//! - [`bench`]: IOPS and latency loops built on the same session
//!
//! # Protocol Compliance
//!
//! The wire format follows the oldstyle handshake and simple replies described at
//! [NetworkBlockDevice/nbd](https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md).
//! Only one command is ever outstanding per connection.
//!
//! # Reproducibility
//!
//! Block choices, block contents and command handles come from a fixed-seed
//! [`rng::Lrand48`], so a failing run fails the same way the next time.

pub mod bench;
pub mod channel;
mod command_request;
pub mod connect;
pub mod errors;
pub mod fixture;
pub mod flags;
pub mod harness;
mod io;
mod magic;
pub mod rng;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use command_request::CommandType;
