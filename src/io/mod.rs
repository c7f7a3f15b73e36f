//! Fixed-layout wire formats, all big-endian except the handle.
//!
//! Every type here is a plain byte transform with no I/O of its own; the
//! session moves the bytes through a [`crate::channel::Channel`].

pub(crate) mod command_reply;
pub(crate) mod command_request;
pub(crate) mod handshake;
