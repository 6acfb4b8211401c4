//! Protocol identification and handshake snooping for the messaging gateway.
//!
//! This library is I/O free. Everything is driven by feeding byte chunks of
//! any size into a decoder or snooper, which makes the state machines
//! resumable and testable without sockets.
//!
//! - [`ProtocolSet`] identifies which wire protocol a client speaks
//! - [`stomp`], [`amqp`] and [`mqtt`] hold the incremental decoders
//! - [`Snooper`] extracts [`ConnectionParameters`] from a handshake prefix

pub mod amqp;
mod descriptor;
mod error;
mod limits;
pub mod mqtt;
mod snoop;
pub mod stomp;

pub use descriptor::{builtin, Identification, Protocol, ProtocolSet, BUILTIN_PROTOCOLS};
pub use error::DecodeError;
pub use limits::{
    FrameLimits, DEFAULT_MAX_BODY_LENGTH, DEFAULT_MAX_HEADERS, DEFAULT_MAX_HEADER_LENGTH,
    DEFAULT_MAX_LINE_LENGTH,
};
pub use snoop::{BackendPrelude, ConnectionParameters, SnoopOptions, Snooper, DEFAULT_VIRTUAL_HOST};

/// Result of feeding bytes into an incremental decoder.
///
/// `Ok(None)` means more bytes are needed; nothing has been lost.
pub type DecodeResult<T> = Result<Option<T>, DecodeError>;
