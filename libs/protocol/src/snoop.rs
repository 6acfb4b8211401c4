//! Connection parameter snooping.

use crate::{DecodeError, DecodeResult, FrameLimits};

/// Virtual host used when a handshake does not name one.
pub const DEFAULT_VIRTUAL_HOST: &str = "default";

/// Routing information extracted from a client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Name of the identified protocol.
    pub protocol: String,
    /// Target virtual host, defaulted when the handshake did not carry one.
    pub virtual_host: String,
    /// Authenticated or declared user name, if the handshake carried one.
    pub user: Option<String>,
    /// Protocol-level client identifier (MQTT client id).
    pub client_id: Option<String>,
}

impl ConnectionParameters {
    pub fn new(protocol: impl Into<String>, virtual_host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            virtual_host: virtual_host.into(),
            user: None,
            client_id: None,
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user.filter(|u| !u.is_empty());
        self
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id.filter(|c| !c.is_empty());
        self
    }
}

/// Options shared by all snoopers.
#[derive(Debug, Clone)]
pub struct SnoopOptions {
    pub limits: FrameLimits,
    pub default_virtual_host: String,
}

impl Default for SnoopOptions {
    fn default() -> Self {
        Self {
            limits: FrameLimits::default(),
            default_virtual_host: DEFAULT_VIRTUAL_HOST.to_string(),
        }
    }
}

impl SnoopOptions {
    /// Pick the handshake's virtual host, or the default when absent or empty.
    pub(crate) fn virtual_host_or_default(&self, host: Option<&str>) -> String {
        match host.map(str::trim) {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => self.default_virtual_host.clone(),
        }
    }
}

/// Bytes the backend will send that the gateway already answered on its
/// behalf while snooping. They must be dropped before relaying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendPrelude {
    /// Fixed-size bytes at the start of the backend stream.
    pub fixed_bytes: usize,
    /// Frames following those bytes, each prefixed by a 4-byte big-endian
    /// length that includes the prefix itself.
    pub length_prefixed_frames: usize,
}

impl BackendPrelude {
    pub const NONE: BackendPrelude = BackendPrelude {
        fixed_bytes: 0,
        length_prefixed_frames: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.fixed_bytes == 0 && self.length_prefixed_frames == 0
    }
}

/// A resumable handshake snooper for one connection.
pub trait Snooper: Send {
    /// Feed the next chunk of client bytes.
    ///
    /// Any reply the protocol mandates before the client will continue is
    /// appended to `reply`; the caller must write it to the client before
    /// waiting for more bytes. Returns `Ok(None)` until the parameters are
    /// known. A snooper must not be fed again after it returned an error or
    /// parameters.
    fn feed(&mut self, data: &[u8], reply: &mut Vec<u8>) -> DecodeResult<ConnectionParameters>;

    /// What to discard from the backend before relaying.
    fn backend_prelude(&self) -> BackendPrelude {
        BackendPrelude::NONE
    }
}

pub(crate) fn utf8(bytes: &[u8], what: &str) -> Result<String, DecodeError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| DecodeError::Malformed(format!("{what} is not valid UTF-8")))
}
