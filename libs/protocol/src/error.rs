//! Decode errors.

use thiserror::Error;

/// Errors produced while decoding a handshake prefix.
///
/// Limit violations carry the configured limit so operators can tell which
/// knob a misbehaving client ran into.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A command line exceeded `max_line_length`.
    #[error("command line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// More header lines than `max_headers`.
    #[error("frame has more than {limit} headers")]
    TooManyHeaders { limit: usize },

    /// A header line exceeded `max_header_length`.
    #[error("header line exceeds {limit} bytes")]
    HeaderTooLong { limit: usize },

    /// A header line without a `:` separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// A length header that is not a non-negative integer.
    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    /// A declared body or frame length above `max_body_length`.
    #[error("declared length {declared} exceeds limit of {limit} bytes")]
    BodyTooLarge { declared: u64, limit: usize },

    /// A body without a declared length grew past `max_body_length`.
    #[error("undelimited body exceeds limit of {limit} bytes")]
    UndelimitedBodyTooLarge { limit: usize },

    /// The byte after a length-delimited body was not the frame terminator.
    #[error("frame terminator missing after body")]
    MissingTerminator,

    /// A well-formed frame that cannot open a session.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// Structurally invalid input.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Valid input asking for something the gateway does not route.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DecodeError {
    /// Short, stable label for logs and counters.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DecodeError::LineTooLong { .. } => "line_too_long",
            DecodeError::TooManyHeaders { .. } => "too_many_headers",
            DecodeError::HeaderTooLong { .. } => "header_too_long",
            DecodeError::MalformedHeader(_) => "malformed_header",
            DecodeError::InvalidContentLength(_) => "invalid_content_length",
            DecodeError::BodyTooLarge { .. } => "body_too_large",
            DecodeError::UndelimitedBodyTooLarge { .. } => "body_too_large",
            DecodeError::MissingTerminator => "missing_terminator",
            DecodeError::UnexpectedFrame(_) => "unexpected_frame",
            DecodeError::Malformed(_) => "malformed",
            DecodeError::Unsupported(_) => "unsupported",
        }
    }
}
