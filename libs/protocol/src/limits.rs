/// Default maximum length of a command line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Default maximum number of headers per frame.
pub const DEFAULT_MAX_HEADERS: usize = 64;

/// Default maximum length of one header line.
pub const DEFAULT_MAX_HEADER_LENGTH: usize = 8192;

/// Default maximum body (or whole frame, for binary protocols) length.
pub const DEFAULT_MAX_BODY_LENGTH: usize = 1024 * 1024;

/// Limits enforced by every decoder.
///
/// Exceeding any of them is a hard decode error, never a truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_line_length: usize,
    pub max_headers: usize,
    pub max_header_length: usize,
    pub max_body_length: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_headers: DEFAULT_MAX_HEADERS,
            max_header_length: DEFAULT_MAX_HEADER_LENGTH,
            max_body_length: DEFAULT_MAX_BODY_LENGTH,
        }
    }
}
