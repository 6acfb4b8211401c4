//! STOMP frame decoding.
//!
//! Frames are line oriented:
//!
//! ```text
//! COMMAND EOL
//! header:value EOL
//! ...
//! EOL
//! body NUL
//! ```
//!
//! The decoder is an explicit state machine (command, headers, body). Each
//! state reads up to its terminator and hands over to the next; when the
//! terminator has not arrived yet, the state is kept and `Ok(None)` is
//! returned. Output is identical no matter how the input is chunked.

use bytes::{Buf, Bytes, BytesMut};

use crate::snoop::utf8;
use crate::{
    ConnectionParameters, DecodeError, DecodeResult, FrameLimits, Protocol, SnoopOptions, Snooper,
};

const NAME: &str = "stomp";

/// Header carrying the body length.
pub const CONTENT_LENGTH: &str = "content-length";

/// A decoded STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    /// Headers in wire order, repeats included.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StompFrame {
    /// First value of a header. Repeated headers keep their first value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct PartialFrame {
    command: String,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
}

#[derive(Debug)]
enum State {
    Command,
    Headers(PartialFrame),
    Body(PartialFrame),
}

#[derive(Debug, Clone, Copy)]
enum LineKind {
    Command,
    Header,
}

/// Incremental STOMP frame decoder.
///
/// Reusable across frames: after a frame is emitted it starts over with the
/// next command. Bytes past the end of a frame stay buffered and are
/// decoded by the next call, which may pass an empty slice.
#[derive(Debug)]
pub struct StompDecoder {
    limits: FrameLimits,
    buffer: BytesMut,
    state: State,
    // Bytes at the front of `buffer` already searched for a terminator.
    scanned: usize,
}

impl StompDecoder {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            buffer: BytesMut::new(),
            state: State::Command,
            scanned: 0,
        }
    }

    /// Bytes buffered but not yet part of an emitted frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed the next chunk.
    pub fn feed(&mut self, data: &[u8]) -> DecodeResult<StompFrame> {
        self.buffer.extend_from_slice(data);

        loop {
            match std::mem::replace(&mut self.state, State::Command) {
                State::Command => {
                    let Some(line) = self.read_line(LineKind::Command)? else {
                        return Ok(None);
                    };
                    // Empty lines between frames are heart-beats.
                    if line.is_empty() {
                        continue;
                    }
                    self.state = State::Headers(PartialFrame {
                        command: line,
                        headers: Vec::new(),
                        content_length: None,
                    });
                }
                State::Headers(mut frame) => {
                    let Some(line) = self.read_line(LineKind::Header)? else {
                        self.state = State::Headers(frame);
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::Body(frame);
                        continue;
                    }
                    self.push_header(&mut frame, line)?;
                    self.state = State::Headers(frame);
                }
                State::Body(frame) => {
                    let Some(body) = self.read_body(frame.content_length)? else {
                        self.state = State::Body(frame);
                        return Ok(None);
                    };
                    return Ok(Some(StompFrame {
                        command: frame.command,
                        headers: frame.headers,
                        body,
                    }));
                }
            }
        }
    }

    fn push_header(&self, frame: &mut PartialFrame, line: String) -> Result<(), DecodeError> {
        if frame.headers.len() >= self.limits.max_headers {
            return Err(DecodeError::TooManyHeaders {
                limit: self.limits.max_headers,
            });
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(DecodeError::MalformedHeader(line));
        };

        if name == CONTENT_LENGTH && frame.content_length.is_none() {
            let declared: u64 = value
                .trim()
                .parse()
                .map_err(|_| DecodeError::InvalidContentLength(value.to_string()))?;
            if declared > self.limits.max_body_length as u64 {
                return Err(DecodeError::BodyTooLarge {
                    declared,
                    limit: self.limits.max_body_length,
                });
            }
            frame.content_length = Some(declared as usize);
        }

        frame.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Read one EOL-terminated line, trailing `\r` stripped.
    fn read_line(&mut self, kind: LineKind) -> DecodeResult<String> {
        let limit = match kind {
            LineKind::Command => self.limits.max_line_length,
            LineKind::Header => self.limits.max_header_length,
        };
        let too_long = || match kind {
            LineKind::Command => DecodeError::LineTooLong { limit },
            LineKind::Header => DecodeError::HeaderTooLong { limit },
        };

        let start = self.scanned.min(self.buffer.len());
        let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') else {
            // One extra byte for a '\r' that may precede the newline.
            if self.buffer.len() > limit + 1 {
                return Err(too_long());
            }
            self.scanned = self.buffer.len();
            return Ok(None);
        };

        self.scanned = 0;
        let end = start + offset;
        let mut line = self.buffer.split_to(end + 1);
        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }
        if line.len() > limit {
            return Err(too_long());
        }
        utf8(&line, "frame line").map(Some)
    }

    fn read_body(&mut self, content_length: Option<usize>) -> DecodeResult<Bytes> {
        let limit = self.limits.max_body_length;

        if let Some(len) = content_length {
            if self.buffer.len() < len + 1 {
                return Ok(None);
            }
            if self.buffer[len] != 0 {
                return Err(DecodeError::MissingTerminator);
            }
            let body = self.buffer.split_to(len).freeze();
            self.buffer.advance(1);
            return Ok(Some(body));
        }

        let start = self.scanned.min(self.buffer.len());
        match self.buffer[start..].iter().position(|&b| b == 0) {
            Some(offset) => {
                let end = start + offset;
                if end > limit {
                    return Err(DecodeError::UndelimitedBodyTooLarge { limit });
                }
                self.scanned = 0;
                let body = self.buffer.split_to(end).freeze();
                self.buffer.advance(1);
                Ok(Some(body))
            }
            None => {
                if self.buffer.len() > limit {
                    return Err(DecodeError::UndelimitedBodyTooLarge { limit });
                }
                self.scanned = self.buffer.len();
                Ok(None)
            }
        }
    }
}

/// STOMP 1.x: `CONNECT` or `STOMP` as the first command.
#[derive(Debug, Clone, Copy, Default)]
pub struct StompProtocol;

impl Protocol for StompProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn min_identification_bytes(&self) -> usize {
        b"CONNECT".len()
    }

    fn matches(&self, header: &[u8]) -> bool {
        header.starts_with(b"CONNECT")
            || header.starts_with(b"STOMP\n")
            || header.starts_with(b"STOMP\r\n")
    }

    fn new_snooper(&self, options: &SnoopOptions) -> Box<dyn Snooper> {
        Box::new(StompSnooper::new(options.clone()))
    }
}

/// Decodes the first frame and reads `host` and `login` from it.
pub struct StompSnooper {
    decoder: StompDecoder,
    options: SnoopOptions,
}

impl StompSnooper {
    pub fn new(options: SnoopOptions) -> Self {
        Self {
            decoder: StompDecoder::new(options.limits),
            options,
        }
    }
}

impl Snooper for StompSnooper {
    fn feed(&mut self, data: &[u8], _reply: &mut Vec<u8>) -> DecodeResult<ConnectionParameters> {
        let Some(frame) = self.decoder.feed(data)? else {
            return Ok(None);
        };

        if frame.command != "CONNECT" && frame.command != "STOMP" {
            return Err(DecodeError::UnexpectedFrame(frame.command));
        }

        let params = ConnectionParameters::new(
            NAME,
            self.options.virtual_host_or_default(frame.header("host")),
        )
        .with_user(frame.header("login").map(str::to_string));
        Ok(Some(params))
    }
}
