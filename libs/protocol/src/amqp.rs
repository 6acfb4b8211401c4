//! AMQP handshake decoding.
//!
//! Only as much of the AMQP 1.0 type system is decoded as routing needs:
//! the protocol header, frame boundaries, and the leading string, symbol
//! and binary fields of the `open` and `sasl-init` performatives. Other
//! values are skipped by their constructor width.
//!
//! Protocol header layout:
//!
//! ```text
//! 'A' 'M' 'Q' 'P' protocol-id major minor revision
//! ```
//!
//! Frame layout:
//!
//! ```text
//! size:u32 doff:u8 type:u8 channel:u16 [extended header] body
//! ```

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::snoop::utf8;
use crate::{
    BackendPrelude, ConnectionParameters, DecodeError, DecodeResult, Protocol, SnoopOptions,
    Snooper,
};

const NAME: &str = "amqp";

/// Magic prefix of every AMQP protocol header.
pub const MAGIC: &[u8; 4] = b"AMQP";

/// Protocol header size.
pub const HEADER_LEN: usize = 8;

/// Fixed frame header size (size, doff, type, channel).
pub const FRAME_HEADER_LEN: usize = 8;

pub const PROTOCOL_ID_AMQP: u8 = 0;
pub const PROTOCOL_ID_TLS: u8 = 2;
pub const PROTOCOL_ID_SASL: u8 = 3;

pub const FRAME_TYPE_AMQP: u8 = 0;
pub const FRAME_TYPE_SASL: u8 = 1;

pub const DESCRIPTOR_OPEN: u64 = 0x10;
pub const DESCRIPTOR_SASL_MECHANISMS: u64 = 0x40;
pub const DESCRIPTOR_SASL_INIT: u64 = 0x41;

/// Mechanisms offered to SASL clients on the backend's behalf.
pub const OFFERED_MECHANISMS: &[&str] = &["PLAIN", "ANONYMOUS"];

// Type constructors.
const DESCRIBED: u8 = 0x00;
const NULL: u8 = 0x40;
const LIST0: u8 = 0x45;
const SMALLULONG: u8 = 0x53;
const ULONG: u8 = 0x80;
const VBIN8: u8 = 0xa0;
const STR8: u8 = 0xa1;
const SYM8: u8 = 0xa3;
const VBIN32: u8 = 0xb0;
const STR32: u8 = 0xb1;
const SYM32: u8 = 0xb3;
const LIST8: u8 = 0xc0;
const LIST32: u8 = 0xd0;
const ARRAY8: u8 = 0xe0;

/// AMQP protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub protocol_id: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl ProtocolHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, DecodeError> {
        if &bytes[..4] != MAGIC {
            return Err(DecodeError::Malformed("missing AMQP magic".to_string()));
        }
        Ok(Self {
            protocol_id: bytes[4],
            major: bytes[5],
            minor: bytes[6],
            revision: bytes[7],
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        [
            MAGIC[0],
            MAGIC[1],
            MAGIC[2],
            MAGIC[3],
            self.protocol_id,
            self.major,
            self.minor,
            self.revision,
        ]
    }

    /// AMQP 1.0.0. Anything else is a pre-1.0 dialect.
    pub fn is_v1_0(&self) -> bool {
        (self.major, self.minor, self.revision) == (1, 0, 0)
    }
}

/// One AMQP 1.0 frame, extended header stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub channel: u16,
    pub body: Bytes,
}

/// Incremental decoder for the protocol header and the frames after it.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            buffer: BytesMut::new(),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the 8-byte protocol header.
    pub fn decode_header(&mut self) -> DecodeResult<ProtocolHeader> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let raw = self.buffer.split_to(HEADER_LEN);
        let mut bytes = [0u8; HEADER_LEN];
        bytes.copy_from_slice(&raw);
        ProtocolHeader::parse(&bytes).map(Some)
    }

    /// Decode the next frame.
    pub fn decode_frame(&mut self) -> DecodeResult<Frame> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let size = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        let doff = self.buffer[4] as usize;

        if size < FRAME_HEADER_LEN {
            return Err(DecodeError::Malformed(format!(
                "frame size {size} below minimum"
            )));
        }
        if size > self.max_frame_size {
            return Err(DecodeError::BodyTooLarge {
                declared: size as u64,
                limit: self.max_frame_size,
            });
        }
        if doff < 2 || doff * 4 > size {
            return Err(DecodeError::Malformed(format!("invalid data offset {doff}")));
        }
        if self.buffer.len() < size {
            return Ok(None);
        }

        let mut raw = self.buffer.split_to(size);
        let body = raw.split_off(doff * 4).freeze();
        Ok(Some(Frame {
            frame_type: raw[5],
            channel: u16::from_be_bytes([raw[6], raw[7]]),
            body,
        }))
    }

    /// Feed bytes and decode the next frame.
    pub fn feed(&mut self, data: &[u8]) -> DecodeResult<Frame> {
        self.extend(data);
        self.decode_frame()
    }
}

/// A decoded value, reduced to what routing cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    String(String),
    Symbol(String),
    Binary(Bytes),
    /// Any other type, skipped.
    Other,
}

impl Value {
    fn as_text(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

/// Descriptor of a described type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Code(u64),
    Symbol(String),
}

impl Descriptor {
    /// Numeric code, mapping the symbolic names of the performatives we read.
    pub fn code(&self) -> Option<u64> {
        match self {
            Descriptor::Code(code) => Some(*code),
            Descriptor::Symbol(name) => match name.as_str() {
                "amqp:open:list" => Some(DESCRIPTOR_OPEN),
                "amqp:sasl-mechanisms:list" => Some(DESCRIPTOR_SASL_MECHANISMS),
                "amqp:sasl-init:list" => Some(DESCRIPTOR_SASL_INIT),
                _ => None,
            },
        }
    }
}

/// A performative: a described list, with up to the first few fields decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Performative {
    pub descriptor: Descriptor,
    pub fields: Vec<Value>,
}

impl Performative {
    /// Decode a frame body, keeping at most `max_fields` leading fields.
    pub fn decode(body: &[u8], max_fields: usize) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(body);

        if reader.u8()? != DESCRIBED {
            return Err(DecodeError::Malformed(
                "performative is not a described type".to_string(),
            ));
        }
        let descriptor = match reader.u8()? {
            SMALLULONG => Descriptor::Code(reader.u8()? as u64),
            ULONG => Descriptor::Code(reader.u64()?),
            SYM8 => {
                let len = reader.u8()? as usize;
                Descriptor::Symbol(utf8(reader.take(len)?, "descriptor")?)
            }
            SYM32 => {
                let len = reader.u32()? as usize;
                Descriptor::Symbol(utf8(reader.take(len)?, "descriptor")?)
            }
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unsupported descriptor constructor 0x{other:02x}"
                )))
            }
        };

        let count = match reader.u8()? {
            LIST0 => 0,
            LIST8 => {
                let _size = reader.u8()?;
                reader.u8()? as usize
            }
            LIST32 => {
                let _size = reader.u32()?;
                reader.u32()? as usize
            }
            other => {
                return Err(DecodeError::Malformed(format!(
                    "performative body is not a list (0x{other:02x})"
                )))
            }
        };

        let mut fields = Vec::with_capacity(count.min(max_fields));
        for _ in 0..count.min(max_fields) {
            fields.push(reader.value()?);
        }
        Ok(Self { descriptor, fields })
    }

    pub fn field(&self, index: usize) -> &Value {
        self.fields.get(index).unwrap_or(&Value::Null)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() - self.pos < len {
            return Err(DecodeError::Malformed("value runs past end of frame".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn value(&mut self) -> Result<Value, DecodeError> {
        let constructor = self.u8()?;
        let value = match constructor {
            DESCRIBED => {
                self.value()?;
                self.value()?;
                Value::Other
            }
            NULL => Value::Null,
            0x41..=0x45 => Value::Other,
            0x50..=0x56 => self.skip(1)?,
            0x60..=0x61 => self.skip(2)?,
            0x70..=0x74 => self.skip(4)?,
            0x80..=0x84 => self.skip(8)?,
            0x94 | 0x98 => self.skip(16)?,
            VBIN8 | STR8 | SYM8 => {
                let len = self.u8()? as usize;
                self.variable(constructor, len)?
            }
            VBIN32 | STR32 | SYM32 => {
                let len = self.u32()? as usize;
                self.variable(constructor, len)?
            }
            0xc0 | 0xc1 | ARRAY8 => {
                let size = self.u8()? as usize;
                self.skip(size)?
            }
            0xd0 | 0xd1 | 0xf0 => {
                let size = self.u32()? as usize;
                self.skip(size)?
            }
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unknown type constructor 0x{other:02x}"
                )))
            }
        };
        Ok(value)
    }

    fn skip(&mut self, len: usize) -> Result<Value, DecodeError> {
        self.take(len)?;
        Ok(Value::Other)
    }

    fn variable(&mut self, constructor: u8, len: usize) -> Result<Value, DecodeError> {
        let raw = self.take(len)?;
        Ok(match constructor {
            VBIN8 | VBIN32 => Value::Binary(Bytes::copy_from_slice(raw)),
            STR8 | STR32 => Value::String(utf8(raw, "string")?),
            _ => Value::Symbol(utf8(raw, "symbol")?),
        })
    }
}

/// Append a `sasl-mechanisms` frame offering `mechanisms`.
pub fn encode_sasl_mechanisms(out: &mut Vec<u8>, mechanisms: &[&str]) {
    // array8: count, element constructor, elements
    let mut array = vec![mechanisms.len() as u8, SYM8];
    for mechanism in mechanisms {
        array.push(mechanism.len() as u8);
        array.extend_from_slice(mechanism.as_bytes());
    }

    // list8 with a single field
    let mut list = vec![1u8, ARRAY8, array.len() as u8];
    list.extend_from_slice(&array);

    let mut body = vec![
        DESCRIBED,
        SMALLULONG,
        DESCRIPTOR_SASL_MECHANISMS as u8,
        LIST8,
        list.len() as u8,
    ];
    body.extend_from_slice(&list);

    let size = (FRAME_HEADER_LEN + body.len()) as u32;
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&[2, FRAME_TYPE_SASL, 0, 0]);
    out.extend_from_slice(&body);
}

/// Extract the authentication identity from a SASL PLAIN initial response
/// (`authzid NUL authcid NUL passwd`).
pub fn plain_authcid(initial_response: &[u8]) -> Option<String> {
    let mut parts = initial_response.split(|b| *b == 0);
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    parts.next()?;
    std::str::from_utf8(authcid).ok().map(str::to_string)
}

/// AMQP, any version: `AMQP` magic.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpProtocol;

impl Protocol for AmqpProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn min_identification_bytes(&self) -> usize {
        HEADER_LEN
    }

    fn matches(&self, header: &[u8]) -> bool {
        header.starts_with(MAGIC)
    }

    fn new_snooper(&self, options: &SnoopOptions) -> Box<dyn Snooper> {
        Box::new(AmqpSnooper::new(options.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnoopState {
    Header,
    Open,
    SaslInit,
}

/// Snoops the virtual host from `open`, or from `sasl-init` when the client
/// starts with a SASL layer.
///
/// For SASL the client waits for the server's header and mechanism list
/// before it sends `sasl-init`, so those are answered here from static
/// rules and the backend's copies are dropped via [`BackendPrelude`].
pub struct AmqpSnooper {
    decoder: FrameDecoder,
    options: SnoopOptions,
    state: SnoopState,
    prelude: BackendPrelude,
}

impl AmqpSnooper {
    pub fn new(options: SnoopOptions) -> Self {
        Self {
            decoder: FrameDecoder::new(options.limits.max_body_length),
            options,
            state: SnoopState::Header,
            prelude: BackendPrelude::NONE,
        }
    }

    fn params(&self, host: Option<&str>, user: Option<String>) -> ConnectionParameters {
        ConnectionParameters::new(NAME, self.options.virtual_host_or_default(host)).with_user(user)
    }

    fn on_header(
        &mut self,
        header: ProtocolHeader,
        reply: &mut Vec<u8>,
    ) -> DecodeResult<ConnectionParameters> {
        if !header.is_v1_0() {
            // Pre-1.0 clients wait for the server to speak first.
            debug!(
                major = header.major,
                minor = header.minor,
                "Legacy AMQP header, routing to default virtual host"
            );
            return Ok(Some(self.params(None, None)));
        }

        match header.protocol_id {
            PROTOCOL_ID_AMQP => self.state = SnoopState::Open,
            PROTOCOL_ID_SASL => {
                reply.extend_from_slice(&header.encode());
                encode_sasl_mechanisms(reply, OFFERED_MECHANISMS);
                self.prelude = BackendPrelude {
                    fixed_bytes: HEADER_LEN,
                    length_prefixed_frames: 1,
                };
                self.state = SnoopState::SaslInit;
            }
            PROTOCOL_ID_TLS => {
                return Err(DecodeError::Unsupported("AMQP TLS layer".to_string()));
            }
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unknown AMQP protocol id {other}"
                )));
            }
        }
        Ok(None)
    }

    fn on_frame(&mut self, frame: Frame) -> DecodeResult<ConnectionParameters> {
        // Empty frames are heartbeats.
        if frame.body.is_empty() {
            return Ok(None);
        }

        let performative = Performative::decode(&frame.body, 3)?;
        let code = performative.descriptor.code();

        match self.state {
            SnoopState::Open
                if frame.frame_type == FRAME_TYPE_AMQP && code == Some(DESCRIPTOR_OPEN) =>
            {
                let host = performative.field(1).as_text();
                Ok(Some(self.params(host, None)))
            }
            SnoopState::SaslInit
                if frame.frame_type == FRAME_TYPE_SASL && code == Some(DESCRIPTOR_SASL_INIT) =>
            {
                let mechanism = performative.field(0).as_text().unwrap_or_default();
                let user = match (mechanism, performative.field(1)) {
                    ("PLAIN", Value::Binary(response)) => plain_authcid(response),
                    _ => None,
                };
                let host = performative.field(2).as_text();
                Ok(Some(self.params(host, user)))
            }
            _ => Err(DecodeError::UnexpectedFrame(format!(
                "AMQP frame type {} descriptor {:?}",
                frame.frame_type, performative.descriptor
            ))),
        }
    }
}

impl Snooper for AmqpSnooper {
    fn feed(&mut self, data: &[u8], reply: &mut Vec<u8>) -> DecodeResult<ConnectionParameters> {
        self.decoder.extend(data);

        loop {
            let outcome = match self.state {
                SnoopState::Header => match self.decoder.decode_header()? {
                    Some(header) => self.on_header(header, reply)?,
                    None => return Ok(None),
                },
                SnoopState::Open | SnoopState::SaslInit => match self.decoder.decode_frame()? {
                    Some(frame) => self.on_frame(frame)?,
                    None => return Ok(None),
                },
            };
            if outcome.is_some() {
                return Ok(outcome);
            }
        }
    }

    fn backend_prelude(&self) -> BackendPrelude {
        self.prelude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(frame_type: u8, body: &[u8]) -> Vec<u8> {
        let mut out = ((FRAME_HEADER_LEN + body.len()) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&[2, frame_type, 0, 0]);
        out.extend_from_slice(body);
        out
    }

    fn str8(s: &str) -> Vec<u8> {
        let mut out = vec![STR8, s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn described_list(code: u8, fields: &[Vec<u8>]) -> Vec<u8> {
        let payload: Vec<u8> = fields.concat();
        let mut out = vec![
            DESCRIBED,
            SMALLULONG,
            code,
            LIST8,
            (payload.len() + 1) as u8,
            fields.len() as u8,
        ];
        out.extend_from_slice(&payload);
        out
    }

    fn open(hostname: Option<&str>) -> Vec<u8> {
        let host = hostname.map(str8).unwrap_or_else(|| vec![NULL]);
        // container-id, hostname, max-frame-size (uint)
        let body = described_list(0x10, &[str8("client-1"), host, vec![0x70, 0, 0, 0x10, 0]]);
        frame(FRAME_TYPE_AMQP, &body)
    }

    fn sasl_init(mechanism: &str, response: &[u8], hostname: &str) -> Vec<u8> {
        let mut mech = vec![SYM8, mechanism.len() as u8];
        mech.extend_from_slice(mechanism.as_bytes());
        let mut resp = vec![VBIN8, response.len() as u8];
        resp.extend_from_slice(response);
        let body = described_list(0x41, &[mech, resp, str8(hostname)]);
        frame(FRAME_TYPE_SASL, &body)
    }

    fn amqp_stream(hostname: Option<&str>) -> Vec<u8> {
        let mut stream = b"AMQP\x00\x01\x00\x00".to_vec();
        stream.extend_from_slice(&frame(FRAME_TYPE_AMQP, &[]));
        stream.extend_from_slice(&open(hostname));
        stream
    }

    fn snoop(input: &[u8]) -> (DecodeResult<ConnectionParameters>, Vec<u8>, BackendPrelude) {
        let mut snooper = AmqpSnooper::new(SnoopOptions::default());
        let mut reply = Vec::new();
        let result = snooper.feed(input, &mut reply);
        (result, reply, snooper.backend_prelude())
    }

    #[test]
    fn test_header_roundtrip() {
        let header = ProtocolHeader::parse(b"AMQP\x03\x01\x00\x00").unwrap();
        assert_eq!(header.protocol_id, PROTOCOL_ID_SASL);
        assert!(header.is_v1_0());
        assert_eq!(&header.encode(), b"AMQP\x03\x01\x00\x00");
    }

    #[test]
    fn test_snoop_open_hostname() {
        let (result, reply, prelude) = snoop(&amqp_stream(Some("broker-vhost")));
        let params = result.unwrap().unwrap();
        assert_eq!(params.protocol, "amqp");
        assert_eq!(params.virtual_host, "broker-vhost");
        assert!(reply.is_empty());
        assert!(prelude.is_empty());
    }

    #[test]
    fn test_snoop_open_without_hostname_uses_default() {
        let (result, _, _) = snoop(&amqp_stream(None));
        assert_eq!(result.unwrap().unwrap().virtual_host, "default");
    }

    #[test]
    fn test_snoop_sasl_plain() {
        let mut input = b"AMQP\x03\x01\x00\x00".to_vec();
        input.extend_from_slice(&sasl_init("PLAIN", b"\x00bob\x00secret", "sasl-vhost"));

        let (result, reply, prelude) = snoop(&input);
        let params = result.unwrap().unwrap();
        assert_eq!(params.virtual_host, "sasl-vhost");
        assert_eq!(params.user.as_deref(), Some("bob"));

        // Header echo followed by a sasl-mechanisms frame.
        assert_eq!(&reply[..8], b"AMQP\x03\x01\x00\x00");
        let mut decoder = FrameDecoder::new(1024);
        let mechanisms = decoder.feed(&reply[8..]).unwrap().unwrap();
        assert_eq!(mechanisms.frame_type, FRAME_TYPE_SASL);
        let performative = Performative::decode(&mechanisms.body, 1).unwrap();
        assert_eq!(performative.descriptor.code(), Some(DESCRIPTOR_SASL_MECHANISMS));
        assert_eq!(
            prelude,
            BackendPrelude {
                fixed_bytes: 8,
                length_prefixed_frames: 1
            }
        );
    }

    #[test]
    fn test_sasl_reply_written_before_init_arrives() {
        let mut snooper = AmqpSnooper::new(SnoopOptions::default());
        let mut reply = Vec::new();
        assert_eq!(snooper.feed(b"AMQP\x03\x01\x00\x00", &mut reply).unwrap(), None);
        assert!(reply.len() > HEADER_LEN);
    }

    #[test]
    fn test_legacy_header_routes_to_default() {
        let (result, reply, _) = snoop(b"AMQP\x00\x00\x09\x01");
        assert_eq!(result.unwrap().unwrap().virtual_host, "default");
        assert!(reply.is_empty());
    }

    #[test]
    fn test_tls_layer_is_unsupported() {
        let (result, _, _) = snoop(b"AMQP\x02\x01\x00\x00");
        assert!(matches!(result, Err(DecodeError::Unsupported(_))));
    }

    #[test]
    fn test_frame_over_limit() {
        let mut decoder = FrameDecoder::new(64);
        let err = decoder.feed(&[0x7f, 0xff, 0xff, 0xff, 2, 0, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::BodyTooLarge {
                declared: 0x7fff_ffff,
                limit: 64
            }
        );
    }

    #[test]
    fn test_unexpected_first_frame() {
        let mut input = b"AMQP\x00\x01\x00\x00".to_vec();
        input.extend_from_slice(&frame(FRAME_TYPE_AMQP, &described_list(0x11, &[])));
        let (result, _, _) = snoop(&input);
        assert!(matches!(result, Err(DecodeError::UnexpectedFrame(_))));
    }

    #[test]
    fn test_symbolic_descriptor() {
        let mut body = vec![DESCRIBED, SYM8, 14];
        body.extend_from_slice(b"amqp:open:list");
        body.extend_from_slice(&[LIST8, 5, 2]);
        body.extend_from_slice(&str8("c"));
        body.push(NULL);
        let performative = Performative::decode(&body, 3).unwrap();
        assert_eq!(performative.descriptor.code(), Some(DESCRIPTOR_OPEN));
        assert_eq!(performative.field(1), &Value::Null);
    }

    #[test]
    fn test_plain_authcid() {
        assert_eq!(plain_authcid(b"admin\x00bob\x00pw").as_deref(), Some("bob"));
        assert_eq!(plain_authcid(b"bob"), None);
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_matter(
            host in "[a-z]{1,20}",
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let stream = amqp_stream(Some(&host));
            let (whole, _, _) = snoop(&stream);
            let whole = whole.unwrap().unwrap();

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut snooper = AmqpSnooper::new(SnoopOptions::default());
            let mut reply = Vec::new();
            let mut result = None;
            for w in points.windows(2) {
                if let Some(params) = snooper.feed(&stream[w[0]..w[1]], &mut reply).unwrap() {
                    result = Some(params);
                    break;
                }
            }
            prop_assert_eq!(Some(whole), result);
        }
    }
}
