//! MQTT CONNECT decoding (3.1, 3.1.1 and 5).

use bytes::{Bytes, BytesMut};

use crate::snoop::utf8;
use crate::{ConnectionParameters, DecodeError, DecodeResult, Protocol, SnoopOptions, Snooper};

const NAME: &str = "mqtt";

/// Packet type of CONNECT.
pub const CONNECT: u8 = 1;

const MAX_VARINT_BYTES: usize = 4;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_RESERVED: u8 = 0x01;

// Length-prefixed protocol names as they appear on the wire.
const SIGNATURES: &[&[u8]] = &[b"\x00\x04MQTT", b"\x00\x06MQIsdp"];

/// One MQTT control packet, fixed header split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u8,
    pub flags: u8,
    pub body: Bytes,
}

/// Incremental MQTT packet decoder.
#[derive(Debug)]
pub struct PacketDecoder {
    max_packet_size: usize,
    buffer: BytesMut,
}

impl PacketDecoder {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            buffer: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> DecodeResult<Packet> {
        self.buffer.extend_from_slice(data);
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let Some((remaining, varint_len)) = read_varint(&self.buffer[1..])? else {
            return Ok(None);
        };
        if remaining > self.max_packet_size {
            return Err(DecodeError::BodyTooLarge {
                declared: remaining as u64,
                limit: self.max_packet_size,
            });
        }

        let header_len = 1 + varint_len;
        if self.buffer.len() < header_len + remaining {
            return Ok(None);
        }

        let raw = self.buffer.split_to(header_len + remaining);
        Ok(Some(Packet {
            packet_type: raw[0] >> 4,
            flags: raw[0] & 0x0f,
            body: Bytes::copy_from_slice(&raw[header_len..]),
        }))
    }
}

/// Decode a variable byte integer. `Ok(None)` when more bytes are needed.
fn read_varint(data: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let mut value = 0usize;
    for (i, byte) in data.iter().take(MAX_VARINT_BYTES).enumerate() {
        value |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if data.len() >= MAX_VARINT_BYTES {
        return Err(DecodeError::Malformed(
            "variable length integer exceeds four bytes".to_string(),
        ));
    }
    Ok(None)
}

/// Fields of a CONNECT packet that matter for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub username: Option<String>,
}

impl Connect {
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader { data: body, pos: 0 };

        let protocol_name = utf8(r.prefixed()?, "protocol name")?;
        if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
            return Err(DecodeError::Unsupported(format!(
                "MQTT protocol name {protocol_name:?}"
            )));
        }
        let protocol_level = r.u8()?;
        let flags = r.u8()?;
        if flags & FLAG_RESERVED != 0 {
            return Err(DecodeError::Malformed("CONNECT reserved flag set".to_string()));
        }
        let keep_alive = r.u16()?;

        if protocol_level >= 5 {
            r.skip_properties()?;
        }

        let client_id = utf8(r.prefixed()?, "client identifier")?;

        if flags & FLAG_WILL != 0 {
            if protocol_level >= 5 {
                r.skip_properties()?;
            }
            r.prefixed()?; // will topic
            r.prefixed()?; // will payload
        }

        let username = if flags & FLAG_USERNAME != 0 {
            Some(utf8(r.prefixed()?, "user name")?)
        } else {
            None
        };
        if flags & FLAG_PASSWORD != 0 {
            r.prefixed()?;
        }

        Ok(Self {
            protocol_name,
            protocol_level,
            clean_session: flags & FLAG_CLEAN_SESSION != 0,
            keep_alive,
            client_id,
            username,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() - self.pos < len {
            return Err(DecodeError::Malformed(
                "CONNECT field runs past end of packet".to_string(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Two-byte length prefixed string or binary.
    fn prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn skip_properties(&mut self) -> Result<(), DecodeError> {
        let Some((len, varint_len)) = read_varint(&self.data[self.pos..])? else {
            return Err(DecodeError::Malformed("truncated property length".to_string()));
        };
        self.pos += varint_len;
        self.take(len)?;
        Ok(())
    }
}

/// Split a `vhost/user` user name. Names without a `/` keep the default host.
pub fn split_username(username: &str) -> (Option<&str>, &str) {
    match username.split_once('/') {
        Some((vhost, user)) if !vhost.is_empty() => (Some(vhost), user),
        _ => (None, username),
    }
}

/// MQTT: a CONNECT packet naming `MQTT` or `MQIsdp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttProtocol;

impl Protocol for MqttProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn min_identification_bytes(&self) -> usize {
        10
    }

    fn matches(&self, header: &[u8]) -> bool {
        if header.first().map(|b| b >> 4) != Some(CONNECT) {
            return false;
        }
        let Ok(Some((_, varint_len))) = read_varint(&header[1..]) else {
            return false;
        };
        let rest = &header[1 + varint_len..];
        SIGNATURES.iter().any(|signature| {
            let n = rest.len().min(signature.len());
            n > 0 && rest[..n] == signature[..n]
        })
    }

    fn new_snooper(&self, options: &SnoopOptions) -> Box<dyn Snooper> {
        Box::new(MqttSnooper::new(options.clone()))
    }
}

/// Decodes CONNECT and routes by the `vhost/` prefix of the user name.
pub struct MqttSnooper {
    decoder: PacketDecoder,
    options: SnoopOptions,
}

impl MqttSnooper {
    pub fn new(options: SnoopOptions) -> Self {
        Self {
            decoder: PacketDecoder::new(options.limits.max_body_length),
            options,
        }
    }
}

impl Snooper for MqttSnooper {
    fn feed(&mut self, data: &[u8], _reply: &mut Vec<u8>) -> DecodeResult<ConnectionParameters> {
        let Some(packet) = self.decoder.feed(data)? else {
            return Ok(None);
        };
        if packet.packet_type != CONNECT {
            return Err(DecodeError::UnexpectedFrame(format!(
                "MQTT packet type {}",
                packet.packet_type
            )));
        }

        let connect = Connect::parse(&packet.body)?;
        let (vhost, user) = match connect.username.as_deref() {
            Some(name) => {
                let (vhost, user) = split_username(name);
                (vhost, Some(user.to_string()))
            }
            None => (None, None),
        };

        let params = ConnectionParameters::new(NAME, self.options.virtual_host_or_default(vhost))
            .with_user(user)
            .with_client_id(Some(connect.client_id));
        Ok(Some(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn prefixed(s: &[u8]) -> Vec<u8> {
        let mut out = (s.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(s);
        out
    }

    fn encode_varint(mut value: usize) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (value % 128) as u8;
            value /= 128;
            if value > 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                return out;
            }
        }
    }

    fn connect(level: u8, client_id: &str, username: Option<&str>, will: bool) -> Vec<u8> {
        let name: &[u8] = if level == 3 { b"MQIsdp" } else { b"MQTT" };
        let mut flags = FLAG_CLEAN_SESSION;
        if username.is_some() {
            flags |= FLAG_USERNAME | FLAG_PASSWORD;
        }
        if will {
            flags |= FLAG_WILL;
        }

        let mut body = prefixed(name);
        body.extend_from_slice(&[level, flags, 0, 60]);
        if level >= 5 {
            // session expiry interval property
            body.extend_from_slice(&[5, 0x11, 0, 0, 0, 10]);
        }
        body.extend_from_slice(&prefixed(client_id.as_bytes()));
        if will {
            if level >= 5 {
                body.push(0);
            }
            body.extend_from_slice(&prefixed(b"last/will"));
            body.extend_from_slice(&prefixed(b"gone"));
        }
        if let Some(user) = username {
            body.extend_from_slice(&prefixed(user.as_bytes()));
            body.extend_from_slice(&prefixed(b"secret"));
        }

        let mut packet = vec![CONNECT << 4];
        packet.extend_from_slice(&encode_varint(body.len()));
        packet.extend_from_slice(&body);
        packet
    }

    fn snoop(input: &[u8]) -> DecodeResult<ConnectionParameters> {
        MqttSnooper::new(SnoopOptions::default()).feed(input, &mut Vec::new())
    }

    #[test]
    fn test_snoop_v311_with_vhost_user() {
        let params = snoop(&connect(4, "dev-1", Some("tenant-a/alice"), false))
            .unwrap()
            .unwrap();
        assert_eq!(params.protocol, "mqtt");
        assert_eq!(params.virtual_host, "tenant-a");
        assert_eq!(params.user.as_deref(), Some("alice"));
        assert_eq!(params.client_id.as_deref(), Some("dev-1"));
    }

    #[test]
    fn test_snoop_plain_user_keeps_default_vhost() {
        let params = snoop(&connect(4, "dev-1", Some("alice"), true)).unwrap().unwrap();
        assert_eq!(params.virtual_host, "default");
        assert_eq!(params.user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_snoop_v31_and_v5() {
        let params = snoop(&connect(3, "old", None, false)).unwrap().unwrap();
        assert_eq!(params.client_id.as_deref(), Some("old"));
        assert_eq!(params.user, None);

        let params = snoop(&connect(5, "new", Some("v/u"), true)).unwrap().unwrap();
        assert_eq!(params.virtual_host, "v");
        assert_eq!(params.client_id.as_deref(), Some("new"));
    }

    #[test]
    fn test_empty_client_id_is_not_reported() {
        let params = snoop(&connect(4, "", None, false)).unwrap().unwrap();
        assert_eq!(params.client_id, None);
    }

    #[test]
    fn test_matches() {
        let p = MqttProtocol;
        assert!(p.matches(&connect(4, "c", None, false)[..10]));
        assert!(p.matches(&connect(3, "c", None, false)[..10]));
        assert!(!p.matches(b"\x20\x02\x00\x00\x00\x00\x00\x00\x00\x00"));
        assert!(!p.matches(b"\x10\x12\x00\x04HTTP\x04\x02"));
        assert!(!p.matches(b"CONNECT\nho"));
    }

    #[test]
    fn test_matches_with_long_remaining_length() {
        let long_id = "x".repeat(300);
        let packet = connect(4, &long_id, None, false);
        assert_eq!(packet[1] & 0x80, 0x80);
        assert!(MqttProtocol.matches(&packet[..10]));
    }

    #[test]
    fn test_packet_over_limit() {
        let mut decoder = PacketDecoder::new(16);
        let err = decoder.feed(&[0x10, 0xff, 0xff, 0x7f]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::BodyTooLarge {
                declared: 2_097_151,
                limit: 16
            }
        );
    }

    #[test]
    fn test_varint_too_long() {
        let mut decoder = PacketDecoder::new(1024);
        let err = decoder.feed(&[0x10, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_first_packet_must_be_connect() {
        let err = snoop(&[0xc0, 0x00]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedFrame(_)));
    }

    #[test]
    fn test_split_username() {
        assert_eq!(split_username("a/b"), (Some("a"), "b"));
        assert_eq!(split_username("/b"), (None, "/b"));
        assert_eq!(split_username("b"), (None, "b"));
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_matter(
            client_id in "[a-z0-9]{0,200}",
            user in proptest::option::of("[a-z]{1,8}/[a-z]{1,8}"),
            will in any::<bool>(),
            chunk in 1usize..16,
        ) {
            let packet = connect(4, &client_id, user.as_deref(), will);
            let whole = snoop(&packet).unwrap().unwrap();

            let mut snooper = MqttSnooper::new(SnoopOptions::default());
            let mut result = None;
            for piece in packet.chunks(chunk) {
                if let Some(params) = snooper.feed(piece, &mut Vec::new()).unwrap() {
                    result = Some(params);
                    break;
                }
            }
            prop_assert_eq!(Some(whole), result);
        }
    }
}
