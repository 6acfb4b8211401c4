//! Protocol descriptors and identification.
//!
//! Descriptors are registered once at startup, in order. Identification is
//! first-match-wins in registration order, so protocols must be registered
//! with prefixes that are unambiguous within the identification budget.

use std::fmt;
use std::sync::Arc;

use crate::amqp::AmqpProtocol;
use crate::mqtt::MqttProtocol;
use crate::stomp::StompProtocol;
use crate::{SnoopOptions, Snooper};

/// Names of the built-in protocols, in their default registration order.
pub const BUILTIN_PROTOCOLS: &[&str] = &["stomp", "amqp", "mqtt"];

/// Capability describing one wire protocol.
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Protocol name, used as the first half of the routing key.
    fn name(&self) -> &'static str;

    /// Bytes needed before [`Protocol::matches`] can decide.
    fn min_identification_bytes(&self) -> usize;

    /// Whether the buffered prefix belongs to this protocol.
    ///
    /// Only called with at least `min_identification_bytes` bytes.
    fn matches(&self, header: &[u8]) -> bool;

    /// Create a fresh snooper for one connection.
    fn new_snooper(&self, options: &SnoopOptions) -> Box<dyn Snooper>;
}

/// Look up a built-in protocol by name.
pub fn builtin(name: &str) -> Option<Arc<dyn Protocol>> {
    match name {
        "stomp" => Some(Arc::new(StompProtocol)),
        "amqp" => Some(Arc::new(AmqpProtocol)),
        "mqtt" => Some(Arc::new(MqttProtocol)),
        _ => None,
    }
}

/// Outcome of [`ProtocolSet::identify`].
#[derive(Debug, Clone)]
pub enum Identification {
    /// A protocol matched. Selection is final.
    Matched(Arc<dyn Protocol>),
    /// No protocol can match these bytes.
    Unmatched,
    /// An undecided protocol needs more bytes.
    NeedMoreBytes,
}

/// Ordered set of registered protocols.
#[derive(Debug, Clone, Default)]
pub struct ProtocolSet {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl ProtocolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in protocols in default order.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        for name in BUILTIN_PROTOCOLS {
            if let Some(protocol) = builtin(name) {
                set.register(protocol);
            }
        }
        set
    }

    /// Register a protocol. Later registrations lose ties to earlier ones.
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) {
        self.protocols.push(protocol);
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.protocols.iter().map(|p| p.name()).collect()
    }

    /// Maximum bytes that may be buffered before giving up.
    pub fn identification_budget(&self) -> usize {
        self.protocols
            .iter()
            .map(|p| p.min_identification_bytes())
            .max()
            .unwrap_or(0)
    }

    /// Identify the protocol of a buffered prefix.
    ///
    /// Only protocols whose minimum byte count is buffered are consulted,
    /// in registration order; the first one that matches wins. Protocols
    /// still short of their minimum are skipped, and the result is
    /// `NeedMoreBytes` only while at least one of them remains undecided.
    pub fn identify(&self, buffered: &[u8]) -> Identification {
        let mut undecided = false;
        for protocol in &self.protocols {
            if buffered.len() < protocol.min_identification_bytes() {
                undecided = true;
                continue;
            }
            if protocol.matches(buffered) {
                return Identification::Matched(Arc::clone(protocol));
            }
        }
        if undecided {
            Identification::NeedMoreBytes
        } else {
            Identification::Unmatched
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stomp_and_amqp() -> ProtocolSet {
        let mut set = ProtocolSet::new();
        set.register(builtin("stomp").unwrap());
        set.register(builtin("amqp").unwrap());
        set
    }

    #[test]
    fn test_budget_is_max_of_minimums() {
        assert_eq!(stomp_and_amqp().identification_budget(), 8);
        assert_eq!(ProtocolSet::builtin().identification_budget(), 10);
        assert_eq!(ProtocolSet::new().identification_budget(), 0);
    }

    #[test]
    fn test_identify_stomp() {
        let set = ProtocolSet::builtin();
        match set.identify(b"CONNECT\nhost:myvhost\n\n\x00") {
            Identification::Matched(p) => assert_eq!(p.name(), "stomp"),
            other => panic!("Expected Matched, got {:?}", other),
        }
    }

    #[test]
    fn test_identify_waits_for_minimum() {
        let set = ProtocolSet::builtin();
        assert!(matches!(set.identify(b"CONN"), Identification::NeedMoreBytes));
        assert!(matches!(set.identify(b""), Identification::NeedMoreBytes));
    }

    #[test]
    fn test_short_prefix_matches_past_undecided_protocol() {
        // mqtt needs 10 bytes; an 8-byte AMQP header must not wait for it.
        let mut set = ProtocolSet::new();
        set.register(builtin("mqtt").unwrap());
        set.register(builtin("amqp").unwrap());

        match set.identify(b"AMQP\x03\x01\x00\x00") {
            Identification::Matched(p) => assert_eq!(p.name(), "amqp"),
            other => panic!("Expected Matched, got {:?}", other),
        }
        assert!(matches!(set.identify(b"AMQP\x00\x01"), Identification::NeedMoreBytes));
        assert!(matches!(set.identify(b"GET / HT"), Identification::NeedMoreBytes));
        assert!(matches!(set.identify(b"GET / HTTP"), Identification::Unmatched));
    }

    #[test]
    fn test_earlier_protocol_wins_when_both_decidable() {
        let set = stomp_and_amqp();
        assert!(matches!(set.identify(b"AMQP\x00\x01"), Identification::NeedMoreBytes));
        match set.identify(b"STOMP\n\n\x00") {
            Identification::Matched(p) => assert_eq!(p.name(), "stomp"),
            other => panic!("Expected Matched, got {:?}", other),
        }
    }

    #[test]
    fn test_identify_unmatched_at_budget() {
        let set = stomp_and_amqp();
        assert!(matches!(set.identify(b"GET / HT"), Identification::Unmatched));
    }

    #[test]
    fn test_identify_mqtt() {
        let set = ProtocolSet::builtin();
        let connect = [0x10, 0x12, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02];
        match set.identify(&connect) {
            Identification::Matched(p) => assert_eq!(p.name(), "mqtt"),
            other => panic!("Expected Matched, got {:?}", other),
        }
    }

    #[test]
    fn test_builtin_lookup() {
        assert!(builtin("stomp").is_some());
        assert!(builtin("openwire").is_none());
        assert_eq!(ProtocolSet::builtin().names(), vec!["stomp", "amqp", "mqtt"]);
    }
}
