//! Broadcast message model for the cache topic.
//!
//! # Purpose
//! Defines the two event families carried between nodes (entity-cache events
//! and relation events) plus the envelope that stamps every message with its
//! sender identity and send timestamp.
//!
//! # Design notes
//! Events are discriminated unions with one variant per action, so an
//! unknown action on the wire surfaces as a decode error instead of an
//! unchecked integer. The envelope keeps the sender property under its
//! long-standing wire name so mixed-version clusters keep interoperating.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{FLAG_BROADCAST, Frame, Result};

/// Wire name of the envelope property carrying the sender's instance
/// identifier. Consumers drop any message where it is missing.
pub const SENDER_PROPERTY: &str = "Gemini.CacheMgr.ClientUUID";

/// Serialized entity state: attribute name to value, enough to reconstruct
/// or update the entity on a peer.
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

/// Compact collection of (left, right) id pairs for bulk relation events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationPairs(Vec<(u64, u64)>);

impl RelationPairs {
    pub fn new(pairs: Vec<(u64, u64)>) -> Self {
        Self(pairs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<(u64, u64)> for RelationPairs {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-entity-group cache maintenance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Reset every group on the receiving node. Never produced by current
    /// senders; accepted for compatibility with older peers.
    FullReset,
    GroupReset {
        group_id: u64,
    },
    ObjectReset {
        group_id: u64,
        object_id: u64,
        properties: PropertyMap,
    },
    ObjectRemove {
        group_id: u64,
        object_id: u64,
    },
}

impl CacheEvent {
    /// The entity group this event addresses, when it addresses one.
    pub fn group_id(&self) -> Option<u64> {
        match self {
            CacheEvent::FullReset => None,
            CacheEvent::GroupReset { group_id }
            | CacheEvent::ObjectReset { group_id, .. }
            | CacheEvent::ObjectRemove { group_id, .. } => Some(*group_id),
        }
    }
}

/// Per-relation maintenance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RelationEvent {
    Add {
        relation_id: u64,
        left_id: u64,
        right_id: u64,
    },
    AddAll {
        relation_id: u64,
        pairs: RelationPairs,
    },
    Clear {
        relation_id: u64,
    },
    Remove {
        relation_id: u64,
        left_id: u64,
        right_id: u64,
    },
    RemoveAll {
        relation_id: u64,
        pairs: RelationPairs,
    },
    RemoveLeft {
        relation_id: u64,
        left_id: u64,
    },
    RemoveRight {
        relation_id: u64,
        right_id: u64,
    },
    ReplaceAll {
        relation_id: u64,
        pairs: RelationPairs,
    },
    /// Rebuild the relation from its authoritative source. Also what large
    /// bulk events collapse into before they hit the wire.
    Reset {
        relation_id: u64,
    },
}

impl RelationEvent {
    pub fn relation_id(&self) -> u64 {
        match self {
            RelationEvent::Add { relation_id, .. }
            | RelationEvent::AddAll { relation_id, .. }
            | RelationEvent::Clear { relation_id }
            | RelationEvent::Remove { relation_id, .. }
            | RelationEvent::RemoveAll { relation_id, .. }
            | RelationEvent::RemoveLeft { relation_id, .. }
            | RelationEvent::RemoveRight { relation_id, .. }
            | RelationEvent::ReplaceAll { relation_id, .. }
            | RelationEvent::Reset { relation_id } => *relation_id,
        }
    }
}

/// Tagged sum of the two broadcast families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastMessage {
    Cache(CacheEvent),
    Relation(RelationEvent),
}

/// Envelope stamped onto every broadcast message.
///
/// ```
/// use lynx_wire::{BroadcastMessage, CacheEvent, Envelope};
///
/// let envelope = Envelope {
///     sender_id: Some("node-1".to_string()),
///     sent_at_ms: 1_700_000_000_000,
///     message: BroadcastMessage::Cache(CacheEvent::GroupReset { group_id: 7 }),
/// };
/// let bytes = envelope.encode().expect("encode");
/// let decoded = Envelope::decode(bytes).expect("decode");
/// assert_eq!(decoded, envelope);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender instance identifier. `None` on the wire means a malformed peer;
    /// outgoing envelopes always carry one.
    #[serde(rename = "Gemini.CacheMgr.ClientUUID", default)]
    pub sender_id: Option<String>,
    /// Send timestamp in milliseconds since the epoch, read by receivers to
    /// measure transmission time.
    pub sent_at_ms: u64,
    pub message: BroadcastMessage,
}

impl Envelope {
    /// Encode the envelope into a broadcast frame ready for the topic.
    pub fn encode(&self) -> Result<Bytes> {
        let payload = serde_json::to_vec(self)?;
        Ok(Frame::new(FLAG_BROADCAST, Bytes::from(payload))?.encode())
    }

    /// Decode a broadcast frame back into an envelope. Fails on foreign
    /// frame flags as well as on payload errors so consumers can drop both.
    pub fn decode(input: Bytes) -> Result<Self> {
        let frame = Frame::decode(input)?;
        if frame.header.flags != FLAG_BROADCAST {
            return Err(crate::Error::WrongKind(frame.header.flags));
        }
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(message: BroadcastMessage) -> Envelope {
        Envelope {
            sender_id: Some("node-a".to_string()),
            sent_at_ms: 42,
            message,
        }
    }

    #[test]
    fn cache_event_round_trip() {
        let mut properties = PropertyMap::new();
        properties.insert("name".to_string(), serde_json::json!("x"));
        let envelope = sealed(BroadcastMessage::Cache(CacheEvent::ObjectReset {
            group_id: 7,
            object_id: 42,
            properties,
        }));
        let decoded = Envelope::decode(envelope.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn relation_event_round_trip() {
        let envelope = sealed(BroadcastMessage::Relation(RelationEvent::AddAll {
            relation_id: 3,
            pairs: RelationPairs::new(vec![(1, 2), (3, 4)]),
        }));
        let decoded = Envelope::decode(envelope.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn sender_property_uses_wire_name() {
        let envelope = sealed(BroadcastMessage::Cache(CacheEvent::FullReset));
        let json = serde_json::to_value(&envelope).expect("to_value");
        assert_eq!(json[SENDER_PROPERTY], serde_json::json!("node-a"));
    }

    #[test]
    fn missing_sender_property_decodes_as_none() {
        let json = serde_json::json!({
            "sent_at_ms": 1,
            "message": { "kind": "cache", "action": "group_reset", "group_id": 9 },
        });
        let envelope: Envelope = serde_json::from_value(json).expect("decode");
        assert!(envelope.sender_id.is_none());
    }

    #[test]
    fn unknown_action_fails_to_decode() {
        let json = serde_json::json!({
            "Gemini.CacheMgr.ClientUUID": "peer",
            "sent_at_ms": 1,
            "message": { "kind": "cache", "action": "defragment", "group_id": 9 },
        });
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }

    #[test]
    fn foreign_frame_flag_is_rejected() {
        let envelope = sealed(BroadcastMessage::Cache(CacheEvent::FullReset));
        let payload = serde_json::to_vec(&envelope).expect("payload");
        let frame = Frame::new(0x0002, Bytes::from(payload)).expect("frame");
        assert!(Envelope::decode(frame.encode()).is_err());
    }

    #[test]
    fn group_and_relation_ids_are_exposed() {
        assert_eq!(CacheEvent::FullReset.group_id(), None);
        assert_eq!(
            CacheEvent::ObjectRemove {
                group_id: 5,
                object_id: 1,
            }
            .group_id(),
            Some(5)
        );
        assert_eq!(RelationEvent::Clear { relation_id: 11 }.relation_id(), 11);
    }
}
