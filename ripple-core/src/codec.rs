//! Wire framing
//!
//! Outbound frames carry a [`StateEvent`]; inbound frames carry a
//! [`ServerEvent`]. Both use camelCase field names and a kebab-case `type`
//! tag in either encoding.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::state::{EventId, ServerEvent, StateEvent};

/// Frame encoding shared by client and server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    /// Map-encoded MessagePack, so field names survive on the wire.
    #[serde(rename = "msgpack")]
    MessagePack,
}

#[derive(Deserialize)]
struct IdOnly {
    id: EventId,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, ProtocolError> {
        Ok(match self {
            Codec::Json => serde_json::to_vec(message)?,
            Codec::MessagePack => rmp_serde::to_vec_named(message)?,
        })
    }

    pub fn decode<'a, T: Deserialize<'a>>(&self, frame: &'a [u8]) -> Result<T, ProtocolError> {
        Ok(match self {
            Codec::Json => serde_json::from_slice(frame)?,
            Codec::MessagePack => rmp_serde::from_slice(frame)?,
        })
    }

    pub fn encode_event(&self, event: &StateEvent) -> Result<Vec<u8>, ProtocolError> {
        self.encode(event)
    }

    pub fn decode_event(&self, frame: &[u8]) -> Result<StateEvent, ProtocolError> {
        self.decode(frame)
    }

    pub fn decode_server_event(&self, frame: &[u8]) -> Result<ServerEvent, ProtocolError> {
        self.decode(frame)
    }

    /// Best-effort read of just the event id from a frame that failed to
    /// decode in full.
    pub fn peek_event_id(&self, frame: &[u8]) -> Option<EventId> {
        self.decode::<IdOnly>(frame).ok().map(|frame| frame.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntryId, Operation};
    use serde_json::json;

    #[test]
    fn both_codecs_carry_server_events() {
        let event = StateEvent::compare_and_set(EntryId::root(), json!(1), json!({"a": [1, 2]}));
        let server = ServerEvent {
            event: event.clone(),
            accepted: true,
        };

        for codec in [Codec::Json, Codec::MessagePack] {
            let frame = codec.encode(&server).unwrap();
            let back = codec.decode_server_event(&frame).unwrap();
            assert_eq!(back, server, "{codec:?}");
        }
    }

    #[test]
    fn client_frame_is_plain_json() {
        let event = StateEvent::increment(EntryId::root(), 2.0);
        let frame = Codec::Json.encode_event(&event).unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(wire["type"], "increment");
        assert_eq!(wire["entryId"], "root");
        assert!(matches!(
            Codec::Json.decode_event(&frame).unwrap().op,
            Operation::Increment { .. }
        ));
    }

    #[test]
    fn peek_recovers_id_of_unknown_event() {
        let frame = br#"{"id": "e9", "type": "warp", "accepted": true}"#;
        assert!(Codec::Json.decode_server_event(frame).is_err());
        assert_eq!(Codec::Json.peek_event_id(frame), Some(EventId::new("e9")));
        assert_eq!(Codec::Json.peek_event_id(b"not json"), None);
    }

    #[test]
    fn codec_config_names() {
        assert_eq!(serde_json::to_value(Codec::MessagePack).unwrap(), json!("msgpack"));
        assert_eq!(serde_json::from_value::<Codec>(json!("json")).unwrap(), Codec::Json);
    }
}
