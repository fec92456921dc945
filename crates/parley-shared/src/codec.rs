//! JSON frame codec.
//!
//! Decoding never fails: anything that is not a well-formed frame of a known
//! type comes back as [`Event::Unhandled`] holding the raw payload, so a
//! misbehaving server can never stop the dispatch loop.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::protocol::{Event, EventKind};

/// A single encoded message crossing the transport boundary.
pub type Frame = String;

pub fn decode(frame: &str) -> Event {
    let value: Value = match serde_json::from_str(frame) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, len = frame.len(), "Frame is not JSON, passing through");
            return Event::Unhandled(Value::String(frame.to_string()));
        }
    };

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(EventKind::from_tag);

    let Some(kind) = kind else {
        debug!(frame = %value, "Unknown frame type, passing through");
        return Event::Unhandled(value);
    };

    match Event::deserialize(&value) {
        Ok(event) => event,
        Err(e) => {
            warn!(kind = %kind, error = %e, "Malformed frame, passing through");
            Event::Unhandled(value)
        }
    }
}

pub fn encode(event: &Event) -> Result<Frame, ProtocolError> {
    let frame = match event {
        Event::Unhandled(raw) => raw.to_string(),
        other => serde_json::to_string(other)?,
    };

    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::protocol::*;
    use crate::types::*;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn sample_events() -> Vec<Event> {
        let t = ts(1_700_000_000_123);
        vec![
            Event::Hello(Hello {
                device_id: "alice".into(),
                timestamp: t,
            }),
            Event::Heartbeat(Heartbeat { timestamp: t }),
            Event::Error(ErrorEvent {
                reason: "room not found".into(),
                reference: Some("ref-1".into()),
                cause: Some(json!({"room": "r9"})),
                timestamp: t,
            }),
            Event::Disconnect(Disconnect {
                reason: "closed".into(),
                timestamp: t,
            }),
            Event::ChatMessage(ChatMessage {
                id: "m1".into(),
                room: "r1".into(),
                sender: "bob".into(),
                body: "hi".into(),
                delivered: false,
                timestamp: t,
            }),
            Event::ChatRequest(ChatRequest {
                room: "r1".into(),
                body: "hi".into(),
                reference: "ref-2".into(),
                timestamp: t,
            }),
            Event::ChatDelivered(MessageAck {
                id: "m1".into(),
                reference: None,
                timestamp: t,
            }),
            Event::ChatReceived(MessageAck {
                id: "m1".into(),
                reference: Some("ref-2".into()),
                timestamp: t,
            }),
            Event::Presence(Presence {
                user: "bob".into(),
                status: PresenceStatus::Available,
                timestamp: t,
            }),
            Event::RosterAdd(RosterUpdate {
                user: "bob".into(),
                timestamp: t,
            }),
            Event::RosterRemove(RosterUpdate {
                user: "bob".into(),
                timestamp: t,
            }),
            Event::RosterSnapshot(RosterSnapshot {
                entries: vec![RosterEntry {
                    user: "carol".into(),
                    status: PresenceStatus::Unavailable,
                }],
                timestamp: t,
            }),
            Event::RoomCreated(RoomCreated {
                room: RoomInfo {
                    id: "r2".into(),
                    name: Some("general".into()),
                    kind: RoomKind::Group,
                    users: vec!["alice".into()],
                },
                timestamp: t,
            }),
            Event::RoomInvitation(RoomInvitation {
                room: "r2".into(),
                inviter: "bob".into(),
                timestamp: t,
            }),
            Event::RoomAction(RoomActivity {
                room: "r2".into(),
                originator: "bob".into(),
                action: RoomAction::Invited,
                subject: Some("carol".into()),
                timestamp: t,
            }),
            Event::RoomMark(RoomMark {
                room: "r2".into(),
                timestamp: t,
            }),
            Event::RoomJoin(RoomRequest {
                room: "r2".into(),
                timestamp: t,
            }),
            Event::RoomLeave(RoomRequest {
                room: "r2".into(),
                timestamp: t,
            }),
            Event::RoomInvite(RoomInvite {
                room: "r2".into(),
                user: "dave".into(),
                timestamp: t,
            }),
            Event::CallCreated(CallCreated {
                call: CallInfo {
                    id: "c1".into(),
                    kind: CallKind::Group,
                    users: vec!["alice".into(), "bob".into()],
                    created: t,
                },
                timestamp: t,
            }),
            Event::CallInvitation(CallInvitation {
                call: "c1".into(),
                inviter: "bob".into(),
                timestamp: t,
            }),
            Event::CallSignal(CallSignal {
                call: "c1".into(),
                sender: "bob".into(),
                recipient: "alice".into(),
                signal: Signal::Hangup {
                    reason: "rejected".into(),
                },
                timestamp: t,
            }),
            Event::Unhandled(json!({"type": "typing", "room": "r1"})),
        ]
    }

    #[test]
    fn test_decode_encode_roundtrip() {
        for event in sample_events() {
            let frame = encode(&event).unwrap();
            assert_eq!(decode(&frame), event, "frame: {frame}");
        }
    }

    #[test]
    fn test_locally_built_events_roundtrip() {
        let malformed = decode(r#"{"type":"heartbeat"}"#);
        let built = vec![
            Event::error("boom"),
            Event::disconnect("closed by client"),
            Event::unhandled(&Event::error("boom")),
            Event::unhandled(&Event::Unhandled(Value::Null)),
            Event::unhandled(&malformed),
            malformed,
            Event::Heartbeat(Heartbeat {
                timestamp: now_millis(),
            }),
        ];
        for event in built {
            let frame = encode(&event).unwrap();
            assert_eq!(decode(&frame), event, "frame: {frame}");
        }
    }

    #[test]
    fn test_samples_cover_every_kind() {
        let kinds: Vec<EventKind> = sample_events().iter().map(Event::kind).collect();
        for kind in EventKind::ALL {
            assert!(kinds.contains(&kind), "no sample for {kind}");
        }
    }

    #[test]
    fn test_decode_known_frame() {
        let frame = r#"{"type":"chat_delivered","id":"m1","timestamp":1700000000000}"#;
        match decode(frame) {
            Event::ChatDelivered(ack) => {
                assert_eq!(ack.id, MessageId::from("m1"));
                assert_eq!(ack.reference, None);
                assert_eq!(ack.timestamp, ts(1_700_000_000_000));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_is_total() {
        assert_eq!(
            decode("not json"),
            Event::Unhandled(Value::String("not json".into()))
        );
        assert_eq!(decode("[1,2]"), Event::Unhandled(json!([1, 2])));
        assert_eq!(
            decode(r#"{"type":"mystery"}"#),
            Event::Unhandled(json!({"type": "mystery"}))
        );
        // A known type with a payload that does not fit it.
        assert_eq!(
            decode(r#"{"type":"room_mark"}"#),
            Event::Unhandled(json!({"type": "room_mark"}))
        );
    }

    #[test]
    fn test_wire_tags_match_kinds() {
        for event in sample_events() {
            if let Event::Unhandled(_) = event {
                continue;
            }
            let value: Value = serde_json::from_str(&encode(&event).unwrap()).unwrap();
            assert_eq!(value["type"], event.kind().as_str());
        }
    }

    #[test]
    fn test_encode_rejects_oversized_frames() {
        let event = Event::ChatRequest(ChatRequest {
            room: "r1".into(),
            body: "x".repeat(MAX_FRAME_SIZE),
            reference: "ref".into(),
            timestamp: ts(0),
        });
        assert!(matches!(
            encode(&event),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
