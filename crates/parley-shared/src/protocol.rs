use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    CallId, CallInfo, MessageId, PresenceStatus, RequestRef, RoomAction, RoomId, RoomInfo,
    RosterEntry, UserId,
};

/// Every frame exchanged with the server, keyed on the JSON `type` field.
///
/// Inbound and outbound frames share this union so that any constructible
/// event can be encoded and decoded back to itself. Frames with an unknown
/// `type` (or a payload that does not fit their declared type) are kept as
/// [`Event::Unhandled`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Hello(Hello),
    Heartbeat(Heartbeat),
    Error(ErrorEvent),
    /// Synthesized locally when the transport closes.
    Disconnect(Disconnect),

    ChatMessage(ChatMessage),
    ChatRequest(ChatRequest),
    ChatDelivered(MessageAck),
    ChatReceived(MessageAck),

    Presence(Presence),
    RosterAdd(RosterUpdate),
    RosterRemove(RosterUpdate),
    RosterSnapshot(RosterSnapshot),

    RoomCreated(RoomCreated),
    RoomInvitation(RoomInvitation),
    RoomAction(RoomActivity),
    RoomMark(RoomMark),
    RoomJoin(RoomRequest),
    RoomLeave(RoomRequest),
    RoomInvite(RoomInvite),

    CallCreated(CallCreated),
    CallInvitation(CallInvitation),
    CallSignal(CallSignal),

    /// Raw payload of a frame this client does not understand. Encoding
    /// writes it back verbatim, so a payload taken from [`crate::decode`]
    /// decodes to the same `Unhandled` again.
    #[serde(skip)]
    Unhandled(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub device_id: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub reason: String,
    /// Request this error answers, when the server rejected a specific request.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<RequestRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room: RoomId,
    pub sender: UserId,
    pub body: String,
    #[serde(default)]
    pub delivered: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Outbound request to post `body` into `room`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub room: RoomId,
    pub body: String,
    #[serde(rename = "ref")]
    pub reference: RequestRef,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of both `chat_delivered` and `chat_received`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAck {
    pub id: MessageId,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<RequestRef>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user: UserId,
    pub status: PresenceStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterUpdate {
    pub user: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub entries: Vec<RosterEntry>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCreated {
    pub room: RoomInfo,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInvitation {
    pub room: RoomId,
    pub inviter: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomActivity {
    pub room: RoomId,
    pub originator: UserId,
    pub action: RoomAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<UserId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMark {
    pub room: RoomId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of `room_join` and `room_leave`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub room: RoomId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInvite {
    pub room: RoomId,
    pub user: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallCreated {
    pub call: CallInfo,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInvitation {
    pub call: CallId,
    pub inviter: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// WebRTC signaling exchanged between two call participants through the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    pub call: CallId,
    pub sender: UserId,
    pub recipient: UserId,
    pub signal: Signal,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// SDP offer
    Offer { sdp: String },
    /// SDP answer
    Answer { sdp: String },
    /// ICE candidate
    Candidate { candidate: String },
    /// Call ended
    Hangup { reason: String },
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
            Signal::Hangup { .. } => "hangup",
        }
    }
}

/// Discriminant of [`Event`], used as the key of handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Hello,
    Heartbeat,
    Error,
    Disconnect,
    ChatMessage,
    ChatRequest,
    ChatDelivered,
    ChatReceived,
    Presence,
    RosterAdd,
    RosterRemove,
    RosterSnapshot,
    RoomCreated,
    RoomInvitation,
    RoomAction,
    RoomMark,
    RoomJoin,
    RoomLeave,
    RoomInvite,
    CallCreated,
    CallInvitation,
    CallSignal,
    Unhandled,
}

impl EventKind {
    pub const ALL: [EventKind; 23] = [
        EventKind::Hello,
        EventKind::Heartbeat,
        EventKind::Error,
        EventKind::Disconnect,
        EventKind::ChatMessage,
        EventKind::ChatRequest,
        EventKind::ChatDelivered,
        EventKind::ChatReceived,
        EventKind::Presence,
        EventKind::RosterAdd,
        EventKind::RosterRemove,
        EventKind::RosterSnapshot,
        EventKind::RoomCreated,
        EventKind::RoomInvitation,
        EventKind::RoomAction,
        EventKind::RoomMark,
        EventKind::RoomJoin,
        EventKind::RoomLeave,
        EventKind::RoomInvite,
        EventKind::CallCreated,
        EventKind::CallInvitation,
        EventKind::CallSignal,
        EventKind::Unhandled,
    ];

    /// The wire tag carried in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Hello => "hello",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Error => "error",
            EventKind::Disconnect => "disconnect",
            EventKind::ChatMessage => "chat_message",
            EventKind::ChatRequest => "chat_request",
            EventKind::ChatDelivered => "chat_delivered",
            EventKind::ChatReceived => "chat_received",
            EventKind::Presence => "presence",
            EventKind::RosterAdd => "roster_add",
            EventKind::RosterRemove => "roster_remove",
            EventKind::RosterSnapshot => "roster_snapshot",
            EventKind::RoomCreated => "room_created",
            EventKind::RoomInvitation => "room_invitation",
            EventKind::RoomAction => "room_action",
            EventKind::RoomMark => "room_mark",
            EventKind::RoomJoin => "room_join",
            EventKind::RoomLeave => "room_leave",
            EventKind::RoomInvite => "room_invite",
            EventKind::CallCreated => "call_created",
            EventKind::CallInvitation => "call_invitation",
            EventKind::CallSignal => "call_signal",
            EventKind::Unhandled => "unhandled",
        }
    }

    /// Map a wire tag back to a kind. `unhandled` is not a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .filter(|kind| *kind != EventKind::Unhandled)
            .find(|kind| kind.as_str() == tag)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Hello(_) => EventKind::Hello,
            Event::Heartbeat(_) => EventKind::Heartbeat,
            Event::Error(_) => EventKind::Error,
            Event::Disconnect(_) => EventKind::Disconnect,
            Event::ChatMessage(_) => EventKind::ChatMessage,
            Event::ChatRequest(_) => EventKind::ChatRequest,
            Event::ChatDelivered(_) => EventKind::ChatDelivered,
            Event::ChatReceived(_) => EventKind::ChatReceived,
            Event::Presence(_) => EventKind::Presence,
            Event::RosterAdd(_) => EventKind::RosterAdd,
            Event::RosterRemove(_) => EventKind::RosterRemove,
            Event::RosterSnapshot(_) => EventKind::RosterSnapshot,
            Event::RoomCreated(_) => EventKind::RoomCreated,
            Event::RoomInvitation(_) => EventKind::RoomInvitation,
            Event::RoomAction(_) => EventKind::RoomAction,
            Event::RoomMark(_) => EventKind::RoomMark,
            Event::RoomJoin(_) => EventKind::RoomJoin,
            Event::RoomLeave(_) => EventKind::RoomLeave,
            Event::RoomInvite(_) => EventKind::RoomInvite,
            Event::CallCreated(_) => EventKind::CallCreated,
            Event::CallInvitation(_) => EventKind::CallInvitation,
            Event::CallSignal(_) => EventKind::CallSignal,
            Event::Unhandled(_) => EventKind::Unhandled,
        }
    }

    /// The entity this event is about, used to route narrow subscriptions:
    /// the room for room and chat traffic, the call for call traffic, the
    /// message for acknowledgements and the user for roster changes.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Event::ChatMessage(m) => Some(m.room.as_str()),
            Event::ChatRequest(r) => Some(r.room.as_str()),
            Event::ChatDelivered(a) | Event::ChatReceived(a) => Some(a.id.as_str()),
            Event::Presence(p) => Some(p.user.as_str()),
            Event::RosterAdd(u) | Event::RosterRemove(u) => Some(u.user.as_str()),
            Event::RoomCreated(r) => Some(r.room.id.as_str()),
            Event::RoomInvitation(r) => Some(r.room.as_str()),
            Event::RoomAction(r) => Some(r.room.as_str()),
            Event::RoomMark(r) => Some(r.room.as_str()),
            Event::RoomJoin(r) | Event::RoomLeave(r) => Some(r.room.as_str()),
            Event::RoomInvite(r) => Some(r.room.as_str()),
            Event::CallCreated(c) => Some(c.call.id.as_str()),
            Event::CallInvitation(c) => Some(c.call.as_str()),
            Event::CallSignal(s) => Some(s.call.as_str()),
            Event::Hello(_)
            | Event::Heartbeat(_)
            | Event::Error(_)
            | Event::Disconnect(_)
            | Event::RosterSnapshot(_)
            | Event::Unhandled(_) => None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Event::Error(ErrorEvent {
            reason: reason.into(),
            reference: None,
            cause: None,
            timestamp: now_millis(),
        })
    }

    /// The error raised when nobody subscribed to `event`'s kind.
    pub fn unhandled(event: &Event) -> Self {
        let cause = match event {
            Event::Unhandled(raw) => Some(raw.clone()),
            other => serde_json::to_value(other).ok(),
        };
        Event::Error(ErrorEvent {
            reason: "Unhandled message".to_string(),
            reference: None,
            // `null` is not written to the wire, so it would not come back.
            cause: cause.filter(|c| !c.is_null()),
            timestamp: now_millis(),
        })
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        Event::Disconnect(Disconnect {
            reason: reason.into(),
            timestamp: now_millis(),
        })
    }
}

/// The current time at the precision frames carry. Timestamps built with it
/// survive an encode/decode cycle unchanged.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}
