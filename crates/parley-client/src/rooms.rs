use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use parley_shared::constants::ACK_HISTORY;
use parley_shared::protocol::{
    now_millis, ChatMessage, ChatRequest, ErrorEvent, Event, MessageAck, RoomActivity,
    EventKind, RoomInvitation, RoomInvite, RoomMark, RoomRequest,
};
use parley_shared::types::{MessageId, RequestRef, RoomAction, RoomId, RoomInfo, RoomKind, UserId};
use tracing::{debug, warn};

use crate::deferred::Resolver;
use crate::error::SessionError;

/// What the session knows about a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomState {
    pub id: RoomId,
    pub name: Option<String>,
    pub kind: Option<RoomKind>,
    pub members: BTreeSet<UserId>,
    /// High-water mark of what the user has read. Never moves backwards.
    pub last_read: Option<DateTime<Utc>>,
    /// History cursor: the newest message seen.
    pub last_message: Option<MessageId>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Messages from others newer than `last_read`.
    pub unread: usize,
}

impl RoomState {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            name: None,
            kind: None,
            members: BTreeSet::new(),
            last_read: None,
            last_message: None,
            last_activity: None,
            unread: 0,
        }
    }

    fn advance_mark(&mut self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let mark = match self.last_read {
            Some(current) if current >= timestamp => current,
            _ => timestamp,
        };
        self.last_read = Some(mark);
        self.unread = 0;
        mark
    }
}

/// Insertion-ordered set that forgets its oldest entries past `capacity`.
struct Recent<T> {
    order: VecDeque<T>,
    members: HashSet<T>,
    capacity: usize,
}

impl<T: Clone + Eq + Hash> Recent<T> {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, item: &T) -> bool {
        self.members.contains(item)
    }

    /// Returns false when `item` is already remembered.
    fn insert(&mut self, item: T) -> bool {
        if self.members.contains(&item) {
            return false;
        }
        while self.order.len() >= self.capacity.max(1) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.members.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(item.clone());
        self.members.insert(item);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

/// What an inbound acknowledgement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Resolved a pending send.
    Settled,
    /// Matched no send; still worth dispatching.
    Unmatched,
    /// Same kind of acknowledgement for the same message seen before.
    Duplicate,
}

struct PendingSend {
    reference: RequestRef,
    room: RoomId,
    reply: Resolver<MessageAck>,
}

/// Room table plus the sends still waiting for an acknowledgement.
pub struct RoomLayer {
    local_user: UserId,
    rooms: HashMap<RoomId, RoomState>,
    pending: VecDeque<PendingSend>,
    /// Acknowledgements already dispatched, per kind.
    acks: Recent<(EventKind, MessageId)>,
    /// Message ids that can no longer settle a send: already acknowledged,
    /// or received from someone else.
    resolved: Recent<MessageId>,
}

impl RoomLayer {
    pub fn new(local_user: UserId) -> Self {
        Self::with_ack_history(local_user, ACK_HISTORY)
    }

    /// Remember at most `history` message ids for acknowledgement bookkeeping.
    pub fn with_ack_history(local_user: UserId, history: usize) -> Self {
        Self {
            local_user,
            rooms: HashMap::new(),
            pending: VecDeque::new(),
            acks: Recent::new(history),
            resolved: Recent::new(history),
        }
    }

    pub fn state(&self, room: &RoomId) -> Option<RoomState> {
        self.rooms.get(room).cloned()
    }

    pub fn pending_sends(&self) -> usize {
        self.pending.len()
    }

    fn room_mut(&mut self, room: &RoomId) -> &mut RoomState {
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| RoomState::new(room.clone()))
    }

    pub fn track(&mut self, info: &RoomInfo) {
        let state = self.room_mut(&info.id);
        if info.name.is_some() {
            state.name = info.name.clone();
        }
        state.kind = Some(info.kind);
        state.members.extend(info.users.iter().cloned());
    }

    pub fn on_invitation(&mut self, invitation: &RoomInvitation) {
        self.room_mut(&invitation.room)
            .members
            .insert(invitation.inviter.clone());
    }

    /// Queue a send; the caller puts the returned frame on the wire.
    pub fn send(
        &mut self,
        room: RoomId,
        body: String,
        reply: Resolver<MessageAck>,
    ) -> (RequestRef, Event) {
        let reference = RequestRef::generate();
        let event = Event::ChatRequest(ChatRequest {
            room: room.clone(),
            body,
            reference: reference.clone(),
            timestamp: now_millis(),
        });
        debug!(room = %room, reference = %reference, "Queued chat request");
        self.pending.push_back(PendingSend {
            reference: reference.clone(),
            room,
            reply,
        });
        (reference, event)
    }

    pub fn send_failed(&mut self, reference: &RequestRef, error: SessionError) {
        if let Some(pending) = self.take_pending(reference) {
            warn!(room = %pending.room, reference = %reference, error = %error, "Chat request failed");
            pending.reply.reject(error);
        }
    }

    /// Settle the send this acknowledgement answers. A message id settles at
    /// most one send, whichever receipt kind arrives first.
    pub fn on_ack(&mut self, kind: EventKind, ack: &MessageAck) -> AckOutcome {
        if !self.acks.insert((kind, ack.id.clone())) {
            debug!(kind = %kind, id = %ack.id, "Dropping duplicate acknowledgement");
            return AckOutcome::Duplicate;
        }
        if self.resolved.contains(&ack.id) {
            return AckOutcome::Unmatched;
        }

        let pending = match &ack.reference {
            Some(reference) => self.take_pending(reference),
            // The server answers a connection's requests in order.
            None => self.pending.pop_front(),
        };

        match pending {
            Some(pending) => {
                debug!(room = %pending.room, id = %ack.id, "Chat request acknowledged");
                self.resolved.insert(ack.id.clone());
                pending.reply.resolve(ack.clone());
                AckOutcome::Settled
            }
            None => {
                debug!(id = %ack.id, "Acknowledgement matches no pending send");
                AckOutcome::Unmatched
            }
        }
    }

    /// Reject the send a server error refers to. Returns whether one matched.
    pub fn on_error(&mut self, error: &ErrorEvent) -> bool {
        let Some(reference) = &error.reference else {
            return false;
        };
        match self.take_pending(reference) {
            Some(pending) => {
                warn!(room = %pending.room, reason = %error.reason, "Chat request rejected");
                pending
                    .reply
                    .reject(SessionError::Rejected(error.reason.clone()));
                true
            }
            None => false,
        }
    }

    /// Track an inbound message. Returns the delivery receipt to send back
    /// when the message is not yet marked delivered.
    pub fn on_message(&mut self, message: &ChatMessage) -> Option<Event> {
        let local = message.sender == self.local_user;
        if !local {
            self.resolved.insert(message.id.clone());
        }

        let state = self.room_mut(&message.room);
        state.members.insert(message.sender.clone());
        if state.last_activity.map_or(true, |t| message.timestamp >= t) {
            state.last_activity = Some(message.timestamp);
            state.last_message = Some(message.id.clone());
        }
        let unread = state.last_read.map_or(true, |mark| message.timestamp > mark);
        if !local && unread {
            state.unread += 1;
        }

        if message.delivered {
            return None;
        }
        Some(Event::ChatDelivered(MessageAck {
            id: message.id.clone(),
            reference: None,
            timestamp: now_millis(),
        }))
    }

    /// Local mark; returns the `room_mark` frame carrying the effective mark.
    pub fn mark(&mut self, room: &RoomId, timestamp: DateTime<Utc>) -> Event {
        let mark = self.room_mut(room).advance_mark(timestamp);
        Event::RoomMark(RoomMark {
            room: room.clone(),
            timestamp: mark,
        })
    }

    /// Mark made on another device of the same user.
    pub fn on_mark(&mut self, mark: &RoomMark) {
        self.room_mut(&mark.room).advance_mark(mark.timestamp);
    }

    pub fn on_activity(&mut self, activity: &RoomActivity) {
        let user = activity
            .subject
            .clone()
            .unwrap_or_else(|| activity.originator.clone());

        if user == self.local_user && activity.action == RoomAction::Left {
            self.rooms.remove(&activity.room);
            return;
        }

        let state = self.room_mut(&activity.room);
        match activity.action {
            RoomAction::Joined | RoomAction::Invited => {
                state.members.insert(user);
            }
            RoomAction::Left | RoomAction::Rejected => {
                state.members.remove(&user);
            }
        }
    }

    pub fn join(&mut self, room: &RoomId) -> Event {
        let local = self.local_user.clone();
        self.room_mut(room).members.insert(local);
        Event::RoomJoin(RoomRequest {
            room: room.clone(),
            timestamp: now_millis(),
        })
    }

    pub fn leave(&mut self, room: &RoomId) -> Event {
        self.rooms.remove(room);
        Event::RoomLeave(RoomRequest {
            room: room.clone(),
            timestamp: now_millis(),
        })
    }

    pub fn invite(&self, room: &RoomId, user: &UserId) -> Event {
        Event::RoomInvite(RoomInvite {
            room: room.clone(),
            user: user.clone(),
            timestamp: now_millis(),
        })
    }

    /// The connection is gone; no acknowledgement will come.
    pub fn disconnected(&mut self, reason: &str) {
        for pending in self.pending.drain(..) {
            pending
                .reply
                .reject(SessionError::Disconnected(reason.to_string()));
        }
    }

    fn take_pending(&mut self, reference: &RequestRef) -> Option<PendingSend> {
        let index = self.pending.iter().position(|p| p.reference == *reference)?;
        self.pending.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::deferred::deferred;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    const DELIVERED: EventKind = EventKind::ChatDelivered;
    const RECEIVED: EventKind = EventKind::ChatReceived;

    fn layer() -> RoomLayer {
        RoomLayer::new(UserId::from("alice"))
    }

    fn ack(id: &str, reference: Option<&RequestRef>) -> MessageAck {
        MessageAck {
            id: MessageId::from(id),
            reference: reference.cloned(),
            timestamp: Utc::now(),
        }
    }

    fn message(id: &str, sender: &str, at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: MessageId::from(id),
            room: RoomId::from("r1"),
            sender: UserId::from(sender),
            body: "hi".into(),
            delivered: false,
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_ack_without_ref_settles_oldest_send() {
        let mut rooms = layer();
        let (first_reply, first) = deferred();
        let (second_reply, second) = deferred();
        let (_, frame) = rooms.send(RoomId::from("r1"), "hi".into(), first_reply);
        rooms.send(RoomId::from("r1"), "again".into(), second_reply);

        match frame {
            Event::ChatRequest(req) => assert_eq!(req.body, "hi"),
            other => panic!("unexpected frame: {other:?}"),
        }

        assert_eq!(rooms.on_ack(DELIVERED, &ack("m1", None)), AckOutcome::Settled);
        assert_eq!(rooms.on_ack(DELIVERED, &ack("m1", None)), AckOutcome::Duplicate);
        assert_eq!(first.await.unwrap().id, MessageId::from("m1"));
        assert_eq!(rooms.pending_sends(), 1);

        assert_eq!(rooms.on_ack(DELIVERED, &ack("m2", None)), AckOutcome::Settled);
        assert_eq!(second.await.unwrap().id, MessageId::from("m2"));
    }

    #[tokio::test]
    async fn test_ack_with_ref_settles_matching_send() {
        let mut rooms = layer();
        let (first_reply, first) = deferred();
        let (second_reply, second) = deferred();
        rooms.send(RoomId::from("r1"), "one".into(), first_reply);
        let (second_ref, _) = rooms.send(RoomId::from("r2"), "two".into(), second_reply);

        assert_eq!(
            rooms.on_ack(RECEIVED, &ack("m9", Some(&second_ref))),
            AckOutcome::Settled
        );
        assert_eq!(second.await.unwrap().id, MessageId::from("m9"));
        assert_eq!(rooms.pending_sends(), 1);
        drop(rooms);
        assert!(matches!(first.await, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_error_with_ref_rejects_only_that_send() {
        let mut rooms = layer();
        let (reply, rejected) = deferred();
        let (other_reply, _other) = deferred();
        let (reference, _) = rooms.send(RoomId::from("r1"), "hi".into(), reply);
        rooms.send(RoomId::from("r1"), "still here".into(), other_reply);

        let error = ErrorEvent {
            reason: "room not found".into(),
            reference: Some(reference),
            cause: None,
            timestamp: Utc::now(),
        };
        assert!(rooms.on_error(&error));
        assert!(matches!(rejected.await, Err(SessionError::Rejected(r)) if r == "room not found"));
        assert_eq!(rooms.pending_sends(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_sends() {
        let mut rooms = layer();
        let (reply, send) = deferred();
        rooms.send(RoomId::from("r1"), "hi".into(), reply);
        rooms.disconnected("gone");
        assert!(matches!(send.await, Err(SessionError::Disconnected(_))));
    }

    #[test]
    fn test_inbound_message_sends_receipt_and_counts_unread() {
        let mut rooms = layer();
        let receipt = rooms.on_message(&message("m1", "bob", ts(10)));
        assert!(matches!(receipt, Some(Event::ChatDelivered(ref a)) if a.id == MessageId::from("m1")));

        let state = rooms.state(&RoomId::from("r1")).unwrap();
        assert_eq!(state.unread, 1);
        assert_eq!(state.last_message, Some(MessageId::from("m1")));

        let mut delivered = message("m2", "bob", ts(20));
        delivered.delivered = true;
        assert!(rooms.on_message(&delivered).is_none());
        assert_eq!(rooms.state(&RoomId::from("r1")).unwrap().unread, 2);

        // Someone else's message id never settles one of our sends.
        let (reply, _send) = deferred();
        rooms.send(RoomId::from("r1"), "hi".into(), reply);
        assert_eq!(rooms.on_ack(DELIVERED, &ack("m1", None)), AckOutcome::Unmatched);
        assert_eq!(rooms.pending_sends(), 1);
    }

    #[tokio::test]
    async fn test_read_receipt_after_delivery_is_not_a_duplicate() {
        let mut rooms = layer();
        let (reply, send) = deferred();
        let (second_reply, _second) = deferred();
        rooms.send(RoomId::from("r1"), "hi".into(), reply);
        rooms.send(RoomId::from("r1"), "again".into(), second_reply);

        assert_eq!(rooms.on_ack(DELIVERED, &ack("m1", None)), AckOutcome::Settled);
        assert_eq!(send.await.unwrap().id, MessageId::from("m1"));

        // The read receipt for the same message still reaches subscribers but
        // must not settle the next send.
        assert_eq!(rooms.on_ack(RECEIVED, &ack("m1", None)), AckOutcome::Unmatched);
        assert_eq!(rooms.pending_sends(), 1);
        assert_eq!(rooms.on_ack(RECEIVED, &ack("m1", None)), AckOutcome::Duplicate);
    }

    #[test]
    fn test_ack_history_is_bounded() {
        let mut rooms = RoomLayer::with_ack_history(UserId::from("alice"), 2);
        for (i, id) in ["m1", "m2", "m3"].into_iter().enumerate() {
            rooms.on_message(&message(id, "bob", ts(i as i64)));
            assert_eq!(rooms.on_ack(RECEIVED, &ack(id, None)), AckOutcome::Unmatched);
        }
        assert_eq!(rooms.acks.len(), 2);
        assert_eq!(rooms.resolved.len(), 2);

        assert_eq!(rooms.on_ack(RECEIVED, &ack("m3", None)), AckOutcome::Duplicate);
        // Forgotten: m1 is the oldest entry.
        assert!(!rooms.resolved.contains(&MessageId::from("m1")));
        assert_eq!(rooms.on_ack(RECEIVED, &ack("m1", None)), AckOutcome::Unmatched);
    }

    #[test]
    fn test_recent_forgets_oldest_first() {
        let mut recent = Recent::new(2);
        assert!(recent.insert(1));
        assert!(recent.insert(2));
        assert!(!recent.insert(1));
        assert!(recent.insert(3));
        assert!(!recent.contains(&1));
        assert!(recent.contains(&2) && recent.contains(&3));
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_mark_is_monotonic_and_resets_unread() {
        let mut rooms = layer();
        let room = RoomId::from("r1");
        rooms.on_message(&message("m1", "bob", ts(10)));

        match rooms.mark(&room, ts(30)) {
            Event::RoomMark(mark) => assert_eq!(mark.timestamp, ts(30)),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(rooms.state(&room).unwrap().unread, 0);

        match rooms.mark(&room, ts(30) - Duration::seconds(20)) {
            Event::RoomMark(mark) => assert_eq!(mark.timestamp, ts(30)),
            other => panic!("unexpected frame: {other:?}"),
        }

        // Older than the mark: not unread.
        rooms.on_message(&message("m0", "bob", ts(5)));
        assert_eq!(rooms.state(&room).unwrap().unread, 0);

        rooms.on_mark(&RoomMark {
            room: room.clone(),
            timestamp: ts(40),
        });
        assert_eq!(rooms.state(&room).unwrap().last_read, Some(ts(40)));
    }

    #[test]
    fn test_membership_tracking() {
        let mut rooms = layer();
        let room = RoomId::from("r1");
        rooms.track(&RoomInfo {
            id: room.clone(),
            name: Some("general".into()),
            kind: RoomKind::Group,
            users: vec![UserId::from("bob")],
        });
        rooms.join(&room);
        rooms.on_activity(&RoomActivity {
            room: room.clone(),
            originator: UserId::from("bob"),
            action: RoomAction::Invited,
            subject: Some(UserId::from("carol")),
            timestamp: Utc::now(),
        });

        let state = rooms.state(&room).unwrap();
        assert_eq!(state.name.as_deref(), Some("general"));
        assert_eq!(state.members.len(), 3);

        assert!(matches!(rooms.leave(&room), Event::RoomLeave(_)));
        assert!(rooms.state(&room).is_none());
    }
}
