//! Behavior handles attached to invitations and to created or fetched
//! entities.
//!
//! A handle is an id plus a way to reach the session: every operation is a
//! command to the dispatch task, every subscription a narrow registration.
//! Handles keep no state of their own.

use chrono::{DateTime, Utc};
use parley_media::{CallState, MediaHandle};
use parley_shared::constants::REASON_HANGUP;
use parley_shared::protocol::{CallInvitation, Event, EventKind, MessageAck, RoomInvitation};
use parley_shared::types::{CallId, CallInfo, CallKind, RoomId, RoomInfo, RoomKind, UserId};

use crate::calls::CallSnapshot;
use crate::command::{Commands, SessionCommand};
use crate::config::{ClientConfig, RtcConfig};
use crate::error::Result;
use crate::events::{HandlerId, WeakEventHandler};
use crate::rooms::RoomState;

/// What a handle needs to reach its session. The registry is held weakly:
/// callbacks routinely capture the handle they were registered through.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) commands: Commands,
    pub(crate) events: WeakEventHandler,
}

impl Link {
    fn subscribe<F>(&self, kind: EventKind, entity: &str, callback: F) -> Option<HandlerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events
            .upgrade()
            .map(|events| events.on_concrete_event(kind, entity, callback))
    }
}

/// Result of upgrading an inbound event.
pub enum Upgraded {
    IncomingCall(IncomingCall),
    RoomInvite(RoomInvite),
    Room(RoomHandle),
    Call(CallHandle),
}

/// Attach a handle to events that carry something actionable. Other events
/// come back as `None`.
pub(crate) fn upgrade(event: &Event, config: &ClientConfig, link: &Link) -> Option<Upgraded> {
    match event {
        Event::CallInvitation(invitation) => Some(Upgraded::IncomingCall(IncomingCall::new(
            invitation,
            config,
            link.clone(),
        ))),
        Event::RoomInvitation(invitation) => {
            Some(Upgraded::RoomInvite(RoomInvite::new(invitation, link.clone())))
        }
        Event::RoomCreated(created) => Some(Upgraded::Room(RoomHandle::from_info(
            &created.room,
            link.clone(),
        ))),
        Event::CallCreated(created) => Some(Upgraded::Call(CallHandle::from_info(
            &created.call,
            config,
            link.clone(),
        ))),
        _ => None,
    }
}

/// Somebody is calling. Answer or reject it.
#[derive(Clone)]
pub struct IncomingCall {
    call: CallId,
    inviter: UserId,
    timestamp: DateTime<Utc>,
    rtc: RtcConfig,
    link: Link,
}

impl IncomingCall {
    pub(crate) fn new(invitation: &CallInvitation, config: &ClientConfig, link: Link) -> Self {
        Self {
            call: invitation.call.clone(),
            inviter: invitation.inviter.clone(),
            timestamp: invitation.timestamp,
            rtc: config.rtc.clone(),
            link,
        }
    }

    pub fn id(&self) -> &CallId {
        &self.call
    }

    pub fn inviter(&self) -> &UserId {
        &self.inviter
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Settings the host should build its media engine with.
    pub fn rtc(&self) -> &RtcConfig {
        &self.rtc
    }

    pub async fn answer(&self, media: MediaHandle) -> Result<CallHandle> {
        let call = self.call.clone();
        let snapshot = self
            .link
            .commands
            .request(|reply| SessionCommand::Answer { call, media, reply })
            .await?;
        Ok(CallHandle::from_snapshot(
            &snapshot,
            self.rtc.clone(),
            self.link.clone(),
        ))
    }

    pub async fn reject(&self) -> Result<()> {
        let call = self.call.clone();
        self.link
            .commands
            .request(|reply| SessionCommand::Reject { call, reply })
            .await
    }
}

/// Invitation to a room.
#[derive(Clone)]
pub struct RoomInvite {
    room: RoomId,
    inviter: UserId,
    link: Link,
}

impl RoomInvite {
    pub(crate) fn new(invitation: &RoomInvitation, link: Link) -> Self {
        Self {
            room: invitation.room.clone(),
            inviter: invitation.inviter.clone(),
            link,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn inviter(&self) -> &UserId {
        &self.inviter
    }

    pub async fn join(&self) -> Result<RoomHandle> {
        let room = self.room.clone();
        self.link
            .commands
            .request(|reply| SessionCommand::JoinRoom { room, reply })
            .await?;
        Ok(RoomHandle::new(self.room.clone(), None, None, self.link.clone()))
    }
}

#[derive(Clone)]
pub struct RoomHandle {
    id: RoomId,
    name: Option<String>,
    kind: Option<RoomKind>,
    link: Link,
}

impl RoomHandle {
    pub(crate) fn new(id: RoomId, name: Option<String>, kind: Option<RoomKind>, link: Link) -> Self {
        Self {
            id,
            name,
            kind,
            link,
        }
    }

    pub(crate) fn from_info(info: &RoomInfo, link: Link) -> Self {
        Self::new(info.id.clone(), info.name.clone(), Some(info.kind), link)
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> Option<RoomKind> {
        self.kind
    }

    /// Resolves with the server's acknowledgement.
    pub async fn send(&self, body: impl Into<String>) -> Result<MessageAck> {
        let room = self.id.clone();
        let body = body.into();
        self.link
            .commands
            .request(|reply| SessionCommand::SendMessage { room, body, reply })
            .await
    }

    pub async fn mark(&self, timestamp: DateTime<Utc>) -> Result<()> {
        let room = self.id.clone();
        self.link
            .commands
            .request(|reply| SessionCommand::Mark {
                room,
                timestamp,
                reply,
            })
            .await
    }

    pub async fn leave(&self) -> Result<()> {
        let room = self.id.clone();
        self.link
            .commands
            .request(|reply| SessionCommand::LeaveRoom { room, reply })
            .await
    }

    pub async fn invite(&self, user: UserId) -> Result<()> {
        let room = self.id.clone();
        self.link
            .commands
            .request(|reply| SessionCommand::InviteToRoom { room, user, reply })
            .await
    }

    /// `None` once the room was left.
    pub async fn state(&self) -> Result<Option<RoomState>> {
        let room = self.id.clone();
        self.link
            .commands
            .request(|reply| SessionCommand::RoomState { room, reply })
            .await
    }

    /// Messages posted to this room. `None` if the session is gone.
    pub fn on_message<F>(&self, callback: F) -> Option<HandlerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.link
            .subscribe(EventKind::ChatMessage, self.id.as_str(), callback)
    }

    pub fn on_mark<F>(&self, callback: F) -> Option<HandlerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.link
            .subscribe(EventKind::RoomMark, self.id.as_str(), callback)
    }

    /// Joins, leaves and invitations in this room.
    pub fn on_action<F>(&self, callback: F) -> Option<HandlerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.link
            .subscribe(EventKind::RoomAction, self.id.as_str(), callback)
    }
}

#[derive(Clone)]
pub struct CallHandle {
    id: CallId,
    kind: CallKind,
    users: Vec<UserId>,
    rtc: RtcConfig,
    link: Link,
}

impl CallHandle {
    pub(crate) fn from_info(info: &CallInfo, config: &ClientConfig, link: Link) -> Self {
        Self {
            id: info.id.clone(),
            kind: info.kind,
            users: info.users.clone(),
            rtc: config.rtc.clone(),
            link,
        }
    }

    pub(crate) fn from_snapshot(snapshot: &CallSnapshot, rtc: RtcConfig, link: Link) -> Self {
        Self {
            id: snapshot.id.clone(),
            kind: snapshot.kind,
            users: snapshot.users.clone(),
            rtc,
            link,
        }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Participants as of when the handle was made.
    pub fn users(&self) -> &[UserId] {
        &self.users
    }

    pub fn rtc(&self) -> &RtcConfig {
        &self.rtc
    }

    /// Offer this call to `peers` with the given local stream.
    pub async fn offer(&self, peers: Vec<UserId>, media: MediaHandle) -> Result<CallHandle> {
        let call = Some(self.id.clone());
        let kind = self.kind;
        let snapshot = self
            .link
            .commands
            .request(|reply| SessionCommand::Offer {
                call,
                kind,
                peers,
                media,
                reply,
            })
            .await?;
        Ok(Self::from_snapshot(&snapshot, self.rtc.clone(), self.link.clone()))
    }

    pub async fn hangup(&self, reason: Option<&str>) -> Result<()> {
        let call = self.id.clone();
        let reason = reason.unwrap_or(REASON_HANGUP).to_string();
        self.link
            .commands
            .request(|reply| SessionCommand::Hangup {
                call,
                reason,
                reply,
            })
            .await
    }

    /// Ended once the session dropped the call.
    pub async fn state(&self) -> Result<CallState> {
        let call = self.id.clone();
        let snapshot = self
            .link
            .commands
            .request(|reply| SessionCommand::CallState { call, reply })
            .await?;
        Ok(snapshot.map_or(CallState::Ended, |s| s.state))
    }

    /// Signaling on this call, hangups included.
    pub fn on_signal<F>(&self, callback: F) -> Option<HandlerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.link
            .subscribe(EventKind::CallSignal, self.id.as_str(), callback)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use parley_shared::protocol::{CallCreated, ChatMessage, RoomCreated};
    use tokio::sync::mpsc;

    use super::*;
    use crate::events::EventHandler;

    fn link(events: &EventHandler) -> (Link, mpsc::UnboundedReceiver<SessionCommand>) {
        let commands = Commands::default();
        let (tx, rx) = mpsc::unbounded_channel();
        commands.install(tx);
        (
            Link {
                commands,
                events: events.downgrade(),
            },
            rx,
        )
    }

    #[test]
    fn test_upgrade_picks_handle_by_kind() {
        let events = EventHandler::new();
        let (link, _rx) = link(&events);
        let config = ClientConfig::default();
        let now = Utc::now();

        let invitation = Event::CallInvitation(CallInvitation {
            call: "c1".into(),
            inviter: "bob".into(),
            timestamp: now,
        });
        match upgrade(&invitation, &config, &link) {
            Some(Upgraded::IncomingCall(call)) => {
                assert_eq!(call.id().as_str(), "c1");
                assert_eq!(call.inviter().as_str(), "bob");
                assert_eq!(call.rtc(), &config.rtc);
            }
            _ => panic!("expected an incoming call"),
        }

        let created = Event::RoomCreated(RoomCreated {
            room: RoomInfo {
                id: "r1".into(),
                name: Some("general".into()),
                kind: RoomKind::Group,
                users: Vec::new(),
            },
            timestamp: now,
        });
        match upgrade(&created, &config, &link) {
            Some(Upgraded::Room(room)) => {
                assert_eq!(room.name(), Some("general"));
                assert_eq!(room.kind(), Some(RoomKind::Group));
            }
            _ => panic!("expected a room handle"),
        }

        let call = Event::CallCreated(CallCreated {
            call: CallInfo {
                id: "c2".into(),
                kind: CallKind::Group,
                users: vec!["alice".into(), "bob".into()],
                created: now,
            },
            timestamp: now,
        });
        assert!(matches!(
            upgrade(&call, &config, &link),
            Some(Upgraded::Call(handle)) if handle.users().len() == 2
        ));

        assert!(upgrade(&Event::error("nope"), &config, &link).is_none());
    }

    #[tokio::test]
    async fn test_reject_sends_command() {
        let events = EventHandler::new();
        let (link, mut rx) = link(&events);
        let incoming = IncomingCall::new(
            &CallInvitation {
                call: "c1".into(),
                inviter: "bob".into(),
                timestamp: Utc::now(),
            },
            &ClientConfig::default(),
            link,
        );

        let task = tokio::spawn(async move { incoming.reject().await });
        match rx.recv().await {
            Some(SessionCommand::Reject { call, reply }) => {
                assert_eq!(call.as_str(), "c1");
                reply.resolve(());
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_room_subscriptions_are_narrow() {
        let events = EventHandler::new();
        let (link, _rx) = link(&events);
        let room = RoomHandle::new("r1".into(), None, None, link);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        assert!(room
            .on_message(move |e| {
                if let Event::ChatMessage(m) = e {
                    log.lock().unwrap().push(m.body.clone());
                }
            })
            .is_some());

        for (room, body) in [("r1", "here"), ("r2", "elsewhere")] {
            events.notify(&Event::ChatMessage(ChatMessage {
                id: body.into(),
                room: room.into(),
                sender: "bob".into(),
                body: body.into(),
                delivered: true,
                timestamp: Utc::now(),
            }));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["here".to_string()]);

        drop(events);
        assert!(room.on_mark(|_| {}).is_none());
    }
}
