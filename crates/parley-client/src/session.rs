//! Session facade and its dispatch task.
//!
//! The facade is cheap to clone and only sends commands; all session state
//! (calls, rooms, roster, pending sends) lives in the [`Driver`], which runs
//! in its own tokio task and handles inbound frames and commands one at a
//! time, in arrival order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_media::{MediaEngine, MediaEvent, MediaHandle};
use parley_shared::constants::REASON_HANGUP;
use parley_shared::decode;
use parley_shared::protocol::{
    now_millis, Disconnect, ErrorEvent, Event, EventKind, Heartbeat, Hello, MessageAck,
    RosterUpdate,
};
use parley_shared::types::{CallId, CallKind, RoomId, RosterEntry, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ResourceApi;
use crate::calls::{CallManager, CallSnapshot, Effects};
use crate::command::{Commands, SessionCommand};
use crate::config::ClientConfig;
use crate::error::{Result, SessionError};
use crate::events::{EventHandler, HandlerId};
use crate::rooms::{AckOutcome, RoomLayer, RoomState};
use crate::roster::Roster;
use crate::transport::{Outbox, Transport, TransportEvent};
use crate::upgrade::{upgrade, CallHandle, IncomingCall, Link, RoomHandle, RoomInvite, Upgraded};

/// Kinds the session consumes itself. Registering them keeps them from
/// surfacing as unhandled when the application does not subscribe.
const CONSUMED_KINDS: [EventKind; 13] = [
    EventKind::Hello,
    EventKind::Heartbeat,
    EventKind::ChatMessage,
    EventKind::ChatDelivered,
    EventKind::ChatReceived,
    EventKind::Presence,
    EventKind::RosterAdd,
    EventKind::RosterRemove,
    EventKind::RosterSnapshot,
    EventKind::RoomMark,
    EventKind::RoomAction,
    EventKind::CallSignal,
    EventKind::CallCreated,
];

const REASON_CLIENT_CLOSED: &str = "closed by client";
const REASON_CONNECTION_LOST: &str = "connection lost";

/// One user's connection to the service.
#[derive(Clone)]
pub struct Session {
    config: Arc<ClientConfig>,
    events: EventHandler,
    commands: Commands,
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaEngine>,
    api: Arc<dyn ResourceApi>,
}

impl Session {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaEngine>,
        api: Arc<dyn ResourceApi>,
    ) -> Self {
        let events = EventHandler::new();
        for kind in CONSUMED_KINDS {
            events.on_event(kind, |_| {});
        }

        Self {
            config: Arc::new(config),
            events,
            commands: Commands::default(),
            transport,
            media,
            api,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_user(&self) -> &UserId {
        &self.config.session_id
    }

    /// The registry behind this session's subscriptions.
    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    /// Open the transport and start dispatching. Connecting a connected
    /// session does nothing.
    pub async fn connect(&self) -> Result<()> {
        if self.commands.is_connected() {
            debug!("Session already connected");
            return Ok(());
        }

        let url = self.config.ws_url();
        let connection = self
            .transport
            .connect(&url, self.config.inbound_buffer)
            .await?;
        info!(url = %url, user = %self.config.session_id, "Session connected");

        let (tx, rx) = mpsc::unbounded_channel();
        self.commands.install(tx);

        let driver = Driver {
            events: self.events.clone(),
            outbox: connection.outbox,
            calls: CallManager::new(self.config.session_id.clone(), self.media.clone()),
            rooms: RoomLayer::new(self.config.session_id.clone()),
            roster: Roster::new(),
        };
        tokio::spawn(driver.run(connection.inbound, rx));
        Ok(())
    }

    /// Close the transport. Live calls end, pending sends are rejected and a
    /// `disconnect` event is dispatched before this returns.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.commands.is_connected() {
            return Ok(());
        }
        self.commands
            .request(|reply| SessionCommand::Disconnect { reply })
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.commands.is_connected()
    }

    fn link(&self) -> Link {
        Link {
            commands: self.commands.clone(),
            events: self.events.downgrade(),
        }
    }

    // ---- subscriptions ----

    pub fn on_event<F>(&self, kind: EventKind, callback: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on_event(kind, callback)
    }

    pub fn on_concrete_event<F>(&self, kind: EventKind, entity: &str, callback: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on_concrete_event(kind, entity, callback)
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn on_connect<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Hello) + Send + Sync + 'static,
    {
        self.events.on_event(EventKind::Hello, move |event| {
            if let Event::Hello(hello) = event {
                callback(hello);
            }
        })
    }

    pub fn on_disconnect<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Disconnect) + Send + Sync + 'static,
    {
        self.events.on_event(EventKind::Disconnect, move |event| {
            if let Event::Disconnect(disconnect) = event {
                callback(disconnect);
            }
        })
    }

    pub fn on_heartbeat<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Heartbeat) + Send + Sync + 'static,
    {
        self.events.on_event(EventKind::Heartbeat, move |event| {
            if let Event::Heartbeat(heartbeat) = event {
                callback(heartbeat);
            }
        })
    }

    pub fn on_error<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.events.on_error(move |event| {
            if let Event::Error(error) = event {
                callback(error);
            }
        })
    }

    pub fn on_call_created<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(CallHandle) + Send + Sync + 'static,
    {
        self.on_upgraded(EventKind::CallCreated, move |upgraded| {
            if let Upgraded::Call(call) = upgraded {
                callback(call);
            }
        })
    }

    pub fn on_call_invitation<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(IncomingCall) + Send + Sync + 'static,
    {
        self.on_upgraded(EventKind::CallInvitation, move |upgraded| {
            if let Upgraded::IncomingCall(call) = upgraded {
                callback(call);
            }
        })
    }

    pub fn on_room_created<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(RoomHandle) + Send + Sync + 'static,
    {
        self.on_upgraded(EventKind::RoomCreated, move |upgraded| {
            if let Upgraded::Room(room) = upgraded {
                callback(room);
            }
        })
    }

    pub fn on_room_invitation<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(RoomInvite) + Send + Sync + 'static,
    {
        self.on_upgraded(EventKind::RoomInvitation, move |upgraded| {
            if let Upgraded::RoomInvite(invite) = upgraded {
                callback(invite);
            }
        })
    }

    pub fn on_remote_stream<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&UserId, &MediaHandle) + Send + Sync + 'static,
    {
        self.events.on_remote_stream(callback)
    }

    fn on_upgraded<F>(&self, kind: EventKind, callback: F) -> HandlerId
    where
        F: Fn(Upgraded) + Send + Sync + 'static,
    {
        let config = self.config.clone();
        let link = self.link();
        self.events.on_event(kind, move |event| {
            if let Some(upgraded) = upgrade(event, &config, &link) {
                callback(upgraded);
            }
        })
    }

    // ---- calls ----

    /// Call `peers` with the given local stream. A single peer makes a direct
    /// call; offering again to a peer already in a live direct call returns
    /// that call.
    pub async fn offer_call(&self, peers: &[UserId], media: MediaHandle) -> Result<CallHandle> {
        let kind = if peers.len() == 1 {
            CallKind::Direct
        } else {
            CallKind::Group
        };
        let peers = peers.to_vec();
        let snapshot = self
            .commands
            .request(|reply| SessionCommand::Offer {
                call: None,
                kind,
                peers,
                media,
                reply,
            })
            .await?;
        Ok(self.call_handle(&snapshot))
    }

    /// Create a group call through the resource API. Offer it with
    /// [`CallHandle::offer`].
    pub async fn create_call(&self, users: &[UserId]) -> Result<CallHandle> {
        let info = self.api.create_call(users).await?;
        self.track(SessionCommand::TrackCall(info.clone()));
        Ok(CallHandle::from_info(&info, &self.config, self.link()))
    }

    pub async fn create_direct_call(&self, peer: &UserId) -> Result<CallHandle> {
        let info = self.api.create_direct_call(peer).await?;
        self.track(SessionCommand::TrackCall(info.clone()));
        Ok(CallHandle::from_info(&info, &self.config, self.link()))
    }

    pub async fn get_call(&self, call: &CallId) -> Result<CallHandle> {
        let info = self.api.get_call(call).await?;
        self.track(SessionCommand::TrackCall(info.clone()));
        Ok(CallHandle::from_info(&info, &self.config, self.link()))
    }

    pub async fn get_calls(&self) -> Result<Vec<CallHandle>> {
        let calls = self.api.get_calls().await?;
        Ok(calls
            .into_iter()
            .map(|info| {
                self.track(SessionCommand::TrackCall(info.clone()));
                CallHandle::from_info(&info, &self.config, self.link())
            })
            .collect())
    }

    pub async fn answer_call(&self, call: &CallId, media: MediaHandle) -> Result<CallHandle> {
        let call = call.clone();
        let snapshot = self
            .commands
            .request(|reply| SessionCommand::Answer { call, media, reply })
            .await?;
        Ok(self.call_handle(&snapshot))
    }

    pub async fn reject_call(&self, call: &CallId) -> Result<()> {
        let call = call.clone();
        self.commands
            .request(|reply| SessionCommand::Reject { call, reply })
            .await
    }

    pub async fn hangup_call(&self, call: &CallId, reason: Option<&str>) -> Result<()> {
        let call = call.clone();
        let reason = reason.unwrap_or(REASON_HANGUP).to_string();
        self.commands
            .request(|reply| SessionCommand::Hangup {
                call,
                reason,
                reply,
            })
            .await
    }

    /// `None` for calls the session does not know, ended ones included.
    pub async fn call_state(&self, call: &CallId) -> Result<Option<CallSnapshot>> {
        let call = call.clone();
        self.commands
            .request(|reply| SessionCommand::CallState { call, reply })
            .await
    }

    fn call_handle(&self, snapshot: &CallSnapshot) -> CallHandle {
        CallHandle::from_snapshot(snapshot, self.config.rtc.clone(), self.link())
    }

    // ---- rooms ----

    pub async fn create_room(&self, name: &str) -> Result<RoomHandle> {
        let info = self.api.create_room(name).await?;
        self.track(SessionCommand::TrackRoom(info.clone()));
        Ok(RoomHandle::from_info(&info, self.link()))
    }

    pub async fn create_direct_room(&self, peer: &UserId) -> Result<RoomHandle> {
        let info = self.api.create_direct_room(peer).await?;
        self.track(SessionCommand::TrackRoom(info.clone()));
        Ok(RoomHandle::from_info(&info, self.link()))
    }

    pub async fn get_room(&self, room: &RoomId) -> Result<RoomHandle> {
        let info = self.api.get_room(room).await?;
        self.track(SessionCommand::TrackRoom(info.clone()));
        Ok(RoomHandle::from_info(&info, self.link()))
    }

    pub async fn get_rooms(&self) -> Result<Vec<RoomHandle>> {
        let rooms = self.api.get_rooms().await?;
        Ok(rooms
            .into_iter()
            .map(|info| {
                self.track(SessionCommand::TrackRoom(info.clone()));
                RoomHandle::from_info(&info, self.link())
            })
            .collect())
    }

    pub async fn join_room(&self, room: &RoomId) -> Result<RoomHandle> {
        let id = room.clone();
        self.commands
            .request(|reply| SessionCommand::JoinRoom { room: id, reply })
            .await?;
        Ok(RoomHandle::new(room.clone(), None, None, self.link()))
    }

    pub async fn leave_room(&self, room: &RoomId) -> Result<()> {
        let room = room.clone();
        self.commands
            .request(|reply| SessionCommand::LeaveRoom { room, reply })
            .await
    }

    pub async fn invite_to_room(&self, room: &RoomId, user: &UserId) -> Result<()> {
        let room = room.clone();
        let user = user.clone();
        self.commands
            .request(|reply| SessionCommand::InviteToRoom { room, user, reply })
            .await
    }

    /// Resolves with the server's acknowledgement of the message.
    pub async fn send_message(&self, room: &RoomId, body: impl Into<String>) -> Result<MessageAck> {
        let room = room.clone();
        let body = body.into();
        self.commands
            .request(|reply| SessionCommand::SendMessage { room, body, reply })
            .await
    }

    pub async fn mark(&self, room: &RoomId, timestamp: DateTime<Utc>) -> Result<()> {
        let room = room.clone();
        self.commands
            .request(|reply| SessionCommand::Mark {
                room,
                timestamp,
                reply,
            })
            .await
    }

    pub async fn room_state(&self, room: &RoomId) -> Result<Option<RoomState>> {
        let room = room.clone();
        self.commands
            .request(|reply| SessionCommand::RoomState { room, reply })
            .await
    }

    // ---- roster ----

    /// Fetch the roster from the resource API and replace the local table.
    pub async fn get_roster(&self) -> Result<Vec<RosterEntry>> {
        let entries = self.api.get_roster().await?;
        self.track(SessionCommand::ApplyRoster(entries.clone()));
        Ok(entries)
    }

    /// The local roster table.
    pub async fn roster(&self) -> Result<Vec<RosterEntry>> {
        self.commands
            .request(|reply| SessionCommand::Roster { reply })
            .await
    }

    pub async fn add_to_roster(&self, user: &UserId) -> Result<()> {
        let user = user.clone();
        self.commands
            .request(|reply| SessionCommand::AddToRoster { user, reply })
            .await
    }

    pub async fn remove_from_roster(&self, user: &UserId) -> Result<()> {
        let user = user.clone();
        self.commands
            .request(|reply| SessionCommand::RemoveFromRoster { user, reply })
            .await
    }

    /// Where the host's media engine reports what it discovers.
    pub fn media_sink(&self) -> MediaSink {
        MediaSink {
            commands: self.commands.clone(),
        }
    }

    fn track(&self, command: SessionCommand) {
        // Entities fetched while disconnected are still returned; the session
        // learns about them again from the server.
        if let Err(e) = self.commands.send(command) {
            debug!(error = %e, "Not tracking fetched entity");
        }
    }
}

/// Channel from the host's media engine back into the session.
#[derive(Clone)]
pub struct MediaSink {
    commands: Commands,
}

impl MediaSink {
    pub fn report(&self, event: MediaEvent) -> Result<()> {
        self.commands.send(SessionCommand::Media(event))
    }

    pub fn local_candidate(&self, peer: UserId, candidate: impl Into<String>) -> Result<()> {
        self.report(MediaEvent::LocalCandidate {
            peer,
            candidate: candidate.into(),
        })
    }

    pub fn remote_stream(&self, peer: UserId, stream: MediaHandle) -> Result<()> {
        self.report(MediaEvent::RemoteStream { peer, stream })
    }
}

/// Owner of all per-connection state.
struct Driver {
    events: EventHandler,
    outbox: Outbox,
    calls: CallManager,
    rooms: RoomLayer,
    roster: Roster,
}

impl Driver {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        loop {
            tokio::select! {
                event = inbound.recv() => {
                    match event {
                        Some(TransportEvent::Frame(frame)) => {
                            self.on_event(decode(&frame)).await;
                        }
                        Some(TransportEvent::Closed(reason)) => {
                            let reason = reason.unwrap_or_else(|| REASON_CONNECTION_LOST.to_string());
                            info!(reason = %reason, "Connection closed by server");
                            self.on_closed(&reason).await;
                            break;
                        }
                        None => {
                            info!("Transport reader stopped");
                            self.on_closed(REASON_CONNECTION_LOST).await;
                            break;
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Disconnect { reply }) => {
                            info!("Disconnect requested");
                            self.outbox.close();
                            self.on_closed(REASON_CLIENT_CLOSED).await;
                            reply.resolve(());
                            break;
                        }
                        Some(command) => self.on_command(command).await,
                        None => {
                            // Every session handle is gone.
                            info!("Command channel closed, shutting down session");
                            self.outbox.close();
                            self.on_closed(REASON_CLIENT_CLOSED).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: Event) {
        debug!(kind = %event.kind(), "Received event");

        match &event {
            Event::Heartbeat(_) => self.send_or_warn(&event),
            Event::Error(error) => {
                // Answered to the caller whose request it names.
                if self.rooms.on_error(error) {
                    return;
                }
            }
            Event::ChatMessage(message) => {
                if let Some(receipt) = self.rooms.on_message(message) {
                    self.send_or_warn(&receipt);
                }
            }
            Event::ChatDelivered(ack) | Event::ChatReceived(ack) => {
                if self.rooms.on_ack(event.kind(), ack) == AckOutcome::Duplicate {
                    return;
                }
            }
            Event::Presence(presence) => {
                self.roster.presence(&presence.user, presence.status);
            }
            Event::RosterAdd(update) => {
                self.roster.add(&update.user);
            }
            Event::RosterRemove(update) => {
                self.roster.remove(&update.user);
            }
            Event::RosterSnapshot(snapshot) => self.roster.replace(&snapshot.entries),
            Event::RoomCreated(created) => self.rooms.track(&created.room),
            Event::RoomInvitation(invitation) => self.rooms.on_invitation(invitation),
            Event::RoomAction(activity) => self.rooms.on_activity(activity),
            Event::RoomMark(mark) => self.rooms.on_mark(mark),
            Event::CallCreated(created) => self.calls.track(&created.call),
            Event::CallInvitation(invitation) => {
                if !self.calls.announce(invitation) {
                    debug!(call = %invitation.call, "Call already announced");
                    return;
                }
            }
            Event::CallSignal(signal) => {
                let fx = Effects {
                    outbox: &self.outbox,
                    events: &self.events,
                };
                if let Err(e) = self.calls.handle_signal(&fx, signal).await {
                    warn!(call = %signal.call, from = %signal.sender, error = %e, "Call signal failed");
                    self.events.notify(&Event::error(e.to_string()));
                }
            }
            Event::Hello(_)
            | Event::Disconnect(_)
            | Event::ChatRequest(_)
            | Event::RoomJoin(_)
            | Event::RoomLeave(_)
            | Event::RoomInvite(_)
            | Event::Unhandled(_) => {}
        }

        self.events.notify(&event);
        self.reap();
    }

    async fn on_command(&mut self, command: SessionCommand) {
        let fx = Effects {
            outbox: &self.outbox,
            events: &self.events,
        };

        match command {
            SessionCommand::Offer {
                call,
                kind,
                peers,
                media,
                reply,
            } => {
                let result = self.calls.offer(&fx, call, kind, peers, media).await;
                reply.settle(result);
            }
            SessionCommand::Answer { call, media, reply } => {
                reply.settle(self.calls.answer(&fx, &call, media).await);
            }
            SessionCommand::Reject { call, reply } => {
                reply.settle(self.calls.reject(&fx, &call).await);
            }
            SessionCommand::Hangup {
                call,
                reason,
                reply,
            } => {
                reply.settle(self.calls.hangup(&fx, &call, &reason).await);
            }
            SessionCommand::CallState { call, reply } => {
                reply.resolve(self.calls.snapshot(&call));
            }
            SessionCommand::TrackCall(info) => self.calls.track(&info),

            SessionCommand::SendMessage { room, body, reply } => {
                let (reference, frame) = self.rooms.send(room, body, reply);
                if let Err(e) = self.outbox.send(&frame) {
                    self.rooms.send_failed(&reference, e.into());
                }
            }
            SessionCommand::Mark {
                room,
                timestamp,
                reply,
            } => {
                let frame = self.rooms.mark(&room, timestamp);
                reply.settle(self.send(&frame));
            }
            SessionCommand::JoinRoom { room, reply } => {
                let frame = self.rooms.join(&room);
                reply.settle(self.send(&frame));
            }
            SessionCommand::LeaveRoom { room, reply } => {
                let frame = self.rooms.leave(&room);
                self.events.forget_entity(room.as_str());
                reply.settle(self.send(&frame));
            }
            SessionCommand::InviteToRoom { room, user, reply } => {
                let frame = self.rooms.invite(&room, &user);
                reply.settle(self.send(&frame));
            }
            SessionCommand::RoomState { room, reply } => {
                reply.resolve(self.rooms.state(&room));
            }
            SessionCommand::TrackRoom(info) => self.rooms.track(&info),

            SessionCommand::AddToRoster { user, reply } => {
                self.roster.add(&user);
                let frame = Event::RosterAdd(RosterUpdate {
                    user,
                    timestamp: now_millis(),
                });
                reply.settle(self.send(&frame));
            }
            SessionCommand::RemoveFromRoster { user, reply } => {
                self.roster.remove(&user);
                let frame = Event::RosterRemove(RosterUpdate {
                    user,
                    timestamp: now_millis(),
                });
                reply.settle(self.send(&frame));
            }
            SessionCommand::ApplyRoster(entries) => self.roster.replace(&entries),
            SessionCommand::Roster { reply } => reply.resolve(self.roster.entries()),

            SessionCommand::Media(MediaEvent::LocalCandidate { peer, candidate }) => {
                if let Err(e) = self.calls.local_candidate(&fx, &peer, candidate).await {
                    self.events.notify(&Event::error(e.to_string()));
                }
            }
            SessionCommand::Media(MediaEvent::RemoteStream { peer, stream }) => {
                debug!(peer = %peer, stream = stream.id(), "Remote stream started");
                self.events.notify_remote_stream(&peer, &stream);
            }

            // Handled by the loop.
            SessionCommand::Disconnect { reply } => reply.resolve(()),
        }

        self.reap();
    }

    async fn on_closed(&mut self, reason: &str) {
        let fx = Effects {
            outbox: &self.outbox,
            events: &self.events,
        };
        self.calls.connection_lost(&fx).await;
        self.rooms.disconnected(reason);
        self.events.notify(&Event::disconnect(reason));
        self.reap();
    }

    fn send(&self, event: &Event) -> Result<()> {
        self.outbox.send(event).map_err(SessionError::from)
    }

    fn send_or_warn(&self, event: &Event) {
        if let Err(e) = self.outbox.send(event) {
            warn!(kind = %event.kind(), error = %e, "Failed to send frame");
        }
    }

    /// Drop ended calls and the narrow subscriptions made for them.
    fn reap(&mut self) {
        for call in self.calls.reap() {
            self.events.forget_entity(call.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use parley_media::NoMedia;
    use parley_shared::protocol::{ChatMessage, RosterUpdate};
    use parley_shared::types::{CallInfo, RoomInfo};

    use super::*;
    use crate::error::ApiError;
    use crate::transport::{MemoryRemote, MemoryTransport};

    /// Resource API serving one canned room.
    struct OneRoom;

    #[async_trait]
    impl ResourceApi for OneRoom {
        async fn create_room(&self, name: &str) -> std::result::Result<RoomInfo, ApiError> {
            Ok(RoomInfo {
                id: "r1".into(),
                name: Some(name.to_string()),
                kind: parley_shared::types::RoomKind::Group,
                users: vec!["alice".into()],
            })
        }

        async fn create_direct_room(&self, _peer: &UserId) -> std::result::Result<RoomInfo, ApiError> {
            Err(ApiError::Status { status: 501, body: String::new() })
        }

        async fn get_room(&self, _room: &RoomId) -> std::result::Result<RoomInfo, ApiError> {
            self.create_room("general").await
        }

        async fn get_rooms(&self) -> std::result::Result<Vec<RoomInfo>, ApiError> {
            Ok(vec![self.create_room("general").await?])
        }

        async fn create_call(&self, _users: &[UserId]) -> std::result::Result<CallInfo, ApiError> {
            Err(ApiError::Status { status: 501, body: String::new() })
        }

        async fn create_direct_call(&self, _peer: &UserId) -> std::result::Result<CallInfo, ApiError> {
            Err(ApiError::Status { status: 501, body: String::new() })
        }

        async fn get_call(&self, _call: &CallId) -> std::result::Result<CallInfo, ApiError> {
            Err(ApiError::Status { status: 404, body: String::new() })
        }

        async fn get_calls(&self) -> std::result::Result<Vec<CallInfo>, ApiError> {
            Ok(Vec::new())
        }

        async fn get_roster(&self) -> std::result::Result<Vec<RosterEntry>, ApiError> {
            Ok(vec![RosterEntry {
                user: "bob".into(),
                status: parley_shared::types::PresenceStatus::Available,
            }])
        }
    }

    async fn connected() -> (Session, MemoryRemote) {
        let (transport, remote) = MemoryTransport::pair();
        let config = ClientConfig {
            session_id: "alice".into(),
            ..ClientConfig::default()
        };
        let session = Session::new(
            config,
            Arc::new(transport),
            Arc::new(NoMedia),
            Arc::new(OneRoom),
        );
        session.connect().await.unwrap();
        (session, remote)
    }

    #[tokio::test]
    async fn test_operations_fail_before_connect() {
        let (transport, _remote) = MemoryTransport::pair();
        let session = Session::new(
            ClientConfig::default(),
            Arc::new(transport),
            Arc::new(NoMedia),
            Arc::new(OneRoom),
        );
        assert!(!session.is_connected());
        assert!(matches!(
            session.send_message(&"r1".into(), "hi").await,
            Err(SessionError::NotConnected)
        ));
        assert!(session.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_is_echoed() {
        let (_session, mut remote) = connected().await;
        // Whole milliseconds survive the wire unchanged.
        let heartbeat = Event::Heartbeat(Heartbeat {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        });
        remote.push(&heartbeat).await.unwrap();
        assert_eq!(remote.next_event().await, Some(heartbeat));
    }

    #[tokio::test]
    async fn test_fetched_roster_is_applied() {
        let (session, mut remote) = connected().await;
        assert_eq!(session.get_roster().await.unwrap().len(), 1);
        assert_eq!(session.roster().await.unwrap()[0].user, UserId::from("bob"));

        session.remove_from_roster(&"bob".into()).await.unwrap();
        assert!(matches!(remote.next_event().await, Some(Event::RosterRemove(_))));
        assert!(session.roster().await.unwrap().is_empty());

        // Removal confirmed by the server for a user already gone.
        let errors = Arc::new(Mutex::new(0));
        let count = errors.clone();
        session.on_error(move |_| *count.lock().unwrap() += 1);
        remote
            .push(&Event::RosterRemove(RosterUpdate {
                user: "bob".into(),
                timestamp: Utc::now(),
            }))
            .await
            .unwrap();
        // Inbound frames are handled in order: once the heartbeat comes back
        // the removal was processed.
        remote
            .push(&Event::Heartbeat(Heartbeat {
                timestamp: Utc::now(),
            }))
            .await
            .unwrap();
        assert!(matches!(remote.next_event().await, Some(Event::Heartbeat(_))));
        assert_eq!(*errors.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_created_room_is_tracked() {
        let (session, mut remote) = connected().await;
        let room = session.create_room("general").await.unwrap();
        assert_eq!(room.name(), Some("general"));

        let state = room.state().await.unwrap().unwrap();
        assert!(state.members.contains(&UserId::from("alice")));

        room.leave().await.unwrap();
        assert!(matches!(remote.next_event().await, Some(Event::RoomLeave(_))));
        assert_eq!(room.state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_room_messages_reach_room_handle() {
        let (session, mut remote) = connected().await;
        let room = session.get_room(&"r1".into()).await.unwrap();
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let log = bodies.clone();
        room.on_message(move |event| {
            if let Event::ChatMessage(m) = event {
                log.lock().unwrap().push(m.body.clone());
            }
        });

        remote
            .push(&Event::ChatMessage(ChatMessage {
                id: "m1".into(),
                room: "r1".into(),
                sender: "bob".into(),
                body: "hello".into(),
                delivered: false,
                timestamp: Utc::now(),
            }))
            .await
            .unwrap();

        // The delivery receipt goes out before subscribers run.
        assert!(matches!(
            remote.next_event().await,
            Some(Event::ChatDelivered(ack)) if ack.id.as_str() == "m1"
        ));
        assert_eq!(session.room_state(&"r1".into()).await.unwrap().unwrap().unread, 1);
        assert_eq!(*bodies.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_and_stops() {
        let (session, mut remote) = connected().await;
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let log = reasons.clone();
        session.on_disconnect(move |d| log.lock().unwrap().push(d.reason.clone()));

        session.disconnect().await.unwrap();
        assert!(!session.is_connected());
        assert_eq!(*reasons.lock().unwrap(), vec![REASON_CLIENT_CLOSED.to_string()]);
        assert_eq!(remote.next_event().await, None);
    }
}
