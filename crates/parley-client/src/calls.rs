//! Call executor: owns every [`Call`] of the session and carries out the
//! actions their state machines ask for, against the media engine and the
//! transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parley_media::{
    Call, CallError, CallNotice, CallState, MediaEngine, MediaError, MediaHandle, PeerActions,
    SignalingAction,
};
use parley_shared::protocol::{now_millis, CallInvitation, CallSignal, Event, Signal};
use parley_shared::types::{CallId, CallInfo, CallKind, UserId};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::events::EventHandler;
use crate::transport::Outbox;

/// Point-in-time view of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub id: CallId,
    pub kind: CallKind,
    /// Every participant, the local user included.
    pub users: Vec<UserId>,
    pub state: CallState,
}

/// Where the executor's side effects go.
pub struct Effects<'a> {
    pub outbox: &'a Outbox,
    pub events: &'a EventHandler,
}

pub struct CallManager {
    local_user: UserId,
    engine: Arc<dyn MediaEngine>,
    calls: HashMap<CallId, Call>,
    /// Calls already surfaced to subscribers as an invitation.
    announced: HashSet<CallId>,
}

impl CallManager {
    pub fn new(local_user: UserId, engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            local_user,
            engine,
            calls: HashMap::new(),
            announced: HashSet::new(),
        }
    }

    pub fn snapshot(&self, id: &CallId) -> Option<CallSnapshot> {
        let call = self.calls.get(id)?;
        let mut users: Vec<UserId> = call.peers().cloned().collect();
        users.push(self.local_user.clone());
        users.sort();
        Some(CallSnapshot {
            id: call.id.clone(),
            kind: call.kind,
            users,
            state: call.state(),
        })
    }

    pub fn state(&self, id: &CallId) -> Option<CallState> {
        self.calls.get(id).map(Call::state)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Learn about a call announced by the server or fetched from the API.
    pub fn track(&mut self, info: &CallInfo) {
        if self.calls.contains_key(&info.id) {
            return;
        }
        let others: Vec<&UserId> = info.users.iter().filter(|u| **u != self.local_user).collect();
        let call = match (info.kind, others.as_slice()) {
            (CallKind::Direct, [peer]) => {
                Call::direct(info.id.clone(), self.local_user.clone(), (*peer).clone())
            }
            _ => Call::group(info.id.clone(), self.local_user.clone()),
        };
        debug!(call = %info.id, kind = ?info.kind, "Tracking call");
        self.calls.insert(info.id.clone(), call);
    }

    /// A server-sent invitation. Returns false if subscribers already heard
    /// about this call.
    pub fn announce(&mut self, invitation: &CallInvitation) -> bool {
        self.calls
            .entry(invitation.call.clone())
            .or_insert_with(|| Call::group(invitation.call.clone(), self.local_user.clone()));
        self.announced.insert(invitation.call.clone())
    }

    pub async fn offer(
        &mut self,
        fx: &Effects<'_>,
        id: Option<CallId>,
        kind: CallKind,
        peers: Vec<UserId>,
        media: MediaHandle,
    ) -> Result<CallSnapshot> {
        let id = match kind {
            CallKind::Direct => {
                let peer = peers
                    .iter()
                    .find(|p| **p != self.local_user)
                    .cloned()
                    .ok_or_else(|| CallError::NotParticipant(self.local_user.clone()))?;

                // One machine per peer: an offer to someone we already share
                // a live direct call with goes to that call.
                let existing = match id {
                    Some(_) => None,
                    None => self.live_direct_call(&peer),
                };
                if let Some(existing) = &existing {
                    let (joined, ringing) = self
                        .calls
                        .get(existing)
                        .map(|c| (c.is_joined(), c.is_ringing()))
                        .unwrap_or_default();
                    if joined {
                        debug!(call = %existing, peer = %peer, "Reusing live direct call");
                        return self
                            .snapshot(existing)
                            .ok_or_else(|| SessionError::UnknownCall(existing.clone()));
                    }
                    if ringing {
                        info!(call = %existing, peer = %peer, "Peer is already calling, answering instead");
                        return self.answer(fx, existing, media).await;
                    }
                }

                let id = id.or(existing).unwrap_or_else(CallId::generate);
                let local = self.local_user.clone();
                self.calls
                    .entry(id.clone())
                    .or_insert_with(|| Call::direct(id.clone(), local, peer));
                id
            }
            CallKind::Group => {
                let id = id.unwrap_or_else(CallId::generate);
                let local = self.local_user.clone();
                self.calls
                    .entry(id.clone())
                    .or_insert_with(|| Call::group(id.clone(), local));
                id
            }
        };

        let batches = self.call_mut(&id)?.offer(&peers, media)?;
        self.run(fx, &id, batches).await?;
        self.snapshot(&id).ok_or(SessionError::UnknownCall(id))
    }

    pub async fn answer(
        &mut self,
        fx: &Effects<'_>,
        id: &CallId,
        media: MediaHandle,
    ) -> Result<CallSnapshot> {
        let batches = self.call_mut(id)?.answer(media)?;
        self.run(fx, id, batches).await?;
        self.snapshot(id)
            .ok_or_else(|| SessionError::UnknownCall(id.clone()))
    }

    pub async fn reject(&mut self, fx: &Effects<'_>, id: &CallId) -> Result<()> {
        let batches = self.call_mut(id)?.reject()?;
        self.run(fx, id, batches).await
    }

    pub async fn hangup(&mut self, fx: &Effects<'_>, id: &CallId, reason: &str) -> Result<()> {
        let batches = self.call_mut(id)?.hangup(reason);
        self.run(fx, id, batches).await
    }

    /// Inbound signaling. Offers for unknown calls open a direct call with
    /// the sender; anything else for an unknown call is stale.
    pub async fn handle_signal(&mut self, fx: &Effects<'_>, signal: &CallSignal) -> Result<()> {
        if signal.recipient != self.local_user {
            debug!(call = %signal.call, recipient = %signal.recipient, "Signal addressed to another user");
        }

        if !self.calls.contains_key(&signal.call) {
            if !matches!(signal.signal, Signal::Offer { .. }) {
                debug!(
                    call = %signal.call,
                    from = %signal.sender,
                    signal = signal.signal.name(),
                    "Dropping signal for unknown call"
                );
                return Ok(());
            }
            let call = Call::direct(
                signal.call.clone(),
                self.local_user.clone(),
                signal.sender.clone(),
            );
            self.calls.insert(signal.call.clone(), call);
        }

        let actions = self
            .call_mut(&signal.call)?
            .handle_signal(&signal.sender, &signal.signal)?;
        self.run(fx, &signal.call, vec![(signal.sender.clone(), actions)])
            .await
    }

    /// A candidate our engine gathered for `peer`, sent on the live call
    /// with that peer.
    pub async fn local_candidate(
        &mut self,
        fx: &Effects<'_>,
        peer: &UserId,
        candidate: String,
    ) -> Result<()> {
        let id = self
            .calls
            .values()
            .filter(|c| c.is_live() && c.has_peer(peer))
            .max_by_key(|c| c.is_joined())
            .map(|c| c.id.clone());

        let Some(id) = id else {
            debug!(peer = %peer, "Dropping local candidate, no live call with peer");
            return Ok(());
        };
        let actions = self.call_mut(&id)?.local_candidate(peer, candidate);
        self.run(fx, &id, vec![(peer.clone(), actions)]).await
    }

    /// The transport is gone: end every call without sending anything.
    pub async fn connection_lost(&mut self, fx: &Effects<'_>) {
        let ids: Vec<CallId> = self.calls.keys().cloned().collect();
        for id in ids {
            let batches = match self.calls.get_mut(&id) {
                Some(call) => call.connection_lost(),
                None => continue,
            };
            if let Err(e) = self.run(fx, &id, batches).await {
                debug!(call = %id, error = %e, "Teardown after connection loss failed");
            }
        }
    }

    /// Remove ended calls and return their ids.
    pub fn reap(&mut self) -> Vec<CallId> {
        let ended: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, call)| !call.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ended {
            self.calls.remove(id);
            self.announced.remove(id);
            info!(call = %id, "Call ended");
        }
        ended
    }

    /// The live direct call with `peer`, preferring one the local user
    /// already joined.
    fn live_direct_call(&self, peer: &UserId) -> Option<CallId> {
        self.calls
            .values()
            .filter(|c| c.kind == CallKind::Direct && c.is_live() && c.has_peer(peer))
            .max_by_key(|c| (c.is_joined(), c.is_ringing()))
            .map(|c| c.id.clone())
    }

    fn call_mut(&mut self, id: &CallId) -> Result<&mut Call> {
        self.calls
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownCall(id.clone()))
    }

    /// Carry out actions in order. Results of engine steps feed back into the
    /// call and their follow-ups run before anything queued after them. A
    /// failing engine step aborts that peer's session; the first failure is
    /// returned once everything else ran.
    async fn run(&mut self, fx: &Effects<'_>, id: &CallId, batches: Vec<PeerActions>) -> Result<()> {
        let mut queue: VecDeque<(UserId, SignalingAction)> = batches
            .into_iter()
            .flat_map(|(peer, actions)| actions.into_iter().map(move |a| (peer.clone(), a)))
            .collect();
        let mut failure: Option<MediaError> = None;

        while let Some((peer, action)) = queue.pop_front() {
            match self.apply(fx, id, &peer, action).await {
                Ok(follow_up) => {
                    for action in follow_up.into_iter().rev() {
                        queue.push_front((peer.clone(), action));
                    }
                }
                Err(e) => {
                    warn!(call = %id, peer = %peer, error = %e, "Media step failed, aborting peer");
                    queue.retain(|(p, _)| *p != peer);
                    let abort = self
                        .calls
                        .get_mut(id)
                        .map(|call| call.abort(&peer, &e.to_string()))
                        .unwrap_or_default();
                    for action in abort {
                        if let Err(e) = self.apply(fx, id, &peer, action).await {
                            debug!(call = %id, peer = %peer, error = %e, "Abort step failed");
                        }
                    }
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn apply(
        &mut self,
        fx: &Effects<'_>,
        id: &CallId,
        peer: &UserId,
        action: SignalingAction,
    ) -> std::result::Result<Vec<SignalingAction>, MediaError> {
        match action {
            SignalingAction::AttachStream(stream) => {
                self.engine.attach_local_stream(peer, &stream).await?;
            }
            SignalingAction::CreateOffer => {
                let sdp = self.engine.create_local_offer(peer).await?;
                return Ok(self
                    .calls
                    .get_mut(id)
                    .map(|call| call.offer_created(peer, sdp))
                    .unwrap_or_default());
            }
            SignalingAction::CreateAnswer => {
                let sdp = self.engine.create_local_answer(peer).await?;
                return Ok(self
                    .calls
                    .get_mut(id)
                    .map(|call| call.answer_created(peer, sdp))
                    .unwrap_or_default());
            }
            SignalingAction::SetRemoteDescription(sdp) => {
                self.engine.set_remote_description(peer, &sdp).await?;
            }
            SignalingAction::AddIceCandidate(candidate) => {
                self.engine.add_ice_candidate(peer, &candidate).await?;
            }
            SignalingAction::Send(signal) => {
                let event = Event::CallSignal(CallSignal {
                    call: id.clone(),
                    sender: self.local_user.clone(),
                    recipient: peer.clone(),
                    signal,
                    timestamp: now_millis(),
                });
                // A lost connection surfaces as a disconnect; the machine has
                // already moved on.
                if let Err(e) = fx.outbox.send(&event) {
                    warn!(call = %id, peer = %peer, error = %e, "Failed to send call signal");
                }
            }
            SignalingAction::CloseMedia => {
                self.engine.close(peer).await;
            }
            SignalingAction::Notify(CallNotice::Invitation) => {
                if self.announced.insert(id.clone()) {
                    fx.events.notify(&Event::CallInvitation(CallInvitation {
                        call: id.clone(),
                        inviter: peer.clone(),
                        timestamp: now_millis(),
                    }));
                }
            }
            SignalingAction::Notify(CallNotice::Hangup { reason }) => {
                fx.events.notify(&Event::CallSignal(CallSignal {
                    call: id.clone(),
                    sender: peer.clone(),
                    recipient: self.local_user.clone(),
                    signal: Signal::Hangup { reason },
                    timestamp: now_millis(),
                }));
            }
        }
        Ok(Vec::new())
    }
}
