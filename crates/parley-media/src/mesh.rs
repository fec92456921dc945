use std::collections::BTreeMap;

use parley_shared::constants::{MAX_MESH_PEERS, REASON_DISCONNECTED, REASON_REJECTED};
use parley_shared::protocol::Signal;
use parley_shared::types::{CallId, CallKind, UserId};
use tracing::{debug, info, warn};

use crate::engine::MediaHandle;
use crate::error::CallError;
use crate::signaling::{CallNotice, CallState, SignalingAction, SignalingSession};

/// Actions produced for one remote peer of a call.
pub type PeerActions = (UserId, Vec<SignalingAction>);

/// A call: one signaling session per remote participant, full mesh.
///
/// A direct call has exactly one peer fixed at creation. A group call grows
/// as participants offer or are offered to, up to [`MAX_MESH_PEERS`].
pub struct Call {
    pub id: CallId,
    pub kind: CallKind,
    local_user: UserId,
    peers: BTreeMap<UserId, SignalingSession>,
    media: Option<MediaHandle>,
    joined: bool,
    closed: bool,
}

impl Call {
    pub fn direct(id: CallId, local_user: UserId, peer: UserId) -> Self {
        let mut call = Self::empty(id, CallKind::Direct, local_user);
        let session = SignalingSession::new(call.id.clone(), call.local_user.clone(), peer.clone());
        call.peers.insert(peer, session);
        call
    }

    pub fn group(id: CallId, local_user: UserId) -> Self {
        Self::empty(id, CallKind::Group, local_user)
    }

    fn empty(id: CallId, kind: CallKind, local_user: UserId) -> Self {
        Self {
            id,
            kind,
            local_user,
            peers: BTreeMap::new(),
            media: None,
            joined: false,
            closed: false,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn peers(&self) -> impl Iterator<Item = &UserId> {
        self.peers.keys()
    }

    pub fn has_peer(&self, user: &UserId) -> bool {
        self.peers.contains_key(user)
    }

    pub fn session(&self, peer: &UserId) -> Option<&SignalingSession> {
        self.peers.get(peer)
    }

    pub fn media(&self) -> Option<&MediaHandle> {
        self.media.as_ref()
    }

    /// Whether the local user took part, by offering or answering.
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Connected if any peer is, else Offering if any peer is, else Ended
    /// once every peer ended, else Idle.
    pub fn state(&self) -> CallState {
        if self.closed {
            return CallState::Ended;
        }
        let states: Vec<CallState> = self.peers.values().map(SignalingSession::state).collect();
        if states.contains(&CallState::Connected) {
            CallState::Connected
        } else if states.contains(&CallState::Offering) {
            CallState::Offering
        } else if !states.is_empty() && states.iter().all(|s| *s == CallState::Ended) {
            CallState::Ended
        } else {
            CallState::Idle
        }
    }

    pub fn is_live(&self) -> bool {
        self.state() != CallState::Ended
    }

    /// Whether some peer offered and is waiting for the user to decide.
    pub fn is_ringing(&self) -> bool {
        self.peers.values().any(SignalingSession::is_awaiting_answer)
    }

    /// Offer to `invitees` (ignored for direct calls) and to every idle peer
    /// already known.
    pub fn offer(
        &mut self,
        invitees: &[UserId],
        media: MediaHandle,
    ) -> Result<Vec<PeerActions>, CallError> {
        if !self.is_live() {
            return Err(CallError::InvalidTransition {
                state: CallState::Ended,
                operation: "offer",
            });
        }

        if self.kind == CallKind::Group {
            for user in invitees {
                if *user != self.local_user {
                    self.ensure_peer(user)?;
                }
            }
        }

        let mut out = Vec::new();
        for (peer, session) in self.peers.iter_mut() {
            if session.state() == CallState::Idle {
                out.push((peer.clone(), session.offer(media.clone())?));
            }
        }

        if out.is_empty() {
            return Err(CallError::InvalidTransition {
                state: self.state(),
                operation: "offer",
            });
        }

        info!(call = %self.id, peers = out.len(), "Offering call");
        self.media = Some(media);
        self.joined = true;
        Ok(out)
    }

    /// Answer every peer whose offer is pending.
    pub fn answer(&mut self, media: MediaHandle) -> Result<Vec<PeerActions>, CallError> {
        let mut out = Vec::new();
        for (peer, session) in self.peers.iter_mut() {
            if session.is_awaiting_answer() {
                out.push((peer.clone(), session.answer(media.clone())?));
            }
        }

        if out.is_empty() {
            // Accepting an invitation before any offer arrived: offers that
            // show up later are answered with this stream.
            if self.joined || !self.is_live() {
                return Err(CallError::InvalidTransition {
                    state: self.state(),
                    operation: "answer",
                });
            }
            debug!(call = %self.id, "Accepting call ahead of any offer");
        }

        info!(call = %self.id, peers = out.len(), "Answering call");
        self.media = Some(media);
        self.joined = true;
        Ok(out)
    }

    /// Decline every pending offer. The call ends for the local user.
    pub fn reject(&mut self) -> Result<Vec<PeerActions>, CallError> {
        if !self.is_ringing() {
            return Err(CallError::InvalidTransition {
                state: self.state(),
                operation: "reject",
            });
        }

        let mut out = Vec::new();
        for (peer, session) in self.peers.iter_mut() {
            if session.is_awaiting_answer() {
                out.push((peer.clone(), session.reject()?));
            } else {
                let actions = session.hangup(REASON_REJECTED);
                if !actions.is_empty() {
                    out.push((peer.clone(), actions));
                }
            }
        }

        info!(call = %self.id, "Rejected call");
        self.close();
        Ok(out)
    }

    pub fn hangup(&mut self, reason: &str) -> Vec<PeerActions> {
        if self.closed {
            return Vec::new();
        }
        info!(call = %self.id, reason, "Hanging up call");
        let out = self
            .peers
            .iter_mut()
            .map(|(peer, session)| (peer.clone(), session.hangup(reason)))
            .filter(|(_, actions)| !actions.is_empty())
            .collect();
        self.close();
        out
    }

    pub fn connection_lost(&mut self) -> Vec<PeerActions> {
        if self.closed {
            return Vec::new();
        }
        let mut out: Vec<PeerActions> = self
            .peers
            .iter_mut()
            .map(|(peer, session)| (peer.clone(), session.connection_lost()))
            .filter(|(_, actions)| !actions.is_empty())
            .collect();

        // A call nobody negotiated yet still tells its subscribers it is over.
        if out.is_empty() {
            out.push((
                self.local_user.clone(),
                vec![SignalingAction::Notify(CallNotice::Hangup {
                    reason: REASON_DISCONNECTED.to_string(),
                })],
            ));
        }
        self.close();
        out
    }

    pub fn handle_signal(
        &mut self,
        sender: &UserId,
        signal: &Signal,
    ) -> Result<Vec<SignalingAction>, CallError> {
        if self.closed {
            debug!(call = %self.id, from = %sender, signal = signal.name(), "Dropping signal for closed call");
            return Ok(Vec::new());
        }

        if !self.peers.contains_key(sender) {
            match (self.kind, signal) {
                (CallKind::Direct, _) => return Err(CallError::NotParticipant(sender.clone())),
                (CallKind::Group, Signal::Hangup { .. }) => return Ok(Vec::new()),
                (CallKind::Group, _) => self.ensure_peer(sender)?,
            }
        }

        let joined = self.joined;
        let media = self.media.clone();
        let Some(session) = self.peers.get_mut(sender) else {
            return Err(CallError::NotParticipant(sender.clone()));
        };

        let actions = session.handle_signal(signal);

        // Late joiners of a group call we are already in get answered with the
        // stream the call runs on.
        let invited = actions.contains(&SignalingAction::Notify(CallNotice::Invitation));
        if invited && joined {
            if let Some(media) = media {
                debug!(call = %self.id, peer = %sender, "Auto-answering participant of joined call");
                return session.answer(media);
            }
        }

        Ok(actions)
    }

    pub fn offer_created(&mut self, peer: &UserId, sdp: String) -> Vec<SignalingAction> {
        match self.peers.get_mut(peer) {
            Some(session) => session.offer_created(sdp),
            None => Vec::new(),
        }
    }

    pub fn answer_created(&mut self, peer: &UserId, sdp: String) -> Vec<SignalingAction> {
        match self.peers.get_mut(peer) {
            Some(session) => session.answer_created(sdp),
            None => Vec::new(),
        }
    }

    /// End the session with `peer` after a failed negotiation step.
    pub fn abort(&mut self, peer: &UserId, reason: &str) -> Vec<SignalingAction> {
        match self.peers.get_mut(peer) {
            Some(session) => {
                warn!(call = %self.id, peer = %peer, reason, "Aborting peer session");
                session.abort(reason)
            }
            None => Vec::new(),
        }
    }

    pub fn local_candidate(&mut self, peer: &UserId, candidate: String) -> Vec<SignalingAction> {
        match self.peers.get_mut(peer) {
            Some(session) => session.local_candidate(candidate),
            None => Vec::new(),
        }
    }

    fn ensure_peer(&mut self, user: &UserId) -> Result<(), CallError> {
        if self.peers.contains_key(user) {
            return Ok(());
        }
        if self.peers.len() >= MAX_MESH_PEERS {
            return Err(CallError::MaxPeersReached);
        }
        debug!(call = %self.id, peer = %user, "Adding peer to mesh");
        let session = SignalingSession::new(self.id.clone(), self.local_user.clone(), user.clone());
        self.peers.insert(user.clone(), session);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.media = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::from(name)
    }

    fn offer(sdp: &str) -> Signal {
        Signal::Offer { sdp: sdp.into() }
    }

    #[test]
    fn test_direct_call_lifecycle() {
        let mut call = Call::direct(CallId::from("c1"), user("alice"), user("bob"));
        assert_eq!(call.state(), CallState::Idle);

        let out = call.offer(&[], MediaHandle::new("cam")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, user("bob"));
        assert_eq!(call.state(), CallState::Offering);

        call.offer_created(&user("bob"), "o".into());
        call.handle_signal(&user("bob"), &Signal::Answer { sdp: "a".into() })
            .unwrap();
        assert_eq!(call.state(), CallState::Connected);

        call.handle_signal(
            &user("bob"),
            &Signal::Hangup {
                reason: "bye".into(),
            },
        )
        .unwrap();
        assert_eq!(call.state(), CallState::Ended);
        assert!(!call.is_live());
    }

    #[test]
    fn test_direct_call_rejects_strangers() {
        let mut call = Call::direct(CallId::from("c1"), user("alice"), user("bob"));
        assert!(matches!(
            call.handle_signal(&user("mallory"), &offer("o")),
            Err(CallError::NotParticipant(_))
        ));
    }

    #[test]
    fn test_group_call_grows_on_offer() {
        let mut call = Call::group(CallId::from("g1"), user("alice"));
        let actions = call.handle_signal(&user("bob"), &offer("o")).unwrap();
        assert_eq!(actions, vec![SignalingAction::Notify(CallNotice::Invitation)]);
        assert!(call.has_peer(&user("bob")));
        assert!(call.is_ringing());

        let out = call.answer(MediaHandle::new("cam")).unwrap();
        assert_eq!(out.len(), 1);
        assert!(call.is_joined());

        // A second participant joining later is answered without asking.
        let actions = call.handle_signal(&user("carol"), &offer("o2")).unwrap();
        assert_eq!(
            actions,
            vec![
                SignalingAction::AttachStream(MediaHandle::new("cam")),
                SignalingAction::SetRemoteDescription("o2".into()),
                SignalingAction::CreateAnswer,
            ]
        );
    }

    #[test]
    fn test_group_offer_skips_local_user() {
        let mut call = Call::group(CallId::from("g1"), user("alice"));
        let out = call
            .offer(
                &[user("alice"), user("bob"), user("carol")],
                MediaHandle::new("cam"),
            )
            .unwrap();
        let peers: Vec<UserId> = out.into_iter().map(|(peer, _)| peer).collect();
        assert_eq!(peers, vec![user("bob"), user("carol")]);
    }

    #[test]
    fn test_group_call_peer_limit() {
        let mut call = Call::group(CallId::from("g1"), user("alice"));
        for n in 0..MAX_MESH_PEERS {
            call.handle_signal(&user(&format!("peer{n}")), &offer("o"))
                .unwrap();
        }
        assert!(matches!(
            call.handle_signal(&user("late"), &offer("o")),
            Err(CallError::MaxPeersReached)
        ));
    }

    #[test]
    fn test_aggregate_state_survives_one_peer_leaving() {
        let mut call = Call::group(CallId::from("g1"), user("alice"));
        call.offer(&[user("bob"), user("carol")], MediaHandle::new("cam"))
            .unwrap();
        for peer in ["bob", "carol"] {
            call.offer_created(&user(peer), "o".into());
            call.handle_signal(&user(peer), &Signal::Answer { sdp: "a".into() })
                .unwrap();
        }

        call.handle_signal(
            &user("bob"),
            &Signal::Hangup {
                reason: "bye".into(),
            },
        )
        .unwrap();
        assert_eq!(call.state(), CallState::Connected);

        let out = call.hangup("done");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, user("carol"));
        assert_eq!(call.state(), CallState::Ended);
        assert!(call.hangup("again").is_empty());
    }

    #[test]
    fn test_accept_before_offer_answers_on_arrival() {
        let mut call = Call::group(CallId::from("g1"), user("alice"));
        assert!(call.answer(MediaHandle::new("cam")).unwrap().is_empty());
        assert!(call.answer(MediaHandle::new("cam")).is_err());

        let actions = call.handle_signal(&user("bob"), &offer("o")).unwrap();
        assert_eq!(actions[0], SignalingAction::AttachStream(MediaHandle::new("cam")));
        assert_eq!(actions.last(), Some(&SignalingAction::CreateAnswer));
    }

    #[test]
    fn test_reject_ends_call() {
        let mut call = Call::direct(CallId::from("c1"), user("alice"), user("bob"));
        call.handle_signal(&user("bob"), &offer("o")).unwrap();

        let out = call.reject().unwrap();
        assert_eq!(
            out[0].1,
            vec![
                SignalingAction::CloseMedia,
                SignalingAction::Send(Signal::Hangup {
                    reason: "rejected".into()
                }),
            ]
        );
        assert_eq!(call.state(), CallState::Ended);
        assert!(call.reject().is_err());
    }

    #[test]
    fn test_connection_lost_notifies_even_before_negotiation() {
        let mut call = Call::group(CallId::from("g1"), user("alice"));
        let out = call.connection_lost();
        assert_eq!(
            out,
            vec![(
                user("alice"),
                vec![SignalingAction::Notify(CallNotice::Hangup {
                    reason: "disconnected".into()
                })]
            )]
        );
        assert_eq!(call.state(), CallState::Ended);
    }
}
