use std::collections::VecDeque;

use parley_shared::constants::{REASON_DISCONNECTED, REASON_REJECTED};
use parley_shared::protocol::Signal;
use parley_shared::types::{CallId, UserId};
use tracing::{debug, warn};

use crate::engine::MediaHandle;
use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Offering,
    Connected,
    Ended,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Offering => "offering",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Who sent the offer that opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Something subscribers must hear about that no inbound frame carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    /// The peer offered a call; the user has to answer or reject it.
    Invitation,
    /// The call ended locally without a hangup from the peer.
    Hangup { reason: String },
}

/// Side effects requested by a transition, applied in order by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingAction {
    AttachStream(MediaHandle),
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(String),
    AddIceCandidate(String),
    Send(Signal),
    CloseMedia,
    Notify(CallNotice),
}

/// Offer/answer state machine towards a single remote peer.
///
/// Every transition is a plain function of the current state and its input
/// that returns the actions to perform; nothing here talks to the engine or
/// the network.
pub struct SignalingSession {
    pub call_id: CallId,
    pub local_user: UserId,
    pub remote_user: UserId,
    state: CallState,
    direction: Option<Direction>,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    remote_applied: bool,
    renegotiating: bool,
    pending_candidates: VecDeque<String>,
    media: Option<MediaHandle>,
}

impl SignalingSession {
    pub fn new(call_id: CallId, local_user: UserId, remote_user: UserId) -> Self {
        Self {
            call_id,
            local_user,
            remote_user,
            state: CallState::Idle,
            direction: None,
            local_sdp: None,
            remote_sdp: None,
            remote_applied: false,
            renegotiating: false,
            pending_candidates: VecDeque::new(),
            media: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn is_live(&self) -> bool {
        self.state != CallState::Ended
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_applied
    }

    pub fn pending_candidates(&self) -> impl Iterator<Item = &str> {
        self.pending_candidates.iter().map(String::as_str)
    }

    /// The peer offered and nobody answered or rejected yet.
    pub fn is_awaiting_answer(&self) -> bool {
        self.state == CallState::Offering
            && self.direction == Some(Direction::Incoming)
            && self.local_sdp.is_none()
    }

    pub fn offer(&mut self, media: MediaHandle) -> Result<Vec<SignalingAction>, CallError> {
        if self.state != CallState::Idle {
            return Err(self.invalid("offer"));
        }

        debug!(call = %self.call_id, remote = %self.remote_user, "Starting outgoing call");
        self.state = CallState::Offering;
        self.direction = Some(Direction::Outgoing);
        self.media = Some(media.clone());

        Ok(vec![
            SignalingAction::AttachStream(media),
            SignalingAction::CreateOffer,
        ])
    }

    /// The engine produced our offer. Dropped if the session moved on meanwhile.
    pub fn offer_created(&mut self, sdp: String) -> Vec<SignalingAction> {
        let expected = self.state == CallState::Offering
            && self.direction == Some(Direction::Outgoing)
            && self.local_sdp.is_none();
        if !expected {
            debug!(call = %self.call_id, state = %self.state, "Dropping stale local offer");
            return Vec::new();
        }

        self.local_sdp = Some(sdp.clone());
        vec![SignalingAction::Send(Signal::Offer { sdp })]
    }

    pub fn answer(&mut self, media: MediaHandle) -> Result<Vec<SignalingAction>, CallError> {
        if !self.is_awaiting_answer() {
            return Err(self.invalid("answer"));
        }
        let Some(offer) = self.remote_sdp.clone() else {
            return Err(self.invalid("answer"));
        };

        debug!(call = %self.call_id, remote = %self.remote_user, "Answering call");
        self.media = Some(media.clone());

        let mut actions = vec![SignalingAction::AttachStream(media)];
        actions.extend(self.apply_remote(offer));
        actions.push(SignalingAction::CreateAnswer);
        Ok(actions)
    }

    /// The engine produced our answer, either to the first offer or to a
    /// renegotiation.
    pub fn answer_created(&mut self, sdp: String) -> Vec<SignalingAction> {
        let answering = self.state == CallState::Offering
            && self.direction == Some(Direction::Incoming)
            && self.remote_applied;
        let renegotiating = self.state == CallState::Connected && self.renegotiating;
        if !answering && !renegotiating {
            debug!(call = %self.call_id, state = %self.state, "Dropping stale local answer");
            return Vec::new();
        }

        self.local_sdp = Some(sdp.clone());
        self.renegotiating = false;
        self.state = CallState::Connected;
        vec![SignalingAction::Send(Signal::Answer { sdp })]
    }

    pub fn reject(&mut self) -> Result<Vec<SignalingAction>, CallError> {
        if !self.is_awaiting_answer() {
            return Err(self.invalid("reject"));
        }

        debug!(call = %self.call_id, remote = %self.remote_user, "Rejecting call");
        self.end();
        Ok(vec![
            SignalingAction::CloseMedia,
            SignalingAction::Send(Signal::Hangup {
                reason: REASON_REJECTED.to_string(),
            }),
        ])
    }

    /// Local hangup: media goes first, then the peer is told once. Ending an
    /// ended session does nothing.
    pub fn hangup(&mut self, reason: &str) -> Vec<SignalingAction> {
        match self.state {
            CallState::Ended => Vec::new(),
            CallState::Idle => {
                self.end();
                vec![SignalingAction::CloseMedia]
            }
            CallState::Offering | CallState::Connected => {
                debug!(call = %self.call_id, remote = %self.remote_user, reason, "Hanging up");
                self.end();
                vec![
                    SignalingAction::CloseMedia,
                    SignalingAction::Send(Signal::Hangup {
                        reason: reason.to_string(),
                    }),
                ]
            }
        }
    }

    /// A local negotiation step failed; end the session and tell the peer if
    /// it already knows about us.
    pub fn abort(&mut self, reason: &str) -> Vec<SignalingAction> {
        if !self.is_live() {
            return Vec::new();
        }
        let peer_involved =
            self.direction == Some(Direction::Incoming) || self.local_sdp.is_some();
        self.end();

        let mut actions = vec![SignalingAction::CloseMedia];
        if peer_involved {
            actions.push(SignalingAction::Send(Signal::Hangup {
                reason: reason.to_string(),
            }));
        }
        actions
    }

    /// The transport went away; nothing can be sent, only torn down.
    pub fn connection_lost(&mut self) -> Vec<SignalingAction> {
        if !self.is_live() {
            return Vec::new();
        }
        self.end();
        vec![
            SignalingAction::CloseMedia,
            SignalingAction::Notify(CallNotice::Hangup {
                reason: REASON_DISCONNECTED.to_string(),
            }),
        ]
    }

    /// A candidate gathered by our engine, to trickle to the peer.
    pub fn local_candidate(&mut self, candidate: String) -> Vec<SignalingAction> {
        match self.state {
            CallState::Offering | CallState::Connected => {
                vec![SignalingAction::Send(Signal::Candidate { candidate })]
            }
            CallState::Idle | CallState::Ended => Vec::new(),
        }
    }

    pub fn handle_signal(&mut self, signal: &Signal) -> Vec<SignalingAction> {
        if !self.is_live() {
            debug!(
                call = %self.call_id,
                from = %self.remote_user,
                signal = signal.name(),
                "Dropping signal for ended session"
            );
            return Vec::new();
        }

        match signal {
            Signal::Offer { sdp } => self.on_offer(sdp),
            Signal::Answer { sdp } => self.on_answer(sdp),
            Signal::Candidate { candidate } => {
                if self.remote_applied {
                    vec![SignalingAction::AddIceCandidate(candidate.clone())]
                } else {
                    debug!(
                        call = %self.call_id,
                        from = %self.remote_user,
                        queued = self.pending_candidates.len() + 1,
                        "Queueing ICE candidate until remote description is set"
                    );
                    self.pending_candidates.push_back(candidate.clone());
                    Vec::new()
                }
            }
            Signal::Hangup { reason } => {
                debug!(call = %self.call_id, from = %self.remote_user, reason = %reason, "Received hangup");
                self.end();
                vec![SignalingAction::CloseMedia]
            }
        }
    }

    fn on_offer(&mut self, sdp: &str) -> Vec<SignalingAction> {
        match (self.state, self.direction) {
            (CallState::Idle, _) => {
                debug!(call = %self.call_id, from = %self.remote_user, "Received SDP offer");
                self.state = CallState::Offering;
                self.direction = Some(Direction::Incoming);
                self.remote_sdp = Some(sdp.to_string());
                vec![SignalingAction::Notify(CallNotice::Invitation)]
            }
            (CallState::Offering, Some(Direction::Incoming)) => {
                if self.local_sdp.is_none() && !self.remote_applied {
                    self.remote_sdp = Some(sdp.to_string());
                } else {
                    warn!(call = %self.call_id, "Ignoring repeated offer while answering");
                }
                Vec::new()
            }
            (CallState::Offering, _) => self.on_glare(sdp),
            (CallState::Connected, _) => {
                debug!(call = %self.call_id, from = %self.remote_user, "Renegotiating");
                self.renegotiating = true;
                let mut actions = self.apply_remote(sdp.to_string());
                actions.push(SignalingAction::CreateAnswer);
                actions
            }
            (CallState::Ended, _) => Vec::new(),
        }
    }

    /// Both sides offered at once. The side with the greater user id keeps its
    /// offer; the other one answers with the stream it already attached.
    fn on_glare(&mut self, sdp: &str) -> Vec<SignalingAction> {
        if self.local_user > self.remote_user {
            debug!(call = %self.call_id, "Offer collision, keeping local offer");
            return Vec::new();
        }

        debug!(call = %self.call_id, "Offer collision, yielding to remote offer");
        self.direction = Some(Direction::Incoming);
        self.local_sdp = None;
        self.remote_sdp = Some(sdp.to_string());

        let mut actions = self.apply_remote(sdp.to_string());
        actions.push(SignalingAction::CreateAnswer);
        actions
    }

    fn on_answer(&mut self, sdp: &str) -> Vec<SignalingAction> {
        let expected = self.state == CallState::Offering
            && self.direction == Some(Direction::Outgoing)
            && self.local_sdp.is_some();
        if !expected {
            warn!(
                call = %self.call_id,
                from = %self.remote_user,
                state = %self.state,
                "Ignoring unexpected SDP answer"
            );
            return Vec::new();
        }

        debug!(call = %self.call_id, from = %self.remote_user, "Received SDP answer");
        self.state = CallState::Connected;
        self.apply_remote(sdp.to_string())
    }

    /// Apply the remote description, then replay every candidate that arrived
    /// before it, oldest first.
    fn apply_remote(&mut self, sdp: String) -> Vec<SignalingAction> {
        self.remote_sdp = Some(sdp.clone());
        self.remote_applied = true;

        let mut actions = Vec::with_capacity(1 + self.pending_candidates.len());
        actions.push(SignalingAction::SetRemoteDescription(sdp));
        actions.extend(
            self.pending_candidates
                .drain(..)
                .map(SignalingAction::AddIceCandidate),
        );
        actions
    }

    fn end(&mut self) {
        self.state = CallState::Ended;
        self.media = None;
        self.remote_applied = false;
        self.renegotiating = false;
        self.pending_candidates.clear();
    }

    fn invalid(&self, operation: &'static str) -> CallError {
        CallError::InvalidTransition {
            state: self.state,
            operation,
        }
    }
}
