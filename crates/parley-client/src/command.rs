use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use parley_media::{MediaEvent, MediaHandle};
use parley_shared::protocol::MessageAck;
use parley_shared::types::{CallId, CallInfo, CallKind, RoomId, RoomInfo, RosterEntry, UserId};
use tokio::sync::mpsc;

use crate::calls::CallSnapshot;
use crate::deferred::{deferred, Deferred, Resolver};
use crate::error::{Result, SessionError};
use crate::rooms::RoomState;

/// Requests from the facade and upgrade handles to the dispatch task.
#[derive(Debug)]
pub enum SessionCommand {
    Offer {
        call: Option<CallId>,
        kind: CallKind,
        peers: Vec<UserId>,
        media: MediaHandle,
        reply: Resolver<CallSnapshot>,
    },
    Answer {
        call: CallId,
        media: MediaHandle,
        reply: Resolver<CallSnapshot>,
    },
    Reject {
        call: CallId,
        reply: Resolver<()>,
    },
    Hangup {
        call: CallId,
        reason: String,
        reply: Resolver<()>,
    },
    CallState {
        call: CallId,
        reply: Resolver<Option<CallSnapshot>>,
    },
    TrackCall(CallInfo),

    SendMessage {
        room: RoomId,
        body: String,
        reply: Resolver<MessageAck>,
    },
    Mark {
        room: RoomId,
        timestamp: DateTime<Utc>,
        reply: Resolver<()>,
    },
    JoinRoom {
        room: RoomId,
        reply: Resolver<()>,
    },
    LeaveRoom {
        room: RoomId,
        reply: Resolver<()>,
    },
    InviteToRoom {
        room: RoomId,
        user: UserId,
        reply: Resolver<()>,
    },
    RoomState {
        room: RoomId,
        reply: Resolver<Option<RoomState>>,
    },
    TrackRoom(RoomInfo),

    AddToRoster {
        user: UserId,
        reply: Resolver<()>,
    },
    RemoveFromRoster {
        user: UserId,
        reply: Resolver<()>,
    },
    ApplyRoster(Vec<RosterEntry>),
    Roster {
        reply: Resolver<Vec<RosterEntry>>,
    },

    Media(MediaEvent),
    Disconnect {
        reply: Resolver<()>,
    },
}

/// Sending half of the current connection's command channel. Empty while
/// disconnected; replaced on every connect.
#[derive(Clone, Default)]
pub struct Commands {
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<SessionCommand>>>>,
}

impl Commands {
    pub(crate) fn install(&self, tx: mpsc::UnboundedSender<SessionCommand>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<SessionCommand>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.sender().is_some()
    }

    pub fn send(&self, command: SessionCommand) -> Result<()> {
        self.sender()
            .ok_or(SessionError::NotConnected)?
            .send(command)
            .map_err(|_| SessionError::NotConnected)
    }

    /// Send a command carrying a resolver and hand back its result.
    pub fn request<T>(&self, build: impl FnOnce(Resolver<T>) -> SessionCommand) -> Deferred<T> {
        let Some(tx) = self.sender() else {
            return Deferred::rejected(SessionError::NotConnected);
        };
        let (resolver, result) = deferred();
        // On failure the command and its resolver are dropped, which
        // cancels `result`.
        let _ = tx.send(build(resolver));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_fail_while_disconnected() {
        let commands = Commands::default();
        assert!(!commands.is_connected());
        let result = commands.request(|reply| SessionCommand::Roster { reply });
        assert!(matches!(result.await, Err(SessionError::NotConnected)));
        assert!(matches!(
            commands.send(SessionCommand::ApplyRoster(Vec::new())),
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let commands = Commands::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        commands.install(tx);
        assert!(commands.is_connected());

        let result = commands.request(|reply| SessionCommand::Roster { reply });
        match rx.recv().await {
            Some(SessionCommand::Roster { reply }) => reply.resolve(Vec::new()),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(result.await.unwrap().is_empty());

        drop(rx);
        assert!(!commands.is_connected());
    }
}
