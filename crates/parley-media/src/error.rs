use parley_shared::types::UserId;
use thiserror::Error;

use crate::signaling::CallState;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Media is not supported by this client")]
    Unsupported,

    #[error("No media association for peer: {0}")]
    UnknownPeer(UserId),
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Cannot {operation} a call in state {state}")]
    InvalidTransition {
        state: CallState,
        operation: &'static str,
    },

    #[error("User {0} is not a participant of this call")]
    NotParticipant(UserId),

    #[error("Max peers reached")]
    MaxPeersReached,
}
