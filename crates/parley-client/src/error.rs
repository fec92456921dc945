use parley_media::{CallError, MediaError};
use parley_shared::types::CallId;
use parley_shared::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Connection closed: {0}")]
    Disconnected(String),

    #[error("Call not found: {0}")]
    UnknownCall(CallId),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, SessionError>;
