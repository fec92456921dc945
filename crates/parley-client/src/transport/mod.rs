//! Frame transport between the session and the server.
//!
//! A connection is an [`Outbox`] for outgoing frames plus a bounded receiver
//! of [`TransportEvent`]s. Implementations own their I/O tasks; the session
//! never sees sockets.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use parley_shared::protocol::Event;
use parley_shared::{encode, Frame};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

pub use memory::{MemoryRemote, MemoryTransport};
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// The connection is gone, with the peer's reason when it gave one.
    Closed(Option<String>),
}

/// Work for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Frame(Frame),
    Close,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str, inbound_buffer: usize) -> Result<Connection, TransportError>;
}

pub struct Connection {
    pub outbox: Outbox,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Encodes events and queues them for the connection's writer.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: &Event) -> Result<(), TransportError> {
        let frame = encode(event)?;
        debug!(kind = %event.kind(), len = frame.len(), "Sending frame");
        self.tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
