use std::sync::Mutex;

use async_trait::async_trait;
use parley_shared::protocol::Event;
use parley_shared::{decode, encode, Frame};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::{Connection, Outbox, Outgoing, Transport, TransportEvent};
use crate::error::TransportError;

const MEMORY_BUFFER: usize = 256;

/// In-process transport. The other end is a [`MemoryRemote`] that plays the
/// server. A transport connects once.
pub struct MemoryTransport {
    connection: Mutex<Option<Connection>>,
}

/// Server side of a [`MemoryTransport`].
pub struct MemoryRemote {
    inbound: mpsc::Sender<TransportEvent>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryRemote) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(MEMORY_BUFFER);

        let transport = Self {
            connection: Mutex::new(Some(Connection {
                outbox: Outbox::new(out_tx),
                inbound: in_rx,
            })),
        };
        let remote = MemoryRemote {
            inbound: in_tx,
            outgoing: out_rx,
        };
        (transport, remote)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _url: &str, _inbound_buffer: usize) -> Result<Connection, TransportError> {
        self.connection
            .lock()
            .map_err(|_| TransportError::Connect("memory transport lock poisoned".into()))?
            .take()
            .ok_or_else(|| TransportError::Connect("memory transport already used".into()))
    }
}

impl MemoryRemote {
    pub async fn push(&self, event: &Event) -> Result<(), TransportError> {
        self.push_raw(encode(event)?).await
    }

    pub async fn push_raw(&self, frame: impl Into<Frame>) -> Result<(), TransportError> {
        self.inbound
            .send(TransportEvent::Frame(frame.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Drop the connection from the server side.
    pub async fn close(&self, reason: Option<String>) {
        let _ = self.inbound.send(TransportEvent::Closed(reason)).await;
    }

    /// Next frame the client sent, decoded. `None` once the client closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        match self.outgoing.recv().await? {
            Outgoing::Frame(frame) => Some(decode(&frame)),
            Outgoing::Close => None,
        }
    }

    /// Like [`MemoryRemote::next_event`] without waiting.
    pub fn try_next_event(&mut self) -> Option<Event> {
        match self.outgoing.try_recv() {
            Ok(Outgoing::Frame(frame)) => Some(decode(&frame)),
            Ok(Outgoing::Close) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                None
            }
        }
    }
}
