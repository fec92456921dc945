//! Boundary to the host's media stack.
//!
//! The core never touches media itself. It asks the engine to produce and
//! consume session descriptions and candidates for a given remote peer, and
//! the host reports what the engine discovers on its own (local candidates,
//! remote streams) back as [`MediaEvent`]s.

use async_trait::async_trait;
use parley_shared::types::UserId;

use crate::error::MediaError;

/// Opaque reference to a local or remote media stream owned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle {
    id: String,
}

impl MediaHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// One media association per remote peer. All operations may fail; the core
/// turns failures into error events or rejected results, never panics.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_local_offer(&self, peer: &UserId) -> Result<String, MediaError>;

    async fn create_local_answer(&self, peer: &UserId) -> Result<String, MediaError>;

    async fn set_remote_description(&self, peer: &UserId, sdp: &str) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, peer: &UserId, candidate: &str) -> Result<(), MediaError>;

    async fn attach_local_stream(
        &self,
        peer: &UserId,
        stream: &MediaHandle,
    ) -> Result<(), MediaError>;

    /// Drop the association with `peer`. Closing an unknown peer is a no-op.
    async fn close(&self, peer: &UserId);
}

/// Things the engine learns asynchronously and reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// A local ICE candidate to trickle to `peer`.
    LocalCandidate { peer: UserId, candidate: String },
    /// Media from `peer` started flowing.
    RemoteStream { peer: UserId, stream: MediaHandle },
}

/// Engine for text-only clients: every negotiation step fails with
/// [`MediaError::Unsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMedia;

#[async_trait]
impl MediaEngine for NoMedia {
    async fn create_local_offer(&self, _peer: &UserId) -> Result<String, MediaError> {
        Err(MediaError::Unsupported)
    }

    async fn create_local_answer(&self, _peer: &UserId) -> Result<String, MediaError> {
        Err(MediaError::Unsupported)
    }

    async fn set_remote_description(&self, _peer: &UserId, _sdp: &str) -> Result<(), MediaError> {
        Err(MediaError::Unsupported)
    }

    async fn add_ice_candidate(&self, _peer: &UserId, _candidate: &str) -> Result<(), MediaError> {
        Err(MediaError::Unsupported)
    }

    async fn attach_local_stream(
        &self,
        _peer: &UserId,
        _stream: &MediaHandle,
    ) -> Result<(), MediaError> {
        Err(MediaError::Unsupported)
    }

    async fn close(&self, _peer: &UserId) {}
}
