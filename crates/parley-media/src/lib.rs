//! Call signaling on top of an opaque, host-provided media engine.

pub mod engine;
pub mod error;
pub mod mesh;
pub mod signaling;

pub use engine::{MediaEngine, MediaEvent, MediaHandle, NoMedia};
pub use error::{CallError, MediaError};
pub use mesh::{Call, PeerActions};
pub use signaling::{CallNotice, CallState, Direction, SignalingAction, SignalingSession};
