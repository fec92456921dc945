//! # parley-client
//!
//! Client session core: one transport connection, an event registry that
//! routes decoded frames to subscribers, and the call and room layers that
//! turn caller operations into protocol traffic.
//!
//! Media is left to the host. A [`Session`] drives signaling through a
//! [`parley_media::MediaEngine`] and hears back through its [`MediaSink`].

pub mod api;
pub mod calls;
pub mod command;
pub mod config;
pub mod deferred;
pub mod error;
pub mod events;
pub mod rooms;
pub mod roster;
pub mod session;
pub mod transport;
pub mod upgrade;

use tracing_subscriber::{fmt, EnvFilter};

pub use api::{HttpResourceApi, ResourceApi};
pub use calls::CallSnapshot;
pub use config::{ClientConfig, RtcConfig};
pub use deferred::Deferred;
pub use error::{ApiError, Result, SessionError, TransportError};
pub use events::{EventHandler, HandlerId};
pub use rooms::RoomState;
pub use session::{MediaSink, Session};
pub use transport::{MemoryRemote, MemoryTransport, Transport, WebSocketTransport};
pub use upgrade::{CallHandle, IncomingCall, RoomHandle, RoomInvite};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_client=debug,parley_media=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
