//! Wire-level building blocks shared by every Parley crate: identifiers,
//! the [`protocol::Event`] union and the JSON frame codec.

pub mod codec;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use codec::{decode, encode, Frame};
pub use error::ProtocolError;
pub use protocol::{now_millis, Event, EventKind, Signal};
