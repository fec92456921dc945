/// Application name
pub const APP_NAME: &str = "Parley";

/// Maximum encoded frame size in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Default server port used by local development setups
pub const DEFAULT_SERVER_PORT: u16 = 5431;

/// Maximum number of remote peers in a mesh group call
pub const MAX_MESH_PEERS: usize = 8;

/// Hangup reason sent when an incoming call is declined
pub const REASON_REJECTED: &str = "rejected";

/// Hangup reason reported for calls unwound by a lost connection
pub const REASON_DISCONNECTED: &str = "disconnected";

/// Hangup reason used when the local user ends a call without giving one
pub const REASON_HANGUP: &str = "hangup";

/// Header carrying the API key on resource requests
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Number of recent message ids remembered for acknowledgement bookkeeping
pub const ACK_HISTORY: usize = 4096;
