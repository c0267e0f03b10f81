//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Maximum WebSocket message size: 512 KiB of payload, the largest
/// possible header plus mask (14 bytes), and room for one interleaved
/// control frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024 + 14 + 140;

/// Default per-session memory ceiling.
pub const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Knobs for the connection-handling core. The CLI populates this; tests
/// override individual fields over `Default`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds.
    pub listen: SocketAddr,
    /// Inactivity timeout: a connection with no socket activity for this
    /// long is closed.
    pub timeout: Duration,
    /// Ceiling on a single WebSocket message, header included.
    pub max_message_size: usize,
    /// Per-session memory budget in bytes.
    pub memory_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9222)),
            timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}
