//! Tunables for connections and the readiness loop.

use std::time::Duration;

/// Configuration shared by a [`ConnectionManager`](crate::ConnectionManager)
/// and every connection created on it.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Upper bound for one blocking connect attempt per resolved address.
    pub connect_timeout: Duration,
    /// Size of a single `read` call on a stream socket.
    pub read_chunk_size: usize,
    /// Bytes read from one stream per read event before yielding to other
    /// sockets. The rest is picked up on the next pass.
    pub max_read_per_event: usize,
    /// Datagrams drained from a UDP socket per read event.
    pub max_datagrams_per_event: usize,
    /// Capacity of the readiness event buffer.
    pub events_capacity: usize,
    /// Tick length used by drivers that do not pick their own.
    pub poll_timeout: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_chunk_size: 4096,
            max_read_per_event: 64 * 1024,
            max_datagrams_per_event: 64,
            events_capacity: 256,
            poll_timeout: Duration::from_millis(16),
        }
    }
}
