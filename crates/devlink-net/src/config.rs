//! Connection manager configuration

use std::time::Duration;

/// Protocol version announced on every multiplexed socket
pub const MULTIPLEXED_SOCKET_VERSION: i32 = 1;

/// First protocol version that answers beacons
pub const MIN_BEACON_VERSION: i32 = 1;

/// Tunables of a [`crate::ConnectionManager`]
#[derive(Clone, Debug)]
pub struct ConnectionManagerConfig {
    /// How long an initiator waits for the signaling answer
    pub answer_timeout: Duration,
    /// Random attempt ids drawn before giving up on a collision-free one
    pub max_attempt_id_tries: usize,
    /// Deadline for beacons sent by `connectivity_changed`
    pub beacon_timeout: Duration,
    /// Version announced to peers
    pub protocol_version: i32,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(30),
            max_attempt_id_tries: 100,
            beacon_timeout: Duration::from_secs(3),
            protocol_version: MULTIPLEXED_SOCKET_VERSION,
        }
    }
}

impl ConnectionManagerConfig {
    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = timeout;
        self
    }

    pub fn with_beacon_timeout(mut self, timeout: Duration) -> Self {
        self.beacon_timeout = timeout;
        self
    }
}
