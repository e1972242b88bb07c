//! Signaling seam (DHT put/listen) and processed-message bookkeeping

use async_trait::async_trait;
use devlink_core::{DeviceId, SignalingKey};
use parking_lot::Mutex;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Signaling service unavailable")]
    Unavailable,
    #[error("Put failed: {0}")]
    PutFailed(String),
}

/// One value published under a signaling key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalingValue {
    /// Device that published the value
    pub from: DeviceId,
    /// Encoded `PeerConnectionRequest`
    pub data: Vec<u8>,
}

/// Key-value overlay used to exchange connection requests
#[async_trait]
pub trait SignalingService: Send + Sync {
    async fn put(&self, key: SignalingKey, value: SignalingValue) -> Result<(), SignalingError>;

    /// Values published under `key`, including ones already stored
    async fn listen(
        &self,
        key: SignalingKey,
    ) -> Result<mpsc::UnboundedReceiver<SignalingValue>, SignalingError>;
}

/// Remembers which signaling messages were already handled
pub trait TreatedMessageStore: Send + Sync {
    /// Record `id`; returns true when it had been seen before
    fn is_message_treated(&self, id: &str) -> bool;
}

/// Process-lifetime treated-message set
#[derive(Default)]
pub struct MemoryTreatedMessages {
    ids: Mutex<HashSet<String>>,
}

impl MemoryTreatedMessages {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TreatedMessageStore for MemoryTreatedMessages {
    fn is_message_treated(&self, id: &str) -> bool {
        !self.ids.lock().insert(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_treated_once() {
        let store = MemoryTreatedMessages::new();
        assert!(!store.is_message_treated("00000000000000aa"));
        assert!(store.is_message_treated("00000000000000aa"));
        assert!(!store.is_message_treated("00000000000000bb"));
    }
}
