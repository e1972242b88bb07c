//! Persistent storage using sled

use crate::config::NodeState;
use devlink_net::TreatedMessageStore;
use sled::Db;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

const NODE_STATE_KEY: &str = "node_state";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Storage backend for devlinkd
pub struct Storage {
    db: Db,
    /// Signaling message ids already handled: id -> ()
    treated: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let treated = db.open_tree("treated_messages")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            treated,
            metadata,
        })
    }

    /// Load the node state, if one was saved
    pub fn node_state(&self) -> Result<Option<NodeState>, StorageError> {
        match self.metadata.get(NODE_STATE_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Save the node state
    pub fn put_node_state(&self, state: &NodeState) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(state)?;
        self.metadata.insert(NODE_STATE_KEY, value)?;
        self.db.flush()?;
        Ok(())
    }

    /// Load the saved node state or create and save a fresh one
    pub fn load_or_create_node_state(&self) -> Result<NodeState, StorageError> {
        if let Some(state) = self.node_state()? {
            return Ok(state);
        }
        let state = NodeState {
            account_seed: rand::random(),
            device_seed: rand::random(),
        };
        self.put_node_state(&state)?;
        Ok(state)
    }

    /// Record `id`; returns true when it had been stored before
    pub fn mark_treated(&self, id: &str) -> Result<bool, StorageError> {
        let previous = self.treated.insert(id, Vec::<u8>::new())?;
        if previous.is_none() {
            self.treated.flush()?;
        }
        Ok(previous.is_some())
    }

    /// Count treated message ids
    pub fn treated_count(&self) -> usize {
        self.treated.len()
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl TreatedMessageStore for Storage {
    fn is_message_treated(&self, id: &str) -> bool {
        match self.mark_treated(id) {
            Ok(treated) => treated,
            Err(e) => {
                warn!("Unable to record treated message {}: {}", id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_node_state_persists() {
        let dir = tempdir().unwrap();
        let state = {
            let storage = Storage::open(dir.path()).unwrap();
            assert!(storage.node_state().unwrap().is_none());
            storage.load_or_create_node_state().unwrap()
        };

        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.node_state().unwrap(), Some(state.clone()));
        assert_eq!(storage.load_or_create_node_state().unwrap(), state);
    }

    #[test]
    fn test_treated_messages_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            assert!(!storage.is_message_treated("000000000000002a"));
            assert!(storage.is_message_treated("000000000000002a"));
            assert_eq!(storage.treated_count(), 1);
        }

        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.is_message_treated("000000000000002a"));
        assert!(!storage.is_message_treated("000000000000002b"));
        assert_eq!(storage.treated_count(), 2);
    }
}
