//! # codec
//!
//! why: turn the node's persistent fields into opaque bytes and back
//! relations: used by lib.rs load/save helpers, bytes handed to any Storage
//! what: StorageError, encode_state, decode_state

use std::io;

use raft_core::PersistentState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("persisted state is corrupt: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Encodes term, vote and log as json.
pub fn encode_state(state: &PersistentState) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(state)?)
}

/// Decodes bytes written by [`encode_state`]. Empty bytes mean first boot.
pub fn decode_state(bytes: &[u8]) -> Result<Option<PersistentState>, StorageError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(bytes)?))
}
