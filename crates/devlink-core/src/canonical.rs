//! Encodings used by devlink
//!
//! Two encodings are in use:
//! - signed objects (certificates) use postcard: field order is Rust struct
//!   field order and the bytes are deterministic
//! - messages crossing the wire use MessagePack maps with named fields so a
//!   receiver can tell message kinds apart without a type tag

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// These are the bytes covered by signatures.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Serialize a wire message as a named MessagePack map.
pub fn wire_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(Error::from)
}

/// Decode a wire message produced by [`wire_bytes`].
pub fn from_wire_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.is_empty() {
        return Err(Error::EmptyMessage);
    }
    rmp_serde::from_slice(bytes).map_err(Error::from)
}
