//! devlink Core Library
//!
//! This crate provides the identities, device certificates and wire types
//! shared by the devlink connection manager and its daemon.
//!
//! # Modules
//!
//! - [`types`]: Identity newtypes, signaling and channel messages
//! - [`canonical`]: Canonical (signed) and wire (MessagePack) encodings
//! - [`crypto`]: Identity derivations, keys and device certificates
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

pub use crypto::{DeviceCertificate, KeyPair};
pub use error::{Error, Result};
pub use types::*;
