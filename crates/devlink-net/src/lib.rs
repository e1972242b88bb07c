//! Peer connections for devlink
//!
//! This crate provides:
//! - Channel multiplexing over one encrypted endpoint ([`MultiplexedSocket`])
//! - Logical byte-stream channels ([`ChannelSocket`])
//! - Connection negotiation through signaling, ICE and a handshake
//! - The [`ConnectionManager`] tying them together per peer device
//! - Seams for the external signaling, ICE and TLS engines, with in-process
//!   implementations in [`mock`]

mod attempt;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod framing;
pub mod manager;
pub mod mock;
pub mod multiplexed;
mod pending;
pub mod peer;
pub mod signaling;
pub mod transport;

pub use attempt::{AttemptError, AttemptState, Direction, ATTEMPT_ID_MAX};
pub use channel::{ChannelError, ChannelSocket, ChannelState};
pub use config::{ConnectionManagerConfig, MULTIPLEXED_SOCKET_VERSION};
pub use framing::{Frame, FrameCodec, FrameError, MAX_FRAME_PAYLOAD};
pub use manager::{Backends, ConnectError, ConnectOptions, ConnectionManager};
pub use multiplexed::{MultiplexedSocket, SocketError};
pub use peer::{found_peer_device, CertificateProvider, CertificateStore};
pub use pending::{CallbackId, ConnectCallback};
pub use signaling::{
    MemoryTreatedMessages, SignalingError, SignalingService, SignalingValue, TreatedMessageStore,
};
pub use transport::{
    EndpointInfo, HandshakeError, IceConfig, IceError, IceMessage, IceRole, IceSession,
    IceSessionFactory, SecureRead, SecureWrite, TlsEndpoint, TlsHandshaker, TlsRole,
};
