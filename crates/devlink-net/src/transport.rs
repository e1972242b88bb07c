//! NAT traversal and transport security seams
//!
//! The ICE engine and the TLS engine are external collaborators. This
//! module defines what the connection manager needs from them: an ICE
//! session that gathers candidates and negotiates a raw path, and a
//! handshaker that turns that path into an encrypted [`TlsEndpoint`].
//! Ownership flows one way: the handshaker consumes the ICE session, and the
//! endpoint is later consumed by a [`crate::MultiplexedSocket`].

use async_trait::async_trait;
use bytes::BytesMut;
use devlink_core::DeviceCertificate;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

// =============================================================================
// ICE
// =============================================================================

/// ICE errors
#[derive(Debug, Error)]
pub enum IceError {
    #[error("ICE initialization failed: {0}")]
    InitFailed(String),
    #[error("ICE negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("Invalid ICE candidates: {0}")]
    InvalidCandidates(String),
    #[error("ICE operations cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Which side controls the ICE negotiation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceRole {
    /// Acceptor of a signaling request
    Controlling,
    /// Initiator of a signaling request
    Controlled,
}

/// Options for a new ICE session
#[derive(Clone, Debug)]
pub struct IceConfig {
    pub role: IceRole,
    pub tcp_enable: bool,
    /// Cancelled when the owning attempt is torn down
    pub cancel: CancellationToken,
}

impl IceConfig {
    pub fn new(role: IceRole, cancel: CancellationToken) -> Self {
        Self {
            role,
            tcp_enable: true,
            cancel,
        }
    }
}

/// Local or remote ICE parameters carried in the signaling `ice_msg`.
///
/// Text form: ufrag, pwd, then one candidate per line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceMessage {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<String>,
}

impl IceMessage {
    pub fn encode(&self) -> String {
        let mut msg = String::new();
        msg.push_str(&self.ufrag);
        msg.push('\n');
        msg.push_str(&self.pwd);
        msg.push('\n');
        for candidate in &self.candidates {
            msg.push_str(candidate);
            msg.push('\n');
        }
        msg
    }

    pub fn parse(msg: &str) -> Result<Self, IceError> {
        let mut lines = msg.lines().map(str::trim).filter(|l| !l.is_empty());
        let ufrag = lines
            .next()
            .ok_or_else(|| IceError::InvalidCandidates("missing ufrag".into()))?;
        let pwd = lines
            .next()
            .ok_or_else(|| IceError::InvalidCandidates("missing pwd".into()))?;
        let candidates: Vec<String> = lines.map(String::from).collect();
        if candidates.is_empty() {
            return Err(IceError::InvalidCandidates("no candidates".into()));
        }
        Ok(Self {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
            candidates,
        })
    }
}

/// Byte stream produced by a successful ICE negotiation
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// One NAT traversal session, owned by exactly one attempt
#[async_trait]
pub trait IceSession: Send {
    /// Resolves once local candidates are gathered
    async fn wait_for_init(&mut self) -> Result<(), IceError>;

    /// Local ufrag/pwd and candidates to send to the peer
    fn local_message(&self) -> IceMessage;

    /// Feed the remote parameters and negotiate; resolves when a path is selected
    async fn start(&mut self, remote: IceMessage) -> Result<(), IceError>;

    /// Abort outstanding operations
    fn cancel_operations(&self);

    /// The negotiated path
    fn into_stream(self: Box<Self>) -> Result<Box<dyn RawStream>, IceError>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Creates ICE sessions
pub trait IceSessionFactory: Send + Sync {
    fn create(&self, config: IceConfig) -> Result<Box<dyn IceSession>, IceError>;
}

// =============================================================================
// TLS
// =============================================================================

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Peer certificate mismatch")]
    CertificateMismatch,
    #[error("Handshake timed out")]
    Timeout,
    #[error("ICE error: {0}")]
    Ice(#[from] IceError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Side of the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// Decrypting read half of an endpoint
#[async_trait]
pub trait SecureRead: Send {
    /// Append decrypted bytes to `buf`; `Ok(0)` means the peer closed the stream
    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize>;
}

/// Encrypting write half of an endpoint
#[async_trait]
pub trait SecureWrite: Send {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    async fn shutdown(&mut self) -> io::Result<()>;
}

/// What is known about the peer once the handshake completed
#[derive(Clone, Debug)]
pub struct EndpointInfo {
    pub peer_certificate: Arc<DeviceCertificate>,
    pub is_initiator: bool,
    /// Largest plaintext record the endpoint writes at once
    pub max_payload: usize,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

/// Encrypted endpoint over a negotiated path
pub struct TlsEndpoint {
    reader: Box<dyn SecureRead>,
    writer: Box<dyn SecureWrite>,
    info: EndpointInfo,
}

impl TlsEndpoint {
    pub fn new(reader: Box<dyn SecureRead>, writer: Box<dyn SecureWrite>, info: EndpointInfo) -> Self {
        Self {
            reader,
            writer,
            info,
        }
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    pub fn into_parts(self) -> (Box<dyn SecureRead>, Box<dyn SecureWrite>, EndpointInfo) {
        (self.reader, self.writer, self.info)
    }
}

impl std::fmt::Debug for TlsEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEndpoint").field("info", &self.info).finish()
    }
}

/// Runs the transport-security handshake on a negotiated ICE path
#[async_trait]
pub trait TlsHandshaker: Send + Sync {
    /// `expected_peer` is the certificate the peer must present
    async fn handshake(
        &self,
        path: Box<dyn IceSession>,
        role: TlsRole,
        expected_peer: Arc<DeviceCertificate>,
    ) -> Result<TlsEndpoint, HandshakeError>;
}
