//! In-process backends for tests and the daemon self-test
//!
//! - [`LoopbackDht`]: signaling values stored in memory and pushed to listeners
//! - [`LoopbackIceNetwork`]: ICE sessions paired by ufrag over in-memory pipes
//! - [`LoopbackHandshaker`]: certificate-pinned X25519 handshake with
//!   ChaCha20-Poly1305 records

use crate::crypto::{EphemeralKeyExchange, OpeningKey, SealingKey, SessionKeys};
use crate::framing::MAX_FRAME_PAYLOAD;
use crate::multiplexed::MultiplexedSocket;
use crate::signaling::{SignalingError, SignalingService, SignalingValue};
use crate::transport::{
    EndpointInfo, HandshakeError, IceConfig, IceError, IceMessage, IceRole, IceSession,
    IceSessionFactory, RawStream, SecureRead, SecureWrite, TlsEndpoint, TlsHandshaker, TlsRole,
};
use async_trait::async_trait;
use bytes::BytesMut;
use devlink_core::canonical::canonical_bytes;
use devlink_core::{DeviceCertificate, DeviceId, KeyPair, PeerIdentity, SignalingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use x25519_dalek::PublicKey as X25519Public;

const DUPLEX_CAPACITY: usize = 256 * 1024;
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_CONTEXT: &[u8] = b"devlink-loopback-v1";
const RECORD_AAD: &[u8] = b"devlink-record";
/// Largest sealed record accepted from the peer
const MAX_RECORD: usize = 1 << 20;

// =============================================================================
// IDENTITIES
// =============================================================================

/// Account key, device key and the certificate binding them
pub struct LoopbackIdentity {
    pub account: KeyPair,
    pub device: KeyPair,
    pub certificate: Arc<DeviceCertificate>,
}

impl LoopbackIdentity {
    pub fn generate() -> Self {
        Self::with_account(KeyPair::generate())
    }

    /// Another device of the same account
    pub fn with_account(account: KeyPair) -> Self {
        Self::from_keys(account, KeyPair::generate())
    }

    /// Identity for existing keys, e.g. restored from seeds
    pub fn from_keys(account: KeyPair, device: KeyPair) -> Self {
        let certificate = Arc::new(DeviceCertificate::issue(&account, device.public_key()));
        Self {
            account,
            device,
            certificate,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.certificate.device_id()
    }

    pub fn peer_identity(&self) -> PeerIdentity {
        self.certificate.issuer_id()
    }
}

// =============================================================================
// SIGNALING
// =============================================================================

#[derive(Default)]
struct DhtState {
    values: HashMap<SignalingKey, Vec<SignalingValue>>,
    listeners: HashMap<SignalingKey, Vec<mpsc::UnboundedSender<SignalingValue>>>,
}

/// Shared in-memory signaling overlay
#[derive(Default)]
pub struct LoopbackDht {
    state: Mutex<DhtState>,
    puts: AtomicUsize,
}

impl LoopbackDht {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Values published so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingService for LoopbackDht {
    async fn put(&self, key: SignalingKey, value: SignalingValue) -> Result<(), SignalingError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.values.entry(key).or_default().push(value.clone());
        if let Some(listeners) = state.listeners.get_mut(&key) {
            listeners.retain(|tx| tx.send(value.clone()).is_ok());
        }
        Ok(())
    }

    async fn listen(
        &self,
        key: SignalingKey,
    ) -> Result<mpsc::UnboundedReceiver<SignalingValue>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for value in state.values.get(&key).into_iter().flatten() {
            let _ = tx.send(value.clone());
        }
        state.listeners.entry(key).or_default().push(tx);
        Ok(rx)
    }
}

// =============================================================================
// ICE
// =============================================================================

type RendezvousKey = (String, String);

/// Pairs sessions whose local and remote ufrags match
pub struct LoopbackIceNetwork {
    rendezvous: Mutex<HashMap<RendezvousKey, oneshot::Sender<DuplexStream>>>,
    fail_negotiation: AtomicBool,
    sessions: AtomicUsize,
    weak_self: Weak<Self>,
}

impl LoopbackIceNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            rendezvous: Mutex::new(HashMap::new()),
            fail_negotiation: AtomicBool::new(false),
            sessions: AtomicUsize::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// Make every subsequent negotiation fail
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Sessions created so far
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl IceSessionFactory for LoopbackIceNetwork {
    fn create(&self, config: IceConfig) -> Result<Box<dyn IceSession>, IceError> {
        let network = self
            .weak_self
            .upgrade()
            .ok_or_else(|| IceError::InitFailed("network is gone".into()))?;
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackIceSession {
            network,
            ufrag: hex::encode(rand::random::<[u8; 8]>()),
            pwd: hex::encode(rand::random::<[u8; 16]>()),
            config,
            stream: None,
        }))
    }
}

struct LoopbackIceSession {
    network: Arc<LoopbackIceNetwork>,
    ufrag: String,
    pwd: String,
    config: IceConfig,
    stream: Option<DuplexStream>,
}

#[async_trait]
impl IceSession for LoopbackIceSession {
    async fn wait_for_init(&mut self) -> Result<(), IceError> {
        if self.config.cancel.is_cancelled() {
            return Err(IceError::Cancelled);
        }
        Ok(())
    }

    fn local_message(&self) -> IceMessage {
        IceMessage {
            ufrag: self.ufrag.clone(),
            pwd: self.pwd.clone(),
            candidates: vec![format!("1 1 loopback 1 {} 0 typ host", self.ufrag)],
        }
    }

    async fn start(&mut self, remote: IceMessage) -> Result<(), IceError> {
        if self.network.fail_negotiation.load(Ordering::SeqCst) {
            return Err(IceError::NegotiationFailed("no valid candidate pair".into()));
        }
        let key = (self.ufrag.clone(), remote.ufrag.clone());
        let waiting = {
            let mut rendezvous = self.network.rendezvous.lock();
            if let Some(peer) = rendezvous.remove(&(remote.ufrag.clone(), self.ufrag.clone())) {
                let (ours, theirs) = tokio::io::duplex(DUPLEX_CAPACITY);
                if peer.send(theirs).is_ok() {
                    self.stream = Some(ours);
                    return Ok(());
                }
            }
            let (tx, rx) = oneshot::channel();
            rendezvous.insert(key.clone(), tx);
            rx
        };

        let cancel = self.config.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(IceError::Cancelled),
            stream = tokio::time::timeout(NEGOTIATION_TIMEOUT, waiting) => match stream {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(_)) => Err(IceError::NegotiationFailed("peer session dropped".into())),
                Err(_) => Err(IceError::NegotiationFailed("timed out".into())),
            },
        };
        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                self.network.rendezvous.lock().remove(&key);
                Err(e)
            }
        }
    }

    fn cancel_operations(&self) {
        self.config.cancel.cancel();
    }

    fn into_stream(self: Box<Self>) -> Result<Box<dyn RawStream>, IceError> {
        let session = *self;
        match session.stream {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(IceError::NegotiationFailed("not negotiated".into())),
        }
    }
}

// =============================================================================
// SECURE TRANSPORT
// =============================================================================

#[derive(Serialize, Deserialize)]
struct Hello {
    certificate: DeviceCertificate,
    ephemeral: [u8; 32],
    /// Device key signature over `ephemeral`
    signature: Vec<u8>,
}

async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_RECORD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record too large: {len}"),
        ));
    }
    let mut record = vec![0u8; len];
    reader.read_exact(&mut record).await?;
    Ok(Some(record))
}

async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, record: &[u8]) -> io::Result<()> {
    writer.write_u32(record.len() as u32).await?;
    writer.write_all(record).await?;
    writer.flush().await
}

fn invalid_data(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Handshake pinned to the expected peer certificate
pub struct LoopbackHandshaker {
    device: KeyPair,
    certificate: Arc<DeviceCertificate>,
}

impl LoopbackHandshaker {
    pub fn new(identity: &LoopbackIdentity) -> Self {
        Self {
            device: identity.device.clone(),
            certificate: identity.certificate.clone(),
        }
    }

    async fn run(
        &self,
        mut stream: Box<dyn RawStream>,
        role: TlsRole,
        expected_peer: Arc<DeviceCertificate>,
    ) -> Result<(Box<dyn SecureRead>, Box<dyn SecureWrite>), HandshakeError> {
        let exchange = EphemeralKeyExchange::new();
        let ephemeral = exchange.public_key();
        let hello = Hello {
            certificate: (*self.certificate).clone(),
            ephemeral,
            signature: self.device.sign(&ephemeral).to_vec(),
        };
        let hello = canonical_bytes(&hello).map_err(|e| HandshakeError::Protocol(e.to_string()))?;
        write_record(&mut stream, &hello).await?;

        let peer = read_record(&mut stream)
            .await?
            .ok_or_else(|| HandshakeError::Protocol("closed during handshake".into()))?;
        let peer: Hello =
            postcard::from_bytes(&peer).map_err(|e| HandshakeError::Protocol(e.to_string()))?;

        if peer.certificate != *expected_peer || peer.certificate.verify().is_err() {
            return Err(HandshakeError::CertificateMismatch);
        }
        KeyPair::verify(
            &peer.certificate.device_public_key,
            &peer.ephemeral,
            &peer.signature,
        )
        .map_err(|_| HandshakeError::CertificateMismatch)?;

        let shared = exchange.exchange(&peer.ephemeral);
        let keys = SessionKeys::derive(
            &shared,
            &X25519Public::from(ephemeral),
            &X25519Public::from(peer.ephemeral),
            HANDSHAKE_CONTEXT,
        )
        .and_then(SessionKeys::split)
        .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
        let (sealing, opening) = keys;

        tracing::debug!(
            "Loopback handshake done with {} as {:?}",
            expected_peer.device_id(),
            role
        );
        let (read_half, write_half) = tokio::io::split(stream);
        Ok((
            Box::new(LoopbackReader {
                inner: read_half,
                opening,
            }),
            Box::new(LoopbackWriter {
                inner: write_half,
                sealing,
            }),
        ))
    }
}

#[async_trait]
impl TlsHandshaker for LoopbackHandshaker {
    async fn handshake(
        &self,
        path: Box<dyn IceSession>,
        role: TlsRole,
        expected_peer: Arc<DeviceCertificate>,
    ) -> Result<TlsEndpoint, HandshakeError> {
        let local_addr = path.local_addr();
        let remote_addr = path.remote_addr();
        let stream = path.into_stream()?;
        let (reader, writer) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.run(stream, role, expected_peer.clone()),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;
        Ok(TlsEndpoint::new(
            reader,
            writer,
            EndpointInfo {
                peer_certificate: expected_peer,
                is_initiator: role == TlsRole::Client,
                max_payload: MAX_FRAME_PAYLOAD,
                local_addr,
                remote_addr,
            },
        ))
    }
}

struct LoopbackReader {
    inner: ReadHalf<Box<dyn RawStream>>,
    opening: OpeningKey,
}

#[async_trait]
impl SecureRead for LoopbackReader {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        loop {
            let Some(record) = read_record(&mut self.inner).await? else {
                return Ok(0);
            };
            let plaintext = self.opening.open(&record, RECORD_AAD).map_err(invalid_data)?;
            if plaintext.is_empty() {
                continue;
            }
            buf.extend_from_slice(&plaintext);
            return Ok(plaintext.len());
        }
    }
}

struct LoopbackWriter {
    inner: WriteHalf<Box<dyn RawStream>>,
    sealing: SealingKey,
}

#[async_trait]
impl SecureWrite for LoopbackWriter {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let record = self.sealing.seal(data, RECORD_AAD).map_err(invalid_data)?;
        write_record(&mut self.inner, &record).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Negotiate and secure a direct path between two identities.
///
/// The first endpoint belongs to `a` (client), the second to `b` (server).
pub async fn endpoint_pair(
    a: &LoopbackIdentity,
    b: &LoopbackIdentity,
) -> Result<(TlsEndpoint, TlsEndpoint), HandshakeError> {
    let network = LoopbackIceNetwork::new();
    let mut ice_a = network.create(IceConfig::new(IceRole::Controlled, CancellationToken::new()))?;
    let mut ice_b = network.create(IceConfig::new(IceRole::Controlling, CancellationToken::new()))?;
    let msg_a = ice_a.local_message();
    let msg_b = ice_b.local_message();
    let (started_a, started_b) = tokio::join!(ice_a.start(msg_b), ice_b.start(msg_a));
    started_a?;
    started_b?;

    let handshaker_a = LoopbackHandshaker::new(a);
    let handshaker_b = LoopbackHandshaker::new(b);
    let (endpoint_a, endpoint_b) = tokio::join!(
        handshaker_a.handshake(ice_a, TlsRole::Client, b.certificate.clone()),
        handshaker_b.handshake(ice_b, TlsRole::Server, a.certificate.clone()),
    );
    Ok((endpoint_a?, endpoint_b?))
}

/// Two connected, not yet started, multiplexed sockets
pub async fn socket_pair(
    a: &LoopbackIdentity,
    b: &LoopbackIdentity,
) -> Result<(Arc<MultiplexedSocket>, Arc<MultiplexedSocket>), HandshakeError> {
    let (endpoint_a, endpoint_b) = endpoint_pair(a, b).await?;
    Ok((
        MultiplexedSocket::new(b.device_id(), endpoint_a),
        MultiplexedSocket::new(a.device_id(), endpoint_b),
    ))
}
