//! Connection attempts: signaling, NAT traversal and handshake
//!
//! Initiator: gather candidates, publish a request, wait for the answer,
//! negotiate, then run the client handshake. Acceptor: gather candidates,
//! publish the answer, negotiate, then run the server handshake. The ICE
//! session moves into the handshake and the resulting endpoint into the
//! multiplexed socket, so each stage owns the previous one.

use crate::config::ConnectionManagerConfig;
use crate::manager::Backends;
use crate::multiplexed::MultiplexedSocket;
use crate::pending::CallbackId;
use crate::signaling::SignalingValue;
use crate::transport::{
    HandshakeError, IceConfig, IceError, IceMessage, IceRole, IceSession, TlsEndpoint, TlsRole,
};
use devlink_core::canonical::wire_bytes;
use devlink_core::crypto::derive_signaling_key;
use devlink_core::{AttemptId, DeviceCertificate, DeviceId, PeerConnectionRequest};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Attempt ids stay within the integer range every peer implementation can
/// represent exactly.
pub const ATTEMPT_ID_MAX: AttemptId = (1 << 53) - 1;

/// Attempt lifecycle; only moves forward
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttemptState {
    Idle,
    NatInit,
    NatNegotiating,
    TlsHandshake,
    Ready,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Started by `connect_device`
    Outgoing,
    /// Started by a signaling request
    Incoming,
}

/// Why an attempt failed
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("ICE error: {0}")]
    Ice(#[from] IceError),
    #[error("No answer received")]
    SignalingTimeout,
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] devlink_core::Error),
    #[error("Attempt cancelled")]
    Cancelled,
}

#[derive(Default)]
struct AnswerSlot {
    response: Option<PeerConnectionRequest>,
    received: bool,
    waiter: Option<oneshot::Sender<PeerConnectionRequest>>,
}

/// One connection attempt and, once ready, its socket
pub(crate) struct ConnectionInfo {
    pub device: DeviceId,
    pub id: AttemptId,
    pub direction: Direction,
    pub peer: Arc<DeviceCertificate>,
    /// Channel whose connect call started the attempt
    pub name: Option<String>,
    pub cancel: CancellationToken,
    state: Mutex<AttemptState>,
    answer: Mutex<AnswerSlot>,
    socket: Mutex<Option<Arc<MultiplexedSocket>>>,
    cb_ids: Mutex<HashSet<CallbackId>>,
    started_at: Instant,
}

impl ConnectionInfo {
    pub fn new(
        peer: Arc<DeviceCertificate>,
        id: AttemptId,
        direction: Direction,
        name: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device: peer.device_id(),
            id,
            direction,
            peer,
            name,
            cancel: CancellationToken::new(),
            state: Mutex::new(AttemptState::Idle),
            answer: Mutex::new(AnswerSlot::default()),
            socket: Mutex::new(None),
            cb_ids: Mutex::new(HashSet::new()),
            started_at: Instant::now(),
        })
    }

    pub fn key(&self) -> CallbackId {
        (self.device, self.id)
    }

    pub fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    /// Move to `next` if it is ahead of the current state
    pub fn advance(&self, next: AttemptState) -> bool {
        let mut state = self.state.lock();
        if *state == AttemptState::Shutdown || next <= *state {
            return false;
        }
        *state = next;
        true
    }

    /// Still negotiating
    pub fn is_in_flight(&self) -> bool {
        self.state() < AttemptState::Ready
    }

    /// Live socket, if the attempt completed
    pub fn socket(&self) -> Option<Arc<MultiplexedSocket>> {
        self.socket
            .lock()
            .as_ref()
            .filter(|socket| !socket.is_shutdown())
            .cloned()
    }

    /// Attach the socket and become ready; refused once shut down
    pub fn set_socket(&self, socket: Arc<MultiplexedSocket>) -> bool {
        let mut state = self.state.lock();
        if *state == AttemptState::Shutdown {
            return false;
        }
        *self.socket.lock() = Some(socket);
        *state = AttemptState::Ready;
        true
    }

    pub fn add_cb_id(&self, id: CallbackId) {
        self.cb_ids.lock().insert(id);
    }

    pub fn take_cb_ids(&self) -> HashSet<CallbackId> {
        std::mem::take(&mut *self.cb_ids.lock())
    }

    /// Receiver for the signaling answer; resolves at once if it already came
    pub fn arm_answer(&self) -> oneshot::Receiver<PeerConnectionRequest> {
        let (tx, rx) = oneshot::channel();
        let mut answer = self.answer.lock();
        match answer.response.clone() {
            Some(response) => {
                let _ = tx.send(response);
            }
            None => answer.waiter = Some(tx),
        }
        rx
    }

    /// Record the answer; false if one was already received
    pub fn deliver_answer(&self, response: PeerConnectionRequest) -> bool {
        let mut answer = self.answer.lock();
        if answer.received {
            return false;
        }
        answer.received = true;
        answer.response = Some(response.clone());
        if let Some(waiter) = answer.waiter.take() {
            let _ = waiter.send(response);
        }
        true
    }

    pub fn age(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Stop everything the attempt owns. Safe to call more than once.
    pub fn teardown(&self) {
        *self.state.lock() = AttemptState::Shutdown;
        self.cancel.cancel();
        let socket = self.socket.lock().take();
        if let Some(socket) = socket {
            socket.shutdown();
        }
    }
}

async fn cancellable<T, E>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, AttemptError>
where
    E: Into<AttemptError>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(AttemptError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

/// Everything an attempt task needs, detached from the manager
#[derive(Clone)]
pub(crate) struct Negotiation {
    pub backends: Backends,
    pub config: ConnectionManagerConfig,
    pub local_device: DeviceId,
}

impl Negotiation {
    async fn publish(&self, to: &DeviceId, request: &PeerConnectionRequest) -> Result<(), AttemptError> {
        let value = SignalingValue {
            from: self.local_device,
            data: wire_bytes(request)?,
        };
        match self.backends.signaling.put(derive_signaling_key(to), value).await {
            Ok(()) => debug!(
                "Sent {} {} to {}",
                if request.is_answer { "answer" } else { "request" },
                request.id,
                to
            ),
            // The deadline still covers a lost put
            Err(e) => warn!("Unable to publish {} to {}: {}", request.id, to, e),
        }
        Ok(())
    }

    /// Initiator side, up to a secured endpoint
    pub async fn outgoing(
        &self,
        info: &ConnectionInfo,
        conn_type: &str,
    ) -> Result<TlsEndpoint, AttemptError> {
        info.advance(AttemptState::NatInit);
        let mut ice = self
            .backends
            .ice
            .create(IceConfig::new(IceRole::Controlled, info.cancel.child_token()))?;
        if let Err(e) = self.negotiate_outgoing(info, ice.as_mut(), conn_type).await {
            ice.cancel_operations();
            return Err(e);
        }
        self.secure(info, ice, TlsRole::Client).await
    }

    async fn negotiate_outgoing(
        &self,
        info: &ConnectionInfo,
        ice: &mut dyn IceSession,
        conn_type: &str,
    ) -> Result<(), AttemptError> {
        cancellable(&info.cancel, ice.wait_for_init()).await?;

        let answer = info.arm_answer();
        let request = PeerConnectionRequest::request(info.id, ice.local_message().encode(), conn_type);
        self.publish(&info.device, &request).await?;

        let response = tokio::select! {
            _ = info.cancel.cancelled() => return Err(AttemptError::Cancelled),
            response = tokio::time::timeout(self.config.answer_timeout, answer) => match response {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => return Err(AttemptError::Cancelled),
                Err(_) => return Err(AttemptError::SignalingTimeout),
            },
        };

        info.advance(AttemptState::NatNegotiating);
        let remote = IceMessage::parse(&response.ice_msg)?;
        cancellable(&info.cancel, ice.start(remote)).await
    }

    /// Acceptor side, up to a secured endpoint
    pub async fn incoming(
        &self,
        info: &ConnectionInfo,
        request: PeerConnectionRequest,
    ) -> Result<TlsEndpoint, AttemptError> {
        info.advance(AttemptState::NatInit);
        let mut ice = self
            .backends
            .ice
            .create(IceConfig::new(IceRole::Controlling, info.cancel.child_token()))?;
        if let Err(e) = self.negotiate_incoming(info, ice.as_mut(), &request).await {
            ice.cancel_operations();
            return Err(e);
        }
        self.secure(info, ice, TlsRole::Server).await
    }

    async fn negotiate_incoming(
        &self,
        info: &ConnectionInfo,
        ice: &mut dyn IceSession,
        request: &PeerConnectionRequest,
    ) -> Result<(), AttemptError> {
        cancellable(&info.cancel, ice.wait_for_init()).await?;
        let remote = IceMessage::parse(&request.ice_msg)?;

        let answer = PeerConnectionRequest::answer(request.id, ice.local_message().encode());
        self.publish(&info.device, &answer).await?;

        info.advance(AttemptState::NatNegotiating);
        cancellable(&info.cancel, ice.start(remote)).await
    }

    async fn secure(
        &self,
        info: &ConnectionInfo,
        ice: Box<dyn IceSession>,
        role: TlsRole,
    ) -> Result<TlsEndpoint, AttemptError> {
        info.advance(AttemptState::TlsHandshake);
        cancellable(
            &info.cancel,
            self.backends.tls.handshake(ice, role, info.peer.clone()),
        )
        .await
    }
}
