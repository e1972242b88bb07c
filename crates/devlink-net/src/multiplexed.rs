//! Channel multiplexing over one encrypted endpoint
//!
//! A [`MultiplexedSocket`] owns a [`TlsEndpoint`] and carries many
//! [`ChannelSocket`]s over it. Channel 0 carries channel requests and their
//! answers, channel 0xFFFF carries beacons and version announcements, every
//! other id is a data channel. A zero-length frame on a data channel is the
//! peer's end of stream.
//!
//! One read task decodes frames and delivers data inline. Control packets
//! are handed to a worker task so admission callbacks never stall delivery.

use crate::channel::{ChannelSocket, ChannelState};
use crate::config::{MIN_BEACON_VERSION, MULTIPLEXED_SOCKET_VERSION};
use crate::framing::{Frame, FrameCodec, FrameError, MAX_FRAME_PAYLOAD};
use crate::transport::{EndpointInfo, SecureRead, SecureWrite, TlsEndpoint};
use bytes::BytesMut;
use devlink_core::canonical::{from_wire_bytes, wire_bytes};
use devlink_core::{
    is_data_channel, BeaconMsg, ChannelRequest, ChannelRequestState, DeviceCertificate, DeviceId,
    ProtocolMsg, VersionMsg, CONTROL_CHANNEL, PROTOCOL_CHANNEL,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// A channel became usable (accepted by us or by the peer)
pub type ChannelReadyCallback = Arc<dyn Fn(&DeviceId, &Arc<ChannelSocket>) + Send + Sync>;
/// Admission decision for an incoming channel request
pub type ChannelRequestCallback =
    Arc<dyn Fn(&Arc<DeviceCertificate>, u16, &str) -> bool + Send + Sync>;
pub type SocketShutdownCallback = Box<dyn FnOnce() + Send>;
/// Observes beacons; `true` for a request, `false` for a response
pub type BeaconCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type VersionCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Socket errors
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket is shut down")]
    Shutdown,
    #[error("Message too large: {0} bytes (max {MAX_FRAME_PAYLOAD})")]
    MessageTooLarge(usize),
    #[error("No free channel id")]
    NoChannelAvailable,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] devlink_core::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct Callbacks {
    on_ready: Option<ChannelReadyCallback>,
    on_request: Option<ChannelRequestCallback>,
    on_shutdown: Option<SocketShutdownCallback>,
    on_beacon: Option<BeaconCallback>,
    on_version: Option<VersionCallback>,
}

struct Beacon {
    /// Beacons sent and not yet answered
    outstanding: AtomicI32,
    can_send: AtomicBool,
    answer: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Many logical channels over one encrypted endpoint
pub struct MultiplexedSocket {
    device_id: DeviceId,
    info: EndpointInfo,
    reader: Mutex<Option<Box<dyn SecureRead>>>,
    /// Single write lock: frames from concurrent writers never interleave
    writer: tokio::sync::Mutex<Option<Box<dyn SecureWrite>>>,
    channels: Mutex<HashMap<u16, Arc<ChannelSocket>>>,
    callbacks: Mutex<Callbacks>,
    is_shutdown: AtomicBool,
    stop: CancellationToken,
    beacon: Beacon,
    local_version: AtomicI32,
    peer_version: AtomicI32,
    started_at: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl MultiplexedSocket {
    /// Wrap `endpoint`. Nothing is read until [`MultiplexedSocket::start`].
    pub fn new(device_id: DeviceId, endpoint: TlsEndpoint) -> Arc<Self> {
        let (reader, writer, info) = endpoint.into_parts();
        Arc::new_cyclic(|weak_self| Self {
            device_id,
            info,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            channels: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Callbacks::default()),
            is_shutdown: AtomicBool::new(false),
            stop: CancellationToken::new(),
            beacon: Beacon {
                outstanding: AtomicI32::new(0),
                can_send: AtomicBool::new(false),
                answer: AtomicBool::new(true),
                timer: Mutex::new(None),
            },
            local_version: AtomicI32::new(MULTIPLEXED_SOCKET_VERSION),
            peer_version: AtomicI32::new(0),
            started_at: Instant::now(),
            tasks: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Spawn the read and control tasks and announce our version.
    ///
    /// Callbacks should be installed before calling this.
    pub fn start(&self) {
        let Some(reader) = self.reader.lock().take() else {
            return;
        };
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let read = tokio::spawn(read_loop(
            self.weak_self.clone(),
            reader,
            control_tx,
            self.stop.clone(),
        ));
        let control = tokio::spawn(control_loop(
            self.weak_self.clone(),
            control_rx,
            self.stop.clone(),
        ));
        self.tasks.lock().extend([read, control]);

        let version = self.local_version.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let msg = ProtocolMsg::Version(VersionMsg { v: version });
            if let Err(e) = this.write_protocol(msg).await {
                debug!("Unable to send version to {}: {}", this.device_id, e);
            }
        });
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn peer_certificate(&self) -> Arc<DeviceCertificate> {
        self.info.peer_certificate.clone()
    }

    pub fn is_initiator(&self) -> bool {
        self.info.is_initiator
    }

    pub fn max_payload(&self) -> usize {
        self.info.max_payload
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.info.remote_addr
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn channel(&self, channel: u16) -> Option<Arc<ChannelSocket>> {
        self.channels.lock().get(&channel).cloned()
    }

    pub fn peer_version(&self) -> i32 {
        self.peer_version.load(Ordering::SeqCst)
    }

    pub fn can_send_beacon(&self) -> bool {
        self.beacon.can_send.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Callbacks and hooks
    // =========================================================================

    pub fn set_on_ready(&self, cb: impl Fn(&DeviceId, &Arc<ChannelSocket>) + Send + Sync + 'static) {
        self.callbacks.lock().on_ready = Some(Arc::new(cb));
    }

    pub fn set_on_request(
        &self,
        cb: impl Fn(&Arc<DeviceCertificate>, u16, &str) -> bool + Send + Sync + 'static,
    ) {
        self.callbacks.lock().on_request = Some(Arc::new(cb));
    }

    /// Register the shutdown callback; runs immediately if already shut down
    pub fn on_shutdown(&self, cb: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.callbacks.lock();
        if self.is_shutdown() {
            drop(callbacks);
            cb();
        } else {
            callbacks.on_shutdown = Some(Box::new(cb));
        }
    }

    pub fn set_on_beacon(&self, cb: impl Fn(bool) + Send + Sync + 'static) {
        self.callbacks.lock().on_beacon = Some(Arc::new(cb));
    }

    pub fn set_on_version(&self, cb: impl Fn(i32) + Send + Sync + 'static) {
        self.callbacks.lock().on_version = Some(Arc::new(cb));
    }

    /// Whether beacon requests from the peer get a response
    pub fn set_answer_beacon(&self, answer: bool) {
        self.beacon.answer.store(answer, Ordering::SeqCst);
    }

    /// Version announced by `start`
    pub fn set_version(&self, version: i32) {
        self.local_version.store(version, Ordering::SeqCst);
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Allocate a data channel for an outgoing request.
    ///
    /// Ids are scanned linearly from a random offset, skipping reserved and
    /// used ids.
    pub fn add_channel(&self, name: impl Into<String>) -> Result<Arc<ChannelSocket>, SocketError> {
        if self.is_shutdown() {
            return Err(SocketError::Shutdown);
        }
        let name = name.into();
        let modulus = u32::from(u16::MAX);
        let offset = u32::from(rand::random::<u16>());
        let mut channels = self.channels.lock();
        for i in 0..modulus {
            let channel = ((offset + i) % modulus) as u16;
            if !is_data_channel(channel) || channels.contains_key(&channel) {
                continue;
            }
            let socket = Arc::new(ChannelSocket::new(
                self.weak_self.clone(),
                self.device_id,
                name,
                channel,
                true,
                ChannelState::Pending,
            ));
            channels.insert(channel, socket.clone());
            return Ok(socket);
        }
        Err(SocketError::NoChannelAvailable)
    }

    /// Remove a stopped channel once it no longer awaits an answer
    pub(crate) fn on_channel_stopped(&self, stopped: &ChannelSocket) {
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get(&stopped.channel()).cloned() else {
            return;
        };
        if !std::ptr::eq(Arc::as_ptr(&entry), stopped) {
            return;
        }
        match entry.state() {
            ChannelState::Pending => entry.set_state(ChannelState::ShutdownPendingRemoval),
            ChannelState::Answered => {
                channels.remove(&stopped.channel());
                entry.set_state(ChannelState::Removed);
            }
            ChannelState::ShutdownPendingRemoval | ChannelState::Removed => {}
        }
    }

    /// Send a channel request or answer on the control channel
    pub async fn write_control(&self, request: &ChannelRequest) -> Result<(), SocketError> {
        let bytes = wire_bytes(request)?;
        self.write(CONTROL_CHANNEL, &bytes).await.map(|_| ())
    }

    async fn write_protocol(&self, msg: ProtocolMsg) -> Result<(), SocketError> {
        let bytes = wire_bytes(&msg)?;
        self.write(PROTOCOL_CHANNEL, &bytes).await.map(|_| ())
    }

    fn spawn_protocol_write(&self, msg: ProtocolMsg) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.write_protocol(msg).await {
                debug!("Unable to send protocol message to {}: {}", this.device_id, e);
            }
        });
    }

    /// Write one frame. An empty `data` on a data channel signals end of stream.
    pub async fn write(&self, channel: u16, data: &[u8]) -> Result<usize, SocketError> {
        if self.is_shutdown() {
            return Err(SocketError::Shutdown);
        }
        if data.len() > MAX_FRAME_PAYLOAD {
            return Err(SocketError::MessageTooLarge(data.len()));
        }
        let mut encoded = BytesMut::new();
        FrameCodec::new().encode(Frame::new(channel, data.to_vec()), &mut encoded)?;

        let result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.write_all(&encoded).await,
                None => return Err(SocketError::Shutdown),
            }
        };
        if let Err(e) = result {
            error!("Error when writing on socket with {}: {}", self.device_id, e);
            self.shutdown();
            return Err(e.into());
        }
        Ok(data.len())
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Ask the peer for a response and shut down if none arrives in `timeout`.
    ///
    /// Does nothing for peers that never announced beacon support.
    pub fn send_beacon(&self, timeout: Duration) {
        if !self.can_send_beacon() || self.is_shutdown() {
            return;
        }
        self.beacon.outstanding.fetch_add(1, Ordering::SeqCst);
        debug!("Send beacon to peer {}", self.device_id);
        self.spawn_protocol_write(ProtocolMsg::Beacon(BeaconMsg { p: true }));

        let weak = self.weak_self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(socket) = weak.upgrade() else {
                return;
            };
            if socket.beacon.outstanding.load(Ordering::SeqCst) != 0 {
                warn!(
                    "Beacon doesn't get any response. Stopping socket with {}",
                    socket.device_id
                );
                socket.shutdown();
            }
        });
        *self.beacon.timer.lock() = Some(timer);
    }

    fn handle_beacon(&self, request: bool) {
        if request {
            if self.beacon.answer.load(Ordering::SeqCst) {
                debug!("Send beacon response to {}", self.device_id);
                self.spawn_protocol_write(ProtocolMsg::Beacon(BeaconMsg { p: false }));
            }
        } else {
            let _ = self
                .beacon
                .outstanding
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n - 1));
        }
        let on_beacon = self.callbacks.lock().on_beacon.clone();
        if let Some(cb) = on_beacon {
            cb(request);
        }
    }

    fn handle_version(&self, version: i32) {
        debug!("Peer {} uses protocol version {}", self.device_id, version);
        self.peer_version.store(version, Ordering::SeqCst);
        self.beacon
            .can_send
            .store(version >= MIN_BEACON_VERSION, Ordering::SeqCst);
        let on_version = self.callbacks.lock().on_version.clone();
        if let Some(cb) = on_version {
            cb(version);
        }
    }

    // =========================================================================
    // Incoming frames
    // =========================================================================

    fn dispatch(&self, frame: Frame, control: &mpsc::UnboundedSender<Vec<u8>>) {
        match frame.channel {
            CONTROL_CHANNEL => {
                if control.send(frame.payload).is_err() {
                    debug!("Control worker for {} is gone", self.device_id);
                }
            }
            PROTOCOL_CHANNEL => self.handle_protocol_packet(&frame.payload),
            channel => self.handle_channel_packet(channel, frame.payload),
        }
    }

    fn handle_protocol_packet(&self, payload: &[u8]) {
        match from_wire_bytes::<ProtocolMsg>(payload) {
            Ok(ProtocolMsg::Beacon(BeaconMsg { p })) => self.handle_beacon(p),
            Ok(ProtocolMsg::Version(VersionMsg { v })) => self.handle_version(v),
            Err(e) => warn!("Invalid protocol message from {}: {}", self.device_id, e),
        }
    }

    fn handle_channel_packet(&self, channel: u16, payload: Vec<u8>) {
        let socket = self.channels.lock().get(&channel).cloned();
        match socket {
            Some(socket) if payload.is_empty() => socket.stop(),
            Some(socket) => socket.on_recv(payload),
            None if !payload.is_empty() => {
                warn!("Non existing channel {} from {}", channel, self.device_id)
            }
            None => {}
        }
    }

    async fn handle_control_packet(&self, pkt: &[u8]) {
        let request: ChannelRequest = match from_wire_bytes(pkt) {
            Ok(request) => request,
            Err(e) => {
                warn!("Error on the control channel with {}: {}", self.device_id, e);
                return;
            }
        };
        match request.state {
            ChannelRequestState::Accept => self.on_accept(&request),
            ChannelRequestState::Decline => self.on_decline(&request),
            ChannelRequestState::Request => self.on_request(request).await,
        }
    }

    fn notify_ready(&self, channel: &Arc<ChannelSocket>) {
        let on_ready = self.callbacks.lock().on_ready.clone();
        if let Some(cb) = on_ready {
            cb(&self.device_id, channel);
        }
        channel.ready();
    }

    fn on_accept(&self, request: &ChannelRequest) {
        let channel = {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get(&request.channel).cloned() else {
                warn!(
                    "Receiving an answer for a non existing channel {} from {}",
                    request.channel, self.device_id
                );
                return;
            };
            match channel.state() {
                ChannelState::Pending => channel.set_state(ChannelState::Answered),
                ChannelState::ShutdownPendingRemoval => {
                    channels.remove(&request.channel);
                    channel.set_state(ChannelState::Removed);
                }
                state => {
                    warn!(
                        "Unexpected answer for channel {} in state {:?}",
                        request.channel, state
                    );
                    return;
                }
            }
            channel
        };
        debug!("Channel {} ({}) accepted by {}", channel.channel(), channel.name(), self.device_id);
        self.notify_ready(&channel);
    }

    fn on_decline(&self, request: &ChannelRequest) {
        let channel = self.channels.lock().remove(&request.channel);
        if let Some(channel) = channel {
            debug!("Channel {} ({}) declined by {}", channel.channel(), channel.name(), self.device_id);
            channel.set_state(ChannelState::Removed);
            channel.stop();
        }
    }

    async fn on_request(&self, request: ChannelRequest) {
        let accepted = if is_data_channel(request.channel) {
            let on_request = self.callbacks.lock().on_request.clone();
            on_request
                .map(|cb| cb(&self.info.peer_certificate, request.channel, &request.name))
                .unwrap_or(false)
        } else {
            warn!("Channel request on reserved id {} from {}", request.channel, self.device_id);
            false
        };

        let mut created = None;
        if accepted {
            let channel = Arc::new(ChannelSocket::new(
                self.weak_self.clone(),
                self.device_id,
                request.name.clone(),
                request.channel,
                false,
                ChannelState::Answered,
            ));
            let previous = self.channels.lock().insert(request.channel, channel.clone());
            if let Some(previous) = previous {
                warn!(
                    "A channel is already present on id {}, closing the previous one",
                    request.channel
                );
                previous.set_state(ChannelState::Removed);
                previous.stop();
            }
            created = Some(channel);
        }

        if let Err(e) = self.write_control(&request.reply(accepted)).await {
            error!("Unable to answer channel request from {}: {}", self.device_id, e);
            self.shutdown();
            return;
        }
        if let Some(channel) = created {
            self.notify_ready(&channel);
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tear down the socket and every channel on it. Idempotent.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down socket with {}", self.device_id);
        self.stop.cancel();
        if let Some(timer) = self.beacon.timer.lock().take() {
            timer.abort();
        }

        let on_shutdown = self.callbacks.lock().on_shutdown.take();
        if let Some(cb) = on_shutdown {
            cb();
        }

        let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.set_state(ChannelState::Removed);
            channel.stop();
        }

        if let (Some(this), Ok(handle)) = (
            self.weak_self.upgrade(),
            tokio::runtime::Handle::try_current(),
        ) {
            handle.spawn(async move { this.close_writer().await });
        }
    }

    async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Error closing transport with {}: {}", self.device_id, e);
            }
        }
    }

    /// Shut down and wait for the background tasks to finish.
    ///
    /// Must not be awaited from a socket callback.
    pub async fn join(&self) {
        self.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Log the socket and its channels
    pub fn monitor(&self) {
        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        info!(
            "- Socket with device {} (peer {}) up for {:?}, {} channel(s)",
            self.device_id,
            self.info.peer_certificate.issuer_id(),
            self.started_at.elapsed(),
            channels.len()
        );
        for channel in channels {
            info!(
                "\t- Channel {} (name: {}, initiator: {}, state: {:?})",
                channel.channel(),
                channel.name(),
                channel.is_initiator(),
                channel.state()
            );
        }
    }
}

impl Drop for MultiplexedSocket {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn read_loop(
    weak: Weak<MultiplexedSocket>,
    mut reader: Box<dyn SecureRead>,
    control: mpsc::UnboundedSender<Vec<u8>>,
    stop: CancellationToken,
) {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let read = tokio::select! {
            _ = stop.cancelled() => return,
            read = reader.read_buf(&mut buf) => read,
        };
        let Some(socket) = weak.upgrade() else {
            return;
        };
        match read {
            Ok(0) => {
                debug!("Transport closed by {}", socket.device_id);
                socket.shutdown();
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Read error detected with {}: {}", socket.device_id, e);
                socket.shutdown();
                return;
            }
        }
        loop {
            if socket.is_shutdown() {
                return;
            }
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => socket.dispatch(frame, &control),
                Ok(None) => break,
                Err(e) => {
                    error!("Framing error with {}: {}", socket.device_id, e);
                    socket.shutdown();
                    return;
                }
            }
        }
    }
}

async fn control_loop(
    weak: Weak<MultiplexedSocket>,
    mut packets: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: CancellationToken,
) {
    loop {
        let pkt = tokio::select! {
            _ = stop.cancelled() => return,
            pkt = packets.recv() => match pkt {
                Some(pkt) => pkt,
                None => return,
            },
        };
        let Some(socket) = weak.upgrade() else {
            return;
        };
        socket.handle_control_packet(&pkt).await;
    }
}
