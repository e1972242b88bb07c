//! Connection manager
//!
//! Keeps at most one ready multiplexed socket per peer device (unless a
//! caller forces a new one), deduplicates concurrent connect requests and
//! resolves every request exactly once, with a channel or with a failure.
//!
//! Callbacks registered by users are never invoked while a manager lock is
//! held.

use crate::attempt::{
    AttemptError, AttemptState, ConnectionInfo, Direction, Negotiation, ATTEMPT_ID_MAX,
};
use crate::channel::ChannelSocket;
use crate::config::ConnectionManagerConfig;
use crate::multiplexed::MultiplexedSocket;
use crate::peer::{found_peer_device, CertificateProvider};
use crate::pending::{fail_all, CallbackId, ConnectCallback, PendingCallbacks, PendingCb};
use crate::signaling::{SignalingError, SignalingService, SignalingValue, TreatedMessageStore};
use crate::transport::{IceSessionFactory, TlsEndpoint, TlsHandshaker};
use devlink_core::canonical::from_wire_bytes;
use devlink_core::crypto::derive_signaling_key;
use devlink_core::{
    AttemptId, ChannelRequest, DeviceCertificate, DeviceId, PeerConnectionRequest, PeerIdentity,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A channel became ready, or an incoming attempt failed (`None`, empty name)
pub type ConnectionReadyCallback =
    Arc<dyn Fn(&DeviceId, &str, Option<Arc<ChannelSocket>>) + Send + Sync>;
/// Admission decision for an incoming channel
pub type ChannelRequestPredicate = Arc<dyn Fn(&Arc<DeviceCertificate>, &str) -> bool + Send + Sync>;
/// Admission decision for an incoming connection request
pub type IceRequestPredicate = Arc<dyn Fn(&DeviceId) -> bool + Send + Sync>;

/// External collaborators of the manager
#[derive(Clone)]
pub struct Backends {
    pub signaling: Arc<dyn SignalingService>,
    pub ice: Arc<dyn IceSessionFactory>,
    pub tls: Arc<dyn TlsHandshaker>,
    pub certificates: Arc<dyn CertificateProvider>,
    pub treated: Arc<dyn TreatedMessageStore>,
}

/// Per-request connection options
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Only use an existing socket
    pub no_new_socket: bool,
    /// Always negotiate a new socket
    pub force_new_socket: bool,
    /// Free-form connection type forwarded in the signaling request
    pub conn_type: String,
}

/// Errors of [`ConnectionManager::connect`]
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Unable to open a channel to {0}")]
    Failed(DeviceId),
    #[error("Connection request dropped")]
    Dropped,
}

#[derive(Default)]
struct ManagerCallbacks {
    channel_request: Option<ChannelRequestPredicate>,
    connection_ready: Option<ConnectionReadyCallback>,
    ice_request: Option<IceRequestPredicate>,
}

/// What `connect_with_certificate` decided under the table lock
enum Plan {
    UseSocket(Arc<MultiplexedSocket>),
    Wait,
    Fail,
    Start(Arc<ConnectionInfo>),
}

struct Inner {
    local_device: DeviceId,
    config: ConnectionManagerConfig,
    backends: Backends,
    infos: Mutex<HashMap<CallbackId, Arc<ConnectionInfo>>>,
    pending: PendingCallbacks,
    callbacks: RwLock<ManagerCallbacks>,
    destroying: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Inner>,
}

/// Opens and tracks sockets to peer devices
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        local: &DeviceCertificate,
        config: ConnectionManagerConfig,
        backends: Backends,
    ) -> Self {
        let local_device = local.device_id();
        let inner = Arc::new_cyclic(|weak_self| Inner {
            local_device,
            config,
            backends,
            infos: Mutex::new(HashMap::new()),
            pending: PendingCallbacks::default(),
            callbacks: RwLock::new(ManagerCallbacks::default()),
            destroying: AtomicBool::new(false),
            listener: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub fn local_device(&self) -> &DeviceId {
        &self.inner.local_device
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.inner.config
    }

    /// Open channel `name` to `device`; `cb` runs exactly once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_device(
        &self,
        device: DeviceId,
        name: impl Into<String>,
        options: ConnectOptions,
        cb: impl FnOnce(Option<Arc<ChannelSocket>>, &DeviceId) + Send + 'static,
    ) {
        let name = name.into();
        let cb: ConnectCallback = Box::new(cb);
        if device == self.inner.local_device {
            warn!("Connection to itself refused ({})", device);
            cb(None, &device);
            return;
        }
        if self.inner.is_destroying() {
            cb(None, &device);
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let certificates = self.inner.backends.certificates.clone();
        tokio::spawn(async move {
            let certificate = certificates.find_certificate(&device).await;
            let Some(inner) = weak.upgrade() else {
                cb(None, &device);
                return;
            };
            match certificate {
                Some(certificate)
                    if certificate.device_id() == device
                        && found_peer_device(&certificate).is_some() =>
                {
                    inner.connect_with_certificate(certificate, name, options, cb)
                }
                _ => {
                    error!("No valid certificate found for device {}", device);
                    cb(None, &device);
                }
            }
        });
    }

    /// Awaitable form of [`ConnectionManager::connect_device`]
    pub async fn connect(
        &self,
        device: DeviceId,
        name: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<Arc<ChannelSocket>, ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.connect_device(device, name, options, move |channel, _| {
            let _ = tx.send(channel);
        });
        match rx.await {
            Ok(Some(channel)) => Ok(channel),
            Ok(None) => Err(ConnectError::Failed(device)),
            Err(_) => Err(ConnectError::Dropped),
        }
    }

    /// Start handling signaling requests addressed to this device
    pub async fn on_dht_connected(&self) -> Result<(), SignalingError> {
        let key = derive_signaling_key(&self.inner.local_device);
        let mut values = self.inner.backends.signaling.listen(key).await?;
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(value) = values.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_signaling_value(value);
            }
        });
        if let Some(previous) = self.inner.listener.lock().replace(task) {
            previous.abort();
        }
        debug!("Listening for connection requests on {}", self.inner.local_device);
        Ok(())
    }

    /// Decide which incoming channels to accept (default: decline)
    pub fn on_incoming_channel_request(
        &self,
        cb: impl Fn(&Arc<DeviceCertificate>, &str) -> bool + Send + Sync + 'static,
    ) {
        self.inner.callbacks.write().channel_request = Some(Arc::new(cb));
    }

    /// Observe every channel that becomes ready and every failed incoming attempt
    pub fn on_connection_ready(
        &self,
        cb: impl Fn(&DeviceId, &str, Option<Arc<ChannelSocket>>) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.write().connection_ready = Some(Arc::new(cb));
    }

    /// Decide which incoming connection requests to negotiate (default: accept)
    pub fn on_incoming_connection_request(
        &self,
        cb: impl Fn(&DeviceId) -> bool + Send + Sync + 'static,
    ) {
        self.inner.callbacks.write().ice_request = Some(Arc::new(cb));
    }

    /// A `connect_device` for (`device`, `name`) is still unresolved
    pub fn is_connecting(&self, device: &DeviceId, name: &str) -> bool {
        self.inner.pending.is_connecting(device, name)
    }

    /// Drop every attempt and socket to the devices of `peer`
    pub fn close_connections_with(&self, peer: &PeerIdentity) {
        self.inner.close_connections_with(peer);
    }

    /// Beacon every ready socket after a network change
    pub fn connectivity_changed(&self) {
        for socket in self.inner.ready_sockets() {
            socket.send_beacon(self.inner.config.beacon_timeout);
        }
    }

    /// Ready sockets
    pub fn active_socket_count(&self) -> usize {
        self.inner.ready_sockets().len()
    }

    /// Attempts and ready sockets
    pub fn attempt_count(&self) -> usize {
        self.inner.infos.lock().len()
    }

    /// Ready sockets to `device`
    pub fn sockets_to(&self, device: &DeviceId) -> Vec<Arc<MultiplexedSocket>> {
        self.inner
            .ready_sockets()
            .into_iter()
            .filter(|socket| socket.device_id() == device)
            .collect()
    }

    /// Log every attempt and socket
    pub fn monitor(&self) {
        self.inner.monitor();
    }

    /// Fail pending requests and close everything. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::SeqCst)
    }

    fn negotiation(&self) -> Negotiation {
        Negotiation {
            backends: self.backends.clone(),
            config: self.config.clone(),
            local_device: self.local_device,
        }
    }

    fn ready_sockets(&self) -> Vec<Arc<MultiplexedSocket>> {
        self.infos
            .lock()
            .values()
            .filter_map(|info| info.socket())
            .collect()
    }

    fn new_attempt_id(
        &self,
        infos: &HashMap<CallbackId, Arc<ConnectionInfo>>,
        device: &DeviceId,
    ) -> Option<AttemptId> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.max_attempt_id_tries {
            let id = rng.gen_range(1..=ATTEMPT_ID_MAX);
            if !infos.contains_key(&(*device, id)) && !self.pending.contains_id(device, id) {
                return Some(id);
            }
        }
        None
    }

    fn connect_with_certificate(
        &self,
        certificate: Arc<DeviceCertificate>,
        name: String,
        options: ConnectOptions,
        cb: ConnectCallback,
    ) {
        let device = certificate.device_id();
        if self.is_destroying() {
            cb(None, &device);
            return;
        }

        let (id, plan) = {
            let mut infos = self.infos.lock();
            let Some(id) = self.new_attempt_id(&infos, &device) else {
                drop(infos);
                error!("Unable to find a free attempt id for {}", device);
                cb(None, &device);
                return;
            };
            self.pending.push(
                device,
                PendingCb {
                    name: name.clone(),
                    cb,
                    id,
                    requested: false,
                },
            );

            let mut same_device = infos
                .values()
                .filter(|info| info.device == device && info.state() != AttemptState::Shutdown);
            let connected = same_device
                .clone()
                .find_map(|info| info.socket().map(|socket| (info.clone(), socket)));
            let in_flight = same_device.find(|info| info.is_in_flight()).cloned();

            let plan = match (connected, in_flight) {
                (Some((info, socket)), _) if !options.force_new_socket => {
                    info.add_cb_id((device, id));
                    self.pending.mark_requested(&device, id);
                    Plan::UseSocket(socket)
                }
                (_, Some(info)) if !options.force_new_socket => {
                    info.add_cb_id((device, id));
                    Plan::Wait
                }
                _ if options.no_new_socket => Plan::Fail,
                _ => {
                    let info = ConnectionInfo::new(
                        certificate,
                        id,
                        Direction::Outgoing,
                        Some(name.clone()),
                    );
                    info.add_cb_id((device, id));
                    infos.insert((device, id), info.clone());
                    Plan::Start(info)
                }
            };
            (id, plan)
        };

        match plan {
            Plan::UseSocket(socket) => {
                debug!("Peer {} already connected, adding channel {}", device, name);
                self.send_channel_requests(&socket, device, vec![(name, id)]);
            }
            Plan::Wait => {
                debug!("Already connecting to {}, channel {} waits for the socket", device, name);
            }
            Plan::Fail => {
                debug!("No socket to {} and no new socket allowed", device);
                fail_all(
                    self.pending
                        .extract(&device, Some(id))
                        .into_iter()
                        .map(|p| (device, p)),
                );
            }
            Plan::Start(info) => {
                debug!("Start attempt {} to {} for channel {}", id, device, name);
                self.spawn_attempt(info, None, options.conn_type);
            }
        }
    }

    fn spawn_attempt(
        &self,
        info: Arc<ConnectionInfo>,
        request: Option<PeerConnectionRequest>,
        conn_type: String,
    ) {
        let negotiation = self.negotiation();
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let result = match request {
                None => negotiation.outgoing(&info, &conn_type).await,
                Some(request) => negotiation.incoming(&info, request).await,
            };
            let Some(inner) = weak.upgrade() else {
                info.teardown();
                return;
            };
            match result {
                Ok(endpoint) => inner.on_tls_ready(&info, endpoint),
                Err(e) => inner.on_attempt_failed(&info, e),
            }
        });
    }

    fn on_tls_ready(&self, info: &Arc<ConnectionInfo>, endpoint: TlsEndpoint) {
        let device = info.device;
        if info.state() == AttemptState::Shutdown {
            debug!("Attempt {} to {} ended before its handshake", info.id, device);
            return;
        }

        let socket = MultiplexedSocket::new(device, endpoint);
        socket.set_version(self.config.protocol_version);
        self.install_socket_callbacks(&socket, info.key());

        // Under the infos lock a racing connect either sees the socket or
        // leaves its callback unrequested for us, never both
        let requests = {
            let _infos = self.infos.lock();
            if info.set_socket(socket.clone()) {
                let requests = self.pending.take_unrequested(&device);
                for (_, id) in &requests {
                    info.add_cb_id((device, *id));
                }
                Some(requests)
            } else {
                None
            }
        };
        let Some(requests) = requests else {
            socket.shutdown();
            return;
        };
        socket.start();
        info!(
            "Connection to {} is ready - initiated by {} (attempt {}, {:?})",
            device,
            match info.direction {
                Direction::Outgoing => "connect_device",
                Direction::Incoming => "signaling request",
            },
            info.id,
            info.age()
        );

        if !requests.is_empty() {
            self.send_channel_requests(&socket, device, requests);
        }
    }

    fn on_attempt_failed(&self, info: &Arc<ConnectionInfo>, e: AttemptError) {
        let device = info.device;
        match (&e, info.direction) {
            (AttemptError::Cancelled, _) => {
                debug!("Attempt {} to {} cancelled", info.id, device)
            }
            (_, Direction::Outgoing) => error!(
                "Connection attempt {} to {} failed - initiated by connect_device (channel: {}): {}",
                info.id,
                device,
                info.name.as_deref().unwrap_or(""),
                e
            ),
            (_, Direction::Incoming) => error!(
                "Connection attempt {} from {} failed - initiated by signaling request: {}",
                info.id, device, e
            ),
        }

        let (removed, orphaned) = {
            let mut infos = self.infos.lock();
            let removed = match infos.get(&info.key()) {
                Some(current) if Arc::ptr_eq(current, info) => infos.remove(&info.key()),
                _ => None,
            };
            let orphaned = if removed.is_some() && !infos.keys().any(|(d, _)| *d == device) {
                self.pending.extract(&device, None)
            } else {
                Vec::new()
            };
            (removed, orphaned)
        };
        info.teardown();
        let Some(removed) = removed else {
            return;
        };

        let mut failed = self.pending.extract_ids(&removed.take_cb_ids(), true);
        failed.extend(orphaned.into_iter().map(|p| (device, p)));
        fail_all(failed);

        if info.direction == Direction::Incoming {
            self.notify_connection_ready(&device, "", None);
        }
    }

    fn on_socket_shutdown(&self, key: CallbackId) {
        let removed = self.infos.lock().remove(&key);
        let Some(info) = removed else {
            return;
        };
        info!("Socket with {} closed (attempt {})", key.0, key.1);
        info.teardown();
        fail_all(self.pending.extract_ids(&info.take_cb_ids(), false));
    }

    fn install_socket_callbacks(&self, socket: &Arc<MultiplexedSocket>, key: CallbackId) {
        let weak = self.weak_self.clone();
        socket.set_on_ready(move |device, channel| {
            if let Some(inner) = weak.upgrade() {
                inner.notify_connection_ready(device, channel.name(), Some(channel.clone()));
            }
        });
        let weak = self.weak_self.clone();
        socket.set_on_request(move |certificate, _, name| {
            weak.upgrade()
                .map(|inner| inner.accept_channel(certificate, name))
                .unwrap_or(false)
        });
        let weak = self.weak_self.clone();
        socket.on_shutdown(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_socket_shutdown(key);
            }
        });
    }

    /// Allocate channels and send their requests in order on one socket
    fn send_channel_requests(
        &self,
        socket: &Arc<MultiplexedSocket>,
        device: DeviceId,
        requests: Vec<(String, AttemptId)>,
    ) {
        let mut channels = Vec::with_capacity(requests.len());
        for (name, id) in requests {
            match socket.add_channel(name.clone()) {
                Ok(channel) => {
                    self.bind_pending(&channel, device, id);
                    channels.push(channel);
                }
                Err(e) => {
                    error!("Unable to open channel {} to {}: {}", name, device, e);
                    fail_all(
                        self.pending
                            .extract(&device, Some(id))
                            .into_iter()
                            .map(|p| (device, p)),
                    );
                }
            }
        }
        if channels.is_empty() {
            return;
        }

        let socket = socket.clone();
        tokio::spawn(async move {
            for channel in channels {
                let request = ChannelRequest::request(channel.name(), channel.channel());
                debug!("Send channel request {} ({}) to {}", channel.name(), channel.channel(), device);
                if let Err(e) = socket.write_control(&request).await {
                    error!("Channel request {} to {} failed: {}", channel.name(), device, e);
                    channel.stop();
                }
            }
        });
    }

    /// Resolve the pending callback `id` when `channel` is answered or stops
    fn bind_pending(&self, channel: &Arc<ChannelSocket>, device: DeviceId, id: AttemptId) {
        let weak = self.weak_self.clone();
        channel.on_shutdown(move || {
            if let Some(inner) = weak.upgrade() {
                fail_all(
                    inner
                        .pending
                        .extract(&device, Some(id))
                        .into_iter()
                        .map(|p| (device, p)),
                );
            }
        });

        let weak = self.weak_self.clone();
        let ready_channel = Arc::downgrade(channel);
        channel.on_ready(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let channel = ready_channel.upgrade();
            for pending in inner.pending.extract(&device, Some(id)) {
                (pending.cb)(channel.clone(), &device);
            }
        });
    }

    fn accept_channel(&self, certificate: &Arc<DeviceCertificate>, name: &str) -> bool {
        let predicate = self.callbacks.read().channel_request.clone();
        predicate.map(|cb| cb(certificate, name)).unwrap_or(false)
    }

    fn notify_connection_ready(&self, device: &DeviceId, name: &str, channel: Option<Arc<ChannelSocket>>) {
        let cb = self.callbacks.read().connection_ready.clone();
        if let Some(cb) = cb {
            cb(device, name, channel);
        }
    }

    fn on_signaling_value(&self, value: SignalingValue) {
        if self.is_destroying() {
            return;
        }
        let request: PeerConnectionRequest = match from_wire_bytes(&value.data) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid signaling value from {}: {}", value.from, e);
                return;
            }
        };
        if self.backends.treated.is_message_treated(&request.message_id()) {
            debug!("Message {} already treated", request.message_id());
            return;
        }

        if request.is_answer {
            debug!("Received request answer from {}", value.from);
            self.on_peer_response(&value.from, request);
            return;
        }

        debug!("Received request {} from {}", request.id, value.from);
        let weak = self.weak_self.clone();
        let certificates = self.backends.certificates.clone();
        tokio::spawn(async move {
            let Some(certificate) = certificates.find_certificate(&value.from).await else {
                warn!("No certificate for {}, ignoring its request", value.from);
                return;
            };
            if certificate.device_id() != value.from || found_peer_device(&certificate).is_none() {
                warn!("Rejected untrusted connection request from {}", value.from);
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_peer_request(request, certificate);
            }
        });
    }

    fn on_peer_response(&self, from: &DeviceId, response: PeerConnectionRequest) {
        let info = self.infos.lock().get(&(*from, response.id)).cloned();
        match info {
            Some(info) => {
                if !info.deliver_answer(response) {
                    debug!("Duplicate answer for attempt {} from {}", info.id, from);
                }
            }
            None => warn!(
                "Answer received for unknown attempt {} from {}",
                response.id, from
            ),
        }
    }

    fn on_peer_request(&self, request: PeerConnectionRequest, certificate: Arc<DeviceCertificate>) {
        if self.is_destroying() {
            return;
        }
        let device = certificate.device_id();
        let predicate = self.callbacks.read().ice_request.clone();
        if !predicate.map(|cb| cb(&device)).unwrap_or(true) {
            info!("Refusing connection request {} from {}", request.id, device);
            return;
        }

        let info = {
            let mut infos = self.infos.lock();
            if infos.contains_key(&(device, request.id)) {
                warn!("Duplicate connection request {} from {}", request.id, device);
                return;
            }
            let info = ConnectionInfo::new(certificate, request.id, Direction::Incoming, None);
            infos.insert(info.key(), info.clone());
            info
        };
        debug!("Accepting connection request {} from {}", request.id, device);
        self.spawn_attempt(info, Some(request), String::new());
    }

    fn close_connections_with(&self, peer: &PeerIdentity) {
        let (removed, devices) = {
            let mut infos = self.infos.lock();
            let keys: Vec<CallbackId> = infos
                .iter()
                .filter(|(_, info)| info.peer.issuer_id() == *peer)
                .map(|(key, _)| *key)
                .collect();
            let removed: Vec<_> = keys.iter().filter_map(|key| infos.remove(key)).collect();
            let mut devices: HashSet<DeviceId> = removed.iter().map(|info| info.device).collect();
            for device in self.pending.devices() {
                let owned = self
                    .backends
                    .certificates
                    .get_certificate(&device)
                    .map(|certificate| certificate.issuer_id() == *peer)
                    .unwrap_or(false);
                if owned {
                    devices.insert(device);
                }
            }
            (removed, devices)
        };

        info!(
            "Closing {} connection(s) with {} ({} device(s))",
            removed.len(),
            peer,
            devices.len()
        );
        let failed: Vec<_> = devices
            .iter()
            .flat_map(|device| {
                self.pending
                    .extract(device, None)
                    .into_iter()
                    .map(move |p| (*device, p))
            })
            .collect();
        fail_all(failed);
        for info in removed {
            info.teardown();
        }
    }

    fn monitor(&self) {
        let infos: Vec<_> = self.infos.lock().values().cloned().collect();
        info!("ConnectionManager for {} current status:", self.local_device);
        for info in infos {
            match info.socket() {
                Some(socket) => socket.monitor(),
                None => info!(
                    "- Attempt {} with {} in state {:?} for {:?}",
                    info.id,
                    info.device,
                    info.state(),
                    info.age()
                ),
            }
        }
        info!("ConnectionManager for {} end status.", self.local_device);
    }

    fn shutdown(&self) {
        if self.destroying.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        let infos: Vec<_> = self.infos.lock().drain().map(|(_, info)| info).collect();
        fail_all(self.pending.drain());
        for info in infos {
            info.teardown();
        }
    }
}
