//! devlinkd server - main service loop

use crate::config::Config;
use crate::storage::Storage;
use devlink_core::{DeviceId, KeyPair};
use devlink_net::mock::{LoopbackDht, LoopbackHandshaker, LoopbackIceNetwork, LoopbackIdentity};
use devlink_net::{
    Backends, CertificateStore, ChannelError, ChannelSocket, ConnectError, ConnectOptions,
    ConnectionManager, ConnectionManagerConfig, MemoryTreatedMessages, SignalingError,
    TreatedMessageStore,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Channel name used by the loopback self-test
pub const SELFTEST_CHANNEL: &str = "selftest";

const SELFTEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Self-test failed: {0}")]
    SelfTest(String),
}

/// In-process backends shared by the local device and the loopback peer
struct LoopbackNetwork {
    dht: Arc<LoopbackDht>,
    ice: Arc<LoopbackIceNetwork>,
    certificates: Arc<CertificateStore>,
}

impl LoopbackNetwork {
    fn backends(
        &self,
        identity: &LoopbackIdentity,
        treated: Arc<dyn TreatedMessageStore>,
    ) -> Backends {
        self.certificates
            .pin_certificate((*identity.certificate).clone());
        Backends {
            signaling: self.dht.clone(),
            ice: self.ice.clone(),
            tls: Arc::new(LoopbackHandshaker::new(identity)),
            certificates: self.certificates.clone(),
            treated,
        }
    }
}

/// Second device answering the self-test
struct LoopbackPeer {
    device: DeviceId,
    manager: ConnectionManager,
}

/// Server state
pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    identity: LoopbackIdentity,
    network: LoopbackNetwork,
    manager: ConnectionManager,
    peer: Mutex<Option<Arc<LoopbackPeer>>>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let state = storage.load_or_create_node_state()?;
        let identity = LoopbackIdentity::from_keys(
            KeyPair::from_seed(&state.account_seed),
            KeyPair::from_seed(&state.device_seed),
        );

        let network = LoopbackNetwork {
            dht: LoopbackDht::new(),
            ice: LoopbackIceNetwork::new(),
            certificates: Arc::new(CertificateStore::new()),
        };
        let manager = ConnectionManager::new(
            &identity.certificate,
            config.manager_config(),
            network.backends(&identity, storage.clone()),
        );
        manager.on_incoming_channel_request(|_, name| name == SELFTEST_CHANNEL);
        manager.on_connection_ready(|device, name, channel| match channel {
            Some(channel) => debug!("Channel {} ({}) ready with {}", name, channel.channel(), device),
            None => warn!("Incoming connection from {} failed", device),
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            storage,
            identity,
            network,
            manager,
            peer: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// Our device id
    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Run the server until [`Server::shutdown`] is called
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(
            "Starting devlinkd for device {} (account {})",
            self.identity.device_id(),
            self.identity.peer_identity()
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.manager.on_dht_connected().await?;
        self.run_selftest().await?;

        let monitor_secs = self.config.monitor_interval_secs;
        let mut ticker = interval(Duration::from_secs(monitor_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick(), if monitor_secs > 0 => self.manager.monitor(),
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        self.manager.shutdown();
        if let Some(peer) = self.peer.lock().take() {
            peer.manager.shutdown();
        }
        self.storage.flush()?;
        Ok(())
    }

    /// Open a channel to an in-process peer device and echo random bytes
    pub async fn run_selftest(&self) -> Result<(), ServerError> {
        let peer = self.loopback_peer().await?;
        let channel = self
            .manager
            .connect(peer.device, SELFTEST_CHANNEL, ConnectOptions::default())
            .await?;
        info!(
            "Self-test channel {} open with {}",
            channel.channel(),
            peer.device
        );

        let payload: Vec<u8> = (0..self.config.selftest_bytes)
            .map(|_| rand::random::<u8>())
            .collect();
        channel.write(&payload).await?;

        let mut echoed = Vec::with_capacity(payload.len());
        while echoed.len() < payload.len() {
            echoed.extend(channel.recv(SELFTEST_READ_TIMEOUT).await?);
        }
        if echoed != payload {
            return Err(ServerError::SelfTest(format!(
                "echo mismatch after {} bytes",
                echoed.len()
            )));
        }

        channel.shutdown().await;
        info!("Self-test passed ({} bytes echoed)", payload.len());
        Ok(())
    }

    async fn loopback_peer(&self) -> Result<Arc<LoopbackPeer>, ServerError> {
        if let Some(peer) = self.peer.lock().clone() {
            return Ok(peer);
        }
        let identity = LoopbackIdentity::generate();
        let manager = ConnectionManager::new(
            &identity.certificate,
            ConnectionManagerConfig::default(),
            self.network
                .backends(&identity, Arc::new(MemoryTreatedMessages::new())),
        );
        manager.on_incoming_channel_request(|_, name| name == SELFTEST_CHANNEL);
        manager.on_connection_ready(|_, _, channel| {
            if let Some(channel) = channel {
                spawn_echo(&channel);
            }
        });
        manager.on_dht_connected().await?;

        let peer = Arc::new(LoopbackPeer {
            device: identity.device_id(),
            manager,
        });
        debug!("Loopback peer {} online", peer.device);
        *self.peer.lock() = Some(peer.clone());
        Ok(peer)
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_sockets: self.manager.active_socket_count(),
            attempts: self.manager.attempt_count(),
            treated_messages: self.storage.treated_count(),
        }
    }
}

/// Write back everything received on `channel`, in order
fn spawn_echo(channel: &Arc<ChannelSocket>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    channel.set_on_recv(move |data| {
        let _ = tx.send(data.to_vec());
    });
    let weak: Weak<ChannelSocket> = Arc::downgrade(channel);
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            let Some(channel) = weak.upgrade() else {
                break;
            };
            if let Err(e) = channel.write(&data).await {
                debug!("Echo on channel {} stopped: {}", channel.channel(), e);
                break;
            }
        }
    });
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_sockets: usize,
    pub attempts: usize,
    pub treated_messages: usize,
}
