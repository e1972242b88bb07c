//! Connection manager scenarios over loopback signaling, ICE and handshake

use devlink_core::DeviceId;
use devlink_net::mock::{LoopbackDht, LoopbackHandshaker, LoopbackIceNetwork, LoopbackIdentity};
use devlink_net::{
    Backends, CertificateStore, ChannelSocket, ConnectError, ConnectOptions, ConnectionManager,
    ConnectionManagerConfig, MemoryTreatedMessages,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("devlink_net=debug")
        .with_test_writer()
        .try_init();
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Shared signaling, ICE network and certificate directory
struct Net {
    dht: Arc<LoopbackDht>,
    ice: Arc<LoopbackIceNetwork>,
    certificates: Arc<CertificateStore>,
}

impl Net {
    fn new() -> Self {
        init_tracing();
        Self {
            dht: LoopbackDht::new(),
            ice: LoopbackIceNetwork::new(),
            certificates: Arc::new(CertificateStore::new()),
        }
    }

    fn node(&self, identity: &LoopbackIdentity, config: ConnectionManagerConfig) -> ConnectionManager {
        self.certificates
            .pin_certificate((*identity.certificate).clone());
        ConnectionManager::new(
            &identity.certificate,
            config,
            Backends {
                signaling: self.dht.clone(),
                ice: self.ice.clone(),
                tls: Arc::new(LoopbackHandshaker::new(identity)),
                certificates: self.certificates.clone(),
                treated: Arc::new(MemoryTreatedMessages::new()),
            },
        )
    }
}

/// `bob` accepts every channel and reports ready channels on the receiver
async fn listening(
    bob: &ConnectionManager,
) -> mpsc::UnboundedReceiver<(DeviceId, String, Option<Arc<ChannelSocket>>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    bob.on_incoming_channel_request(|_, _| true);
    bob.on_connection_ready(move |device, name, channel| {
        let _ = tx.send((*device, name.to_string(), channel));
    });
    bob.on_dht_connected().await.unwrap();
    rx
}

fn counting_callback(
    calls: &Arc<AtomicUsize>,
    failures: &Arc<AtomicUsize>,
) -> impl FnOnce(Option<Arc<ChannelSocket>>, &DeviceId) + Send + 'static {
    let calls = calls.clone();
    let failures = failures.clone();
    move |channel, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        if channel.is_none() {
            failures.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_connect_and_exchange_data() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let mut ready = listening(&bob).await;

    let channel = timeout(
        WAIT,
        alice.connect(b.device_id(), "git://repo", ConnectOptions::default()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(channel.name(), "git://repo");
    assert!(channel.is_initiator());
    assert_eq!(channel.device_id(), &b.device_id());
    assert_eq!(channel.peer_certificate().unwrap().device_id(), b.device_id());

    let (from, name, remote) = timeout(WAIT, ready.recv()).await.unwrap().unwrap();
    assert_eq!(from, a.device_id());
    assert_eq!(name, "git://repo");
    let remote = remote.unwrap();
    assert_eq!(remote.channel(), channel.channel());

    channel.write(b"ping").await.unwrap();
    assert_eq!(remote.recv(WAIT).await.unwrap(), b"ping");
    remote.write(b"pong").await.unwrap();
    assert_eq!(channel.recv(WAIT).await.unwrap(), b"pong");

    assert_eq!(alice.active_socket_count(), 1);
    assert!(wait_until(|| bob.active_socket_count() == 1).await);
    assert!(!alice.is_connecting(&b.device_id(), "git://repo"));
}

#[tokio::test]
async fn test_concurrent_connects_share_one_socket() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let _ready = listening(&bob).await;

    let (first, second) = tokio::join!(
        alice.connect(b.device_id(), "git", ConnectOptions::default()),
        alice.connect(b.device_id(), "sip", ConnectOptions::default()),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.channel(), second.channel());
    assert!(Arc::ptr_eq(
        &first.underlying_socket().unwrap(),
        &second.underlying_socket().unwrap()
    ));
    assert_eq!(alice.sockets_to(&b.device_id()).len(), 1);
    // One ICE session per side, one request and one answer
    assert_eq!(net.ice.session_count(), 2);
    assert_eq!(net.dht.put_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connects_racing_socket_readiness_request_each_channel_once() {
    const CHANNELS: usize = 24;
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = Arc::new(net.node(&a, ConnectionManagerConfig::default()));
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let mut ready = listening(&bob).await;

    // Connects keep arriving while the first attempt negotiates and its
    // socket becomes ready
    let mut tasks = Vec::new();
    for i in 0..CHANNELS {
        let alice = alice.clone();
        let device = b.device_id();
        tasks.push(tokio::spawn(async move {
            alice
                .connect(device, format!("chan-{i}"), ConnectOptions::default())
                .await
        }));
        if i % 3 == 0 {
            tokio::task::yield_now().await;
        } else {
            sleep(Duration::from_millis(1)).await;
        }
    }
    for task in tasks {
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    let sockets = alice.sockets_to(&b.device_id());
    assert_eq!(sockets.len(), 1);
    assert_eq!(sockets[0].channel_count(), CHANNELS);

    assert!(wait_until(|| bob.sockets_to(&a.device_id()).len() == 1).await);
    let remote = bob.sockets_to(&a.device_id())[0].clone();
    assert!(wait_until(|| remote.channel_count() >= CHANNELS).await);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.channel_count(), CHANNELS);

    let mut names = std::collections::HashSet::new();
    while let Ok((_, name, channel)) = ready.try_recv() {
        assert!(channel.is_some());
        assert!(names.insert(name));
    }
    assert_eq!(names.len(), CHANNELS);
}

#[tokio::test]
async fn test_later_connect_reuses_socket() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let _ready = listening(&bob).await;

    let first = alice
        .connect(b.device_id(), "git", ConnectOptions::default())
        .await
        .unwrap();
    let puts = net.dht.put_count();

    let reused = alice
        .connect(
            b.device_id(),
            "sip",
            ConnectOptions {
                no_new_socket: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(Arc::ptr_eq(
        &first.underlying_socket().unwrap(),
        &reused.underlying_socket().unwrap()
    ));
    assert_eq!(net.dht.put_count(), puts);

    let forced = alice
        .connect(
            b.device_id(),
            "vcs",
            ConnectOptions {
                force_new_socket: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(
        &first.underlying_socket().unwrap(),
        &forced.underlying_socket().unwrap()
    ));
    assert_eq!(alice.sockets_to(&b.device_id()).len(), 2);
}

#[tokio::test]
async fn test_no_new_socket_without_connection_fails() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let _bob = net.node(&b, ConnectionManagerConfig::default());

    let result = alice
        .connect(
            b.device_id(),
            "git",
            ConnectOptions {
                no_new_socket: true,
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(ConnectError::Failed(device)) if device == b.device_id()));
    assert_eq!(net.dht.put_count(), 0);
    assert_eq!(alice.attempt_count(), 0);
}

#[tokio::test]
async fn test_answer_timeout_fails_every_request_once() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let config = ConnectionManagerConfig::default().with_answer_timeout(Duration::from_millis(300));
    let alice = net.node(&a, config);
    // Bob never listens for requests
    let _bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    for name in ["git", "sip", "vcs"] {
        alice.connect_device(
            b.device_id(),
            name,
            ConnectOptions::default(),
            counting_callback(&calls, &failures),
        );
    }

    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 3).await);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(failures.load(Ordering::SeqCst), 3);
    assert_eq!(alice.attempt_count(), 0);
    assert!(!alice.is_connecting(&b.device_id(), "git"));
    // A single request was published
    assert_eq!(net.dht.put_count(), 1);
}

#[tokio::test]
async fn test_ice_failure_fails_both_sides() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let mut ready = listening(&bob).await;
    net.ice.set_fail_negotiation(true);

    let calls = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    alice.connect_device(
        b.device_id(),
        "git",
        ConnectOptions::default(),
        counting_callback(&calls, &failures),
    );
    alice.connect_device(
        b.device_id(),
        "sip",
        ConnectOptions::default(),
        counting_callback(&calls, &failures),
    );

    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2).await);
    assert_eq!(failures.load(Ordering::SeqCst), 2);

    // The acceptor reports its failed attempt without a channel
    let (from, name, channel) = timeout(WAIT, ready.recv()).await.unwrap().unwrap();
    assert_eq!(from, a.device_id());
    assert!(name.is_empty());
    assert!(channel.is_none());

    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(alice.attempt_count(), 0);
    assert!(wait_until(|| bob.attempt_count() == 0).await);
}

#[tokio::test]
async fn test_declined_channel_keeps_socket() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    bob.on_incoming_channel_request(|_, name| name != "forbidden");
    bob.on_dht_connected().await.unwrap();

    let result = timeout(
        WAIT,
        alice.connect(b.device_id(), "forbidden", ConnectOptions::default()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(ConnectError::Failed(_))));
    assert_eq!(alice.active_socket_count(), 1);

    let allowed = alice
        .connect(b.device_id(), "allowed", ConnectOptions::default())
        .await
        .unwrap();
    assert_eq!(allowed.name(), "allowed");
    assert_eq!(alice.active_socket_count(), 1);
}

#[tokio::test]
async fn test_refused_connection_request_times_out() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let config = ConnectionManagerConfig::default().with_answer_timeout(Duration::from_millis(300));
    let alice = net.node(&a, config);
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let refused = Arc::new(AtomicUsize::new(0));
    let counter = refused.clone();
    bob.on_incoming_connection_request(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    });
    let _ready = listening(&bob).await;

    let result = alice
        .connect(b.device_id(), "git", ConnectOptions::default())
        .await;
    assert!(result.is_err());
    assert_eq!(refused.load(Ordering::SeqCst), 1);
    assert_eq!(bob.attempt_count(), 0);
    assert_eq!(net.ice.session_count(), 1);
}

#[tokio::test]
async fn test_connect_to_self_is_refused() {
    let net = Net::new();
    let a = LoopbackIdentity::generate();
    let alice = net.node(&a, ConnectionManagerConfig::default());

    let result = alice
        .connect(a.device_id(), "git", ConnectOptions::default())
        .await;
    assert!(matches!(result, Err(ConnectError::Failed(_))));
    assert_eq!(net.dht.put_count(), 0);
}

#[tokio::test]
async fn test_unknown_device_fails() {
    let net = Net::new();
    let a = LoopbackIdentity::generate();
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let stranger = LoopbackIdentity::generate();

    let result = alice
        .connect(stranger.device_id(), "git", ConnectOptions::default())
        .await;
    assert!(result.is_err());
    assert_eq!(alice.attempt_count(), 0);
}

#[tokio::test]
async fn test_attempt_id_exhaustion_fails_request() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let config = ConnectionManagerConfig {
        max_attempt_id_tries: 0,
        ..Default::default()
    };
    let alice = net.node(&a, config);
    let _bob = net.node(&b, ConnectionManagerConfig::default());

    let result = alice
        .connect(b.device_id(), "git", ConnectOptions::default())
        .await;
    assert!(result.is_err());
    assert!(!alice.is_connecting(&b.device_id(), "git"));
}

#[tokio::test]
async fn test_close_connections_with_peer() {
    let net = Net::new();
    let a = LoopbackIdentity::generate();
    let b = LoopbackIdentity::generate();
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let _ready = listening(&bob).await;

    let channel = alice
        .connect(b.device_id(), "git", ConnectOptions::default())
        .await
        .unwrap();
    assert!(wait_until(|| bob.active_socket_count() == 1).await);

    // Unrelated peers are untouched
    alice.close_connections_with(&LoopbackIdentity::generate().peer_identity());
    assert_eq!(alice.active_socket_count(), 1);

    alice.close_connections_with(&b.peer_identity());
    assert!(wait_until(|| channel.is_shutdown()).await);
    assert_eq!(alice.active_socket_count(), 0);
    assert_eq!(alice.attempt_count(), 0);
    assert!(wait_until(|| bob.active_socket_count() == 0).await);
}

#[tokio::test]
async fn test_close_connections_fails_pending_requests() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let _bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    alice.connect_device(
        b.device_id(),
        "git",
        ConnectOptions::default(),
        counting_callback(&calls, &failures),
    );
    assert!(wait_until(|| alice.is_connecting(&b.device_id(), "git")).await);

    alice.close_connections_with(&b.peer_identity());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(alice.attempt_count(), 0);
}

#[tokio::test]
async fn test_peer_socket_loss_is_noticed() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let _ready = listening(&bob).await;

    let channel = alice
        .connect(b.device_id(), "git", ConnectOptions::default())
        .await
        .unwrap();
    assert!(wait_until(|| bob.active_socket_count() == 1).await);

    bob.shutdown();
    assert!(wait_until(|| channel.is_shutdown()).await);
    assert!(wait_until(|| alice.active_socket_count() == 0).await);
    assert_eq!(alice.attempt_count(), 0);
}

#[tokio::test]
async fn test_connectivity_change_keeps_live_sockets() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let config = ConnectionManagerConfig::default().with_beacon_timeout(Duration::from_millis(200));
    let alice = net.node(&a, config);
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let _ready = listening(&bob).await;

    let channel = alice
        .connect(b.device_id(), "git", ConnectOptions::default())
        .await
        .unwrap();
    let socket = channel.underlying_socket().unwrap();
    assert!(wait_until(|| socket.can_send_beacon()).await);

    alice.connectivity_changed();
    sleep(Duration::from_millis(500)).await;
    assert!(!socket.is_shutdown());
    assert_eq!(alice.active_socket_count(), 1);
}

#[tokio::test]
async fn test_dead_peer_detected_after_connectivity_change() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let config = ConnectionManagerConfig::default().with_beacon_timeout(Duration::from_millis(200));
    let alice = net.node(&a, config);
    let bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();
    let _ready = listening(&bob).await;

    let channel = alice
        .connect(b.device_id(), "git", ConnectOptions::default())
        .await
        .unwrap();
    let socket = channel.underlying_socket().unwrap();
    assert!(wait_until(|| socket.can_send_beacon()).await);
    for remote in bob.sockets_to(&a.device_id()) {
        remote.set_answer_beacon(false);
    }

    alice.connectivity_changed();
    assert!(wait_until(|| socket.is_shutdown()).await);
    assert!(channel.is_shutdown());
    assert!(wait_until(|| alice.active_socket_count() == 0).await);
}

#[tokio::test]
async fn test_shutdown_fails_pending_and_refuses_new_requests() {
    let net = Net::new();
    let (a, b) = (LoopbackIdentity::generate(), LoopbackIdentity::generate());
    let alice = net.node(&a, ConnectionManagerConfig::default());
    let _bob = net.node(&b, ConnectionManagerConfig::default());
    alice.on_dht_connected().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    alice.connect_device(
        b.device_id(),
        "git",
        ConnectOptions::default(),
        counting_callback(&calls, &failures),
    );
    assert!(wait_until(|| alice.is_connecting(&b.device_id(), "git")).await);

    alice.shutdown();
    alice.shutdown();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(alice.attempt_count(), 0);

    let result = alice
        .connect(b.device_id(), "sip", ConnectOptions::default())
        .await;
    assert!(result.is_err());
    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
