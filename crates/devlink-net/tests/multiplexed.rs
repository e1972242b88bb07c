//! Multiplexed socket behavior over a loopback secure transport

use devlink_core::ChannelRequest;
use devlink_net::mock::{socket_pair, LoopbackIdentity};
use devlink_net::{ChannelSocket, ChannelState, MultiplexedSocket, SocketError, MAX_FRAME_PAYLOAD};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

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

/// Started sockets; `b` accepts every channel
async fn accepting_pair() -> (Arc<MultiplexedSocket>, Arc<MultiplexedSocket>) {
    init_tracing();
    let a = LoopbackIdentity::generate();
    let b = LoopbackIdentity::generate();
    let (sa, sb) = socket_pair(&a, &b).await.unwrap();
    sb.set_on_request(|_, _, _| true);
    sa.start();
    sb.start();
    (sa, sb)
}

async fn open_channel(socket: &Arc<MultiplexedSocket>, name: &str) -> Arc<ChannelSocket> {
    let channel = socket.add_channel(name).unwrap();
    let (tx, rx) = oneshot::channel();
    channel.on_ready(move || {
        let _ = tx.send(());
    });
    socket
        .write_control(&ChannelRequest::request(name, channel.channel()))
        .await
        .unwrap();
    timeout(WAIT, rx).await.expect("no answer").unwrap();
    channel
}

/// Count shutdown callbacks of `channel`
fn count_shutdowns(channel: &ChannelSocket) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    channel.on_shutdown(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[tokio::test]
async fn test_accepted_channel_carries_data_both_ways() {
    init_tracing();
    let a = LoopbackIdentity::generate();
    let b = LoopbackIdentity::generate();
    let (sa, sb) = socket_pair(&a, &b).await.unwrap();

    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    sb.set_on_request(|_, _, name| name == "git://repo");
    sb.set_on_ready(move |_, channel| {
        let _ = ready_tx.send(channel.clone());
    });
    sa.start();
    sb.start();

    let channel = open_channel(&sa, "git://repo").await;
    assert_eq!(channel.state(), ChannelState::Answered);
    assert!(channel.is_initiator());

    let remote = timeout(WAIT, ready_rx.recv()).await.unwrap().unwrap();
    assert_eq!(remote.channel(), channel.channel());
    assert_eq!(remote.name(), "git://repo");
    assert!(!remote.is_initiator());
    assert_eq!(remote.device_id(), &a.device_id());

    channel.write(b"hello").await.unwrap();
    assert_eq!(remote.recv(WAIT).await.unwrap(), b"hello");
    remote.write(b"world").await.unwrap();
    assert_eq!(channel.recv(WAIT).await.unwrap(), b"world");
}

#[tokio::test]
async fn test_declined_channel_is_stopped_and_removed() {
    init_tracing();
    let a = LoopbackIdentity::generate();
    let b = LoopbackIdentity::generate();
    let (sa, sb) = socket_pair(&a, &b).await.unwrap();
    sb.set_on_request(|_, _, _| false);
    sa.start();
    sb.start();

    let channel = sa.add_channel("sip").unwrap();
    let (tx, rx) = oneshot::channel();
    channel.on_shutdown(move || {
        let _ = tx.send(());
    });
    sa.write_control(&ChannelRequest::request("sip", channel.channel()))
        .await
        .unwrap();

    timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(channel.is_shutdown());
    assert_eq!(channel.state(), ChannelState::Removed);
    assert!(sa.channel(channel.channel()).is_none());
    assert_eq!(sb.channel_count(), 0);
    assert!(!sa.is_shutdown());
}

#[tokio::test]
async fn test_large_write_is_split_and_reassembled() {
    let (sa, sb) = accepting_pair().await;
    let channel = open_channel(&sa, "file").await;
    let remote = sb.channel(channel.channel()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    remote.set_on_recv(move |data| {
        let _ = tx.send(data.to_vec());
    });

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(channel.write(&payload).await.unwrap(), payload.len());

    let mut received = Vec::new();
    let mut chunks = 0;
    while received.len() < payload.len() {
        let chunk = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(chunk.len() <= MAX_FRAME_PAYLOAD);
        received.extend_from_slice(&chunk);
        chunks += 1;
    }
    assert_eq!(received, payload);
    assert!(chunks >= 4);
}

#[tokio::test]
async fn test_peer_eof_stops_and_removes_channel() {
    let (sa, sb) = accepting_pair().await;
    let channel = open_channel(&sa, "sip").await;
    let id = channel.channel();
    let remote = sb.channel(id).unwrap();

    let (tx, rx) = oneshot::channel();
    channel.on_shutdown(move || {
        let _ = tx.send(());
    });
    remote.shutdown().await;
    remote.shutdown().await;
    assert!(remote.is_shutdown());
    assert!(matches!(
        remote.write(b"late").await,
        Err(devlink_net::ChannelError::Shutdown)
    ));

    timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(wait_until(|| sa.channel(id).is_none()).await);
    assert!(sb.channel(id).is_none());

    // Data for the removed id is dropped
    sb.write(id, b"stray").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.available(), 0);
    assert!(!sa.is_shutdown());
}

#[tokio::test]
async fn test_answered_beacon_keeps_socket() {
    let (sa, _sb) = accepting_pair().await;
    assert!(wait_until(|| sa.can_send_beacon()).await);

    sa.send_beacon(Duration::from_millis(200));
    sleep(Duration::from_millis(500)).await;
    assert!(!sa.is_shutdown());
}

#[tokio::test]
async fn test_unanswered_beacon_shuts_socket_down() {
    let (sa, sb) = accepting_pair().await;
    let first = open_channel(&sa, "one").await;
    let second = open_channel(&sa, "two").await;
    let first_shutdowns = count_shutdowns(&first);
    let second_shutdowns = count_shutdowns(&second);
    sb.set_answer_beacon(false);
    let beacons = Arc::new(AtomicUsize::new(0));
    let seen = beacons.clone();
    sb.set_on_beacon(move |request| {
        if request {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert!(wait_until(|| sa.can_send_beacon()).await);

    let (tx, rx) = oneshot::channel();
    sa.on_shutdown(move || {
        let _ = tx.send(());
    });
    sa.send_beacon(Duration::from_millis(200));

    timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(sa.is_shutdown());
    assert_eq!(beacons.load(Ordering::SeqCst), 1);
    assert!(first.is_shutdown());
    assert!(second.is_shutdown());
    assert_eq!(sa.channel_count(), 0);
    assert!(wait_until(|| sb.is_shutdown()).await);

    // Neither the timeout nor the transport closing fires them again
    sa.shutdown();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(first_shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(second_shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_old_peer_is_never_sent_beacons() {
    init_tracing();
    let a = LoopbackIdentity::generate();
    let b = LoopbackIdentity::generate();
    let (sa, sb) = socket_pair(&a, &b).await.unwrap();
    sb.set_version(0);
    let (version_tx, version_rx) = oneshot::channel();
    let version_tx = parking_lot::Mutex::new(Some(version_tx));
    sa.set_on_version(move |v| {
        if let Some(tx) = version_tx.lock().take() {
            let _ = tx.send(v);
        }
    });
    let beacons = Arc::new(AtomicUsize::new(0));
    let seen = beacons.clone();
    sb.set_on_beacon(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    sa.start();
    sb.start();

    assert_eq!(timeout(WAIT, version_rx).await.unwrap().unwrap(), 0);
    assert!(!sa.can_send_beacon());
    sa.send_beacon(Duration::from_millis(100));
    sleep(Duration::from_millis(300)).await;
    assert_eq!(beacons.load(Ordering::SeqCst), 0);
    assert!(!sa.is_shutdown());
}

#[tokio::test]
async fn test_socket_shutdown_stops_every_channel() {
    let (sa, sb) = accepting_pair().await;
    let first = open_channel(&sa, "one").await;
    let second = open_channel(&sa, "two").await;
    let remote_first = sb.channel(first.channel()).unwrap();
    let first_shutdowns = count_shutdowns(&first);
    let second_shutdowns = count_shutdowns(&second);
    let remote_shutdowns = count_shutdowns(&remote_first);

    let shutdowns = Arc::new(AtomicUsize::new(0));
    let counter = shutdowns.clone();
    sa.on_shutdown(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    sa.shutdown();
    sa.shutdown();
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    assert!(first.is_shutdown());
    assert!(second.is_shutdown());
    assert_eq!(sa.channel_count(), 0);
    assert!(matches!(
        sa.add_channel("three"),
        Err(SocketError::Shutdown)
    ));

    // The peer sees the transport close
    assert!(wait_until(|| sb.is_shutdown()).await);
    assert!(remote_first.is_shutdown());
    sa.join().await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(first_shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(second_shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(remote_shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oversized_frame_rejected() {
    let (sa, _sb) = accepting_pair().await;
    let data = vec![0u8; MAX_FRAME_PAYLOAD + 1];
    assert!(matches!(
        sa.write(42, &data).await,
        Err(SocketError::MessageTooLarge(_))
    ));
    assert!(!sa.is_shutdown());
}

#[tokio::test]
async fn test_channel_ids_skip_reserved_and_used() {
    let (sa, _sb) = accepting_pair().await;
    let mut ids = HashSet::new();
    for i in 0..64 {
        let channel = sa.add_channel(format!("c{i}")).unwrap();
        assert_ne!(channel.channel(), 0);
        assert_ne!(channel.channel(), 0xFFFF);
        assert_eq!(channel.state(), ChannelState::Pending);
        assert!(ids.insert(channel.channel()));
    }
    assert_eq!(sa.channel_count(), 64);
}
