//! Logical channel carried by a [`MultiplexedSocket`]

use crate::framing::MAX_FRAME_PAYLOAD;
use crate::multiplexed::{MultiplexedSocket, SocketError};
use devlink_core::{DeviceCertificate, DeviceId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Called with each received chunk once a receive callback is installed
pub type RecvCallback = Box<dyn FnMut(&[u8]) + Send>;
/// Called once when the channel stops
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;
/// Called once when the peer accepted the channel
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is shut down")]
    Shutdown,
    #[error("Underlying socket is gone")]
    SocketGone,
    #[error("Timed out waiting for data")]
    Timeout,
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),
}

/// Lifecycle of a channel inside its socket's table.
///
/// A channel leaves the table only once it has been answered (or declined)
/// and stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Request sent, no answer yet
    Pending,
    /// Accepted by the peer, or created by accepting a request
    Answered,
    /// Stopped before the answer arrived; removed when it does
    ShutdownPendingRemoval,
    /// No longer in the table
    Removed,
}

#[derive(Default)]
struct RxState {
    buf: Vec<u8>,
    on_recv: Option<RecvCallback>,
}

#[derive(Default)]
struct Callbacks {
    on_ready: Option<ReadyCallback>,
    on_shutdown: Option<ShutdownCallback>,
}

/// Bidirectional byte stream identified by a 16-bit channel id
pub struct ChannelSocket {
    name: String,
    channel: u16,
    is_initiator: bool,
    device_id: DeviceId,
    endpoint: Weak<MultiplexedSocket>,
    state: Mutex<ChannelState>,
    is_shutdown: AtomicBool,
    rx: Mutex<RxState>,
    /// Serializes delivery to the receive callback
    delivery: Mutex<()>,
    callbacks: Mutex<Callbacks>,
    data_ready: Notify,
}

impl ChannelSocket {
    pub(crate) fn new(
        endpoint: Weak<MultiplexedSocket>,
        device_id: DeviceId,
        name: impl Into<String>,
        channel: u16,
        is_initiator: bool,
        state: ChannelState,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            is_initiator,
            device_id,
            endpoint,
            state: Mutex::new(state),
            is_shutdown: AtomicBool::new(false),
            rx: Mutex::new(RxState::default()),
            delivery: Mutex::new(()),
            callbacks: Mutex::new(Callbacks::default()),
            data_ready: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// True when this side requested the channel
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    pub fn underlying_socket(&self) -> Option<Arc<MultiplexedSocket>> {
        self.endpoint.upgrade()
    }

    /// Largest chunk written at once, 0 once the socket is gone
    pub fn max_payload(&self) -> usize {
        self.endpoint
            .upgrade()
            .map(|socket| socket.max_payload().min(MAX_FRAME_PAYLOAD))
            .unwrap_or(0)
    }

    pub fn peer_certificate(&self) -> Option<Arc<DeviceCertificate>> {
        self.endpoint.upgrade().map(|socket| socket.peer_certificate())
    }

    /// Bytes currently buffered for `read`
    pub fn available(&self) -> usize {
        self.rx.lock().buf.len()
    }

    /// Drain up to `out.len()` buffered bytes
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut rx = self.rx.lock();
        let n = out.len().min(rx.buf.len());
        out[..n].copy_from_slice(&rx.buf[..n]);
        rx.buf.drain(..n);
        n
    }

    /// Wait until data is buffered, the channel stops or `timeout` elapses.
    ///
    /// Returns the number of buffered bytes.
    pub async fn wait_for_data(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let available = self.available();
            if available > 0 || self.is_shutdown() {
                return available;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.available();
            }
        }
    }

    /// Wait for data and take everything buffered
    pub async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if self.wait_for_data(timeout).await == 0 {
            return Err(if self.is_shutdown() {
                ChannelError::Shutdown
            } else {
                ChannelError::Timeout
            });
        }
        Ok(std::mem::take(&mut self.rx.lock().buf))
    }

    /// Install the receive callback; data buffered so far is flushed to it first
    pub fn set_on_recv(&self, mut cb: impl FnMut(&[u8]) + Send + 'static) {
        let _delivery = self.delivery.lock();
        let pending = std::mem::take(&mut self.rx.lock().buf);
        if !pending.is_empty() {
            cb(&pending);
        }
        self.rx.lock().on_recv = Some(Box::new(cb));
    }

    pub(crate) fn on_recv(&self, pkt: Vec<u8>) {
        let _delivery = self.delivery.lock();
        let taken = self.rx.lock().on_recv.take();
        let Some(mut cb) = taken else {
            self.rx.lock().buf.extend_from_slice(&pkt);
            self.data_ready.notify_waiters();
            return;
        };
        cb(&pkt);
        let mut rx = self.rx.lock();
        if rx.on_recv.is_none() {
            rx.on_recv = Some(cb);
        }
    }

    /// Write `data`, split into frames of at most [`MAX_FRAME_PAYLOAD`] bytes
    pub async fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        if self.is_shutdown() {
            return Err(ChannelError::Shutdown);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let socket = self.endpoint.upgrade().ok_or(ChannelError::SocketGone)?;
        let mut sent = 0;
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            sent += socket.write(self.channel, chunk).await?;
        }
        Ok(sent)
    }

    /// Register the stop callback; runs immediately if already stopped
    pub fn on_shutdown(&self, cb: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.callbacks.lock();
        if self.is_shutdown() {
            drop(callbacks);
            cb();
        } else {
            callbacks.on_shutdown = Some(Box::new(cb));
        }
    }

    pub fn on_ready(&self, cb: impl FnOnce() + Send + 'static) {
        self.callbacks.lock().on_ready = Some(Box::new(cb));
    }

    pub(crate) fn ready(&self) {
        let cb = self.callbacks.lock().on_ready.take();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Local teardown without notifying the peer
    pub fn stop(&self) {
        self.stop_once();
    }

    fn stop_once(&self) -> bool {
        let on_shutdown = {
            let mut callbacks = self.callbacks.lock();
            if self.is_shutdown.swap(true, Ordering::SeqCst) {
                return false;
            }
            callbacks.on_shutdown.take()
        };
        self.data_ready.notify_waiters();
        if let Some(cb) = on_shutdown {
            cb();
        }
        if let Some(socket) = self.endpoint.upgrade() {
            socket.on_channel_stopped(self);
        }
        true
    }

    /// Stop and tell the peer with a zero-length frame. Idempotent.
    pub async fn shutdown(&self) {
        if !self.stop_once() {
            return;
        }
        if let Some(socket) = self.endpoint.upgrade() {
            // Peer EOF on an already closed socket is not an error worth reporting
            let _ = socket.write(self.channel, &[]).await;
        }
    }

    /// Check liveness of the underlying socket
    pub fn send_beacon(&self, timeout: Duration) {
        match self.endpoint.upgrade() {
            Some(socket) => socket.send_beacon(timeout),
            None => self.stop(),
        }
    }
}

impl std::fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSocket")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("device", &self.device_id)
            .field("state", &self.state())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
