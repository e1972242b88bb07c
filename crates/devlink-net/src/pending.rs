//! Callbacks waiting for a channel to a device
//!
//! Every `connect_device` call leaves one entry here until it is resolved,
//! either with a channel or with a failure. Resolution always goes through
//! extraction, so each callback runs at most once.

use crate::channel::ChannelSocket;
use devlink_core::{AttemptId, DeviceId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Resolves one connect request: `Some` channel on success, `None` on failure
pub type ConnectCallback = Box<dyn FnOnce(Option<Arc<ChannelSocket>>, &DeviceId) + Send>;

/// Key of an attempt and of the callbacks bound to it
pub type CallbackId = (DeviceId, AttemptId);

pub(crate) struct PendingCb {
    pub name: String,
    pub cb: ConnectCallback,
    pub id: AttemptId,
    /// A channel request was already sent for this callback
    pub requested: bool,
}

#[derive(Default)]
pub(crate) struct PendingCallbacks {
    inner: Mutex<HashMap<DeviceId, Vec<PendingCb>>>,
}

impl PendingCallbacks {
    pub fn contains_id(&self, device: &DeviceId, id: AttemptId) -> bool {
        self.inner
            .lock()
            .get(device)
            .map(|pendings| pendings.iter().any(|p| p.id == id))
            .unwrap_or(false)
    }

    pub fn push(&self, device: DeviceId, pending: PendingCb) {
        self.inner.lock().entry(device).or_default().push(pending);
    }

    pub fn mark_requested(&self, device: &DeviceId, id: AttemptId) {
        if let Some(pendings) = self.inner.lock().get_mut(device) {
            for pending in pendings.iter_mut().filter(|p| p.id == id) {
                pending.requested = true;
            }
        }
    }

    /// Names and ids of callbacks with no channel request yet; they are
    /// marked as requested.
    pub fn take_unrequested(&self, device: &DeviceId) -> Vec<(String, AttemptId)> {
        let mut inner = self.inner.lock();
        let Some(pendings) = inner.get_mut(device) else {
            return Vec::new();
        };
        pendings
            .iter_mut()
            .filter(|p| !p.requested)
            .map(|p| {
                p.requested = true;
                (p.name.clone(), p.id)
            })
            .collect()
    }

    /// Remove callbacks for `device`, all of them or only those of `id`
    pub fn extract(&self, device: &DeviceId, id: Option<AttemptId>) -> Vec<PendingCb> {
        let mut inner = self.inner.lock();
        let Some(pendings) = inner.get_mut(device) else {
            return Vec::new();
        };
        let extracted = match id {
            None => std::mem::take(pendings),
            Some(id) => {
                let (matched, kept): (Vec<_>, Vec<_>) = std::mem::take(pendings)
                    .into_iter()
                    .partition(|p| p.id == id);
                *pendings = kept;
                matched
            }
        };
        if pendings.is_empty() {
            inner.remove(device);
        }
        extracted
    }

    /// Remove the callbacks bound to `ids`; with `unrequested_only`, callbacks
    /// already waiting on a channel stay.
    pub fn extract_ids(
        &self,
        ids: &HashSet<CallbackId>,
        unrequested_only: bool,
    ) -> Vec<(DeviceId, PendingCb)> {
        let mut inner = self.inner.lock();
        let mut extracted = Vec::new();
        let devices: HashSet<DeviceId> = ids.iter().map(|(device, _)| *device).collect();
        for device in devices {
            let Some(pendings) = inner.get_mut(&device) else {
                continue;
            };
            let (matched, kept): (Vec<_>, Vec<_>) =
                std::mem::take(pendings).into_iter().partition(|p| {
                    ids.contains(&(device, p.id)) && !(unrequested_only && p.requested)
                });
            *pendings = kept;
            if pendings.is_empty() {
                inner.remove(&device);
            }
            extracted.extend(matched.into_iter().map(|p| (device, p)));
        }
        extracted
    }

    pub fn is_connecting(&self, device: &DeviceId, name: &str) -> bool {
        self.inner
            .lock()
            .get(device)
            .map(|pendings| pendings.iter().any(|p| p.name == name))
            .unwrap_or(false)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.inner.lock().keys().copied().collect()
    }

    pub fn drain(&self) -> Vec<(DeviceId, PendingCb)> {
        self.inner
            .lock()
            .drain()
            .flat_map(|(device, pendings)| pendings.into_iter().map(move |p| (device, p)))
            .collect()
    }
}

/// Resolve extracted callbacks with a failure
pub(crate) fn fail_all(pendings: impl IntoIterator<Item = (DeviceId, PendingCb)>) {
    for (device, pending) in pendings {
        (pending.cb)(None, &device);
    }
}
