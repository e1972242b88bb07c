//! Device certificates known to this node

use async_trait::async_trait;
use devlink_core::{DeviceCertificate, DeviceId, PeerIdentity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Source of device certificates
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Resolve the certificate of `device`, possibly through the network
    async fn find_certificate(&self, device: &DeviceId) -> Option<Arc<DeviceCertificate>>;

    /// Certificate already present locally
    fn get_certificate(&self, device: &DeviceId) -> Option<Arc<DeviceCertificate>>;
}

/// Check that `certificate` is a valid device certificate and return its owner.
///
/// A device certificate signed by its own key is not a device certificate.
pub fn found_peer_device(certificate: &DeviceCertificate) -> Option<PeerIdentity> {
    match certificate.verify() {
        Ok(()) => Some(certificate.issuer_id()),
        Err(e) => {
            warn!("Invalid device certificate {}: {}", certificate.device_id(), e);
            None
        }
    }
}

/// In-memory certificate store
#[derive(Default)]
pub struct CertificateStore {
    certificates: RwLock<HashMap<DeviceId, Arc<DeviceCertificate>>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a certificate; invalid certificates are refused
    pub fn pin_certificate(&self, certificate: DeviceCertificate) -> Option<DeviceId> {
        found_peer_device(&certificate)?;
        let device = certificate.device_id();
        self.certificates.write().insert(device, Arc::new(certificate));
        Some(device)
    }

    pub fn remove(&self, device: &DeviceId) -> Option<Arc<DeviceCertificate>> {
        self.certificates.write().remove(device)
    }

    /// Devices owned by `peer`
    pub fn devices_of(&self, peer: &PeerIdentity) -> Vec<DeviceId> {
        self.certificates
            .read()
            .iter()
            .filter(|(_, cert)| cert.issuer_id() == *peer)
            .map(|(device, _)| *device)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.certificates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.read().is_empty()
    }
}

#[async_trait]
impl CertificateProvider for CertificateStore {
    async fn find_certificate(&self, device: &DeviceId) -> Option<Arc<DeviceCertificate>> {
        self.get_certificate(device)
    }

    fn get_certificate(&self, device: &DeviceId) -> Option<Arc<DeviceCertificate>> {
        self.certificates.read().get(device).cloned()
    }
}
