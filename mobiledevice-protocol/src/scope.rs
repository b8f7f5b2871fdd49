//! Device Session Scope
//!
//! A [`DeviceScope`] answers "which device" for one unit of work and keeps
//! that device and its pairing record for as long as the scope lives.
//! Every service channel opened through the scope carries a child of the
//! scope's cancellation token; dropping the scope cancels them all and
//! releases their sockets, even on clients left idle.

use crate::config::TransportConfig;
use crate::device::Device;
use crate::muxer::MuxerConnector;
use crate::pairing::{PairingRecord, PairingRecordStore};
use crate::plist_client::PropertyListClient;
use crate::service::ServiceConnector;
use crate::{ProtocolError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pick the device a unit of work refers to
///
/// Without a udid the list must hold exactly one device. With a udid
/// exactly one device must match it, ignoring ASCII case.
pub fn select_device(devices: Vec<Device>, udid: Option<&str>) -> Result<Device> {
    match udid {
        None => {
            let count = devices.len();
            match <[Device; 1]>::try_from(devices) {
                Ok([device]) => Ok(device),
                Err(_) => Err(ProtocolError::AmbiguousDevice(count)),
            }
        }
        Some(udid) => {
            let mut matching = devices.into_iter().filter(|d| d.matches_udid(udid));
            match (matching.next(), matching.next()) {
                (Some(device), None) => Ok(device),
                _ => Err(ProtocolError::DeviceNotFound(udid.to_string())),
            }
        }
    }
}

/// Per-unit-of-work device selection and cached pairing state
pub struct DeviceScope {
    muxer: Arc<dyn MuxerConnector>,
    store: Arc<dyn PairingRecordStore>,
    config: TransportConfig,
    device: Option<Device>,
    record: Option<PairingRecord>,
    cancel: CancellationToken,
}

impl DeviceScope {
    /// Scope over devices reached through `muxer`, with records from `store`
    pub fn new(
        muxer: Arc<dyn MuxerConnector>,
        store: Arc<dyn PairingRecordStore>,
        config: TransportConfig,
    ) -> Self {
        Self {
            muxer,
            store,
            config,
            device: None,
            record: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelled when the scope is closed or dropped
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The resolved device, if any
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Resolve and remember the device for this scope
    pub async fn resolve(&mut self, udid: Option<&str>) -> Result<&Device> {
        let client = self.muxer.open().await?;
        let devices = client.list_devices().await?;
        let device = select_device(devices, udid)?;

        if self.device.as_ref().map(|d| &d.udid) != Some(&device.udid) {
            self.record = None;
        }
        debug!("Scope resolved to {}", device);
        Ok(&*self.device.insert(device))
    }

    /// Pairing record of the resolved device
    ///
    /// Resolves the sole attached device first if nothing was resolved yet.
    pub async fn pairing_record(&mut self) -> Result<&PairingRecord> {
        if self.record.is_none() {
            let udid = match self.device.as_ref().map(|d| d.udid.clone()) {
                Some(udid) => udid,
                None => self.resolve(None).await?.udid.clone(),
            };
            let record = self
                .store
                .read(&udid)
                .await?
                .ok_or_else(|| ProtocolError::PairingRecordNotFound(udid.clone()))?;
            self.record = Some(record);
        }
        self.record
            .as_ref()
            .ok_or_else(|| ProtocolError::PairingRecordNotFound(String::new()))
    }

    /// Open `service` on the resolved device
    pub async fn start_service(&mut self, service: &str) -> Result<PropertyListClient> {
        let record = self.pairing_record().await?.clone();
        let device = self
            .device
            .clone()
            .ok_or_else(|| ProtocolError::DeviceNotFound(String::new()))?;

        ServiceConnector::new(self.muxer.clone(), self.config.clone())
            .with_cancellation(self.cancel.child_token())
            .start_service(&device, &record, service)
            .await
    }

    /// Release every channel opened under this scope
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("Closing device scope");
            self.cancel.cancel();
        }
    }
}

impl Drop for DeviceScope {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
