//! Service Connection Orchestrator
//!
//! Turns "service X on device Y" into a ready [`PropertyListClient`]:
//!
//! 1. connect to the session-management service through the multiplexer
//! 2. `StartSession` with the device's pairing record
//! 3. `StartService` to learn the service port and whether it needs TLS
//! 4. `StopSession`
//! 5. connect to the service port through a fresh multiplexer connection
//! 6. wrap the channel and upgrade it to TLS if the device asked for it
//!
//! Failure anywhere aborts the whole sequence; every channel opened so far
//! is released and no partially set-up client is returned.

use crate::config::TransportConfig;
use crate::device::Device;
use crate::lockdown::{LockdownClient, ServiceDescriptor, LOCKDOWN_PORT};
use crate::muxer::{MuxerClient, MuxerConnector};
use crate::pairing::{trust, PairingRecord};
use crate::plist_client::PropertyListClient;
use crate::transport::{BoxChannel, ReleasableChannel};
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens service channels on devices
#[derive(Clone)]
pub struct ServiceConnector {
    muxer: Arc<dyn MuxerConnector>,
    config: TransportConfig,
    cancel: Option<CancellationToken>,
}

impl ServiceConnector {
    /// Reach devices through `muxer`
    pub fn new(muxer: Arc<dyn MuxerConnector>, config: TransportConfig) -> Self {
        Self {
            muxer,
            config,
            cancel: None,
        }
    }

    /// Attach `token` to every channel this connector opens
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    async fn open_muxer(&self) -> Result<MuxerClient> {
        let client = self.muxer.open().await?;
        Ok(match &self.cancel {
            Some(token) => client.with_cancellation(token.clone()),
            None => client,
        })
    }

    fn wrap(&self, channel: BoxChannel) -> PropertyListClient {
        match &self.cancel {
            Some(token) => {
                let channel = Box::new(ReleasableChannel::new(channel, token));
                PropertyListClient::with_config(channel, &self.config)
                    .with_cancellation(token.clone())
            }
            None => PropertyListClient::with_config(channel, &self.config),
        }
    }

    async fn connect_port(&self, device: &Device, port: u16) -> Result<PropertyListClient> {
        let channel = self
            .open_muxer()
            .await?
            .connect_to_port(device.device_id, port)
            .await?;
        Ok(self.wrap(channel))
    }

    /// Open a session-management client on `device`
    pub async fn connect_lockdown(&self, device: &Device) -> Result<LockdownClient> {
        let plist = self.connect_port(device, LOCKDOWN_PORT).await?;
        Ok(LockdownClient::new(plist, self.config.label.clone()))
    }

    /// Negotiate `service` and return where it listens (steps 1-4)
    pub async fn negotiate(
        &self,
        device: &Device,
        record: &PairingRecord,
        service: &str,
    ) -> Result<ServiceDescriptor> {
        let mut lockdown = self.connect_lockdown(device).await?;

        let result = async {
            lockdown.start_session(record).await?;
            let descriptor = lockdown
                .start_service(service, record.escrow_bag.as_deref())
                .await?;
            lockdown.stop_session().await?;
            Ok(descriptor)
        }
        .await;

        lockdown.close().await;
        result
    }

    /// Open `service` on `device`, authenticated with `record`
    pub async fn start_service(
        &self,
        device: &Device,
        record: &PairingRecord,
        service: &str,
    ) -> Result<PropertyListClient> {
        trust::validate_record(record)?;

        debug!("Starting {} on {}", service, device);
        let descriptor = self.negotiate(device, record, service).await?;
        let mut client = self.connect_port(device, descriptor.port).await?;

        if descriptor.enable_service_ssl {
            if let Err(e) = client.enable_tls(record).await {
                warn!("TLS upgrade for {} failed: {}", service, e);
                client.close().await;
                return Err(e);
            }
        }

        info!(
            "Service {} on {} ready on port {} ({:?})",
            service,
            device.udid,
            descriptor.port,
            client.state()
        );
        Ok(client)
    }
}
