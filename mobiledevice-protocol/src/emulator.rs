//! In-Process Multiplexer and Device Emulator
//!
//! [`MuxerEmulator`] speaks the daemon side of the multiplexer protocol over
//! in-memory `tokio::io::duplex` channels and emulates the devices behind
//! it:
//!
//! - `ListDevices`, `ReadBUID` and the pairing-record requests are answered
//!   from shared state
//! - `Listen` streams `Attached`/`Detached` notifications
//! - `Connect` to port 62078 runs a session-management service that checks
//!   the host id, hands out session ids, and switches TLS on and off with
//!   the device's copy of the pairing record
//! - `Connect` to a registered service port runs a property-list echo
//!   service, TLS-protected if the service asks for it
//!
//! Every `locate()` spawns one task serving the new connection.
//!
//! ```rust
//! use mobiledevice_protocol::emulator::{EmulatedDevice, MuxerEmulator};
//! use mobiledevice_protocol::muxer::MuxerClient;
//! use mobiledevice_protocol::TransportConfig;
//!
//! # tokio_test::block_on(async {
//! let emulator = MuxerEmulator::new().with_device(EmulatedDevice::new(1, "00008030-001A"));
//! let client = MuxerClient::connect(&emulator, &TransportConfig::default())
//!     .await
//!     .unwrap()
//!     .unwrap();
//! let devices = client.list_devices().await.unwrap();
//! assert_eq!(devices[0].udid, "00008030-001A");
//! # });
//! ```

use crate::config::TransportConfig;
use crate::device::{ConnectionType, Device};
use crate::error::MuxerResultCode;
use crate::lockdown::{LOCKDOWN_PORT, LOCKDOWN_SERVICE_TYPE};
use crate::muxer::client::{read_frame, write_frame};
use crate::muxer::{LocatorConnector, MuxerConnector, MuxerLocator, MuxerRequest, MuxerResponse};
use crate::pairing::PairingRecord;
use crate::plist_client::{PropertyListClient, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::BoxChannel;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use plist::{Dictionary, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// In-memory buffer size of each emulated connection
const CHANNEL_BUFFER: usize = 256 * 1024;

/// Default BUID reported by `ReadBUID`
pub const EMULATED_BUID: &str = "00000000-0000-0000-0000-000000000000";

/// A service an emulated device offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedService {
    /// Device-side port
    pub port: u16,
    /// Whether the channel must be TLS-upgraded
    pub enable_ssl: bool,
}

/// One emulated device
#[derive(Debug, Clone)]
pub struct EmulatedDevice {
    device: Device,
    pairing: Option<PairingRecord>,
    session_ssl: bool,
    services: HashMap<String, EmulatedService>,
}

impl EmulatedDevice {
    /// USB device with no pairing and no services
    pub fn new(device_id: u32, udid: impl Into<String>) -> Self {
        Self {
            device: Device::new(device_id, udid, ConnectionType::Usb),
            pairing: None,
            session_ssl: true,
            services: HashMap::new(),
        }
    }

    /// The device's copy of its pairing with the host
    pub fn with_pairing(mut self, record: PairingRecord) -> Self {
        self.pairing = Some(record);
        self
    }

    /// Whether sessions run over TLS (default `true`)
    pub fn with_session_ssl(mut self, enabled: bool) -> Self {
        self.session_ssl = enabled;
        self
    }

    /// Offer `name` as an echo service on `port`
    pub fn with_service(mut self, name: impl Into<String>, port: u16, enable_ssl: bool) -> Self {
        self.services
            .insert(name.into(), EmulatedService { port, enable_ssl });
        self
    }

    /// Device as reported by the multiplexer
    pub fn device(&self) -> &Device {
        &self.device
    }

    fn service_on(&self, port: u16) -> Option<&EmulatedService> {
        self.services.values().find(|s| s.port == port)
    }
}

struct State {
    devices: Vec<EmulatedDevice>,
    pair_records: HashMap<String, Vec<u8>>,
    buid: String,
}

/// Emulated multiplexer daemon with devices behind it
#[derive(Clone)]
pub struct MuxerEmulator {
    state: Arc<Mutex<State>>,
    notifications: broadcast::Sender<MuxerResponse>,
    present: bool,
}

impl Default for MuxerEmulator {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do on a service channel once a reply has been written
enum Then {
    Continue,
    AcceptTls,
    DisableTls,
}

impl MuxerEmulator {
    /// Daemon with no devices attached
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(State {
                devices: Vec::new(),
                pair_records: HashMap::new(),
                buid: EMULATED_BUID.to_string(),
            })),
            notifications,
            present: true,
        }
    }

    /// A host where the daemon is not running: `locate()` yields `None`
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new()
        }
    }

    /// Attach `device` while building the emulator
    ///
    /// Use [`attach`](Self::attach) once connections are being served.
    pub fn with_device(mut self, device: EmulatedDevice) -> Self {
        match Arc::get_mut(&mut self.state) {
            Some(state) => state.get_mut().devices.push(device),
            None => match self.state.try_lock() {
                Ok(mut state) => state.devices.push(device),
                Err(_) => warn!(
                    "Emulator state is busy, device {} was not attached",
                    device.device.udid
                ),
            },
        }
        self
    }

    /// Connector opening clients to this emulator
    pub fn connector(&self, config: TransportConfig) -> Arc<dyn MuxerConnector> {
        Arc::new(LocatorConnector::new(Arc::new(self.clone()), config))
    }

    /// Attach `device` and notify listeners
    pub async fn attach(&self, device: EmulatedDevice) {
        let notice = MuxerResponse::Attached(device.device.clone());
        self.state.lock().await.devices.push(device);
        // No receivers is fine
        let _ = self.notifications.send(notice);
    }

    /// Detach the device with `device_id` and notify listeners
    pub async fn detach(&self, device_id: u32) {
        self.state
            .lock()
            .await
            .devices
            .retain(|d| d.device.device_id != device_id);
        let _ = self.notifications.send(MuxerResponse::Detached { device_id });
    }

    /// Stored pairing record bytes for `udid`
    pub async fn pair_record(&self, udid: &str) -> Option<Vec<u8>> {
        self.state.lock().await.pair_records.get(udid).cloned()
    }

    async fn find_device(&self, device_id: u32) -> Option<EmulatedDevice> {
        self.state
            .lock()
            .await
            .devices
            .iter()
            .find(|d| d.device.device_id == device_id)
            .cloned()
    }

    /// Serve one daemon connection
    async fn serve(self, mut socket: DuplexStream) -> Result<()> {
        while let Some((tag, body)) = read_frame(&mut socket, DEFAULT_MAX_FRAME_SIZE).await? {
            let request = match MuxerRequest::from_plist(&body) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Emulator rejecting request: {}", e);
                    let reply = MuxerResponse::Result(MuxerResultCode::BadCommand);
                    write_frame(&mut socket, tag, &reply.to_plist()).await?;
                    continue;
                }
            };
            debug!("Emulator received {}", request.message_type());

            let reply = match request {
                MuxerRequest::ListDevices => {
                    let state = self.state.lock().await;
                    let list = state
                        .devices
                        .iter()
                        .map(|d| Value::Dictionary(d.device.to_plist()))
                        .collect();
                    let mut body = Dictionary::new();
                    body.insert("DeviceList".to_string(), Value::Array(list));
                    MuxerResponse::Plist(body)
                }
                MuxerRequest::ReadBuid => {
                    let mut body = Dictionary::new();
                    body.insert(
                        "BUID".to_string(),
                        Value::String(self.state.lock().await.buid.clone()),
                    );
                    MuxerResponse::Plist(body)
                }
                MuxerRequest::ReadPairRecord { udid } => {
                    match self.state.lock().await.pair_records.get(&udid) {
                        Some(data) => {
                            let mut body = Dictionary::new();
                            body.insert("PairRecordData".to_string(), Value::Data(data.clone()));
                            MuxerResponse::Plist(body)
                        }
                        None => MuxerResponse::Result(MuxerResultCode::BadDevice),
                    }
                }
                MuxerRequest::SavePairRecord { udid, data } => {
                    self.state.lock().await.pair_records.insert(udid, data);
                    MuxerResponse::Result(MuxerResultCode::Ok)
                }
                MuxerRequest::DeletePairRecord { udid } => {
                    self.state.lock().await.pair_records.remove(&udid);
                    MuxerResponse::Result(MuxerResultCode::Ok)
                }
                MuxerRequest::Listen => {
                    let ok = MuxerResponse::Result(MuxerResultCode::Ok);
                    write_frame(&mut socket, tag, &ok.to_plist()).await?;
                    return self.stream_notifications(socket).await;
                }
                MuxerRequest::Connect { device_id, port } => {
                    let Some(device) = self.find_device(device_id).await else {
                        let reply = MuxerResponse::Result(MuxerResultCode::BadDevice);
                        write_frame(&mut socket, tag, &reply.to_plist()).await?;
                        continue;
                    };

                    let ssl = if port == LOCKDOWN_PORT {
                        None
                    } else {
                        match device.service_on(port) {
                            Some(service) => Some(service.enable_ssl),
                            None => {
                                let reply =
                                    MuxerResponse::Result(MuxerResultCode::ConnectionRefused);
                                write_frame(&mut socket, tag, &reply.to_plist()).await?;
                                continue;
                            }
                        }
                    };

                    let ok = MuxerResponse::Result(MuxerResultCode::Ok);
                    write_frame(&mut socket, tag, &ok.to_plist()).await?;
                    let channel: BoxChannel = Box::new(socket);
                    return match ssl {
                        None => serve_lockdown(channel, device).await,
                        Some(enable_ssl) => serve_echo(channel, device, enable_ssl).await,
                    };
                }
            };

            write_frame(&mut socket, tag, &reply.to_plist()).await?;
        }
        Ok(())
    }

    async fn stream_notifications(&self, socket: DuplexStream) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(socket);
        let (mut notifications, attached) = {
            let state = self.state.lock().await;
            let attached: Vec<Device> = state.devices.iter().map(|d| d.device.clone()).collect();
            (self.notifications.subscribe(), attached)
        };

        for device in attached {
            write_frame(&mut writer, 0, &MuxerResponse::Attached(device).to_plist()).await?;
        }

        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                read = reader.read(&mut scratch) => match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => debug!("Ignoring bytes on notification stream"),
                },
                notice = notifications.recv() => match notice {
                    Ok(notice) => write_frame(&mut writer, 0, &notice.to_plist()).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Notification listener lagged by {}", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

fn reply_to(request: &str) -> Dictionary {
    let mut reply = Dictionary::new();
    reply.insert("Request".to_string(), Value::String(request.to_string()));
    reply
}

fn fail(mut reply: Dictionary, error: &str) -> Dictionary {
    reply.insert("Error".to_string(), Value::String(error.to_string()));
    reply
}

fn pairing_of(device: &EmulatedDevice) -> Result<&PairingRecord> {
    device.pairing.as_ref().ok_or_else(|| {
        ProtocolError::InvalidPairingRecord(format!("{} is not paired", device.device.udid))
    })
}

/// Device side of the session-management service
async fn serve_lockdown(channel: BoxChannel, device: EmulatedDevice) -> Result<()> {
    let mut peer = PropertyListClient::new(channel);
    let mut session: Option<String> = None;

    while let Some(message) = peer.read_message().await? {
        let request = message.into_dictionary().ok_or_else(|| {
            ProtocolError::UnexpectedResponse("request is not a dictionary".to_string())
        })?;
        let name = request
            .get("Request")
            .and_then(Value::as_string)
            .unwrap_or_default()
            .to_string();
        let reply = reply_to(&name);

        let (reply, then) = match name.as_str() {
            "QueryType" => {
                let mut reply = reply;
                reply.insert(
                    "Type".to_string(),
                    Value::String(LOCKDOWN_SERVICE_TYPE.to_string()),
                );
                (reply, Then::Continue)
            }
            "StartSession" => {
                let host_id = request.get("HostID").and_then(Value::as_string);
                match &device.pairing {
                    Some(record) if host_id == Some(record.host_id.as_str()) => {
                        let id = uuid::Uuid::new_v4().to_string().to_uppercase();
                        let mut reply = reply;
                        reply.insert("SessionID".to_string(), Value::String(id.clone()));
                        reply.insert(
                            "EnableSessionSSL".to_string(),
                            Value::Boolean(device.session_ssl),
                        );
                        session = Some(id);
                        let then = if device.session_ssl {
                            Then::AcceptTls
                        } else {
                            Then::Continue
                        };
                        (reply, then)
                    }
                    _ => (fail(reply, "InvalidHostID"), Then::Continue),
                }
            }
            "StartService" => {
                let service = request.get("Service").and_then(Value::as_string);
                match (session.is_some(), service.and_then(|s| device.services.get(s))) {
                    (false, _) => (fail(reply, "NoRunningSession"), Then::Continue),
                    (true, None) => (fail(reply, "InvalidService"), Then::Continue),
                    (true, Some(descriptor)) => {
                        let mut reply = reply;
                        reply.insert(
                            "Service".to_string(),
                            Value::String(service.unwrap_or_default().to_string()),
                        );
                        reply.insert(
                            "Port".to_string(),
                            Value::Integer(u64::from(descriptor.port).into()),
                        );
                        reply.insert(
                            "EnableServiceSSL".to_string(),
                            Value::Boolean(descriptor.enable_ssl),
                        );
                        (reply, Then::Continue)
                    }
                }
            }
            "StopSession" => {
                let id = request.get("SessionID").and_then(Value::as_string);
                if session.is_some() && session.as_deref() == id {
                    session = None;
                    let then = if peer.is_encrypted() {
                        Then::DisableTls
                    } else {
                        Then::Continue
                    };
                    (reply, then)
                } else {
                    (fail(reply, "InvalidSessionID"), Then::Continue)
                }
            }
            "GetValue" => match request.get("Key").and_then(Value::as_string) {
                None | Some("UniqueDeviceID") => {
                    let mut reply = reply;
                    reply.insert(
                        "Value".to_string(),
                        Value::String(device.device.udid.clone()),
                    );
                    (reply, Then::Continue)
                }
                Some(_) => (fail(reply, "MissingValue"), Then::Continue),
            },
            _ => (fail(reply, "InvalidRequest"), Then::Continue),
        };

        peer.write_message(&reply).await?;
        match then {
            Then::Continue => {}
            Then::AcceptTls => peer.accept_tls(pairing_of(&device)?).await?,
            Then::DisableTls => peer.disable_tls().await?,
        }
    }

    debug!("Session-management connection to {} closed", device.device.udid);
    Ok(())
}

/// Device side of a property-list echo service
async fn serve_echo(channel: BoxChannel, device: EmulatedDevice, enable_ssl: bool) -> Result<()> {
    let mut peer = PropertyListClient::new(channel);
    if enable_ssl {
        peer.accept_tls(pairing_of(&device)?).await?;
    }

    while let Some(message) = peer.read_message().await? {
        peer.write_message(&message).await?;
    }
    debug!("Echo connection to {} closed", device.device.udid);
    Ok(())
}

#[async_trait]
impl MuxerLocator for MuxerEmulator {
    async fn locate(&self) -> Result<Option<BoxChannel>> {
        if !self.present {
            return Ok(None);
        }

        let (client, daemon) = tokio::io::duplex(CHANNEL_BUFFER);
        let emulator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = emulator.serve(daemon).await {
                debug!("Emulated connection ended: {}", e);
            }
        });
        info!("Opened emulated multiplexer connection");
        Ok(Some(Box::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::{DeviceEvent, MuxerClient};

    async fn client(emulator: &MuxerEmulator) -> MuxerClient {
        MuxerClient::connect(emulator, &TransportConfig::default())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_with_device_on_shared_emulator() {
        let emulator = MuxerEmulator::new().with_device(EmulatedDevice::new(1, "one"));
        let shared = emulator.clone();
        let emulator = emulator.with_device(EmulatedDevice::new(2, "two"));

        let udids: Vec<String> = client(&shared)
            .await
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.udid)
            .collect();
        assert_eq!(udids, ["one", "two"]);
        drop(emulator);
    }

    #[tokio::test]
    async fn test_absent_daemon() {
        let emulator = MuxerEmulator::absent();
        let found = MuxerClient::connect(&emulator, &TransportConfig::default())
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(matches!(
            emulator.connector(TransportConfig::default()).open().await,
            Err(ProtocolError::MuxerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_buid_and_records() {
        let emulator = MuxerEmulator::new();
        let client = client(&emulator).await;

        assert_eq!(client.read_buid().await.unwrap(), EMULATED_BUID);
        assert!(client.read_pair_record("abc").await.unwrap().is_none());
        client.save_pair_record("abc", b"record").await.unwrap();
        assert_eq!(
            client.read_pair_record("abc").await.unwrap().as_deref(),
            Some(&b"record"[..])
        );
        assert_eq!(emulator.pair_record("abc").await.as_deref(), Some(&b"record"[..]));
        client.delete_pair_record("abc").await.unwrap();
        assert!(client.read_pair_record("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_to_unknown_port_is_refused() {
        let emulator = MuxerEmulator::new().with_device(EmulatedDevice::new(1, "one"));
        let refused = client(&emulator).await.connect_to_port(1, 9).await;
        assert!(matches!(
            refused,
            Err(ProtocolError::Muxer(MuxerResultCode::ConnectionRefused))
        ));

        let unknown = client(&emulator).await.connect_to_port(2, 9).await;
        assert!(matches!(
            unknown,
            Err(ProtocolError::Muxer(MuxerResultCode::BadDevice))
        ));
    }

    #[tokio::test]
    async fn test_listen_reports_attach_and_detach() {
        let emulator = MuxerEmulator::new().with_device(EmulatedDevice::new(1, "one"));
        let mut events = client(&emulator).await.listen().await.unwrap();

        match events.next_event().await.unwrap() {
            Some(DeviceEvent::Attached(device)) => assert_eq!(device.udid, "one"),
            other => panic!("expected initial attach, got {:?}", other),
        }

        emulator.attach(EmulatedDevice::new(2, "two")).await;
        emulator.detach(1).await;

        match events.next_event().await.unwrap() {
            Some(DeviceEvent::Attached(device)) => assert_eq!(device.udid, "two"),
            other => panic!("expected attach, got {:?}", other),
        }
        assert_eq!(
            events.next_event().await.unwrap(),
            Some(DeviceEvent::Detached { device_id: 1 })
        );
    }
}
