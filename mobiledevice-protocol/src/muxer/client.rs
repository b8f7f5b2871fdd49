//! Multiplexer Protocol Client
//!
//! Request/response client over one persistent socket to the multiplexer
//! daemon. Requests are written as whole frames under a lock and answered
//! strictly in arrival order; the frame tag is only checked for logging.
//!
//! Two requests change what the socket is:
//!
//! - `Connect` hands the socket over to the device service. The client is
//!   consumed and the caller receives the raw channel.
//! - `Listen` turns the socket into a notification stream. The client is
//!   consumed and the caller receives [`DeviceEvents`].

use super::events::DeviceEvents;
use super::locator::{DefaultLocator, MuxerLocator};
use super::message::{MuxerRequest, MuxerResponse};
use crate::codec::{self, MessageType, MUXER_HEADER_SIZE, MUXER_PLIST_VERSION};
use crate::config::TransportConfig;
use crate::device::Device;
use crate::error::MuxerResultCode;
use crate::transport::{guarded, read_full, BoxChannel};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use plist::{Dictionary, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Write one property-list body as a multiplexer frame
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tag: u32,
    body: &Dictionary,
) -> Result<()> {
    let mut payload = Vec::new();
    plist::to_writer_xml(&mut payload, body)?;
    let frame = codec::encode_muxer_frame(MUXER_PLIST_VERSION, MessageType::Plist, tag, &payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one multiplexer frame carrying a property-list body
///
/// Returns `None` on a clean end-of-stream before the header.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<(u32, Dictionary)>> {
    let mut header = [0u8; MUXER_HEADER_SIZE];
    let n = read_full(reader, &mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < MUXER_HEADER_SIZE {
        return Err(ProtocolError::truncated(MUXER_HEADER_SIZE, n));
    }

    let header = codec::decode_muxer_header(&header)?;
    if header.version != MUXER_PLIST_VERSION || header.kind() != Some(MessageType::Plist) {
        return Err(ProtocolError::MalformedFrame(format!(
            "unsupported frame version {} type {}",
            header.version, header.message_type
        )));
    }

    let len = header.payload_len()?;
    if len > max_payload {
        return Err(ProtocolError::FrameSizeExceeded(len, max_payload));
    }
    let mut payload = vec![0u8; len];
    let got = read_full(reader, &mut payload).await?;
    if got < len {
        return Err(ProtocolError::truncated(len, got));
    }

    let body = plist::from_bytes::<Value>(&payload)
        .ok()
        .and_then(Value::into_dictionary)
        .ok_or_else(|| {
            ProtocolError::MalformedFrame("frame payload is not a property-list dictionary".into())
        })?;
    Ok(Some((header.tag, body)))
}

/// Socket state guarded by the client's lock
struct Connection {
    channel: Option<BoxChannel>,
    next_tag: u32,
    in_flight: bool,
}

impl Connection {
    fn begin(&mut self) -> Result<&mut BoxChannel> {
        if self.in_flight {
            warn!("Previous multiplexer operation was abandoned, closing connection");
            self.in_flight = false;
            self.channel = None;
            return Err(ProtocolError::Closed);
        }
        if self.channel.is_none() {
            return Err(ProtocolError::Closed);
        }
        self.in_flight = true;
        self.channel.as_mut().ok_or(ProtocolError::Closed)
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.in_flight = false;
        if let Err(e) = &result {
            if e.is_channel_fatal() {
                debug!("Closing multiplexer connection: {}", e);
                self.channel = None;
            }
        }
        result
    }

    fn take_tag(&mut self) -> u32 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.checked_add(1).unwrap_or(1);
        tag
    }
}

/// Client for the multiplexer daemon
pub struct MuxerClient {
    connection: Mutex<Connection>,
    label: String,
    max_frame_size: usize,
    io_timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for MuxerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxerClient")
            .field("label", &self.label)
            .field("max_frame_size", &self.max_frame_size)
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

/// Result of a `Connect` request that the daemon answered
pub enum ConnectOutcome {
    /// The socket now belongs to the device service
    Connected(BoxChannel),
    /// The daemon refused; the client is still usable
    Refused {
        /// Result code from the daemon
        code: MuxerResultCode,
        /// The client, handed back for further requests
        client: MuxerClient,
    },
}

impl fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOutcome::Connected(_) => f.write_str("Connected"),
            ConnectOutcome::Refused { code, .. } => write!(f, "Refused({})", code),
        }
    }
}

fn expect_ok(request: &str, response: MuxerResponse) -> Result<()> {
    match response {
        MuxerResponse::Result(code) if code.is_ok() => Ok(()),
        MuxerResponse::Result(code) => {
            debug!("{} refused: {}", request, code);
            Err(ProtocolError::Muxer(code))
        }
        other => Err(unexpected(request, &other)),
    }
}

fn unexpected(request: &str, response: &MuxerResponse) -> ProtocolError {
    ProtocolError::UnexpectedResponse(format!("{} answered with {:?}", request, response))
}

impl MuxerClient {
    /// Wrap an open daemon socket
    pub fn new(channel: BoxChannel) -> Self {
        Self::with_config(channel, &TransportConfig::default())
    }

    /// Wrap an open daemon socket using `config` for label and limits
    pub fn with_config(channel: BoxChannel, config: &TransportConfig) -> Self {
        Self {
            connection: Mutex::new(Connection {
                channel: Some(channel),
                next_tag: 1,
                in_flight: false,
            }),
            label: config.label.clone(),
            max_frame_size: config.max_frame_size,
            io_timeout: config.io_timeout(),
            cancel: None,
        }
    }

    /// Race every operation against `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Locate the daemon and connect, `None` if it is not present
    pub async fn connect(
        locator: &dyn MuxerLocator,
        config: &TransportConfig,
    ) -> Result<Option<Self>> {
        Ok(locator
            .locate()
            .await?
            .map(|channel| Self::with_config(channel, config)))
    }

    /// Label sent as `ProgName`
    pub fn label(&self) -> &str {
        &self.label
    }

    async fn send_locked(&self, conn: &mut Connection, request: &MuxerRequest) -> Result<u32> {
        let tag = conn.take_tag();
        let body = request.to_plist(&self.label);

        let channel = conn.begin()?;
        let result = guarded(
            self.cancel.as_ref(),
            self.io_timeout,
            write_frame(channel, tag, &body),
        )
        .await;
        conn.finish(result)?;

        debug!("Sent {} (tag {})", request.message_type(), tag);
        Ok(tag)
    }

    async fn receive_locked(&self, conn: &mut Connection) -> Result<Option<(u32, MuxerResponse)>> {
        let max = self.max_frame_size;
        let channel = conn.begin()?;
        let result = guarded(self.cancel.as_ref(), self.io_timeout, async {
            match read_frame(channel, max).await? {
                Some((tag, body)) => Ok(Some((tag, MuxerResponse::from_plist(body)?))),
                None => Ok(None),
            }
        })
        .await;
        conn.finish(result)
    }

    /// Send one request frame, returning its tag
    ///
    /// Concurrent senders are serialized; frames never interleave.
    pub async fn send(&self, request: &MuxerRequest) -> Result<u32> {
        let mut conn = self.connection.lock().await;
        self.send_locked(&mut conn, request).await
    }

    /// Read the next frame, `None` if the daemon closed the socket
    pub async fn receive(&self) -> Result<Option<(u32, MuxerResponse)>> {
        let mut conn = self.connection.lock().await;
        self.receive_locked(&mut conn).await
    }

    /// Send `request` and read the next frame as its response
    pub async fn request(&self, request: &MuxerRequest) -> Result<MuxerResponse> {
        let mut conn = self.connection.lock().await;
        let tag = self.send_locked(&mut conn, request).await?;

        match self.receive_locked(&mut conn).await? {
            Some((reply_tag, response)) => {
                if reply_tag != tag {
                    warn!(
                        "{} response tag {} does not match request tag {}",
                        request.message_type(),
                        reply_tag,
                        tag
                    );
                }
                Ok(response)
            }
            None => {
                conn.channel = None;
                Err(ProtocolError::Closed)
            }
        }
    }

    /// Enumerate attached devices
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let response = self.request(&MuxerRequest::ListDevices).await?;
        let body = match response {
            MuxerResponse::Plist(body) => body,
            MuxerResponse::Result(code) if !code.is_ok() => return Err(ProtocolError::Muxer(code)),
            other => return Err(unexpected("ListDevices", &other)),
        };

        let entries = body
            .get("DeviceList")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ProtocolError::UnexpectedResponse("ListDevices without DeviceList".to_string())
            })?;

        let mut devices = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.as_dictionary().map(Device::from_plist) {
                Some(Ok(device)) => devices.push(device),
                Some(Err(e)) => warn!("Skipping unreadable device entry: {}", e),
                None => warn!("Skipping non-dictionary device entry"),
            }
        }
        debug!("Multiplexer reports {} device(s)", devices.len());
        Ok(devices)
    }

    /// Read the system BUID
    pub async fn read_buid(&self) -> Result<String> {
        match self.request(&MuxerRequest::ReadBuid).await? {
            MuxerResponse::Plist(body) => body
                .get("BUID")
                .and_then(Value::as_string)
                .map(str::to_string)
                .ok_or_else(|| {
                    ProtocolError::UnexpectedResponse("ReadBUID without BUID".to_string())
                }),
            MuxerResponse::Result(code) if !code.is_ok() => Err(ProtocolError::Muxer(code)),
            other => Err(unexpected("ReadBUID", &other)),
        }
    }

    /// Read the stored pairing record bytes for `udid`, `None` if there is none
    pub async fn read_pair_record(&self, udid: &str) -> Result<Option<Vec<u8>>> {
        let request = MuxerRequest::ReadPairRecord {
            udid: udid.to_string(),
        };
        match self.request(&request).await? {
            MuxerResponse::Plist(body) => body
                .get("PairRecordData")
                .and_then(Value::as_data)
                .map(|data| Some(data.to_vec()))
                .ok_or_else(|| {
                    ProtocolError::UnexpectedResponse(
                        "ReadPairRecord without PairRecordData".to_string(),
                    )
                }),
            MuxerResponse::Result(MuxerResultCode::BadDevice) => {
                debug!("No pairing record stored for {}", udid);
                Ok(None)
            }
            MuxerResponse::Result(code) if !code.is_ok() => Err(ProtocolError::Muxer(code)),
            other => Err(unexpected("ReadPairRecord", &other)),
        }
    }

    /// Store pairing record bytes for `udid`
    pub async fn save_pair_record(&self, udid: &str, data: &[u8]) -> Result<()> {
        let request = MuxerRequest::SavePairRecord {
            udid: udid.to_string(),
            data: data.to_vec(),
        };
        expect_ok("SavePairRecord", self.request(&request).await?)?;
        info!("Saved pairing record for {}", udid);
        Ok(())
    }

    /// Delete the stored pairing record for `udid`
    pub async fn delete_pair_record(&self, udid: &str) -> Result<()> {
        let request = MuxerRequest::DeletePairRecord {
            udid: udid.to_string(),
        };
        expect_ok("DeletePairRecord", self.request(&request).await?)
    }

    fn into_channel(self) -> Result<BoxChannel> {
        self.connection
            .into_inner()
            .channel
            .ok_or(ProtocolError::Closed)
    }

    /// Ask the daemon for a stream to `port` on a device
    ///
    /// On success the socket is handed over as the service channel. A
    /// refusal hands the client back together with the daemon's code.
    pub async fn try_connect(self, device_id: u32, port: u16) -> Result<ConnectOutcome> {
        let response = self
            .request(&MuxerRequest::Connect { device_id, port })
            .await?;

        match response {
            MuxerResponse::Result(code) if code.is_ok() => {
                info!("Connected to port {} on device #{}", port, device_id);
                Ok(ConnectOutcome::Connected(self.into_channel()?))
            }
            MuxerResponse::Result(code) => {
                debug!(
                    "Connect to port {} on device #{} refused: {}",
                    port, device_id, code
                );
                Ok(ConnectOutcome::Refused { code, client: self })
            }
            other => Err(unexpected("Connect", &other)),
        }
    }

    /// Ask the daemon for a stream to `port` on a device
    ///
    /// Consumes the client: after a successful `Connect` the socket carries
    /// the service's own protocol and no multiplexer frame may follow.
    pub async fn connect_to_port(self, device_id: u32, port: u16) -> Result<BoxChannel> {
        match self.try_connect(device_id, port).await? {
            ConnectOutcome::Connected(channel) => Ok(channel),
            ConnectOutcome::Refused { code, .. } => Err(ProtocolError::Muxer(code)),
        }
    }

    /// Subscribe to attach/detach notifications
    ///
    /// Consumes the client: the socket becomes a notification stream.
    pub async fn listen(self) -> Result<DeviceEvents> {
        expect_ok("Listen", self.request(&MuxerRequest::Listen).await?)?;
        let max = self.max_frame_size;
        let cancel = self.cancel.clone();
        let channel = self.into_channel()?;
        info!("Listening for device notifications");
        Ok(DeviceEvents::new(channel, max, cancel))
    }
}

/// Source of fresh multiplexer connections
#[async_trait]
pub trait MuxerConnector: Send + Sync {
    /// Open a new client, `None` if the daemon is not present
    async fn connect(&self) -> Result<Option<MuxerClient>>;

    /// Open a new client, failing with `MuxerUnavailable` if the daemon is absent
    async fn open(&self) -> Result<MuxerClient> {
        self.connect()
            .await?
            .ok_or(ProtocolError::MuxerUnavailable)
    }
}

/// Connector that opens clients through a [`MuxerLocator`]
pub struct LocatorConnector {
    locator: Arc<dyn MuxerLocator>,
    config: TransportConfig,
}

impl LocatorConnector {
    /// Connect through `locator` using `config`
    pub fn new(locator: Arc<dyn MuxerLocator>, config: TransportConfig) -> Self {
        Self { locator, config }
    }

    /// Connect to the daemon resolved from the environment and `config`
    pub fn from_config(config: TransportConfig) -> Result<Self> {
        let locator = DefaultLocator::from_config(&config)?;
        Ok(Self::new(Arc::new(locator), config))
    }

    /// Configuration applied to every client
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl MuxerConnector for LocatorConnector {
    async fn connect(&self) -> Result<Option<MuxerClient>> {
        MuxerClient::connect(self.locator.as_ref(), &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Minimal scripted daemon: answers each request with the next reply
    async fn scripted_daemon(mut socket: DuplexStream, replies: Vec<MuxerResponse>) -> Vec<MuxerRequest> {
        let mut seen = Vec::new();
        for reply in replies {
            let (tag, body) = read_frame(&mut socket, 1 << 20).await.unwrap().unwrap();
            seen.push(MuxerRequest::from_plist(&body).unwrap());
            write_frame(&mut socket, tag, &reply.to_plist()).await.unwrap();
        }
        seen
    }

    fn client_pair() -> (MuxerClient, DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (MuxerClient::new(Box::new(a)), b)
    }

    #[tokio::test]
    async fn test_tags_start_at_one_and_increase() {
        let (client, mut daemon) = client_pair();
        assert_eq!(client.send(&MuxerRequest::ListDevices).await.unwrap(), 1);
        assert_eq!(client.send(&MuxerRequest::ReadBuid).await.unwrap(), 2);

        let (first, _) = read_frame(&mut daemon, 1 << 20).await.unwrap().unwrap();
        let (second, _) = read_frame(&mut daemon, 1 << 20).await.unwrap().unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn test_concurrent_senders_never_interleave() {
        // A tiny pipe forces every frame to be written in several pieces
        let (a, mut daemon) = tokio::io::duplex(8);
        let client = Arc::new(MuxerClient::new(Box::new(a)));

        let senders: Vec<_> = (0..16u8)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    let request = MuxerRequest::SavePairRecord {
                        udid: format!("device-{}", i),
                        data: vec![i; 256],
                    };
                    client.send(&request).await.unwrap()
                })
            })
            .collect();

        let mut tags = Vec::new();
        for _ in 0..16 {
            let (tag, body) = read_frame(&mut daemon, 1 << 20).await.unwrap().unwrap();
            match MuxerRequest::from_plist(&body).unwrap() {
                MuxerRequest::SavePairRecord { udid, data } => {
                    let i: u8 = udid.trim_start_matches("device-").parse().unwrap();
                    assert_eq!(data, vec![i; 256]);
                }
                other => panic!("unexpected request {:?}", other),
            }
            tags.push(tag);
        }
        for sender in senders {
            sender.await.unwrap();
        }

        tags.sort_unstable();
        assert_eq!(tags, (1..=16).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_negative_result_keeps_connection() {
        let (client, daemon) = client_pair();
        let server = tokio::spawn(scripted_daemon(
            daemon,
            vec![
                MuxerResponse::Result(MuxerResultCode::BadVersion),
                MuxerResponse::Result(MuxerResultCode::Ok),
            ],
        ));

        let error = client.save_pair_record("abc", b"data").await.unwrap_err();
        assert!(matches!(
            error,
            ProtocolError::Muxer(MuxerResultCode::BadVersion)
        ));
        client.delete_pair_record("abc").await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(
            seen[1],
            MuxerRequest::DeletePairRecord {
                udid: "abc".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_pair_record_is_none() {
        let (client, daemon) = client_pair();
        tokio::spawn(scripted_daemon(
            daemon,
            vec![MuxerResponse::Result(MuxerResultCode::BadDevice)],
        ));
        assert!(client.read_pair_record("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_hands_over_socket() {
        let (client, daemon) = client_pair();
        let server = tokio::spawn(async move {
            let mut daemon = daemon;
            let (tag, body) = read_frame(&mut daemon, 1 << 20).await.unwrap().unwrap();
            let request = MuxerRequest::from_plist(&body).unwrap();
            write_frame(
                &mut daemon,
                tag,
                &MuxerResponse::Result(MuxerResultCode::Ok).to_plist(),
            )
            .await
            .unwrap();
            daemon.write_all(b"raw service bytes").await.unwrap();
            request
        });

        let mut channel = client.connect_to_port(3, 62078).await.unwrap();
        let mut buf = [0u8; 17];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw service bytes");
        assert_eq!(
            server.await.unwrap(),
            MuxerRequest::Connect {
                device_id: 3,
                port: 62078
            }
        );
    }

    #[tokio::test]
    async fn test_refused_connect_returns_client() {
        let (client, daemon) = client_pair();
        tokio::spawn(scripted_daemon(
            daemon,
            vec![
                MuxerResponse::Result(MuxerResultCode::ConnectionRefused),
                MuxerResponse::Result(MuxerResultCode::Ok),
            ],
        ));

        match client.try_connect(1, 5000).await.unwrap() {
            ConnectOutcome::Refused { code, client } => {
                assert_eq!(code, MuxerResultCode::ConnectionRefused);
                client.delete_pair_record("x").await.unwrap();
            }
            ConnectOutcome::Connected(_) => panic!("connect should be refused"),
        }
    }

    #[tokio::test]
    async fn test_daemon_hangup_closes_client() {
        let (client, daemon) = client_pair();
        drop(daemon);

        assert!(client.list_devices().await.is_err());
        assert!(matches!(
            client.list_devices().await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_bad_frame_version_is_malformed() {
        let (client, mut daemon) = client_pair();
        tokio::spawn(async move {
            let _ = read_frame(&mut daemon, 1 << 20).await;
            let frame = codec::encode_muxer_frame(0, MessageType::Result, 1, &[0u8; 4]).unwrap();
            daemon.write_all(&frame).await.unwrap();
            std::future::pending::<()>().await;
        });

        assert!(matches!(
            client.read_buid().await,
            Err(ProtocolError::MalformedFrame(_))
        ));
    }
}
