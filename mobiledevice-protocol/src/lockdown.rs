//! Session-Management Service Client
//!
//! Every device runs a session-management service on port 62078 that
//! authenticates hosts and hands out per-service ports. Its vocabulary is a
//! fixed set of property-list requests, each carrying `Label` and
//! `Request`:
//!
//! - `QueryType` → `{Type}`
//! - `StartSession {HostID, SystemBUID, ProtocolVersion}` → `{SessionID, EnableSessionSSL}`
//! - `StartService {Service, EscrowBag?}` → `{Service, Port, EnableServiceSSL}`
//! - `StopSession {SessionID}`
//! - `GetValue {Domain?, Key?}` → `{Value}`
//!
//! A response carrying an `Error` key is a negative result and surfaces as
//! [`ProtocolError::Service`]; the channel stays usable.
//!
//! When the device asks for it, the session runs over TLS: the channel is
//! upgraded right after `StartSession` and downgraded again after
//! `StopSession`.

use crate::pairing::PairingRecord;
use crate::plist_client::PropertyListClient;
use crate::transport::TlsState;
use crate::{ProtocolError, Result};
use plist::{Dictionary, Value};
use tracing::{debug, info, warn};

/// Device-side port of the session-management service
pub const LOCKDOWN_PORT: u16 = 62078;

/// Value of `Type` in the `QueryType` response
pub const LOCKDOWN_SERVICE_TYPE: &str = "com.apple.mobile.lockdown";

/// `ProtocolVersion` sent with `StartSession`
pub const SESSION_PROTOCOL_VERSION: &str = "2";

/// Outcome of `StartSession`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Device-assigned session id
    pub session_id: String,
    /// Whether the session runs over TLS
    pub enable_session_ssl: bool,
}

/// Where a started service listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service name as echoed by the device
    pub service: String,
    /// Device-side port, reached through the multiplexer
    pub port: u16,
    /// Whether the service channel must be TLS-upgraded before use
    pub enable_service_ssl: bool,
}

/// Client for the session-management service
#[derive(Debug)]
pub struct LockdownClient {
    plist: PropertyListClient,
    label: String,
    session_id: Option<String>,
}

fn string(value: &str) -> Value {
    Value::String(value.to_string())
}

impl LockdownClient {
    /// Talk to the service over `plist`, identifying as `label`
    pub fn new(plist: PropertyListClient, label: impl Into<String>) -> Self {
        Self {
            plist,
            label: label.into(),
            session_id: None,
        }
    }

    /// Id of the running session, if any
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Encryption state of the underlying channel
    pub fn state(&self) -> TlsState {
        self.plist.state()
    }

    /// Give back the underlying client
    pub fn into_inner(self) -> PropertyListClient {
        self.plist
    }

    fn request_body(&self, request: &str) -> Dictionary {
        let mut body = Dictionary::new();
        body.insert("Label".to_string(), string(&self.label));
        body.insert("Request".to_string(), string(request));
        body
    }

    async fn call(&mut self, request: &str, body: Dictionary) -> Result<Dictionary> {
        let response = self.plist.request(&body).await?;

        if let Some(error) = response.get("Error") {
            let error = error
                .as_string()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", error));
            debug!("{} failed: {}", request, error);
            return Err(ProtocolError::Service {
                request: request.to_string(),
                error,
            });
        }

        match response.get("Request").and_then(Value::as_string) {
            Some(echo) if echo != request => {
                warn!("{} answered as {}", request, echo);
            }
            _ => {}
        }
        Ok(response)
    }

    /// Ask the service what it is
    pub async fn query_type(&mut self) -> Result<String> {
        let body = self.request_body("QueryType");
        let response = self.call("QueryType", body).await?;
        response
            .get("Type")
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::UnexpectedResponse("QueryType without Type".to_string()))
    }

    /// Start an authenticated session with the host identity in `record`
    ///
    /// Upgrades the channel to TLS when the device sets `EnableSessionSSL`.
    pub async fn start_session(&mut self, record: &PairingRecord) -> Result<SessionInfo> {
        let mut body = self.request_body("StartSession");
        body.insert("HostID".to_string(), string(&record.host_id));
        body.insert("SystemBUID".to_string(), string(&record.system_buid));
        body.insert("ProtocolVersion".to_string(), string(SESSION_PROTOCOL_VERSION));

        let response = self.call("StartSession", body).await?;
        let session_id = response
            .get("SessionID")
            .and_then(Value::as_string)
            .ok_or_else(|| {
                ProtocolError::UnexpectedResponse("StartSession without SessionID".to_string())
            })?
            .to_string();
        let enable_session_ssl = response
            .get("EnableSessionSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        self.session_id = Some(session_id.clone());
        if enable_session_ssl {
            self.plist.enable_tls(record).await?;
        }

        info!(
            "Started session {} ({})",
            session_id,
            if enable_session_ssl { "encrypted" } else { "plaintext" }
        );
        Ok(SessionInfo {
            session_id,
            enable_session_ssl,
        })
    }

    /// Ask the device to start `service`
    pub async fn start_service(
        &mut self,
        service: &str,
        escrow_bag: Option<&[u8]>,
    ) -> Result<ServiceDescriptor> {
        let mut body = self.request_body("StartService");
        body.insert("Service".to_string(), string(service));
        if let Some(bag) = escrow_bag {
            body.insert("EscrowBag".to_string(), Value::Data(bag.to_vec()));
        }

        let response = self.call("StartService", body).await?;
        let port = response
            .get("Port")
            .and_then(Value::as_unsigned_integer)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                ProtocolError::UnexpectedResponse(format!("StartService {} without Port", service))
            })?;
        let enable_service_ssl = response
            .get("EnableServiceSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        debug!("Service {} listens on port {}", service, port);
        Ok(ServiceDescriptor {
            service: response
                .get("Service")
                .and_then(Value::as_string)
                .unwrap_or(service)
                .to_string(),
            port,
            enable_service_ssl,
        })
    }

    /// End the running session, downgrading the channel if it was encrypted
    pub async fn stop_session(&mut self) -> Result<()> {
        let Some(session_id) = self.session_id.take() else {
            debug!("No session to stop");
            return Ok(());
        };

        let mut body = self.request_body("StopSession");
        body.insert("SessionID".to_string(), string(&session_id));
        self.call("StopSession", body).await?;

        if self.plist.is_encrypted() {
            self.plist.disable_tls().await?;
        }
        info!("Stopped session {}", session_id);
        Ok(())
    }

    /// Read a device value
    pub async fn get_value(&mut self, domain: Option<&str>, key: Option<&str>) -> Result<Value> {
        let mut body = self.request_body("GetValue");
        if let Some(domain) = domain {
            body.insert("Domain".to_string(), string(domain));
        }
        if let Some(key) = key {
            body.insert("Key".to_string(), string(key));
        }

        let mut response = self.call("GetValue", body).await?;
        response
            .remove("Value")
            .ok_or_else(|| ProtocolError::UnexpectedResponse("GetValue without Value".to_string()))
    }

    /// Close the channel
    pub async fn close(&mut self) {
        self.session_id = None;
        self.plist.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted device: checks each request and answers with the given body
    fn scripted_device(
        script: Vec<(&'static str, Dictionary)>,
    ) -> (LockdownClient, tokio::task::JoinHandle<Vec<Dictionary>>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = LockdownClient::new(PropertyListClient::new(Box::new(a)), "test-host");

        let device = tokio::spawn(async move {
            let mut peer = PropertyListClient::new(Box::new(b));
            let mut seen = Vec::new();
            for (expected, reply) in script {
                let request = peer
                    .read_message()
                    .await
                    .unwrap()
                    .and_then(Value::into_dictionary)
                    .unwrap();
                assert_eq!(
                    request.get("Request").and_then(Value::as_string),
                    Some(expected)
                );
                seen.push(request);
                peer.write_message(&reply).await.unwrap();
            }
            seen
        });

        (client, device)
    }

    fn reply(entries: &[(&str, Value)]) -> Dictionary {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn record() -> PairingRecord {
        PairingRecord {
            host_id: "HOST-1".to_string(),
            system_buid: "BUID-1".to_string(),
            ..PairingRecord::default()
        }
    }

    #[tokio::test]
    async fn test_plaintext_session_and_service() {
        let (mut client, device) = scripted_device(vec![
            ("QueryType", reply(&[("Type", string(LOCKDOWN_SERVICE_TYPE))])),
            (
                "StartSession",
                reply(&[
                    ("SessionID", string("S-1")),
                    ("EnableSessionSSL", Value::Boolean(false)),
                ]),
            ),
            (
                "StartService",
                reply(&[
                    ("Service", string("com.example.echo")),
                    ("Port", Value::Integer(5000u64.into())),
                    ("EnableServiceSSL", Value::Boolean(true)),
                ]),
            ),
            ("StopSession", reply(&[("Request", string("StopSession"))])),
        ]);

        assert_eq!(client.query_type().await.unwrap(), LOCKDOWN_SERVICE_TYPE);
        let session = client.start_session(&record()).await.unwrap();
        assert_eq!(session.session_id, "S-1");
        assert_eq!(client.session_id(), Some("S-1"));

        let descriptor = client
            .start_service("com.example.echo", Some(b"bag"))
            .await
            .unwrap();
        assert_eq!(
            descriptor,
            ServiceDescriptor {
                service: "com.example.echo".to_string(),
                port: 5000,
                enable_service_ssl: true,
            }
        );

        client.stop_session().await.unwrap();
        assert_eq!(client.session_id(), None);
        assert_eq!(client.state(), TlsState::Plaintext);

        let seen = device.await.unwrap();
        assert_eq!(seen[1].get("HostID").and_then(Value::as_string), Some("HOST-1"));
        assert_eq!(seen[1].get("ProtocolVersion").and_then(Value::as_string), Some("2"));
        assert_eq!(seen[2].get("EscrowBag").and_then(Value::as_data), Some(&b"bag"[..]));
        assert_eq!(seen[3].get("SessionID").and_then(Value::as_string), Some("S-1"));
        assert!(seen.iter().all(|r| r.get("Label").and_then(Value::as_string) == Some("test-host")));
    }

    #[tokio::test]
    async fn test_error_key_is_service_error() {
        let (mut client, _device) = scripted_device(vec![
            ("StartService", reply(&[("Error", string("InvalidService"))])),
            ("GetValue", reply(&[("Value", string("iPhone"))])),
        ]);

        match client.start_service("com.example.missing", None).await {
            Err(ProtocolError::Service { request, error }) => {
                assert_eq!(request, "StartService");
                assert_eq!(error, "InvalidService");
            }
            other => panic!("expected service error, got {:?}", other),
        }

        // The channel is still usable after a negative result
        let value = client.get_value(None, Some("DeviceClass")).await.unwrap();
        assert_eq!(value.as_string(), Some("iPhone"));
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let (mut client, _device) = scripted_device(Vec::new());
        client.stop_session().await.unwrap();
    }
}
