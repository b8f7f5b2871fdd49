//! Multiplexer Message Taxonomy
//!
//! Every message travels as a property list inside a type-8 multiplexer
//! frame; the semantic message type rides in the `MessageType` key.
//! Requests and responses are modelled as sum types and converted to and
//! from property-list dictionaries at the frame boundary.

use crate::device::Device;
use crate::error::MuxerResultCode;
use crate::{ProtocolError, Result};
use plist::{Dictionary, Value};

/// `kLibUSBMuxVersion` sent with every request
pub const LIBUSBMUX_VERSION: u64 = 3;

/// Requests a client sends to the multiplexer daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxerRequest {
    /// Enumerate attached devices
    ListDevices,
    /// Open a byte stream to `port` on a device
    Connect {
        /// Multiplexer device id
        device_id: u32,
        /// Device-side port in host order
        port: u16,
    },
    /// Turn the connection into an attach/detach notification stream
    Listen,
    /// Read the system BUID
    ReadBuid,
    /// Read the stored pairing record for a device
    ReadPairRecord {
        /// Device udid
        udid: String,
    },
    /// Store a pairing record for a device
    SavePairRecord {
        /// Device udid
        udid: String,
        /// Persisted record bytes
        data: Vec<u8>,
    },
    /// Remove the stored pairing record for a device
    DeletePairRecord {
        /// Device udid
        udid: String,
    },
}

/// Responses and notifications from the multiplexer daemon
#[derive(Debug, Clone, PartialEq)]
pub enum MuxerResponse {
    /// Outcome of a request
    Result(MuxerResultCode),
    /// A device attached (listen streams only)
    Attached(Device),
    /// A device detached (listen streams only)
    Detached {
        /// Multiplexer device id
        device_id: u32,
    },
    /// A device completed pairing (listen streams only)
    Paired {
        /// Multiplexer device id
        device_id: u32,
    },
    /// A bare property-list body (device list, pairing record, BUID)
    Plist(Dictionary),
}

fn integer(value: u64) -> Value {
    Value::Integer(value.into())
}

fn string_field<'a>(dict: &'a Dictionary, key: &str) -> Result<&'a str> {
    dict.get(key).and_then(Value::as_string).ok_or_else(|| {
        ProtocolError::MalformedFrame(format!("message without string field {}", key))
    })
}

fn device_id_field(dict: &Dictionary) -> Result<u32> {
    dict.get("DeviceID")
        .and_then(Value::as_unsigned_integer)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| ProtocolError::MalformedFrame("message without DeviceID".to_string()))
}

impl MuxerRequest {
    /// Value of the `MessageType` key
    pub fn message_type(&self) -> &'static str {
        match self {
            MuxerRequest::ListDevices => "ListDevices",
            MuxerRequest::Connect { .. } => "Connect",
            MuxerRequest::Listen => "Listen",
            MuxerRequest::ReadBuid => "ReadBUID",
            MuxerRequest::ReadPairRecord { .. } => "ReadPairRecord",
            MuxerRequest::SavePairRecord { .. } => "SavePairRecord",
            MuxerRequest::DeletePairRecord { .. } => "DeletePairRecord",
        }
    }

    /// Encode as a request body, identifying the client as `label`
    pub fn to_plist(&self, label: &str) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(
            "MessageType".to_string(),
            Value::String(self.message_type().to_string()),
        );
        dict.insert(
            "ClientVersionString".to_string(),
            Value::String(format!("{}-{}", label, env!("CARGO_PKG_VERSION"))),
        );
        dict.insert("ProgName".to_string(), Value::String(label.to_string()));
        dict.insert("kLibUSBMuxVersion".to_string(), integer(LIBUSBMUX_VERSION));

        match self {
            MuxerRequest::ListDevices | MuxerRequest::Listen | MuxerRequest::ReadBuid => {}
            MuxerRequest::Connect { device_id, port } => {
                dict.insert("DeviceID".to_string(), integer(u64::from(*device_id)));
                // The daemon expects the port in network byte order
                dict.insert("PortNumber".to_string(), integer(u64::from(port.to_be())));
            }
            MuxerRequest::ReadPairRecord { udid } | MuxerRequest::DeletePairRecord { udid } => {
                dict.insert("PairRecordID".to_string(), Value::String(udid.clone()));
            }
            MuxerRequest::SavePairRecord { udid, data } => {
                dict.insert("PairRecordID".to_string(), Value::String(udid.clone()));
                dict.insert("PairRecordData".to_string(), Value::Data(data.clone()));
            }
        }
        dict
    }

    /// Decode a request body (the daemon side of [`MuxerRequest::to_plist`])
    pub fn from_plist(dict: &Dictionary) -> Result<Self> {
        let pair_record_id = || string_field(dict, "PairRecordID").map(str::to_string);

        match string_field(dict, "MessageType")? {
            "ListDevices" => Ok(MuxerRequest::ListDevices),
            "Listen" => Ok(MuxerRequest::Listen),
            "ReadBUID" => Ok(MuxerRequest::ReadBuid),
            "Connect" => {
                let raw = dict
                    .get("PortNumber")
                    .and_then(Value::as_unsigned_integer)
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| {
                        ProtocolError::MalformedFrame("Connect without PortNumber".to_string())
                    })?;
                Ok(MuxerRequest::Connect {
                    device_id: device_id_field(dict)?,
                    port: u16::from_be(raw),
                })
            }
            "ReadPairRecord" => Ok(MuxerRequest::ReadPairRecord {
                udid: pair_record_id()?,
            }),
            "DeletePairRecord" => Ok(MuxerRequest::DeletePairRecord {
                udid: pair_record_id()?,
            }),
            "SavePairRecord" => {
                let data = dict
                    .get("PairRecordData")
                    .and_then(Value::as_data)
                    .ok_or_else(|| {
                        ProtocolError::MalformedFrame(
                            "SavePairRecord without PairRecordData".to_string(),
                        )
                    })?;
                Ok(MuxerRequest::SavePairRecord {
                    udid: pair_record_id()?,
                    data: data.to_vec(),
                })
            }
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown request type {}",
                other
            ))),
        }
    }
}

impl MuxerResponse {
    /// Decode a response or notification body
    pub fn from_plist(dict: Dictionary) -> Result<Self> {
        let message_type = match dict.get("MessageType") {
            None => return Ok(MuxerResponse::Plist(dict)),
            Some(value) => value.as_string().ok_or_else(|| {
                ProtocolError::MalformedFrame("MessageType is not a string".to_string())
            })?,
        };

        match message_type {
            "Result" => {
                let code = dict
                    .get("Number")
                    .and_then(Value::as_unsigned_integer)
                    .ok_or_else(|| {
                        ProtocolError::MalformedFrame("Result without Number".to_string())
                    })?;
                Ok(MuxerResponse::Result(MuxerResultCode::from_code(code)))
            }
            "Attached" => Ok(MuxerResponse::Attached(Device::from_plist(&dict)?)),
            "Detached" => Ok(MuxerResponse::Detached {
                device_id: device_id_field(&dict)?,
            }),
            "Paired" => Ok(MuxerResponse::Paired {
                device_id: device_id_field(&dict)?,
            }),
            other => Err(ProtocolError::UnexpectedResponse(format!(
                "unknown message type {}",
                other
            ))),
        }
    }

    /// Encode as a response body
    pub fn to_plist(&self) -> Dictionary {
        let mut dict = match self {
            MuxerResponse::Plist(body) => return body.clone(),
            MuxerResponse::Attached(device) => return device.to_plist(),
            _ => Dictionary::new(),
        };

        match self {
            MuxerResponse::Result(code) => {
                dict.insert("MessageType".to_string(), Value::String("Result".to_string()));
                dict.insert("Number".to_string(), integer(code.code()));
            }
            MuxerResponse::Detached { device_id } => {
                dict.insert(
                    "MessageType".to_string(),
                    Value::String("Detached".to_string()),
                );
                dict.insert("DeviceID".to_string(), integer(u64::from(*device_id)));
            }
            MuxerResponse::Paired { device_id } => {
                dict.insert("MessageType".to_string(), Value::String("Paired".to_string()));
                dict.insert("DeviceID".to_string(), integer(u64::from(*device_id)));
            }
            MuxerResponse::Plist(_) | MuxerResponse::Attached(_) => {}
        }
        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionType;

    #[test]
    fn test_request_carries_client_identity() {
        let dict = MuxerRequest::ListDevices.to_plist("test-host");
        assert_eq!(
            dict.get("MessageType").and_then(Value::as_string),
            Some("ListDevices")
        );
        assert_eq!(dict.get("ProgName").and_then(Value::as_string), Some("test-host"));
        assert_eq!(
            dict.get("kLibUSBMuxVersion")
                .and_then(Value::as_unsigned_integer),
            Some(3)
        );
        assert!(dict.contains_key("ClientVersionString"));
    }

    #[test]
    fn test_connect_port_is_network_order() {
        let request = MuxerRequest::Connect {
            device_id: 4,
            port: 62078,
        };
        let dict = request.to_plist("test-host");
        let raw = dict
            .get("PortNumber")
            .and_then(Value::as_unsigned_integer)
            .unwrap();
        assert_eq!(raw, u64::from(62078u16.to_be()));
        assert_eq!(MuxerRequest::from_plist(&dict).unwrap(), request);
    }

    #[test]
    fn test_requests_decode() {
        for request in [
            MuxerRequest::ListDevices,
            MuxerRequest::Listen,
            MuxerRequest::ReadBuid,
            MuxerRequest::ReadPairRecord {
                udid: "abc".to_string(),
            },
            MuxerRequest::DeletePairRecord {
                udid: "abc".to_string(),
            },
            MuxerRequest::SavePairRecord {
                udid: "abc".to_string(),
                data: vec![1, 2, 3],
            },
        ] {
            let decoded = MuxerRequest::from_plist(&request.to_plist("test-host")).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_unknown_request_is_malformed() {
        let mut dict = Dictionary::new();
        dict.insert("MessageType".to_string(), Value::String("Reboot".to_string()));
        assert!(matches!(
            MuxerRequest::from_plist(&dict),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_responses_decode() {
        let device = Device::new(7, "udid-7", ConnectionType::Usb);
        for response in [
            MuxerResponse::Result(MuxerResultCode::BadDevice),
            MuxerResponse::Attached(device),
            MuxerResponse::Detached { device_id: 7 },
            MuxerResponse::Paired { device_id: 7 },
        ] {
            let decoded = MuxerResponse::from_plist(response.to_plist()).unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn test_body_without_message_type_is_plist() {
        let mut dict = Dictionary::new();
        dict.insert("BUID".to_string(), Value::String("1234".to_string()));
        assert_eq!(
            MuxerResponse::from_plist(dict.clone()).unwrap(),
            MuxerResponse::Plist(dict)
        );
    }
}
