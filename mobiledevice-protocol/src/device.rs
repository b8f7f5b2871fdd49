//! Attached Device Model
//!
//! A [`Device`] is what the multiplexer reports for one attached unit: the
//! multiplexer-local device id, the stable udid, and how it is connected.
//! Devices are immutable snapshots; a fresh enumeration replaces them.
//!
//! [`DeviceRegistry`] keeps the set of attached devices current by applying
//! attach/detach notifications from [`crate::muxer::DeviceEvents`].

use crate::muxer::DeviceEvent;
use crate::{ProtocolError, Result};
use plist::{Dictionary, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// How a device is attached to the host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Attached over USB
    Usb,
    /// Reachable over the network
    Network,
    /// Reported by the daemon with an unrecognised connection type
    Other(String),
}

impl ConnectionType {
    /// Parse the multiplexer's `ConnectionType` property
    pub fn from_wire(value: &str) -> Self {
        match value {
            "USB" => ConnectionType::Usb,
            "Network" => ConnectionType::Network,
            other => ConnectionType::Other(other.to_string()),
        }
    }

    /// Value used on the wire
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionType::Usb => "USB",
            ConnectionType::Network => "Network",
            ConnectionType::Other(other) => other,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device reported by the multiplexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Multiplexer-local device id, used in `Connect` requests
    pub device_id: u32,
    /// Stable unique device identifier
    pub udid: String,
    /// Transport the device is attached over
    pub connection_type: ConnectionType,
    /// USB product id, when reported
    pub product_id: Option<u32>,
    /// USB location id, when reported
    pub location_id: Option<u32>,
}

impl Device {
    /// Create a device with only the required fields set
    pub fn new(device_id: u32, udid: impl Into<String>, connection_type: ConnectionType) -> Self {
        Self {
            device_id,
            udid: udid.into(),
            connection_type,
            product_id: None,
            location_id: None,
        }
    }

    /// Whether this device's udid equals `udid`, ignoring ASCII case
    pub fn matches_udid(&self, udid: &str) -> bool {
        self.udid.eq_ignore_ascii_case(udid)
    }

    /// Parse an `Attached` message body (or a `DeviceList` entry)
    ///
    /// The body carries `DeviceID` and a `Properties` dictionary with
    /// `SerialNumber` (the udid) and `ConnectionType`.
    pub fn from_plist(body: &Dictionary) -> Result<Self> {
        let properties = body
            .get("Properties")
            .and_then(Value::as_dictionary)
            .ok_or_else(|| {
                ProtocolError::UnexpectedResponse("device entry without Properties".to_string())
            })?;

        let device_id = body
            .get("DeviceID")
            .or_else(|| properties.get("DeviceID"))
            .and_then(Value::as_unsigned_integer)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| {
                ProtocolError::UnexpectedResponse("device entry without DeviceID".to_string())
            })?;

        let udid = properties
            .get("SerialNumber")
            .and_then(Value::as_string)
            .ok_or_else(|| {
                ProtocolError::UnexpectedResponse(format!(
                    "device {} without SerialNumber",
                    device_id
                ))
            })?;

        let connection_type = properties
            .get("ConnectionType")
            .and_then(Value::as_string)
            .map(ConnectionType::from_wire)
            .unwrap_or(ConnectionType::Usb);

        let optional_u32 = |key: &str| {
            properties
                .get(key)
                .and_then(Value::as_unsigned_integer)
                .and_then(|v| u32::try_from(v).ok())
        };

        Ok(Self {
            device_id,
            udid: udid.to_string(),
            connection_type,
            product_id: optional_u32("ProductID"),
            location_id: optional_u32("LocationID"),
        })
    }

    /// Encode as an `Attached` message body
    pub fn to_plist(&self) -> Dictionary {
        let mut properties = Dictionary::new();
        properties.insert(
            "ConnectionType".to_string(),
            Value::String(self.connection_type.as_str().to_string()),
        );
        properties.insert(
            "DeviceID".to_string(),
            Value::Integer(u64::from(self.device_id).into()),
        );
        properties.insert("SerialNumber".to_string(), Value::String(self.udid.clone()));
        if let Some(product_id) = self.product_id {
            properties.insert(
                "ProductID".to_string(),
                Value::Integer(u64::from(product_id).into()),
            );
        }
        if let Some(location_id) = self.location_id {
            properties.insert(
                "LocationID".to_string(),
                Value::Integer(u64::from(location_id).into()),
            );
        }

        let mut body = Dictionary::new();
        body.insert(
            "DeviceID".to_string(),
            Value::Integer(u64::from(self.device_id).into()),
        );
        body.insert("MessageType".to_string(), Value::String("Attached".to_string()));
        body.insert("Properties".to_string(), Value::Dictionary(properties));
        body
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{}, {})", self.udid, self.device_id, self.connection_type)
    }
}

/// Live view of attached devices, keyed by multiplexer device id
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<u32, Device>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from a one-shot enumeration
    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.device_id, d)).collect(),
        }
    }

    /// Apply an attach/detach/paired notification
    pub fn apply(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Attached(device) => {
                info!("Device attached: {}", device);
                self.devices.insert(device.device_id, device.clone());
            }
            DeviceEvent::Detached { device_id } => match self.devices.remove(device_id) {
                Some(device) => info!("Device detached: {}", device),
                None => warn!("Detach notification for unknown device #{}", device_id),
            },
            DeviceEvent::Paired { device_id } => {
                debug!("Device #{} paired", device_id);
            }
        }
    }

    /// Look up a device by multiplexer id
    pub fn get(&self, device_id: u32) -> Option<&Device> {
        self.devices.get(&device_id)
    }

    /// Look up a device by udid (case-insensitive)
    pub fn find_by_udid(&self, udid: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.matches_udid(udid))
    }

    /// All attached devices
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Number of attached devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is attached
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_device(id: u32, udid: &str) -> Device {
        Device::new(id, udid, ConnectionType::Usb)
    }

    #[test]
    fn test_device_plist_roundtrip() {
        let mut device = usb_device(3, "00008030-001A2C");
        device.product_id = Some(0x12a8);
        device.location_id = Some(0x1400000);

        let parsed = Device::from_plist(&device.to_plist()).unwrap();
        assert_eq!(parsed, device);
    }

    #[test]
    fn test_device_without_serial_is_rejected() {
        let mut body = usb_device(1, "x").to_plist();
        if let Some(Value::Dictionary(properties)) = body.get_mut("Properties") {
            properties.remove("SerialNumber");
        }
        assert!(matches!(
            Device::from_plist(&body),
            Err(ProtocolError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_connection_type_parsing() {
        assert_eq!(ConnectionType::from_wire("USB"), ConnectionType::Usb);
        assert_eq!(ConnectionType::from_wire("Network"), ConnectionType::Network);
        assert_eq!(
            ConnectionType::from_wire("Bluetooth"),
            ConnectionType::Other("Bluetooth".to_string())
        );
    }

    #[test]
    fn test_udid_match_ignores_case() {
        let device = usb_device(1, "abcDEF");
        assert!(device.matches_udid("ABCdef"));
        assert!(!device.matches_udid("abcdeg"));
    }

    #[test]
    fn test_registry_applies_events() {
        let mut registry = DeviceRegistry::new();
        registry.apply(&DeviceEvent::Attached(usb_device(1, "one")));
        registry.apply(&DeviceEvent::Attached(usb_device(2, "two")));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_by_udid("TWO").map(|d| d.device_id), Some(2));

        registry.apply(&DeviceEvent::Detached { device_id: 1 });
        registry.apply(&DeviceEvent::Detached { device_id: 9 });
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_none());

        registry.apply(&DeviceEvent::Paired { device_id: 2 });
        assert_eq!(registry.len(), 1);
    }
}
