//! Pairing Record
//!
//! The trust anchor for one device: device certificate, host identity,
//! root CA and the identifiers exchanged during pairing. Records are created
//! once by a pairing ceremony and persisted as an XML property list.
//!
//! Certificate and key fields hold the PEM text exactly as persisted, so a
//! record read back from storage is byte-identical to the one written.

use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Certificates, keys and identifiers establishing trust with one device
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PairingRecord {
    /// The device's certificate (PEM), no private key
    #[serde(
        rename = "DeviceCertificate",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub device_certificate: Option<Vec<u8>>,

    /// Host certificate (PEM) presented to the device during TLS
    #[serde(
        rename = "HostCertificate",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub host_certificate: Option<Vec<u8>>,

    /// Host private key (PEM)
    #[serde(
        rename = "HostPrivateKey",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub host_private_key: Option<Vec<u8>>,

    /// Self-issued root CA certificate (PEM) that signed host and device certificates
    #[serde(
        rename = "RootCertificate",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub root_certificate: Option<Vec<u8>>,

    /// Root CA private key (PEM)
    #[serde(
        rename = "RootPrivateKey",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub root_private_key: Option<Vec<u8>>,

    /// Host identifier sent in `StartSession`
    #[serde(rename = "HostID", default)]
    pub host_id: String,

    /// System BUID sent in `StartSession`
    #[serde(rename = "SystemBUID", default)]
    pub system_buid: String,

    /// Escrow keybag, carried opaquely
    #[serde(
        rename = "EscrowBag",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub escrow_bag: Option<Vec<u8>>,

    /// WiFi MAC address of the device, carried opaquely
    #[serde(
        rename = "WiFiMACAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub wifi_mac_address: Option<String>,
}

impl PairingRecord {
    /// Decode a persisted record (XML or binary property list)
    pub fn from_plist_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(plist::from_bytes(bytes)?)
    }

    /// Encode as an XML property list
    pub fn to_plist_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        plist::to_writer_xml(&mut buffer, self)?;
        Ok(buffer)
    }

    /// Return `field` or fail with `InvalidPairingRecord` naming it
    pub(crate) fn require<'a>(field: &'a Option<Vec<u8>>, name: &str) -> Result<&'a [u8]> {
        match field {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ProtocolError::InvalidPairingRecord(format!(
                "missing {}",
                name
            ))),
        }
    }

    /// Whether every certificate and key needed for TLS is present
    pub fn has_trust_material(&self) -> bool {
        [
            &self.device_certificate,
            &self.host_certificate,
            &self.host_private_key,
            &self.root_certificate,
            &self.root_private_key,
        ]
        .iter()
        .all(|field| field.as_ref().is_some_and(|v| !v.is_empty()))
    }

    /// SHA256 fingerprint of the device certificate
    ///
    /// Returns fingerprint in format: XX:XX:...:XX, or `None` without a
    /// device certificate.
    pub fn device_fingerprint(&self) -> Option<String> {
        let cert = self.device_certificate.as_ref()?;
        let hash = Sha256::digest(cert);
        Some(
            hash.iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }
}

impl fmt::Debug for PairingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present = |field: &Option<Vec<u8>>| field.as_ref().map(|v| v.len());
        f.debug_struct("PairingRecord")
            .field("host_id", &self.host_id)
            .field("system_buid", &self.system_buid)
            .field("device_certificate_len", &present(&self.device_certificate))
            .field("host_certificate_len", &present(&self.host_certificate))
            .field("root_certificate_len", &present(&self.root_certificate))
            .field("host_private_key", &self.host_private_key.as_ref().map(|_| "<redacted>"))
            .field("root_private_key", &self.root_private_key.as_ref().map(|_| "<redacted>"))
            .field("escrow_bag_len", &present(&self.escrow_bag))
            .field("wifi_mac_address", &self.wifi_mac_address)
            .finish()
    }
}
