//! TLS Trust Configuration from Pairing Records
//!
//! Turns a [`PairingRecord`] into rustls configuration for both connection
//! roles. System CA stores are never consulted: a peer is trusted iff its
//! certificate is byte-equal to the certificate the record expects for it,
//! or its signature verifies under the record's root certificate.
//!
//! - **Client role** (host connecting to a device service): presents the host
//!   certificate and key, expects the device certificate.
//! - **Server role** (device emulation): presents a fresh leaf certificate
//!   signed by the root key, expects the host certificate.

use super::generate::{generate_key, issue_leaf};
use super::PairingRecord;
use crate::{ProtocolError, Result};
use openssl::pkey::{PKey, Private, Public};
use openssl::x509::X509;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::sync::Arc;
use tracing::{debug, warn};

/// Server name presented during the handshake; peers do not check it
const TLS_SERVER_NAME: &str = "lockdown";

/// Parsed and cross-checked trust material of a pairing record
pub struct TrustMaterial {
    /// Device certificate
    pub device_certificate: X509,
    /// Host certificate
    pub host_certificate: X509,
    /// Host private key
    pub host_private_key: PKey<Private>,
    /// Root CA certificate
    pub root_certificate: X509,
    /// Root CA private key
    pub root_private_key: PKey<Private>,
}

fn invalid(message: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPairingRecord(message.into())
}

fn parse_certificate(bytes: &[u8], name: &str) -> Result<X509> {
    X509::from_pem(bytes)
        .or_else(|_| X509::from_der(bytes))
        .map_err(|e| invalid(format!("{} is not a certificate: {}", name, e)))
}

fn parse_private_key(bytes: &[u8], name: &str) -> Result<PKey<Private>> {
    PKey::private_key_from_pem(bytes)
        .or_else(|_| PKey::private_key_from_der(bytes))
        .map_err(|e| invalid(format!("{} is not a private key: {}", name, e)))
}

/// Parse every certificate and key of `record` and check they belong together
///
/// Fails with `InvalidPairingRecord` when a field is missing or unparsable,
/// when the host or device certificate was not signed by the root, or when a
/// private key does not match its certificate.
pub fn validate_record(record: &PairingRecord) -> Result<TrustMaterial> {
    let device_certificate = parse_certificate(
        PairingRecord::require(&record.device_certificate, "DeviceCertificate")?,
        "DeviceCertificate",
    )?;
    let host_certificate = parse_certificate(
        PairingRecord::require(&record.host_certificate, "HostCertificate")?,
        "HostCertificate",
    )?;
    let host_private_key = parse_private_key(
        PairingRecord::require(&record.host_private_key, "HostPrivateKey")?,
        "HostPrivateKey",
    )?;
    let root_certificate = parse_certificate(
        PairingRecord::require(&record.root_certificate, "RootCertificate")?,
        "RootCertificate",
    )?;
    let root_private_key = parse_private_key(
        PairingRecord::require(&record.root_private_key, "RootPrivateKey")?,
        "RootPrivateKey",
    )?;

    let root_public = root_certificate.public_key()?;
    if !root_public.public_eq(&root_private_key) {
        return Err(invalid("RootPrivateKey does not match RootCertificate"));
    }
    if !host_certificate.public_key()?.public_eq(&host_private_key) {
        return Err(invalid("HostPrivateKey does not match HostCertificate"));
    }
    if !signed_by(&host_certificate, &root_public) {
        return Err(invalid("HostCertificate is not signed by RootCertificate"));
    }
    if !signed_by(&device_certificate, &root_public) {
        return Err(invalid("DeviceCertificate is not signed by RootCertificate"));
    }

    Ok(TrustMaterial {
        device_certificate,
        host_certificate,
        host_private_key,
        root_certificate,
        root_private_key,
    })
}

fn signed_by(certificate: &X509, root_public: &PKey<Public>) -> bool {
    certificate.verify(root_public).unwrap_or(false)
}

fn certificate_der(certificate: &X509) -> Result<CertificateDer<'static>> {
    Ok(CertificateDer::from(certificate.to_der()?))
}

/// Re-encode any supported private key as PKCS#8 DER for rustls
fn private_key_der(key: &PKey<Private>) -> Result<PrivateKeyDer<'static>> {
    let encoded = key.private_key_to_pem_pkcs8()?;
    let parsed = pem::parse(&encoded)
        .map_err(|e| invalid(format!("failed to re-encode private key: {}", e)))?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        parsed.contents().to_vec(),
    )))
}

/// Server name used for client-role handshakes
pub(crate) fn server_name() -> Result<ServerName<'static>> {
    ServerName::try_from(TLS_SERVER_NAME)
        .map_err(|e| ProtocolError::Configuration(format!("invalid TLS server name: {}", e)))
}

/// Verifier accepting exactly the peers a pairing record vouches for
#[derive(Debug)]
pub struct PairedPeerVerifier {
    expected: Vec<u8>,
    root_public_der: Vec<u8>,
}

impl PairedPeerVerifier {
    /// Trust `expected` (DER) and anything signed by the root key
    pub fn new(expected: &X509, root: &X509) -> Result<Self> {
        Ok(Self {
            expected: expected.to_der()?,
            root_public_der: root.public_key()?.public_key_to_der()?,
        })
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        if end_entity.as_ref() == self.expected.as_slice() {
            debug!("Peer certificate matches paired certificate");
            return Ok(());
        }

        let presented = X509::from_der(end_entity.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        let root_public = PKey::public_key_from_der(&self.root_public_der)
            .map_err(|e| rustls::Error::General(format!("root key unusable: {}", e)))?;

        if signed_by(&presented, &root_public) {
            debug!("Peer certificate verified under pairing root");
            Ok(())
        } else {
            warn!("Rejecting peer certificate not issued by the pairing root");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            ))
        }
    }
}

fn verify_tls12(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls12_signature(
        message,
        cert,
        dss,
        &rustls::crypto::ring::default_provider().signature_verification_algorithms,
    )
}

fn verify_tls13(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls13_signature(
        message,
        cert,
        dss,
        &rustls::crypto::ring::default_provider().signature_verification_algorithms,
    )
}

fn supported_schemes() -> Vec<SignatureScheme> {
    rustls::crypto::ring::default_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

impl ServerCertVerifier for PairedPeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

impl ClientCertVerifier for PairedPeerVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Build the client-role configuration (host connecting to a device service)
pub fn client_config(record: &PairingRecord) -> Result<Arc<ClientConfig>> {
    let material = validate_record(record)?;
    let verifier =
        PairedPeerVerifier::new(&material.device_certificate, &material.root_certificate)?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(
            vec![certificate_der(&material.host_certificate)?],
            private_key_der(&material.host_private_key)?,
        )?;
    config.enable_sni = false;

    debug!("Created TLS client config for host {}", record.host_id);
    Ok(Arc::new(config))
}

/// Build the server-role configuration (device emulation)
///
/// A new leaf certificate is issued from the root key on every call.
pub fn server_config(record: &PairingRecord) -> Result<Arc<ServerConfig>> {
    let material = validate_record(record)?;
    let verifier =
        PairedPeerVerifier::new(&material.host_certificate, &material.root_certificate)?;

    let leaf_key = generate_key()?;
    let leaf = issue_leaf(
        "Device",
        &leaf_key,
        &material.root_certificate,
        &material.root_private_key,
    )?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(vec![certificate_der(&leaf)?], private_key_der(&leaf_key)?)?;
    config.send_tls13_tickets = 0;

    debug!("Created TLS server config for host {}", record.host_id);
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::generate_pairing;

    #[test]
    fn test_generated_record_validates() {
        let pairing = generate_pairing("host", "buid").unwrap();
        assert!(validate_record(&pairing.record).is_ok());
        assert!(client_config(&pairing.record).is_ok());
        assert!(server_config(&pairing.record).is_ok());
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let pairing = generate_pairing("host", "buid").unwrap();

        let cases: [fn(&mut PairingRecord); 3] = [
            |r| r.device_certificate = None,
            |r| r.host_private_key = None,
            |r| r.root_private_key = None,
        ];
        for clear in cases {
            let mut record = pairing.record.clone();
            clear(&mut record);
            assert!(matches!(
                client_config(&record),
                Err(ProtocolError::InvalidPairingRecord(_))
            ));
            assert!(matches!(
                server_config(&record),
                Err(ProtocolError::InvalidPairingRecord(_))
            ));
        }
    }

    #[test]
    fn test_mixed_records_are_inconsistent() {
        let a = generate_pairing("host-a", "buid").unwrap();
        let b = generate_pairing("host-b", "buid").unwrap();

        let mut record = a.record.clone();
        record.device_certificate = b.record.device_certificate.clone();
        assert!(matches!(
            validate_record(&record),
            Err(ProtocolError::InvalidPairingRecord(_))
        ));

        let mut record = a.record.clone();
        record.host_private_key = b.record.host_private_key.clone();
        assert!(matches!(
            validate_record(&record),
            Err(ProtocolError::InvalidPairingRecord(_))
        ));
    }

    #[test]
    fn test_verifier_policy() {
        let a = generate_pairing("host-a", "buid").unwrap();
        let b = generate_pairing("host-b", "buid").unwrap();
        let material = validate_record(&a.record).unwrap();
        let verifier =
            PairedPeerVerifier::new(&material.device_certificate, &material.root_certificate)
                .unwrap();

        let exact = CertificateDer::from(material.device_certificate.to_der().unwrap());
        assert!(verifier.check(&exact).is_ok());

        let sibling = CertificateDer::from(material.host_certificate.to_der().unwrap());
        assert!(verifier.check(&sibling).is_ok());

        let foreign = validate_record(&b.record).unwrap();
        let foreign = CertificateDer::from(foreign.device_certificate.to_der().unwrap());
        assert!(matches!(
            verifier.check(&foreign),
            Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
        ));

        let garbage = CertificateDer::from(vec![0u8; 8]);
        assert!(verifier.check(&garbage).is_err());
    }
}
