//! Pairing Material Generation
//!
//! Mints a mutually consistent set of certificates for one host/device pair:
//! a self-issued root CA, a host identity and a device identity, both signed
//! by the root. The interactive pairing ceremony that would deliver the
//! device certificate to a real device is not part of this crate; this is
//! used to provision emulated devices and tests.
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: RSA 2048-bit
//! - **Root**: X509v3, `CA:TRUE`, self-signed
//! - **Host / Device**: X509v3, `CA:FALSE`, issued by the root
//! - **Validity**: 10 years
//! - **Signature**: SHA-256

use super::PairingRecord;
use crate::Result;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509NameRef, X509Ref, X509};
use tracing::info;

/// Certificate validity period (10 years)
const CERT_VALIDITY_DAYS: u32 = 10 * 365;

/// RSA modulus size for generated keys
const RSA_BITS: u32 = 2048;

/// Result of minting pairing material
#[derive(Debug, Clone)]
pub struct GeneratedPairing {
    /// Record the host persists
    pub record: PairingRecord,
    /// Device private key (PEM); real devices keep this to themselves
    pub device_private_key: Vec<u8>,
}

/// Which kind of certificate to issue
enum Role {
    Root,
    Leaf,
}

/// Generate a fresh RSA key
pub(crate) fn generate_key() -> Result<PKey<Private>> {
    Ok(PKey::from_rsa(Rsa::generate(RSA_BITS)?)?)
}

/// Issue a certificate for `subject_key`
///
/// When `issuer` is `None` the certificate is self-signed with `subject_key`.
fn issue(
    common_name: &str,
    subject_key: &PKeyRef<Private>,
    issuer: Option<(&X509NameRef, &PKeyRef<Private>)>,
    role: Role,
) -> Result<X509> {
    let mut builder = X509::builder()?;
    builder.set_version(2)?;

    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    let mut name = openssl::x509::X509Name::builder()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();
    builder.set_subject_name(&name)?;

    let (issuer_name, signing_key) = match issuer {
        Some((issuer_name, issuer_key)) => (issuer_name, issuer_key),
        None => (name.as_ref(), subject_key),
    };
    builder.set_issuer_name(issuer_name)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(subject_key)?;

    match role {
        Role::Root => {
            builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
            let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
            builder.append_extension(ski)?;
        }
        Role::Leaf => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
            )?;
        }
    }

    builder.sign(signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Issue a leaf certificate for `subject_key` signed by the given root
pub(crate) fn issue_leaf(
    common_name: &str,
    subject_key: &PKeyRef<Private>,
    root: &X509Ref,
    root_key: &PKeyRef<Private>,
) -> Result<X509> {
    issue(
        common_name,
        subject_key,
        Some((root.subject_name(), root_key)),
        Role::Leaf,
    )
}

/// Mint a root CA, host identity and device identity for one pairing
///
/// # Examples
///
/// ```no_run
/// use mobiledevice_protocol::pairing::generate_pairing;
///
/// let pairing = generate_pairing("HOST-ID", "SYSTEM-BUID").unwrap();
/// assert!(pairing.record.has_trust_material());
/// ```
pub fn generate_pairing(
    host_id: impl Into<String>,
    system_buid: impl Into<String>,
) -> Result<GeneratedPairing> {
    let host_id = host_id.into();
    let system_buid = system_buid.into();

    let root_key = generate_key()?;
    let root = issue("Root Certification Authority", &root_key, None, Role::Root)?;

    let host_key = generate_key()?;
    let host = issue_leaf(&host_id, &host_key, &root, &root_key)?;

    let device_key = generate_key()?;
    let device = issue_leaf("Device", &device_key, &root, &root_key)?;

    let record = PairingRecord {
        device_certificate: Some(device.to_pem()?),
        host_certificate: Some(host.to_pem()?),
        host_private_key: Some(host_key.private_key_to_pem_pkcs8()?),
        root_certificate: Some(root.to_pem()?),
        root_private_key: Some(root_key.private_key_to_pem_pkcs8()?),
        host_id,
        system_buid,
        escrow_bag: None,
        wifi_mac_address: None,
    };

    info!(
        "Generated pairing material for host {} (device fingerprint {})",
        record.host_id,
        record.device_fingerprint().unwrap_or_default()
    );

    Ok(GeneratedPairing {
        record,
        device_private_key: device_key.private_key_to_pem_pkcs8()?,
    })
}
