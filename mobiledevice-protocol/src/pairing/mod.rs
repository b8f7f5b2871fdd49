//! Pairing Trust Model
//!
//! A pairing record is the private trust anchor between one host and one
//! device. This module holds the record itself, the TLS configuration
//! derived from it, record storage, and generation of consistent pairing
//! material for emulated devices.

pub mod generate;
pub mod record;
pub mod store;
pub mod trust;

pub use generate::{generate_pairing, GeneratedPairing};
pub use record::PairingRecord;
pub use store::{
    FilePairingRecordStore, MemoryPairingRecordStore, MuxerPairingRecordStore, PairingRecordStore,
};
pub use trust::{client_config, server_config, validate_record, PairedPeerVerifier, TrustMaterial};
