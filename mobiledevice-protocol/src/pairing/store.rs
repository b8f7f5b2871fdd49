//! Pairing Record Storage
//!
//! Pairing records are created once and then only read, replaced or
//! deleted. [`PairingRecordStore`] is the seam to whatever keeps them:
//!
//! - [`MemoryPairingRecordStore`]: process-local map, for tests and emulation
//! - [`FilePairingRecordStore`]: one `<udid>.plist` per device in a directory
//! - [`MuxerPairingRecordStore`]: the multiplexer daemon's own record store

use super::PairingRecord;
use crate::muxer::MuxerConnector;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Keyed storage of pairing records
#[async_trait]
pub trait PairingRecordStore: Send + Sync {
    /// Read the record for `udid`, `None` if there is none
    async fn read(&self, udid: &str) -> Result<Option<PairingRecord>>;

    /// Store `record` for `udid`, replacing any existing record
    async fn write(&self, udid: &str, record: &PairingRecord) -> Result<()>;

    /// Remove the record for `udid`; removing a missing record succeeds
    async fn delete(&self, udid: &str) -> Result<()>;
}

/// In-memory record store
#[derive(Debug, Default)]
pub struct MemoryPairingRecordStore {
    records: RwLock<HashMap<String, PairingRecord>>,
}

impl MemoryPairingRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding one record
    pub fn with_record(udid: impl Into<String>, record: PairingRecord) -> Self {
        let mut records = HashMap::new();
        records.insert(udid.into(), record);
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl PairingRecordStore for MemoryPairingRecordStore {
    async fn read(&self, udid: &str) -> Result<Option<PairingRecord>> {
        Ok(self.records.read().await.get(udid).cloned())
    }

    async fn write(&self, udid: &str, record: &PairingRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(udid.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, udid: &str) -> Result<()> {
        self.records.write().await.remove(udid);
        Ok(())
    }
}

/// Directory-backed record store
#[derive(Debug, Clone)]
pub struct FilePairingRecordStore {
    dir: PathBuf,
}

impl FilePairingRecordStore {
    /// Store records under `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, udid: &str) -> Result<PathBuf> {
        let valid = !udid.is_empty()
            && udid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ProtocolError::InvalidPairingRecord(format!(
                "udid {:?} cannot name a record file",
                udid
            )));
        }
        Ok(self.dir.join(format!("{}.plist", udid)))
    }
}

#[async_trait]
impl PairingRecordStore for FilePairingRecordStore {
    async fn read(&self, udid: &str) -> Result<Option<PairingRecord>> {
        let path = self.record_path(udid)?;
        match fs::read(&path).await {
            Ok(bytes) => {
                debug!("Loaded pairing record from {}", path.display());
                Ok(Some(PairingRecord::from_plist_bytes(&bytes)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, udid: &str, record: &PairingRecord) -> Result<()> {
        let path = self.record_path(udid)?;
        fs::create_dir_all(&self.dir).await?;

        // Write then rename so readers never observe a partial record
        let staging = path.with_extension("plist.tmp");
        let bytes = record.to_plist_bytes()?;

        // A leftover from an interrupted write keeps whatever mode it had
        match fs::remove_file(&staging).await {
            Ok(()) => debug!("Removed stale {}", staging.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &path).await?;
        info!("Saved pairing record for {} to {}", udid, path.display());
        Ok(())
    }

    async fn delete(&self, udid: &str) -> Result<()> {
        let path = self.record_path(udid)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted pairing record for {}", udid);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Record store backed by the multiplexer daemon
///
/// Each operation opens its own multiplexer connection.
pub struct MuxerPairingRecordStore {
    connector: Arc<dyn MuxerConnector>,
}

impl MuxerPairingRecordStore {
    /// Store records through the daemon reached by `connector`
    pub fn new(connector: Arc<dyn MuxerConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl PairingRecordStore for MuxerPairingRecordStore {
    async fn read(&self, udid: &str) -> Result<Option<PairingRecord>> {
        let client = self.connector.open().await?;
        match client.read_pair_record(udid).await? {
            Some(bytes) => Ok(Some(PairingRecord::from_plist_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, udid: &str, record: &PairingRecord) -> Result<()> {
        let client = self.connector.open().await?;
        client
            .save_pair_record(udid, &record.to_plist_bytes()?)
            .await
    }

    async fn delete(&self, udid: &str) -> Result<()> {
        let client = self.connector.open().await?;
        client.delete_pair_record(udid).await
    }
}
