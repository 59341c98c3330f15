//! Durable snapshots of the decay-state collection.
//!
//! Persistence is a best-effort cache: the in-memory registry is the state of
//! record. A snapshot that cannot be read back for any reason is reported as
//! absent and the registry is rebuilt from the catalog.

use crate::core::{DecayError, DecayState, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use im::OrdMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Snapshot Envelope
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecaySnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub entities: OrdMap<String, DecayState>,
}

impl DecaySnapshot {
    pub fn new(entities: OrdMap<String, DecayState>) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            saved_at: Utc::now(),
            entities,
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Restores names from the map keys and checks every record.
    fn into_validated(self) -> Result<Self> {
        if self.version != SNAPSHOT_FORMAT_VERSION {
            return Err(DecayError::Serialization(format!(
                "Unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        let mut entities = OrdMap::new();
        for (name, mut state) in self.entities {
            state.name = name.clone();
            state.check_consistency().map_err(|reason| {
                DecayError::Serialization(format!("Inconsistent record for '{}': {}", name, reason))
            })?;
            entities.insert(name, state);
        }

        Ok(Self {
            version: self.version,
            saved_at: self.saved_at,
            entities,
        })
    }
}

// ============================================================================
// Encoding
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotFormat {
    #[default]
    Json,
    MessagePack,
}

impl SnapshotFormat {
    pub fn encode(&self, snapshot: &DecaySnapshot) -> Result<Vec<u8>> {
        let encoded = match self {
            Self::Json => serde_json::to_vec_pretty(snapshot).map_err(|e| e.to_string()),
            Self::MessagePack => rmp_serde::to_vec_named(snapshot).map_err(|e| e.to_string()),
        };
        encoded.map_err(|e| DecayError::Serialization(format!("Failed to encode snapshot: {}", e)))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DecaySnapshot> {
        let snapshot: DecaySnapshot = match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            Self::MessagePack => rmp_serde::from_slice(bytes).map_err(|e| e.to_string()),
        }
        .map_err(|e| DecayError::Serialization(format!("Failed to decode snapshot: {}", e)))?;
        snapshot.into_validated()
    }

    /// Picks a format from a file extension, JSON unless it says otherwise.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("msgpack") | Some("mpk") => Self::MessagePack,
            _ => Self::Json,
        }
    }
}

// ============================================================================
// Adapter Contract
// ============================================================================

/// Load/save boundary for the full decay-state collection.
///
/// `load` never fails: unreadable, partial or incompatible payloads come back
/// as `None`. `save` must be atomic from a reader's point of view; its errors
/// are logged by the caller and never reach the public API.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn load(&self) -> Option<DecaySnapshot>;

    async fn save(&self, snapshot: &DecaySnapshot) -> Result<()>;

    fn describe(&self) -> String;
}

// ============================================================================
// File Adapter
// ============================================================================

/// Stores the snapshot in a single file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileAdapter {
    path: PathBuf,
    format: SnapshotFormat,
}

impl FileAdapter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = SnapshotFormat::from_path(&path);
        Self { path, format }
    }

    pub fn with_format<P: AsRef<Path>>(path: P, format: SnapshotFormat) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SnapshotFormat {
        self.format
    }
}

#[async_trait]
impl PersistenceAdapter for FileAdapter {
    async fn load(&self) -> Option<DecaySnapshot> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no decay snapshot at '{}'", self.path.display());
                return None;
            }
            Err(err) => {
                warn!(
                    "failed to read decay snapshot '{}', starting fresh: {}",
                    self.path.display(),
                    err
                );
                return None;
            }
        };

        match self.format.decode(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(
                    "discarding unreadable decay snapshot '{}': {}",
                    self.path.display(),
                    err
                );
                None
            }
        }
    }

    async fn save(&self, snapshot: &DecaySnapshot) -> Result<()> {
        let bytes = self.format.encode(snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|e| DecayError::Persistence(format!("snapshot write task failed: {}", e)))?
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Writes `bytes` to a temp file beside `path`, syncs it and renames it over
/// `path`, so readers see either the old or the new snapshot.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| {
        DecayError::Persistence(format!(
            "Failed to create snapshot directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(&parent)
        .map_err(|e| DecayError::Persistence(format!("Failed to create temp file: {}", e)))?;
    tmp.write_all(bytes)
        .map_err(|e| DecayError::Persistence(format!("Failed to write snapshot: {}", e)))?;
    tmp.flush()
        .map_err(|e| DecayError::Persistence(format!("Failed to flush snapshot: {}", e)))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| DecayError::Persistence(format!("Failed to sync snapshot: {}", e)))?;
    tmp.persist(path).map_err(|e| {
        DecayError::Persistence(format!(
            "Failed to rename snapshot into '{}': {}",
            path.display(),
            e.error
        ))
    })?;
    Ok(())
}
