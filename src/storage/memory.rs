use super::persistence::{DecaySnapshot, PersistenceAdapter, SnapshotFormat};
use crate::core::{DecayError, Result};
use async_trait::async_trait;
use log::warn;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Keeps the encoded snapshot in process memory.
///
/// Goes through the same encode/decode path as the file adapter, so tests can
/// inject raw (including corrupted) payloads and simulate failing writes.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    bytes: Mutex<Option<Vec<u8>>>,
    format: SnapshotFormat,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(format: SnapshotFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    /// Pre-populates the store with an arbitrary payload.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(Some(bytes)),
            ..Self::default()
        }
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.bytes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn load(&self) -> Option<DecaySnapshot> {
        let bytes = self.bytes()?;
        match self.format.decode(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!("discarding unreadable in-memory decay snapshot: {}", err);
                None
            }
        }
    }

    async fn save(&self, snapshot: &DecaySnapshot) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DecayError::Persistence(
                "in-memory store is rejecting writes".to_string(),
            ));
        }

        let encoded = self.format.encode(snapshot)?;
        *self
            .bytes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(encoded);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
