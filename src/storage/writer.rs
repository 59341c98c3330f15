use super::persistence::{DecaySnapshot, PersistenceAdapter};
use crate::core::{DecayError, Result};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistenceStats {
    pub saves_ok: u64,
    pub saves_failed: u64,
    pub saves_skipped: u64,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Coalesces save requests into full-collection writes.
///
/// The registry's revision at construction counts as already durable: it
/// is either what was just restored or an empty collection. Any number of
/// `request` calls between two writes produce one write, and a write is
/// skipped when the registry has not changed since the last successful one.
/// Saves are serialized, including ones that already timed out, so an older
/// snapshot can never overwrite a newer one.
pub struct SnapshotWriter {
    registry: Arc<Registry>,
    adapter: Arc<dyn PersistenceAdapter>,
    timeout: Duration,
    notify: Notify,
    save_lock: Arc<AsyncMutex<()>>,
    last_saved_revision: AtomicU64,
    stats: Mutex<PersistenceStats>,
}

impl SnapshotWriter {
    pub fn new(
        registry: Arc<Registry>,
        adapter: Arc<dyn PersistenceAdapter>,
        timeout: Duration,
    ) -> Self {
        let revision = registry.revision();
        Self {
            registry,
            adapter,
            timeout,
            notify: Notify::new(),
            save_lock: Arc::new(AsyncMutex::new(())),
            last_saved_revision: AtomicU64::new(revision),
            stats: Mutex::new(PersistenceStats::default()),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.last_saved_revision.load(Ordering::SeqCst) != self.registry.revision()
    }

    /// Asks the background worker to write soon. Never blocks.
    pub fn request(&self) {
        self.notify.notify_one();
    }

    /// Writes the current collection now. Returns `Ok(false)` if nothing
    /// changed since the last successful write.
    ///
    /// The save runs in its own task that owns the save lock until the
    /// adapter returns. A save that outlives `timeout` is reported as a
    /// timeout but keeps the lock, so no later snapshot can be written
    /// before it lands.
    pub async fn flush(&self) -> Result<bool> {
        let guard = match timeout(self.timeout, self.save_lock.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                let err = DecayError::Timeout {
                    operation: format!(
                        "waiting for previous save to {}",
                        self.adapter.describe()
                    ),
                    elapsed: self.timeout,
                };
                self.record_failure(&err);
                return Err(err);
            }
        };

        let (revision, states) = self.registry.versioned_snapshot();
        if self.last_saved_revision.load(Ordering::SeqCst) == revision {
            self.update_stats(|stats| stats.saves_skipped += 1);
            return Ok(false);
        }

        let snapshot = DecaySnapshot::new(states);
        let saved_at = snapshot.saved_at;
        let entities = snapshot.entity_count();
        let adapter = Arc::clone(&self.adapter);
        let mut save = tokio::spawn(async move {
            let _guard = guard;
            adapter.save(&snapshot).await
        });

        let outcome = match timeout(self.timeout, &mut save).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(DecayError::Persistence(format!("save task failed: {}", err))),
            Err(_) => Err(DecayError::Timeout {
                operation: format!("save to {}", self.adapter.describe()),
                elapsed: self.timeout,
            }),
        };

        match outcome {
            Ok(()) => {
                self.last_saved_revision.store(revision, Ordering::SeqCst);
                self.update_stats(|stats| {
                    stats.saves_ok += 1;
                    stats.last_saved_at = Some(saved_at);
                });
                debug!(
                    revision,
                    entities,
                    store = %self.adapter.describe(),
                    "decay snapshot saved"
                );
                Ok(true)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn record_failure(&self, err: &DecayError) {
        let message = err.to_string();
        warn!(
            store = %self.adapter.describe(),
            error = %message,
            "decay snapshot save failed; keeping in-memory state"
        );
        self.update_stats(|stats| {
            stats.saves_failed += 1;
            stats.last_error = Some(message);
        });
    }

    pub fn stats(&self) -> PersistenceStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut PersistenceStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }

    /// Spawns the task that serves `request` calls.
    pub fn spawn(self: &Arc<Self>) -> WriterWorker {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let writer = Arc::clone(self);

        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        // Errors are already logged and counted.
                        let _ = writer.flush().await;
                        break;
                    }
                    _ = writer.notify.notified() => {
                        let _ = writer.flush().await;
                    }
                }
            }
        });

        WriterWorker {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

/// Handle to the background persistence task.
pub struct WriterWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl WriterWorker {
    /// Signals the worker, lets it run one final flush and waits for it.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle.await.map_err(|err| {
                DecayError::SchedulerError(format!("persistence worker join: {}", err))
            })?;
        }
        Ok(())
    }
}

impl Drop for WriterWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
