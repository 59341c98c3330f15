use super::config::EngineConfig;
use crate::core::{Clock, DecayReading, DecayState, EntitySeed, Result, SystemClock, TimeRemaining};
use crate::decay::{reading_at, time_remaining};
use crate::registry::{InitializeReport, Registry};
use crate::scheduler::{Scheduler, SchedulerStats, TickOutcome, TickWorker, spawn_tick_worker};
use crate::storage::{
    FileAdapter, PersistenceAdapter, PersistenceStats, SnapshotWriter, WriterWorker,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub entities: usize,
    pub running: bool,
    /// Whether the registry started from a persisted snapshot.
    pub restored: bool,
    pub scheduler: SchedulerStats,
    pub persistence: PersistenceStats,
}

/// Decaying-counter engine: one registry, its tick driver and its
/// persistence worker.
///
/// Every instance owns its own state, so several engines (for example one
/// per storefront) can run side by side in one process.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use stockdecay::{DecayEngine, EngineConfig, EntitySeed, MemoryAdapter, SystemClock};
///
/// # async fn demo() -> stockdecay::Result<()> {
/// let engine = DecayEngine::open(
///     EngineConfig::default(),
///     Arc::new(MemoryAdapter::new()),
///     Arc::new(SystemClock),
/// )
/// .await?;
///
/// engine.initialize(&[EntitySeed::new("lamp", 100.0)])?;
/// engine.activate("lamp");
/// engine.start()?;
///
/// if let Some(reading) = engine.query("lamp") {
///     println!("{} left ({:.0}%)", reading.current_value, reading.percentage_remaining);
/// }
///
/// engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct DecayEngine {
    config: EngineConfig,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    writer: Arc<SnapshotWriter>,
    scheduler: Arc<Scheduler>,
    ticker: Mutex<Option<TickWorker>>,
    persister: Mutex<Option<WriterWorker>>,
    restored: bool,
}

impl DecayEngine {
    /// Builds an engine, restoring from `adapter` when it holds a usable
    /// snapshot. Must be called inside a tokio runtime.
    pub async fn open(
        config: EngineConfig,
        adapter: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let defaults = config.seed_defaults();

        let snapshot = match timeout(config.persist_timeout, adapter.load()).await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                warn!(
                    store = %adapter.describe(),
                    timeout = ?config.persist_timeout,
                    "decay snapshot load timed out, starting fresh"
                );
                None
            }
        };

        let restored = snapshot.is_some();
        let registry = match snapshot {
            Some(snapshot) => {
                info!(
                    entities = snapshot.entity_count(),
                    saved_at = %snapshot.saved_at,
                    store = %adapter.describe(),
                    "decay states restored"
                );
                Arc::new(Registry::with_states(defaults, snapshot.entities))
            }
            None => Arc::new(Registry::new(defaults)),
        };

        let writer = Arc::new(SnapshotWriter::new(
            registry.clone(),
            adapter,
            config.persist_timeout,
        ));
        let persister = writer.spawn();

        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            clock.clone(),
            writer.clone(),
            config.tick_interval,
        ));

        Ok(Self {
            config,
            registry,
            clock,
            writer,
            scheduler,
            ticker: Mutex::new(None),
            persister: Mutex::new(Some(persister)),
            restored,
        })
    }

    /// Engine persisted to a single snapshot file, driven by the system clock.
    pub async fn open_file<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        Self::open(config, Arc::new(FileAdapter::new(path)), Arc::new(SystemClock)).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Syncs the entity collection with the catalog. In-progress decays of
    /// names still present are kept.
    pub fn initialize(&self, seeds: &[EntitySeed]) -> Result<InitializeReport> {
        let report = self.registry.initialize(seeds)?;
        if report.created > 0 || report.dropped > 0 {
            self.writer.request();
        }
        Ok(report)
    }

    /// Starts decay for `name`. Unknown names and repeat calls are no-ops.
    pub fn activate(&self, name: &str) -> bool {
        let activated = self.registry.activate(name, self.clock.now());
        if activated {
            self.lifecycle_changed();
        } else {
            debug!(entity = name, "activate ignored");
        }
        activated
    }

    /// Returns `name` to its freshly seeded, idle state.
    pub fn reset(&self, name: &str) -> bool {
        let reset = self.registry.reset(name);
        if reset {
            self.lifecycle_changed();
        }
        reset
    }

    pub fn reset_all(&self) -> usize {
        let count = self.registry.reset_all();
        if count > 0 {
            self.lifecycle_changed();
        }
        count
    }

    fn lifecycle_changed(&self) {
        if self.config.persist_on_lifecycle {
            self.writer.request();
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current reading, computed from the clock right now rather than from
    /// the last tick.
    pub fn query(&self, name: &str) -> Option<DecayReading> {
        let state = self.registry.query(name)?;
        Some(reading_at(&state, self.clock.now()))
    }

    /// Stored record as of the last committed change.
    pub fn state(&self, name: &str) -> Option<DecayState> {
        self.registry.query(name)
    }

    /// Readings for every entity, ordered by name.
    pub fn readings(&self) -> Vec<DecayReading> {
        let now = self.clock.now();
        self.registry
            .snapshot()
            .values()
            .map(|state| reading_at(state, now))
            .collect()
    }

    /// `None` for unknown or never-activated entities, zero once depleted.
    pub fn time_remaining(&self, name: &str) -> Option<TimeRemaining> {
        let state = self.registry.query(name)?;
        time_remaining(&state, self.clock.now())
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Runs one tick on the calling thread.
    pub fn tick_now(&self) -> TickOutcome {
        self.scheduler.tick()
    }

    /// Starts the periodic tick driver. Returns `false` if it was already
    /// running.
    pub fn start(&self) -> Result<bool> {
        let mut ticker = self.ticker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if ticker.as_ref().is_some_and(|worker| !worker.is_finished()) {
            return Ok(false);
        }
        *ticker = Some(spawn_tick_worker(self.scheduler.clone())?);
        info!(interval = ?self.config.tick_interval, "decay scheduler started");
        Ok(true)
    }

    /// Halts the tick driver and flushes once. Persistence failures are
    /// logged, not returned.
    pub async fn stop(&self) -> Result<()> {
        let worker = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            worker.stop().await?;
            info!("decay scheduler stopped");
        }

        if let Err(err) = self.writer.flush().await {
            warn!(error = %err, "final decay snapshot flush failed");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Writes the collection now, bypassing coalescing. Unlike the
    /// background path this reports the failure to the caller.
    pub async fn flush(&self) -> Result<bool> {
        self.writer.flush().await
    }

    /// Stops everything and waits for the persistence worker to drain.
    pub async fn shutdown(self) -> Result<()> {
        self.stop().await?;
        let persister = self
            .persister
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(persister) = persister {
            persister.stop().await?;
        }
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            entities: self.registry.len(),
            running: self.is_running(),
            restored: self.restored,
            scheduler: self.scheduler.stats(),
            persistence: self.writer.stats(),
        }
    }
}
