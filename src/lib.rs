// ============================================================================
// StockDecay Library
// ============================================================================

//! Decaying resource counters.
//!
//! Each named entity holds a value that falls linearly from its initial
//! stock toward a floor once activated. Values are always derived from the
//! activation timestamp, so an engine that was stopped for hours catches up
//! in a single tick. State survives restarts through a best-effort snapshot
//! that is discarded whenever it cannot be read back cleanly.
//!
//! The counters are a presentation aid only and are never a source of truth
//! for real inventory.

pub mod core;
pub mod decay;
pub mod facade;
pub mod prelude;
pub mod registry;
pub mod scheduler;
pub mod storage;

pub use crate::core::{
    Clock, DecayError, DecayParams, DecayPhase, DecayReading, DecayState, EntitySeed,
    ManualClock, Result, SeedDefaults, SystemClock, TimeRemaining,
};
pub use crate::decay::{Computed, compute, time_remaining};
pub use crate::facade::{DecayEngine, EngineConfig, EngineStats};
pub use crate::registry::{InitializeReport, Registry};
pub use crate::scheduler::{SchedulerStats, TickOutcome, TickSummary};
pub use crate::storage::{
    DecaySnapshot, FileAdapter, MemoryAdapter, PersistenceAdapter, PersistenceStats,
    SnapshotFormat,
};
