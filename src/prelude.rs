//! Everything presentation code usually needs in one import.
//!
//! Lower-level pieces (`Registry`, `Scheduler`, `SnapshotWriter`) stay under
//! their own modules for callers that wire an engine by hand.

pub use crate::{
    Clock, DecayEngine, DecayError, DecayPhase, DecayReading, EngineConfig, EntitySeed,
    FileAdapter, MemoryAdapter, PersistenceAdapter, Result, SystemClock, TimeRemaining,
};
