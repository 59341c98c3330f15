pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DecayError, Result};
pub use types::{
    DEFAULT_DECAY_PERIOD_MS, DEFAULT_FLOOR_PERCENTAGE, DecayParams, DecayPhase, DecayReading,
    DecayState, EntitySeed, SeedDefaults, TimeRemaining,
};
