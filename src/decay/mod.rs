//! Pure decay arithmetic. Nothing here holds state or touches I/O.

pub mod calculator;

pub use calculator::{Computed, compute, elapsed_ms, reading_at, time_remaining};
