//! Periodic recomputation of every active entity.

pub mod worker;

pub use worker::{TickWorker, spawn_tick_worker};

use crate::core::Clock;
use crate::decay::compute;
use crate::registry::{PendingUpdate, Registry};
use crate::storage::SnapshotWriter;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info_span};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Active entities evaluated.
    pub recomputed: usize,
    /// Entities whose cached value was updated.
    pub changed: usize,
    /// Active entities sitting on their floor.
    pub depleted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still running.
    Skipped,
    Completed(TickSummary),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub ticks_completed: u64,
    pub ticks_skipped: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_summary: Option<TickSummary>,
}

/// Drives recomputation for one registry.
///
/// A tick reads a snapshot, computes every active entity outside the lock
/// and commits the changed values in one batch; the registry drops any value
/// whose entity was reset or re-activated in the meantime. A tick that
/// changed something requests exactly one persistence write.
pub struct Scheduler {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    writer: Arc<SnapshotWriter>,
    interval: Duration,
    in_flight: AtomicBool,
    stats: Mutex<SchedulerStats>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        writer: Arc<SnapshotWriter>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            writer,
            interval,
            in_flight: AtomicBool::new(false),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one recomputation pass, or skips it if one is already running.
    pub fn tick(&self) -> TickOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.update_stats(|stats| stats.ticks_skipped += 1);
            debug!("decay tick skipped, previous tick still running");
            return TickOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);

        let span = info_span!("decay_tick");
        let _enter = span.enter();

        let now = self.clock.now();
        let states = self.registry.snapshot();
        let mut summary = TickSummary::default();
        let mut updates = Vec::new();

        for state in states.values().filter(|state| state.is_active) {
            let Some(activation) = state.activation_timestamp else {
                continue;
            };
            let computed = compute(state, now);
            summary.recomputed += 1;
            if computed.current_value <= state.floor() {
                summary.depleted += 1;
            }
            if computed.current_value != state.current_value
                || computed.percentage_remaining != state.percentage_remaining
            {
                updates.push(PendingUpdate::new(state, activation, computed));
            }
        }

        summary.changed = self.registry.apply_computed(&updates);
        if summary.changed > 0 {
            self.writer.request();
        }

        self.update_stats(|stats| {
            stats.ticks_completed += 1;
            stats.last_tick_at = Some(now);
            stats.last_summary = Some(summary);
        });
        debug!(
            recomputed = summary.recomputed,
            changed = summary.changed,
            depleted = summary.depleted,
            "decay tick completed"
        );

        TickOutcome::Completed(summary)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntitySeed, ManualClock};
    use crate::storage::MemoryAdapter;
    use chrono::TimeZone;

    struct Fixture {
        registry: Arc<Registry>,
        clock: Arc<ManualClock>,
        adapter: Arc<MemoryAdapter>,
        writer: Arc<SnapshotWriter>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::default());
        registry
            .initialize(&[EntitySeed::new("lamp", 100.0), EntitySeed::new("chair", 50.0)])
            .unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()));
        let adapter = Arc::new(MemoryAdapter::new());
        let writer = Arc::new(SnapshotWriter::new(
            registry.clone(),
            adapter.clone(),
            Duration::from_secs(1),
        ));
        let scheduler = Scheduler::new(
            registry.clone(),
            clock.clone(),
            writer.clone(),
            DEFAULT_TICK_INTERVAL,
        );
        Fixture {
            registry,
            clock,
            adapter,
            writer,
            scheduler,
        }
    }

    #[test]
    fn test_tick_only_touches_active_entities() {
        let fx = fixture();
        fx.registry.activate("lamp", fx.clock.now());
        fx.clock.advance_ms(12 * 3_600_000);

        let outcome = fx.scheduler.tick();
        assert_eq!(
            outcome,
            TickOutcome::Completed(TickSummary { recomputed: 1, changed: 1, depleted: 0 })
        );
        assert!((fx.registry.query("lamp").unwrap().current_value - 60.0).abs() < 1e-9);
        assert_eq!(fx.registry.query("chair").unwrap().current_value, 50.0);
    }

    #[test]
    fn test_unchanged_tick_does_not_bump_revision() {
        let fx = fixture();
        fx.registry.activate("lamp", fx.clock.now());
        fx.clock.advance_ms(48 * 3_600_000);
        fx.scheduler.tick();
        let revision = fx.registry.revision();

        let outcome = fx.scheduler.tick();
        assert_eq!(
            outcome,
            TickOutcome::Completed(TickSummary { recomputed: 1, changed: 0, depleted: 1 })
        );
        assert_eq!(fx.registry.revision(), revision);
        let lamp = fx.registry.query("lamp").unwrap();
        assert_eq!(lamp.current_value, 20.0);
        assert!(lamp.is_active);
    }

    #[test]
    fn test_backward_clock_never_raises_value() {
        let fx = fixture();
        fx.registry.activate("lamp", fx.clock.now());
        fx.clock.advance_ms(6 * 3_600_000);
        fx.scheduler.tick();
        let before = fx.registry.query("lamp").unwrap().current_value;

        fx.clock.advance_ms(-5 * 3_600_000);
        fx.scheduler.tick();
        assert_eq!(fx.registry.query("lamp").unwrap().current_value, before);
    }

    #[test]
    fn test_concurrent_tick_is_skipped() {
        let fx = fixture();
        fx.scheduler.in_flight.store(true, Ordering::SeqCst);
        assert_eq!(fx.scheduler.tick(), TickOutcome::Skipped);
        assert_eq!(fx.scheduler.stats().ticks_skipped, 1);

        fx.scheduler.in_flight.store(false, Ordering::SeqCst);
        assert!(matches!(fx.scheduler.tick(), TickOutcome::Completed(_)));
        assert_eq!(fx.scheduler.stats().ticks_completed, 1);
    }

    #[tokio::test]
    async fn test_changed_tick_leads_to_one_write() {
        let fx = fixture();
        fx.registry.activate("lamp", fx.clock.now());
        fx.registry.activate("chair", fx.clock.now());
        fx.writer.flush().await.unwrap();
        assert_eq!(fx.adapter.save_count(), 1);

        fx.clock.advance_ms(3_600_000);
        fx.scheduler.tick();
        assert!(fx.writer.is_dirty());
        fx.writer.flush().await.unwrap();
        assert_eq!(fx.adapter.save_count(), 2);
    }
}
