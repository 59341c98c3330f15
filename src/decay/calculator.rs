use crate::core::{DecayPhase, DecayReading, DecayState, TimeRemaining};
use chrono::{DateTime, Utc};

/// Result of recomputing one state at a given instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Computed {
    pub current_value: f64,
    pub percentage_remaining: f64,
}

/// Milliseconds since `activation`, clamped at zero so a clock that moved
/// backwards never un-decays a value.
pub fn elapsed_ms(activation: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed = now.signed_duration_since(activation).num_milliseconds();
    elapsed.max(0) as f64
}

/// Value and percentage of `state` at `now`.
///
/// Always derived from the original activation timestamp, never from the
/// previous cached value, so any gap between observations is caught up in
/// one step and repeated calls with the same inputs agree exactly.
pub fn compute(state: &DecayState, now: DateTime<Utc>) -> Computed {
    let Some(activation) = state.activation_timestamp else {
        return Computed {
            current_value: state.initial_value,
            percentage_remaining: 100.0,
        };
    };

    let elapsed = elapsed_ms(activation, now);
    let floor = state.floor();

    let current_value = if elapsed >= state.decay_period_ms as f64 {
        floor
    } else {
        (state.initial_value - state.decay_rate * elapsed).max(floor)
    };

    let span = state.initial_value - floor;
    let percentage_remaining = if span <= 0.0 {
        0.0
    } else {
        ((current_value - floor) / span * 100.0).clamp(0.0, 100.0)
    };

    Computed {
        current_value,
        percentage_remaining,
    }
}

/// Fresh reading of `state` at `now`, without touching the cached fields.
pub fn reading_at(state: &DecayState, now: DateTime<Utc>) -> DecayReading {
    let computed = compute(state, now);
    let phase = match state.activation_timestamp {
        None => DecayPhase::Idle,
        Some(_) if computed.current_value <= state.floor() => DecayPhase::Depleted,
        Some(_) => DecayPhase::Active,
    };

    DecayReading {
        name: state.name.clone(),
        current_value: computed.current_value,
        percentage_remaining: computed.percentage_remaining,
        is_active: state.is_active,
        phase,
    }
}

/// Time until `state` reaches its floor, or `None` if it was never activated.
pub fn time_remaining(state: &DecayState, now: DateTime<Utc>) -> Option<TimeRemaining> {
    state.activation_timestamp?;

    let computed = compute(state, now);
    let headroom = computed.current_value - state.floor();
    if headroom <= 0.0 || state.decay_rate <= 0.0 {
        return Some(TimeRemaining::ZERO);
    }

    Some(TimeRemaining::from_millis(headroom / state.decay_rate))
}
