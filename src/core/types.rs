use super::error::{DecayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// 24 hours in milliseconds.
pub const DEFAULT_DECAY_PERIOD_MS: u64 = 86_400_000;
pub const DEFAULT_FLOOR_PERCENTAGE: f64 = 0.2;

const RATE_TOLERANCE: f64 = 1e-9;
const PERCENTAGE_TOLERANCE: f64 = 1e-6;

// ============================================================================
// Seeds
// ============================================================================

/// One catalog entry handed to `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySeed {
    pub name: String,
    pub stock: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_period_ms: Option<u64>,
}

impl EntitySeed {
    pub fn new(name: &str, stock: f64) -> Self {
        Self {
            name: name.to_string(),
            stock,
            floor_percentage: None,
            decay_period_ms: None,
        }
    }

    pub fn floor_percentage(mut self, floor_percentage: f64) -> Self {
        self.floor_percentage = Some(floor_percentage);
        self
    }

    pub fn decay_period(mut self, period: Duration) -> Self {
        self.decay_period_ms = Some(period.as_millis().min(u64::MAX as u128) as u64);
        self
    }
}

/// Fallback parameters for seeds that do not override them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeedDefaults {
    pub floor_percentage: f64,
    pub decay_period_ms: u64,
}

impl Default for SeedDefaults {
    fn default() -> Self {
        Self {
            floor_percentage: DEFAULT_FLOOR_PERCENTAGE,
            decay_period_ms: DEFAULT_DECAY_PERIOD_MS,
        }
    }
}

/// Fully resolved, validated construction parameters for one entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayParams {
    pub initial_value: f64,
    pub floor_percentage: f64,
    pub decay_period_ms: u64,
}

impl DecayParams {
    /// Resolve a seed against the defaults and reject values that would
    /// produce a nonsensical decay curve.
    pub fn resolve(seed: &EntitySeed, defaults: &SeedDefaults) -> Result<Self> {
        if seed.name.trim().is_empty() {
            return Err(DecayError::invalid_seed(&seed.name, "name cannot be empty"));
        }

        let params = Self {
            initial_value: seed.stock,
            floor_percentage: seed.floor_percentage.unwrap_or(defaults.floor_percentage),
            decay_period_ms: seed.decay_period_ms.unwrap_or(defaults.decay_period_ms),
        };
        params.validate(&seed.name)?;
        Ok(params)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if !self.initial_value.is_finite() || self.initial_value < 0.0 {
            return Err(DecayError::invalid_seed(
                name,
                format!("initial value must be a finite number >= 0, got {}", self.initial_value),
            ));
        }
        if !self.floor_percentage.is_finite() || !(0.0..1.0).contains(&self.floor_percentage) {
            return Err(DecayError::invalid_seed(
                name,
                format!("floor percentage must be in [0, 1), got {}", self.floor_percentage),
            ));
        }
        if self.decay_period_ms == 0 {
            return Err(DecayError::invalid_seed(name, "decay period must be > 0"));
        }
        Ok(())
    }

    pub fn floor(&self) -> f64 {
        self.initial_value * self.floor_percentage
    }

    /// Units lost per millisecond while active.
    pub fn decay_rate(&self) -> f64 {
        self.initial_value * (1.0 - self.floor_percentage) / self.decay_period_ms as f64
    }
}

// ============================================================================
// Decay State
// ============================================================================

/// Lifecycle label derived from a state's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecayPhase {
    Idle,
    Active,
    Depleted,
}

/// Decay progress of one named entity.
///
/// The serialized form is keyed by name in the enclosing collection, so the
/// name itself is not written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DecayState {
    #[serde(skip)]
    pub name: String,
    pub initial_value: f64,
    pub floor_percentage: f64,
    #[serde(rename = "decayPeriod")]
    pub decay_period_ms: u64,
    pub decay_rate: f64,
    #[serde(deserialize_with = "required_nullable")]
    pub activation_timestamp: Option<DateTime<Utc>>,
    pub current_value: f64,
    pub percentage_remaining: f64,
    pub is_active: bool,
}

// A missing key must fail instead of defaulting to `None`.
fn required_nullable<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<DateTime<Utc>>::deserialize(deserializer)
}

impl DecayState {
    pub fn new(name: &str, params: DecayParams) -> Self {
        Self {
            name: name.to_string(),
            initial_value: params.initial_value,
            floor_percentage: params.floor_percentage,
            decay_period_ms: params.decay_period_ms,
            decay_rate: params.decay_rate(),
            activation_timestamp: None,
            current_value: params.initial_value,
            percentage_remaining: 100.0,
            is_active: false,
        }
    }

    pub fn params(&self) -> DecayParams {
        DecayParams {
            initial_value: self.initial_value,
            floor_percentage: self.floor_percentage,
            decay_period_ms: self.decay_period_ms,
        }
    }

    pub fn floor(&self) -> f64 {
        self.initial_value * self.floor_percentage
    }

    pub fn is_activated(&self) -> bool {
        self.activation_timestamp.is_some()
    }

    pub fn phase(&self) -> DecayPhase {
        match self.activation_timestamp {
            None => DecayPhase::Idle,
            Some(_) if self.current_value <= self.floor() => DecayPhase::Depleted,
            Some(_) => DecayPhase::Active,
        }
    }

    /// Back to Idle with freshly derived parameters.
    pub fn reset_to(&mut self, params: DecayParams) {
        let name = std::mem::take(&mut self.name);
        *self = Self::new(&name, params);
    }

    pub(crate) fn activate_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.activation_timestamp.is_some() {
            return false;
        }
        self.activation_timestamp = Some(now);
        self.is_active = true;
        true
    }

    /// Checks every invariant a restored record must satisfy.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        self.params().validate(&self.name).map_err(|err| err.to_string())?;

        let expected_rate = self.params().decay_rate();
        let rate_tolerance = RATE_TOLERANCE * expected_rate.abs() + f64::MIN_POSITIVE;
        if !self.decay_rate.is_finite()
            || (self.decay_rate - expected_rate).abs() > rate_tolerance
        {
            return Err(format!(
                "decay rate {} does not match derived rate {}",
                self.decay_rate, expected_rate
            ));
        }

        let floor = self.floor();
        let slack = RATE_TOLERANCE * self.initial_value.max(1.0);
        if !self.current_value.is_finite()
            || self.current_value < floor - slack
            || self.current_value > self.initial_value + slack
        {
            return Err(format!(
                "current value {} outside [{}, {}]",
                self.current_value, floor, self.initial_value
            ));
        }

        if !(0.0..=100.0).contains(&self.percentage_remaining) {
            return Err(format!(
                "percentage remaining {} outside [0, 100]",
                self.percentage_remaining
            ));
        }

        // A zero span has no meaningful percentage until the first recompute.
        let span = self.initial_value - floor;
        if span > 0.0 {
            let expected = ((self.current_value - floor) / span * 100.0).clamp(0.0, 100.0);
            if (self.percentage_remaining - expected).abs() > PERCENTAGE_TOLERANCE {
                return Err(format!(
                    "percentage remaining {} does not match current value ({} expected)",
                    self.percentage_remaining, expected
                ));
            }
        }

        if self.activation_timestamp.is_none()
            && (self.is_active || self.current_value != self.initial_value)
        {
            return Err("idle entity carries decay progress".to_string());
        }
        if self.activation_timestamp.is_some() && !self.is_active {
            return Err("activated entity is marked inactive".to_string());
        }

        Ok(())
    }
}

// ============================================================================
// Readings
// ============================================================================

/// What presentation code renders for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayReading {
    pub name: String,
    pub current_value: f64,
    pub percentage_remaining: f64,
    pub is_active: bool,
    pub phase: DecayPhase,
}

/// Time left until an entity reaches its floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRemaining {
    pub minutes: u64,
    pub seconds: u64,
}

impl TimeRemaining {
    pub const ZERO: Self = Self { minutes: 0, seconds: 0 };

    /// Whole seconds are truncated.
    pub fn from_millis(ms: f64) -> Self {
        if !ms.is_finite() || ms <= 0.0 {
            return Self::ZERO;
        }
        let total_seconds = (ms / 1000.0).floor() as u64;
        Self {
            minutes: total_seconds / 60,
            seconds: total_seconds % 60,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.minutes == 0 && self.seconds == 0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.minutes * 60 + self.seconds)
    }
}

impl std::fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}m {:02}s", self.minutes, self.seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params() -> DecayParams {
        DecayParams {
            initial_value: 100.0,
            floor_percentage: 0.2,
            decay_period_ms: DEFAULT_DECAY_PERIOD_MS,
        }
    }

    #[test]
    fn test_resolve_applies_defaults_and_overrides() {
        let defaults = SeedDefaults::default();
        let plain = DecayParams::resolve(&EntitySeed::new("widget", 50.0), &defaults).unwrap();
        assert_eq!(plain.floor_percentage, DEFAULT_FLOOR_PERCENTAGE);
        assert_eq!(plain.decay_period_ms, DEFAULT_DECAY_PERIOD_MS);

        let seed = EntitySeed::new("gadget", 10.0)
            .floor_percentage(0.5)
            .decay_period(Duration::from_secs(60));
        let custom = DecayParams::resolve(&seed, &defaults).unwrap();
        assert_eq!(custom.floor_percentage, 0.5);
        assert_eq!(custom.decay_period_ms, 60_000);
    }

    #[test]
    fn test_resolve_rejects_invalid_parameters() {
        let defaults = SeedDefaults::default();

        let negative = DecayParams::resolve(&EntitySeed::new("a", -1.0), &defaults);
        assert!(matches!(negative, Err(DecayError::InvalidSeed { .. })));

        let zero_period = EntitySeed {
            decay_period_ms: Some(0),
            ..EntitySeed::new("b", 10.0)
        };
        assert!(DecayParams::resolve(&zero_period, &defaults).is_err());

        let full_floor = EntitySeed::new("c", 10.0).floor_percentage(1.0);
        assert!(DecayParams::resolve(&full_floor, &defaults).is_err());

        assert!(DecayParams::resolve(&EntitySeed::new(" ", 10.0), &defaults).is_err());
        assert!(DecayParams::resolve(&EntitySeed::new("d", f64::NAN), &defaults).is_err());
    }

    #[test]
    fn test_new_state_is_idle_at_full_value() {
        let state = DecayState::new("widget", params());
        assert_eq!(state.current_value, 100.0);
        assert_eq!(state.percentage_remaining, 100.0);
        assert!(!state.is_active);
        assert_eq!(state.phase(), DecayPhase::Idle);
        assert!((state.decay_rate - 100.0 * 0.8 / 86_400_000.0).abs() < 1e-15);
        assert!(state.check_consistency().is_ok());
    }

    #[test]
    fn test_activate_is_idempotent() {
        let mut state = DecayState::new("widget", params());
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(state.activate_at(first));
        assert!(!state.activate_at(first + chrono::Duration::hours(1)));
        assert_eq!(state.activation_timestamp, Some(first));
        assert_eq!(state.phase(), DecayPhase::Active);
    }

    #[test]
    fn test_reset_keeps_name_and_rederives_rate() {
        let mut state = DecayState::new("widget", params());
        state.activate_at(Utc::now());
        state.current_value = 40.0;

        let restocked = DecayParams { initial_value: 200.0, ..params() };
        state.reset_to(restocked);

        assert_eq!(state.name, "widget");
        assert_eq!(state.current_value, 200.0);
        assert!(state.activation_timestamp.is_none());
        assert!((state.decay_rate - restocked.decay_rate()).abs() < 1e-15);
    }

    #[test]
    fn test_consistency_rejects_tampered_records() {
        let mut state = DecayState::new("widget", params());
        state.decay_rate *= 2.0;
        assert!(state.check_consistency().is_err());

        let mut state = DecayState::new("widget", params());
        state.current_value = 10.0;
        assert!(state.check_consistency().is_err());

        let mut state = DecayState::new("widget", params());
        state.is_active = true;
        assert!(state.check_consistency().is_err());

        let mut state = DecayState::new("widget", params());
        state.activate_at(Utc::now());
        state.current_value = 60.0;
        state.percentage_remaining = 50.0;
        assert!(state.check_consistency().is_ok());
        state.percentage_remaining = 90.0;
        assert!(state.check_consistency().is_err());
    }

    #[test]
    fn test_consistency_checks_small_rates_relatively() {
        // 1 unit over ten days decays at under 1e-9 per millisecond.
        let slow = DecayParams {
            initial_value: 1.0,
            floor_percentage: 0.2,
            decay_period_ms: 10 * DEFAULT_DECAY_PERIOD_MS,
        };
        let state = DecayState::new("pin", slow);
        assert!(state.decay_rate < 1e-9);
        assert!(state.check_consistency().is_ok());

        let mut stalled = state.clone();
        stalled.decay_rate = 0.0;
        assert!(stalled.check_consistency().is_err());

        let mut doubled = state;
        doubled.decay_rate *= 2.0;
        assert!(doubled.check_consistency().is_err());
    }

    #[test]
    fn test_serialized_layout_uses_camel_case_keys() {
        let state = DecayState::new("widget", params());
        let value = serde_json::to_value(&state).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "initialValue",
            "floorPercentage",
            "decayPeriod",
            "decayRate",
            "activationTimestamp",
            "currentValue",
            "percentageRemaining",
            "isActive",
        ] {
            assert!(object.contains_key(key), "missing key {key}");
        }
        assert!(!object.contains_key("name"));
    }

    #[test]
    fn test_missing_or_unknown_fields_fail_to_parse() {
        let state = DecayState::new("widget", params());
        let mut value = serde_json::to_value(&state).unwrap();
        value.as_object_mut().unwrap().remove("activationTimestamp");
        assert!(serde_json::from_value::<DecayState>(value).is_err());

        let mut value = serde_json::to_value(&state).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("legacyField".to_string(), serde_json::json!(1));
        assert!(serde_json::from_value::<DecayState>(value).is_err());
    }

    #[test]
    fn test_time_remaining_from_millis() {
        assert_eq!(TimeRemaining::from_millis(0.0), TimeRemaining::ZERO);
        assert_eq!(TimeRemaining::from_millis(-5.0), TimeRemaining::ZERO);
        let remaining = TimeRemaining::from_millis(125_900.0);
        assert_eq!(remaining, TimeRemaining { minutes: 2, seconds: 5 });
        assert_eq!(remaining.to_string(), "2m 05s");
        assert_eq!(remaining.as_duration(), Duration::from_secs(125));
    }
}
