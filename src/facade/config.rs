use crate::core::{
    DEFAULT_DECAY_PERIOD_MS, DEFAULT_FLOOR_PERCENTAGE, DecayError, Result, SeedDefaults,
};
use crate::scheduler::DEFAULT_TICK_INTERVAL;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Decay engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How often active entities are recomputed
    pub tick_interval: Duration,

    /// Upper bound for a single snapshot load or save
    pub persist_timeout: Duration,

    /// Floor fraction for seeds that do not set one
    pub default_floor_percentage: f64,

    /// Decay period for seeds that do not set one
    pub default_decay_period: Duration,

    /// Whether activate/reset also schedule a snapshot write
    pub persist_on_lifecycle: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            persist_timeout: Duration::from_secs(2),
            default_floor_percentage: DEFAULT_FLOOR_PERCENTAGE,
            default_decay_period: Duration::from_millis(DEFAULT_DECAY_PERIOD_MS),
            persist_on_lifecycle: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tick interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the persistence timeout
    pub fn persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    /// Set the default floor fraction
    pub fn default_floor_percentage(mut self, floor_percentage: f64) -> Self {
        self.default_floor_percentage = floor_percentage;
        self
    }

    /// Set the default decay period
    pub fn default_decay_period(mut self, period: Duration) -> Self {
        self.default_decay_period = period;
        self
    }

    pub fn persist_on_lifecycle(mut self, enabled: bool) -> Self {
        self.persist_on_lifecycle = enabled;
        self
    }

    pub fn seed_defaults(&self) -> SeedDefaults {
        SeedDefaults {
            floor_percentage: self.default_floor_percentage,
            decay_period_ms: duration_ms(self.default_decay_period),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(DecayError::InvalidConfig("tick_interval must be > 0".to_string()));
        }

        if self.persist_timeout.is_zero() {
            return Err(DecayError::InvalidConfig("persist_timeout must be > 0".to_string()));
        }

        if !self.default_floor_percentage.is_finite()
            || !(0.0..1.0).contains(&self.default_floor_percentage)
        {
            return Err(DecayError::InvalidConfig(format!(
                "default_floor_percentage must be in [0, 1), got {}",
                self.default_floor_percentage
            )));
        }

        if duration_ms(self.default_decay_period) == 0 {
            return Err(DecayError::InvalidConfig(
                "default_decay_period must be at least 1ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse a JSON config document. Missing keys keep their defaults.
    ///
    /// ```ignore
    /// {"tickIntervalMs": 1000, "defaultFloorPercentage": 0.1}
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: ConfigDocument = serde_json::from_str(json)
            .map_err(|e| DecayError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        let config = Self::from(document);
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DecayError::InvalidConfig(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(&ConfigDocument::from(self))
            .map_err(|e| DecayError::Serialization(format!("Failed to encode config: {}", e)))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigDocument {
    tick_interval_ms: u64,
    persist_timeout_ms: u64,
    default_floor_percentage: f64,
    default_decay_period_ms: u64,
    persist_on_lifecycle: bool,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ConfigDocument {
    fn from(config: &EngineConfig) -> Self {
        Self {
            tick_interval_ms: duration_ms(config.tick_interval),
            persist_timeout_ms: duration_ms(config.persist_timeout),
            default_floor_percentage: config.default_floor_percentage,
            default_decay_period_ms: duration_ms(config.default_decay_period),
            persist_on_lifecycle: config.persist_on_lifecycle,
        }
    }
}

impl From<ConfigDocument> for EngineConfig {
    fn from(document: ConfigDocument) -> Self {
        Self {
            tick_interval: Duration::from_millis(document.tick_interval_ms),
            persist_timeout: Duration::from_millis(document.persist_timeout_ms),
            default_floor_percentage: document.default_floor_percentage,
            default_decay_period: Duration::from_millis(document.default_decay_period_ms),
            persist_on_lifecycle: document.persist_on_lifecycle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.seed_defaults(), SeedDefaults::default());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = EngineConfig::new()
            .tick_interval(Duration::from_millis(250))
            .default_floor_percentage(0.5)
            .persist_on_lifecycle(false);
        assert!(config.validate().is_ok());
        assert_eq!(config.seed_defaults().floor_percentage, 0.5);

        assert!(EngineConfig::new().tick_interval(Duration::ZERO).validate().is_err());
        assert!(EngineConfig::new().default_floor_percentage(1.0).validate().is_err());
        assert!(
            EngineConfig::new()
                .default_decay_period(Duration::from_micros(10))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_from_json_fills_missing_keys() {
        let config = EngineConfig::from_json_str(r#"{"tickIntervalMs": 1000}"#).unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.persist_timeout, EngineConfig::default().persist_timeout);

        assert!(EngineConfig::from_json_str(r#"{"tickIntervalMs": 0}"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = EngineConfig::new().default_decay_period(Duration::from_secs(3600));
        let json = config.to_json_string().unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }
}
