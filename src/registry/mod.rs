//! Authoritative in-memory collection of decay states.
//!
//! All mutation goes through one `RwLock` write guard, and every write
//! replaces whole `DecayState` values, so readers see an entity either
//! before or after a change, never in between. Readers clone an
//! `im::OrdMap`, which is O(1) and shares structure with the live map.

use crate::core::{DecayError, DecayParams, DecayState, EntitySeed, Result, SeedDefaults};
use crate::decay::Computed;
use chrono::{DateTime, Utc};
use im::OrdMap;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitializeReport {
    pub created: usize,
    pub kept: usize,
    pub dropped: usize,
}

/// A value computed outside the lock, committed only if the entity is
/// still on the curve it was computed from: same activation, same
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub name: String,
    pub activation: DateTime<Utc>,
    pub params: DecayParams,
    pub computed: Computed,
}

impl PendingUpdate {
    pub fn new(state: &DecayState, activation: DateTime<Utc>, computed: Computed) -> Self {
        Self {
            name: state.name.clone(),
            activation,
            params: state.params(),
            computed,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    states: OrdMap<String, DecayState>,
    /// Latest catalog parameters per name, used by `reset`.
    seeds: HashMap<String, DecayParams>,
    /// Bumped on every committed change.
    revision: u64,
}

pub struct Registry {
    inner: RwLock<RegistryInner>,
    defaults: SeedDefaults,
}

impl Registry {
    pub fn new(defaults: SeedDefaults) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            defaults,
        }
    }

    /// Starts from previously persisted states. Seeds arrive with the next
    /// `initialize`.
    pub fn with_states(defaults: SeedDefaults, states: OrdMap<String, DecayState>) -> Self {
        let registry = Self::new(defaults);
        registry.write().states = states;
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn defaults(&self) -> SeedDefaults {
        self.defaults
    }

    /// Syncs the collection with a catalog.
    ///
    /// New names get a fresh Idle state, names missing from `seeds` are
    /// dropped, and names already present keep their progress. The whole
    /// batch is validated before anything changes.
    pub fn initialize(&self, seeds: &[EntitySeed]) -> Result<InitializeReport> {
        let mut resolved = Vec::with_capacity(seeds.len());
        let mut seen = HashSet::with_capacity(seeds.len());
        for seed in seeds {
            if !seen.insert(seed.name.as_str()) {
                return Err(DecayError::invalid_seed(&seed.name, "duplicate name in catalog"));
            }
            resolved.push((seed.name.clone(), DecayParams::resolve(seed, &self.defaults)?));
        }

        let mut inner = self.write();
        let mut report = InitializeReport::default();
        let mut next = OrdMap::new();
        let mut next_seeds = HashMap::with_capacity(resolved.len());

        for (name, params) in resolved {
            match inner.states.get(&name) {
                Some(existing) => {
                    next.insert(name.clone(), existing.clone());
                    report.kept += 1;
                }
                None => {
                    next.insert(name.clone(), DecayState::new(&name, params));
                    report.created += 1;
                }
            }
            next_seeds.insert(name, params);
        }
        report.dropped = inner.states.len() - report.kept;

        inner.states = next;
        inner.seeds = next_seeds;
        if report.created > 0 || report.dropped > 0 {
            inner.revision += 1;
        }

        info!(
            created = report.created,
            kept = report.kept,
            dropped = report.dropped,
            "decay registry initialized"
        );
        Ok(report)
    }

    /// Starts the decay clock for `name`. Returns `false` when the entity is
    /// unknown or was already activated.
    pub fn activate(&self, name: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.write();
        let activated = inner
            .states
            .get_mut(name)
            .map(|state| state.activate_at(now))
            .unwrap_or(false);
        if activated {
            inner.revision += 1;
            debug!(entity = name, at = %now, "decay activated");
        }
        activated
    }

    /// Returns `name` to Idle using the latest catalog parameters for it.
    pub fn reset(&self, name: &str) -> bool {
        let mut inner = self.write();
        let seed = inner.seeds.get(name).copied();
        let Some(state) = inner.states.get_mut(name) else {
            return false;
        };
        let params = seed.unwrap_or_else(|| state.params());
        state.reset_to(params);
        inner.revision += 1;
        debug!(entity = name, "decay reset");
        true
    }

    /// Resets every entity; returns how many were reset.
    pub fn reset_all(&self) -> usize {
        let mut inner = self.write();
        let names: Vec<String> = inner.states.keys().cloned().collect();
        for name in &names {
            let seed = inner.seeds.get(name).copied();
            if let Some(state) = inner.states.get_mut(name) {
                let params = seed.unwrap_or_else(|| state.params());
                state.reset_to(params);
            }
        }
        if !names.is_empty() {
            inner.revision += 1;
        }
        debug!(count = names.len(), "decay reset for all entities");
        names.len()
    }

    /// Commits recomputed values under a single write guard; returns how
    /// many were applied. Each update is dropped if its entity is gone, was
    /// reset or re-activated since the value was computed, or if the value
    /// would move upward.
    pub(crate) fn apply_computed(&self, updates: &[PendingUpdate]) -> usize {
        if updates.is_empty() {
            return 0;
        }
        let mut inner = self.write();
        let applied = updates
            .iter()
            .filter(|update| Self::apply_locked(&mut inner.states, update))
            .count();
        if applied > 0 {
            inner.revision += 1;
        }
        applied
    }

    fn apply_locked(states: &mut OrdMap<String, DecayState>, update: &PendingUpdate) -> bool {
        let Some(state) = states.get_mut(&update.name) else {
            return false;
        };
        if state.activation_timestamp != Some(update.activation)
            || state.params() != update.params
        {
            return false;
        }
        let value = update.computed.current_value;
        if value > state.current_value || value < state.floor() {
            return false;
        }
        state.current_value = update.computed.current_value;
        state.percentage_remaining = update.computed.percentage_remaining;
        true
    }

    pub fn query(&self, name: &str) -> Option<DecayState> {
        self.read().states.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().states.contains_key(name)
    }

    /// Point-in-time copy of the whole collection.
    pub fn snapshot(&self) -> OrdMap<String, DecayState> {
        self.read().states.clone()
    }

    /// Snapshot together with the revision it corresponds to.
    pub fn versioned_snapshot(&self) -> (u64, OrdMap<String, DecayState>) {
        let inner = self.read();
        (inner.revision, inner.states.clone())
    }

    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    pub fn names(&self) -> Vec<String> {
        self.read().states.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().states.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(SeedDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decay::compute;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn catalog() -> Vec<EntitySeed> {
        vec![EntitySeed::new("lamp", 100.0), EntitySeed::new("chair", 40.0)]
    }

    fn update_at(registry: &Registry, name: &str, now: DateTime<Utc>) -> PendingUpdate {
        let state = registry.query(name).unwrap();
        PendingUpdate::new(&state, state.activation_timestamp.unwrap(), compute(&state, now))
    }

    #[test]
    fn test_initialize_creates_idle_states() {
        let registry = Registry::default();
        let report = registry.initialize(&catalog()).unwrap();
        assert_eq!(report, InitializeReport { created: 2, kept: 0, dropped: 0 });

        let lamp = registry.query("lamp").unwrap();
        assert_eq!(lamp.current_value, 100.0);
        assert!(lamp.activation_timestamp.is_none());
        assert!(registry.query("sofa").is_none());
    }

    #[test]
    fn test_reinitialize_keeps_progress_and_drops_missing() {
        let registry = Registry::default();
        registry.initialize(&catalog()).unwrap();
        registry.activate("lamp", t0());

        let report = registry
            .initialize(&[EntitySeed::new("lamp", 100.0), EntitySeed::new("sofa", 7.0)])
            .unwrap();
        assert_eq!(report, InitializeReport { created: 1, kept: 1, dropped: 1 });
        assert_eq!(registry.query("lamp").unwrap().activation_timestamp, Some(t0()));
        assert!(!registry.contains("chair"));
        assert!(registry.contains("sofa"));
    }

    #[test]
    fn test_invalid_batch_changes_nothing() {
        let registry = Registry::default();
        registry.initialize(&catalog()).unwrap();
        let revision = registry.revision();

        let result =
            registry.initialize(&[EntitySeed::new("lamp", 100.0), EntitySeed::new("bad", -3.0)]);
        assert!(matches!(result, Err(DecayError::InvalidSeed { ref name, .. }) if name == "bad"));

        let duplicate =
            registry.initialize(&[EntitySeed::new("x", 1.0), EntitySeed::new("x", 2.0)]);
        assert!(duplicate.is_err());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.revision(), revision);
    }

    #[test]
    fn test_activate_is_idempotent_and_ignores_unknown() {
        let registry = Registry::default();
        registry.initialize(&catalog()).unwrap();

        assert!(registry.activate("lamp", t0()));
        assert!(!registry.activate("lamp", t0() + Duration::hours(2)));
        assert_eq!(registry.query("lamp").unwrap().activation_timestamp, Some(t0()));
        assert!(!registry.activate("ghost", t0()));
    }

    #[test]
    fn test_reset_uses_latest_catalog_stock() {
        let registry = Registry::default();
        registry.initialize(&catalog()).unwrap();
        registry.activate("lamp", t0());
        let update = update_at(&registry, "lamp", t0() + Duration::hours(6));
        assert_eq!(registry.apply_computed(&[update]), 1);

        registry
            .initialize(&[EntitySeed::new("lamp", 250.0), EntitySeed::new("chair", 40.0)])
            .unwrap();
        // Re-initializing alone leaves the running decay untouched.
        assert_eq!(registry.query("lamp").unwrap().initial_value, 100.0);

        assert!(registry.reset("lamp"));
        let lamp = registry.query("lamp").unwrap();
        assert_eq!(lamp.initial_value, 250.0);
        assert_eq!(lamp.current_value, 250.0);
        assert_eq!(lamp.percentage_remaining, 100.0);
        assert!(!lamp.is_active);
        assert!(!registry.reset("ghost"));
    }

    #[test]
    fn test_reset_all_returns_everything_to_idle() {
        let registry = Registry::default();
        registry.initialize(&catalog()).unwrap();
        registry.activate("lamp", t0());
        registry.activate("chair", t0());

        assert_eq!(registry.reset_all(), 2);
        for name in registry.names() {
            assert!(registry.query(&name).unwrap().activation_timestamp.is_none());
        }
    }

    #[test]
    fn test_apply_rejects_stale_and_upward_updates() {
        let registry = Registry::default();
        registry.initialize(&catalog()).unwrap();
        registry.activate("lamp", t0());

        let later = update_at(&registry, "lamp", t0() + Duration::hours(10));
        let earlier = update_at(&registry, "lamp", t0() + Duration::hours(1));
        assert_eq!(registry.apply_computed(&[later.clone()]), 1);
        assert_eq!(registry.apply_computed(&[earlier]), 0);

        registry.reset("lamp");
        assert_eq!(registry.apply_computed(&[later]), 0);
        assert_eq!(registry.query("lamp").unwrap().current_value, 100.0);
    }

    #[test]
    fn test_update_from_previous_curve_is_rejected_after_reseed() {
        let registry = Registry::default();
        registry.initialize(&catalog()).unwrap();
        registry.activate("lamp", t0());
        let stale = update_at(&registry, "lamp", t0() + Duration::hours(12));

        // Reseeded, reset and re-activated at the same instant before the
        // stale value is committed.
        registry
            .initialize(&[EntitySeed::new("lamp", 500.0), EntitySeed::new("chair", 40.0)])
            .unwrap();
        assert!(registry.reset("lamp"));
        assert!(registry.activate("lamp", t0()));
        let revision = registry.revision();

        assert_eq!(registry.apply_computed(&[stale]), 0);
        let lamp = registry.query("lamp").unwrap();
        assert_eq!(lamp.initial_value, 500.0);
        assert_eq!(lamp.current_value, 500.0);
        assert!(lamp.current_value >= lamp.floor());
        assert_eq!(registry.revision(), revision);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let registry = Registry::default();
        registry.initialize(&catalog()).unwrap();
        let (revision, snapshot) = registry.versioned_snapshot();

        registry.activate("lamp", t0());
        assert!(snapshot.get("lamp").unwrap().activation_timestamp.is_none());
        assert!(registry.revision() > revision);
    }
}
