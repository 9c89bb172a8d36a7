//! Memory circuit breakers for queries and the stats logs.
//!
//! [`ResourceGuard`] owns the policy: which breakers exist, what their limit
//! and overhead are, and when a settings refresh has to re-register them.
//! Usage accounting and the trip decision belong to a [`MemoryAccounting`]
//! implementation; [`TrackingAccounting`] is a simple in-process one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use humansize::{BINARY, format_size};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CircuitBreakingError;
use crate::settings::{BreakerSettings, StatsSettings};

/// Breaker guarding query execution memory.
pub const QUERY: &str = "query";
/// Breaker guarding the job and operation logs.
pub const LOGS: &str = "logs";

/// How a breaker accounts usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKind {
    /// Tracks usage and trips over the limit.
    Memory,
    /// Tracks usage, never trips.
    Noop,
}

/// Registered shape of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerConfig {
    pub name: String,
    /// Limit in bytes.
    pub limit: u64,
    /// Multiplier applied to estimates before comparing with the limit.
    pub overhead: f64,
    pub kind: BreakerKind,
}

impl BreakerConfig {
    #[must_use]
    pub fn memory(name: impl Into<String>, limit: u64, overhead: f64) -> Self {
        Self {
            name: name.into(),
            limit,
            overhead,
            kind: BreakerKind::Memory,
        }
    }

    /// Limit rendered in binary units, e.g. `500 B` or `1.50 GiB`.
    #[must_use]
    pub fn human_limit(&self) -> String {
        format_size(self.limit, BINARY)
    }
}

/// Trip message for an allocation `label` of `requested` bytes against
/// breaker `breaker` with `limit` bytes.
#[must_use]
pub fn breaking_message(breaker: &str, label: &str, requested: u64, limit: u64) -> String {
    format!(
        "[{breaker}] Data too large, data for [{label}] of [{requested}] bytes would be larger than limit of [{limit}/{}]",
        format_size(limit, BINARY)
    )
}

// =============================================================================
// MemoryAccounting
// =============================================================================

/// Usage tracking behind the breakers.
pub trait MemoryAccounting: Send + Sync {
    /// Create or replace a breaker. Replacing keeps its accounted usage.
    fn register_breaker(&self, config: &BreakerConfig);

    /// Bytes currently accounted to `name`.
    fn used(&self, name: &str) -> u64;

    /// Account `bytes` to `name`, or refuse if that would trip it.
    ///
    /// Returns the new usage.
    fn add_estimate(&self, name: &str, bytes: u64, label: &str) -> Result<u64, CircuitBreakingError>;

    /// Give `bytes` back to `name`.
    fn release(&self, name: &str, bytes: u64);
}

#[derive(Debug)]
struct TrackedBreaker {
    config: RwLock<BreakerConfig>,
    used: AtomicU64,
    trips: AtomicU64,
}

/// In-process accounting with one atomic usage counter per breaker.
#[derive(Debug, Default)]
pub struct TrackingAccounting {
    breakers: RwLock<BTreeMap<String, Arc<TrackedBreaker>>>,
}

impl TrackingAccounting {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, name: &str) -> Option<Arc<TrackedBreaker>> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        breakers.get(name).cloned()
    }

    /// How often `name` refused an estimate.
    #[must_use]
    pub fn trips(&self, name: &str) -> u64 {
        self.get(name)
            .map_or(0, |breaker| breaker.trips.load(Ordering::Relaxed))
    }

    /// Current config of `name`.
    #[must_use]
    pub fn config(&self, name: &str) -> Option<BreakerConfig> {
        self.get(name)
            .map(|breaker| breaker.config.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

impl MemoryAccounting for TrackingAccounting {
    fn register_breaker(&self, config: &BreakerConfig) {
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        match breakers.get(&config.name) {
            Some(existing) => {
                *existing.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
            }
            None => {
                breakers.insert(
                    config.name.clone(),
                    Arc::new(TrackedBreaker {
                        config: RwLock::new(config.clone()),
                        used: AtomicU64::new(0),
                        trips: AtomicU64::new(0),
                    }),
                );
            }
        }
    }

    fn used(&self, name: &str) -> u64 {
        self.get(name)
            .map_or(0, |breaker| breaker.used.load(Ordering::Acquire))
    }

    fn add_estimate(&self, name: &str, bytes: u64, label: &str) -> Result<u64, CircuitBreakingError> {
        let Some(breaker) = self.get(name) else {
            debug!(breaker = name, label, bytes, "Estimate for unregistered breaker ignored");
            return Ok(0);
        };
        let (limit, overhead, kind) = {
            let config = breaker.config.read().unwrap_or_else(|e| e.into_inner());
            (config.limit, config.overhead, config.kind)
        };

        let mut current = breaker.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if kind == BreakerKind::Memory && next as f64 * overhead > limit as f64 {
                breaker.trips.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = name, label, requested = bytes, used = current, limit, "Circuit breaker tripped");
                return Err(CircuitBreakingError {
                    breaker: name.to_string(),
                    requested: bytes,
                    limit,
                    message: breaking_message(name, label, bytes, limit),
                });
            }
            match breaker
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, name: &str, bytes: u64) {
        if let Some(breaker) = self.get(name) {
            let _ = breaker
                .used
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    Some(used.saturating_sub(bytes))
                });
        }
    }
}

// =============================================================================
// ResourceGuard
// =============================================================================

/// The query and logs breakers, kept in line with the effective settings.
pub struct ResourceGuard<A> {
    accounting: Arc<A>,
    available_memory: u64,
    registered: Mutex<BTreeMap<&'static str, BreakerConfig>>,
}

impl<A: MemoryAccounting> ResourceGuard<A> {
    /// Register both breakers from `settings`. Percentage limits resolve
    /// against `available_memory` bytes.
    pub fn new(accounting: Arc<A>, settings: &StatsSettings, available_memory: u64) -> Self {
        let guard = Self {
            accounting,
            available_memory,
            registered: Mutex::new(BTreeMap::new()),
        };
        guard.apply(settings);
        guard
    }

    fn desired(&self, name: &'static str, settings: BreakerSettings) -> BreakerConfig {
        BreakerConfig::memory(name, settings.limit.resolve(self.available_memory), settings.overhead)
    }

    /// Re-register every breaker whose limit or overhead changed.
    ///
    /// Returns the configs that were (re-)registered.
    #[allow(clippy::float_cmp)]
    pub fn apply(&self, settings: &StatsSettings) -> Vec<BreakerConfig> {
        let wanted = [
            self.desired(QUERY, settings.query_breaker),
            self.desired(LOGS, settings.logs_breaker),
        ];
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = Vec::new();
        for (name, config) in [QUERY, LOGS].into_iter().zip(wanted) {
            let unchanged = registered
                .get(name)
                .is_some_and(|old| old.limit == config.limit && old.overhead == config.overhead);
            if unchanged {
                continue;
            }
            self.accounting.register_breaker(&config);
            info!(
                breaker = name,
                limit = config.limit,
                limit_human = %config.human_limit(),
                overhead = config.overhead,
                "Circuit breaker registered"
            );
            registered.insert(name, config.clone());
            changed.push(config);
        }
        changed
    }

    /// Account `bytes` for `label` against breaker `name`.
    pub fn check(&self, name: &str, bytes: u64, label: &str) -> Result<u64, CircuitBreakingError> {
        self.accounting.add_estimate(name, bytes, label)
    }

    pub fn release(&self, name: &str, bytes: u64) {
        self.accounting.release(name, bytes);
    }

    /// Currently registered configs, by name.
    #[must_use]
    pub fn breakers(&self) -> Vec<BreakerConfig> {
        let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        registered.values().cloned().collect()
    }

    #[must_use]
    pub fn breaker(&self, name: &str) -> Option<BreakerConfig> {
        let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        registered.get(name).cloned()
    }

    #[must_use]
    pub fn accounting(&self) -> &Arc<A> {
        &self.accounting
    }

    #[must_use]
    pub fn available_memory(&self) -> u64 {
        self.available_memory
    }
}

impl<A> std::fmt::Debug for ResourceGuard<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("available_memory", &self.available_memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MemorySize, QUERY_BREAKER_LIMIT, QUERY_BREAKER_OVERHEAD, SettingsDelta};

    #[derive(Default)]
    struct RecordingAccounting {
        registrations: Mutex<Vec<BreakerConfig>>,
    }

    impl MemoryAccounting for RecordingAccounting {
        fn register_breaker(&self, config: &BreakerConfig) {
            self.registrations.lock().unwrap().push(config.clone());
        }

        fn used(&self, _name: &str) -> u64 {
            0
        }

        fn add_estimate(&self, _name: &str, bytes: u64, _label: &str) -> Result<u64, CircuitBreakingError> {
            Ok(bytes)
        }

        fn release(&self, _name: &str, _bytes: u64) {}
    }

    #[test]
    fn message_names_label_sizes_and_human_limit() {
        let msg = breaking_message(QUERY, "query", 1000, 500);
        assert!(msg.contains("query"));
        assert!(msg.contains("1000"));
        assert!(msg.contains("500"));
        assert!(msg.contains("500 B"));
        assert_eq!(
            msg,
            "[query] Data too large, data for [query] of [1000] bytes would be larger than limit of [500/500 B]"
        );
    }

    #[test]
    fn tracking_trips_over_limit() {
        let accounting = TrackingAccounting::new();
        accounting.register_breaker(&BreakerConfig::memory(QUERY, 500, 1.0));

        assert_eq!(accounting.add_estimate(QUERY, 400, "collect"), Ok(400));
        let err = accounting.add_estimate(QUERY, 200, "collect").unwrap_err();
        assert_eq!(err.breaker, QUERY);
        assert_eq!(err.requested, 200);
        assert!(err.message.contains("[500/500 B]"));
        assert_eq!(accounting.used(QUERY), 400);
        assert_eq!(accounting.trips(QUERY), 1);

        accounting.release(QUERY, 400);
        assert_eq!(accounting.add_estimate(QUERY, 200, "collect"), Ok(200));
    }

    #[test]
    fn overhead_scales_estimates() {
        let accounting = TrackingAccounting::new();
        accounting.register_breaker(&BreakerConfig::memory(LOGS, 1000, 2.0));
        assert!(accounting.add_estimate(LOGS, 500, "jobs").is_ok());
        assert!(accounting.add_estimate(LOGS, 1, "jobs").is_err());
    }

    #[test]
    fn reregistration_keeps_usage() {
        let accounting = TrackingAccounting::new();
        accounting.register_breaker(&BreakerConfig::memory(QUERY, 500, 1.0));
        accounting.add_estimate(QUERY, 300, "collect").unwrap();
        accounting.register_breaker(&BreakerConfig::memory(QUERY, 1000, 1.0));
        assert_eq!(accounting.used(QUERY), 300);
        assert_eq!(accounting.config(QUERY).map(|c| c.limit), Some(1000));
    }

    #[test]
    fn noop_breaker_never_trips() {
        let accounting = TrackingAccounting::new();
        accounting.register_breaker(&BreakerConfig {
            kind: BreakerKind::Noop,
            ..BreakerConfig::memory(QUERY, 1, 1.0)
        });
        assert_eq!(accounting.add_estimate(QUERY, 1_000, "collect"), Ok(1_000));
    }

    #[test]
    fn guard_resolves_percent_limits() {
        let guard = ResourceGuard::new(
            Arc::new(TrackingAccounting::new()),
            &StatsSettings::default(),
            1_000_000,
        );
        let query = guard.breaker(QUERY).unwrap();
        assert_eq!(query.limit, 600_000);
        assert_eq!(query.overhead, 1.09);
        assert_eq!(guard.breaker(LOGS).unwrap().limit, 50_000);
        assert_eq!(guard.breakers().len(), 2);
    }

    #[test]
    fn guard_reregisters_only_changed_breakers() {
        let accounting = Arc::new(RecordingAccounting::default());
        let settings = StatsSettings::default();
        let guard = ResourceGuard::new(Arc::clone(&accounting), &settings, 1 << 30);
        assert_eq!(accounting.registrations.lock().unwrap().len(), 2);

        assert!(guard.apply(&settings).is_empty());

        let next = settings
            .apply(&SettingsDelta::new().with(QUERY_BREAKER_OVERHEAD, "1.5"))
            .settings;
        let changed = guard.apply(&next);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, QUERY);
        assert_eq!(changed[0].overhead, 1.5);
        assert_eq!(accounting.registrations.lock().unwrap().len(), 3);

        // Same effective limit spelled differently is not a change.
        let same = next
            .apply(&SettingsDelta::new().with(QUERY_BREAKER_LIMIT, "60%"))
            .settings;
        assert_eq!(same.query_breaker.limit, MemorySize::Percent(60.0));
        assert!(guard.apply(&same).is_empty());
    }

    #[test]
    fn guard_check_surfaces_trip() {
        let guard = ResourceGuard::new(
            Arc::new(TrackingAccounting::new()),
            &StatsSettings::default()
                .apply(&SettingsDelta::new().with(QUERY_BREAKER_LIMIT, "500b").with(QUERY_BREAKER_OVERHEAD, "1.0"))
                .settings,
            1 << 30,
        );
        let err = guard.check(QUERY, 1000, "select").unwrap_err();
        assert!(err.to_string().contains("500 B"));
        guard.release(QUERY, 0);
        assert_eq!(guard.accounting().used(QUERY), 0);
    }
}
