//! Effective stats settings and the refresh function.
//!
//! Settings arrive as string-valued key changes ([`SettingsDelta`]), from a
//! TOML file or from `key=value` overrides. [`StatsSettings::apply`] folds a
//! delta into the previous effective settings. Each key is parsed on its
//! own: an invalid value is rejected and the previous value kept, while the
//! other keys of the same delta still apply. Keys not mentioned keep their
//! previous value.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::queue::RetentionPolicy;

pub const STATS_ENABLED: &str = "stats.enabled";
pub const JOBS_LOG_SIZE: &str = "stats.jobs_log_size";
pub const JOBS_LOG_EXPIRATION: &str = "stats.jobs_log_expiration";
pub const OPERATIONS_LOG_SIZE: &str = "stats.operations_log_size";
pub const OPERATIONS_LOG_EXPIRATION: &str = "stats.operations_log_expiration";
pub const SWEEP_INTERVAL: &str = "stats.sweep_interval";
pub const QUERY_BREAKER_LIMIT: &str = "indices.breaker.query.limit";
pub const QUERY_BREAKER_OVERHEAD: &str = "indices.breaker.query.overhead";
pub const LOGS_BREAKER_LIMIT: &str = "stats.breaker.logs.limit";
pub const LOGS_BREAKER_OVERHEAD: &str = "stats.breaker.logs.overhead";

const DEFAULT_LOG_SIZE: usize = 10_000;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_QUERY_LIMIT_PERCENT: f64 = 60.0;
const DEFAULT_QUERY_OVERHEAD: f64 = 1.09;
const DEFAULT_LOGS_LIMIT_PERCENT: f64 = 5.0;
const DEFAULT_LOGS_OVERHEAD: f64 = 1.0;

/// Every key the stats service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    Enabled,
    JobsLogSize,
    JobsLogExpiration,
    OperationsLogSize,
    OperationsLogExpiration,
    SweepInterval,
    QueryBreakerLimit,
    QueryBreakerOverhead,
    LogsBreakerLimit,
    LogsBreakerOverhead,
}

impl SettingKey {
    pub const ALL: [Self; 10] = [
        Self::Enabled,
        Self::JobsLogSize,
        Self::JobsLogExpiration,
        Self::OperationsLogSize,
        Self::OperationsLogExpiration,
        Self::SweepInterval,
        Self::QueryBreakerLimit,
        Self::QueryBreakerOverhead,
        Self::LogsBreakerLimit,
        Self::LogsBreakerOverhead,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => STATS_ENABLED,
            Self::JobsLogSize => JOBS_LOG_SIZE,
            Self::JobsLogExpiration => JOBS_LOG_EXPIRATION,
            Self::OperationsLogSize => OPERATIONS_LOG_SIZE,
            Self::OperationsLogExpiration => OPERATIONS_LOG_EXPIRATION,
            Self::SweepInterval => SWEEP_INTERVAL,
            Self::QueryBreakerLimit => QUERY_BREAKER_LIMIT,
            Self::QueryBreakerOverhead => QUERY_BREAKER_OVERHEAD,
            Self::LogsBreakerLimit => LOGS_BREAKER_LIMIT,
            Self::LogsBreakerOverhead => LOGS_BREAKER_OVERHEAD,
        }
    }
}

impl std::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SettingKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ConfigError::invalid(s, "unknown setting"))
    }
}

// =============================================================================
// Value types
// =============================================================================

/// A memory limit: absolute bytes or a share of available memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemorySize {
    Bytes(u64),
    Percent(f64),
}

impl MemorySize {
    /// Parse `500`, `500b`, `64kb`, `1.5gb`, `60%` (binary multiples).
    pub fn parse(raw: &str) -> Result<Self, String> {
        let value = raw.trim().to_ascii_lowercase();
        if let Some(percent) = value.strip_suffix('%') {
            let percent: f64 = percent
                .trim()
                .parse()
                .map_err(|_| format!("`{raw}` is not a percentage"))?;
            if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
                return Err(format!("`{raw}` must be between 0% and 100%"));
            }
            return Ok(Self::Percent(percent));
        }

        let (number, unit) = split_unit(&value);
        let multiplier: u64 = match unit {
            "" | "b" => 1,
            "k" | "kb" => 1 << 10,
            "m" | "mb" => 1 << 20,
            "g" | "gb" => 1 << 30,
            "t" | "tb" => 1 << 40,
            _ => return Err(format!("`{raw}` has an unknown size unit `{unit}`")),
        };
        let number: f64 = number
            .parse()
            .map_err(|_| format!("`{raw}` is not a byte size"))?;
        if !number.is_finite() || number < 0.0 {
            return Err(format!("`{raw}` must be a non-negative byte size"));
        }
        Ok(Self::Bytes((number * multiplier as f64) as u64))
    }

    /// Absolute byte count given the node's available memory.
    #[must_use]
    pub fn resolve(self, available_bytes: u64) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Percent(percent) => (available_bytes as f64 * percent / 100.0) as u64,
        }
    }
}

impl std::fmt::Display for MemorySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "{bytes}b"),
            Self::Percent(percent) => write!(f, "{percent}%"),
        }
    }
}

impl Serialize for MemorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Render a duration the way settings files spell it.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms == 0 {
        "0s".to_string()
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*duration))
}

fn split_unit(value: &str) -> (&str, &str) {
    let at = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    (value[..at].trim(), value[at..].trim())
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("`{raw}` is not a boolean")),
    }
}

fn parse_count(raw: &str) -> Result<usize, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("`{raw}` must be a non-negative integer"))
}

/// Parse `250`, `250ms`, `10s`, `5m`, `1h`, `2d`. Bare numbers are ms.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let value = raw.trim().to_ascii_lowercase();
    let (number, unit) = split_unit(&value);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("`{raw}` must be a non-negative duration"))?;
    let ms_per_unit: u64 = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(format!("`{raw}` has an unknown time unit `{unit}`")),
    };
    number
        .checked_mul(ms_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("`{raw}` is too large"))
}

fn parse_overhead(raw: &str) -> Result<f64, String> {
    let overhead: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{raw}` is not a number"))?;
    if !overhead.is_finite() || overhead < 0.0 {
        return Err(format!("`{raw}` must be a non-negative number"));
    }
    Ok(overhead)
}

// =============================================================================
// StatsSettings
// =============================================================================

/// Limit and overhead of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerSettings {
    pub limit: MemorySize,
    pub overhead: f64,
}

/// The effective configuration of the stats service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSettings {
    pub enabled: bool,
    pub jobs_log_size: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub jobs_log_expiration: Duration,
    pub operations_log_size: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub operations_log_expiration: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub sweep_interval: Duration,
    pub query_breaker: BreakerSettings,
    pub logs_breaker: BreakerSettings,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            jobs_log_size: DEFAULT_LOG_SIZE,
            jobs_log_expiration: Duration::ZERO,
            operations_log_size: DEFAULT_LOG_SIZE,
            operations_log_expiration: Duration::ZERO,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            query_breaker: BreakerSettings {
                limit: MemorySize::Percent(DEFAULT_QUERY_LIMIT_PERCENT),
                overhead: DEFAULT_QUERY_OVERHEAD,
            },
            logs_breaker: BreakerSettings {
                limit: MemorySize::Percent(DEFAULT_LOGS_LIMIT_PERCENT),
                overhead: DEFAULT_LOGS_OVERHEAD,
            },
        }
    }
}

/// Result of folding a delta into the effective settings.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// The new effective settings.
    pub settings: StatsSettings,
    /// Keys whose value was accepted.
    pub applied: Vec<SettingKey>,
    /// Keys whose value was rejected; their previous value is kept.
    pub rejected: Vec<ConfigError>,
    /// Keys that are not stats settings.
    pub ignored: Vec<String>,
}

impl StatsSettings {
    /// Defaults overridden by `delta`.
    #[must_use]
    pub fn from_delta(delta: &SettingsDelta) -> RefreshOutcome {
        Self::default().apply(delta)
    }

    #[must_use]
    pub fn jobs_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            enabled: self.enabled,
            capacity: self.jobs_log_size,
            expiry: self.jobs_log_expiration,
        }
    }

    #[must_use]
    pub fn operations_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            enabled: self.enabled,
            capacity: self.operations_log_size,
            expiry: self.operations_log_expiration,
        }
    }

    /// Fold `delta` into a copy of these settings.
    #[must_use]
    pub fn apply(&self, delta: &SettingsDelta) -> RefreshOutcome {
        let mut next = self.clone();
        let mut applied = Vec::new();
        let mut rejected = Vec::new();
        let mut ignored = Vec::new();

        for (raw_key, raw_value) in delta.iter() {
            let Ok(key) = raw_key.parse::<SettingKey>() else {
                debug!(key = raw_key, "Ignoring unknown setting");
                ignored.push(raw_key.to_string());
                continue;
            };
            match next.set(key, raw_value) {
                Ok(()) => applied.push(key),
                Err(reason) => {
                    warn!(key = raw_key, value = raw_value, %reason, "Rejected setting value");
                    rejected.push(ConfigError::invalid(raw_key, reason));
                }
            }
        }

        RefreshOutcome {
            settings: next,
            applied,
            rejected,
            ignored,
        }
    }

    fn set(&mut self, key: SettingKey, raw: &str) -> Result<(), String> {
        match key {
            SettingKey::Enabled => self.enabled = parse_bool(raw)?,
            SettingKey::JobsLogSize => self.jobs_log_size = parse_count(raw)?,
            SettingKey::JobsLogExpiration => self.jobs_log_expiration = parse_duration(raw)?,
            SettingKey::OperationsLogSize => self.operations_log_size = parse_count(raw)?,
            SettingKey::OperationsLogExpiration => {
                self.operations_log_expiration = parse_duration(raw)?;
            }
            SettingKey::SweepInterval => {
                let interval = parse_duration(raw)?;
                if interval.is_zero() {
                    return Err("sweep interval must be greater than zero".to_string());
                }
                self.sweep_interval = interval;
            }
            SettingKey::QueryBreakerLimit => self.query_breaker.limit = MemorySize::parse(raw)?,
            SettingKey::QueryBreakerOverhead => self.query_breaker.overhead = parse_overhead(raw)?,
            SettingKey::LogsBreakerLimit => self.logs_breaker.limit = MemorySize::parse(raw)?,
            SettingKey::LogsBreakerOverhead => self.logs_breaker.overhead = parse_overhead(raw)?,
        }
        Ok(())
    }
}

// =============================================================================
// SettingsDelta
// =============================================================================

/// A set of changed settings, keyed by their dotted name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettingsDelta {
    values: BTreeMap<String, String>,
}

impl SettingsDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Self::set`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set `key` to `value`, replacing an earlier value for the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overlay `other` on top of this delta.
    pub fn merge(&mut self, other: Self) {
        self.values.extend(other.values);
    }

    /// Parse one `key=value` override.
    pub fn parse_assignment(raw: &str) -> Result<(String, String), ConfigError> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| ConfigError::ParseFailed(format!("expected key=value, got `{raw}`")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::ParseFailed(format!("missing key in `{raw}`")));
        }
        Ok((key.to_string(), value.trim().to_string()))
    }

    /// Parse a TOML document. Nested tables become dotted keys, so
    /// `[stats] enabled = true` and `"stats.enabled" = true` are equivalent.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = contents
            .parse()
            .map_err(|e: toml::de::Error| ConfigError::ParseFailed(e.to_string()))?;
        let mut delta = Self::new();
        flatten_into(&mut delta, None, &table)?;
        Ok(delta)
    }

    /// Read and parse a TOML settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(shown));
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(shown, e.to_string()))?;
        Self::from_toml_str(&contents)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SettingsDelta {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut delta = Self::new();
        for (key, value) in iter {
            delta.set(key, value);
        }
        delta
    }
}

fn flatten_into(
    delta: &mut SettingsDelta,
    prefix: Option<&str>,
    table: &toml::Table,
) -> Result<(), ConfigError> {
    for (name, value) in table {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.clone(),
        };
        let rendered = match value {
            toml::Value::Table(inner) => {
                flatten_into(delta, Some(&key), inner)?;
                continue;
            }
            toml::Value::String(s) => s.clone(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            toml::Value::Array(_) | toml::Value::Datetime(_) => {
                return Err(ConfigError::invalid(key, "expected a string, number or boolean"));
            }
        };
        delta.set(key, rendered);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = StatsSettings::default();
        assert!(!settings.enabled);
        assert_eq!(settings.jobs_log_size, 10_000);
        assert_eq!(settings.operations_log_size, 10_000);
        assert_eq!(settings.sweep_interval, Duration::from_secs(1));
        assert_eq!(settings.query_breaker.limit, MemorySize::Percent(60.0));
        assert_eq!(settings.logs_breaker.limit, MemorySize::Percent(5.0));
        assert_eq!(settings.jobs_policy(), RetentionPolicy {
            enabled: false,
            capacity: 10_000,
            expiry: Duration::ZERO,
        });
    }

    #[test]
    fn partial_refresh_keeps_untouched_keys() {
        let first = StatsSettings::default()
            .apply(&SettingsDelta::new().with(STATS_ENABLED, "true").with(JOBS_LOG_SIZE, "50"))
            .settings;
        let second = first.apply(&SettingsDelta::new().with(OPERATIONS_LOG_SIZE, "7"));
        assert!(second.settings.enabled);
        assert_eq!(second.settings.jobs_log_size, 50);
        assert_eq!(second.settings.operations_log_size, 7);
        assert_eq!(second.applied, vec![SettingKey::OperationsLogSize]);
    }

    #[test]
    fn invalid_value_is_rejected_per_key() {
        let delta = SettingsDelta::new()
            .with(JOBS_LOG_SIZE, "-1")
            .with(OPERATIONS_LOG_SIZE, "20")
            .with(QUERY_BREAKER_OVERHEAD, "-0.5")
            .with(SWEEP_INTERVAL, "0s");
        let outcome = StatsSettings::default().apply(&delta);

        assert_eq!(outcome.settings.jobs_log_size, 10_000);
        assert_eq!(outcome.settings.operations_log_size, 20);
        assert_eq!(outcome.settings.query_breaker.overhead, 1.09);
        assert_eq!(outcome.settings.sweep_interval, Duration::from_secs(1));
        assert_eq!(outcome.rejected.len(), 3);
        assert!(outcome.rejected.iter().any(|e| matches!(
            e,
            ConfigError::InvalidValue { key, .. } if key == JOBS_LOG_SIZE
        )));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let outcome = StatsSettings::default()
            .apply(&SettingsDelta::new().with("stats.mystery", "1"));
        assert_eq!(outcome.ignored, vec!["stats.mystery".to_string()]);
        assert!(outcome.rejected.is_empty());
        assert_eq!(outcome.settings, StatsSettings::default());
    }

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("250"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration(" 2d "), Ok(Duration::from_secs(172_800)));
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test]
    fn memory_sizes_parse_and_resolve() {
        assert_eq!(MemorySize::parse("500"), Ok(MemorySize::Bytes(500)));
        assert_eq!(MemorySize::parse("64kb"), Ok(MemorySize::Bytes(65_536)));
        assert_eq!(MemorySize::parse("1.5GB"), Ok(MemorySize::Bytes(1_610_612_736)));
        assert_eq!(MemorySize::parse("60%"), Ok(MemorySize::Percent(60.0)));
        assert!(MemorySize::parse("150%").is_err());
        assert!(MemorySize::parse("-3mb").is_err());
        assert!(MemorySize::parse("3 parsecs").is_err());

        assert_eq!(MemorySize::Percent(5.0).resolve(1000), 50);
        assert_eq!(MemorySize::Bytes(42).resolve(1000), 42);
    }

    #[test]
    fn durations_render_compactly() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn toml_nested_and_flat_keys_agree() {
        let nested = SettingsDelta::from_toml_str(
            "[stats]\nenabled = true\njobs_log_size = 100\n\n[stats.breaker.logs]\noverhead = 1.5\n",
        )
        .unwrap();
        let flat = SettingsDelta::from_toml_str(
            "\"stats.enabled\" = true\n\"stats.jobs_log_size\" = 100\n\"stats.breaker.logs.overhead\" = 1.5\n",
        )
        .unwrap();
        assert_eq!(nested, flat);
        assert_eq!(nested.get(STATS_ENABLED), Some("true"));
        assert_eq!(nested.get(LOGS_BREAKER_OVERHEAD), Some("1.5"));
    }

    #[test]
    fn toml_arrays_are_rejected() {
        let err = SettingsDelta::from_toml_str("[stats]\nenabled = [true]\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == STATS_ENABLED));
    }

    #[test]
    fn assignments_split_on_first_equals() {
        assert_eq!(
            SettingsDelta::parse_assignment("stats.enabled = true"),
            Ok(("stats.enabled".to_string(), "true".to_string()))
        );
        assert!(SettingsDelta::parse_assignment("stats.enabled").is_err());
        assert!(SettingsDelta::parse_assignment("=true").is_err());
    }

    #[test]
    fn settings_serialize_with_readable_units() {
        let value = serde_json::to_value(StatsSettings::default()).unwrap();
        assert_eq!(value["sweep_interval"], "1s");
        assert_eq!(value["query_breaker"]["limit"], "60%");
    }
}
