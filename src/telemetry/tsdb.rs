//! Embedded time-series store.
//!
//! Spec §3 describes the TSDB as "an open on-disk or tmpfs-backed
//! time-series database with configured retention and block durations",
//! owned exclusively by C1. None of the example repos in this crate's
//! lineage embed a real TSDB engine, and there is no general-purpose
//! embeddable Prometheus-compatible TSDB crate on crates.io at the fidelity
//! this spec needs (see DESIGN.md for the grounded decision). This module
//! is a bounded, in-memory stand-in with the same external contract:
//! label-set-addressed append, retention-bounded storage, range/instant
//! selection for the PromQL evaluator in [`crate::telemetry::promql`].

use std::{
    collections::BTreeMap,
    sync::RwLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// One observed sample: milliseconds since epoch, and its float value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// Timestamp, milliseconds since Unix epoch.
    pub timestamp_ms: i64,
    /// Sample value.
    pub value: f64,
}

/// A series' identity: metric name plus its full label set.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    /// Metric name (the `__name__` label, conventionally).
    pub name: String,
    /// Remaining labels, sorted by name for deterministic hashing/equality.
    pub labels: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Build a key from a name and an unordered label iterator.
    pub fn new(name: impl Into<String>, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            name: name.into(),
            labels: labels.into_iter().collect(),
        }
    }

    /// Whether every `(name, value)` matcher pair in `matchers` is satisfied.
    ///
    /// `matchers` pairs a label name with a predicate over its value (the
    /// caller is responsible for distinguishing equality/regex/negation; see
    /// [`crate::telemetry::promql`]).
    pub fn matches(&self, name_filter: Option<&str>, matchers: &[(String, Box<dyn Fn(&str) -> bool>)]) -> bool {
        if let Some(n) = name_filter {
            if self.name != n {
                return false;
            }
        }
        matchers.iter().all(|(label, pred)| {
            let value = self.labels.get(label).map(String::as_str).unwrap_or("");
            pred(value)
        })
    }
}

/// In-memory, retention-bounded time-series store.
pub struct Tsdb {
    series: RwLock<BTreeMap<SeriesKey, Vec<Sample>>>,
    retention: Duration,
}

impl Tsdb {
    /// Open a new store with the given retention window.
    ///
    /// `path` is accepted for interface parity with spec §3's "on-disk or
    /// tmpfs-backed" description and is currently unused: nothing is
    /// persisted to it.
    pub fn open(_path: Option<&str>, retention: Duration) -> Result<Self, crate::errors::TelemetryError> {
        Ok(Self {
            series: RwLock::new(BTreeMap::new()),
            retention,
        })
    }

    /// Append one sample, dropping anything older than the retention window.
    pub fn append(&self, key: SeriesKey, timestamp_ms: i64, value: f64) {
        let mut series = self.series.write().expect("tsdb lock poisoned");
        let entry = series.entry(key).or_default();
        entry.push(Sample { timestamp_ms, value });
        let cutoff = timestamp_ms - self.retention.as_millis() as i64;
        entry.retain(|s| s.timestamp_ms >= cutoff);
    }

    /// Append a sample stamped with the current wall-clock time.
    pub fn append_now(&self, key: SeriesKey, value: f64) {
        self.append(key, now_ms(), value);
    }

    /// All series whose name matches `name` (exact match on `__name__`).
    pub fn series_by_name(&self, name: &str) -> Vec<(SeriesKey, Vec<Sample>)> {
        let series = self.series.read().expect("tsdb lock poisoned");
        series
            .iter()
            .filter(|(k, _)| k.name == name)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The most recent sample at or before `at_ms` for every matching series.
    pub fn instant(&self, name: &str, at_ms: i64) -> Vec<(SeriesKey, Sample)> {
        self.series_by_name(name)
            .into_iter()
            .filter_map(|(k, samples)| {
                samples
                    .iter()
                    .rev()
                    .find(|s| s.timestamp_ms <= at_ms)
                    .map(|s| (k, *s))
            })
            .collect()
    }

    /// All samples in `[start_ms, end_ms]` for every matching series.
    pub fn range(&self, name: &str, start_ms: i64, end_ms: i64) -> Vec<(SeriesKey, Vec<Sample>)> {
        self.series_by_name(name)
            .into_iter()
            .map(|(k, samples)| {
                let filtered = samples
                    .into_iter()
                    .filter(|s| s.timestamp_ms >= start_ms && s.timestamp_ms <= end_ms)
                    .collect();
                (k, filtered)
            })
            .collect()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_trims_old_samples() {
        let tsdb = Tsdb::open(None, Duration::from_millis(100)).unwrap();
        let key = SeriesKey::new("up", [("job".to_string(), "a".to_string())]);
        tsdb.append(key.clone(), 0, 1.0);
        tsdb.append(key.clone(), 50, 1.0);
        tsdb.append(key.clone(), 500, 1.0);
        let series = tsdb.series_by_name("up");
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].1.len(), 1);
        assert_eq!(series[0].1[0].timestamp_ms, 500);
    }

    #[test]
    fn instant_picks_most_recent_sample_at_or_before_time() {
        let tsdb = Tsdb::open(None, Duration::from_secs(3600)).unwrap();
        let key = SeriesKey::new("up", []);
        tsdb.append(key.clone(), 10, 1.0);
        tsdb.append(key, 20, 0.0);
        let result = tsdb.instant("up", 15);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].1.value, 1.0);
    }
}
