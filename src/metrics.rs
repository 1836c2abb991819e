//! Status counters and the dimensional metrics store
//!
//! # Status counters
//! - `EventCount` - samples emitted as events or metric batches
//! - `EventDropCount` - samples or units dropped (filters, fetch failures,
//!   event limit)
//! - `ConfigsProcessed` - config files completed in a harvest cycle
//!
//! Free-form counter names are accepted as well.
//!
//! # Metrics store
//! Finished [`MetricsBatch`]es are appended by the collectors and drained by
//! whatever exports them. Each append or drain takes the lock exactly once.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::transformer::Attributes;

/// Samples emitted
pub const EVENT_COUNT: &str = "EventCount";
/// Samples or units dropped
pub const EVENT_DROP_COUNT: &str = "EventDropCount";
/// Config files completed
pub const CONFIGS_PROCESSED: &str = "ConfigsProcessed";

/// Thread-safe counter using atomic operations
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter initialized to 0
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset the counter to 0
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Named operational counters
///
/// Counters are created on first use. The registry lock is only taken for
/// writing when a new name appears; increments of known counters are atomic
/// under the read lock.
#[derive(Debug, Default)]
pub struct StatusCounters {
    counters: RwLock<HashMap<String, Counter>>,
}

impl StatusCounters {
    /// Create a registry with the well-known counters at 0
    pub fn new() -> Self {
        let counters = [EVENT_COUNT, EVENT_DROP_COUNT, CONFIGS_PROCESSED]
            .into_iter()
            .map(|name| (name.to_string(), Counter::new()))
            .collect();
        Self {
            counters: RwLock::new(counters),
        }
    }

    /// Increment a counter by 1
    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a counter by `n`
    pub fn add(&self, name: &str, n: u64) {
        if n == 0 {
            return;
        }
        {
            let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(counter) = counters.get(name) {
                counter.inc_by(n);
                return;
            }
        }
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters.entry(name.to_string()).or_default().inc_by(n);
    }

    /// Current value of a counter, 0 if it was never touched
    pub fn read(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, Counter::get)
    }

    /// Snapshot of every counter
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, counter)| (name.clone(), counter.get()))
            .collect()
    }

    /// Reset every counter to 0
    pub fn refresh(&self) {
        for counter in self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            counter.reset();
        }
    }
}

/// Value of a summary entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryValue {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryValue {
    pub fn new(first: f64) -> Self {
        Self {
            count: 1,
            sum: first,
            min: first,
            max: first,
        }
    }

    pub fn observe(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }
}

/// One dimensional metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricEntry {
    Gauge {
        name: String,
        value: f64,
        attributes: Attributes,
    },
    Count {
        name: String,
        value: f64,
        #[serde(rename = "interval.ms")]
        interval_ms: u64,
        attributes: Attributes,
    },
    Summary {
        name: String,
        value: SummaryValue,
        #[serde(rename = "interval.ms")]
        interval_ms: u64,
        attributes: Attributes,
    },
}

impl MetricEntry {
    pub fn name(&self) -> &str {
        match self {
            MetricEntry::Gauge { name, .. }
            | MetricEntry::Count { name, .. }
            | MetricEntry::Summary { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MetricEntry::Gauge { .. } => "gauge",
            MetricEntry::Count { .. } => "count",
            MetricEntry::Summary { .. } => "summary",
        }
    }
}

/// Batch of metrics from one fetched unit in one harvest cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBatch {
    #[serde(rename = "timestamp.ms")]
    pub timestamp_ms: u64,
    #[serde(rename = "interval.ms")]
    pub interval_ms: u64,
    #[serde(rename = "commonAttributes")]
    pub common_attributes: Attributes,
    pub metrics: Vec<MetricEntry>,
}

impl MetricsBatch {
    /// Empty batch stamped with the current time
    pub fn new(interval_ms: u64) -> Self {
        Self {
            timestamp_ms: now_ms(),
            interval_ms,
            ..Default::default()
        }
    }

    pub fn with_common_attributes(mut self, attributes: Attributes) -> Self {
        self.common_attributes = attributes;
        self
    }

    pub fn push(&mut self, entry: MetricEntry) {
        self.metrics.push(entry);
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Append-only store of finished batches
#[derive(Debug, Default)]
pub struct MetricsStore {
    batches: Mutex<Vec<MetricsBatch>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one batch
    pub fn append(&self, batch: MetricsBatch) {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch);
    }

    /// Append several batches under one lock
    pub fn append_all(&self, batches: impl IntoIterator<Item = MetricsBatch>) {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(batches);
    }

    /// Take every batch, leaving the store empty
    pub fn drain(&self) -> Vec<MetricsBatch> {
        std::mem::take(&mut *self.batches.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_status_counters() {
        let counters = StatusCounters::new();
        counters.increment(EVENT_COUNT);
        counters.add(EVENT_DROP_COUNT, 3);
        counters.increment("custom");

        assert_eq!(counters.read(EVENT_COUNT), 1);
        assert_eq!(counters.read(EVENT_DROP_COUNT), 3);
        assert_eq!(counters.read("custom"), 1);
        assert_eq!(counters.read("never"), 0);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot[CONFIGS_PROCESSED], 0);
        assert_eq!(snapshot.len(), 4);

        counters.refresh();
        assert_eq!(counters.read(EVENT_DROP_COUNT), 0);
    }

    #[test]
    fn test_status_counters_concurrent() {
        let counters = Arc::new(StatusCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.increment(EVENT_COUNT);
                        counters.increment("dynamic");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.read(EVENT_COUNT), 8000);
        assert_eq!(counters.read("dynamic"), 8000);
    }

    #[test]
    fn test_summary_value() {
        let mut summary = SummaryValue::new(4.0);
        summary.observe(1.0);
        summary.observe(10.0);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.sum, 15.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 10.0);
    }

    #[test]
    fn test_batch_serialization() {
        let mut attrs = Attributes::new();
        attrs.insert("host".into(), json!("a"));
        let mut batch = MetricsBatch::new(30_000).with_common_attributes(attrs);
        batch.push(MetricEntry::Gauge {
            name: "used".into(),
            value: 1.5,
            attributes: Attributes::new(),
        });
        batch.push(MetricEntry::Count {
            name: "requests".into(),
            value: 7.0,
            interval_ms: 30_000,
            attributes: Attributes::new(),
        });

        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["interval.ms"], json!(30_000));
        assert_eq!(value["commonAttributes"]["host"], json!("a"));
        assert_eq!(value["metrics"][0]["type"], json!("gauge"));
        assert_eq!(value["metrics"][1]["type"], json!("count"));
        assert_eq!(value["metrics"][1]["interval.ms"], json!(30_000));
        assert!(value["timestamp.ms"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_store_append_and_drain() {
        let store = MetricsStore::new();
        store.append(MetricsBatch::new(0));
        store.append_all(vec![MetricsBatch::new(0), MetricsBatch::new(0)]);
        assert_eq!(store.len(), 3);

        let drained = store.drain();
        assert_eq!(drained.len(), 3);
        assert!(store.is_empty());
        assert!(store.drain().is_empty());
    }

    #[test]
    fn test_store_concurrent_appends() {
        let store = Arc::new(MetricsStore::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.append(MetricsBatch::new(0)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.drain().len(), 10);
    }
}
