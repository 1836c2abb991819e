//! Collector context
//!
//! One [`CollectorContext`] is created per run and handed to every source.
//! It owns the metrics store, status counters, the namespace table handle,
//! the summary window and the event sink that enforces the event limit.
//!
//! The event limit is checked under the sink lock in processing order, so
//! once it is reached every further candidate is dropped and counted.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::config::{Api, Config, DEFAULT_EVENT_LIMIT};
use crate::metric_parser::{build_batch, NamespaceTable, ParsedSample, SummaryAccumulator};
use crate::metrics::{MetricsStore, StatusCounters, EVENT_COUNT, EVENT_DROP_COUNT};
use crate::transformer::sample::value_as_string;
use crate::transformer::{IntegrationPayload, Sample};

#[derive(Debug, Default)]
struct EventSink {
    payload: IntegrationPayload,
    emitted: usize,
}

/// Per-run state shared by every source
#[derive(Debug)]
pub struct CollectorContext {
    store: Arc<MetricsStore>,
    counters: Arc<StatusCounters>,
    namespaces: Arc<NamespaceTable>,
    summaries: SummaryAccumulator,
    sink: Mutex<EventSink>,
    event_limit: usize,
    interval_ms: u64,
}

impl Default for CollectorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorContext {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MetricsStore::new()),
            counters: Arc::new(StatusCounters::new()),
            namespaces: Arc::new(NamespaceTable::new()),
            summaries: SummaryAccumulator::new(),
            sink: Mutex::new(EventSink::default()),
            event_limit: DEFAULT_EVENT_LIMIT,
            interval_ms: 0,
        }
    }

    /// Maximum events per run, 0 for unlimited
    pub fn with_event_limit(mut self, limit: usize) -> Self {
        self.event_limit = limit;
        self
    }

    /// Harvest interval reported in batches
    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Share a metrics store, e.g. with the status server
    pub fn with_store(mut self, store: Arc<MetricsStore>) -> Self {
        self.store = store;
        self
    }

    /// Share status counters, e.g. with the status server
    pub fn with_counters(mut self, counters: Arc<StatusCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Share a namespace table that outlives this run
    pub fn with_namespaces(mut self, namespaces: Arc<NamespaceTable>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }

    pub fn counters(&self) -> &Arc<StatusCounters> {
        &self.counters
    }

    pub fn namespaces(&self) -> &NamespaceTable {
        &self.namespaces
    }

    pub fn summaries(&self) -> &SummaryAccumulator {
        &self.summaries
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn event_limit(&self) -> usize {
        self.event_limit
    }

    /// Count dropped samples or units
    pub fn record_drops(&self, n: u64) {
        self.counters.add(EVENT_DROP_COUNT, n);
    }

    /// Number of candidates still allowed out of `wanted`; updates the count
    fn admit(&self, sink: &mut EventSink, wanted: usize) -> usize {
        let allowed = if self.event_limit == 0 {
            wanted
        } else {
            wanted.min(self.event_limit.saturating_sub(sink.emitted))
        };
        sink.emitted += allowed;
        let rejected = wanted - allowed;
        if rejected > 0 {
            tracing::debug!(
                limit = self.event_limit,
                dropped = rejected,
                "Event limit reached"
            );
            self.record_drops(rejected as u64);
        }
        self.counters.add(EVENT_COUNT, allowed as u64);
        allowed
    }

    /// Emit samples as events, recording inventory and payload events
    ///
    /// Samples go to the API's entity block. With `inventory_only` or
    /// `events_only` only inventory and payload events are recorded and
    /// nothing counts against the event limit. Returns the number of emitted
    /// samples.
    pub fn emit_events(&self, samples: Vec<Sample>, api: &Api) -> usize {
        let entity = api.entity_id();
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());

        for sample in &samples {
            if !api.inventory.is_empty() {
                sink.payload.add_inventory(entity.as_ref(), sample, &api.inventory);
            }
            if !api.events.is_empty() {
                sink.payload.add_events(entity.as_ref(), sample, &api.events);
            }
        }
        if api.inventory_only || api.events_only {
            return 0;
        }

        let allowed = self.admit(&mut sink, samples.len());
        sink.payload
            .add_samples(entity.as_ref(), samples.into_iter().take(allowed));
        allowed
    }

    /// Emit the samples of one fetched unit as a dimensional batch
    ///
    /// Returns the number of samples admitted. Nothing is appended when the
    /// event limit admits none of them.
    pub fn emit_metrics(&self, parsed: Vec<ParsedSample>) -> usize {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        let allowed = self.admit(&mut sink, parsed.len());
        drop(sink);

        if allowed == 0 {
            return 0;
        }
        let batch = build_batch(&parsed[..allowed], self.interval_ms);
        self.store.append(batch);
        allowed
    }

    /// Move the summary window into the store
    pub fn flush_summaries(&self) {
        if let Some(batch) = self.summaries.flush(self.interval_ms) {
            tracing::debug!(entries = batch.len(), "Summaries flushed");
            self.store.append(batch);
        }
    }

    /// Take the accumulated payload, leaving an empty one
    pub fn take_payload(&self) -> IntegrationPayload {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.emitted = 0;
        std::mem::take(&mut sink.payload)
    }

    /// Reset counters and the event limit window
    pub fn refresh(&self) {
        self.counters.refresh();
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.emitted = 0;
    }
}

/// Cross-source scratch stores of one config
///
/// Sources run in declaration order within a config, so a later source
/// sees what earlier ones wrote.
#[derive(Debug, Clone, Default)]
pub struct ScratchStores {
    /// API name -> samples, read by `cache` sources
    pub datastore: BTreeMap<String, Vec<Value>>,
    pub lookups: BTreeMap<String, Vec<String>>,
    pub variables: BTreeMap<String, String>,
}

impl ScratchStores {
    /// Stores seeded from the config
    pub fn from_config(config: &Config) -> Self {
        Self {
            datastore: config.datastore.clone(),
            lookups: config.lookup_store.clone(),
            variables: config.variable_store.clone(),
        }
    }

    /// Record the output of an API for later sources
    pub fn record(&mut self, api: &Api, samples: &[Sample]) {
        if !api.name.is_empty() {
            let docs = samples
                .iter()
                .map(|s| Value::Object(s.attributes.clone().into_iter().collect()))
                .collect();
            self.datastore.insert(api.name.clone(), docs);
        }

        for (lookup, attribute) in api.store_lookups.iter() {
            let values = self.lookups.entry(lookup.to_string()).or_default();
            for sample in samples {
                if let Some(v) = sample.get(attribute).and_then(value_as_string) {
                    if !values.contains(&v) {
                        values.push(v);
                    }
                }
            }
        }

        for (variable, attribute) in api.store_variables.iter() {
            if let Some(v) = samples
                .iter()
                .rev()
                .find_map(|s| s.get(attribute).and_then(value_as_string))
            {
                self.variables.insert(variable.to_string(), v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let mut s = Sample::new("testSample");
                s.set("i", i as i64);
                s
            })
            .collect()
    }

    #[test]
    fn test_event_limit_drops_rest() {
        let ctx = CollectorContext::new().with_event_limit(2);
        let emitted = ctx.emit_events(samples(5), &Api::default());
        assert_eq!(emitted, 2);
        assert_eq!(ctx.counters().read(EVENT_COUNT), 2);
        assert_eq!(ctx.counters().read(EVENT_DROP_COUNT), 3);

        // limit stays reached for later sources
        assert_eq!(ctx.emit_events(samples(1), &Api::default()), 0);
        assert_eq!(ctx.counters().read(EVENT_DROP_COUNT), 4);

        let payload = ctx.take_payload();
        assert_eq!(payload.sample_count(), 2);
        assert_eq!(payload.data[0].metrics[1].get("i"), Some(&json!(1)));
    }

    #[test]
    fn test_unlimited() {
        let ctx = CollectorContext::new().with_event_limit(0);
        assert_eq!(ctx.emit_events(samples(600), &Api::default()), 600);
    }

    #[test]
    fn test_inventory_only() {
        let ctx = CollectorContext::new();
        let api = Api {
            inventory_only: true,
            inventory: [("i", "idx")].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(ctx.emit_events(samples(2), &api), 0);
        let payload = ctx.take_payload();
        assert_eq!(payload.sample_count(), 0);
        assert_eq!(payload.data[0].inventory["idx"]["i"], json!(1));
    }

    #[test]
    fn test_events_only_to_entity() {
        let ctx = CollectorContext::new().with_event_limit(1);
        let api = Api {
            events_only: true,
            events: [("i", "restart")].into_iter().collect(),
            entity: "node-7".into(),
            ..Default::default()
        };
        assert_eq!(ctx.emit_events(samples(3), &api), 0);
        assert_eq!(ctx.counters().read(EVENT_DROP_COUNT), 0);

        let payload = ctx.take_payload();
        assert_eq!(payload.sample_count(), 0);
        assert_eq!(payload.event_count(), 3);
        let block = &payload.data[1];
        assert_eq!(block.entity.as_ref().map(|e| e.name.as_str()), Some("node-7"));
        assert_eq!(block.events[2]["summary"], json!("2"));
        assert_eq!(block.events[2]["category"], json!("restart"));
    }

    #[test]
    fn test_entity_samples_and_events() {
        let ctx = CollectorContext::new();
        let api = Api {
            events: [("i", "")].into_iter().collect(),
            entity: "node-7".into(),
            entity_type: "host".into(),
            ..Default::default()
        };
        assert_eq!(ctx.emit_events(samples(2), &api), 2);
        let payload = ctx.take_payload();
        assert!(payload.data[0].metrics.is_empty());
        assert_eq!(payload.data[1].metrics.len(), 2);
        assert_eq!(payload.data[1].events.len(), 2);
        assert_eq!(
            payload.data[1].entity.as_ref().map(|e| e.entity_type.as_str()),
            Some("host")
        );
    }

    #[test]
    fn test_emit_metrics_appends_one_batch() {
        let ctx = CollectorContext::new().with_interval_ms(1000);
        let parsed: Vec<ParsedSample> = samples(3).into_iter().map(Into::into).collect();
        assert_eq!(ctx.emit_metrics(parsed), 3);
        let batches = ctx.store().drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0].interval_ms, 1000);
    }

    #[test]
    fn test_scratch_stores_record() {
        let api = Api {
            name: "hosts".into(),
            store_lookups: [("hostNames", "host")].into_iter().collect(),
            store_variables: [("lastHost", "host")].into_iter().collect(),
            ..Default::default()
        };
        let mut a = Sample::new("hostsSample");
        a.set("host", "a");
        let mut b = Sample::new("hostsSample");
        b.set("host", "b");
        let mut dup = Sample::new("hostsSample");
        dup.set("host", "a");

        let mut stores = ScratchStores::default();
        stores.record(&api, &[a, b, dup]);
        assert_eq!(stores.lookups["hostNames"], vec!["a", "b"]);
        assert_eq!(stores.variables["lastHost"], "a");
        assert_eq!(stores.datastore["hosts"].len(), 3);
        assert_eq!(stores.datastore["hosts"][1]["host"], json!("b"));
    }
}
