//! Metric parser and namespace engine
//!
//! Tracks the previous raw value of every RATE/DELTA attribute per
//! namespace so counter semantics survive across harvest cycles.
//!
//! ```text
//! cycle   raw    RATE (60s apart)
//!   1     100    100          first occurrence, passed through
//!   2     150    0.8333       (150 - 100) / 60
//!   3     130    130          counter reset, raw value, prior reset to 130
//! ```
//!
//! The table is an `RwLock` map of per-namespace `Mutex`es: the outer lock is
//! taken for writing only when a namespace is first seen, and two sources
//! writing different namespaces never contend on the inner lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{Api, NamespaceConfig, SummaryFields};
use crate::error::StageError;
use crate::metrics::{MetricEntry, MetricsBatch, SummaryValue};
use crate::transformer::sample::{number_value, value_as_f64};
use crate::transformer::{Attributes, Sample};

/// Attribute written with the resolved namespace
pub const NAMESPACE_ATTR: &str = "namespace";

/// How a configured metric attribute is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Rate,
    Delta,
    Gauge,
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RATE" => Ok(MetricKind::Rate),
            "DELTA" => Ok(MetricKind::Delta),
            "GAUGE" | "" => Ok(MetricKind::Gauge),
            other => Err(format!(
                "unknown metric type '{}', expected RATE, DELTA or GAUGE",
                other
            )),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Rate => "RATE",
            MetricKind::Delta => "DELTA",
            MetricKind::Gauge => "GAUGE",
        };
        f.write_str(s)
    }
}

/// Previous raw observation of a metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prior {
    pub value: f64,
    pub ts_ms: u64,
}

/// Result of feeding an observation through RATE/DELTA computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Computed {
    /// No prior value: the raw value passes through
    FirstSeen(f64),
    /// Value went down: the raw value passes through, prior reset
    CounterReset(f64),
    /// Rate or delta against the prior value
    Value(f64),
}

impl Computed {
    pub fn value(self) -> f64 {
        match self {
            Computed::FirstSeen(v) | Computed::CounterReset(v) | Computed::Value(v) => v,
        }
    }
}

type NamespaceState = Arc<Mutex<HashMap<String, Prior>>>;

/// Process-wide prior value table keyed by (namespace, metric)
#[derive(Debug, Default)]
pub struct NamespaceTable {
    namespaces: RwLock<HashMap<String, NamespaceState>>,
}

impl NamespaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, namespace: &str) -> NamespaceState {
        {
            let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = namespaces.get(namespace) {
                return Arc::clone(state);
            }
        }
        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(namespaces.entry(namespace.to_string()).or_default())
    }

    /// Record an observation and compute its RATE or DELTA
    ///
    /// The stored prior is always replaced by the current observation.
    pub fn compute(
        &self,
        namespace: &str,
        metric: &str,
        kind: MetricKind,
        current: f64,
        ts_ms: u64,
    ) -> Computed {
        let state = self.namespace(namespace);
        let mut priors = state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = priors.insert(
            metric.to_string(),
            Prior {
                value: current,
                ts_ms,
            },
        );
        drop(priors);

        let Some(prior) = previous else {
            return Computed::FirstSeen(current);
        };
        if current < prior.value {
            return Computed::CounterReset(current);
        }
        match kind {
            MetricKind::Delta => Computed::Value(current - prior.value),
            MetricKind::Rate => {
                let elapsed_secs = ts_ms.saturating_sub(prior.ts_ms) as f64 / 1000.0;
                if elapsed_secs > 0.0 {
                    Computed::Value((current - prior.value) / elapsed_secs)
                } else {
                    Computed::FirstSeen(current)
                }
            }
            MetricKind::Gauge => Computed::Value(current),
        }
    }

    /// Stored prior of a metric
    pub fn prior(&self, namespace: &str, metric: &str) -> Option<Prior> {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        let state = namespaces.get(namespace)?;
        let priors = state.lock().unwrap_or_else(|e| e.into_inner());
        priors.get(metric).copied()
    }

    /// Number of known namespaces
    pub fn len(&self) -> usize {
        self.namespaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every prior, e.g. after a configuration reload
    pub fn reset(&self) {
        self.namespaces
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Summary accumulation over one harvest window
#[derive(Debug, Default)]
pub struct SummaryAccumulator {
    entries: Mutex<BTreeMap<(String, String), SummaryValue>>,
}

impl SummaryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, namespace: &str, attribute: &str, value: f64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry((namespace.to_string(), attribute.to_string()))
            .and_modify(|s| s.observe(value))
            .or_insert_with(|| SummaryValue::new(value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Drain the window into one batch of summary entries
    pub fn flush(&self, interval_ms: u64) -> Option<MetricsBatch> {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap_or_else(|e| e.into_inner()));
        if entries.is_empty() {
            return None;
        }
        let mut batch = MetricsBatch::new(interval_ms);
        for ((namespace, attribute), value) in entries {
            let mut attributes = Attributes::new();
            attributes.insert(NAMESPACE_ATTR.to_string(), namespace.into());
            batch.push(MetricEntry::Summary {
                name: attribute,
                value,
                interval_ms,
                attributes,
            });
        }
        Some(batch)
    }
}

/// Summary read from pre-aggregated attributes of one sample
#[derive(Debug, Clone, PartialEq)]
pub struct PresetSummary {
    pub name: String,
    pub value: SummaryValue,
    /// Attributes the fields were read from, left out of the gauge entries
    pub sources: Vec<String>,
}

/// A sample after metric parsing
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSample {
    pub sample: Sample,
    /// Attributes emitted as count entries: computed DELTAs and `counts`
    pub counts: BTreeSet<String>,
    pub summaries: Vec<PresetSummary>,
}

impl From<Sample> for ParsedSample {
    fn from(sample: Sample) -> Self {
        Self {
            sample,
            counts: BTreeSet::new(),
            summaries: Vec::new(),
        }
    }
}

/// Compiled `metric_parser` of one API
#[derive(Debug, Clone)]
pub struct MetricParser {
    api_name: String,
    namespace: NamespaceConfig,
    rules: Vec<(String, MetricKind)>,
    auto_set: bool,
    counts: Vec<String>,
    summaries: Vec<String>,
    preset_summaries: Vec<(String, SummaryFields)>,
}

impl MetricParser {
    /// Compile the API's `metric_parser`, `None` when it is not configured
    ///
    /// # Errors
    /// Returns `StageError::InvalidDirective` for an unknown metric type
    pub fn from_api(api: &Api) -> Result<Option<Self>, StageError> {
        let cfg = &api.metric_parser;
        if !cfg.is_configured() {
            return Ok(None);
        }
        let rules = cfg
            .metrics
            .iter()
            .map(|(name, kind)| {
                kind.parse::<MetricKind>()
                    .map(|k| (name.to_string(), k))
                    .map_err(|reason| StageError::InvalidDirective {
                        directive: "metric_parser",
                        reason,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Self {
            api_name: api.name.clone(),
            namespace: cfg.namespace.clone(),
            rules,
            auto_set: cfg.auto_set,
            counts: cfg.counts.iter().map(|(name, _)| name.to_string()).collect(),
            summaries: cfg.summaries.window().to_vec(),
            preset_summaries: cfg.summaries.fields(),
        }))
    }

    /// Namespace of a sample: literal, chained attribute values, or the API name
    pub fn resolve_namespace(&self, sample: &Sample) -> String {
        if !self.namespace.custom_attr.is_empty() {
            return self.namespace.custom_attr.clone();
        }
        let chained: Vec<String> = self
            .namespace
            .existing_attr
            .iter()
            .filter_map(|attr| sample.get_string(attr))
            .collect();
        if chained.is_empty() {
            self.api_name.clone()
        } else {
            chained.join("-")
        }
    }

    /// Rule for an attribute: exact name first, then containment with `auto_set`
    pub fn classify(&self, key: &str) -> Option<MetricKind> {
        if let Some((_, kind)) = self.rules.iter().find(|(name, _)| name == key) {
            return Some(*kind);
        }
        if self.auto_set {
            return self
                .rules
                .iter()
                .find(|(name, _)| key.contains(name.as_str()))
                .map(|(_, kind)| *kind);
        }
        None
    }

    /// Whether an attribute is listed under `counts`
    pub fn is_count(&self, key: &str) -> bool {
        self.counts
            .iter()
            .any(|name| name == key || (self.auto_set && key.contains(name.as_str())))
    }

    /// Pre-aggregated summaries whose four fields are all numeric
    fn read_presets(&self, sample: &Sample) -> Vec<PresetSummary> {
        self.preset_summaries
            .iter()
            .filter_map(|(name, fields)| {
                let [count, sum, min, max] = fields.attributes().map(|attr| sample.get_f64(attr));
                match (count, sum, min, max) {
                    (Some(count), Some(sum), Some(min), Some(max)) if count >= 0.0 => {
                        Some(PresetSummary {
                            name: name.clone(),
                            value: SummaryValue {
                                count: count as u64,
                                sum,
                                min,
                                max,
                            },
                            sources: fields.attributes().iter().map(|a| a.to_string()).collect(),
                        })
                    }
                    _ => {
                        tracing::debug!(summary = %name, "Summary fields missing or not numeric");
                        None
                    }
                }
            })
            .collect()
    }

    /// Resolve the namespace and compute configured metrics in place
    pub fn apply(
        &self,
        mut sample: Sample,
        table: &NamespaceTable,
        summaries: &SummaryAccumulator,
        now_ms: u64,
    ) -> ParsedSample {
        let namespace = self.resolve_namespace(&sample);
        let mut counts = BTreeSet::new();

        let numeric: Vec<(String, f64)> = sample
            .attributes
            .iter()
            .filter_map(|(k, v)| value_as_f64(v).map(|n| (k.clone(), n)))
            .collect();

        let presets = self.read_presets(&sample);

        for (key, current) in numeric {
            if self.summaries.iter().any(|s| s == &key) {
                summaries.observe(&namespace, &key, current);
            }
            if self.is_count(&key) {
                counts.insert(key.clone());
            }

            let Some(kind) = self.classify(&key) else {
                continue;
            };
            if kind == MetricKind::Gauge {
                continue;
            }

            let computed = table.compute(&namespace, &key, kind, current, now_ms);
            match computed {
                Computed::FirstSeen(_) => {
                    tracing::debug!(namespace = %namespace, metric = %key, "First occurrence, passing raw value");
                }
                Computed::CounterReset(_) => {
                    tracing::debug!(namespace = %namespace, metric = %key, "Counter reset detected");
                }
                Computed::Value(_) if kind == MetricKind::Delta => {
                    counts.insert(key.clone());
                }
                Computed::Value(_) => {}
            }
            sample.set(key, number_value(computed.value()));
        }

        sample.set(NAMESPACE_ATTR, namespace);
        ParsedSample {
            sample,
            counts,
            summaries: presets,
        }
    }
}

/// Build one dimensional batch from the samples of a fetched unit
///
/// Numeric attributes become gauge entries (count entries for computed
/// DELTAs and `counts`); the non-numeric attributes of a sample are the
/// attributes of each of its entries. Attributes feeding a pre-aggregated
/// summary are emitted only as part of that summary.
pub fn build_batch(parsed: &[ParsedSample], interval_ms: u64) -> MetricsBatch {
    let mut batch = MetricsBatch::new(interval_ms);
    for item in parsed {
        let mut dimensions = Attributes::new();
        let mut values = Vec::new();
        for (key, value) in &item.sample.attributes {
            match value {
                serde_json::Value::Number(n) => {
                    if let Some(v) = n.as_f64() {
                        values.push((key, v));
                    }
                }
                other => {
                    dimensions.insert(key.clone(), other.clone());
                }
            }
        }
        dimensions.insert(
            "eventType".to_string(),
            item.sample.event_type.clone().into(),
        );

        for summary in &item.summaries {
            batch.push(MetricEntry::Summary {
                name: summary.name.clone(),
                value: summary.value,
                interval_ms,
                attributes: dimensions.clone(),
            });
        }

        let consumed = |key: &str| item.summaries.iter().any(|s| s.sources.iter().any(|a| a == key));
        for (key, value) in values.into_iter().filter(|(key, _)| !consumed(key.as_str())) {
            let entry = if item.counts.contains(key) {
                MetricEntry::Count {
                    name: key.clone(),
                    value,
                    interval_ms,
                    attributes: dimensions.clone(),
                }
            } else {
                MetricEntry::Gauge {
                    name: key.clone(),
                    value,
                    attributes: dimensions.clone(),
                }
            };
            batch.push(entry);
        }
    }
    batch
}
