//! Prometheus exposition text support
//!
//! Parses the text format and turns the series into samples. Three shapes:
//!
//! - flattened (default): every series becomes one attribute of a single
//!   sample, label values listed in `key_merge` are folded into the key.
//!   Series whose keys would collide get their other label values appended.
//!   `sample_keys` routes matching series into flattened samples of their
//!   own event type
//! - unflattened: one sample per series with its labels and metadata
//! - histogram / summary: one composite sample per family and label set,
//!   assembled from `_bucket`, `_sum`, `_count` and quantile series
//!
//! ```text
//! # HELP http_requests_total Requests served
//! # TYPE http_requests_total counter
//! http_requests_total{code="200",method="get"} 1027 1395066363000
//! ```

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::config::PrometheusConfig;

use super::sample::{number_value, Sample};

/// Event type of the flattened sample when none is configured
pub const DEFAULT_FLATTENED_EVENT: &str = "PrometheusSample";
/// Event type of histogram samples when none is configured
pub const DEFAULT_HISTOGRAM_EVENT: &str = "PrometheusHistogramSample";
/// Event type of summary samples when none is configured
pub const DEFAULT_SUMMARY_EVENT: &str = "PrometheusSummarySample";

/// One exposition line
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: Option<i64>,
}

impl FromStr for Series {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let mut labels = BTreeMap::new();

        let (name, rest) = match line.find('{') {
            Some(open) => {
                let rest = parse_labels(&line[open + 1..], &mut labels)?;
                (&line[..open], rest)
            }
            None => match line.find(char::is_whitespace) {
                Some(space) => (&line[..space], &line[space..]),
                None => return Err(format!("missing value: {}", line)),
            },
        };

        let parts: Vec<&str> = rest.split_ascii_whitespace().collect();
        let (value, timestamp) = match parts[..] {
            [value] => (value, None),
            [value, ts] => (value, Some(ts)),
            _ => return Err(format!("invalid line: {}", line)),
        };

        let value = parse_value(value).ok_or_else(|| format!("invalid value '{}'", value))?;
        let timestamp = timestamp
            .map(|t| t.parse::<i64>().map_err(|_| format!("invalid timestamp '{}'", t)))
            .transpose()?;

        let name = name.trim();
        if name.is_empty() {
            return Err(format!("missing metric name: {}", line));
        }

        Ok(Series {
            name: name.to_string(),
            labels,
            value,
            timestamp,
        })
    }
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

/// Parse `name="value",...}` and return what follows the closing brace
fn parse_labels<'a>(
    mut remaining: &'a str,
    labels: &mut BTreeMap<String, String>,
) -> Result<&'a str, String> {
    loop {
        remaining = remaining.trim_start();
        if let Some(rest) = remaining.strip_prefix('}') {
            return Ok(rest);
        }
        let (name, rest) = remaining
            .split_once('=')
            .ok_or_else(|| "invalid labels: missing '='".to_string())?;
        let (value, rest) = parse_label_value(rest.trim_start())?;
        labels.insert(name.trim().to_string(), value);

        let rest = rest.trim_start();
        match rest.chars().next() {
            Some(',') => remaining = &rest[1..],
            Some('}') => return Ok(&rest[1..]),
            Some(other) => return Err(format!("invalid labels: unexpected '{}'", other)),
            None => return Err("invalid labels: unterminated".to_string()),
        }
    }
}

/// Parse a quoted label value, undoing `\\`, `\"` and `\n` escapes
fn parse_label_value(remaining: &str) -> Result<(String, &str), String> {
    let body = remaining
        .strip_prefix('"')
        .ok_or_else(|| "invalid label value: expected quote".to_string())?;
    let mut value = String::new();
    let mut escape = false;
    for (i, c) in body.char_indices() {
        match (escape, c) {
            (true, 'n') => {
                value.push('\n');
                escape = false;
            }
            (true, other) => {
                value.push(other);
                escape = false;
            }
            (false, '\\') => escape = true,
            (false, '"') => return Ok((value, &body[i + 1..])),
            (false, other) => value.push(other),
        }
    }
    Err("invalid label value: missing closing quote".to_string())
}

/// Parsed exposition document
#[derive(Debug, Clone, Default)]
pub struct Exposition {
    pub series: Vec<Series>,
    /// Family name -> help text
    pub help: HashMap<String, String>,
    /// Family name -> type
    pub types: HashMap<String, String>,
}

impl Exposition {
    /// Parse exposition text; malformed lines are logged and skipped
    pub fn parse(text: &str) -> Self {
        let mut doc = Exposition::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                let mut parts = comment.trim_start().splitn(3, char::is_whitespace);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some("HELP"), Some(name), help) => {
                        doc.help
                            .insert(name.to_string(), help.unwrap_or_default().trim().to_string());
                    }
                    (Some("TYPE"), Some(name), Some(kind)) => {
                        doc.types.insert(name.to_string(), kind.trim().to_string());
                    }
                    _ => {}
                }
                continue;
            }
            match line.parse::<Series>() {
                Ok(series) => doc.series.push(series),
                Err(e) => tracing::debug!(error = %e, "Skipping exposition line"),
            }
        }
        doc
    }

    /// Family of a series name and its kind, from `# TYPE` lines
    fn family_of<'a>(&self, name: &'a str) -> Option<(&'a str, &str)> {
        for suffix in ["_bucket", "_sum", "_count", ""] {
            if let Some(base) = name.strip_suffix(suffix) {
                if let Some(kind) = self.types.get(base) {
                    return Some((base, kind.as_str()));
                }
            }
        }
        None
    }

    /// Convert into samples according to the API's prometheus settings
    pub fn into_samples(self, opts: &PrometheusConfig, event_type: &str) -> Vec<Sample> {
        let mut composites: BTreeMap<(String, String, Vec<(String, String)>), Sample> =
            BTreeMap::new();
        let mut rest = Vec::new();

        for series in &self.series {
            match self.family_of(&series.name) {
                Some((base, "histogram")) if opts.histogram => {
                    let event = or_default(&opts.histogram_event, DEFAULT_HISTOGRAM_EVENT);
                    add_composite(&mut composites, event, base, series, "le", "bucket");
                }
                Some((base, "summary")) if opts.summary => {
                    let event = or_default(&opts.summary_event, DEFAULT_SUMMARY_EVENT);
                    add_composite(&mut composites, event, base, series, "quantile", "quantile");
                }
                _ => rest.push(series),
            }
        }

        let mut samples: Vec<Sample> = Vec::new();

        if opts.unflatten {
            for series in rest {
                let mut s = Sample::new(event_type);
                s.set("metricName", series.name.clone());
                s.set("metricValue", number_value(series.value));
                if let Some((base, kind)) = self.family_of(&series.name) {
                    s.set("metricType", kind);
                    if let Some(help) = self.help.get(base) {
                        s.set("metricHelp", help.clone());
                    }
                }
                for (k, v) in &series.labels {
                    s.set(k.clone(), v.clone());
                }
                samples.push(s);
            }
        } else if !rest.is_empty() {
            let routes = compile_sample_keys(opts);
            let mut flats: Vec<Sample> =
                vec![Sample::new(or_default(&opts.flattened_event, DEFAULT_FLATTENED_EVENT))];
            flats.extend(routes.iter().map(|(event, _)| Sample::new(event.clone())));

            let keys = flattened_keys(&rest, &opts.key_merge);
            for (series, key) in rest.into_iter().zip(keys) {
                let slot = routes
                    .iter()
                    .position(|(_, re)| re.is_match(&series.name))
                    .map_or(0, |i| i + 1);
                let flat = &mut flats[slot];
                if opts.keep_labels {
                    for (k, v) in &series.labels {
                        if !opts.key_merge.contains(k) {
                            flat.set(format!("{}.{}", key, k), v.clone());
                        }
                    }
                }
                if opts.keep_help {
                    if let Some((base, kind)) = self.family_of(&series.name) {
                        flat.set(format!("{}.type", base), kind);
                        if let Some(help) = self.help.get(base) {
                            flat.set(format!("{}.help", base), help.clone());
                        }
                    }
                }
                flat.set(key, number_value(series.value));
            }
            samples.extend(flats.into_iter().filter(|s| !s.is_empty()));
        }

        samples.extend(composites.into_values());

        for sample in &mut samples {
            for (k, v) in opts.custom_attributes.iter() {
                sample.set(k, v);
            }
        }
        samples
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

/// `sample_keys` as (event type, metric name pattern); invalid patterns are
/// logged and ignored
fn compile_sample_keys(opts: &PrometheusConfig) -> Vec<(String, Regex)> {
    opts.sample_keys
        .iter()
        .filter_map(|(event, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((event.to_string(), re)),
            Err(e) => {
                tracing::warn!(event_type = %event, pattern = %pattern, error = %e, "Ignoring invalid sample_keys pattern");
                None
            }
        })
        .collect()
}

/// Flattened key of every series
///
/// Series sharing a key get the values of their remaining labels appended,
/// in label order, so distinct series never overwrite each other.
fn flattened_keys(series: &[&Series], key_merge: &[String]) -> Vec<String> {
    let keys: Vec<String> = series.iter().map(|s| flattened_key(s, key_merge)).collect();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for key in &keys {
        *seen.entry(key.as_str()).or_default() += 1;
    }

    series
        .iter()
        .zip(&keys)
        .map(|(s, key)| {
            if seen.get(key.as_str()).copied().unwrap_or(0) < 2 {
                return key.clone();
            }
            let mut extended = key.clone();
            for (label, value) in &s.labels {
                if !key_merge.contains(label) {
                    extended.push('.');
                    extended.push_str(value);
                }
            }
            tracing::debug!(key = %key, extended = %extended, "Flattened key collision");
            extended
        })
        .collect()
}

fn flattened_key(series: &Series, key_merge: &[String]) -> String {
    let mut key = series.name.clone();
    for label in key_merge {
        if let Some(v) = series.labels.get(label) {
            key.push('.');
            key.push_str(v);
        }
    }
    key
}

fn add_composite(
    composites: &mut BTreeMap<(String, String, Vec<(String, String)>), Sample>,
    event_type: &str,
    base: &str,
    series: &Series,
    split_label: &str,
    attr_prefix: &str,
) {
    let identity: Vec<(String, String)> = series
        .labels
        .iter()
        .filter(|(k, _)| k.as_str() != split_label)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let sample = composites
        .entry((event_type.to_string(), base.to_string(), identity.clone()))
        .or_insert_with(|| {
            let mut s = Sample::new(event_type);
            s.set("metricName", base);
            for (k, v) in identity {
                s.set(k, v);
            }
            s
        });

    let suffix = &series.name[base.len()..];
    let value = number_value(series.value);
    match (suffix, series.labels.get(split_label)) {
        ("_sum", _) => sample.set("sum", value),
        ("_count", _) => sample.set("count", value),
        (_, Some(bound)) => sample.set(format!("{}.{}", attr_prefix, bound), value),
        _ => sample.set("value", value),
    }
}
