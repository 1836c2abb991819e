//! Configuration management for flex-collector
//!
//! Handles loading and validating source definitions from YAML files.
//! Every field has a zero-value default, so partially written configs
//! degrade gracefully instead of failing to parse.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Timeout applied to commands and HTTP requests when none is configured (ms)
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
/// Timeout for `dial` reachability checks (ms)
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 1_000;
/// Shell used to run commands
pub const DEFAULT_SHELL: &str = "/bin/sh";
/// Default Jolokia host
pub const DEFAULT_JMX_HOST: &str = "127.0.0.1";
/// Default Jolokia port
pub const DEFAULT_JMX_PORT: &str = "8778";
/// Default maximum amount of events per execution
pub const DEFAULT_EVENT_LIMIT: usize = 500;
/// Entity type used when an API names an entity without a type
pub const DEFAULT_ENTITY_TYPE: &str = "flex";

static LOOKUP_FILE_RE: OnceCell<Regex> = OnceCell::new();

fn lookup_file_regex() -> &'static Regex {
    LOOKUP_FILE_RE.get_or_init(|| Regex::new(r"\$\{lf:([^}]+)\}").expect("invalid lookup file regex"))
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error reading the configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing the configuration file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Lookup file could not be read or is not a list of objects
    #[error("Invalid lookup file '{path}': {reason}")]
    LookupFile { path: String, reason: String },
}

/// Ordered string-to-string map
///
/// YAML maps keep their declaration order, which matters for directives such
/// as `math` (later expressions may reference earlier ones). Scalar values of
/// any type are accepted and stored as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringMap(pub Vec<(String, String)>);

impl StringMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace a value, keeping the original position on replace
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StringMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = StringMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for StringMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StringMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StringMapVisitor;

        impl<'de> Visitor<'de> for StringMapVisitor {
            type Value = StringMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of scalar values")
            }

            fn visit_unit<E>(self) -> Result<StringMap, E> {
                Ok(StringMap::new())
            }

            fn visit_map<A>(self, mut access: A) -> Result<StringMap, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut map = StringMap::new();
                while let Some((key, value)) =
                    access.next_entry::<String, serde_yaml::Value>()?
                {
                    map.insert(key, scalar_to_string(&value));
                }
                Ok(map)
            }
        }

        deserializer.deserialize_any(StringMapVisitor)
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn substitute_lookup_row(
    value: &mut serde_yaml::Value,
    row: &serde_json::Map<String, serde_json::Value>,
) {
    match value {
        serde_yaml::Value::String(text) if text.contains("${lf:") => {
            *text = lookup_file_regex()
                .replace_all(text, |caps: &regex::Captures<'_>| match row.get(&caps[1]) {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(serde_json::Value::Null) | None => caps[0].to_string(),
                    Some(other) => other.to_string(),
                })
                .into_owned();
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                substitute_lookup_row(item, row);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_lookup_row(item, row);
            }
        }
        _ => {}
    }
}

/// Root configuration: one source group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Set when the config is read from disk
    #[serde(skip)]
    pub file_name: String,

    /// Config name, used in logs
    pub name: String,

    /// Defaults shared by every API
    pub global: Global,

    /// Ordered source definitions
    pub apis: Vec<Api>,

    /// Cached samples of earlier APIs, keyed by API name
    pub datastore: BTreeMap<String, Vec<serde_json::Value>>,

    /// Lookup values collected by `store_lookups`
    pub lookup_store: BTreeMap<String, Vec<String>>,

    /// Variables collected by `store_variables`
    pub variable_store: BTreeMap<String, String>,

    /// JSON file holding a list of objects; the config runs once per
    /// object with `${lf:key}` replaced by the object's values
    pub lookup_file: String,

    /// Attributes added to every sample of this config
    pub custom_attributes: StringMap,

    /// Emit dimensional metric batches instead of events
    pub metric_api: bool,

    /// Run-wide sample merge rules
    pub sample_merge: Vec<SampleMerge>,
}

/// Defaults shared by every API of a config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Global {
    pub base_url: String,
    pub user: String,
    pub pass: String,
    pub proxy: String,
    /// Request timeout in milliseconds
    pub timeout: u64,
    pub headers: StringMap,
    pub jmx: JmxConfig,
    pub tls_config: TlsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enable: bool,
    pub insecure_skip_verify: bool,
    /// Path to a PEM CA bundle
    pub ca: String,
}

/// Collapse several event types into one unified event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleMerge {
    /// Event type of the merged sample
    pub event_type: String,
    /// Event types to merge, in collision order (later wins)
    pub samples: Vec<String>,
}

/// Source definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Api {
    pub name: String,
    /// Override the event type (default `<name>Sample`)
    pub event_type: String,
    /// Attributes recorded as inventory: attribute key -> category
    pub inventory: StringMap,
    /// Only generate inventory data
    pub inventory_only: bool,
    /// Attributes recorded as events: attribute key -> category
    pub events: StringMap,
    /// Only generate events
    pub events_only: bool,
    /// Report samples under a named entity instead of the local one
    pub entity: String,
    /// Entity type (namespace), `flex` when unset
    pub entity_type: String,
    /// Merge into another event type
    pub merge: String,
    /// Prefix for attribute keys
    pub prefix: String,

    // Source selectors
    pub file: String,
    pub url: String,
    pub escape_url: bool,
    pub prometheus: PrometheusConfig,
    /// Read data from the datastore entry of an earlier API
    pub cache: String,
    pub database: String,
    pub db_driver: String,
    pub db_conn: String,
    pub shell: String,
    pub commands_async: bool,
    /// Upper bound on concurrently running async commands (0 = no cap)
    pub commands_async_limit: usize,
    pub commands: Vec<Command>,
    pub db_queries: Vec<Command>,
    pub jmx: JmxConfig,

    // HTTP options
    pub user: String,
    pub pass: String,
    pub proxy: String,
    pub tls_config: TlsConfig,
    /// Timeout in milliseconds
    pub timeout: u64,
    pub method: String,
    pub payload: String,
    pub headers: StringMap,

    // Structure shaping
    pub disable_parent_attr: bool,
    pub start_key: Vec<String>,
    pub split_objects: bool,
    pub lazy_flatten: Vec<String>,
    pub strip_keys: Vec<String>,
    /// Event type -> `path>attribute`: the child objects under `path` become
    /// samples of that event type, keyed by `attribute`
    pub sample_keys: StringMap,

    // Scratch store writes
    pub store_lookups: StringMap,
    pub store_variables: StringMap,

    // Key directives
    pub replace_keys: StringMap,
    pub rename_keys: StringMap,
    pub rename_samples: StringMap,
    pub remove_keys: Vec<String>,
    pub keep_keys: Vec<String>,
    pub skip_processing: Vec<String>,
    pub to_lower: bool,
    pub convert_space: String,
    pub snake_to_camel: bool,

    // Value directives
    pub perc_to_decimal: bool,
    pub pluck_numbers: bool,
    pub math: StringMap,
    pub sub_parse: Vec<SubParse>,
    pub custom_attributes: StringMap,
    pub value_parser: StringMap,
    pub value_transformer: StringMap,
    pub metric_parser: MetricParserConfig,
    pub sample_filter: Vec<StringMap>,
    pub sample_include_filter: Vec<StringMap>,

    // Text splitting
    pub split: String,
    pub split_by: String,
    pub set_header: Vec<String>,
    pub regex: bool,
    pub row_header: usize,
    pub row_start: usize,
}

impl Api {
    /// Entity the API reports under, `None` for the local entity
    pub fn entity_id(&self) -> Option<EntityId> {
        if self.entity.is_empty() {
            return None;
        }
        let entity_type = if self.entity_type.is_empty() {
            DEFAULT_ENTITY_TYPE
        } else {
            &self.entity_type
        };
        Some(EntityId {
            name: self.entity.clone(),
            entity_type: entity_type.to_string(),
        })
    }

    /// Resolved event type, never empty
    pub fn resolved_event_type(&self) -> String {
        if !self.event_type.is_empty() {
            self.event_type.clone()
        } else if !self.name.is_empty() {
            format!("{}Sample", self.name)
        } else {
            "FlexSample".to_string()
        }
    }
}

/// Remote entity identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityId {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

/// Sub-unit of a shell, database or JMX source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub name: String,
    pub event_type: String,
    pub shell: String,
    /// Use content from the datastore instead of running a command
    pub cache: String,
    /// Command line, SQL query or MBean pattern
    pub run: String,
    pub jmx: JmxConfig,
    /// Run the command but discard its output
    pub ignore_output: bool,
    pub custom_attributes: StringMap,
    /// `raw` (default) or `json`
    pub output: String,
    pub line_end: usize,
    pub line_start: usize,
    /// Timeout in milliseconds
    pub timeout: u64,
    /// Reachability check, e.g. `localhost:5432`
    pub dial: String,
    pub network: String,

    // Body parsing
    pub split: String,
    pub split_by: String,
    pub split_output: String,
    pub regex_match: bool,
    pub group_by: String,
    pub row_header: usize,
    pub row_start: usize,

    // Header parsing
    pub set_header: Vec<String>,
    pub header_split_by: String,
    pub header_regex_match: bool,

    pub regex_matches: Vec<RegexMatch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexMatch {
    pub expression: String,
    /// Names for the capture groups of the first match
    pub keys: Vec<String>,
    /// Names for the capture groups of every match, one sample per match
    pub keys_multi: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    pub enable: bool,
    /// Emit one sample per series, keeping labels and metadata
    pub unflatten: bool,
    pub flattened_event: String,
    /// Label names whose values are folded into the flattened key
    pub key_merge: Vec<String>,
    pub keep_labels: bool,
    pub keep_help: bool,
    pub custom_attributes: StringMap,
    pub histogram: bool,
    pub histogram_event: String,
    pub summary: bool,
    pub summary_event: String,
    /// Event type -> metric name pattern: matching series are flattened into
    /// their own sample of that event type
    pub sample_keys: StringMap,
}

/// JMX (Jolokia) endpoint settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JmxConfig {
    pub domain: String,
    pub user: String,
    pub pass: String,
    pub host: String,
    pub port: String,
    /// Jolokia agent path, defaults to `/jolokia`
    pub path: String,
}

impl JmxConfig {
    /// Layer `self` over `base`: non-empty fields of `self` win
    pub fn merged_over(&self, base: &JmxConfig) -> JmxConfig {
        fn pick(top: &str, base: &str) -> String {
            if top.is_empty() { base } else { top }.to_string()
        }
        JmxConfig {
            domain: pick(&self.domain, &base.domain),
            user: pick(&self.user, &base.user),
            pass: pick(&self.pass, &base.pass),
            host: pick(&self.host, &base.host),
            port: pick(&self.port, &base.port),
            path: pick(&self.path, &base.path),
        }
    }

    /// Jolokia endpoint URL
    pub fn endpoint(&self) -> String {
        let host = if self.host.is_empty() {
            DEFAULT_JMX_HOST
        } else {
            &self.host
        };
        let port = if self.port.is_empty() {
            DEFAULT_JMX_PORT
        } else {
            &self.port
        };
        let path = if self.path.is_empty() {
            "/jolokia"
        } else {
            &self.path
        };
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}{}", host, port, path)
        } else {
            format!("http://{}:{}{}", host, port, path)
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() || !self.port.is_empty() || !self.domain.is_empty()
    }
}

/// Value re-parse directive
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubParse {
    /// `contains`, `match`, `prefix` or `regex`
    #[serde(rename = "type")]
    pub parse_type: String,
    pub key: String,
    /// `[pair_separator, key_value_separator, record_separator?]`
    pub split_by: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricParserConfig {
    pub namespace: NamespaceConfig,
    /// Attribute name -> `RATE`, `DELTA` or `GAUGE`
    pub metrics: StringMap,
    /// Match metric names by containment instead of equality
    pub auto_set: bool,
    /// Attributes always emitted as count entries; the value is ignored
    pub counts: StringMap,
    pub summaries: SummariesConfig,
}

impl MetricParserConfig {
    pub fn is_configured(&self) -> bool {
        !self.metrics.is_empty() || !self.counts.is_empty() || !self.summaries.is_empty()
    }
}

/// `summaries` takes either a list of attributes accumulated over the
/// harvest window, or a map of summary name -> the attributes holding its
/// pre-aggregated fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SummariesConfig {
    Window(Vec<String>),
    Fields(BTreeMap<String, SummaryFields>),
}

impl Default for SummariesConfig {
    fn default() -> Self {
        SummariesConfig::Window(Vec::new())
    }
}

impl SummariesConfig {
    pub fn is_empty(&self) -> bool {
        match self {
            SummariesConfig::Window(attrs) => attrs.is_empty(),
            SummariesConfig::Fields(map) => map.is_empty(),
        }
    }

    /// Attributes accumulated over the window
    pub fn window(&self) -> &[String] {
        match self {
            SummariesConfig::Window(attrs) => attrs,
            SummariesConfig::Fields(_) => &[],
        }
    }

    /// Pre-aggregated summaries, by name
    pub fn fields(&self) -> Vec<(String, SummaryFields)> {
        match self {
            SummariesConfig::Window(_) => Vec::new(),
            SummariesConfig::Fields(map) => {
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
        }
    }
}

/// Attribute names supplying each field of a pre-aggregated summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryFields {
    pub count: String,
    pub sum: String,
    pub min: String,
    pub max: String,
}

impl SummaryFields {
    pub fn attributes(&self) -> [&str; 4] {
        [
            self.count.as_str(),
            self.sum.as_str(),
            self.min.as_str(),
            self.max.as_str(),
        ]
    }
}

/// If neither field is set the namespace defaults to the API name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Literal namespace value
    pub custom_attr: String,
    /// Existing attributes whose values are chained into the namespace
    pub existing_attr: Vec<String>,
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&contents)?;
        config.file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if config.name.is_empty() {
            config.name = config.file_name.clone();
        }
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// One config per row of `lookup_file`, or the config itself when unset
    ///
    /// Every `${lf:key}` in the config is replaced by the row's value of
    /// `key`; references to keys the row lacks are left as they are.
    ///
    /// # Errors
    /// Returns `ConfigError::LookupFile` if the file cannot be read or is not
    /// a JSON list of objects
    pub fn expand_lookup_file(&self) -> Result<Vec<Config>, ConfigError> {
        if self.lookup_file.is_empty() {
            return Ok(vec![self.clone()]);
        }
        let lookup_error = |reason: String| ConfigError::LookupFile {
            path: self.lookup_file.clone(),
            reason,
        };

        let contents =
            std::fs::read_to_string(&self.lookup_file).map_err(|e| lookup_error(e.to_string()))?;
        let rows: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_str(&contents).map_err(|e| lookup_error(e.to_string()))?;

        let mut template = self.clone();
        template.lookup_file.clear();
        let tree = serde_yaml::to_value(&template)?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut tree = tree.clone();
            substitute_lookup_row(&mut tree, row);
            let mut config: Config = serde_yaml::from_value(tree)?;
            config.file_name = self.file_name.clone();
            configs.push(config);
        }
        tracing::debug!(config = %self.name, rows = configs.len(), "Lookup file expanded");
        Ok(configs)
    }

    /// Load every `.yml`/`.yaml` file in a directory, sorted by file name
    ///
    /// Files that fail to load are logged and skipped so one broken config
    /// does not take the others down.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<Self>, ConfigError> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yml") | Some("yaml")
                    )
            })
            .collect();
        paths.sort();

        let mut configs = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::load(&path) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Skipping config file");
                }
            }
        }
        Ok(configs)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        for (index, merge) in self.sample_merge.iter().enumerate() {
            if merge.event_type.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "sample_merge[{}] must set event_type",
                    index
                )));
            }
        }

        for api in &self.apis {
            if api.name.is_empty() {
                tracing::warn!(config = %self.name, "API without a name; namespace and cache lookups will use the default event type");
            }
            if !api.split.is_empty()
                && !matches!(api.split.as_str(), "horizontal" | "vertical")
            {
                return Err(ConfigError::ValidationError(format!(
                    "API '{}': split must be 'horizontal' or 'vertical', got '{}'",
                    api.name, api.split
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.apis.is_empty());
        assert!(!config.metric_api);
    }

    #[test]
    fn test_parse_minimal_api() {
        let config = Config::from_yaml_str(
            r#"
name: demo
apis:
  - name: disk
    commands:
      - run: df -h
        split: horizontal
"#,
        )
        .unwrap();
        assert_eq!(config.apis.len(), 1);
        assert_eq!(config.apis[0].resolved_event_type(), "diskSample");
        assert_eq!(config.apis[0].commands[0].run, "df -h");
    }

    #[test]
    fn test_string_map_keeps_order_and_scalars() {
        let config = Config::from_yaml_str(
            r#"
apis:
  - name: m
    math:
      b: ${a} + 1
      a_total: ${b} * 2
    custom_attributes:
      port: 8080
      enabled: true
"#,
        )
        .unwrap();
        let api = &config.apis[0];
        let keys: Vec<&str> = api.math.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a_total"]);
        assert_eq!(api.custom_attributes.get("port"), Some("8080"));
        assert_eq!(api.custom_attributes.get("enabled"), Some("true"));
    }

    #[test]
    fn test_unknown_fields_default() {
        let config = Config::from_yaml_str("apis:\n  - name: x\n    timeout: 250\n").unwrap();
        assert_eq!(config.apis[0].timeout, 250);
        assert!(config.apis[0].keep_keys.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let err = Config::from_yaml_str("sample_merge:\n  - samples: [aSample]\n");
        assert!(err.is_err());

        let err = Config::from_yaml_str("apis:\n  - name: x\n    split: diagonal\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_metric_parser_options() {
        let config = Config::from_yaml_str(
            r#"
apis:
  - name: q
    metric_parser:
      counts: {requests: 1}
      summaries:
        latency: {count: latCount, sum: latSum, min: latMin, max: latMax}
  - name: w
    metric_parser:
      summaries: [ms]
"#,
        )
        .unwrap();
        let q = &config.apis[0].metric_parser;
        assert!(q.is_configured());
        assert_eq!(q.counts.get("requests"), Some("1"));
        let fields = q.summaries.fields();
        assert_eq!(fields[0].0, "latency");
        assert_eq!(fields[0].1.attributes(), ["latCount", "latSum", "latMin", "latMax"]);
        assert!(q.summaries.window().is_empty());

        let w = &config.apis[1].metric_parser;
        assert_eq!(w.summaries.window().to_vec(), vec!["ms".to_string()]);
    }

    #[test]
    fn test_entity_id() {
        let config = Config::from_yaml_str(
            "apis:\n  - name: a\n    entity: db-1\n  - name: b\n    entity: db-2\n    entity_type: postgres\n  - name: c\n",
        )
        .unwrap();
        assert_eq!(config.apis[0].entity_id().unwrap().entity_type, DEFAULT_ENTITY_TYPE);
        assert_eq!(config.apis[1].entity_id().unwrap().entity_type, "postgres");
        assert!(config.apis[2].entity_id().is_none());
    }

    #[test]
    fn test_lookup_file_expansion() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"[{"host": "alpha", "port": 8080}, {"host": "beta"}]"#,
        )
        .unwrap();

        let config = Config::from_yaml_str(&format!(
            "name: svc\nlookup_file: {}\napis:\n  - name: ping\n    url: http://${{lf:host}}:${{lf:port}}/status\n    custom_attributes:\n      target: ${{lf:host}}\n",
            file.path().display()
        ))
        .unwrap();

        let expanded = config.expand_lookup_file().unwrap();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].apis[0].url, "http://alpha:8080/status");
        assert_eq!(expanded[0].apis[0].custom_attributes.get("target"), Some("alpha"));
        assert_eq!(expanded[1].apis[0].url, "http://beta:${lf:port}/status");
        assert!(expanded.iter().all(|c| c.lookup_file.is_empty()));

        let plain = Config::from_yaml_str("apis:\n  - name: x\n").unwrap();
        assert_eq!(plain.expand_lookup_file().unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_file_missing() {
        let config = Config::from_yaml_str("lookup_file: /nonexistent/rows.json\n").unwrap();
        assert!(matches!(
            config.expand_lookup_file(),
            Err(ConfigError::LookupFile { .. })
        ));
    }

    #[test]
    fn test_jmx_merge_and_endpoint() {
        let global = JmxConfig {
            host: "jvm.local".into(),
            ..Default::default()
        };
        let api = JmxConfig {
            port: "9000".into(),
            ..Default::default()
        };
        let merged = api.merged_over(&global);
        assert_eq!(merged.endpoint(), "http://jvm.local:9000/jolokia");
        assert_eq!(JmxConfig::default().endpoint(), "http://127.0.0.1:8778/jolokia");
    }
}
