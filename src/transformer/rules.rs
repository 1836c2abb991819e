//! Directive stages of the transform pipeline
//!
//! Each directive of an API definition is compiled once into a stage object.
//! Stages mutate a [`Sample`] in place and report whether it survives, is
//! dropped, or produced additional child samples.
//!
//! Every regex is compiled when the pipeline is built. An invalid pattern is
//! a [`StageError`] and fails only the API that declared it.

use regex::{NoExpand, Regex};
use serde_json::Value;
use once_cell::sync::OnceCell;
use std::fmt;

use crate::config::{StringMap, SubParse};
use crate::error::{ComputeError, StageError};

use super::math::Expr;
use super::sample::{infer_value, number_value, value_as_string, Attributes, Sample};

/// Outcome of applying a stage to one sample
#[derive(Debug)]
pub enum Verdict {
    /// Sample continues to the next stage
    Keep,
    /// Sample is dropped and counted
    Drop,
    /// Sample continues, followed by these additional samples
    Expand(Vec<Sample>),
}

/// Per-unit inputs shared by every stage
#[derive(Debug, Clone, Copy)]
pub struct StageEnv<'a> {
    /// Keys exempt from key shaping, value shaping, sub-parse and math
    pub skip: &'a KeyMatcher,
    /// Custom attributes of the fetched unit (e.g. a command)
    pub unit_attributes: &'a StringMap,
}

/// A compiled pipeline stage
pub trait Stage: fmt::Debug + Send + Sync {
    /// Directive name, used in logs
    fn name(&self) -> &'static str;

    /// Apply the stage to one sample
    fn apply(&self, sample: &mut Sample, env: &StageEnv<'_>) -> Verdict;
}

/// Key matcher: a key matches a pattern when it is equal to it or when the
/// pattern, read as a regex, finds a match in it
#[derive(Debug, Clone, Default)]
pub struct KeyMatcher {
    patterns: Vec<(String, Regex)>,
}

impl KeyMatcher {
    /// Compile a list of key patterns
    ///
    /// # Errors
    /// Returns `StageError::InvalidPattern` for the first invalid regex
    pub fn compile(directive: &'static str, patterns: &[String]) -> Result<Self, StageError> {
        let patterns = patterns
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| {
                Regex::new(p)
                    .map(|re| (p.clone(), re))
                    .map_err(|e| StageError::pattern(directive, p, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, key: &str) -> bool {
        self.patterns
            .iter()
            .any(|(literal, re)| literal == key || re.is_match(key))
    }
}

fn compile_pairs(
    directive: &'static str,
    map: &StringMap,
) -> Result<Vec<(Regex, String)>, StageError> {
    map.iter()
        .map(|(pattern, value)| {
            Regex::new(pattern)
                .map(|re| (re, value.to_string()))
                .map_err(|e| StageError::pattern(directive, pattern, e))
        })
        .collect()
}

/// Rebuild the attribute map with renamed keys; `None` keeps the key as is
fn rekey(sample: &mut Sample, mut rename: impl FnMut(&str) -> Option<String>) {
    let old = std::mem::take(&mut sample.attributes);
    let mut renamed = Attributes::new();
    for (key, value) in old {
        match rename(&key) {
            Some(new_key) if !new_key.is_empty() => {
                renamed.insert(new_key, value);
            }
            _ => {
                renamed.insert(key, value);
            }
        }
    }
    sample.attributes = renamed;
}

// ---------------------------------------------------------------------------
// 1. strip keys
// ---------------------------------------------------------------------------

/// Removes flattened keys, or whole flattened subtrees (`a>b` -> `a.b.*`)
#[derive(Debug)]
pub struct StripKeys {
    keys: Vec<String>,
}

impl StripKeys {
    pub fn new(keys: &[String]) -> Option<Self> {
        let keys: Vec<String> = keys
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| k.split('>').map(str::trim).collect::<Vec<_>>().join("."))
            .collect();
        (!keys.is_empty()).then_some(Self { keys })
    }
}

impl Stage for StripKeys {
    fn name(&self) -> &'static str {
        "strip_keys"
    }

    fn apply(&self, sample: &mut Sample, _env: &StageEnv<'_>) -> Verdict {
        sample.attributes.retain(|key, _| {
            !self.keys.iter().any(|strip| {
                key == strip
                    || (key.starts_with(strip.as_str())
                        && key[strip.len()..].starts_with('.'))
            })
        });
        Verdict::Keep
    }
}

// ---------------------------------------------------------------------------
// 2. rename samples
// ---------------------------------------------------------------------------

/// Reclassifies a sample when one of its keys matches a pattern
#[derive(Debug)]
pub struct RenameSamples {
    rules: Vec<(Regex, String)>,
}

impl RenameSamples {
    pub fn compile(map: &StringMap) -> Result<Option<Self>, StageError> {
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            rules: compile_pairs("rename_samples", map)?,
        }))
    }
}

impl Stage for RenameSamples {
    fn name(&self) -> &'static str {
        "rename_samples"
    }

    fn apply(&self, sample: &mut Sample, _env: &StageEnv<'_>) -> Verdict {
        let hit = self
            .rules
            .iter()
            .find(|(re, _)| sample.attributes.keys().any(|k| re.is_match(k)));
        if let Some((_, event_type)) = hit {
            sample.event_type = event_type.clone();
        }
        Verdict::Keep
    }
}

// ---------------------------------------------------------------------------
// 3. rename / replace keys
// ---------------------------------------------------------------------------

/// `rename_keys` tests each key against a pattern and swaps the matched
/// part for the literal replacement, `replace_keys` runs a regex
/// replacement supporting `$1` style references
#[derive(Debug)]
pub struct RenameKeys {
    renames: Vec<(Regex, String)>,
    patterns: Vec<(Regex, String)>,
}

impl RenameKeys {
    pub fn compile(rename: &StringMap, replace: &StringMap) -> Result<Option<Self>, StageError> {
        if rename.is_empty() && replace.is_empty() {
            return Ok(None);
        }
        let rename: StringMap = rename.iter().filter(|(from, _)| !from.is_empty()).collect();
        Ok(Some(Self {
            renames: compile_pairs("rename_keys", &rename)?,
            patterns: compile_pairs("replace_keys", replace)?,
        }))
    }
}

impl Stage for RenameKeys {
    fn name(&self) -> &'static str {
        "rename_keys"
    }

    fn apply(&self, sample: &mut Sample, _env: &StageEnv<'_>) -> Verdict {
        rekey(sample, |key| {
            let mut new_key = key.to_string();
            for (re, to) in &self.renames {
                if re.is_match(&new_key) {
                    new_key = re.replace_all(&new_key, NoExpand(to)).into_owned();
                }
            }
            for (re, replacement) in &self.patterns {
                new_key = re.replace_all(&new_key, replacement.as_str()).into_owned();
            }
            (new_key != key).then_some(new_key)
        });
        Verdict::Keep
    }
}

// ---------------------------------------------------------------------------
// 4. key shaping
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct KeyShaping {
    to_lower: bool,
    convert_space: Option<String>,
    snake_to_camel: bool,
}

impl KeyShaping {
    pub fn new(to_lower: bool, convert_space: &str, snake_to_camel: bool) -> Option<Self> {
        let convert_space = (!convert_space.is_empty()).then(|| convert_space.to_string());
        (to_lower || snake_to_camel || convert_space.is_some()).then_some(Self {
            to_lower,
            convert_space,
            snake_to_camel,
        })
    }

    fn shape(&self, key: &str) -> String {
        let mut out = key.to_string();
        if self.to_lower {
            out = out.to_lowercase();
        }
        if let Some(replacement) = &self.convert_space {
            out = out.replace(' ', replacement);
        }
        if self.snake_to_camel {
            out = snake_to_camel(&out);
        }
        out
    }
}

impl Stage for KeyShaping {
    fn name(&self) -> &'static str {
        "key_shaping"
    }

    fn apply(&self, sample: &mut Sample, env: &StageEnv<'_>) -> Verdict {
        rekey(sample, |key| {
            if env.skip.matches(key) {
                None
            } else {
                Some(self.shape(key))
            }
        });
        Verdict::Keep
    }
}

/// `disk_used_bytes` -> `diskUsedBytes`
pub fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for (i, c) in key.chars().enumerate() {
        if c == '_' && i > 0 {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// 5. value shaping
// ---------------------------------------------------------------------------

static NUMBER_RE: OnceCell<Regex> = OnceCell::new();

fn pluck_number_regex() -> &'static Regex {
    NUMBER_RE.get_or_init(|| {
        Regex::new(r"[-+]?\d*\.?\d+(?:[eE][-+]?\d+)?").expect("invalid number regex")
    })
}

/// `perc_to_decimal`, `pluck_numbers`, `value_parser` and
/// `value_transformer`, applied in that order
#[derive(Debug)]
pub struct ValueShaping {
    perc_to_decimal: bool,
    pluck_numbers: bool,
    parsers: Vec<(Regex, Regex)>,
    transformers: Vec<(Regex, String)>,
}

impl ValueShaping {
    pub fn compile(
        perc_to_decimal: bool,
        pluck_numbers: bool,
        value_parser: &StringMap,
        value_transformer: &StringMap,
    ) -> Result<Option<Self>, StageError> {
        if !perc_to_decimal
            && !pluck_numbers
            && value_parser.is_empty()
            && value_transformer.is_empty()
        {
            return Ok(None);
        }
        let parsers = value_parser
            .iter()
            .map(|(key, pattern)| {
                let key_re =
                    Regex::new(key).map_err(|e| StageError::pattern("value_parser", key, e))?;
                let value_re = Regex::new(pattern)
                    .map_err(|e| StageError::pattern("value_parser", pattern, e))?;
                Ok((key_re, value_re))
            })
            .collect::<Result<Vec<_>, StageError>>()?;
        Ok(Some(Self {
            perc_to_decimal,
            pluck_numbers,
            parsers,
            transformers: compile_pairs("value_transformer", value_transformer)?,
        }))
    }

    fn shape(&self, key: &str, mut value: Value) -> Result<Value, ComputeError> {
        if self.perc_to_decimal {
            if let Value::String(s) = &value {
                if let Some(stripped) = s.trim().strip_suffix('%') {
                    if let Ok(n) = stripped.trim().parse::<f64>() {
                        value = number_value(n);
                    }
                }
            }
        }

        if self.pluck_numbers {
            if let Value::String(s) = &value {
                if let Some(m) = pluck_number_regex().find(s) {
                    value = infer_value(m.as_str());
                }
            }
        }

        if let Some((_, value_re)) = self.parsers.iter().find(|(re, _)| re.is_match(key)) {
            let raw = value_as_string(&value).unwrap_or_default();
            let caps = value_re
                .captures(&raw)
                .ok_or_else(|| ComputeError::NoMatch(key.to_string()))?;
            let extracted = caps.get(1).or_else(|| caps.get(0)).map_or("", |m| m.as_str());
            value = infer_value(extracted);
        }

        if let Some((_, template)) = self.transformers.iter().find(|(re, _)| re.is_match(key)) {
            let raw = value_as_string(&value).unwrap_or_default();
            value = infer_value(&template.replace("${value}", &raw));
        }

        Ok(value)
    }
}

impl Stage for ValueShaping {
    fn name(&self) -> &'static str {
        "value_shaping"
    }

    fn apply(&self, sample: &mut Sample, env: &StageEnv<'_>) -> Verdict {
        let old = std::mem::take(&mut sample.attributes);
        for (key, value) in old {
            if env.skip.matches(&key) {
                sample.attributes.insert(key, value);
                continue;
            }
            match self.shape(&key, value) {
                Ok(v) => {
                    sample.attributes.insert(key, v);
                }
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Attribute dropped by value shaping");
                }
            }
        }
        Verdict::Keep
    }
}

// ---------------------------------------------------------------------------
// 6. sub-parse
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum KeyTest {
    Contains(String),
    Exact(String),
    Prefix(String),
    Pattern(Regex),
}

impl KeyTest {
    fn matches(&self, key: &str) -> bool {
        match self {
            KeyTest::Contains(s) => key.contains(s.as_str()),
            KeyTest::Exact(s) => key == s,
            KeyTest::Prefix(s) => key.starts_with(s.as_str()),
            KeyTest::Pattern(re) => re.is_match(key),
        }
    }
}

#[derive(Debug)]
struct SubParseRule {
    test: KeyTest,
    pair_sep: String,
    kv_sep: String,
    record_sep: Option<String>,
}

impl SubParseRule {
    fn pairs<'a>(&'a self, text: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        text.split(self.pair_sep.as_str()).filter_map(move |pair| {
            let (k, v) = pair.split_once(self.kv_sep.as_str())?;
            let k = k.trim();
            (!k.is_empty()).then_some((k, v.trim()))
        })
    }
}

/// Re-parses values of matching keys into `key.sub` attributes, or into
/// child samples when a record separator is configured
#[derive(Debug)]
pub struct SubParseStage {
    rules: Vec<SubParseRule>,
}

impl SubParseStage {
    pub fn compile(directives: &[SubParse]) -> Result<Option<Self>, StageError> {
        if directives.is_empty() {
            return Ok(None);
        }
        let mut rules = Vec::with_capacity(directives.len());
        for d in directives {
            let test = match d.parse_type.as_str() {
                "contains" => KeyTest::Contains(d.key.clone()),
                "match" => KeyTest::Exact(d.key.clone()),
                "prefix" => KeyTest::Prefix(d.key.clone()),
                "regex" => KeyTest::Pattern(
                    Regex::new(&d.key).map_err(|e| StageError::pattern("sub_parse", &d.key, e))?,
                ),
                other => {
                    return Err(StageError::InvalidDirective {
                        directive: "sub_parse",
                        reason: format!("unknown type '{}'", other),
                    })
                }
            };
            if d.split_by.len() < 2 || d.split_by[..2].iter().any(String::is_empty) {
                return Err(StageError::InvalidDirective {
                    directive: "sub_parse",
                    reason: format!(
                        "key '{}' needs split_by [pair_separator, key_value_separator]",
                        d.key
                    ),
                });
            }
            rules.push(SubParseRule {
                test,
                pair_sep: d.split_by[0].clone(),
                kv_sep: d.split_by[1].clone(),
                record_sep: d.split_by.get(2).filter(|s| !s.is_empty()).cloned(),
            });
        }
        Ok(Some(Self { rules }))
    }
}

impl Stage for SubParseStage {
    fn name(&self) -> &'static str {
        "sub_parse"
    }

    fn apply(&self, sample: &mut Sample, env: &StageEnv<'_>) -> Verdict {
        let mut added = Attributes::new();
        let mut children = Vec::new();

        for (key, value) in &sample.attributes {
            if env.skip.matches(key) {
                continue;
            }
            let Some(rule) = self.rules.iter().find(|r| r.test.matches(key)) else {
                continue;
            };
            let Some(text) = value.as_str() else { continue };

            match &rule.record_sep {
                Some(record_sep) => {
                    for record in text.split(record_sep.as_str()) {
                        let mut child = Sample::new(sample.event_type.clone());
                        for (k, v) in rule.pairs(record) {
                            child.set(format!("{}.{}", key, k), infer_value(v));
                        }
                        if !child.is_empty() {
                            children.push(child);
                        }
                    }
                }
                None => {
                    for (k, v) in rule.pairs(text) {
                        added.insert(format!("{}.{}", key, k), infer_value(v));
                    }
                }
            }
        }

        sample.attributes.extend(added);
        if children.is_empty() {
            Verdict::Keep
        } else {
            Verdict::Expand(children)
        }
    }
}

// ---------------------------------------------------------------------------
// 7. math
// ---------------------------------------------------------------------------

/// Computes new attributes from arithmetic over existing ones; expressions
/// run in declaration order, so later ones may use earlier results
#[derive(Debug)]
pub struct MathStage {
    expressions: Vec<(String, Expr)>,
}

impl MathStage {
    pub fn compile(map: &StringMap) -> Result<Option<Self>, StageError> {
        if map.is_empty() {
            return Ok(None);
        }
        let expressions = map
            .iter()
            .map(|(name, expression)| {
                Expr::parse(expression)
                    .map(|expr| (name.to_string(), expr))
                    .map_err(|reason| StageError::InvalidExpression {
                        name: name.to_string(),
                        expression: expression.to_string(),
                        reason,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Self { expressions }))
    }
}

impl Stage for MathStage {
    fn name(&self) -> &'static str {
        "math"
    }

    fn apply(&self, sample: &mut Sample, env: &StageEnv<'_>) -> Verdict {
        for (name, expr) in &self.expressions {
            if env.skip.matches(name) {
                continue;
            }
            match expr.eval(sample) {
                Ok(v) => sample.set(name.clone(), number_value(v)),
                Err(e) => {
                    tracing::debug!(attribute = %name, error = %e, "Math expression skipped");
                }
            }
        }
        Verdict::Keep
    }
}

// ---------------------------------------------------------------------------
// 8. sample filters
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FilterRule {
    key: Regex,
    value: Regex,
}

impl FilterRule {
    fn matches(&self, sample: &Sample) -> bool {
        sample.attributes.iter().any(|(k, v)| {
            self.key.is_match(k)
                && value_as_string(v).is_some_and(|s| self.value.is_match(&s))
        })
    }
}

/// `sample_filter` drops samples matching any rule, `sample_include_filter`
/// drops samples matching none
#[derive(Debug)]
pub struct SampleFilter {
    exclude: Vec<FilterRule>,
    include: Vec<FilterRule>,
}

impl SampleFilter {
    pub fn compile(
        exclude: &[StringMap],
        include: &[StringMap],
    ) -> Result<Option<Self>, StageError> {
        fn rules(directive: &'static str, maps: &[StringMap]) -> Result<Vec<FilterRule>, StageError> {
            let mut out = Vec::new();
            for map in maps {
                for (key, value) in map.iter() {
                    out.push(FilterRule {
                        key: Regex::new(key).map_err(|e| StageError::pattern(directive, key, e))?,
                        value: Regex::new(value)
                            .map_err(|e| StageError::pattern(directive, value, e))?,
                    });
                }
            }
            Ok(out)
        }

        let exclude = rules("sample_filter", exclude)?;
        let include = rules("sample_include_filter", include)?;
        if exclude.is_empty() && include.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { exclude, include }))
    }
}

impl Stage for SampleFilter {
    fn name(&self) -> &'static str {
        "sample_filter"
    }

    fn apply(&self, sample: &mut Sample, _env: &StageEnv<'_>) -> Verdict {
        if self.exclude.iter().any(|r| r.matches(sample)) {
            return Verdict::Drop;
        }
        if !self.include.is_empty() && !self.include.iter().any(|r| r.matches(sample)) {
            return Verdict::Drop;
        }
        Verdict::Keep
    }
}

// ---------------------------------------------------------------------------
// 9. keep / remove keys
// ---------------------------------------------------------------------------

/// `keep_keys` runs first, then `remove_keys`; a key matched by both is removed
#[derive(Debug)]
pub struct KeepRemoveKeys {
    keep: KeyMatcher,
    remove: KeyMatcher,
}

impl KeepRemoveKeys {
    pub fn compile(keep: &[String], remove: &[String]) -> Result<Option<Self>, StageError> {
        let keep = KeyMatcher::compile("keep_keys", keep)?;
        let remove = KeyMatcher::compile("remove_keys", remove)?;
        if keep.is_empty() && remove.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { keep, remove }))
    }
}

impl Stage for KeepRemoveKeys {
    fn name(&self) -> &'static str {
        "keep_remove_keys"
    }

    fn apply(&self, sample: &mut Sample, _env: &StageEnv<'_>) -> Verdict {
        if !self.keep.is_empty() {
            sample.attributes.retain(|key, _| self.keep.matches(key));
        }
        if !self.remove.is_empty() {
            sample.attributes.retain(|key, _| !self.remove.matches(key));
        }
        Verdict::Keep
    }
}

// ---------------------------------------------------------------------------
// 10. prefix and custom attributes
// ---------------------------------------------------------------------------

/// Prefixes every data key, then adds custom attributes (config, API, then
/// the fetched unit; later wins). Custom attributes are never prefixed.
#[derive(Debug)]
pub struct Decorate {
    prefix: String,
    custom: StringMap,
}

impl Decorate {
    pub fn new(prefix: &str, config_attrs: &StringMap, api_attrs: &StringMap) -> Self {
        let mut custom = config_attrs.clone();
        for (k, v) in api_attrs.iter() {
            custom.insert(k, v);
        }
        Self {
            prefix: prefix.to_string(),
            custom,
        }
    }
}

impl Stage for Decorate {
    fn name(&self) -> &'static str {
        "decorate"
    }

    fn apply(&self, sample: &mut Sample, env: &StageEnv<'_>) -> Verdict {
        if !self.prefix.is_empty() {
            rekey(sample, |key| Some(format!("{}{}", self.prefix, key)));
        }
        for (k, v) in self.custom.iter().chain(env.unit_attributes.iter()) {
            sample.set(k, v);
        }
        Verdict::Keep
    }
}
