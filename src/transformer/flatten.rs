//! JSON document flattening
//!
//! Turns a nested JSON document into flat attribute maps:
//!
//! - nested objects become dot-joined keys (`{"a":{"b":1}}` -> `a.b = 1`)
//! - arrays of objects expand into separate records, carrying the parent's
//!   own attributes as `parent.<key>` unless `disable_parent_attr` is set
//! - keys listed in `lazy_flatten` are flattened in place instead, with the
//!   array index in the key (`items.0.id`)
//! - `sample_keys` pulls a map of objects out of the document and turns each
//!   child into a record of its own event type

use serde_json::{Map, Value};

use super::sample::Attributes;

/// Options controlling how a document is flattened
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenOptions<'a> {
    pub start_key: &'a [String],
    pub split_objects: bool,
    pub lazy_flatten: &'a [String],
    pub disable_parent_attr: bool,
    pub strip_keys: &'a [String],
    /// (event type, `path>attribute`), paths relative to the document root
    pub sample_keys: &'a [(String, String)],
}

/// Records of one document, split by origin
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flattened {
    /// Records of the unit's own event type
    pub records: Vec<Attributes>,
    /// Records pulled out by `sample_keys`, with their event type
    pub keyed: Vec<(String, Attributes)>,
}

/// Flatten a document, first pulling out the objects named by `sample_keys`
pub fn flatten_with_sample_keys(mut value: Value, opts: &FlattenOptions<'_>) -> Flattened {
    let keyed = extract_sample_keys(&mut value, opts);
    Flattened {
        records: flatten_document(value, opts),
        keyed,
    }
}

fn extract_sample_keys(value: &mut Value, opts: &FlattenOptions<'_>) -> Vec<(String, Attributes)> {
    let mut keyed = Vec::new();
    for (event_type, spec) in opts.sample_keys {
        let segments: Vec<&str> = spec.split('>').map(str::trim).collect();
        let Some((attribute, path)) = segments.split_last() else {
            continue;
        };
        if path.is_empty() || attribute.is_empty() {
            tracing::debug!(event_type = %event_type, spec = %spec, "sample_keys entry is not path>attribute");
            continue;
        }
        let Some(Value::Object(children)) = take_path(value, path) else {
            continue;
        };
        for (key, child) in children {
            let Value::Object(child) = child else {
                continue;
            };
            for mut record in flatten_object(child, opts) {
                record.insert(attribute.to_string(), Value::String(key.clone()));
                keyed.push((event_type.clone(), record));
            }
        }
    }
    keyed
}

/// Remove and return the value at `path`
fn take_path(value: &mut Value, path: &[&str]) -> Option<Value> {
    let (first, rest) = path.split_first()?;
    let obj = value.as_object_mut()?;
    if rest.is_empty() {
        obj.remove(*first)
    } else {
        take_path(obj.get_mut(*first)?, rest)
    }
}

/// Flatten a document into records
pub fn flatten_document(mut value: Value, opts: &FlattenOptions<'_>) -> Vec<Attributes> {
    for path in opts.strip_keys {
        let segments: Vec<&str> = path.split('>').map(str::trim).collect();
        strip_path(&mut value, &segments);
    }

    for key in opts.start_key {
        value = match value {
            Value::Object(mut obj) => match obj.remove(key) {
                Some(inner) => inner,
                None => return Vec::new(),
            },
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(mut obj) => obj.remove(key),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => return Vec::new(),
        };
    }

    if opts.split_objects {
        value = split_objects(value);
    }

    let mut records = Vec::new();
    flatten_root(value, opts, &mut records);
    records
}

fn flatten_root(value: Value, opts: &FlattenOptions<'_>, records: &mut Vec<Attributes>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_root(item, opts, records);
            }
        }
        Value::Object(obj) => records.extend(flatten_object(obj, opts)),
        Value::Null => {}
        scalar => {
            let mut attrs = Attributes::new();
            attrs.insert("value".to_string(), scalar);
            records.push(attrs);
        }
    }
}

/// Flatten one object; the first record is the object itself, followed by
/// the records expanded from its arrays of objects
fn flatten_object(obj: Map<String, Value>, opts: &FlattenOptions<'_>) -> Vec<Attributes> {
    let mut attrs = Attributes::new();
    let mut children: Vec<Vec<Value>> = Vec::new();

    for (key, value) in obj {
        walk(&key, &key, value, opts, &mut attrs, &mut children);
    }

    let mut records = Vec::new();
    for items in children {
        for item in items {
            let Value::Object(child) = item else { continue };
            for mut record in flatten_object(child, opts) {
                if !opts.disable_parent_attr {
                    for (k, v) in &attrs {
                        record
                            .entry(format!("parent.{}", k))
                            .or_insert_with(|| v.clone());
                    }
                }
                records.push(record);
            }
        }
    }

    if !attrs.is_empty() {
        records.insert(0, attrs);
    }
    records
}

fn walk(
    path: &str,
    leaf: &str,
    value: Value,
    opts: &FlattenOptions<'_>,
    attrs: &mut Attributes,
    children: &mut Vec<Vec<Value>>,
) {
    match value {
        Value::Null => {}
        Value::Object(obj) => {
            for (k, v) in obj {
                let nested = format!("{}.{}", path, k);
                walk(&nested, &k, v, opts, attrs, children);
            }
        }
        Value::Array(items) => {
            let expandable =
                !items.is_empty() && items.iter().all(Value::is_object) && !is_lazy(path, leaf, opts);
            if expandable {
                children.push(items);
            } else {
                for (i, item) in items.into_iter().enumerate() {
                    let nested = format!("{}.{}", path, i);
                    walk(&nested, leaf, item, opts, attrs, children);
                }
            }
        }
        scalar => {
            attrs.insert(path.to_string(), scalar);
        }
    }
}

fn is_lazy(path: &str, leaf: &str, opts: &FlattenOptions<'_>) -> bool {
    opts.lazy_flatten.iter().any(|k| k == path || k == leaf)
}

/// Turn `{"a": {...}, "b": {...}}` into `[{"split.id": "a", ...}, ...]`
fn split_objects(value: Value) -> Value {
    match value {
        Value::Object(obj) if !obj.is_empty() && obj.values().all(Value::is_object) => {
            Value::Array(
                obj.into_iter()
                    .map(|(id, inner)| {
                        let mut inner = match inner {
                            Value::Object(m) => m,
                            _ => Map::new(),
                        };
                        inner.insert("split.id".to_string(), Value::String(id));
                        Value::Object(inner)
                    })
                    .collect(),
            )
        }
        other => other,
    }
}

fn strip_path(value: &mut Value, segments: &[&str]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    match value {
        Value::Object(obj) => {
            if rest.is_empty() {
                obj.remove(*first);
            } else if let Some(inner) = obj.get_mut(*first) {
                strip_path(inner, rest);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_path(item, segments);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_objects_flatten() {
        let records = flatten_document(
            json!({"name": "api", "stats": {"hits": 5, "miss": {"cold": 1}}}),
            &FlattenOptions::default(),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["stats.hits"], json!(5));
        assert_eq!(records[0]["stats.miss.cold"], json!(1));
    }

    #[test]
    fn test_array_of_objects_expands() {
        let records = flatten_document(
            json!({"cluster": "c1", "nodes": [{"id": 1}, {"id": 2}]}),
            &FlattenOptions::default(),
        );
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["cluster"], json!("c1"));
        assert_eq!(records[1]["id"], json!(1));
        assert_eq!(records[2]["parent.cluster"], json!("c1"));
    }

    #[test]
    fn test_disable_parent_attr() {
        let records = flatten_document(
            json!({"cluster": "c1", "nodes": [{"id": 1}]}),
            &FlattenOptions {
                disable_parent_attr: true,
                ..Default::default()
            },
        );
        assert!(!records[1].contains_key("parent.cluster"));
    }

    #[test]
    fn test_lazy_flatten_keeps_single_record() {
        let lazy = vec!["nodes".to_string()];
        let records = flatten_document(
            json!({"cluster": "c1", "nodes": [{"id": 1}, {"id": 2}]}),
            &FlattenOptions {
                lazy_flatten: &lazy,
                ..Default::default()
            },
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["nodes.1.id"], json!(2));
    }

    #[test]
    fn test_start_key_and_split_objects() {
        let start = vec!["data".to_string()];
        let records = flatten_document(
            json!({"data": {"eth0": {"rx": 1}, "eth1": {"rx": 2}}}),
            &FlattenOptions {
                start_key: &start,
                split_objects: true,
                ..Default::default()
            },
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["split.id"], json!("eth0"));
        assert_eq!(records[1]["rx"], json!(2));
    }

    #[test]
    fn test_strip_keys_nested() {
        let strip = vec!["meta>secret".to_string(), "noise".to_string()];
        let records = flatten_document(
            json!({"noise": 1, "meta": {"secret": "x", "ok": true}}),
            &FlattenOptions {
                strip_keys: &strip,
                ..Default::default()
            },
        );
        assert_eq!(records[0].len(), 1);
        assert_eq!(records[0]["meta.ok"], json!(true));
    }

    #[test]
    fn test_sample_keys_split_children() {
        let sample_keys = vec![("pipelineSample".to_string(), "stats>pipelines>pipeline.id".to_string())];
        let flattened = flatten_with_sample_keys(
            json!({
                "host": "ls-1",
                "stats": {
                    "uptime": 30,
                    "pipelines": {
                        "main": {"events": {"in": 10}},
                        "audit": {"events": {"in": 2}}
                    }
                }
            }),
            &FlattenOptions {
                sample_keys: &sample_keys,
                ..Default::default()
            },
        );

        assert_eq!(flattened.records.len(), 1);
        assert_eq!(flattened.records[0]["stats.uptime"], json!(30));
        assert!(!flattened.records[0].keys().any(|k| k.contains("pipelines")));

        assert_eq!(flattened.keyed.len(), 2);
        assert!(flattened.keyed.iter().all(|(et, _)| et == "pipelineSample"));
        let audit = flattened
            .keyed
            .iter()
            .map(|(_, record)| record)
            .find(|record| record["pipeline.id"] == json!("audit"))
            .unwrap();
        assert_eq!(audit["events.in"], json!(2));
    }

    #[test]
    fn test_sample_keys_missing_path() {
        let sample_keys = vec![("xSample".to_string(), "absent>id".to_string())];
        let flattened = flatten_with_sample_keys(
            json!({"a": 1}),
            &FlattenOptions {
                sample_keys: &sample_keys,
                ..Default::default()
            },
        );
        assert_eq!(flattened.records.len(), 1);
        assert!(flattened.keyed.is_empty());
    }

    #[test]
    fn test_top_level_scalars() {
        let records = flatten_document(json!([1, "two"]), &FlattenOptions::default());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["value"], json!("two"));
    }
}
