//! End-to-end harvest tests
//!
//! Drives whole configs through the dispatcher, transform pipeline, metric
//! parser and emission using shell sources, so no network is needed.

use std::sync::Arc;

use flex_collector::collector::Dispatcher;
use flex_collector::config::{Config, StringMap};
use flex_collector::context::CollectorContext;
use flex_collector::metric_parser::{MetricParser, NamespaceTable, SummaryAccumulator};
use flex_collector::metrics::{EVENT_COUNT, EVENT_DROP_COUNT};
use flex_collector::runner::{run_config, Runner};
use flex_collector::transformer::{Attributes, Pipeline, Sample};
use serde_json::json;

fn config(yaml: &str) -> Config {
    Config::from_yaml_str(yaml).unwrap()
}

fn record(value: serde_json::Value) -> Attributes {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => panic!("record must be an object"),
    }
}

#[test]
fn test_keep_remove_is_idempotent() {
    let config = config(
        r#"
apis:
  - name: proc
    keep_keys: ["^cpu", "^mem", "name"]
    remove_keys: ["Raw$"]
"#,
    );
    let api = &config.apis[0];
    let pipeline = Pipeline::compile(&config, api).unwrap();

    let input = vec![record(json!({
        "name": "java",
        "cpuPct": 12.5,
        "cpuRaw": 125,
        "memBytes": 2048,
        "threads": 40
    }))];
    let once = pipeline.run(input, "procSample", &StringMap::new()).samples;
    let twice = pipeline
        .run(
            once.iter().map(|s| s.attributes.clone()).collect(),
            "procSample",
            &StringMap::new(),
        )
        .samples;

    assert_eq!(once, twice);
    let keys: Vec<&str> = once[0].attributes.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["cpuPct", "memBytes", "name"]);
}

#[test]
fn test_rate_sequence_through_parser() {
    let config = config(
        r#"
apis:
  - name: net
    metric_parser:
      metrics:
        rxBytes: RATE
"#,
    );
    let parser = MetricParser::from_api(&config.apis[0]).unwrap().unwrap();
    let table = NamespaceTable::new();
    let summaries = SummaryAccumulator::new();

    let observe = |value: i64, ts: u64| {
        let mut s = Sample::new("netSample");
        s.set("rxBytes", value);
        parser.apply(s, &table, &summaries, ts).sample
    };

    assert_eq!(observe(100, 0).get_f64("rxBytes"), Some(100.0));
    let rate = observe(150, 60_000).get_f64("rxBytes").unwrap();
    assert!((rate - 50.0 / 60.0).abs() < 1e-9);
    // counter went down: raw value, prior reset
    assert_eq!(observe(130, 120_000).get_f64("rxBytes"), Some(130.0));
    assert_eq!(observe(130, 180_000).get_f64("rxBytes"), Some(0.0));
}

#[test]
fn test_unseen_namespace_passes_raw() {
    let config = config(
        r#"
apis:
  - name: net
    metric_parser:
      namespace:
        existing_attr: [iface]
      metrics:
        rxBytes: DELTA
"#,
    );
    let parser = MetricParser::from_api(&config.apis[0]).unwrap().unwrap();
    let table = NamespaceTable::new();
    let summaries = SummaryAccumulator::new();

    let sample = |iface: &str, value: i64| {
        let mut s = Sample::new("netSample");
        s.set("iface", iface);
        s.set("rxBytes", value);
        s
    };

    parser.apply(sample("eth0", 10), &table, &summaries, 0);
    let eth0 = parser.apply(sample("eth0", 25), &table, &summaries, 1_000);
    let eth1 = parser.apply(sample("eth1", 25), &table, &summaries, 1_000);

    assert_eq!(eth0.sample.get_f64("rxBytes"), Some(15.0));
    assert!(eth0.counts.contains("rxBytes"));
    assert_eq!(eth1.sample.get_f64("rxBytes"), Some(25.0));
    assert!(eth1.counts.is_empty());
    assert_eq!(eth1.sample.get_string("namespace").as_deref(), Some("eth1"));
}

#[tokio::test]
async fn test_filter_drops_server_errors() {
    let config = config(
        r#"
apis:
  - name: web
    commands:
      - run: "printf 'path status\n/ 200\n/a 500\n/b 404\n'"
        split: horizontal
    sample_filter:
      - status: "^5\\d\\d$"
"#,
    );
    let ctx = CollectorContext::new();
    let summary = run_config(&config, &Dispatcher::new(), &ctx).await;

    assert_eq!(summary.events, 2);
    let payload = ctx.take_payload();
    let statuses: Vec<_> = payload.data[0]
        .metrics
        .iter()
        .filter_map(|s| s.get_f64("status"))
        .collect();
    assert_eq!(statuses, vec![200.0, 404.0]);
    assert_eq!(ctx.counters().read(EVENT_DROP_COUNT), 1);
}

#[tokio::test]
async fn test_event_limit_drops_excess() {
    let config = config(
        r#"
apis:
  - name: rows
    commands:
      - run: "printf 'n\n1\n2\n3\n4\n5\n'"
        split: horizontal
"#,
    );
    let ctx = CollectorContext::new().with_event_limit(2);
    let summary = run_config(&config, &Dispatcher::new(), &ctx).await;

    assert_eq!(summary.events, 2);
    assert_eq!(ctx.counters().read(EVENT_COUNT), 2);
    assert_eq!(ctx.counters().read(EVENT_DROP_COUNT), 3);
    assert_eq!(ctx.take_payload().sample_count(), 2);
}

#[tokio::test]
async fn test_horizontal_split_one_sample_per_row() {
    let rows = 7;
    let mut script = String::from("echo 'name size'");
    for i in 0..rows {
        script.push_str(&format!("; echo 'f{} {}'", i, i * 10));
    }
    let yaml = format!(
        "apis:\n  - name: files\n    commands:\n      - run: \"{}\"\n        split: horizontal\n",
        script
    );
    let config = config(&yaml);
    let ctx = CollectorContext::new();
    run_config(&config, &Dispatcher::new(), &ctx).await;

    let payload = ctx.take_payload();
    let samples = &payload.data[0].metrics;
    assert_eq!(samples.len(), rows);
    assert_eq!(samples[3].get_string("name").as_deref(), Some("f3"));
    assert_eq!(samples[3].get_f64("size"), Some(30.0));
}

#[tokio::test]
async fn test_async_commands_one_batch_each() {
    let mut yaml = String::from(
        "metric_api: true\napis:\n  - name: fan\n    commands_async: true\n    commands_async_limit: 4\n    commands:\n",
    );
    for i in 0..10 {
        yaml.push_str(&format!("      - run: \"echo 'value: {}'\"\n", i));
    }
    let configs = vec![config(&yaml)];
    let ctx = Arc::new(CollectorContext::new().with_interval_ms(30_000));

    let summary = Runner::new().harvest(&configs, &ctx).await;

    assert_eq!(summary.units, 10);
    assert_eq!(summary.metric_samples, 10);
    let batches = ctx.store().drain();
    assert_eq!(batches.len(), 10);
    assert!(batches.iter().all(|b| b.interval_ms == 30_000 && b.len() == 1));
    assert!(ctx.store().is_empty());
}

#[test]
fn test_lookup_fanout_blocking() {
    let config = config(
        r#"
apis:
  - name: hosts
    commands:
      - run: "printf 'host\nalpha\nbeta\n'"
        split: horizontal
    store_lookups:
      hosts: host
  - name: ping
    commands:
      - run: "echo 'target: ${lookup:hosts}'"
"#,
    );
    let ctx = CollectorContext::new();

    let summary = tokio_test::block_on(run_config(&config, &Dispatcher::new(), &ctx));

    assert_eq!(summary.failed_units, 0);
    let payload = ctx.take_payload();
    let targets: Vec<_> = payload.data[0]
        .metrics
        .iter()
        .filter(|s| s.event_type == "pingSample")
        .filter_map(|s| s.get_string("target"))
        .collect();
    assert_eq!(targets, vec!["alpha".to_string(), "beta".to_string()]);
}
