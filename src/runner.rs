//! Harvest cycle driver
//!
//! One harvest cycle runs every config once. Configs run concurrently on a
//! bounded pool; the APIs of one config run in declaration order so that
//! scratch-store writes are visible to later APIs of the same config.
//!
//! Per fetched unit:
//!
//! 1. normalize (text split, JSON flatten or Prometheus parse)
//! 2. transform pipeline
//! 3. `merge` reassignment
//! 4. metric parser
//! 5. emission: events, or one dimensional batch with `metric_api`
//!
//! Samples claimed by a `sample_merge` rule are held back and emitted once
//! the whole config has run, through the metric parser and emission settings
//! of the first API that fed the rule.
//!
//! A config with a `lookup_file` runs once per row of that file.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::collector::{Dispatcher, FetchedUnit, RawOutput, SourceKind};
use crate::config::{Api, Config};
use crate::context::{CollectorContext, ScratchStores};
use crate::error::{AppResult, StageError};
use crate::metric_parser::{MetricParser, ParsedSample};
use crate::metrics::{now_ms, CONFIGS_PROCESSED};
use crate::transformer::{
    apply_merge, flatten_with_sample_keys, Exposition, FlattenOptions, Flattened, Pipeline,
    PipelineOutput, Sample, SampleMerger, TextSplitter,
};

/// Configs processed at the same time when nothing else is configured
pub const DEFAULT_CONFIG_CONCURRENCY: usize = 8;

/// Outcome of one harvest cycle, or of one config within it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestSummary {
    pub configs: usize,
    pub apis: usize,
    /// APIs skipped because a directive failed to compile
    pub failed_apis: usize,
    pub units: usize,
    pub failed_units: usize,
    /// Samples emitted as events
    pub events: usize,
    /// Samples emitted in metric batches
    pub metric_samples: usize,
}

impl HarvestSummary {
    fn absorb(&mut self, other: HarvestSummary) {
        self.configs += other.configs;
        self.apis += other.apis;
        self.failed_apis += other.failed_apis;
        self.units += other.units;
        self.failed_units += other.failed_units;
        self.events += other.events;
        self.metric_samples += other.metric_samples;
    }
}

/// Turn a fetched unit into transformed samples
///
/// # Errors
/// Returns a `StageError` when the unit's split options do not compile
pub fn normalize(
    unit: FetchedUnit,
    api: &Api,
    pipeline: &Pipeline,
    default_event_type: &str,
) -> Result<PipelineOutput, StageError> {
    let event_type = unit.event_type.as_deref().unwrap_or(default_event_type);

    match unit.output {
        RawOutput::Json(document) => {
            let opts = FlattenOptions {
                start_key: &api.start_key,
                split_objects: api.split_objects,
                lazy_flatten: &api.lazy_flatten,
                disable_parent_attr: api.disable_parent_attr,
                strip_keys: &api.strip_keys,
                sample_keys: &api.sample_keys.0,
            };
            let Flattened { records, keyed } = flatten_with_sample_keys(document, &opts);
            let samples = records
                .into_iter()
                .map(|attrs| Sample::with_attributes(event_type, attrs))
                .chain(
                    keyed
                        .into_iter()
                        .map(|(keyed_type, attrs)| Sample::with_attributes(keyed_type, attrs)),
                )
                .collect();
            Ok(pipeline.run_samples(samples, &unit.custom_attributes))
        }
        RawOutput::Text(text) => {
            let records = TextSplitter::compile(unit.split)?.split(&text);
            Ok(pipeline.run(records, event_type, &unit.custom_attributes))
        }
        RawOutput::Prometheus(text) => {
            let samples = Exposition::parse(&text).into_samples(&api.prometheus, event_type);
            Ok(pipeline.run_samples(samples, &unit.custom_attributes))
        }
    }
}

/// Compile every API of every config without fetching anything
///
/// Returns the number of APIs checked.
///
/// # Errors
/// The first invalid directive or API without a source selector
pub fn validate(configs: &[Config]) -> AppResult<usize> {
    let mut apis = 0;
    for config in configs {
        for api in &config.apis {
            SourceKind::select(api)?;
            Pipeline::compile(config, api)?;
            MetricParser::from_api(api)?;
            apis += 1;
        }
    }
    Ok(apis)
}

/// Run every API of one config, once per `lookup_file` row when set
#[instrument(skip_all, fields(config = %config.name))]
pub async fn run_config(
    config: &Config,
    dispatcher: &Dispatcher,
    ctx: &CollectorContext,
) -> HarvestSummary {
    let expanded = match config.expand_lookup_file() {
        Ok(expanded) => expanded,
        Err(e) => {
            error!(error = %e, "Skipping config");
            ctx.counters().increment(CONFIGS_PROCESSED);
            return HarvestSummary {
                configs: 1,
                ..Default::default()
            };
        }
    };

    let mut summary = HarvestSummary::default();
    for config in &expanded {
        summary.absorb(run_expanded(config, dispatcher, ctx).await);
    }
    summary.configs = 1;
    ctx.counters().increment(CONFIGS_PROCESSED);
    summary
}

/// API whose parser and emission settings apply to a merged sample
struct MergeOwner<'a> {
    event_type: String,
    api: &'a Api,
    parser: Option<MetricParser>,
}

async fn run_expanded(
    config: &Config,
    dispatcher: &Dispatcher,
    ctx: &CollectorContext,
) -> HarvestSummary {
    let mut summary = HarvestSummary::default();
    let mut stores = ScratchStores::from_config(config);
    let merger = SampleMerger::new(&config.sample_merge);
    let mut held_back: Vec<Sample> = Vec::new();
    let mut owners: Vec<MergeOwner<'_>> = Vec::new();

    for api in &config.apis {
        summary.apis += 1;

        let compiled = Pipeline::compile(config, api)
            .and_then(|pipeline| MetricParser::from_api(api).map(|parser| (pipeline, parser)));
        let (pipeline, parser) = match compiled {
            Ok(compiled) => compiled,
            Err(e) => {
                error!(api = %api.name, error = %e, "Skipping API with invalid directives");
                summary.failed_apis += 1;
                continue;
            }
        };
        let event_type = api.resolved_event_type();

        let units = dispatcher.fetch(&config.global, api, &stores).await;
        let mut produced: Vec<Sample> = Vec::new();

        for result in units {
            summary.units += 1;
            let unit = match result {
                Ok(unit) => unit,
                Err(e) => {
                    warn!(
                        api = %api.name,
                        error = %e,
                        retryable = e.is_retryable(),
                        http_status = ?e.http_status(),
                        "Fetch failed"
                    );
                    summary.failed_units += 1;
                    ctx.record_drops(1);
                    continue;
                }
            };

            let unit_name = unit.name.clone();
            let PipelineOutput { mut samples, dropped } =
                match normalize(unit, api, &pipeline, &event_type) {
                    Ok(output) => output,
                    Err(e) => {
                        error!(api = %api.name, command = %unit_name, error = %e, "Invalid split options");
                        summary.failed_units += 1;
                        ctx.record_drops(1);
                        continue;
                    }
                };
            ctx.record_drops(dropped);
            apply_merge(&mut samples, &api.merge);
            produced.extend(samples.iter().cloned());

            let (claimed, direct): (Vec<Sample>, Vec<Sample>) = if merger.is_empty() {
                (Vec::new(), samples)
            } else {
                samples
                    .into_iter()
                    .partition(|s| merger.claims(&s.event_type))
            };
            for sample in &claimed {
                if let Some(target) = merger.target_of(&sample.event_type) {
                    if !owners.iter().any(|o| o.event_type == target) {
                        owners.push(MergeOwner {
                            event_type: target.to_string(),
                            api,
                            parser: parser.clone(),
                        });
                    }
                }
            }
            held_back.extend(claimed);

            let parsed: Vec<ParsedSample> = match &parser {
                Some(parser) => {
                    let now = now_ms();
                    direct
                        .into_iter()
                        .map(|s| parser.apply(s, ctx.namespaces(), ctx.summaries(), now))
                        .collect()
                }
                None => direct.into_iter().map(ParsedSample::from).collect(),
            };
            debug!(api = %api.name, command = %unit_name, samples = parsed.len(), "Unit processed");

            if config.metric_api {
                summary.metric_samples += ctx.emit_metrics(parsed);
            } else {
                let samples = parsed.into_iter().map(|p| p.sample).collect();
                summary.events += ctx.emit_events(samples, api);
            }
        }

        stores.record(api, &produced);
    }

    let mut merged_metrics = Vec::new();
    for sample in merger.merge(held_back) {
        let Some(owner) = owners.iter().find(|o| o.event_type == sample.event_type) else {
            continue;
        };
        let parsed = match &owner.parser {
            Some(parser) => parser.apply(sample, ctx.namespaces(), ctx.summaries(), now_ms()),
            None => ParsedSample::from(sample),
        };
        if config.metric_api {
            merged_metrics.push(parsed);
        } else {
            summary.events += ctx.emit_events(vec![parsed.sample], owner.api);
        }
    }
    if !merged_metrics.is_empty() {
        summary.metric_samples += ctx.emit_metrics(merged_metrics);
    }

    summary
}

/// Harvest cycle runner
#[derive(Debug, Clone)]
pub struct Runner {
    dispatcher: Dispatcher,
    concurrency: usize,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            concurrency: DEFAULT_CONFIG_CONCURRENCY,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Maximum configs processed at once (at least 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one harvest cycle over all configs
    ///
    /// Summaries accumulated during the cycle are flushed into the metrics
    /// store at the end.
    #[instrument(skip_all, fields(configs = configs.len()))]
    pub async fn harvest(&self, configs: &[Config], ctx: &Arc<CollectorContext>) -> HarvestSummary {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for config in configs.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let dispatcher = self.dispatcher.clone();
            let ctx = Arc::clone(ctx);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_config(&config, &dispatcher, &ctx).await
            });
        }

        let mut summary = HarvestSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(config_summary) => summary.absorb(config_summary),
                Err(e) => error!(error = %e, "Config task failed"),
            }
        }

        ctx.flush_summaries();

        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            apis = summary.apis,
            units = summary.units,
            failed_units = summary.failed_units,
            events = summary.events,
            metric_samples = summary.metric_samples,
            "Harvest cycle complete"
        );
        summary
    }
}
