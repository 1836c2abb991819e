//! Transform Engine - compiled per-API sample pipeline
//!
//! A [`Pipeline`] is built once per API definition and then applied to every
//! fetched unit of that API. Stages always run in this order:
//!
//! 1. strip keys
//! 2. rename samples
//! 3. rename / replace keys
//! 4. key shaping (`to_lower`, `convert_space`, `snake_to_camel`)
//! 5. value shaping (`perc_to_decimal`, `pluck_numbers`, `value_parser`,
//!    `value_transformer`)
//! 6. sub-parse
//! 7. math
//! 8. sample filters
//! 9. keep keys, then remove keys
//! 10. prefix, then custom attributes
//!
//! Keys matched by `skip_processing` pass through stages 4 to 7 untouched.

use crate::config::{Api, Config, StringMap};
use crate::error::StageError;

use super::rules::{
    Decorate, KeepRemoveKeys, KeyMatcher, KeyShaping, MathStage, RenameKeys, RenameSamples,
    SampleFilter, Stage, StageEnv, StripKeys, SubParseStage, ValueShaping, Verdict,
};
use super::sample::{Attributes, Sample};

/// Result of running the pipeline over one fetched unit
#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// Surviving samples in processing order
    pub samples: Vec<Sample>,
    /// Samples dropped by filters
    pub dropped: u64,
}

/// Compiled transform pipeline of one API
#[derive(Debug)]
pub struct Pipeline {
    api_name: String,
    stages: Vec<Box<dyn Stage>>,
    skip: KeyMatcher,
}

impl Pipeline {
    /// Compile the directives of an API
    ///
    /// # Errors
    /// Returns a `StageError` for the first invalid regex, expression or
    /// directive. The error is fatal to this API only.
    pub fn compile(config: &Config, api: &Api) -> Result<Self, StageError> {
        let mut stages: Vec<Box<dyn Stage>> = Vec::new();

        fn push<S: Stage + 'static>(stages: &mut Vec<Box<dyn Stage>>, stage: Option<S>) {
            if let Some(stage) = stage {
                stages.push(Box::new(stage));
            }
        }

        push(&mut stages, StripKeys::new(&api.strip_keys));
        push(&mut stages, RenameSamples::compile(&api.rename_samples)?);
        push(
            &mut stages,
            RenameKeys::compile(&api.rename_keys, &api.replace_keys)?,
        );
        push(
            &mut stages,
            KeyShaping::new(api.to_lower, &api.convert_space, api.snake_to_camel),
        );
        push(
            &mut stages,
            ValueShaping::compile(
                api.perc_to_decimal,
                api.pluck_numbers,
                &api.value_parser,
                &api.value_transformer,
            )?,
        );
        push(&mut stages, SubParseStage::compile(&api.sub_parse)?);
        push(&mut stages, MathStage::compile(&api.math)?);
        push(
            &mut stages,
            SampleFilter::compile(&api.sample_filter, &api.sample_include_filter)?,
        );
        push(
            &mut stages,
            KeepRemoveKeys::compile(&api.keep_keys, &api.remove_keys)?,
        );
        stages.push(Box::new(Decorate::new(
            &api.prefix,
            &config.custom_attributes,
            &api.custom_attributes,
        )));

        let skip = KeyMatcher::compile("skip_processing", &api.skip_processing)?;

        tracing::debug!(
            api = %api.name,
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Pipeline compiled"
        );

        Ok(Self {
            api_name: api.name.clone(),
            stages,
            skip,
        })
    }

    /// Names of the compiled stages, in execution order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the pipeline over normalized records
    ///
    /// # Arguments
    ///
    /// * `records` - Attribute maps from the normalizer
    /// * `event_type` - Event type assigned to every record
    /// * `unit_attributes` - Custom attributes of the fetched unit
    pub fn run(
        &self,
        records: Vec<Attributes>,
        event_type: &str,
        unit_attributes: &StringMap,
    ) -> PipelineOutput {
        let samples = records
            .into_iter()
            .map(|attrs| Sample::with_attributes(event_type, attrs))
            .collect();
        self.run_samples(samples, unit_attributes)
    }

    /// Run the pipeline over samples that already carry an event type
    pub fn run_samples(&self, samples: Vec<Sample>, unit_attributes: &StringMap) -> PipelineOutput {
        let env = StageEnv {
            skip: &self.skip,
            unit_attributes,
        };

        let mut current = samples;
        let mut dropped = 0;

        for stage in &self.stages {
            let mut next = Vec::with_capacity(current.len());
            for mut sample in current {
                match stage.apply(&mut sample, &env) {
                    Verdict::Keep => next.push(sample),
                    Verdict::Drop => {
                        dropped += 1;
                        tracing::debug!(
                            api = %self.api_name,
                            stage = stage.name(),
                            event_type = %sample.event_type,
                            "Sample dropped"
                        );
                    }
                    Verdict::Expand(children) => {
                        next.push(sample);
                        next.extend(children);
                    }
                }
            }
            current = next;
        }

        // samples left without data keys carry no information
        let before = current.len();
        current.retain(|s| !s.is_empty());
        let emptied = (before - current.len()) as u64;
        if emptied > 0 {
            tracing::debug!(api = %self.api_name, count = emptied, "Emptied samples dropped");
            dropped += emptied;
        }

        PipelineOutput {
            samples: current,
            dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api(yaml: &str) -> (Config, Api) {
        let config = Config::from_yaml_str(yaml).unwrap();
        let api = config.apis[0].clone();
        (config, api)
    }

    fn records(items: Vec<serde_json::Value>) -> Vec<Attributes> {
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_pipeline_only_decorates() {
        let (config, api) = api("apis:\n  - name: plain\n");
        let pipeline = Pipeline::compile(&config, &api).unwrap();
        assert_eq!(pipeline.stage_names(), vec!["decorate"]);

        let out = pipeline.run(
            records(vec![json!({"a": 1})]),
            "plainSample",
            &StringMap::new(),
        );
        assert_eq!(out.samples.len(), 1);
        assert_eq!(out.samples[0].event_type, "plainSample");
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn test_stage_order() {
        let (config, api) = api(
            r#"
apis:
  - name: full
    strip_keys: [junk]
    rename_samples: {"^db": dbSample}
    rename_keys: {Used: used}
    to_lower: true
    pluck_numbers: true
    sub_parse:
      - type: match
        key: opts
        split_by: [",", "="]
    math: {double: "${x} * 2"}
    sample_filter:
      - {status: "^5"}
    keep_keys: [".*"]
    remove_keys: [junk2]
    prefix: "p."
"#,
        );
        let pipeline = Pipeline::compile(&config, &api).unwrap();
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "strip_keys",
                "rename_samples",
                "rename_keys",
                "key_shaping",
                "value_shaping",
                "sub_parse",
                "math",
                "sample_filter",
                "keep_remove_keys",
                "decorate",
            ]
        );
    }

    #[test]
    fn test_filter_drops_are_counted() {
        let (config, api) = api(
            r#"
apis:
  - name: web
    sample_filter:
      - status: "^5\\d\\d$"
"#,
        );
        let pipeline = Pipeline::compile(&config, &api).unwrap();
        let out = pipeline.run(
            records(vec![
                json!({"status": 200}),
                json!({"status": 404}),
                json!({"status": 500}),
            ]),
            "webSample",
            &StringMap::new(),
        );
        assert_eq!(out.samples.len(), 2);
        assert_eq!(out.dropped, 1);
        assert!(out
            .samples
            .iter()
            .all(|s| s.get("status") != Some(&json!(500))));
    }

    #[test]
    fn test_emptied_samples_are_counted() {
        let (config, api) = api("apis:\n  - name: narrow\n    keep_keys: [\"^zzz\"]\n");
        let pipeline = Pipeline::compile(&config, &api).unwrap();
        let out = pipeline.run(
            records(vec![json!({"a": 1, "b": 2})]),
            "narrowSample",
            &StringMap::new(),
        );
        assert!(out.samples.is_empty());
        assert_eq!(out.dropped, 1);
    }

    #[test]
    fn test_skip_processing_exempts_keys() {
        let (config, api) = api(
            r#"
apis:
  - name: s
    to_lower: true
    perc_to_decimal: true
    skip_processing: ["^Raw"]
"#,
        );
        let pipeline = Pipeline::compile(&config, &api).unwrap();
        let out = pipeline.run(
            records(vec![json!({"RawPct": "50%", "CpuPct": "20%"})]),
            "sSample",
            &StringMap::new(),
        );
        let s = &out.samples[0];
        assert_eq!(s.get("RawPct"), Some(&json!("50%")));
        assert_eq!(s.get("cpupct"), Some(&json!(20)));
    }

    #[test]
    fn test_invalid_regex_fails_compile() {
        let (config, api) = api("apis:\n  - name: bad\n    keep_keys: [\"(\"]\n");
        let err = Pipeline::compile(&config, &api).unwrap_err();
        assert!(matches!(err, StageError::InvalidPattern { directive: "keep_keys", .. }));
    }

    #[test]
    fn test_custom_attributes_layering() {
        let (config, api) = api(
            r#"
custom_attributes: {env: dev, region: eu}
apis:
  - name: c
    custom_attributes: {env: staging}
"#,
        );
        let pipeline = Pipeline::compile(&config, &api).unwrap();
        let unit: StringMap = [("region", "us")].into_iter().collect();
        let out = pipeline.run(records(vec![json!({"v": 1})]), "cSample", &unit);
        let s = &out.samples[0];
        assert_eq!(s.get("env"), Some(&json!("staging")));
        assert_eq!(s.get("region"), Some(&json!("us")));
    }
}
