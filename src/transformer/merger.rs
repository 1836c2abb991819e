//! Sample merger
//!
//! Two kinds of merging:
//!
//! - an API's `merge` reassigns all of its samples to another event type
//! - config-level `sample_merge` rules collapse every sample whose event type
//!   is listed into one sample of the rule's event type
//!
//! When merged samples share an attribute the later one wins. "Later" means
//! the position of its event type in the rule's `samples` list first, then
//! the order in which the samples were produced (API declaration order, then
//! row order).

use crate::config::SampleMerge;

use super::sample::Sample;

/// Reassign samples to `target` when it is set
pub fn apply_merge(samples: &mut [Sample], target: &str) {
    if target.is_empty() {
        return;
    }
    for sample in samples {
        sample.event_type = target.to_string();
    }
}

/// Applies `sample_merge` rules over all samples of a config
#[derive(Debug, Clone, Default)]
pub struct SampleMerger {
    rules: Vec<SampleMerge>,
}

impl SampleMerger {
    pub fn new(rules: &[SampleMerge]) -> Self {
        Self {
            rules: rules
                .iter()
                .filter(|r| !r.event_type.is_empty() && !r.samples.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule collects samples of this event type
    pub fn claims(&self, event_type: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.samples.iter().any(|s| s == event_type))
    }

    /// Event type of the first rule collecting this event type
    pub fn target_of(&self, event_type: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.samples.iter().any(|s| s == event_type))
            .map(|r| r.event_type.as_str())
    }

    /// Merge samples, which must be in production order
    ///
    /// Samples not claimed by any rule are returned unchanged, in order,
    /// followed by one merged sample per rule that claimed at least one.
    pub fn merge(&self, samples: Vec<Sample>) -> Vec<Sample> {
        if self.rules.is_empty() {
            return samples;
        }

        let mut pending: Vec<Option<Sample>> = samples.into_iter().map(Some).collect();
        let mut merged_out = Vec::new();

        for rule in &self.rules {
            let mut merged = Sample::new(rule.event_type.clone());
            let mut claimed = 0usize;

            for event_type in &rule.samples {
                for slot in pending.iter_mut() {
                    let is_member = slot
                        .as_ref()
                        .is_some_and(|s| &s.event_type == event_type);
                    if !is_member {
                        continue;
                    }
                    if let Some(sample) = slot.take() {
                        merged.attributes.extend(sample.attributes);
                        claimed += 1;
                    }
                }
            }

            if claimed > 0 {
                tracing::debug!(
                    event_type = %rule.event_type,
                    merged = claimed,
                    "Samples merged"
                );
                merged_out.push(merged);
            }
        }

        pending.into_iter().flatten().chain(merged_out).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(event_type: &str, pairs: &[(&str, i64)]) -> Sample {
        let mut s = Sample::new(event_type);
        for (k, v) in pairs {
            s.set(*k, *v);
        }
        s
    }

    #[test]
    fn test_apply_merge() {
        let mut samples = vec![sample("aSample", &[("x", 1)]), sample("bSample", &[])];
        apply_merge(&mut samples, "");
        assert_eq!(samples[0].event_type, "aSample");
        apply_merge(&mut samples, "unifiedSample");
        assert!(samples.iter().all(|s| s.event_type == "unifiedSample"));
    }

    #[test]
    fn test_rule_order_decides_collisions() {
        let merger = SampleMerger::new(&[SampleMerge {
            event_type: "hostSample".into(),
            samples: vec!["memSample".into(), "cpuSample".into()],
        }]);
        let out = merger.merge(vec![
            sample("cpuSample", &[("shared", 1), ("cpu", 10)]),
            sample("otherSample", &[("z", 0)]),
            sample("memSample", &[("shared", 2), ("mem", 20)]),
        ]);

        assert!(merger.claims("cpuSample"));
        assert!(!merger.claims("otherSample"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].event_type, "otherSample");
        let merged = &out[1];
        assert_eq!(merged.event_type, "hostSample");
        // cpuSample is listed after memSample, so it wins
        assert_eq!(merged.get("shared"), Some(&json!(1)));
        assert_eq!(merged.get("cpu"), Some(&json!(10)));
        assert_eq!(merged.get("mem"), Some(&json!(20)));
    }

    #[test]
    fn test_row_order_within_event_type() {
        let merger = SampleMerger::new(&[SampleMerge {
            event_type: "allSample".into(),
            samples: vec!["rowSample".into()],
        }]);
        let out = merger.merge(vec![
            sample("rowSample", &[("v", 1)]),
            sample("rowSample", &[("v", 2)]),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("v"), Some(&json!(2)));
    }

    #[test]
    fn test_rule_without_members_emits_nothing() {
        let merger = SampleMerger::new(&[SampleMerge {
            event_type: "ghostSample".into(),
            samples: vec!["missingSample".into()],
        }]);
        let out = merger.merge(vec![sample("aSample", &[("x", 1)])]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, "aSample");
    }
}
