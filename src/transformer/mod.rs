//! Sample transformation module
//!
//! Turns raw source output into samples: normalization of text and JSON,
//! the compiled directive pipeline, merging and Prometheus text support.

pub mod engine;
pub mod flatten;
pub mod formatter;
pub mod math;
pub mod merger;
pub mod normalizer;
pub mod prometheus;
pub mod rules;
pub mod sample;

pub use engine::{Pipeline, PipelineOutput};
pub use flatten::{flatten_document, flatten_with_sample_keys, FlattenOptions, Flattened};
pub use formatter::{IntegrationPayload, PayloadFormatter};
pub use merger::{apply_merge, SampleMerger};
pub use normalizer::{SplitOptions, TextSplitter};
pub use prometheus::Exposition;
pub use sample::{Attributes, Sample};
