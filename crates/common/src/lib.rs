//! # instruct-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`FinetuneConfig`]** — run configuration (serialised as JSON).
//! * **[`TemplateSet`]** — prompt patterns with `{instruction}` / `{input}` slots.
//! * **[`PromptTokenizer`]** / **[`HfTokenizer`]** — the tokenizer seam.
//! * **[`RawRecord`]** / **[`TokenizedExample`]** — data in and out.
//! * **[`MmapExamples`]** — on-disk example store.
//! * **[`RunContext`]** / **[`DistributedContext`]** — per-run process state.

pub mod config;
pub mod data;
pub mod error;
pub mod run;
pub mod template;
pub mod tokenizer;

pub use config::{
    DataConfig, FinetuneConfig, LoraSettings, ModelKind, Precision, QuantizationSettings,
    RunConfig, SpecialTokensConfig, TrainingSettings, TruncationSide,
};
pub use data::{
    load_records, write_examples_file, ExampleSource, MmapExamples, RawRecord, TokenizedExample,
    IGNORE_INDEX,
};
pub use error::{InstructError, Result};
pub use run::{DistributedContext, RunContext};
pub use template::{TemplateSet, TemplateVariant};
pub use tokenizer::{HfTokenizer, PromptTokenizer, SpecialTokenIds};
