//! # instruct-train — Run Hand-off
//!
//! Turns a validated config plus built datasets into something a trainer can
//! execute, and ships the resulting adapter:
//!
//! * **[`TrainingPlan`]** — trainer arguments, LoRA adapter config, base-model
//!   precision, device map and generation defaults.
//! * **[`TrainerBackend`]** / **[`HandoffBackend`]** — the trainer seam and its
//!   on-disk implementation; [`detect_resume`] finds the latest checkpoint.
//! * **[`AdapterPublisher`]** / **[`DirectoryPublisher`]** — adapter publishing.

pub mod backend;
pub mod plan;
pub mod publish;

pub use backend::{detect_resume, FinetuneJob, HandoffBackend, ResumeFrom, TrainOutcome, TrainerBackend};
pub use plan::{AdapterConfig, DeviceMap, GenerationDefaults, LoadPrecision, TrainingArguments, TrainingPlan};
pub use publish::{AdapterPublisher, DirectoryPublisher};
