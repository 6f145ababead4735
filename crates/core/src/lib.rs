//! # instruct-core — Example Pipeline
//!
//! Everything between raw records and padded tensors:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`builder`] | `ExampleBuilder`: template → tokens → truncation → labels |
//! | [`dataset`] | `InstructDataset`: seeded sampling + parallel eager build |
//! | [`collator`] | `Collator`, `PaddedBatch`, `BatchTensors` |
//!
//! ## Design principles
//!
//! 1. **Deterministic.** Same records, tokenizer, templates and seed = same examples.
//! 2. **Read-only sharing.** The builder borrows its tokenizer, templates and
//!    config, so one instance serves every rayon worker without locks.

pub mod builder;
pub mod collator;
pub mod dataset;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use builder::ExampleBuilder;
pub use collator::{BatchTensors, Collator, PaddedBatch};
pub use dataset::InstructDataset;
