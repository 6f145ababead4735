//! Trainer seam.
//!
//! Optimisation happens outside this workspace. A [`TrainerBackend`] receives
//! a fully prepared [`FinetuneJob`]; [`HandoffBackend`] materialises it on
//! disk for an external trainer process.

use std::path::{Path, PathBuf};

use serde::Serialize;

use instruct_common::config::ModelKind;
use instruct_common::data::{write_examples_file, ExampleSource};
use instruct_common::error::Result;
use instruct_common::run::DistributedContext;
use instruct_core::collator::Collator;

use crate::plan::TrainingPlan;

pub const TRAIN_FILE: &str = "train.iex";
pub const VAL_FILE: &str = "val.iex";
pub const PLAN_FILE: &str = "training_plan.json";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const MANIFEST_FILE: &str = "handoff.json";

/// Where training starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    Fresh,
    Checkpoint { step: u64, path: PathBuf },
}

impl ResumeFrom {
    pub fn checkpoint_path(&self) -> Option<&Path> {
        match self {
            Self::Fresh => None,
            Self::Checkpoint { path, .. } => Some(path),
        }
    }
}

/// Pick the `checkpoint-N` entry with the highest `N` in `output_dir`.
///
/// A missing or empty directory starts fresh. Entries that do not parse as
/// checkpoints are ignored.
pub fn detect_resume(output_dir: &Path) -> Result<ResumeFrom> {
    if !output_dir.is_dir() {
        return Ok(ResumeFrom::Fresh);
    }
    let mut latest: Option<(u64, PathBuf)> = None;
    let mut other_entries = 0usize;
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("checkpoint-"))
            .and_then(|n| n.parse::<u64>().ok());
        match step {
            Some(step) if latest.as_ref().map(|(s, _)| step > *s).unwrap_or(true) => {
                latest = Some((step, path));
            }
            Some(_) => {}
            None => other_entries += 1,
        }
    }
    Ok(match latest {
        Some((step, path)) => {
            tracing::info!(step, path = %path.display(), "resuming from checkpoint");
            ResumeFrom::Checkpoint { step, path }
        }
        None => {
            if other_entries > 0 {
                tracing::warn!(
                    dir = %output_dir.display(),
                    entries = other_entries,
                    "output directory is not empty but holds no checkpoints; starting fresh"
                );
            }
            ResumeFrom::Fresh
        }
    })
}

/// Everything a trainer needs for one run.
pub struct FinetuneJob<'a> {
    pub plan: &'a TrainingPlan,
    pub train: &'a dyn ExampleSource,
    pub val: &'a dyn ExampleSource,
    pub collator: Collator,
    pub resume: ResumeFrom,
}

/// What a finished backend leaves behind.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Directory holding `adapter_config.json` (and weights, once trained).
    pub adapter_dir: PathBuf,
    pub artifacts: Vec<PathBuf>,
    /// False when optimisation still has to run elsewhere.
    pub trained: bool,
}

/// Runs (or schedules) optimisation for a prepared job.
pub trait TrainerBackend {
    fn name(&self) -> &str;

    fn train(&self, job: &FinetuneJob<'_>) -> Result<TrainOutcome>;
}

#[derive(Serialize)]
struct HandoffManifest<'a> {
    train_file: &'a str,
    val_file: &'a str,
    train_examples: usize,
    val_examples: usize,
    collator: CollatorManifest,
    resume_from_checkpoint: Option<&'a Path>,
}

#[derive(Serialize)]
struct CollatorManifest {
    kind: ModelKind,
    pad_token_id: u32,
    pad_to_multiple_of: usize,
}

/// Writes datasets, plan and adapter config for an external trainer.
///
/// Only the main process writes; other ranks return the same outcome.
pub struct HandoffBackend {
    dist: DistributedContext,
}

impl HandoffBackend {
    pub fn new(dist: DistributedContext) -> Self {
        Self { dist }
    }
}

impl TrainerBackend for HandoffBackend {
    fn name(&self) -> &str {
        "handoff"
    }

    fn train(&self, job: &FinetuneJob<'_>) -> Result<TrainOutcome> {
        let out = &job.plan.training_args.output_dir;
        let artifacts: Vec<PathBuf> = [TRAIN_FILE, VAL_FILE, PLAN_FILE, ADAPTER_CONFIG_FILE, MANIFEST_FILE]
            .iter()
            .map(|f| out.join(f))
            .collect();
        let outcome = TrainOutcome {
            adapter_dir: out.clone(),
            artifacts,
            trained: false,
        };
        if !self.dist.is_main_process() {
            tracing::debug!(rank = self.dist.rank, "skipping hand-off on non-main rank");
            return Ok(outcome);
        }

        std::fs::create_dir_all(out)?;
        let kind = job.collator.kind();
        write_examples_file(&out.join(TRAIN_FILE), kind, job.train)?;
        write_examples_file(&out.join(VAL_FILE), kind, job.val)?;
        job.plan.save(&out.join(PLAN_FILE))?;
        job.plan.adapter.save(&out.join(ADAPTER_CONFIG_FILE))?;

        let manifest = HandoffManifest {
            train_file: TRAIN_FILE,
            val_file: VAL_FILE,
            train_examples: job.train.len(),
            val_examples: job.val.len(),
            collator: CollatorManifest {
                kind: job.collator.kind(),
                pad_token_id: job.collator.pad_token_id(),
                pad_to_multiple_of: job.collator.pad_to_multiple_of(),
            },
            resume_from_checkpoint: job.resume.checkpoint_path(),
        };
        std::fs::write(
            out.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        tracing::info!(
            dir = %out.display(),
            train = job.train.len(),
            val = job.val.len(),
            "job handed off"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instruct_common::config::FinetuneConfig;
    use instruct_common::data::{MmapExamples, TokenizedExample};

    #[test]
    fn missing_or_empty_dir_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_resume(&dir.path().join("nope")).unwrap(), ResumeFrom::Fresh);
        assert_eq!(detect_resume(dir.path()).unwrap(), ResumeFrom::Fresh);
    }

    #[test]
    fn highest_checkpoint_wins() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["checkpoint-50", "checkpoint-300", "checkpoint-100", "checkpoint-x", "runs"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        match detect_resume(dir.path()).unwrap() {
            ResumeFrom::Checkpoint { step, path } => {
                assert_eq!(step, 300);
                assert!(path.ends_with("checkpoint-300"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn handoff_writes_everything_on_main_rank() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run");
        let plan = TrainingPlan::resolve(
            &FinetuneConfig::default(),
            "base",
            &out,
            &DistributedContext::single(),
        )
        .unwrap();
        let train = vec![TokenizedExample {
            input_ids: vec![1, 2],
            attention_mask: vec![1, 1],
            labels: vec![1, 2],
            prompt_len: 1,
        }];
        let val: Vec<TokenizedExample> = Vec::new();
        let job = FinetuneJob {
            plan: &plan,
            train: &train,
            val: &val,
            collator: Collator::new(ModelKind::Causal, 0, 8).unwrap(),
            resume: ResumeFrom::Fresh,
        };

        let outcome = HandoffBackend::new(DistributedContext::single()).train(&job).unwrap();
        assert_eq!(outcome.adapter_dir, out);
        assert!(!outcome.trained);
        for path in &outcome.artifacts {
            assert!(path.exists(), "missing {}", path.display());
        }
        let store = MmapExamples::open(&out.join(TRAIN_FILE)).unwrap();
        assert_eq!(*store.example(0).unwrap(), train[0]);
        assert_eq!(store.kind(), ModelKind::Causal);
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest["collator"]["pad_to_multiple_of"], 8);
        assert_eq!(manifest["collator"]["kind"], "causal");
        assert!(manifest["resume_from_checkpoint"].is_null());
    }

    #[test]
    fn other_ranks_do_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run");
        let dist = DistributedContext {
            rank: 1,
            local_rank: 1,
            world_size: 2,
        };
        let plan = TrainingPlan::resolve(&FinetuneConfig::default(), "base", &out, &dist).unwrap();
        let empty: Vec<TokenizedExample> = Vec::new();
        let job = FinetuneJob {
            plan: &plan,
            train: &empty,
            val: &empty,
            collator: Collator::new(ModelKind::Causal, 0, 8).unwrap(),
            resume: ResumeFrom::Fresh,
        };
        HandoffBackend::new(dist).train(&job).unwrap();
        assert!(!out.exists());
    }
}
