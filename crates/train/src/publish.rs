//! Adapter publishing.

use std::path::{Component, Path, PathBuf};

use instruct_common::error::{InstructError, Result};

use crate::backend::ADAPTER_CONFIG_FILE;
use crate::plan::AdapterConfig;

const MODEL_CARD_FILE: &str = "README.md";

/// Pushes a trained adapter somewhere others can fetch it.
pub trait AdapterPublisher {
    /// Publish the adapter in `adapter_dir` under `repo_name`; returns its location.
    fn publish(&self, adapter_dir: &Path, repo_name: &str) -> Result<PathBuf>;
}

/// Stages adapters into `<root>/<repo_name>/` with a generated model card.
///
/// Only adapter files (`adapter_*`) are copied; checkpoints and datasets stay behind.
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AdapterPublisher for DirectoryPublisher {
    fn publish(&self, adapter_dir: &Path, repo_name: &str) -> Result<PathBuf> {
        validate_repo_name(repo_name)?;
        let config_path = adapter_dir.join(ADAPTER_CONFIG_FILE);
        if !config_path.is_file() {
            return Err(InstructError::Config(format!(
                "{} has no {ADAPTER_CONFIG_FILE}",
                adapter_dir.display()
            )));
        }
        let adapter = AdapterConfig::load(&config_path)?;

        let dest = self.root.join(repo_name);
        std::fs::create_dir_all(&dest)?;
        let mut copied = 0usize;
        for entry in std::fs::read_dir(adapter_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name() else {
                continue;
            };
            if path.is_file() && name.to_str().is_some_and(|n| n.starts_with("adapter_")) {
                std::fs::copy(&path, dest.join(name))?;
                copied += 1;
            }
        }
        std::fs::write(dest.join(MODEL_CARD_FILE), model_card(repo_name, &adapter))?;

        tracing::info!(repo = repo_name, dest = %dest.display(), files = copied, "adapter published");
        Ok(dest)
    }
}

/// `name` or `owner/name`; no absolute paths or parent components.
fn validate_repo_name(repo_name: &str) -> Result<()> {
    let path = Path::new(repo_name);
    let ok = !repo_name.trim().is_empty()
        && path.components().count() <= 2
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(InstructError::Config(format!(
            "invalid repository name {repo_name:?}"
        )));
    }
    Ok(())
}

fn model_card(repo_name: &str, adapter: &AdapterConfig) -> String {
    format!(
        r#"---
library_name: peft
base_model: {base}
---

# {repo_name}

LoRA adapter ({task}) for `{base}`.

| setting | value |
|---|---|
| r | {r} |
| lora_alpha | {alpha} |
| lora_dropout | {dropout} |
| target_modules | {modules} |
| bias | {bias} |
"#,
        base = adapter.base_model_name_or_path,
        task = adapter.task_type,
        r = adapter.r,
        alpha = adapter.lora_alpha,
        dropout = adapter.lora_dropout,
        modules = adapter.target_modules.join(", "),
        bias = adapter.bias,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::TrainingPlan;
    use instruct_common::config::FinetuneConfig;
    use instruct_common::run::DistributedContext;

    fn adapter_dir(root: &Path) -> PathBuf {
        let dir = root.join("run");
        std::fs::create_dir_all(dir.join("checkpoint-50")).unwrap();
        let plan = TrainingPlan::resolve(
            &FinetuneConfig::default(),
            "base-7b",
            &dir,
            &DistributedContext::single(),
        )
        .unwrap();
        plan.adapter.save(&dir.join(ADAPTER_CONFIG_FILE)).unwrap();
        std::fs::write(dir.join("adapter_model.safetensors"), b"weights").unwrap();
        std::fs::write(dir.join("train.iex"), b"data").unwrap();
        dir
    }

    #[test]
    fn stages_adapter_files_and_model_card() {
        let tmp = tempfile::tempdir().unwrap();
        let src = adapter_dir(tmp.path());
        let publisher = DirectoryPublisher::new(tmp.path().join("hub"));
        let dest = publisher.publish(&src, "me/samsum-lora").unwrap();

        assert!(dest.join(ADAPTER_CONFIG_FILE).is_file());
        assert!(dest.join("adapter_model.safetensors").is_file());
        assert!(!dest.join("train.iex").exists());
        assert!(!dest.join("checkpoint-50").exists());
        let card = std::fs::read_to_string(dest.join(MODEL_CARD_FILE)).unwrap();
        assert!(card.contains("base_model: base-7b"));
        assert!(card.starts_with("---\nlibrary_name: peft\nbase_model: base-7b\n---\n"));
        assert!(card.contains("# me/samsum-lora\n"));
        assert!(card.contains("LoRA adapter (CAUSAL_LM) for `base-7b`."));
        assert!(card.contains("| target_modules | q_proj, v_proj |"));
        assert!(card.contains("| r | 8 |"));
    }

    #[test]
    fn rejects_escaping_repo_names() {
        let tmp = tempfile::tempdir().unwrap();
        let src = adapter_dir(tmp.path());
        let publisher = DirectoryPublisher::new(tmp.path().join("hub"));
        for bad in ["", "../up", "/abs", "a/b/c"] {
            assert!(publisher.publish(&src, bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn requires_adapter_config() {
        let tmp = tempfile::tempdir().unwrap();
        let publisher = DirectoryPublisher::new(tmp.path().join("hub"));
        assert!(matches!(
            publisher.publish(tmp.path(), "repo"),
            Err(InstructError::Config(_))
        ));
    }
}
