//! Fine-tuning run configuration.
//!
//! Serialised as JSON. Every field has a default matching the dialogue
//! summarisation recipe, so a minimal `{}` file produces a working config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{InstructError, Result};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinetuneConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub lora: LoraSettings,
    #[serde(default)]
    pub quantization: QuantizationSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub run: RunConfig,
}

// ── Data ────────────────────────────────────────────────────────────────────

/// How records become tokenized examples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Field holding the instruction / dialogue text.
    #[serde(default = "default_instruction_field")]
    pub instruction_field: String,
    /// Field holding the reference target text.
    #[serde(default = "default_target_field")]
    pub target_field: String,
    /// Optional auxiliary input field. `None` always selects the no-input template.
    #[serde(default)]
    pub source_field: Option<String>,
    #[serde(default = "default_max_source_tokens")]
    pub max_source_tokens_count: usize,
    #[serde(default = "default_max_target_tokens")]
    pub max_target_tokens_count: usize,
    /// Mask prompt positions out of the loss.
    #[serde(default)]
    pub only_target_loss: bool,
    #[serde(default = "default_sample_rate")]
    pub train_sample_rate: f64,
    #[serde(default = "default_sample_rate")]
    pub val_sample_rate: f64,
    #[serde(default = "default_templates_path")]
    pub templates_path: PathBuf,
    #[serde(default)]
    pub model_kind: ModelKind,
    #[serde(default)]
    pub truncation: TruncationSide,
    /// Prepend the tokenizer's BOS id (when it has one) before truncating the prompt.
    #[serde(default = "default_true")]
    pub add_bos: bool,
    #[serde(default)]
    pub special_tokens: SpecialTokensConfig,
}

/// Which model family the examples are built for.
///
/// Resolved once at configuration time; each variant has its own conversion
/// and collation policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Causal,
    Seq2Seq,
}

impl ModelKind {
    /// PEFT task type string for adapter configs.
    pub fn task_type(self) -> &'static str {
        match self {
            Self::Causal => "CAUSAL_LM",
            Self::Seq2Seq => "SEQ_2_SEQ_LM",
        }
    }
}

/// Which end of an over-long prompt is cut.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationSide {
    /// Drop tokens from the end, keeping the beginning of the prompt.
    #[default]
    Right,
    /// Drop tokens from the start, keeping the end of the prompt.
    Left,
}

impl TruncationSide {
    /// Truncate `ids` in place to at most `max_len` tokens.
    pub fn truncate(self, ids: &mut Vec<u32>, max_len: usize) {
        if ids.len() <= max_len {
            return;
        }
        match self {
            Self::Right => ids.truncate(max_len),
            Self::Left => {
                ids.drain(..ids.len() - max_len);
            }
        }
    }
}

/// Special token strings resolved against the tokenizer vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialTokensConfig {
    #[serde(default = "default_bos_token")]
    pub bos: Option<String>,
    #[serde(default = "default_eos_token")]
    pub eos: String,
    #[serde(default)]
    pub pad: Option<String>,
}

// ── LoRA / quantisation ─────────────────────────────────────────────────────

/// Low-rank adapter hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraSettings {
    #[serde(default = "default_lora_r")]
    pub r: usize,
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: usize,
    #[serde(default = "default_lora_dropout")]
    pub lora_dropout: f64,
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
    #[serde(default = "default_lora_bias")]
    pub bias: String,
}

/// Precision the frozen base model is loaded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Full,
    Int8,
    #[default]
    Nf4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizationSettings {
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_true")]
    pub double_quant: bool,
    #[serde(default = "default_int8_threshold")]
    pub llm_int8_threshold: f64,
    #[serde(default)]
    pub llm_int8_has_fp16_weight: bool,
}

// ── Training ────────────────────────────────────────────────────────────────

/// Trainer knobs forwarded to the external trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    #[serde(default = "default_micro_batch")]
    pub micro_batch_size: usize,
    /// Effective batch size; gradient accumulation is derived from it.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    #[serde(default = "default_scheduler")]
    pub lr_scheduler_type: String,
    #[serde(default = "default_true")]
    pub fp16: bool,
    #[serde(default)]
    pub bf16: bool,
    #[serde(default = "default_every")]
    pub logging_steps: usize,
    #[serde(default = "default_every")]
    pub eval_steps: usize,
    #[serde(default = "default_every")]
    pub save_steps: usize,
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: usize,
    #[serde(default = "default_optim")]
    pub optim: String,
    #[serde(default = "default_pad_multiple")]
    pub pad_to_multiple_of: usize,
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,
}

/// Process-wide settings that would otherwise live in environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Let the tokenizer parallelise internally.
    #[serde(default)]
    pub tokenizer_parallelism: bool,
    /// Experiment trackers to report to; empty disables tracking.
    #[serde(default)]
    pub report_to: Vec<String>,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_instruction_field() -> String {
    "dialogue".to_string()
}
fn default_target_field() -> String {
    "summary".to_string()
}
fn default_max_source_tokens() -> usize {
    255
}
fn default_max_target_tokens() -> usize {
    50
}
fn default_sample_rate() -> f64 {
    1.0
}
fn default_templates_path() -> PathBuf {
    PathBuf::from("templates.json")
}
fn default_true() -> bool {
    true
}
fn default_bos_token() -> Option<String> {
    Some("<s>".to_string())
}
fn default_eos_token() -> String {
    "</s>".to_string()
}
fn default_lora_r() -> usize {
    8
}
fn default_lora_alpha() -> usize {
    32
}
fn default_lora_dropout() -> f64 {
    0.1
}
fn default_target_modules() -> Vec<String> {
    vec!["q_proj".to_string(), "v_proj".to_string()]
}
fn default_lora_bias() -> String {
    "none".to_string()
}
fn default_int8_threshold() -> f64 {
    6.0
}
fn default_micro_batch() -> usize {
    4
}
fn default_batch_size() -> usize {
    128
}
fn default_max_steps() -> usize {
    350
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_warmup_ratio() -> f64 {
    0.06
}
fn default_scheduler() -> String {
    "cosine".to_string()
}
fn default_every() -> usize {
    50
}
fn default_save_total_limit() -> usize {
    2
}
fn default_optim() -> String {
    "adamw_torch".to_string()
}
fn default_pad_multiple() -> usize {
    8
}
fn default_num_beams() -> usize {
    5
}
fn default_seed() -> u64 {
    42
}

// ── Default impls ───────────────────────────────────────────────────────────

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            instruction_field: default_instruction_field(),
            target_field: default_target_field(),
            source_field: None,
            max_source_tokens_count: default_max_source_tokens(),
            max_target_tokens_count: default_max_target_tokens(),
            only_target_loss: false,
            train_sample_rate: 1.0,
            val_sample_rate: 1.0,
            templates_path: default_templates_path(),
            model_kind: ModelKind::Causal,
            truncation: TruncationSide::Right,
            add_bos: true,
            special_tokens: SpecialTokensConfig::default(),
        }
    }
}

impl Default for SpecialTokensConfig {
    fn default() -> Self {
        Self {
            bos: default_bos_token(),
            eos: default_eos_token(),
            pad: None,
        }
    }
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: 8,
            lora_alpha: 32,
            lora_dropout: 0.1,
            target_modules: default_target_modules(),
            bias: default_lora_bias(),
        }
    }
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            precision: Precision::Nf4,
            double_quant: true,
            llm_int8_threshold: 6.0,
            llm_int8_has_fp16_weight: false,
        }
    }
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            micro_batch_size: 4,
            batch_size: 128,
            max_steps: 350,
            learning_rate: 1e-3,
            warmup_ratio: 0.06,
            lr_scheduler_type: default_scheduler(),
            fp16: true,
            bf16: false,
            logging_steps: 50,
            eval_steps: 50,
            save_steps: 50,
            save_total_limit: 2,
            optim: default_optim(),
            pad_to_multiple_of: 8,
            num_beams: 5,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tokenizer_parallelism: false,
            report_to: Vec::new(),
        }
    }
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl DataConfig {
    /// Reject budgets and sampling rates that can never produce a sane dataset.
    pub fn validate(&self) -> Result<()> {
        if self.max_source_tokens_count == 0 {
            return Err(InstructError::Config(
                "max_source_tokens_count must be positive".into(),
            ));
        }
        if self.max_target_tokens_count == 0 {
            return Err(InstructError::Config(
                "max_target_tokens_count must be positive".into(),
            ));
        }
        validate_sample_rate(self.train_sample_rate)?;
        validate_sample_rate(self.val_sample_rate)?;
        if self.instruction_field.is_empty() || self.target_field.is_empty() {
            return Err(InstructError::Config(
                "instruction_field and target_field must be non-empty".into(),
            ));
        }
        Ok(())
    }

    /// Upper bound on a causal example's length: prompt + target + terminator.
    pub fn max_tokens_count(&self) -> usize {
        self.max_source_tokens_count + self.max_target_tokens_count + 1
    }

    /// Source field, treating an empty name as "not configured".
    pub fn source_field(&self) -> Option<&str> {
        self.source_field.as_deref().filter(|f| !f.is_empty())
    }
}

/// Sampling rates are probabilities.
pub fn validate_sample_rate(rate: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(InstructError::Config(format!(
            "sample rate {rate} is outside [0, 1]"
        )));
    }
    Ok(())
}

impl FinetuneConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        let t = &self.training;
        if t.micro_batch_size == 0 || t.micro_batch_size > t.batch_size {
            return Err(InstructError::Config(format!(
                "micro_batch_size ({}) must be in 1..={}",
                t.micro_batch_size, t.batch_size
            )));
        }
        if t.fp16 && t.bf16 {
            return Err(InstructError::Config(
                "fp16 and bf16 are mutually exclusive".into(),
            ));
        }
        if t.pad_to_multiple_of == 0 {
            return Err(InstructError::Config("pad_to_multiple_of must be positive".into()));
        }
        let l = &self.lora;
        if l.r == 0 || l.lora_alpha == 0 {
            return Err(InstructError::Config("LoRA r and alpha must be positive".into()));
        }
        if !(0.0..1.0).contains(&l.lora_dropout) {
            return Err(InstructError::Config(format!(
                "lora_dropout {} is outside [0, 1)",
                l.lora_dropout
            )));
        }
        if l.target_modules.is_empty() {
            return Err(InstructError::Config("target_modules must not be empty".into()));
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
