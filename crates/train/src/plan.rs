//! Resolved training plan.
//!
//! Everything the external trainer needs besides the data: trainer arguments,
//! the LoRA adapter config, how to load the frozen base model, device
//! placement and generation defaults. Field names follow the conventions of
//! the Python trainer stack so the JSON can be splatted straight into it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, Serializer};

use instruct_common::config::{FinetuneConfig, ModelKind, Precision};
use instruct_common::error::Result;
use instruct_common::run::DistributedContext;

// ── Trainer arguments ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub warmup_ratio: f64,
    pub max_steps: usize,
    pub learning_rate: f64,
    pub lr_scheduler_type: String,
    pub fp16: bool,
    pub bf16: bool,
    pub logging_steps: usize,
    pub evaluation_strategy: String,
    pub logging_strategy: String,
    pub save_strategy: String,
    pub eval_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: usize,
    pub optim: String,
    pub torch_compile: bool,
    pub load_best_model_at_end: bool,
    /// `Some(false)` under data-parallel launch, unset otherwise.
    pub ddp_find_unused_parameters: Option<bool>,
    pub report_to: Vec<String>,
    pub seed: u64,
}

// ── Adapter ─────────────────────────────────────────────────────────────────

/// LoRA adapter config as written to `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub peft_type: String,
    pub task_type: String,
    pub base_model_name_or_path: String,
    pub r: usize,
    pub lora_alpha: usize,
    pub lora_dropout: f64,
    pub target_modules: Vec<String>,
    pub bias: String,
    pub inference_mode: bool,
}

impl AdapterConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ── Base model loading ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorchDtype {
    Float16,
    Bfloat16,
    Float32,
}

/// 4-bit quantisation settings in bitsandbytes field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitsAndBytesConfig {
    pub load_in_4bit: bool,
    pub llm_int8_threshold: f64,
    pub llm_int8_has_fp16_weight: bool,
    pub bnb_4bit_compute_dtype: TorchDtype,
    pub bnb_4bit_use_double_quant: bool,
    pub bnb_4bit_quant_type: String,
}

/// How the frozen base model is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "precision", rename_all = "snake_case")]
pub enum LoadPrecision {
    Full,
    Int8 {
        load_in_8bit: bool,
    },
    Nf4 {
        quantization_config: BitsAndBytesConfig,
        torch_dtype: TorchDtype,
    },
}

impl LoadPrecision {
    /// Quantised loads need the int8-training preparation pass before adapters are attached.
    pub fn needs_kbit_preparation(&self) -> bool {
        !matches!(self, Self::Full)
    }
}

/// Where the base model's weights are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMap {
    /// Let the loader spread layers over visible devices.
    Auto,
    /// Whole model on one device (data-parallel launch).
    Device(usize),
}

impl Serialize for DeviceMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Device(rank) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("", rank)?;
                map.end()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    pub num_beams: usize,
    pub max_length: usize,
}

// ── Plan ────────────────────────────────────────────────────────────────────

/// A fully resolved run, serialised to `training_plan.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingPlan {
    pub model_name: String,
    pub model_kind: ModelKind,
    pub training_args: TrainingArguments,
    pub adapter: AdapterConfig,
    pub load: LoadPrecision,
    /// Run the k-bit training preparation pass before attaching adapters.
    pub prepare_model_for_kbit_training: bool,
    pub device_map: DeviceMap,
    pub generation: GenerationDefaults,
}

impl TrainingPlan {
    /// Resolve a plan for `model_name`, writing into `output_dir`.
    pub fn resolve(
        cfg: &FinetuneConfig,
        model_name: &str,
        output_dir: &Path,
        dist: &DistributedContext,
    ) -> Result<Self> {
        cfg.validate()?;
        let t = &cfg.training;
        let data = &cfg.data;

        let mut accumulation = t.batch_size / t.micro_batch_size;
        if dist.is_distributed() {
            accumulation /= dist.world_size;
        }
        let accumulation = accumulation.max(1);

        let training_args = TrainingArguments {
            output_dir: output_dir.to_path_buf(),
            per_device_train_batch_size: t.micro_batch_size,
            per_device_eval_batch_size: t.micro_batch_size,
            gradient_accumulation_steps: accumulation,
            warmup_ratio: t.warmup_ratio,
            max_steps: t.max_steps,
            learning_rate: t.learning_rate,
            lr_scheduler_type: t.lr_scheduler_type.clone(),
            fp16: t.fp16,
            bf16: t.bf16,
            logging_steps: t.logging_steps,
            evaluation_strategy: "steps".into(),
            logging_strategy: "steps".into(),
            save_strategy: "steps".into(),
            eval_steps: t.eval_steps,
            save_steps: t.save_steps,
            save_total_limit: t.save_total_limit,
            optim: t.optim.clone(),
            torch_compile: false,
            load_best_model_at_end: false,
            ddp_find_unused_parameters: dist.is_distributed().then_some(false),
            report_to: cfg.run.report_to.clone(),
            seed: cfg.run.seed,
        };

        let l = &cfg.lora;
        let adapter = AdapterConfig {
            peft_type: "LORA".into(),
            task_type: data.model_kind.task_type().into(),
            base_model_name_or_path: model_name.to_string(),
            r: l.r,
            lora_alpha: l.lora_alpha,
            lora_dropout: l.lora_dropout,
            target_modules: l.target_modules.clone(),
            bias: l.bias.clone(),
            inference_mode: false,
        };

        let q = &cfg.quantization;
        let load = match q.precision {
            Precision::Full => LoadPrecision::Full,
            Precision::Int8 => LoadPrecision::Int8 { load_in_8bit: true },
            Precision::Nf4 => {
                let compute = if t.bf16 {
                    TorchDtype::Bfloat16
                } else {
                    TorchDtype::Float16
                };
                LoadPrecision::Nf4 {
                    quantization_config: BitsAndBytesConfig {
                        load_in_4bit: true,
                        llm_int8_threshold: q.llm_int8_threshold,
                        llm_int8_has_fp16_weight: q.llm_int8_has_fp16_weight,
                        bnb_4bit_compute_dtype: compute,
                        bnb_4bit_use_double_quant: q.double_quant,
                        bnb_4bit_quant_type: "nf4".into(),
                    },
                    torch_dtype: if t.bf16 {
                        TorchDtype::Bfloat16
                    } else {
                        TorchDtype::Float32
                    },
                }
            }
        };

        let device_map = if dist.is_distributed() {
            DeviceMap::Device(dist.local_rank)
        } else {
            DeviceMap::Auto
        };

        let generation = GenerationDefaults {
            num_beams: t.num_beams,
            max_length: match data.model_kind {
                ModelKind::Causal => data.max_tokens_count(),
                ModelKind::Seq2Seq => data.max_target_tokens_count,
            },
        };

        let plan = Self {
            model_name: model_name.to_string(),
            model_kind: data.model_kind,
            training_args,
            adapter,
            prepare_model_for_kbit_training: load.needs_kbit_preparation(),
            load,
            device_map,
            generation,
        };
        tracing::info!(
            model = model_name,
            micro_batch = t.micro_batch_size,
            grad_accum = accumulation,
            world_size = dist.world_size,
            max_steps = t.max_steps,
            "training plan resolved"
        );
        Ok(plan)
    }

    /// Save plan to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
