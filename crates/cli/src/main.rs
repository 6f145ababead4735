use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};

use instruct_common::{
    load_records, write_examples_file, DistributedContext, ExampleSource, FinetuneConfig,
    HfTokenizer, MmapExamples, PromptTokenizer, RunContext, TemplateSet,
};
use instruct_core::{Collator, ExampleBuilder, InstructDataset, PaddedBatch};
use instruct_train::{
    detect_resume, AdapterPublisher, DirectoryPublisher, FinetuneJob, HandoffBackend,
    TrainerBackend, TrainingPlan,
};

/// Number of training examples collated and logged before handing off.
const PREVIEW_EXAMPLES: usize = 2;

#[derive(Parser, Debug)]
#[command(name = "instruct-lora", about = "Instruction-tuning data pipeline for LoRA adapters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build both splits, resolve the training plan and hand the run off.
    Finetune(FinetuneArgs),
    /// Build one split into a .iex example store.
    Prepare(PrepareArgs),
    /// Collate and print examples from a .iex example store.
    Inspect(InspectArgs),
    /// Stage a trained adapter under a repository name.
    Publish(PublishArgs),
}

// ── Finetune ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct FinetuneArgs {
    /// Base model to adapt.
    #[arg(long)]
    model_name: String,
    /// Output directory for the adapter, checkpoints and hand-off files.
    #[arg(long, default_value = "lora-adapter")]
    adapter: PathBuf,
    /// Per-device micro batch size (overrides the config).
    #[arg(long)]
    mbatch_size: Option<usize>,
    /// Run seed (overrides the config).
    #[arg(long)]
    seed: Option<u64>,
    /// Repository name the adapter is published under.
    #[arg(long)]
    repo_name: String,
    #[arg(long, default_value = "finetune.json")]
    config: PathBuf,
    #[arg(long)]
    tokenizer: PathBuf,
    #[arg(long)]
    train_data: PathBuf,
    #[arg(long)]
    val_data: PathBuf,
    /// Template file (overrides the config).
    #[arg(long)]
    templates: Option<PathBuf>,
    #[arg(long, default_value = "published")]
    publish_dir: PathBuf,
}

// ── Prepare / Inspect ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Split {
    Train,
    Val,
}

#[derive(Parser, Debug)]
struct PrepareArgs {
    #[arg(long, default_value = "finetune.json")]
    config: PathBuf,
    #[arg(long)]
    tokenizer: PathBuf,
    /// JSONL / JSON record file, or a directory of them.
    #[arg(long)]
    data: PathBuf,
    /// Which sample rate to apply.
    #[arg(long, value_enum, default_value = "train")]
    split: Split,
    #[arg(long)]
    templates: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long, default_value = "finetune.json")]
    config: PathBuf,
    /// Pad id used for display; the store does not record it.
    #[arg(long, default_value_t = 0)]
    pad_id: u32,
    #[arg(long, default_value_t = PREVIEW_EXAMPLES)]
    count: usize,
}

#[derive(Parser, Debug)]
struct PublishArgs {
    #[arg(long, default_value = "lora-adapter")]
    adapter: PathBuf,
    #[arg(long)]
    repo_name: String,
    #[arg(long, default_value = "published")]
    publish_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Finetune(args) => cmd_finetune(args),
        Command::Prepare(args) => cmd_prepare(args),
        Command::Inspect(args) => cmd_inspect(args),
        Command::Publish(args) => cmd_publish(args),
    }
}

// ── Shared setup ───────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<FinetuneConfig> {
    if path.exists() {
        FinetuneConfig::load(path).with_context(|| format!("load config {}", path.display()))
    } else {
        let default = FinetuneConfig::default();
        default.save(path)?;
        eprintln!("Created default config at {}", path.display());
        Ok(default)
    }
}

fn load_templates(cfg: &FinetuneConfig) -> Result<TemplateSet> {
    let path = &cfg.data.templates_path;
    TemplateSet::load(path).with_context(|| format!("load templates {}", path.display()))
}

fn build_split(
    cfg: &FinetuneConfig,
    tokenizer: &HfTokenizer,
    templates: &TemplateSet,
    ctx: &RunContext,
    data: &Path,
    split: Split,
    show_progress: bool,
) -> Result<InstructDataset> {
    let records =
        load_records(data).with_context(|| format!("load records {}", data.display()))?;
    let builder = ExampleBuilder::new(tokenizer, templates, &cfg.data)?;
    let (rate, stream) = match split {
        Split::Train => (cfg.data.train_sample_rate, "train"),
        Split::Val => (cfg.data.val_sample_rate, "val"),
    };
    let dataset = InstructDataset::build(&records, &builder, rate, &mut ctx.rng(stream), show_progress)
        .with_context(|| format!("build {stream} split"))?;
    Ok(dataset)
}

fn log_preview(batch: &PaddedBatch) {
    if batch.batch_size == 0 {
        return;
    }
    tracing::info!(input_ids = ?batch.input_row(0), "preview");
    tracing::info!(attention_mask = ?batch.mask_row(0), "preview");
    tracing::info!(labels = ?batch.label_row(0), "preview");
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_finetune(args: FinetuneArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    if let Some(mbatch) = args.mbatch_size {
        cfg.training.micro_batch_size = mbatch;
    }
    if let Some(seed) = args.seed {
        cfg.run.seed = seed;
    }
    if let Some(templates) = args.templates {
        cfg.data.templates_path = templates;
    }
    cfg.validate()?;

    let ctx = RunContext::init(&cfg.run);
    let dist = DistributedContext::from_launcher_env()?;
    tracing::info!(
        model = %args.model_name,
        rank = dist.rank,
        world_size = dist.world_size,
        seed = ctx.seed(),
        "starting fine-tuning run"
    );

    let tokenizer = HfTokenizer::from_file(&args.tokenizer, &cfg.data.special_tokens)?;
    let templates = load_templates(&cfg)?;
    let show_progress = dist.is_main_process();
    let train = build_split(&cfg, &tokenizer, &templates, &ctx, &args.train_data, Split::Train, show_progress)?;
    let val = build_split(&cfg, &tokenizer, &templates, &ctx, &args.val_data, Split::Val, show_progress)?;

    let collator = Collator::new(
        cfg.data.model_kind,
        tokenizer.pad_token_id(),
        cfg.training.pad_to_multiple_of,
    )?;
    let preview = collator.collate_from(&train, 0..train.len().min(PREVIEW_EXAMPLES))?;
    log_preview(&preview);

    let plan = TrainingPlan::resolve(&cfg, &args.model_name, &args.adapter, &dist)?;
    let resume = detect_resume(&args.adapter)?;
    let job = FinetuneJob {
        plan: &plan,
        train: &train,
        val: &val,
        collator,
        resume,
    };
    let backend = HandoffBackend::new(dist);
    let outcome = backend
        .train(&job)
        .with_context(|| format!("{} backend", backend.name()))?;

    if !dist.is_main_process() {
        return Ok(());
    }
    if outcome.trained {
        publish(&outcome.adapter_dir, &args.repo_name, &args.publish_dir)?;
    } else {
        eprintln!(
            "Hand-off written to {}; after training run: instruct-lora publish --adapter {} --repo-name {}",
            outcome.adapter_dir.display(),
            outcome.adapter_dir.display(),
            args.repo_name
        );
    }
    Ok(())
}

fn publish(adapter_dir: &Path, repo_name: &str, publish_dir: &Path) -> Result<()> {
    let publisher = DirectoryPublisher::new(publish_dir);
    let dest = publisher
        .publish(adapter_dir, repo_name)
        .with_context(|| format!("publish {repo_name}"))?;
    eprintln!("Published adapter to {}", dest.display());
    Ok(())
}

fn cmd_prepare(args: PrepareArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    if let Some(seed) = args.seed {
        cfg.run.seed = seed;
    }
    if let Some(templates) = args.templates {
        cfg.data.templates_path = templates;
    }
    cfg.validate()?;

    let ctx = RunContext::init(&cfg.run);
    let tokenizer = HfTokenizer::from_file(&args.tokenizer, &cfg.data.special_tokens)?;
    let templates = load_templates(&cfg)?;
    let dataset = build_split(&cfg, &tokenizer, &templates, &ctx, &args.data, args.split, true)?;
    write_examples_file(&args.output, cfg.data.model_kind, &dataset)?;
    eprintln!(
        "Wrote {} examples ({} records read, {} trainable tokens) to {}",
        dataset.len(),
        dataset.source_records(),
        dataset.trainable_tokens(),
        args.output.display()
    );
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let cfg = load_config(&args.config)?;
    let store = MmapExamples::open(&args.file)
        .with_context(|| format!("open {}", args.file.display()))?;
    if store.kind() != cfg.data.model_kind {
        tracing::warn!(
            store = ?store.kind(),
            config = ?cfg.data.model_kind,
            "store was built for a different model kind; collating as stored"
        );
    }
    let collator = Collator::new(store.kind(), args.pad_id, cfg.training.pad_to_multiple_of)?;
    let n = store.len().min(args.count);
    let batch = collator.collate_from(&store, 0..n)?;
    let tensors = batch.to_tensors(&Device::Cpu)?;

    println!("{} {:?} examples in {}", store.len(), store.kind(), args.file.display());
    println!(
        "batch: input_ids {:?}, attention_mask {:?}, labels {:?}",
        tensors.input_ids.dims(),
        tensors.attention_mask.dims(),
        tensors.labels.dims()
    );
    for row in 0..batch.batch_size {
        println!("── example {row} ──");
        println!("INPUT_IDS {:?}", batch.input_row(row));
        println!("MASK      {:?}", batch.mask_row(row));
        println!("LABELS    {:?}", batch.label_row(row));
    }
    Ok(())
}

fn cmd_publish(args: PublishArgs) -> Result<()> {
    publish(&args.adapter, &args.repo_name, &args.publish_dir)
}
