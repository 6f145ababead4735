//! Per-run process context.
//!
//! Seeds, tokenizer threading and launcher topology are resolved once in
//! `main` and passed down explicitly; library code never reads environment
//! variables itself.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::RunConfig;
use crate::error::{InstructError, Result};

/// Seeded randomness plus process-wide switches for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    seed: u64,
}

impl RunContext {
    /// Apply process-wide settings and capture the seed.
    pub fn init(cfg: &RunConfig) -> Self {
        tokenizers::utils::parallelism::set_parallelism(cfg.tokenizer_parallelism);
        tracing::debug!(
            seed = cfg.seed,
            tokenizer_parallelism = cfg.tokenizer_parallelism,
            "run context initialised"
        );
        Self { seed: cfg.seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Independent, reproducible generator for a named stream (e.g. `"train"`).
    ///
    /// The same seed and name always yield the same sequence, regardless of
    /// which other streams were drawn from.
    pub fn rng(&self, stream: &str) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ fnv1a(stream.as_bytes()))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |h, &b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

// ── Distributed launch ──────────────────────────────────────────────────────

/// Process topology reported by a data-parallel launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedContext {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::single()
    }
}

impl DistributedContext {
    /// A single, non-distributed process.
    pub fn single() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }

    /// Read `WORLD_SIZE`, `RANK` and `LOCAL_RANK` from the environment.
    pub fn from_launcher_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve topology through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str, default: usize| -> Result<usize> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw.trim().parse().map_err(|_| {
                    InstructError::Config(format!("{key}={raw:?} is not a non-negative integer"))
                }),
            }
        };
        let world_size = read("WORLD_SIZE", 1)?;
        let rank = read("RANK", 0)?;
        let local_rank = read("LOCAL_RANK", 0)?;
        if world_size == 0 {
            return Err(InstructError::Config("WORLD_SIZE must be positive".into()));
        }
        if rank >= world_size {
            return Err(InstructError::Config(format!(
                "RANK {rank} is out of range for WORLD_SIZE {world_size}"
            )));
        }
        Ok(Self {
            rank,
            local_rank,
            world_size,
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// Rank 0 owns side effects such as publishing.
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}
