//! Eager, sampled dataset assembly.

use std::borrow::Cow;

use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use rayon::prelude::*;

use instruct_common::config::validate_sample_rate;
use instruct_common::data::{ExampleSource, RawRecord, TokenizedExample};
use instruct_common::error::{InstructError, Result};

use crate::builder::ExampleBuilder;

/// Fully built examples for one split.
#[derive(Debug, Clone, Default)]
pub struct InstructDataset {
    examples: Vec<TokenizedExample>,
    source_records: usize,
}

impl InstructDataset {
    /// Sample `records` at `sample_rate`, then build every retained record.
    ///
    /// Keep/drop decisions are drawn from `rng` in record order before any
    /// building starts; building runs on the rayon pool and preserves order,
    /// so the result equals a sequential build.
    pub fn build<R: Rng + ?Sized>(
        records: &[RawRecord],
        builder: &ExampleBuilder<'_>,
        sample_rate: f64,
        rng: &mut R,
        show_progress: bool,
    ) -> Result<Self> {
        validate_sample_rate(sample_rate)?;
        let retained: Vec<&RawRecord> = records
            .iter()
            .filter(|_| rng.gen::<f64>() < sample_rate)
            .collect();

        let pb = if show_progress {
            progress_bar(retained.len())
        } else {
            ProgressBar::hidden()
        };
        let examples = retained
            .par_iter()
            .map(|record| {
                let ex = builder.build(record);
                pb.inc(1);
                ex
            })
            .collect::<Result<Vec<_>>>()?;
        pb.finish_and_clear();

        let dataset = Self {
            examples,
            source_records: records.len(),
        };
        tracing::info!(
            records = records.len(),
            kept = dataset.len(),
            sample_rate,
            trainable_tokens = dataset.trainable_tokens(),
            max_len = dataset.max_len(),
            "dataset built"
        );
        Ok(dataset)
    }

    /// Number of records offered before sampling.
    pub fn source_records(&self) -> usize {
        self.source_records
    }

    /// Total label positions that contribute to the loss.
    pub fn trainable_tokens(&self) -> usize {
        self.examples.iter().map(TokenizedExample::trainable_tokens).sum()
    }

    /// Longest example, in input tokens.
    pub fn max_len(&self) -> usize {
        self.examples.iter().map(TokenizedExample::len).max().unwrap_or(0)
    }
}

impl ExampleSource for InstructDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn example(&self, index: usize) -> Result<Cow<'_, TokenizedExample>> {
        self.examples
            .get(index)
            .map(Cow::Borrowed)
            .ok_or(InstructError::IndexOutOfRange {
                index,
                len: self.examples.len(),
            })
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} examples")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::{templates, words, WordTokenizer};
    use instruct_common::config::DataConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn records(n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| {
                let n = i as u32;
                RawRecord::from_pairs(
                    i,
                    [
                        ("dialogue", words(10 + n..12 + n).as_str()),
                        ("summary", "w7"),
                    ],
                )
            })
            .collect()
    }

    fn build(records: &[RawRecord], rate: f64, seed: u64) -> Result<InstructDataset> {
        let tok = WordTokenizer { bos: None };
        let tpl = templates();
        let cfg = DataConfig {
            add_bos: false,
            ..DataConfig::default()
        };
        let b = ExampleBuilder::new(&tok, &tpl, &cfg)?;
        InstructDataset::build(records, &b, rate, &mut StdRng::seed_from_u64(seed), false)
    }

    #[test]
    fn full_rate_keeps_every_record_in_order() {
        let recs = records(50);
        let ds = build(&recs, 1.0, 42).unwrap();
        assert_eq!(ds.len(), 50);
        assert_eq!(ds.source_records(), 50);
        for (i, ex) in ds.examples.iter().enumerate() {
            assert_eq!(ex.input_ids[0], 10 + i as u32);
        }
    }

    #[test]
    fn zero_rate_keeps_nothing() {
        let ds = build(&records(20), 0.0, 42).unwrap();
        assert!(ds.is_empty());
        assert_eq!(ds.max_len(), 0);
    }

    #[test]
    fn partial_rate_is_reproducible_for_a_seed() {
        let recs = records(200);
        let a = build(&recs, 0.5, 7).unwrap();
        let b = build(&recs, 0.5, 7).unwrap();
        assert_eq!(a.examples, b.examples);
        assert!(a.len() > 50 && a.len() < 150, "kept {}", a.len());
    }

    #[test]
    fn rate_outside_unit_interval_is_rejected() {
        assert!(matches!(build(&records(1), 1.5, 0), Err(InstructError::Config(_))));
        assert!(matches!(build(&records(1), -0.1, 0), Err(InstructError::Config(_))));
    }

    #[test]
    fn bad_record_fails_the_build() {
        let mut recs = records(3);
        recs.push(RawRecord::from_pairs(3, [("dialogue", "w1")]));
        let err = build(&recs, 1.0, 0).unwrap_err();
        assert!(err.is_data_error());
    }

    #[test]
    fn out_of_range_lookup_is_an_error() {
        let ds = build(&records(2), 1.0, 0).unwrap();
        assert_eq!(ds.example(1).unwrap().input_ids[0], 11);
        assert!(ds.example(2).is_err());
    }
}
