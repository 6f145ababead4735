//! Record → [`TokenizedExample`] conversion.
//!
//! Causal examples are `prompt ++ target ++ [EOS]` with labels aligned to the
//! input; seq2seq examples keep the prompt as encoder input and the target as
//! a separate label sequence.

use instruct_common::config::{DataConfig, ModelKind};
use instruct_common::data::{RawRecord, TokenizedExample, IGNORE_INDEX};
use instruct_common::error::Result;
use instruct_common::template::TemplateSet;
use instruct_common::tokenizer::PromptTokenizer;

/// Deterministic builder shared read-only by all workers.
pub struct ExampleBuilder<'a> {
    tokenizer: &'a dyn PromptTokenizer,
    templates: &'a TemplateSet,
    config: &'a DataConfig,
}

impl<'a> ExampleBuilder<'a> {
    /// Validates the data config up front so bad budgets fail before any record is read.
    pub fn new(
        tokenizer: &'a dyn PromptTokenizer,
        templates: &'a TemplateSet,
        config: &'a DataConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tokenizer,
            templates,
            config,
        })
    }

    /// Build one example.
    pub fn build(&self, record: &RawRecord) -> Result<TokenizedExample> {
        let prompt = self.render_prompt(record)?;
        let target = record.field(&self.config.target_field)?;
        match self.config.model_kind {
            ModelKind::Causal => self.build_causal(&prompt, target),
            ModelKind::Seq2Seq => self.build_seq2seq(&prompt, target),
        }
    }

    fn render_prompt(&self, record: &RawRecord) -> Result<String> {
        let instruction = record.field(&self.config.instruction_field)?;
        let input = match self.config.source_field() {
            Some(field) => record.nullable_field(field)?,
            None => None,
        };
        self.templates.render(instruction, input, record.index())
    }

    fn build_causal(&self, prompt: &str, target: &str) -> Result<TokenizedExample> {
        let mut prompt_ids = self.tokenizer.encode(prompt)?;
        if self.config.add_bos {
            if let Some(bos) = self.tokenizer.bos_token_id() {
                prompt_ids.insert(0, bos);
            }
        }
        self.config
            .truncation
            .truncate(&mut prompt_ids, self.config.max_source_tokens_count);

        let mut target_ids = self.tokenizer.encode(target.trim())?;
        target_ids.truncate(self.config.max_target_tokens_count);
        target_ids.push(self.tokenizer.eos_token_id());

        let prompt_len = prompt_ids.len();
        let mut input_ids = prompt_ids;
        input_ids.extend_from_slice(&target_ids);

        let mut labels: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
        if self.config.only_target_loss {
            labels[..prompt_len].fill(IGNORE_INDEX);
        }

        Ok(TokenizedExample {
            attention_mask: vec![1; input_ids.len()],
            input_ids,
            labels,
            prompt_len,
        })
    }

    fn build_seq2seq(&self, prompt: &str, target: &str) -> Result<TokenizedExample> {
        let mut input_ids = self.tokenizer.encode(prompt)?;
        self.config
            .truncation
            .truncate(&mut input_ids, self.config.max_source_tokens_count);

        let eos = self.tokenizer.eos_token_id();
        let mut target_ids = self.tokenizer.encode(target.trim())?;
        target_ids.truncate(self.config.max_target_tokens_count);
        if target_ids.last() != Some(&eos) {
            target_ids.push(eos);
        }

        Ok(TokenizedExample {
            attention_mask: vec![1; input_ids.len()],
            prompt_len: input_ids.len(),
            input_ids,
            labels: target_ids.into_iter().map(|id| id as i64).collect(),
        })
    }
}
