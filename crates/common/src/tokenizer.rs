//! Tokenizer seam.
//!
//! The example builder only needs plain encoding plus a few special token
//! ids, so it is written against [`PromptTokenizer`]. [`HfTokenizer`] is the
//! production implementation over a HuggingFace `tokenizer.json`.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::config::SpecialTokensConfig;
use crate::error::{InstructError, Result};

/// How far into the vocabulary special-token repair looks.
const REPAIR_SCAN_IDS: u32 = 1000;

/// What the example builder needs from a tokenizer.
pub trait PromptTokenizer: Send + Sync {
    /// Encode without adding special tokens and without padding.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Terminator appended after every target.
    fn eos_token_id(&self) -> u32;
    /// Optional sequence-start token.
    fn bos_token_id(&self) -> Option<u32>;
    /// Id used by the collator for padded positions.
    fn pad_token_id(&self) -> u32;
}

/// Resolved special token ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokenIds {
    pub bos: Option<u32>,
    pub eos: u32,
    pub pad: u32,
}

/// `tokenizers::Tokenizer` plus repaired special tokens.
pub struct HfTokenizer {
    inner: Tokenizer,
    special: SpecialTokenIds,
}

impl HfTokenizer {
    /// Load `tokenizer.json` and resolve special tokens.
    pub fn from_file(path: &Path, special: &SpecialTokensConfig) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_os_str().to_string_lossy().to_string())
            .map_err(|e| InstructError::Tokenizer(format!("load {}: {e}", path.display())))?;
        Self::new(inner, special)
    }

    /// Wrap an already-built tokenizer.
    ///
    /// Padding and truncation stored in `tokenizer.json` are cleared; the
    /// example builder applies its own budgets and the collator pads.
    pub fn new(mut inner: Tokenizer, special: &SpecialTokensConfig) -> Result<Self> {
        inner.with_padding(None);
        inner
            .with_truncation(None)
            .map_err(|e| InstructError::Tokenizer(format!("clear truncation: {e}")))?;
        let special = repair_special_tokens(&inner, special)?;
        tracing::info!(
            vocab = inner.get_vocab_size(true),
            bos = ?special.bos,
            eos = special.eos,
            pad = special.pad,
            "tokenizer ready"
        );
        Ok(Self { inner, special })
    }
}

impl PromptTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| InstructError::Tokenizer(format!("encode: {e}")))?;
        Ok(enc.get_ids().to_vec())
    }

    fn eos_token_id(&self) -> u32 {
        self.special.eos
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.special.bos
    }

    fn pad_token_id(&self) -> u32 {
        self.special.pad
    }
}

/// Resolve configured special tokens, falling back to a scan of the low ids
/// for a token containing the usual marker when the exact string is absent.
fn repair_special_tokens(tok: &Tokenizer, cfg: &SpecialTokensConfig) -> Result<SpecialTokenIds> {
    let resolve = |configured: Option<&str>, marker: &str| -> Option<u32> {
        configured
            .and_then(|t| tok.token_to_id(t))
            .or_else(|| scan_for_marker(tok, marker))
    };

    let eos = resolve(Some(cfg.eos.as_str()), "</s>").ok_or_else(|| {
        InstructError::Config(format!("EOS token {:?} not found in vocabulary", cfg.eos))
    })?;
    let bos = match cfg.bos.as_deref() {
        Some(b) => resolve(Some(b), "<s>"),
        None => None,
    };
    let pad = match resolve(cfg.pad.as_deref(), "pad") {
        Some(id) => id,
        None => {
            tracing::warn!("no pad token in vocabulary; padding with id 0");
            0
        }
    };
    Ok(SpecialTokenIds { bos, eos, pad })
}

fn scan_for_marker(tok: &Tokenizer, marker: &str) -> Option<u32> {
    let limit = (tok.get_vocab_size(true) as u32).min(REPAIR_SCAN_IDS);
    (0..limit).find(|&id| tok.id_to_token(id).is_some_and(|t| t.contains(marker)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tokenizer(dir: &Path, vocab: &str) -> std::path::PathBuf {
        write_tokenizer_with(dir, vocab, "null", "null")
    }

    fn write_tokenizer_with(
        dir: &Path,
        vocab: &str,
        truncation: &str,
        padding: &str,
    ) -> std::path::PathBuf {
        let json = format!(
            r#"{{
  "version": "1.0",
  "truncation": {truncation},
  "padding": {padding},
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {{ "type": "Whitespace" }},
  "post_processor": null,
  "decoder": null,
  "model": {{ "type": "WordLevel", "vocab": {vocab}, "unk_token": "<unk>" }}
}}"#
        );
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn encodes_without_special_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tokenizer(
            dir.path(),
            r#"{"<unk>": 0, "<s>": 1, "</s>": 2, "<pad>": 3, "hello": 4, "world": 5}"#,
        );
        let tok = HfTokenizer::from_file(&path, &SpecialTokensConfig::default()).unwrap();
        assert_eq!(tok.encode("hello world").unwrap(), vec![4, 5]);
        assert_eq!(tok.eos_token_id(), 2);
        assert_eq!(tok.bos_token_id(), Some(1));
        // "<pad>" is found by the marker scan even though no pad string is configured.
        assert_eq!(tok.pad_token_id(), 3);
    }

    #[test]
    fn stored_padding_and_truncation_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tokenizer_with(
            dir.path(),
            r#"{"<unk>": 0, "<s>": 1, "</s>": 2, "<pad>": 3, "hello": 4, "world": 5}"#,
            r#"{ "direction": "Right", "max_length": 1, "strategy": "LongestFirst", "stride": 0 }"#,
            r#"{ "strategy": { "Fixed": 8 }, "direction": "Right", "pad_to_multiple_of": null,
                 "pad_id": 3, "pad_type_id": 0, "pad_token": "<pad>" }"#,
        );
        let tok = HfTokenizer::from_file(&path, &SpecialTokensConfig::default()).unwrap();
        assert_eq!(tok.encode("hello world").unwrap(), vec![4, 5]);
        assert_eq!(tok.encode("hello world hello").unwrap(), vec![4, 5, 4]);
    }

    #[test]
    fn missing_eos_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tokenizer(dir.path(), r#"{"<unk>": 0, "hello": 1}"#);
        let err = HfTokenizer::from_file(&path, &SpecialTokensConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, InstructError::Config(_)));
    }

    #[test]
    fn renamed_eos_is_repaired_by_marker_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tokenizer(dir.path(), r#"{"<unk>": 0, "<|</s>|>": 1, "hi": 2}"#);
        let cfg = SpecialTokensConfig {
            bos: None,
            eos: "[EOS]".to_string(),
            pad: None,
        };
        let tok = HfTokenizer::from_file(&path, &cfg).unwrap();
        assert_eq!(tok.eos_token_id(), 1);
        assert_eq!(tok.bos_token_id(), None);
        assert_eq!(tok.pad_token_id(), 0);
    }
}
