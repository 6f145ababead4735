//! Error types shared by the library crates.

use thiserror::Error;

use crate::template::TemplateVariant;

/// Result alias used across instruct-lora library crates.
pub type Result<T> = std::result::Result<T, InstructError>;

/// Everything that can go wrong while preparing a fine-tuning run.
///
/// Configuration errors surface at construction time; data errors carry the
/// index of the offending record.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InstructError {
    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Config(String),

    /// The selected template variant is not part of the template set.
    #[error("template variant `{0}` is missing from the template set")]
    MissingTemplate(TemplateVariant),

    /// A record lacks a required field.
    #[error("record {index}: missing required field `{field}`")]
    MissingField {
        /// Position of the record in its source file.
        index: usize,
        /// Configured field name.
        field: String,
    },

    /// A record field exists but does not hold a string.
    #[error("record {index}: field `{field}` is not a string")]
    FieldType {
        /// Position of the record in its source file.
        index: usize,
        /// Configured field name.
        field: String,
    },

    /// Malformed record source.
    #[error("{path}:{line}: {message}")]
    Parse {
        /// Source file.
        path: String,
        /// 1-based line (or 1 for whole-file JSON).
        line: usize,
        /// Parser message.
        message: String,
    },

    /// Tokenizer failure.
    #[error("tokenizer: {0}")]
    Tokenizer(String),

    /// Example lookup past the end of a dataset.
    #[error("example index {index} out of range (len {len})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of examples available.
        len: usize,
    },

    /// An example whose sequences cannot be collated together.
    #[error("batch row {row}: {message}")]
    MalformedExample {
        /// Position of the example within the batch.
        row: usize,
        /// What does not line up.
        message: String,
    },

    /// Malformed example store.
    #[error("example store: {0}")]
    Store(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InstructError {
    /// True for errors caused by a single bad record rather than configuration.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::MissingField { .. } | Self::FieldType { .. } | Self::Parse { .. }
        )
    }
}
