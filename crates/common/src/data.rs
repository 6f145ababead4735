//! Records in, examples out.
//!
//! * **[`RawRecord`]** / [`load_records`] — named-field records from JSONL or
//!   JSON-array files (a single file or a directory of them).
//! * **[`TokenizedExample`]** — the unit consumed by the trainer.
//! * **[`ExampleSource`]** — indexed access shared by in-memory datasets and
//!   [`MmapExamples`].
//! * **[`write_examples_file`]** / **[`MmapExamples`]** — zero-copy on-disk
//!   store handed to an external trainer process.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde_json::{Map, Value};

use crate::config::ModelKind;
use crate::error::{InstructError, Result};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

// ── Raw records ─────────────────────────────────────────────────────────────

/// One input record: named fields plus its position in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    index: usize,
    fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(index: usize, fields: Map<String, Value>) -> Self {
        Self { index, fields }
    }

    /// Build from `(name, text)` pairs.
    pub fn from_pairs<'a>(index: usize, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        Self { index, fields }
    }

    /// Position of the record in its source (0-based, across files).
    pub fn index(&self) -> usize {
        self.index
    }

    /// A field that must be present and hold a string.
    pub fn field(&self, name: &str) -> Result<&str> {
        match self.fields.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(InstructError::FieldType {
                index: self.index,
                field: name.to_string(),
            }),
            None => Err(InstructError::MissingField {
                index: self.index,
                field: name.to_string(),
            }),
        }
    }

    /// A configured field that must exist but may be `null`.
    pub fn nullable_field(&self, name: &str) -> Result<Option<&str>> {
        match self.fields.get(name) {
            Some(Value::Null) => Ok(None),
            _ => self.field(name).map(Some),
        }
    }
}

/// Load records from a `.jsonl` / `.json` file or a directory of them.
///
/// Files in a directory are read in sorted order; record indices keep
/// counting across files.
pub fn load_records(path: &Path) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    for file in collect_files(path)? {
        let before = records.len();
        if file.extension().is_some_and(|e| e == "json") {
            load_json_array(&file, &mut records)?;
        } else {
            load_jsonl(&file, &mut records)?;
        }
        tracing::debug!(file = %file.display(), records = records.len() - before, "records loaded");
    }
    Ok(records)
}

fn load_jsonl(path: &Path, out: &mut Vec<RawRecord>) -> Result<()> {
    let reader = BufReader::new(File::open(path)?);
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = parse_object(line).map_err(|message| InstructError::Parse {
            path: path.display().to_string(),
            line: line_no + 1,
            message,
        })?;
        out.push(RawRecord::new(out.len(), fields));
    }
    Ok(())
}

fn load_json_array(path: &Path, out: &mut Vec<RawRecord>) -> Result<()> {
    let parse_err = |message: String| InstructError::Parse {
        path: path.display().to_string(),
        line: 1,
        message,
    };
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text).map_err(|e| parse_err(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(parse_err("expected a JSON array of objects".into()));
    };
    for item in items {
        match item {
            Value::Object(fields) => out.push(RawRecord::new(out.len(), fields)),
            other => return Err(parse_err(format!("expected object, got {other}"))),
        }
    }
    Ok(())
}

fn parse_object(line: &str) -> std::result::Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(format!("expected object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}

/// Collect JSON/JSONL files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(InstructError::Config(format!(
            "record path is neither file nor directory: {}",
            path.display()
        )));
    }
    let mut entries: Vec<_> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e == "jsonl" || e == "json")
                    .unwrap_or(false)
        })
        .collect();
    entries.sort();
    Ok(entries)
}

// ── Tokenized examples ──────────────────────────────────────────────────────

/// One training example.
///
/// For causal models `input_ids`, `attention_mask` and `labels` have equal
/// length and the first `prompt_len` positions form the prompt segment. For
/// seq2seq models `labels` is the decoder target and may differ in length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub labels: Vec<i64>,
    pub prompt_len: usize,
}

impl TokenizedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of label positions that contribute to the loss.
    pub fn trainable_tokens(&self) -> usize {
        self.labels.iter().filter(|&&l| l != IGNORE_INDEX).count()
    }
}

/// Common interface for indexable, length-queryable example collections.
pub trait ExampleSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn example(&self, index: usize) -> Result<Cow<'_, TokenizedExample>>;
}

impl ExampleSource for [TokenizedExample] {
    fn len(&self) -> usize {
        <[TokenizedExample]>::len(self)
    }

    fn example(&self, index: usize) -> Result<Cow<'_, TokenizedExample>> {
        self.get(index)
            .map(Cow::Borrowed)
            .ok_or(InstructError::IndexOutOfRange {
                index,
                len: <[TokenizedExample]>::len(self),
            })
    }
}

impl ExampleSource for Vec<TokenizedExample> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn example(&self, index: usize) -> Result<Cow<'_, TokenizedExample>> {
        self.as_slice().example(index)
    }
}

// ── Example store ───────────────────────────────────────────────────────────

/// Magic bytes for the example store format (version 2).
const EXAMPLES_MAGIC: &[u8; 4] = b"IEX2";
/// Header size: magic (4) + model kind (4) + num_examples (8).
const EXAMPLES_HEADER_LEN: usize = 4 + 4 + 8;
/// Per-record header: prompt_len, n_input, n_labels (u32 each).
const RECORD_HEADER_LEN: usize = 3 * 4;

fn kind_tag(kind: ModelKind) -> u32 {
    match kind {
        ModelKind::Causal => 0,
        ModelKind::Seq2Seq => 1,
    }
}

fn kind_from_tag(tag: u32) -> Result<ModelKind> {
    match tag {
        0 => Ok(ModelKind::Causal),
        1 => Ok(ModelKind::Seq2Seq),
        other => Err(InstructError::Store(format!("unknown model kind tag {other}"))),
    }
}

/// Write examples to a binary file for use with [`MmapExamples`].
///
/// Format: magic "IEX2", the model kind as u32 LE (0 causal, 1 seq2seq),
/// `num_examples` as u64 LE, one u64 LE byte offset per example, then per
/// example `prompt_len`, `n_input`, `n_labels` as u32 LE, `n_input` × u32
/// input ids and `n_labels` × i64 labels. The attention mask is not stored;
/// unpadded examples attend to every position.
pub fn write_examples_file<S: ExampleSource + ?Sized>(
    path: &Path,
    kind: ModelKind,
    examples: &S,
) -> Result<()> {
    let n = examples.len();
    let mut offsets = Vec::with_capacity(n);
    let mut offset = (EXAMPLES_HEADER_LEN + n * 8) as u64;
    for i in 0..n {
        let ex = examples.example(i)?;
        offsets.push(offset);
        offset += (RECORD_HEADER_LEN + ex.input_ids.len() * 4 + ex.labels.len() * 8) as u64;
    }

    let mut f = BufWriter::new(File::create(path)?);
    f.write_all(EXAMPLES_MAGIC)?;
    f.write_all(&kind_tag(kind).to_le_bytes())?;
    f.write_all(&(n as u64).to_le_bytes())?;
    for off in &offsets {
        f.write_all(&off.to_le_bytes())?;
    }
    for i in 0..n {
        let ex = examples.example(i)?;
        f.write_all(&(ex.prompt_len as u32).to_le_bytes())?;
        f.write_all(&(ex.input_ids.len() as u32).to_le_bytes())?;
        f.write_all(&(ex.labels.len() as u32).to_le_bytes())?;
        for &id in &ex.input_ids {
            f.write_all(&id.to_le_bytes())?;
        }
        for &label in &ex.labels {
            f.write_all(&label.to_le_bytes())?;
        }
    }
    let file = f.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// Zero-copy view over an example store.
///
/// The file is memory-mapped; only the pages touched by a lookup are paged in.
pub struct MmapExamples {
    mmap: Mmap,
    kind: ModelKind,
    num_examples: usize,
}

impl MmapExamples {
    /// Open a store written by [`write_examples_file`].
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the store is written once and treated as read-only afterwards.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < EXAMPLES_HEADER_LEN {
            return Err(InstructError::Store("file too short".into()));
        }
        if &mmap[0..4] != EXAMPLES_MAGIC {
            return Err(InstructError::Store("bad magic".into()));
        }
        let kind = kind_from_tag(read_u32(&mmap, 4)?)?;
        let num_examples = usize::try_from(read_u64(&mmap, 8)?)
            .map_err(|_| InstructError::Store("example count does not fit in memory".into()))?;
        let table_end = num_examples
            .checked_mul(8)
            .and_then(|table| table.checked_add(EXAMPLES_HEADER_LEN))
            .ok_or_else(|| {
                InstructError::Store(format!("example count {num_examples} overflows the offset table"))
            })?;
        if mmap.len() < table_end {
            return Err(InstructError::Store(format!(
                "offset table truncated: expected {} bytes, got {}",
                table_end,
                mmap.len()
            )));
        }
        Ok(Self {
            mmap,
            kind,
            num_examples,
        })
    }

    /// Model kind the examples were built for.
    pub fn kind(&self) -> ModelKind {
        self.kind
    }
}

impl ExampleSource for MmapExamples {
    fn len(&self) -> usize {
        self.num_examples
    }

    fn example(&self, index: usize) -> Result<Cow<'_, TokenizedExample>> {
        if index >= self.num_examples {
            return Err(InstructError::IndexOutOfRange {
                index,
                len: self.num_examples,
            });
        }
        let bytes = &self.mmap[..];
        let start = usize::try_from(read_u64(bytes, EXAMPLES_HEADER_LEN + index * 8)?)
            .map_err(|_| InstructError::Store(format!("offset of example {index} out of range")))?;
        let prompt_len = read_u32(bytes, start)? as usize;
        let n_input = read_u32(bytes, start + 4)? as usize;
        let n_labels = read_u32(bytes, start + 8)? as usize;

        let ids_start = start + RECORD_HEADER_LEN;
        let labels_start = ids_start + n_input * 4;
        if bytes.len() < labels_start + n_labels * 8 {
            return Err(InstructError::Store(format!("example {index} is truncated")));
        }
        let input_ids = (0..n_input)
            .map(|i| read_u32(bytes, ids_start + i * 4))
            .collect::<Result<Vec<_>>>()?;
        let labels = (0..n_labels)
            .map(|i| read_u64(bytes, labels_start + i * 8).map(|v| v as i64))
            .collect::<Result<Vec<_>>>()?;

        Ok(Cow::Owned(TokenizedExample {
            attention_mask: vec![1; input_ids.len()],
            input_ids,
            labels,
            prompt_len,
        }))
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at.saturating_add(4))
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| InstructError::Store(format!("truncated read at byte {at}")))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64> {
    bytes
        .get(at..at.saturating_add(8))
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| InstructError::Store(format!("truncated read at byte {at}")))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn example(ids: &[u32], prompt_len: usize) -> TokenizedExample {
        let mut labels: Vec<i64> = ids.iter().map(|&i| i as i64).collect();
        labels[..prompt_len].fill(IGNORE_INDEX);
        TokenizedExample {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels,
            prompt_len,
        }
    }

    #[test]
    fn jsonl_records_keep_order_and_skip_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(
            &path,
            "{\"dialogue\": \"A: hi\", \"summary\": \"greeting\"}\n\n{\"dialogue\": \"B: bye\", \"summary\": \"farewell\"}\n",
        )
        .unwrap();
        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].index(), 1);
        assert_eq!(records[1].field("summary").unwrap(), "farewell");
    }

    #[test]
    fn directory_of_files_counts_indices_across_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"[{"x": "1"}, {"x": "2"}]"#).unwrap();
        std::fs::write(dir.path().join("b.jsonl"), "{\"x\": \"3\"}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let records = load_records(dir.path()).unwrap();
        let xs: Vec<_> = records.iter().map(|r| r.field("x").unwrap()).collect();
        assert_eq!(xs, vec!["1", "2", "3"]);
        assert_eq!(records[2].index(), 2);
    }

    #[test]
    fn malformed_line_reports_its_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"x\": \"1\"}\n[1, 2]\n").unwrap();
        match load_records(&path) {
            Err(InstructError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn field_errors_name_the_record() {
        let mut fields = Map::new();
        fields.insert("n".into(), Value::from(3));
        fields.insert("s".into(), Value::Null);
        let rec = RawRecord::new(7, fields);
        match rec.field("missing") {
            Err(InstructError::MissingField { index, field }) => {
                assert_eq!(index, 7);
                assert_eq!(field, "missing");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rec.field("n"), Err(InstructError::FieldType { index: 7, .. })));
        assert_eq!(rec.nullable_field("s").unwrap(), None);
        assert!(rec.nullable_field("missing").unwrap_err().is_data_error());
    }

    #[test]
    fn store_round_trips_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.iex");
        let examples = vec![example(&[1, 10, 11, 2], 2), example(&[1, 12, 2], 1)];
        write_examples_file(&path, ModelKind::Causal, examples.as_slice()).unwrap();

        let store = MmapExamples::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.kind(), ModelKind::Causal);
        assert_eq!(*store.example(1).unwrap(), examples[1]);
        assert_eq!(*store.example(0).unwrap(), examples[0]);
        assert!(matches!(
            store.example(2),
            Err(InstructError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn store_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.iex");
        std::fs::write(&path, b"TKN2\0\0\0\0\0\0\0\0\0\0\0\0").unwrap();
        assert!(matches!(MmapExamples::open(&path), Err(InstructError::Store(_))));
    }

    #[test]
    fn store_records_the_model_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("val.iex");
        let ex = TokenizedExample {
            input_ids: vec![9, 9],
            attention_mask: vec![1, 1],
            labels: vec![4, 4, 4, 2],
            prompt_len: 2,
        };
        write_examples_file(&path, ModelKind::Seq2Seq, std::slice::from_ref(&ex)).unwrap();
        let store = MmapExamples::open(&path).unwrap();
        assert_eq!(store.kind(), ModelKind::Seq2Seq);
        assert_eq!(*store.example(0).unwrap(), ex);
    }

    #[test]
    fn huge_example_count_is_rejected_without_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.iex");
        let mut bytes = EXAMPLES_MAGIC.to_vec();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(MmapExamples::open(&path), Err(InstructError::Store(_))));
    }

    #[test]
    fn unknown_kind_tag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kind.iex");
        let mut bytes = EXAMPLES_MAGIC.to_vec();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(MmapExamples::open(&path), Err(InstructError::Store(_))));
    }

    #[test]
    fn trainable_tokens_skip_ignored_labels() {
        assert_eq!(example(&[1, 10, 11, 2], 2).trainable_tokens(), 2);
    }
}
