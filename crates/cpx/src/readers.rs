//! 📖 Readers: turn one split's bytes into a lazy stream of `(uri, Document)` records.
//!
//! 🚰 Every reader follows the same little dance:
//! `initialize(split, config)` → `advance()` until it says `false` → `close()`.
//! In between, `current_key()` / `current_value()` peek at the record, and `take_current()`
//! moves it out so the worker doesn't have to clone a 40MB PDF.
//!
//! ⚠️ Readers are synchronous on purpose. Each one is owned by exactly one blocking thread for
//! its whole life. They are not thread-safe and they don't pretend to be. Once a reader says it's
//! done, it's done. There is no encore. 🦆

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::trace;

use crate::backends::HttpStoreConfig;
use crate::common::{ContentKind, Document, Record, Split, file_name_of, list_files};
use crate::counters::{self, Counters};
use crate::errors::PumpError;

pub(crate) mod aggregate;
pub(crate) mod archive;
pub(crate) mod compressed;
pub(crate) mod delimited;
pub(crate) mod raw;
pub(crate) mod store;

/// 🗂️ What the input files look like.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// one file, one document
    #[default]
    Documents,
    /// many records inside one big XML file
    #[serde(alias = "aggregate_xml")]
    Aggregates,
    /// CSV and its cousins
    #[serde(alias = "delimited")]
    DelimitedText,
    /// zip of metadata/content pairs, as written by an export
    Archive,
}

/// 🤐 How the input is squished.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    None,
    #[serde(alias = "zip")]
    Archive,
    Gzip,
}

/// 🏷️ The content kind to stamp on documents. `Mixed` means "figure it out per document".
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentKindSetting {
    Xml,
    Text,
    Binary,
    #[default]
    Mixed,
}

impl ContentKindSetting {
    pub(crate) fn fixed(&self) -> Option<ContentKind> {
        match self {
            ContentKindSetting::Xml => Some(ContentKind::Xml),
            ContentKindSetting::Text => Some(ContentKind::Text),
            ContentKindSetting::Binary => Some(ContentKind::Binary),
            ContentKindSetting::Mixed => None,
        }
    }
}

/// 🔧 Reader knobs. Old option names still work, because people have scripts.
#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    #[serde(default)]
    pub input_type: InputType,
    /// 📛 Local name of the element that makes up one record. None = first child of the root.
    #[serde(default, alias = "aggregate_record_element")]
    pub record_element_name: Option<String>,
    #[serde(default, alias = "aggregate_record_namespace")]
    pub record_namespace: Option<String>,
    /// 🔑 `@attr`, a child element name, or a column name. None = generated ids.
    #[serde(default, alias = "uri_id")]
    pub id_field_name: Option<String>,
    #[serde(default = "default_delimiter", alias = "delimiter")]
    pub delimiter_char: char,
    #[serde(default, alias = "input_compression_codec")]
    pub compression_codec: CompressionCodec,
    #[serde(default, alias = "archive_metadata_optional")]
    pub allow_empty_metadata: bool,
    #[serde(default, alias = "document_type")]
    pub content_kind: ContentKindSetting,
    #[serde(default, alias = "input_filename_as_collection")]
    pub filename_as_collection: bool,
    /// 🔍 Regex a file name must match in full to be read from a directory split.
    #[serde(default)]
    pub input_file_pattern: Option<String>,
    /// 📡 Credentials for exporting from a store. The URL comes from each split.
    #[serde(default)]
    pub source: Option<HttpStoreConfig>,
}

fn default_delimiter() -> char {
    ','
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            input_type: InputType::default(),
            record_element_name: None,
            record_namespace: None,
            id_field_name: None,
            delimiter_char: default_delimiter(),
            compression_codec: CompressionCodec::default(),
            allow_empty_metadata: false,
            content_kind: ContentKindSetting::default(),
            filename_as_collection: false,
            input_file_pattern: None,
            source: None,
        }
    }
}

impl InputConfig {
    /// 🔍 `input_file_pattern`, anchored so it has to match the whole file name.
    pub(crate) fn file_pattern(&self) -> Result<Option<Regex>> {
        let Some(pattern) = self.input_file_pattern.as_deref() else {
            return Ok(None);
        };
        let compiled = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            PumpError::config(format!("input_file_pattern '{pattern}' is not a valid regex: {e}"))
        })?;
        Ok(Some(compiled))
    }
}

/// 📦 The bits every reader needs: where it is, what it's holding, and its tally.
#[derive(Debug, Default)]
pub(crate) struct ReaderCore {
    pub(crate) split: Option<Split>,
    pub(crate) config: InputConfig,
    current: Option<Record>,
    counters: Counters,
    sequence: u64,
}

impl ReaderCore {
    pub(crate) fn begin(&mut self, split: &Split, config: &InputConfig) {
        self.split = Some(split.clone());
        self.config = config.clone();
        self.current = None;
        self.sequence = 0;
    }

    /// 🏷️ Name for log lines and errors.
    pub(crate) fn source_name(&self) -> String {
        self.split
            .as_ref()
            .map(Split::display_name)
            .unwrap_or_else(|| "<uninitialized>".to_string())
    }

    pub(crate) fn split_length(&self) -> u64 {
        self.split.as_ref().map(|s| s.length).unwrap_or(0)
    }

    /// 🔢 `<split-tag>-<n>`, n counting from 1 within this split.
    pub(crate) fn next_generated_id(&mut self) -> String {
        self.sequence += 1;
        let tag = self.split.as_ref().map(Split::tag).unwrap_or_default();
        format!("{tag}-{}", self.sequence)
    }

    /// ✅ Publish a record. Adds the file-name collection when asked to.
    pub(crate) fn emit(&mut self, uri: String, mut document: Document, source_file: Option<&Path>) {
        if let Some(file) = source_file.filter(|_| self.config.filename_as_collection) {
            document.metadata_mut().add_collection(file_name_of(file));
        }
        trace!(uri = %uri, bytes = document.content_len(), "📖 record ready");
        self.counters.incr(counters::READER, counters::RECORDS_READ, 1);
        self.current = Some((uri, document));
    }

    pub(crate) fn skip(&mut self) {
        self.counters.incr(counters::READER, counters::RECORDS_SKIPPED, 1);
    }

    pub(crate) fn clear(&mut self) {
        self.current = None;
    }
}

/// 📖 The common reader contract.
pub(crate) trait RecordReader: Send + std::fmt::Debug {
    fn core(&self) -> &ReaderCore;
    fn core_mut(&mut self) -> &mut ReaderCore;

    /// 🚀 Open the split. Must be called once before `advance`.
    fn initialize(&mut self, split: &Split, config: &InputConfig) -> Result<()>;

    /// ⏭️ `Ok(true)` = a new current record; `Ok(false)` = exhausted, permanently.
    fn advance(&mut self) -> Result<bool>;

    /// 📈 Fraction of the split consumed, in [0, 1].
    fn progress(&self) -> f32;

    fn close(&mut self) -> Result<()> {
        self.core_mut().clear();
        Ok(())
    }

    fn current_key(&self) -> Option<&str> {
        self.core().current.as_ref().map(|(uri, _)| uri.as_str())
    }

    fn current_value(&self) -> Option<&Document> {
        self.core().current.as_ref().map(|(_, doc)| doc)
    }

    fn take_current(&mut self) -> Option<Record> {
        self.core_mut().current.take()
    }

    fn take_counters(&mut self) -> Counters {
        std::mem::take(&mut self.core_mut().counters)
    }
}

/// 🎭 Which reader a job uses. Picked by the command plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    Aggregate,
    Delimited,
    CompressedDelimited,
    Archive,
    RawDocument,
    StoreDocument,
}

impl ReaderKind {
    /// 🏭 A fresh reader, initialized over `split`.
    pub(crate) fn open(&self, split: &Split, config: &InputConfig) -> Result<ReaderBackend> {
        let mut reader = match self {
            ReaderKind::Aggregate => ReaderBackend::Aggregate(Default::default()),
            ReaderKind::Delimited => ReaderBackend::Delimited(Default::default()),
            ReaderKind::CompressedDelimited => ReaderBackend::CompressedDelimited(Default::default()),
            ReaderKind::Archive => ReaderBackend::Archive(Default::default()),
            ReaderKind::RawDocument => ReaderBackend::RawDocument(Default::default()),
            ReaderKind::StoreDocument => ReaderBackend::StoreDocument(Default::default()),
        };
        if matches!(self, ReaderKind::StoreDocument) {
            reader.initialize(split, config)?;
        } else {
            reader.initialize(&split.as_whole_file()?, config)?;
        }
        Ok(reader)
    }

    /// 🚰 The records of one split as a plain iterator, for callers outside the scheduler.
    pub fn stream(&self, split: &Split, config: &InputConfig) -> Result<RecordStream> {
        Ok(RecordStream {
            reader: self.open(split, config)?,
            done: false,
        })
    }
}

/// 🚰 A lazy, non-restartable sequence of `(uri, Document)` records over one split.
/// The first error ends the stream.
#[derive(Debug)]
pub struct RecordStream {
    reader: ReaderBackend,
    done: bool,
}

impl RecordStream {
    /// 📈 How far through the split we are, in [0, 1].
    pub fn progress(&self) -> f32 {
        self.reader.progress()
    }

    /// 🧮 Records read and skipped so far. Taking them resets the tally.
    pub fn take_counters(&mut self) -> Counters {
        self.reader.take_counters()
    }
}

impl Iterator for RecordStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.reader.advance() {
                Ok(true) => {
                    if let Some(record) = self.reader.take_current() {
                        return Some(Ok(record));
                    }
                }
                Ok(false) => {
                    self.done = true;
                    if let Err(e) = self.reader.close() {
                        return Some(Err(e));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// 🎭 The many faces of a reader.
#[derive(Debug)]
pub(crate) enum ReaderBackend {
    Aggregate(aggregate::AggregateReader),
    Delimited(delimited::DelimitedReader),
    CompressedDelimited(compressed::CompressedDelimitedReader),
    Archive(archive::ArchiveReader),
    RawDocument(raw::RawDocumentReader),
    StoreDocument(store::StoreDocumentReader),
}

macro_rules! dispatch {
    ($self:expr, $reader:ident => $body:expr) => {
        match $self {
            ReaderBackend::Aggregate($reader) => $body,
            ReaderBackend::Delimited($reader) => $body,
            ReaderBackend::CompressedDelimited($reader) => $body,
            ReaderBackend::Archive($reader) => $body,
            ReaderBackend::RawDocument($reader) => $body,
            ReaderBackend::StoreDocument($reader) => $body,
        }
    };
}

impl RecordReader for ReaderBackend {
    fn core(&self) -> &ReaderCore {
        dispatch!(self, r => r.core())
    }

    fn core_mut(&mut self) -> &mut ReaderCore {
        dispatch!(self, r => r.core_mut())
    }

    fn initialize(&mut self, split: &Split, config: &InputConfig) -> Result<()> {
        dispatch!(self, r => r.initialize(split, config))
    }

    fn advance(&mut self) -> Result<bool> {
        dispatch!(self, r => r.advance())
    }

    fn progress(&self) -> f32 {
        dispatch!(self, r => r.progress())
    }

    fn close(&mut self) -> Result<()> {
        dispatch!(self, r => r.close())
    }
}

/// 📏 A `Read` that counts bytes on the way through, for progress.
#[derive(Debug)]
pub(crate) struct CountingRead<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R> CountingRead<R> {
    pub(crate) fn new(inner: R, consumed: Arc<AtomicU64>) -> Self {
        Self { inner, consumed }
    }
}

impl<R: Read> Read for CountingRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// 📂 The files a split covers, in walk order. Directory walks keep only the names that
/// match `input_file_pattern`; a split naming one file is read whatever it is called.
pub(crate) fn split_files(split: &Split, config: &InputConfig) -> Result<Vec<PathBuf>> {
    let pattern = config.file_pattern()?;
    let files = list_files(&split.path)
        .with_context(|| format!("💀 Could not list '{}'", split.path.display()))?;
    match pattern {
        Some(pattern) if !split.path.is_file() => Ok(files
            .into_iter()
            .filter(|file| pattern.is_match(&file_name_of(file)))
            .collect()),
        _ => Ok(files),
    }
}

/// Most we reserve up front for a zip entry. The header's size is a claim, not a promise.
pub(crate) const ENTRY_PREALLOC_LIMIT: usize = 1 << 20;

/// 🤐 Inflates one zip entry. `declared` only sizes the first allocation, capped.
pub(crate) fn read_entry(mut entry: impl Read, declared: u64) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(declared.min(ENTRY_PREALLOC_LIMIT as u64) as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// 📈 consumed / total, clamped. A zero-length split is done once it's exhausted.
pub(crate) fn fraction(consumed: u64, total: u64, exhausted: bool) -> f32 {
    if exhausted {
        return 1.0;
    }
    if total == 0 {
        return 0.0;
    }
    (consumed as f64 / total as f64).min(1.0) as f32
}

/// 🔍 Content kind from a file extension, for `Mixed` inputs.
pub(crate) fn kind_from_extension(path: &Path) -> ContentKind {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "xml" | "xsd" | "xsl" | "xslt" | "svg" => ContentKind::Xml,
        "txt" | "csv" | "tsv" | "json" | "md" | "html" | "htm" => ContentKind::Text,
        _ => ContentKind::Binary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_extensions_decide_the_dress_code() {
        assert_eq!(kind_from_extension(Path::new("a/b.XML")), ContentKind::Xml);
        assert_eq!(kind_from_extension(Path::new("notes.md")), ContentKind::Text);
        assert_eq!(kind_from_extension(Path::new("cat.jpg")), ContentKind::Binary);
        assert_eq!(kind_from_extension(Path::new("Makefile")), ContentKind::Binary);
    }

    #[test]
    fn the_one_where_a_zip_header_brags_about_its_size() -> Result<()> {
        let bytes = read_entry(std::io::Cursor::new(b"tiny".to_vec()), u64::MAX)?;
        assert_eq!(bytes, b"tiny");
        assert!(bytes.capacity() <= ENTRY_PREALLOC_LIMIT);
        Ok(())
    }

    #[test]
    fn the_one_where_progress_never_overshoots() {
        assert_eq!(fraction(50, 100, false), 0.5);
        assert_eq!(fraction(500, 100, false), 1.0);
        assert_eq!(fraction(0, 0, false), 0.0);
        assert_eq!(fraction(0, 0, true), 1.0);
    }

    #[test]
    fn the_one_where_a_split_becomes_a_plain_old_iterator() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rows.csv");
        std::fs::write(&path, "a,b\n1,2\n3\n5,6\n")?;
        let mut stream = ReaderKind::Delimited.stream(&Split::whole(&path)?, &InputConfig::default())?;
        let records: Vec<Record> = stream.by_ref().collect::<Result<_>>()?;
        assert_eq!(records.len(), 2);
        assert_eq!(stream.progress(), 1.0);
        assert!(stream.next().is_none(), "exhaustion is permanent");
        let counters = stream.take_counters();
        assert_eq!(counters.get(counters::READER, counters::RECORDS_SKIPPED), 1);
        Ok(())
    }

    #[test]
    fn the_one_where_half_a_file_is_not_a_split_we_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rows.csv");
        std::fs::write(&path, "id,v\n1,a\n2,b\n3,c\n")?;
        let config = InputConfig::default();
        for region in [Split::new(&path, 0, 8), Split::new(&path, 8, 8)] {
            let err = ReaderKind::Delimited.stream(&region, &config).err();
            let err = err.ok_or_else(|| anyhow::anyhow!("{region} should have been refused"))?;
            assert!(crate::errors::is_configuration_error(&err), "{err:#}");
        }
        let records = ReaderKind::Delimited
            .stream(&Split::new(&path, 0, 0), &config)?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(records.len(), 3, "a zero-length split means the whole file, read once");
        Ok(())
    }

    #[test]
    fn the_one_where_old_option_names_still_get_you_in() -> Result<()> {
        let config: InputConfig = toml::from_str(
            r#"
            input_type = "aggregate_xml"
            aggregate_record_element = "row"
            uri_id = "@id"
            delimiter = "|"
            input_compression_codec = "zip"
            document_type = "text"
            "#,
        )?;
        assert_eq!(config.input_type, InputType::Aggregates);
        assert_eq!(config.record_element_name.as_deref(), Some("row"));
        assert_eq!(config.id_field_name.as_deref(), Some("@id"));
        assert_eq!(config.delimiter_char, '|');
        assert_eq!(config.compression_codec, CompressionCodec::Archive);
        assert_eq!(config.content_kind, ContentKindSetting::Text);
        Ok(())
    }
}
