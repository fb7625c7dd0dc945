//! 🗃️ Archive reader: zips written by an export, read back in pairs.
//!
//! Entry layout, in archive order:
//! - `<uri>.metadata` (JSON) then `<uri>` (content): one document with its metadata
//! - `<uri>.naked` (JSON): metadata for a document whose bytes already live in the store
//!
//! Pairing is strict unless `allow_empty_metadata` is set. A content entry that shows up without
//! its metadata is logged and yields nothing, and the split carries on. 🦆

use std::fmt;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, warn};
use zip::ZipArchive;

use crate::common::{ContentKind, Document, DocumentMetadata, Split};
use crate::errors::PumpError;
use crate::readers::{InputConfig, ReaderCore, RecordReader, kind_from_extension, read_entry};

const METADATA_SUFFIX: &str = ".metadata";
const NAKED_SUFFIX: &str = ".naked";

/// 🏷️ `export-xml.zip` holds XML, `export-binary.zip` holds binary. Anything else: unknown.
fn kind_from_archive_name(path: &Path) -> Option<ContentKind> {
    let stem = path.file_stem()?.to_string_lossy().to_ascii_lowercase();
    if stem.ends_with("-xml") {
        Some(ContentKind::Xml)
    } else if stem.ends_with("-text") {
        Some(ContentKind::Text)
    } else if stem.ends_with("-binary") {
        Some(ContentKind::Binary)
    } else {
        None
    }
}

#[derive(Default)]
pub(crate) struct ArchiveReader {
    core: ReaderCore,
    archive: Option<ZipArchive<File>>,
    next_entry: usize,
    archive_kind: Option<ContentKind>,
    // -- metadata waiting for its content entry
    pending: Option<(String, DocumentMetadata)>,
    exhausted: bool,
}

impl fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("split", &self.core.split)
            .field("next_entry", &self.next_entry)
            .field("pending", &self.pending.as_ref().map(|(uri, _)| uri))
            .finish_non_exhaustive()
    }
}

fn parse_metadata(name: &str, bytes: &[u8]) -> Result<DocumentMetadata> {
    serde_json::from_slice(bytes)
        .map_err(|e| PumpError::stream(name, format!("metadata entry is not valid JSON: {e}")).into())
}

impl ArchiveReader {
    fn content_kind(&self, entry_name: &str) -> ContentKind {
        self.core
            .config
            .content_kind
            .fixed()
            .or(self.archive_kind)
            .unwrap_or_else(|| kind_from_extension(Path::new(entry_name)))
    }

    fn drop_stale_metadata(&mut self) {
        if let Some((uri, _)) = self.pending.take() {
            warn!(uri = %uri, "⚠️ metadata entry was never followed by its content; dropped");
            self.core.skip();
        }
    }
}

impl RecordReader for ArchiveReader {
    fn core(&self) -> &ReaderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReaderCore {
        &mut self.core
    }

    fn initialize(&mut self, split: &Split, config: &InputConfig) -> Result<()> {
        self.core.begin(split, config);
        let file = File::open(&split.path)
            .with_context(|| format!("💀 Could not open archive '{}'", split.path.display()))?;
        let archive = ZipArchive::new(file)
            .with_context(|| format!("💀 '{}' does not look like a zip archive", split.path.display()))?;
        self.archive = Some(archive);
        self.archive_kind = kind_from_archive_name(&split.path);
        self.next_entry = 0;
        self.pending = None;
        self.exhausted = false;
        Ok(())
    }

    fn advance(&mut self) -> Result<bool> {
        self.core.clear();
        if self.exhausted {
            return Ok(false);
        }
        let source = self.core.source_name();
        let split_path = self.core.split.as_ref().map(|s| s.path.clone()).unwrap_or_default();
        loop {
            let Some(archive) = self.archive.as_mut() else {
                return Err(PumpError::stream(source, "reader used before initialize").into());
            };
            if self.next_entry >= archive.len() {
                self.drop_stale_metadata();
                self.exhausted = true;
                return Ok(false);
            }
            let index = self.next_entry;
            self.next_entry += 1;
            let mut entry = archive
                .by_index(index)
                .with_context(|| format!("💀 Entry {index} of '{source}' is unreadable"))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let declared = entry.size();
            let bytes = read_entry(&mut entry, declared)
                .map_err(|e| PumpError::stream(&name, format!("could not inflate entry: {e}")))?;
            drop(entry);

            if let Some(uri) = name.strip_suffix(METADATA_SUFFIX) {
                self.drop_stale_metadata();
                match parse_metadata(&name, &bytes) {
                    Ok(metadata) => self.pending = Some((uri.to_string(), metadata)),
                    Err(e) => {
                        error!(entry = %name, "💀 {e:#}; entry skipped");
                        self.core.skip();
                    }
                }
                continue;
            }

            if let Some(uri) = name.strip_suffix(NAKED_SUFFIX) {
                self.drop_stale_metadata();
                match parse_metadata(&name, &bytes) {
                    Ok(metadata) => {
                        self.core.emit(uri.to_string(), Document::naked(metadata), Some(&split_path));
                        return Ok(true);
                    }
                    Err(e) => {
                        error!(entry = %name, "💀 {e:#}; entry skipped");
                        self.core.skip();
                        continue;
                    }
                }
            }

            let mut document = Document::new(bytes, self.content_kind(&name));
            match self.pending.take() {
                Some((uri, metadata)) if uri == name => document.metadata = Some(metadata),
                stale => {
                    if let Some((uri, _)) = stale {
                        warn!(uri = %uri, "⚠️ metadata entry was never followed by its content; dropped");
                        self.core.skip();
                    }
                    if !self.core.config.allow_empty_metadata {
                        error!(entry = %name, "💀 content entry has no metadata entry before it; skipped");
                        self.core.skip();
                        continue;
                    }
                }
            }
            self.core.emit(name, document, Some(&split_path));
            return Ok(true);
        }
    }

    fn progress(&self) -> f32 {
        match &self.archive {
            _ if self.exhausted => 1.0,
            Some(archive) if !archive.is_empty() => {
                (self.next_entry as f64 / archive.len() as f64).min(1.0) as f32
            }
            _ => 0.0,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.archive = None;
        self.pending = None;
        self.core.clear();
        Ok(())
    }
}
