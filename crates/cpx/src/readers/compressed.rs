//! 🤐 Compressed delimited reader: the CSV reader, but first we unzip.
//!
//! Two shapes of squished input:
//! - a zip archive: every non-empty, non-directory entry gets a fresh parser (and its own
//!   header), and the split rolls from one entry to the next without a hiccup
//! - a gzip stream: one parser over the whole decompressed file
//!
//! 💀 Zip entries are read fully into memory one at a time. A single 20GB CSV inside a zip is
//! a lifestyle choice we support only in spirit. 🦆

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use tracing::debug;
use zip::ZipArchive;

use crate::common::Split;
use crate::errors::PumpError;
use crate::readers::delimited::{DelimitedParser, delimiter_byte, emit_next_row};
use crate::readers::{
    CompressionCodec, CountingRead, InputConfig, ReaderCore, RecordReader, fraction, read_entry,
};

enum Container {
    Zip {
        archive: ZipArchive<File>,
        next_entry: usize,
    },
    Gzip {
        stream: Option<Box<dyn Read + Send>>,
    },
}

/// 🔍 Explicit codec wins; otherwise the extension gets a vote.
fn codec_for(path: &Path, configured: CompressionCodec) -> Result<CompressionCodec> {
    if configured != CompressionCodec::None {
        return Ok(configured);
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "zip" => Ok(CompressionCodec::Archive),
        "gz" | "gzip" => Ok(CompressionCodec::Gzip),
        _ => Err(PumpError::config(format!(
            "'{}' is not a zip or gzip file and no compression codec was configured",
            path.display()
        ))
        .into()),
    }
}

/// 🤐 Delimited rows out of a zip or gzip file.
#[derive(Default)]
pub(crate) struct CompressedDelimitedReader {
    core: ReaderCore,
    container: Option<Container>,
    parser: Option<(PathBuf, DelimitedParser)>,
    entries_total: usize,
    file_consumed: Arc<AtomicU64>,
    exhausted: bool,
}

impl fmt::Debug for CompressedDelimitedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedDelimitedReader")
            .field("split", &self.core.split)
            .field("parser", &self.parser)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl CompressedDelimitedReader {
    /// 📦 The next stream to parse, with its name. `None` when the container is empty.
    fn next_stream(&mut self) -> Result<Option<(PathBuf, Box<dyn Read + Send>)>> {
        let split_path = self
            .core
            .split
            .as_ref()
            .map(|s| s.path.clone())
            .unwrap_or_default();
        match self.container.as_mut() {
            Some(Container::Zip { archive, next_entry }) => {
                while *next_entry < archive.len() {
                    let index = *next_entry;
                    *next_entry += 1;
                    let mut entry = archive.by_index(index).with_context(|| {
                        format!("💀 Entry {index} of '{}' is unreadable", split_path.display())
                    })?;
                    if entry.is_dir() || entry.size() == 0 {
                        continue;
                    }
                    let name = entry.name().to_string();
                    let declared = entry.size();
                    let bytes = read_entry(&mut entry, declared)
                        .map_err(|e| PumpError::stream(&name, format!("could not inflate entry: {e}")))?;
                    debug!(entry = %name, bytes = bytes.len(), "🤐 zip entry opened");
                    let stream: Box<dyn Read + Send> = Box::new(Cursor::new(bytes));
                    return Ok(Some((PathBuf::from(name), stream)));
                }
                Ok(None)
            }
            Some(Container::Gzip { stream }) => Ok(stream.take().map(|s| (split_path, s))),
            None => Ok(None),
        }
    }
}

impl RecordReader for CompressedDelimitedReader {
    fn core(&self) -> &ReaderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReaderCore {
        &mut self.core
    }

    fn initialize(&mut self, split: &Split, config: &InputConfig) -> Result<()> {
        self.core.begin(split, config);
        delimiter_byte(config.delimiter_char)?;
        let codec = codec_for(&split.path, config.compression_codec)?;
        let file = File::open(&split.path).with_context(|| {
            format!("💀 Could not open compressed input '{}'", split.path.display())
        })?;
        self.file_consumed = Arc::new(AtomicU64::new(0));
        self.container = Some(match codec {
            CompressionCodec::Archive => {
                let archive = ZipArchive::new(file).with_context(|| {
                    format!("💀 '{}' does not look like a zip archive", split.path.display())
                })?;
                self.entries_total = archive.len();
                Container::Zip {
                    archive,
                    next_entry: 0,
                }
            }
            _ => {
                let counted = CountingRead::new(BufReader::new(file), Arc::clone(&self.file_consumed));
                let stream: Box<dyn Read + Send> = Box::new(MultiGzDecoder::new(counted));
                Container::Gzip {
                    stream: Some(stream),
                }
            }
        });
        self.parser = None;
        self.exhausted = false;
        Ok(())
    }

    fn advance(&mut self) -> Result<bool> {
        self.core.clear();
        while !self.exhausted {
            if self.parser.is_none() {
                match self.next_stream()? {
                    Some((name, stream)) => {
                        let parser = DelimitedParser::new(stream, name.to_string_lossy(), &self.core.config)?;
                        self.parser = Some((name, parser));
                    }
                    None => {
                        self.exhausted = true;
                        break;
                    }
                }
            }
            if let Some((name, parser)) = self.parser.as_mut() {
                if emit_next_row(&mut self.core, parser, name.as_path())? {
                    return Ok(true);
                }
            }
            // -- this entry is spent; the next loop opens the next one
            self.parser = None;
        }
        Ok(false)
    }

    fn progress(&self) -> f32 {
        match &self.container {
            Some(Container::Zip { next_entry, .. }) if self.entries_total > 0 => {
                // -- the entry being parsed counts as half done
                let done = next_entry.saturating_sub(1) as f64;
                let partial = if self.parser.is_some() { 0.5 } else { 1.0 };
                let share = (done + partial) / self.entries_total as f64;
                if self.exhausted { 1.0 } else { share.min(1.0) as f32 }
            }
            _ => fraction(
                self.file_consumed.load(Ordering::Relaxed),
                self.core.split_length(),
                self.exhausted,
            ),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.parser = None;
        self.container = None;
        self.core.clear();
        Ok(())
    }
}
