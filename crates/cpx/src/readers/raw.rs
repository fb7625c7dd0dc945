//! 📄 Raw documents: one file in, one document out. The simplest reader, and the one used most.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::common::{Document, Split, file_name_of};
use crate::readers::{InputConfig, ReaderCore, RecordReader, fraction, kind_from_extension, split_files};

#[derive(Debug, Default)]
pub(crate) struct RawDocumentReader {
    core: ReaderCore,
    root: PathBuf,
    pending: VecDeque<PathBuf>,
    consumed: u64,
    exhausted: bool,
}

/// 🔗 `root/a/b.xml` → `a/b.xml`. A split over a single file is just that file's name.
fn uri_for(root: &Path, file: &Path) -> String {
    match file.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        _ => file_name_of(file),
    }
}

impl RecordReader for RawDocumentReader {
    fn core(&self) -> &ReaderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReaderCore {
        &mut self.core
    }

    fn initialize(&mut self, split: &Split, config: &InputConfig) -> Result<()> {
        self.core.begin(split, config);
        self.root = split.path.clone();
        self.pending = split_files(split, config)?.into();
        self.consumed = 0;
        self.exhausted = false;
        Ok(())
    }

    fn advance(&mut self) -> Result<bool> {
        self.core.clear();
        let Some(file) = self.pending.pop_front() else {
            self.exhausted = true;
            return Ok(false);
        };
        let bytes = std::fs::read(&file)
            .with_context(|| format!("💀 Could not read document '{}'", file.display()))?;
        self.consumed += bytes.len() as u64;
        let kind = self
            .core
            .config
            .content_kind
            .fixed()
            .unwrap_or_else(|| kind_from_extension(&file));
        let uri = uri_for(&self.root, &file);
        self.core.emit(uri, Document::new(bytes, kind), Some(&file));
        Ok(true)
    }

    fn progress(&self) -> f32 {
        fraction(self.consumed, self.core.split_length(), self.exhausted)
    }

    fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.core.clear();
        Ok(())
    }
}
