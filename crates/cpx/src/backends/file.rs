//! 📂 The directory store: where exported documents come home to roost as plain files.
//!
//! A document with URI `/books/moby.xml` lands at `<root>/books/moby.xml`. Parent directories
//! are made on demand. Transactions are a polite fiction here: the disk has no rollback
//! button, so open/commit/rollback just nod and move on.
//!
//! 👻 Naked documents (metadata only) have no bytes to write. We log them and keep walking.
//! 💀 Disk full → your problem now
//! 🦆 (mandatory, no notes)

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backends::{BulkEntry, ContentStore, DirectoryCreation, TxId};
use crate::common::list_files;
use crate::errors::PumpError;

/// 🔧 Where on disk the documents should land.
#[derive(Debug, Deserialize, Clone)]
pub struct FileStoreConfig {
    #[serde(alias = "output_dir")]
    pub root: PathBuf,
}

#[derive(Debug)]
pub(crate) struct FileStore {
    config: FileStoreConfig,
}

impl FileStore {
    pub(crate) fn new(config: FileStoreConfig) -> Self {
        Self { config }
    }

    /// 🗺️ URI → path under the root. `..` is not a direction we travel in.
    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let relative = Path::new(uri.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || relative.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(PumpError::write(
                self.config.root.to_string_lossy(),
                format!("URI '{uri}' does not name a file under the export root"),
            )
            .into());
        }
        Ok(self.config.root.join(relative))
    }

    /// 📋 Every stored file with its URI, optionally filtered by URI prefix.
    async fn stored_under(&self, prefix: &str) -> Result<Vec<PathBuf>> {
        let root = self.config.root.clone();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let prefix = prefix.to_string();
        let listing = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<PathBuf>> {
            let files = list_files(&root)?;
            Ok(files
                .into_iter()
                .filter(|file| uri_of(&root, file).starts_with(&prefix))
                .collect())
        })
        .await
        .context("💀 The directory walker thread went out for milk")?;
        listing.with_context(|| format!("💀 Could not list '{}'", self.config.root.display()))
    }
}

fn uri_of(root: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let joined: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("/{}", joined.join("/"))
}

#[async_trait]
impl ContentStore for FileStore {
    async fn directory_creation(&self) -> Result<DirectoryCreation> {
        Ok(DirectoryCreation::Manual)
    }

    async fn count_under(&self, prefix: &str) -> Result<u64> {
        Ok(self.stored_under(prefix).await?.len() as u64)
    }

    async fn delete_under(&self, prefix: &str) -> Result<()> {
        for file in self.stored_under(prefix).await? {
            tokio::fs::remove_file(&file)
                .await
                .with_context(|| format!("💀 Could not delete '{}'", file.display()))?;
        }
        Ok(())
    }

    async fn open_transaction(&self) -> Result<TxId> {
        Ok(TxId("file".to_string()))
    }

    async fn submit(&self, _txn: Option<&TxId>, batch: &[BulkEntry]) -> Result<()> {
        for entry in batch {
            let Some(content) = &entry.document.content else {
                warn!(uri = %entry.uri, "👻 naked document has no bytes to write to disk; skipped");
                continue;
            };
            let path = self.path_for(&entry.uri)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("💀 Could not create '{}'", parent.display()))?;
            }
            tokio::fs::write(&path, content).await.map_err(|e| {
                PumpError::write(
                    self.config.root.to_string_lossy(),
                    format!("writing '{}': {e}", path.display()),
                )
            })?;
        }
        debug!(docs = batch.len(), root = %self.config.root.display(), "📂 batch written to disk");
        Ok(())
    }

    async fn commit(&self, _txn: &TxId) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, _txn: &TxId) -> Result<()> {
        // -- the bytes are already on disk. we can only apologise.
        warn!(root = %self.config.root.display(), "⚠️ rollback requested on a directory store; files already written stay");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ContentKind, Document, DocumentMetadata};

    #[tokio::test]
    async fn the_one_where_uris_become_paths_and_ghosts_are_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(FileStoreConfig { root: dir.path().to_path_buf() });
        store
            .submit(None, &[
                BulkEntry::new("/books/moby.xml", Document::new(b"<whale/>".to_vec(), ContentKind::Xml)),
                BulkEntry::new("/ghost", Document::naked(DocumentMetadata::default())),
            ])
            .await?;
        assert_eq!(std::fs::read(dir.path().join("books").join("moby.xml"))?, b"<whale/>");
        assert!(!dir.path().join("ghost").exists());
        assert_eq!(store.count_under("/books/").await?, 1);
        store.delete_under("/books/").await?;
        assert_eq!(store.count_under("/").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_dot_dot_is_not_a_direction() {
        let store = FileStore::new(FileStoreConfig { root: PathBuf::from("/tmp/nowhere") });
        let escape = BulkEntry::new("/../etc/passwd", Document::new(b"x".to_vec(), ContentKind::Text));
        assert!(store.submit(None, &[escape]).await.is_err());
    }
}
