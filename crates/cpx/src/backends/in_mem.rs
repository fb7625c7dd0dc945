//! 🧠 The in-memory store: a document database that fits in a `BTreeMap` and forgets
//! everything when the process exits. Like a goldfish with transactions.
//!
//! Used by tests and dry runs. It stages transactions properly, so a rollback really does
//! make documents un-happen, and it can be told to fail on cue so the rollback path gets
//! exercised without unplugging a real server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backends::{BulkEntry, ContentStore, DirectoryCreation, TxId};
use crate::errors::PumpError;

pub(crate) const MEMORY_HOST: &str = "memory";

/// 🔧 Knobs for the pretend store.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemoryStoreConfig {
    #[serde(default)]
    pub directory_creation: DirectoryCreation,
    /// 💣 Accept this many submissions, then refuse every one after. For rehearsing failures.
    #[serde(default)]
    pub fail_submissions_after: Option<u64>,
}

/// 📊 What happened to the goldfish, for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MemoryStats {
    pub(crate) submits: u64,
    pub(crate) commits: u64,
    pub(crate) rollbacks: u64,
    pub(crate) closes: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<String, BulkEntry>,
    staged: HashMap<TxId, Vec<BulkEntry>>,
    next_txid: u64,
    stats: MemoryStats,
    // -- 💣 submissions allowed before the store starts refusing them
    fail_after: Option<u64>,
    directory_creation: DirectoryCreation,
}

impl MemoryState {
    fn apply(&mut self, entries: Vec<BulkEntry>) {
        for entry in entries {
            match (entry.document.is_naked(), self.documents.get_mut(&entry.uri)) {
                // -- 👻 naked doc for a doc we already have: only the metadata moves in
                (true, Some(existing)) => existing.document.metadata = entry.document.metadata,
                _ => {
                    self.documents.insert(entry.uri.clone(), entry);
                }
            }
        }
    }
}

/// 🧠 Cheap to clone; every clone sees the same state.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemoryStore {
    state: Arc<tokio::sync::Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub(crate) fn new(config: InMemoryStoreConfig) -> Self {
        let state = MemoryState {
            directory_creation: config.directory_creation,
            fail_after: config.fail_submissions_after,
            ..Default::default()
        };
        Self {
            state: Arc::new(tokio::sync::Mutex::new(state)),
        }
    }

    /// 📸 A copy of everything committed, keyed by URI.
    #[cfg(test)]
    pub(crate) async fn documents(&self) -> BTreeMap<String, BulkEntry> {
        self.state.lock().await.documents.clone()
    }

    #[cfg(test)]
    pub(crate) async fn stats(&self) -> MemoryStats {
        self.state.lock().await.stats
    }

    /// 🌱 Pre-populate committed documents, for "the destination isn't empty" scenarios.
    #[cfg(test)]
    pub(crate) async fn seed(&self, entries: Vec<BulkEntry>) {
        self.state.lock().await.apply(entries);
    }

    /// 💣 Let `successes` submissions through, then fail every one after that.
    #[cfg(test)]
    pub(crate) async fn fail_submissions_after(&self, successes: u64) {
        self.state.lock().await.fail_after = Some(successes);
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn directory_creation(&self) -> Result<DirectoryCreation> {
        Ok(self.state.lock().await.directory_creation)
    }

    async fn count_under(&self, prefix: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.documents.keys().filter(|uri| uri.starts_with(prefix)).count() as u64)
    }

    async fn delete_under(&self, prefix: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.documents.retain(|uri, _| !uri.starts_with(prefix));
        Ok(())
    }

    async fn open_transaction(&self) -> Result<TxId> {
        let mut state = self.state.lock().await;
        state.next_txid += 1;
        let txn = TxId(format!("mem-{}", state.next_txid));
        state.staged.insert(txn.clone(), Vec::new());
        Ok(txn)
    }

    async fn submit(&self, txn: Option<&TxId>, batch: &[BulkEntry]) -> Result<()> {
        let mut state = self.state.lock().await;
        let submits = state.stats.submits;
        if state.fail_after.is_some_and(|limit| submits >= limit) {
            return Err(PumpError::write(MEMORY_HOST, "injected submission failure").into());
        }
        state.stats.submits += 1;
        trace!(docs = batch.len(), "🧠 memory store took a batch");
        match txn {
            Some(txn) => match state.staged.get_mut(txn) {
                Some(staged) => staged.extend_from_slice(batch),
                None => {
                    return Err(PumpError::write(MEMORY_HOST, format!("unknown transaction {txn}")).into());
                }
            },
            None => state.apply(batch.to_vec()),
        }
        Ok(())
    }

    async fn commit(&self, txn: &TxId) -> Result<()> {
        let mut state = self.state.lock().await;
        let staged = state
            .staged
            .remove(txn)
            .ok_or_else(|| PumpError::write(MEMORY_HOST, format!("commit of unknown transaction {txn}")))?;
        state.apply(staged);
        state.stats.commits += 1;
        Ok(())
    }

    async fn rollback(&self, txn: &TxId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.staged.remove(txn);
        state.stats.rollbacks += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.stats.closes += 1;
        let stats = state.stats;
        debug!(
            documents = state.documents.len(),
            submits = stats.submits,
            commits = stats.commits,
            rollbacks = stats.rollbacks,
            closes = stats.closes,
            "🧠 memory store handle closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ContentKind, Document};

    fn entry(uri: &str) -> BulkEntry {
        BulkEntry::new(uri, Document::new(uri.as_bytes().to_vec(), ContentKind::Text))
    }

    #[tokio::test]
    async fn the_one_where_a_rollback_makes_documents_unhappen() -> Result<()> {
        let store = InMemoryStore::default();
        let txn = store.open_transaction().await?;
        store.submit(Some(&txn), &[entry("/a"), entry("/b")]).await?;
        assert_eq!(store.count_under("/").await?, 0, "staged is not visible");
        store.rollback(&txn).await?;
        assert_eq!(store.count_under("/").await?, 0);

        let txn = store.open_transaction().await?;
        store.submit(Some(&txn), &[entry("/c")]).await?;
        store.commit(&txn).await?;
        assert_eq!(store.count_under("/").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_store_fails_on_cue() -> Result<()> {
        let store = InMemoryStore::default();
        store.fail_submissions_after(1).await;
        store.submit(None, &[entry("/ok")]).await?;
        let err = store.submit(None, &[entry("/nope")]).await.expect_err("second submit is rigged");
        assert!(matches!(err.downcast_ref::<PumpError>(), Some(PumpError::Write { .. })));
        assert_eq!(store.documents().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_config_can_rig_the_store_too() -> Result<()> {
        let store = InMemoryStore::new(InMemoryStoreConfig {
            fail_submissions_after: Some(0),
            ..Default::default()
        });
        assert!(store.submit(None, &[entry("/never")]).await.is_err());
        assert_eq!(store.stats().await.submits, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_prefix_deletion_spares_the_neighbours() -> Result<()> {
        let store = InMemoryStore::default();
        store.seed(vec![entry("/out/1"), entry("/out/2"), entry("/other/3")]).await;
        assert_eq!(store.count_under("/out/").await?, 2);
        store.delete_under("/out/").await?;
        assert_eq!(store.count_under("/").await?, 1);
        Ok(())
    }
}
