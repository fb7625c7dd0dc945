//! 📦 The content writer: batches per destination, transactions around batches.
//!
//! One writer per writer thread, and nobody shares one. Each destination (a partition on the
//! fast path, a host otherwise) gets its own pending batch and its own open transaction.
//! Handles are shared, so two writers aimed at the same host take turns at the handle's gate.
//!
//! 💀 No retries. A failed submission rolls back its transaction and the unit hears about it
//! as a `PumpError::Write`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, warn};

use crate::backends::{BulkEntry, ConnectionHandle, TxId};
use crate::common::Document;
use crate::counters::{self, Counters};
use crate::errors::PumpError;
use crate::writers::Decoration;
use crate::writers::router::TaskRoute;

/// 🪣 One destination's pending work.
#[derive(Debug)]
struct Slot {
    handle: Arc<ConnectionHandle>,
    batch: Vec<BulkEntry>,
    txn: Option<TxId>,
    batches_in_txn: usize,
}

/// 🏷️ Keep an existing write error as-is, otherwise wrap the failure into one.
fn as_write_error(host: &str, err: anyhow::Error) -> anyhow::Error {
    let already_typed = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<PumpError>(), Some(PumpError::Write { .. })));
    if already_typed {
        err
    } else {
        PumpError::write(host, format!("{err:#}")).into()
    }
}

impl Slot {
    fn new(handle: Arc<ConnectionHandle>) -> Self {
        Self {
            handle,
            batch: Vec::new(),
            txn: None,
            batches_in_txn: 0,
        }
    }

    /// 🔙 Throw away the open transaction, if any. A rollback that fails too is only logged.
    async fn abort(&mut self, counters: &mut Counters) {
        self.batches_in_txn = 0;
        let Some(txn) = self.txn.take() else {
            return;
        };
        match self.handle.rollback(&txn).await {
            Ok(()) => {
                warn!(host = %self.handle.host(), txid = %txn, "🔙 transaction rolled back");
                counters.incr(counters::WRITER, counters::TRANSACTIONS_ROLLED_BACK, 1);
            }
            Err(e) => error!(host = %self.handle.host(), txid = %txn, "💀 rollback failed too: {e:#}"),
        }
    }

    async fn commit(&mut self, counters: &mut Counters) -> Result<()> {
        let Some(txn) = self.txn.clone() else {
            return Ok(());
        };
        if let Err(e) = self.handle.commit(&txn).await {
            self.abort(counters).await;
            return Err(as_write_error(self.handle.host(), e));
        }
        debug!(host = %self.handle.host(), txid = %txn, batches = self.batches_in_txn, "🧾 committed");
        self.txn = None;
        self.batches_in_txn = 0;
        counters.incr(counters::WRITER, counters::TRANSACTIONS_COMMITTED, 1);
        Ok(())
    }

    /// 📤 Submit the pending batch. Commits when the transaction is full.
    async fn flush(&mut self, transaction_size: usize, counters: &mut Counters) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let host = self.handle.host().to_string();

        if transaction_size <= 1 {
            self.handle
                .submit(None, &batch)
                .await
                .map_err(|e| as_write_error(&host, e))?;
            record_batch(&batch, counters);
            return Ok(());
        }

        let txn = match self.txn.clone() {
            Some(txn) => txn,
            None => {
                let txn = self
                    .handle
                    .open_transaction()
                    .await
                    .map_err(|e| as_write_error(&host, e))?;
                self.txn = Some(txn.clone());
                txn
            }
        };
        if let Err(e) = self.handle.submit(Some(&txn), &batch).await {
            self.abort(counters).await;
            return Err(as_write_error(&host, e));
        }
        record_batch(&batch, counters);
        self.batches_in_txn += 1;
        if self.batches_in_txn >= transaction_size {
            self.commit(counters).await?;
        }
        Ok(())
    }
}

fn record_batch(batch: &[BulkEntry], counters: &mut Counters) {
    let bytes: usize = batch.iter().map(|e| e.document.content_len()).sum();
    counters.incr(counters::WRITER, counters::BATCHES_SUBMITTED, 1);
    counters.incr(counters::WRITER, counters::DOCUMENTS_WRITTEN, batch.len() as u64);
    counters.incr(counters::WRITER, counters::BYTES_WRITTEN, bytes as u64);
}

/// ✍️ Takes decorated records, hands back counters when closed.
#[derive(Debug)]
pub(crate) struct ContentWriter {
    route: TaskRoute,
    decoration: Arc<Decoration>,
    batch_size: usize,
    transaction_size: usize,
    slots: BTreeMap<String, Slot>,
    counters: Counters,
}

impl ContentWriter {
    pub(crate) fn new(
        route: TaskRoute,
        decoration: Arc<Decoration>,
        batch_size: usize,
        transaction_size: usize,
    ) -> Self {
        Self {
            route,
            decoration,
            batch_size: batch_size.max(1),
            transaction_size: transaction_size.max(1),
            slots: BTreeMap::new(),
            counters: Counters::new(),
        }
    }

    /// ➕ Queue one document. Submits when its destination's batch fills up.
    pub(crate) async fn write(&mut self, uri: &str, document: Document) -> Result<()> {
        let (uri, document) = self.decoration.apply(uri, document);
        let (partition, handle) = self.route.resolve(&uri);
        let key = partition.unwrap_or_else(|| handle.host()).to_string();
        let mut entry = BulkEntry::new(uri, document);
        entry.partition = partition.map(str::to_string);
        let handle = Arc::clone(handle);

        let slot = self.slots.entry(key).or_insert_with(|| Slot::new(handle));
        slot.batch.push(entry);
        if slot.batch.len() >= self.batch_size {
            slot.flush(self.transaction_size, &mut self.counters).await?;
        }
        Ok(())
    }

    /// 🏁 Flush every partial batch and commit every open transaction. Every destination gets
    /// its chance even if an earlier one failed; the first failure is returned.
    pub(crate) async fn close(&mut self) -> Result<()> {
        let mut first_failure = None;
        for slot in self.slots.values_mut() {
            let outcome = match slot.flush(self.transaction_size, &mut self.counters).await {
                Ok(()) => slot.commit(&mut self.counters).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                error!(host = %slot.handle.host(), "💀 {e:#}");
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 🔙 Roll back whatever is open. Used when the unit is bailing out.
    pub(crate) async fn abandon(&mut self) {
        for slot in self.slots.values_mut() {
            slot.batch.clear();
            slot.abort(&mut self.counters).await;
        }
    }

    pub(crate) fn take_counters(&mut self) -> Counters {
        std::mem::take(&mut self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemoryStore;
    use crate::backends::{Connector, InMemoryStoreConfig, StoreBackend};
    use crate::common::ContentKind;
    use crate::counters::{BATCHES_SUBMITTED, DOCUMENTS_WRITTEN, TRANSACTIONS_COMMITTED, TRANSACTIONS_ROLLED_BACK, WRITER};
    use crate::writers::{OutputConfig, PartitionMap, PartitionRouter};

    fn memory() -> (InMemoryStore, Connector) {
        let store = InMemoryStore::new(InMemoryStoreConfig::default());
        let shared = store.clone();
        (store, Arc::new(move |_host: &str| -> Result<StoreBackend> {
            Ok(StoreBackend::InMemory(shared.clone()))
        }))
    }

    fn doc(body: &str) -> Document {
        Document::new(body.as_bytes().to_vec(), ContentKind::Text)
    }

    #[tokio::test]
    async fn the_one_where_batches_fill_transactions_and_close_mops_up() -> Result<()> {
        let (store, connector) = memory();
        let router = PartitionRouter::new(false, None, &["h1".to_string()], &connector)?;
        let mut writer = ContentWriter::new(router.route_for_task(0), Arc::default(), 2, 2);

        for n in 0..5 {
            writer.write(&format!("/d/{n}"), doc("x")).await?;
        }
        // -- two full batches = one full transaction, committed; the fifth doc is still pending
        assert_eq!(store.documents().await.len(), 4);
        writer.close().await?;
        assert_eq!(store.documents().await.len(), 5);

        let counters = writer.take_counters();
        assert_eq!(counters.get(WRITER, DOCUMENTS_WRITTEN), 5);
        assert_eq!(counters.get(WRITER, BATCHES_SUBMITTED), 3);
        assert_eq!(counters.get(WRITER, TRANSACTIONS_COMMITTED), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_batch_takes_its_transaction_down_with_it() -> Result<()> {
        let (store, connector) = memory();
        store.fail_submissions_after(1).await;
        let router = PartitionRouter::new(false, None, &["h1".to_string()], &connector)?;
        let mut writer = ContentWriter::new(router.route_for_task(0), Arc::default(), 1, 5);

        writer.write("/a", doc("a")).await?;
        let err = writer.write("/b", doc("b")).await.expect_err("second submission is doomed");
        assert!(matches!(err.downcast_ref::<PumpError>(), Some(PumpError::Write { .. })));

        assert!(store.documents().await.is_empty(), "the first batch was staged, then rolled back");
        assert_eq!(store.stats().await.rollbacks, 1);
        assert_eq!(writer.take_counters().get(WRITER, TRANSACTIONS_ROLLED_BACK), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_transaction_size_one_means_auto_commit() -> Result<()> {
        let (store, connector) = memory();
        let router = PartitionRouter::new(false, None, &["h1".to_string()], &connector)?;
        let mut writer = ContentWriter::new(router.route_for_task(0), Arc::default(), 1, 1);
        writer.write("/a", doc("a")).await?;
        assert_eq!(store.documents().await.len(), 1, "visible before close");
        writer.close().await?;
        assert_eq!(store.stats().await.commits, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_fast_path_documents_know_their_partition() -> Result<()> {
        let (store, connector) = memory();
        let partitions: PartitionMap = [("p1", "h1"), ("p2", "h2")]
            .iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect();
        let router = PartitionRouter::new(true, Some(&partitions), &[], &connector)?;
        let output = OutputConfig {
            destination_prefix: Some("/out".to_string()),
            ..Default::default()
        };
        let decoration = Arc::new(Decoration::new(&output, Vec::new(), false)?);
        let mut writer = ContentWriter::new(router.route_for_task(0), decoration, 10, 1);
        for n in 0..6 {
            writer.write(&format!("doc-{n}"), doc("x")).await?;
        }
        writer.close().await?;

        let stored = store.documents().await;
        assert_eq!(stored.len(), 6);
        for (uri, entry) in stored {
            assert!(uri.starts_with("/out/doc-"));
            let expected = ["p1", "p2"][crc32fast::hash(uri.as_bytes()) as usize % 2];
            assert_eq!(entry.partition.as_deref(), Some(expected));
        }
        Ok(())
    }
}
