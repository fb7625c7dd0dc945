//! 🔌 Backends: where the real I/O happens.
//!
//! 🏪 Every destination (and every store we export from) is a `ContentStore`: a thing that can
//! count, clear, take bulk batches, and play along with transactions. Three of them exist:
//! a networked store over HTTP, a directory on disk, and a pocket universe in RAM for tests.
//!
//! 🔗 A `ConnectionHandle` wraps one store for one host. Everybody writing to that host shares
//! the same handle, and the handle makes them take turns. One request in flight per host.
//! It's a single-lane bridge with a very polite traffic light.
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::errors::PumpError;

pub(crate) mod bulk;
pub(crate) mod file;
pub(crate) mod http;
pub(crate) mod in_mem;

pub(crate) use bulk::BulkEntry;
pub use file::FileStoreConfig;
pub use http::HttpStoreConfig;
pub use in_mem::InMemoryStoreConfig;

/// 📂 Whether the store creates directory entries on its own when documents land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryCreation {
    #[default]
    Manual,
    Automatic,
}

/// 🧾 A transaction id, as handed out by the store. Opaque. Treat it like a coat-check ticket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TxId(pub(crate) String);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 🏪 A place documents can live.
///
/// # Contract
/// - `submit` with `None` is auto-commit: visible when it returns `Ok`.
/// - `submit` with `Some(txn)` stages; nothing is visible until `commit(txn)`.
/// - `rollback` throws the staged work away. It must be safe to call on a half-failed txn.
/// - `close` is called exactly once, by the owning handle.
#[async_trait]
pub(crate) trait ContentStore: std::fmt::Debug {
    async fn directory_creation(&self) -> Result<DirectoryCreation>;
    async fn count_under(&self, prefix: &str) -> Result<u64>;
    async fn delete_under(&self, prefix: &str) -> Result<()>;
    async fn open_transaction(&self) -> Result<TxId>;
    async fn submit(&self, txn: Option<&TxId>, batch: &[BulkEntry]) -> Result<()>;
    async fn commit(&self, txn: &TxId) -> Result<()>;
    async fn rollback(&self, txn: &TxId) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// 🎭 The many faces of a store. Dispatches to the concrete one so nobody upstream has to care.
#[derive(Debug)]
pub(crate) enum StoreBackend {
    InMemory(in_mem::InMemoryStore),
    Http(http::HttpStore),
    File(file::FileStore),
}

#[async_trait]
impl ContentStore for StoreBackend {
    async fn directory_creation(&self) -> Result<DirectoryCreation> {
        match self {
            StoreBackend::InMemory(s) => s.directory_creation().await,
            StoreBackend::Http(s) => s.directory_creation().await,
            StoreBackend::File(s) => s.directory_creation().await,
        }
    }

    async fn count_under(&self, prefix: &str) -> Result<u64> {
        match self {
            StoreBackend::InMemory(s) => s.count_under(prefix).await,
            StoreBackend::Http(s) => s.count_under(prefix).await,
            StoreBackend::File(s) => s.count_under(prefix).await,
        }
    }

    async fn delete_under(&self, prefix: &str) -> Result<()> {
        match self {
            StoreBackend::InMemory(s) => s.delete_under(prefix).await,
            StoreBackend::Http(s) => s.delete_under(prefix).await,
            StoreBackend::File(s) => s.delete_under(prefix).await,
        }
    }

    async fn open_transaction(&self) -> Result<TxId> {
        match self {
            StoreBackend::InMemory(s) => s.open_transaction().await,
            StoreBackend::Http(s) => s.open_transaction().await,
            StoreBackend::File(s) => s.open_transaction().await,
        }
    }

    async fn submit(&self, txn: Option<&TxId>, batch: &[BulkEntry]) -> Result<()> {
        match self {
            StoreBackend::InMemory(s) => s.submit(txn, batch).await,
            StoreBackend::Http(s) => s.submit(txn, batch).await,
            StoreBackend::File(s) => s.submit(txn, batch).await,
        }
    }

    async fn commit(&self, txn: &TxId) -> Result<()> {
        match self {
            StoreBackend::InMemory(s) => s.commit(txn).await,
            StoreBackend::Http(s) => s.commit(txn).await,
            StoreBackend::File(s) => s.commit(txn).await,
        }
    }

    async fn rollback(&self, txn: &TxId) -> Result<()> {
        match self {
            StoreBackend::InMemory(s) => s.rollback(txn).await,
            StoreBackend::Http(s) => s.rollback(txn).await,
            StoreBackend::File(s) => s.rollback(txn).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            StoreBackend::InMemory(s) => s.close().await,
            StoreBackend::Http(s) => s.close().await,
            StoreBackend::File(s) => s.close().await,
        }
    }
}

/// 🎯 Where the documents go. Externally tagged in TOML:
///
/// ```toml
/// [destination.Http]
/// url = "http://store-1:8000"
/// ```
#[derive(Debug, Deserialize, Clone)]
pub enum DestinationConfig {
    Http(HttpStoreConfig),
    File(FileStoreConfig),
    InMemory(InMemoryStoreConfig),
}

impl Default for DestinationConfig {
    fn default() -> Self {
        DestinationConfig::InMemory(InMemoryStoreConfig::default())
    }
}

impl DestinationConfig {
    /// 🏠 The host names to use when nobody supplied a partition map or a host list.
    pub(crate) fn default_hosts(&self) -> Vec<String> {
        match self {
            DestinationConfig::Http(c) => vec![c.url.clone()],
            DestinationConfig::File(c) => vec![c.root.to_string_lossy().into_owned()],
            DestinationConfig::InMemory(_) => vec![in_mem::MEMORY_HOST.to_string()],
        }
    }
}

/// 🔌 Turns a host name into a fresh store backend. Called once per distinct host.
pub(crate) type Connector = Arc<dyn Fn(&str) -> Result<StoreBackend> + Send + Sync>;

/// 🏭 The connector for a configured destination.
///
/// An in-memory destination is one shared universe: every host name gets a view of the same store.
pub(crate) fn connector_for(destination: &DestinationConfig) -> Result<Connector> {
    let connector: Connector = match destination.clone() {
        DestinationConfig::Http(config) => Arc::new(move |host: &str| -> Result<StoreBackend> {
            let mut per_host = config.clone();
            per_host.url = host.to_string();
            Ok(StoreBackend::Http(http::HttpStore::new(per_host)?))
        }),
        DestinationConfig::File(config) => Arc::new(move |_host: &str| -> Result<StoreBackend> {
            Ok(StoreBackend::File(file::FileStore::new(config.clone())))
        }),
        DestinationConfig::InMemory(config) => {
            let shared = in_mem::InMemoryStore::new(config);
            Arc::new(move |_host: &str| -> Result<StoreBackend> {
                Ok(StoreBackend::InMemory(shared.clone()))
            })
        }
    };
    Ok(connector)
}

/// 🔗 One host, one store, one request at a time.
///
/// Shared behind an `Arc` by every partition and writer that targets this host. The `gate`
/// serializes requests; `closed` makes `close()` idempotent.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    host: String,
    store: StoreBackend,
    gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new(host: impl Into<String>, store: StoreBackend) -> Self {
        Self {
            host: host.into(),
            store,
            gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn directory_creation(&self) -> Result<DirectoryCreation> {
        let _turn = self.gate.lock().await;
        self.store
            .directory_creation()
            .await
            .with_context(|| format!("💀 Could not ask '{}' about its directory creation mode", self.host))
    }

    pub(crate) async fn count_under(&self, prefix: &str) -> Result<u64> {
        let _turn = self.gate.lock().await;
        self.store
            .count_under(prefix)
            .await
            .with_context(|| format!("💀 Could not count documents under '{prefix}' on '{}'", self.host))
    }

    pub(crate) async fn delete_under(&self, prefix: &str) -> Result<()> {
        let _turn = self.gate.lock().await;
        self.store
            .delete_under(prefix)
            .await
            .with_context(|| format!("💀 Could not clear '{prefix}' on '{}'", self.host))
    }

    pub(crate) async fn open_transaction(&self) -> Result<TxId> {
        let _turn = self.gate.lock().await;
        self.store.open_transaction().await
    }

    pub(crate) async fn submit(&self, txn: Option<&TxId>, batch: &[BulkEntry]) -> Result<()> {
        if self.is_closed() {
            return Err(PumpError::write(&self.host, "submission after the handle was closed").into());
        }
        let _turn = self.gate.lock().await;
        debug!(host = %self.host, docs = batch.len(), "📡 submitting batch");
        self.store.submit(txn, batch).await
    }

    pub(crate) async fn commit(&self, txn: &TxId) -> Result<()> {
        let _turn = self.gate.lock().await;
        self.store.commit(txn).await
    }

    pub(crate) async fn rollback(&self, txn: &TxId) -> Result<()> {
        let _turn = self.gate.lock().await;
        self.store.rollback(txn).await
    }

    /// 🗑️ Close the underlying store. The second caller gets a no-op and a clear conscience.
    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _turn = self.gate.lock().await;
        debug!(host = %self.host, "🗑️ closing connection handle");
        self.store
            .close()
            .await
            .with_context(|| format!("💀 Closing the connection to '{}' went badly", self.host))
    }
}
