//! 🧭 The partition router: turns a partition map (or a host list) into connection handles.
//!
//! 🏎️ Fast path: one handle per distinct host, shared by every partition on that host.
//! A document's partition is `crc32(uri) % partitions`, over partitions in sorted order, so the
//! same URI lands on the same shard every run.
//!
//! 🔄 Otherwise: task `n` writes everything through host `n % hosts`, and the store places the
//! documents itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::backends::{ConnectionHandle, Connector};
use crate::errors::PumpError;

/// 🗺️ partition id → host.
pub(crate) type PartitionMap = BTreeMap<String, String>;

#[derive(Debug)]
enum Placement {
    Partitioned(Arc<[(String, Arc<ConnectionHandle>)]>),
    RoundRobin(Vec<Arc<ConnectionHandle>>),
}

/// 🧭 Owns the host → handle cache for the whole job.
#[derive(Debug)]
pub(crate) struct PartitionRouter {
    placement: Placement,
    handles: Vec<Arc<ConnectionHandle>>,
}

/// 🎯 Where one task's documents go.
#[derive(Debug, Clone)]
pub(crate) enum TaskRoute {
    Partitioned(Arc<[(String, Arc<ConnectionHandle>)]>),
    Whole(Arc<ConnectionHandle>),
}

impl TaskRoute {
    /// 🔍 The partition (fast path only) and handle for a URI.
    pub(crate) fn resolve(&self, uri: &str) -> (Option<&str>, &Arc<ConnectionHandle>) {
        match self {
            TaskRoute::Partitioned(partitions) => {
                let index = crc32fast::hash(uri.as_bytes()) as usize % partitions.len();
                let (partition, handle) = &partitions[index];
                (Some(partition.as_str()), handle)
            }
            TaskRoute::Whole(handle) => (None, handle),
        }
    }
}

/// 🔌 One handle per distinct host, connector called once per host.
fn connect_all<'a>(
    hosts: impl IntoIterator<Item = &'a String>,
    connector: &Connector,
    cache: &mut HashMap<String, Arc<ConnectionHandle>>,
    handles: &mut Vec<Arc<ConnectionHandle>>,
) -> Result<()> {
    for host in hosts {
        if cache.contains_key(host) {
            continue;
        }
        debug!(host = %host, "🔌 opening connection handle");
        let handle = Arc::new(ConnectionHandle::new(host.clone(), connector(host)?));
        cache.insert(host.clone(), Arc::clone(&handle));
        handles.push(handle);
    }
    Ok(())
}

impl PartitionRouter {
    pub(crate) fn new(
        fast_path: bool,
        partition_map: Option<&PartitionMap>,
        hosts: &[String],
        connector: &Connector,
    ) -> Result<Self> {
        let mut cache = HashMap::new();
        let mut handles = Vec::new();

        if fast_path {
            let Some(map) = partition_map.filter(|m| !m.is_empty()) else {
                return Err(PumpError::config("fast path needs a partition map with at least one partition").into());
            };
            connect_all(map.values(), connector, &mut cache, &mut handles)?;
            let partitions: Vec<(String, Arc<ConnectionHandle>)> = map
                .iter()
                .filter_map(|(partition, host)| cache.get(host).map(|h| (partition.clone(), Arc::clone(h))))
                .collect();
            info!(partitions = partitions.len(), hosts = handles.len(), "🏎️ fast path routing ready");
            return Ok(Self {
                placement: Placement::Partitioned(partitions.into()),
                handles,
            });
        }

        let mut round_robin: Vec<String> = hosts.to_vec();
        if round_robin.is_empty() {
            if let Some(map) = partition_map {
                for host in map.values() {
                    if !round_robin.contains(host) {
                        round_robin.push(host.clone());
                    }
                }
            }
        }
        if round_robin.is_empty() {
            return Err(PumpError::config("no destination hosts to write to").into());
        }
        connect_all(&round_robin, connector, &mut cache, &mut handles)?;
        let rotation = round_robin
            .iter()
            .filter_map(|host| cache.get(host).cloned())
            .collect();
        info!(hosts = handles.len(), "🔄 round-robin routing ready");
        Ok(Self {
            placement: Placement::RoundRobin(rotation),
            handles,
        })
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// 🔗 Every distinct handle, in the order they were opened.
    pub(crate) fn handles(&self) -> &[Arc<ConnectionHandle>] {
        &self.handles
    }

    pub(crate) fn route_for_task(&self, task_id: usize) -> TaskRoute {
        match &self.placement {
            Placement::Partitioned(partitions) => TaskRoute::Partitioned(Arc::clone(partitions)),
            Placement::RoundRobin(rotation) => {
                TaskRoute::Whole(Arc::clone(&rotation[task_id % rotation.len()]))
            }
        }
    }

    /// 🗑️ Close every handle. Keeps going past failures and reports the first one.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut first_failure = None;
        for handle in &self.handles {
            if let Err(e) = handle.close().await {
                warn!(host = %handle.host(), "⚠️ {e:#}");
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemoryStore;
    use crate::backends::{InMemoryStoreConfig, StoreBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_connector() -> (Connector, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let store = InMemoryStore::new(InMemoryStoreConfig::default());
        let connector: Connector = Arc::new(move |_host: &str| -> Result<StoreBackend> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(StoreBackend::InMemory(store.clone()))
        });
        (connector, calls)
    }

    fn map(pairs: &[(&str, &str)]) -> PartitionMap {
        pairs.iter().map(|(p, h)| (p.to_string(), h.to_string())).collect()
    }

    #[test]
    fn the_one_where_two_partitions_share_a_host_and_a_handle() -> Result<()> {
        let (connector, calls) = counting_connector();
        let partitions = map(&[("p1", "h1"), ("p2", "h1"), ("p3", "h2")]);
        let router = PartitionRouter::new(true, Some(&partitions), &[], &connector)?;

        assert_eq!(router.handle_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let TaskRoute::Partitioned(resolved) = router.route_for_task(0) else {
            panic!("💀 fast path should route by partition");
        };
        assert_eq!(resolved[0].0, "p1");
        assert!(Arc::ptr_eq(&resolved[0].1, &resolved[1].1), "p1 and p2 share h1's handle");
        assert!(!Arc::ptr_eq(&resolved[0].1, &resolved[2].1));
        Ok(())
    }

    #[test]
    fn the_one_where_the_same_uri_always_lands_on_the_same_partition() -> Result<()> {
        let (connector, _) = counting_connector();
        let partitions = map(&[("p1", "h1"), ("p2", "h2"), ("p3", "h3")]);
        let router = PartitionRouter::new(true, Some(&partitions), &[], &connector)?;
        let route = router.route_for_task(7);
        let expected = ["p1", "p2", "p3"][crc32fast::hash(b"/doc/42.xml") as usize % 3];
        for _ in 0..3 {
            assert_eq!(route.resolve("/doc/42.xml").0, Some(expected));
        }
        Ok(())
    }

    #[test]
    fn the_one_where_tasks_take_turns_around_the_hosts() -> Result<()> {
        let (connector, calls) = counting_connector();
        let hosts = vec!["h1".to_string(), "h2".to_string(), "h1".to_string()];
        let router = PartitionRouter::new(false, None, &hosts, &connector)?;
        assert_eq!(router.handle_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let host_of = |task| match router.route_for_task(task) {
            TaskRoute::Whole(handle) => handle.host().to_string(),
            TaskRoute::Partitioned(_) => panic!("💀 no partitions off the fast path"),
        };
        assert_eq!(host_of(0), "h1");
        assert_eq!(host_of(1), "h2");
        assert_eq!(host_of(4), "h2");
        assert_eq!(router.route_for_task(3).resolve("/x").0, None);
        Ok(())
    }

    #[test]
    fn the_one_where_fast_path_without_a_map_is_a_config_error() {
        let (connector, _) = counting_connector();
        let err = PartitionRouter::new(true, None, &["h1".to_string()], &connector)
            .expect_err("no map, no fast path");
        assert!(crate::errors::is_configuration_error(&err));
    }

    #[tokio::test]
    async fn the_one_where_closing_the_router_closes_each_handle_once() -> Result<()> {
        let store = InMemoryStore::new(InMemoryStoreConfig::default());
        let shared = store.clone();
        let connector: Connector = Arc::new(move |_host: &str| -> Result<StoreBackend> {
            Ok(StoreBackend::InMemory(shared.clone()))
        });
        let partitions = map(&[("p1", "h1"), ("p2", "h1"), ("p3", "h2")]);
        let router = PartitionRouter::new(true, Some(&partitions), &[], &connector)?;
        router.close().await?;
        router.close().await?;
        assert_eq!(store.stats().await.closes, 2, "one close per distinct host, ever");
        Ok(())
    }
}
