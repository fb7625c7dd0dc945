//! 🚪 Preflight: the bouncer at the destination's door.
//!
//! Runs once, before any writer exists. Everything that can be a configuration error is
//! checked here, so a bad job fails before a single document moves:
//! - access grants must be well-formed (no I/O at all for that one)
//! - the fast path refuses a store that manages its own directories
//! - a destination prefix must be empty, unless we were told to clean it

use anyhow::Result;
use tracing::info;

use crate::backends::DirectoryCreation;
use crate::common::{AccessGrant, Capability};
use crate::errors::PumpError;
use crate::writers::{OutputConfig, PartitionRouter};

/// 🔒 `["reader", "read", "writer", "update"]` → two grants. Odd lengths and blank roles need not apply.
pub(crate) fn parse_grants(flat: &[String]) -> Result<Vec<AccessGrant>> {
    if flat.len() % 2 != 0 {
        return Err(PumpError::config(format!(
            "access grants come in role/capability pairs, got {} values",
            flat.len()
        ))
        .into());
    }
    flat.chunks(2)
        .map(|pair| -> Result<AccessGrant> {
            let role = pair[0].trim();
            if role.is_empty() {
                return Err(PumpError::config("access grant with an empty role name").into());
            }
            let capability: Capability = pair[1].parse()?;
            Ok(AccessGrant {
                role: role.to_string(),
                capability,
            })
        })
        .collect()
}

/// 📂 `/out` → `/out/`, so `/outbox/...` is a neighbour and not a resident.
pub(crate) fn directory_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// 🚪 Check every destination handle. Nothing is deleted until every check has passed.
pub(crate) async fn check_destination(router: &PartitionRouter, output: &OutputConfig, fast_path: bool) -> Result<()> {
    if fast_path {
        for handle in router.handles() {
            if handle.directory_creation().await? == DirectoryCreation::Automatic {
                return Err(PumpError::config(format!(
                    "fast path needs directory creation set to manual, but '{}' creates directories automatically",
                    handle.host()
                ))
                .into());
            }
        }
    }

    let Some(prefix) = output.destination_prefix.as_deref().map(directory_prefix) else {
        return Ok(());
    };
    let prefix = prefix.as_str();
    if output.clean_destination {
        for handle in router.handles() {
            info!(host = %handle.host(), prefix, "🧹 clearing destination");
            handle.delete_under(prefix).await?;
        }
        return Ok(());
    }
    for handle in router.handles() {
        let existing = handle.count_under(prefix).await?;
        if existing > 0 {
            return Err(PumpError::config(format!(
                "destination '{prefix}' on '{}' already holds {existing} documents; set clean_destination to replace them",
                handle.host()
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemoryStore;
    use crate::backends::{BulkEntry, Connector, InMemoryStoreConfig, StoreBackend};
    use crate::common::Document;
    use crate::errors::is_configuration_error;
    use std::sync::Arc;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn router_over(store: &InMemoryStore) -> Result<PartitionRouter> {
        let shared = store.clone();
        let connector: Connector = Arc::new(move |_host: &str| -> Result<StoreBackend> {
            Ok(StoreBackend::InMemory(shared.clone()))
        });
        let map = [("p1".to_string(), "h1".to_string())].into_iter().collect();
        PartitionRouter::new(true, Some(&map), &[], &connector)
    }

    #[test]
    fn the_one_where_grants_come_in_pairs_or_not_at_all() -> Result<()> {
        let grants = parse_grants(&strings(&["reader", "READ", "writer", "update"]))?;
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].capability, Capability::Read);
        assert_eq!(grants[1].role, "writer");

        for bad in [&["reader"][..], &["", "read"][..], &["reader", "admin"][..]] {
            let err = parse_grants(&strings(bad)).expect_err("malformed grants must be refused");
            assert!(is_configuration_error(&err), "{bad:?} should be a configuration error");
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_full_room_turns_us_away() -> Result<()> {
        let store = InMemoryStore::default();
        store.seed(vec![BulkEntry::new("/out/old", Document::default())]).await;
        let router = router_over(&store)?;
        let output = OutputConfig {
            destination_prefix: Some("/out".to_string()),
            ..Default::default()
        };
        let err = check_destination(&router, &output, false).await.expect_err("non-empty destination");
        assert!(is_configuration_error(&err));
        assert_eq!(store.documents().await.len(), 1, "nothing was touched");

        let cleaning = OutputConfig {
            clean_destination: true,
            ..output
        };
        check_destination(&router, &cleaning, false).await?;
        assert!(store.documents().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_neighbours_directory_is_none_of_our_business() -> Result<()> {
        let store = InMemoryStore::default();
        store.seed(vec![BulkEntry::new("/outbox/keep.xml", Document::default())]).await;
        let router = router_over(&store)?;
        let output = OutputConfig {
            destination_prefix: Some("/out".to_string()),
            ..Default::default()
        };
        check_destination(&router, &output, false).await?;

        let cleaning = OutputConfig {
            clean_destination: true,
            ..output
        };
        check_destination(&router, &cleaning, false).await?;
        let left: Vec<String> = store.documents().await.into_keys().collect();
        assert_eq!(left, vec!["/outbox/keep.xml"], "a sibling of the prefix survives the cleaning");
        Ok(())
    }

    #[test]
    fn the_one_where_prefixes_get_their_trailing_slash() {
        assert_eq!(directory_prefix("/out"), "/out/");
        assert_eq!(directory_prefix("/out/"), "/out/");
    }

    #[tokio::test]
    async fn the_one_where_fast_path_and_automatic_directories_do_not_mix() -> Result<()> {
        let store = InMemoryStore::new(InMemoryStoreConfig {
            directory_creation: DirectoryCreation::Automatic,
            ..Default::default()
        });
        let router = router_over(&store)?;
        let err = check_destination(&router, &OutputConfig::default(), true)
            .await
            .expect_err("automatic directories on the fast path");
        assert!(is_configuration_error(&err));
        check_destination(&router, &OutputConfig::default(), false).await?;
        Ok(())
    }
}
