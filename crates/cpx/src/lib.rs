//! 🚚 cpx: a content pump. Documents in, documents out, in big orderly batches.
//!
//! `run` is the whole job: plan, validate, route, schedule, report. Everything else in here is
//! a piece of that sentence.

pub mod app_config;
pub mod backends;
pub mod commands;
pub mod common;
pub mod counters;
pub mod errors;
pub(crate) mod progress;
pub mod readers;
pub mod supervisors;
pub mod writers;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

pub use app_config::{AppConfig, load_config};
pub use commands::{CommandKind, JobPlan, OptionSpec};
pub use errors::{PumpError, is_configuration_error};
pub use supervisors::{FailedUnit, JobReport, RuntimeConfig};

use crate::backends::{Connector, connector_for};
use crate::common::Split;
use crate::readers::ReaderKind;
use crate::supervisors::{ReaderFactory, Supervisor, WriterFactory};
use crate::writers::{ContentWriter, Decoration, PartitionRouter, preflight};

/// 🚀 Run one job to the end. Configuration errors come back as `Err` before any split runs;
/// failed units come back inside the report.
pub async fn run(config: AppConfig) -> Result<JobReport> {
    let connector = connector_for(&config.destination)?;
    run_with(config, connector).await
}

pub(crate) async fn run_with(config: AppConfig, connector: Connector) -> Result<JobReport> {
    let plan = config
        .command
        .plan(&config)
        .context("💀 The job plan didn't survive contact with the config")?;
    let splits = commands::collect_splits(&config)?;
    let grants = preflight::parse_grants(&config.output.access_grants)?;
    // -- copies and archives bring metadata of their own
    let source_metadata = matches!(plan.reader, ReaderKind::Archive | ReaderKind::StoreDocument);
    let decoration = Arc::new(Decoration::new(&config.output, grants, source_metadata)?);
    if splits.is_empty() {
        warn!("⚠️ no splits to process. A very fast job.");
    }

    let partition_map = config.partition_map.as_ref();
    let fast_path = config.output.fast_path(partition_map.is_some());
    let hosts = if config.hosts.is_empty() && partition_map.is_none() {
        config.destination.default_hosts()
    } else {
        config.hosts.clone()
    };
    let router = Arc::new(PartitionRouter::new(fast_path, partition_map, &hosts, &connector)?);
    info!(
        command = ?plan.command,
        reader = ?plan.reader,
        fast_path,
        hosts = router.handle_count(),
        "🗺️ job planned"
    );

    if let Err(e) = preflight::check_destination(&router, &config.output, fast_path).await {
        if let Err(close_err) = router.close().await {
            warn!("⚠️ {close_err:#}");
        }
        return Err(e.context("💀 The destination failed preflight"));
    }

    let readers: ReaderFactory = {
        let kind = plan.reader;
        let input = config.input.clone();
        Arc::new(move |split: &Split| kind.open(split, &input))
    };
    let writers: WriterFactory = {
        let router = Arc::clone(&router);
        let batch_size = config.output.batch_size;
        let transaction_size = config.output.transaction_size;
        Arc::new(move |task_id: usize| {
            ContentWriter::new(
                router.route_for_task(task_id),
                Arc::clone(&decoration),
                batch_size,
                transaction_size,
            )
        })
    };

    let report = Supervisor::new(config.runtime.clone(), readers, writers)
        .run(splits)
        .await;
    let closed = router.close().await;
    let report = report?;
    closed.context("💀 Closing the destination connections failed")?;
    Ok(report)
}
