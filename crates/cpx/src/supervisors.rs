//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 *[dramatic orchestral music swells]*
//! 🎬 "In a world where splits pile up faster than anyone can read them..."
//! 🎬 "One supervisor dared to schedule them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor: sorts the splits biggest-first, hands them to a pool of W workers, and
//! inside each unit runs one reader thread feeding T writer tasks through a bounded queue.
//! When everyone is done it merges the counters and writes the report card.
//!
//! 💀 A unit that fails is logged, counted, and listed. Its siblings keep going. The job is not
//! cancelled because one split had a bad day.
//!
//! ⚠️ DO NOT MAKE THE WORKERS PUB EVER
//! 🔒 Like Fight Club, but for async tasks. First rule: you don't pub the workers.

mod workers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use futures::future::join_all;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::common::Split;
use crate::counters::{self, Counters};
use crate::progress::{ProgressCells, ProgressMonitor, format_duration};
use crate::readers::ReaderBackend;
use crate::writers::ContentWriter;
use workers::{UnitContext, UnitReport, UnitWorker, Worker, run_unit};

/// ⏳ How long the pool gets to wind down. Long enough for any real job, short enough that a
/// hang eventually turns into an error instead of a pension plan.
const POOL_SHUTDOWN_BOUND: Duration = Duration::from_secs(24 * 60 * 60);
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);
const MONITOR_GRACE: Duration = Duration::from_secs(1);

/// 🔧 Scheduler knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 🧵 W: how many splits run at once.
    #[serde(default = "default_worker_count", alias = "thread_count")]
    pub worker_count: usize,
    /// 🧵 T: writer tasks per split. 0 = the unit writes on its own.
    #[serde(default, alias = "thread_count_per_split")]
    pub per_split_thread_count: usize,
    /// 🧢 Clamp T to W/2 when more than one split is queued.
    #[serde(default = "default_thread_cap_enforced")]
    pub thread_cap_enforced: bool,
    /// 📬 Records buffered between a split's reader and its writers.
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    /// 📊 Draw a progress bar as well as logging.
    #[serde(default)]
    pub show_progress: bool,
}

fn default_worker_count() -> usize {
    4
}

fn default_thread_cap_enforced() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            per_split_thread_count: 0,
            thread_cap_enforced: default_thread_cap_enforced(),
            queue_capacity: default_queue_capacity(),
            show_progress: false,
        }
    }
}

/// 🏭 Opens (and initializes) a reader over one split. Called on the reader's own thread.
pub(crate) type ReaderFactory = Arc<dyn Fn(&Split) -> Result<ReaderBackend> + Send + Sync>;

/// 🏭 A fresh writer for a task id. One per writer task, never shared.
pub(crate) type WriterFactory = Arc<dyn Fn(usize) -> ContentWriter + Send + Sync>;

/// 💀 One unit that did not make it.
#[derive(Debug, Clone)]
pub struct FailedUnit {
    pub task_id: usize,
    pub split: Split,
    /// the whole error chain, `{:#}` style
    pub error: String,
}

/// 📋 The report card.
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub counters: Counters,
    pub failed_units: Vec<FailedUnit>,
    pub elapsed: Duration,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.failed_units.is_empty()
    }

    /// 🍽️ Counters table, elapsed time, and one line per casualty.
    pub fn render(&self) -> String {
        let mut out = self.counters.render();
        out.push_str(&format!("\nelapsed {}", format_duration(self.elapsed)));
        for failed in &self.failed_units {
            out.push_str(&format!("\nFAILED task {} ({}): {}", failed.task_id, failed.split, failed.error));
        }
        out
    }
}

/// 🧢 Per-split writer tasks after the cap: `W/2` when the cap is on, `T > W/2`, and there is
/// more than one split to share the pool with.
pub(crate) fn effective_threads(requested: usize, workers: usize, cap_enforced: bool, split_count: usize) -> usize {
    let half = workers / 2;
    if cap_enforced && requested > half && split_count > 1 {
        half
    } else {
        requested
    }
}

/// 📏 Largest first. The sort is stable, so ties keep their input order. Task ids follow the
/// sorted order.
pub(crate) fn schedule(mut splits: Vec<Split>) -> Vec<(usize, Split)> {
    splits.sort_by(|a, b| b.length.cmp(&a.length));
    splits.into_iter().enumerate().collect()
}

/// 📦 The Supervisor: because even async tasks need someone hovering over them
/// asking "is it done yet?" every second.
pub(crate) struct Supervisor {
    runtime: RuntimeConfig,
    readers: ReaderFactory,
    writers: WriterFactory,
}

impl Supervisor {
    pub(crate) fn new(runtime: RuntimeConfig, readers: ReaderFactory, writers: WriterFactory) -> Self {
        Self {
            runtime,
            readers,
            writers,
        }
    }

    /// 🚀 Run every split to completion (or failure) and merge the results.
    pub(crate) async fn run(&self, splits: Vec<Split>) -> Result<JobReport> {
        let started = Instant::now();
        let ordered = schedule(splits);
        let worker_count = self.runtime.worker_count.max(1);
        let threads = effective_threads(
            self.runtime.per_split_thread_count,
            worker_count,
            self.runtime.thread_cap_enforced,
            ordered.len(),
        );
        if threads != self.runtime.per_split_thread_count {
            warn!(
                requested = self.runtime.per_split_thread_count,
                effective = threads,
                "🧢 per-split threads capped so one split can't hog the pool"
            );
        }
        info!(units = ordered.len(), workers = worker_count, threads, "🚀 job starting");

        let cells = ProgressCells::new(ordered.len());
        let monitor = ProgressMonitor::spawn(cells.clone(), MONITOR_INTERVAL, self.runtime.show_progress);
        let ctx = Arc::new(UnitContext {
            readers: Arc::clone(&self.readers),
            writers: Arc::clone(&self.writers),
            threads,
            queue_capacity: self.runtime.queue_capacity,
            cells,
        });

        let reports = if worker_count == 1 {
            // -- no pool: one unit at a time, right here
            let mut reports = Vec::with_capacity(ordered.len());
            for (task_id, split) in ordered.iter().cloned() {
                reports.push(run_unit(&ctx, task_id, split).await);
            }
            Ok(reports)
        } else {
            self.run_pool(&ctx, &ordered, worker_count).await
        };
        monitor.shutdown(MONITOR_GRACE).await;
        let reports = reports?;

        let mut report = JobReport::default();
        for (task_id, split) in &ordered {
            if !reports.iter().any(|r| r.task_id == *task_id) {
                // -- its worker crashed before it could say anything
                report.counters.incr(counters::JOB, counters::UNITS_FAILED, 1);
                report.failed_units.push(FailedUnit {
                    task_id: *task_id,
                    split: split.clone(),
                    error: "unit never reported back".to_string(),
                });
            }
        }
        for unit in reports {
            report.counters.merge(unit.counters);
            if let Some(error) = unit.error {
                report.failed_units.push(FailedUnit {
                    task_id: unit.task_id,
                    split: unit.split,
                    error,
                });
            }
        }
        report.failed_units.sort_by_key(|f| f.task_id);
        report.elapsed = started.elapsed();
        info!(
            failed = report.failed_units.len(),
            elapsed = %format_duration(report.elapsed),
            "🏁 job finished"
        );
        Ok(report)
    }

    /// 🧵 W workers pull units off a queue in dispatch order.
    async fn run_pool(
        &self,
        ctx: &Arc<UnitContext>,
        ordered: &[(usize, Split)],
        worker_count: usize,
    ) -> Result<Vec<UnitReport>> {
        let (tx, rx) = async_channel::bounded(ordered.len().max(1));
        for unit in ordered.iter().cloned() {
            tx.send(unit)
                .await
                .map_err(|_| anyhow!("💀 the unit queue closed before the job even started"))?;
        }
        tx.close();

        let handles: Vec<_> = (0..worker_count.min(ordered.len().max(1)))
            .map(|_| UnitWorker::new(rx.clone(), Arc::clone(ctx)).start())
            .collect();
        drop(rx);

        let joined = tokio::time::timeout(POOL_SHUTDOWN_BOUND, join_all(handles))
            .await
            .map_err(|_| anyhow!("💀 the worker pool did not shut down within {POOL_SHUTDOWN_BOUND:?}"))?;
        let mut reports = Vec::with_capacity(ordered.len());
        for outcome in joined {
            match outcome {
                Ok(mut units) => reports.append(&mut units),
                Err(join_err) => error!("💀 a pool worker crashed: {join_err}"),
            }
        }
        Ok(reports)
    }
}
