//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all the credit in
//! the sprint retro.
//!
//! Three kinds, from the outside in:
//! - `UnitWorker`: a pool slot. Pulls `(task_id, split)` off the queue and runs the unit.
//! - `ReaderWorker`: owns one reader on a blocking thread and pushes its records into the queue.
//! - `WriterWorker`: drains the queue into its own `ContentWriter`.
//!
//! ⚠️ "If you're reading this, the code review went poorly."

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

use crate::common::Split;
use crate::counters::{self, Counters};
use crate::progress::ProgressCells;
use crate::supervisors::{ReaderFactory, WriterFactory};

mod reader_worker;
mod unit_worker;
mod writer_worker;

use reader_worker::ReaderWorker;
pub(super) use unit_worker::UnitWorker;
use writer_worker::WriterWorker;

/// 🏗️ A background worker, that does work. duh.
///
/// "What's the DEAL with lifetime annotations? You borrow something,
///  you give it back. It's not that hard, Jerry!", said Seinfeld, on Rust
pub(super) trait Worker {
    type Output: Send + 'static;

    /// 🚀 Start the worker. Returns a JoinHandle because we trust but verify.
    fn start(self) -> JoinHandle<Self::Output>;
}

/// 📊 What a reader or writer hands back: its tally, and whether it made it.
pub(super) struct WorkerOutcome {
    pub(super) counters: Counters,
    pub(super) result: Result<()>,
}

impl WorkerOutcome {
    fn crashed(join_err: JoinError) -> Self {
        Self {
            counters: Counters::new(),
            result: Err(anyhow::Error::new(join_err).context("💀 a worker thread crashed")),
        }
    }
}

/// 📦 Everything a unit needs, shared by every pool slot.
pub(in crate::supervisors) struct UnitContext {
    pub(in crate::supervisors) readers: ReaderFactory,
    pub(in crate::supervisors) writers: WriterFactory,
    pub(in crate::supervisors) threads: usize,
    pub(in crate::supervisors) queue_capacity: usize,
    pub(in crate::supervisors) cells: ProgressCells,
}

/// 📋 One unit's result, as told to the supervisor.
#[derive(Debug)]
pub(in crate::supervisors) struct UnitReport {
    pub(in crate::supervisors) task_id: usize,
    pub(in crate::supervisors) split: Split,
    pub(in crate::supervisors) counters: Counters,
    pub(in crate::supervisors) error: Option<String>,
}

/// 🚚 Run one split end to end. Never fails: a failure becomes part of the report.
pub(in crate::supervisors) async fn run_unit(ctx: &UnitContext, task_id: usize, split: Split) -> UnitReport {
    info!(task_id, split = %split, "🚚 unit started");
    let mut counters = Counters::new();
    let error = match drive_unit(ctx, task_id, &split, &mut counters).await {
        Ok(()) => {
            ctx.cells.cell(task_id).set(1.0);
            counters.incr(counters::JOB, counters::UNITS_SUCCEEDED, 1);
            info!(task_id, split = %split, "✅ unit finished");
            None
        }
        Err(e) => {
            counters.incr(counters::JOB, counters::UNITS_FAILED, 1);
            error!(task_id, split = %split, "💀 unit failed: {e:#}");
            Some(format!("{e:#}"))
        }
    };
    UnitReport {
        task_id,
        split,
        counters,
        error,
    }
}

/// 🔧 One reader thread, T writer tasks (or one inline writer when T is 0), one bounded queue.
async fn drive_unit(ctx: &UnitContext, task_id: usize, split: &Split, counters: &mut Counters) -> Result<()> {
    let (tx, rx) = async_channel::bounded(ctx.queue_capacity.max(1));
    let reader = ReaderWorker::new(split.clone(), Arc::clone(&ctx.readers), tx, ctx.cells.cell(task_id)).start();

    let writer_outcomes = if ctx.threads == 0 {
        vec![WriterWorker::new(rx, (ctx.writers)(task_id)).drain().await]
    } else {
        let handles: Vec<_> = (0..ctx.threads)
            .map(|_| WriterWorker::new(rx.clone(), (ctx.writers)(task_id)).start())
            .collect();
        drop(rx);
        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(WorkerOutcome::crashed))
            .collect()
    };
    let reader_outcome = reader.await.unwrap_or_else(WorkerOutcome::crashed);

    // -- the reader's error goes first: when it broke, the writers only saw the fallout
    let mut first_failure = None;
    for outcome in std::iter::once(reader_outcome).chain(writer_outcomes) {
        counters.merge(outcome.counters);
        if let Err(e) = outcome.result {
            first_failure.get_or_insert(e);
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
