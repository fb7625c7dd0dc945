//! 📖 The ReaderWorker: one split, one reader, one blocking thread.
//!
//! The reader is synchronous and not thread-safe, so it gets a thread all to itself for its whole
//! life. Records go into the bounded queue with `send_blocking`; when the queue is full, this
//! thread waits, and that is the backpressure.

use anyhow::{Context, Result};
use async_channel::Sender;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Worker, WorkerOutcome};
use crate::common::{Record, Split};
use crate::counters::Counters;
use crate::progress::ProgressCell;
use crate::readers::{ReaderBackend, RecordReader};
use crate::supervisors::ReaderFactory;

pub(super) struct ReaderWorker {
    split: Split,
    readers: ReaderFactory,
    tx: Sender<Record>,
    cell: ProgressCell,
}

impl ReaderWorker {
    pub(super) fn new(split: Split, readers: ReaderFactory, tx: Sender<Record>, cell: ProgressCell) -> Self {
        Self {
            split,
            readers,
            tx,
            cell,
        }
    }

    fn pump(self) -> WorkerOutcome {
        let mut reader = match (self.readers)(&self.split)
            .with_context(|| format!("💀 Could not open a reader over '{}'", self.split))
        {
            Ok(reader) => reader,
            Err(e) => {
                self.tx.close();
                return WorkerOutcome {
                    counters: Counters::new(),
                    result: Err(e),
                };
            }
        };
        let result = self.feed(&mut reader);
        let closed = reader.close();
        // -- no more records: writers finish what's queued and stop
        self.tx.close();
        WorkerOutcome {
            counters: reader.take_counters(),
            result: result.and(closed),
        }
    }

    fn feed(&self, reader: &mut ReaderBackend) -> Result<()> {
        while reader
            .advance()
            .with_context(|| format!("💀 Reading '{}' went sideways", self.split))?
        {
            self.cell.set(reader.progress());
            let Some(record) = reader.take_current() else {
                continue;
            };
            if self.tx.send_blocking(record).is_err() {
                debug!(split = %self.split, "🚪 writers hung up; reader stops early");
                return Ok(());
            }
        }
        self.cell.set(reader.progress());
        Ok(())
    }
}

impl Worker for ReaderWorker {
    type Output = WorkerOutcome;

    fn start(self) -> JoinHandle<WorkerOutcome> {
        tokio::task::spawn_blocking(move || self.pump())
    }
}
