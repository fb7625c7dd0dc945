//! 🎬 *[a queue fills with records. somewhere, a writer waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🗑️ The WriterWorker, patient, tireless, and deeply unbothered by the chaos happening
//! upstream. It receives records. It writes records. It asks no questions.
//!
//! When the queue is empty and closed it flushes and commits. When a write fails it rolls back
//! what it had open and closes the queue, so the reader stops feeding a writer that isn't there.

use anyhow::Result;
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Worker, WorkerOutcome};
use crate::common::Record;
use crate::writers::ContentWriter;

#[derive(Debug)]
pub(super) struct WriterWorker {
    rx: Receiver<Record>,
    writer: ContentWriter,
}

impl WriterWorker {
    pub(super) fn new(rx: Receiver<Record>, writer: ContentWriter) -> Self {
        Self { rx, writer }
    }

    /// 🚰 Drain in the current task. `start` is this, spawned.
    pub(super) async fn drain(mut self) -> WorkerOutcome {
        let result = match self.consume().await {
            Ok(()) => self.writer.close().await,
            Err(e) => {
                self.rx.close();
                self.writer.abandon().await;
                Err(e)
            }
        };
        WorkerOutcome {
            counters: self.writer.take_counters(),
            result,
        }
    }

    async fn consume(&mut self) -> Result<()> {
        loop {
            match self.rx.recv().await {
                Ok((uri, document)) => self.writer.write(&uri, document).await?,
                Err(_) => {
                    // Queue is empty and closed
                    debug!("🏁 WriterWorker: queue closed. Flushing.");
                    return Ok(());
                }
            }
        }
    }
}

impl Worker for WriterWorker {
    type Output = WorkerOutcome;

    fn start(self) -> JoinHandle<WorkerOutcome> {
        tokio::spawn(self.drain())
    }
}
