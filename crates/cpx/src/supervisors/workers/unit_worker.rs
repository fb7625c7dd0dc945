//! 🧵 The UnitWorker: one pool slot. Takes the next unit off the queue until there are none.

use std::sync::Arc;

use async_channel::Receiver;
use tokio::task::JoinHandle;

use super::{UnitContext, UnitReport, Worker, run_unit};
use crate::common::Split;

pub(in crate::supervisors) struct UnitWorker {
    rx: Receiver<(usize, Split)>,
    ctx: Arc<UnitContext>,
}

impl UnitWorker {
    pub(in crate::supervisors) fn new(rx: Receiver<(usize, Split)>, ctx: Arc<UnitContext>) -> Self {
        Self { rx, ctx }
    }
}

impl Worker for UnitWorker {
    type Output = Vec<UnitReport>;

    fn start(self) -> JoinHandle<Vec<UnitReport>> {
        tokio::spawn(async move {
            let mut reports = Vec::new();
            while let Ok((task_id, split)) = self.rx.recv().await {
                reports.push(run_unit(&self.ctx, task_id, split).await);
            }
            reports
        })
    }
}
