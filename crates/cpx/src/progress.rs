//! 📊 progress.rs: "Are we there yet?", said every pipeline, every time, forever.
//!
//! 🚀 Each in-flight split owns one `ProgressCell`: a lock-free fraction its worker scribbles on
//! after every record. The `ProgressMonitor` wakes once a second, averages all the cells, and
//! logs a line only when the number actually moved. No spam. We have standards.
//!
//! ⚠️  Warning: Watching this progress bar will not make it go faster.
//! Neither will refreshing it. We've tried. Science says no.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// 🔢 Formats a number with commas for the 3 people in the audience who like readability.
/// "1000000 docs" → "1,000,000 docs". You're welcome, eyes.
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    // -- 🧵 pre-allocate like we know what we're doing (we do, we read the book)
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ Formats a Duration into MM:SS or HH:MM:SS.
/// If it shows HH:MM:SS, you should probably call your mom. It's been a while.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 📦 One atomic fraction per split. f32 bits in an `AtomicU32`, because atomics don't do floats
/// and we don't do locks.
#[derive(Debug, Clone)]
pub struct ProgressCells {
    cells: Arc<[AtomicU32]>,
}

impl ProgressCells {
    pub fn new(count: usize) -> Self {
        let cells: Vec<AtomicU32> = (0..count).map(|_| AtomicU32::new(0)).collect();
        Self {
            cells: Arc::from(cells),
        }
    }

    /// ✍️ The writable view for split `index`. Only that split's worker should hold it.
    pub fn cell(&self, index: usize) -> ProgressCell {
        ProgressCell {
            cells: Arc::clone(&self.cells),
            index,
        }
    }

    /// 📈 Mean of all cells. An empty job is, philosophically, finished.
    pub fn mean(&self) -> f64 {
        if self.cells.is_empty() {
            return 1.0;
        }
        let total: f64 = self
            .cells
            .iter()
            .map(|cell| f32::from_bits(cell.load(Ordering::Relaxed)) as f64)
            .sum();
        total / self.cells.len() as f64
    }
}

/// ✍️ A single split's progress, clamped to [0, 1].
#[derive(Debug, Clone)]
pub struct ProgressCell {
    cells: Arc<[AtomicU32]>,
    index: usize,
}

impl ProgressCell {
    pub fn set(&self, fraction: f32) {
        let clamped = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        if let Some(cell) = self.cells.get(self.index) {
            cell.store(clamped.to_bits(), Ordering::Relaxed);
        }
    }
}

fn progress_line(fraction: f64) -> String {
    format!("completed {:.0}%", fraction * 100.0)
}

/// 👀 The background watcher. Wakes on an interval, logs on change, stops when told.
pub(crate) struct ProgressMonitor {
    stop: Arc<Notify>,
    handle: JoinHandle<Option<String>>,
}

impl ProgressMonitor {
    /// 🚀 Spawn the watcher. `show_bar` adds an indicatif bar on top of the log lines.
    pub(crate) fn spawn(cells: ProgressCells, interval: Duration, show_bar: bool) -> Self {
        let stop = Arc::new(Notify::new());
        let bar = if show_bar {
            let bar = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
                bar.set_style(style.progress_chars("=>-"));
            }
            bar
        } else {
            ProgressBar::hidden()
        };
        let handle = tokio::spawn(watch(cells, interval, bar, Arc::clone(&stop)));
        Self { stop, handle }
    }

    /// 🛑 Interrupt and join, waiting at most `grace`. Returns the last line reported.
    pub(crate) async fn shutdown(self, grace: Duration) -> Option<String> {
        // -- notify_one stores a permit, so this lands even if the watcher is mid-report
        self.stop.notify_one();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(grace, self.handle).await {
            Ok(Ok(last)) => last,
            Ok(Err(join_err)) => {
                warn!("⚠️ progress monitor ended badly: {join_err}");
                None
            }
            Err(_) => {
                warn!("⚠️ progress monitor ignored the stop signal for {:?}; aborting it", grace);
                abort.abort();
                None
            }
        }
    }
}

async fn watch(
    cells: ProgressCells,
    interval: Duration,
    bar: ProgressBar,
    stop: Arc<Notify>,
) -> Option<String> {
    let mut last: Option<String> = None;
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = tokio::time::sleep(interval) => report(&cells, &bar, &mut last),
        }
    }
    // -- 🏁 one last look before the lights go off
    report(&cells, &bar, &mut last);
    bar.finish();
    last
}

fn report(cells: &ProgressCells, bar: &ProgressBar, last: &mut Option<String>) {
    let fraction = cells.mean();
    let line = progress_line(fraction);
    if last.as_deref() != Some(line.as_str()) {
        info!("📊 {line}");
        bar.set_position((fraction * 100.0) as u64);
        bar.set_message(line.clone());
        *last = Some(line);
    }
}
