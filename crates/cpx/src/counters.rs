//! 🧮 Counters: named groups of named numbers, merged at the end like a potluck.
//!
//! Every worker keeps its own `Counters`, nobody shares, nobody locks. When the job is done the
//! scheduler folds them all into one and prints a table. Append-only while running,
//! read-only afterwards. Like a guest book. 🦆

use std::collections::BTreeMap;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};

use crate::progress::format_number;

// 📛 group names
pub const READER: &str = "reader";
pub const WRITER: &str = "writer";
pub const JOB: &str = "job";

// 📛 metric names
pub const RECORDS_READ: &str = "records_read";
pub const RECORDS_SKIPPED: &str = "records_skipped";
pub const DOCUMENTS_WRITTEN: &str = "documents_written";
pub const BYTES_WRITTEN: &str = "bytes_written";
pub const BATCHES_SUBMITTED: &str = "batches_submitted";
pub const TRANSACTIONS_COMMITTED: &str = "transactions_committed";
pub const TRANSACTIONS_ROLLED_BACK: &str = "transactions_rolled_back";
pub const UNITS_SUCCEEDED: &str = "units_succeeded";
pub const UNITS_FAILED: &str = "units_failed";

/// 📊 group name → metric name → value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    groups: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, group: &str, name: &str, by: u64) {
        *self
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert(0) += by;
    }

    /// 🔍 Zero if nobody ever counted it. Absence of evidence is evidence of zero.
    pub fn get(&self, group: &str, name: &str) -> u64 {
        self.groups
            .get(group)
            .and_then(|metrics| metrics.get(name))
            .copied()
            .unwrap_or(0)
    }

    /// 🔄 Fold another worker's counters into ours. Addition: the only merge strategy with no conflicts.
    pub fn merge(&mut self, other: Counters) {
        for (group, metrics) in other.groups {
            let ours = self.groups.entry(group).or_default();
            for (name, value) in metrics {
                *ours.entry(name).or_insert(0) += value;
            }
        }
    }

    pub fn groups(&self) -> &BTreeMap<String, BTreeMap<String, u64>> {
        &self.groups
    }

    /// 🍽️ A borderless comfy table: one row per metric, grouped.
    pub fn render(&self) -> String {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        for (group, metrics) in &self.groups {
            for (name, value) in metrics {
                table.add_row(vec![
                    Cell::new(group),
                    Cell::new(name),
                    Cell::new(format_number(*value)).set_alignment(CellAlignment::Right),
                ]);
            }
        }
        table.to_string()
    }
}
