//! Task status histograms.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::TaskStatus;

/// Count of tasks per status. Every status is present, zeros included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskStats(BTreeMap<TaskStatus, u64>);

impl Default for TaskStats {
    fn default() -> Self {
        Self(TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect())
    }
}

impl TaskStats {
    /// Build from (status, count) pairs. Repeated statuses are summed.
    pub fn from_counts(counts: impl IntoIterator<Item = (TaskStatus, u64)>) -> Self {
        let mut stats = Self::default();
        for (status, count) in counts {
            *stats.0.entry(status).or_insert(0) += count;
        }
        stats
    }

    pub fn get(&self, status: TaskStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Tasks currently held by a machine.
    pub fn active(&self) -> u64 {
        self.0
            .iter()
            .filter(|(status, _)| status.is_active())
            .map(|(_, count)| count)
            .sum()
    }
}
