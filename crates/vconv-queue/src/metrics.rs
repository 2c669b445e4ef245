//! Core coordination metrics.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const TASKS_CLAIMED_TOTAL: &str = "vconv_tasks_claimed_total";
    pub const CLAIM_CONFLICTS_TOTAL: &str = "vconv_claim_conflicts_total";
    pub const TASKS_FINISHED_TOTAL: &str = "vconv_tasks_finished_total";
    pub const TASKS_FAILED_TOTAL: &str = "vconv_tasks_failed_total";
    pub const HEARTBEATS_TOTAL: &str = "vconv_heartbeats_total";
    pub const TASKS_ENQUEUED_TOTAL: &str = "vconv_tasks_enqueued_total";
}

pub fn record_task_claimed() {
    counter!(names::TASKS_CLAIMED_TOTAL).increment(1);
}

/// A candidate was taken by another machine between peek and claim.
pub fn record_claim_conflict() {
    counter!(names::CLAIM_CONFLICTS_TOTAL).increment(1);
}

pub fn record_task_finished() {
    counter!(names::TASKS_FINISHED_TOTAL).increment(1);
}

pub fn record_task_failed() {
    counter!(names::TASKS_FAILED_TOTAL).increment(1);
}

pub fn record_heartbeat() {
    counter!(names::HEARTBEATS_TOTAL).increment(1);
}

pub fn record_task_enqueued(queue: &str) {
    let labels = [("queue", queue.to_string())];
    counter!(names::TASKS_ENQUEUED_TOTAL, &labels).increment(1);
}
