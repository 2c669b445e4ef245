//! Shared data models for the vconv coordinator.
//!
//! This crate provides Serde-serializable types for:
//! - Queues and the tasks they hold
//! - Task status and pipeline stages
//! - Worker machines and client API tokens
//! - Liveness derivation from heartbeats
//! - Task status histograms

pub mod ids;
pub mod liveness;
pub mod machine;
pub mod queue;
pub mod stats;
pub mod task;
pub mod token;

// Re-export common types
pub use ids::{MachineId, QueueId, TaskId};
pub use liveness::{is_online, uptime_secs, STALE_WINDOW_SECS};
pub use machine::{Machine, MachineDetails, MachineSummary};
pub use queue::Queue;
pub use stats::TaskStats;
pub use task::{ParseStatusError, Stage, Task, TaskStatus, TerminalOutcome};
pub use token::ApiToken;
