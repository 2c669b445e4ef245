//! Request handlers.

pub mod health;
pub mod machines;
pub mod queues;
pub mod runner;

pub use health::*;
