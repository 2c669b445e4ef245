//! Coordination core for the vconv fleet.
//!
//! This crate provides:
//! - [`Dispatcher`]: priority-ordered, exclusive task assignment
//! - [`TaskLifecycle`]: owner-checked stage reports and terminal transitions
//! - [`FleetService`]: heartbeats, registration and machine views
//! - [`QueueService`]: queue administration and enqueueing
//!
//! None of these hold in-process locks; every state-dependent mutation is a
//! single conditional operation of the [`vconv_store::Store`].

pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod metrics;
pub mod queues;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::Dispatcher;
pub use error::{CoordResult, CoordinatorError};
pub use fleet::{FleetService, MachineStats};
pub use lifecycle::TaskLifecycle;
pub use queues::QueueService;

use std::sync::Arc;

use vconv_store::Store;

/// Every coordination service, sharing one store and clock.
#[derive(Clone)]
pub struct Coordinator {
    pub dispatcher: Dispatcher,
    pub lifecycle: TaskLifecycle,
    pub fleet: FleetService,
    pub queues: QueueService,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dispatcher: Dispatcher::new(store.clone(), clock.clone()),
            lifecycle: TaskLifecycle::new(store.clone(), clock.clone()),
            fleet: FleetService::new(store.clone(), clock.clone()),
            queues: QueueService::new(store, clock),
        }
    }
}
