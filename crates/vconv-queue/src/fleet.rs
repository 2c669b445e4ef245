//! Machine registration, heartbeats and fleet views.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use vconv_models::{Machine, MachineDetails, MachineId, MachineSummary, TaskStats};
use vconv_store::Store;

use crate::clock::Clock;
use crate::error::{CoordResult, CoordinatorError};
use crate::metrics;

/// Counters and histograms for one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStats {
    pub machine_id: MachineId,
    /// The machine's success counter
    pub completed_tasks_count: u64,
    /// The machine's failure counter
    pub failed_tasks_count: u64,
    /// Tasks currently or previously held by this machine, per status
    pub machine_task_stats: TaskStats,
    /// Every task in the system, per status
    pub global_task_stats: TaskStats,
}

#[derive(Clone)]
pub struct FleetService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl FleetService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a heartbeat from `machine`.
    pub async fn heartbeat(
        &self,
        machine: &MachineId,
        device_info: serde_json::Value,
        encoder: &str,
    ) -> CoordResult<Machine> {
        if !device_info.is_object() {
            return Err(CoordinatorError::validation("deviceInfo must be an object"));
        }
        let encoder = encoder.trim();
        if encoder.is_empty() {
            return Err(CoordinatorError::validation("encoder must be a non-empty string"));
        }

        let updated = self
            .store
            .record_heartbeat(machine, device_info, encoder, self.clock.now())
            .await?
            .ok_or_else(|| CoordinatorError::not_found("Machine", machine))?;
        metrics::record_heartbeat();
        Ok(updated)
    }

    /// Stamp the first heartbeat if this machine was never seen. Idempotent.
    pub async fn mark_online(&self, machine: &MachineId) -> CoordResult<Machine> {
        let updated = self
            .store
            .mark_online(machine, self.clock.now())
            .await?
            .ok_or_else(|| CoordinatorError::not_found("Machine", machine))?;
        info!(machine_id = %machine, name = %updated.name, "Machine online");
        Ok(updated)
    }

    pub async fn list_machines(&self) -> CoordResult<Vec<MachineSummary>> {
        let now = self.clock.now();
        let machines = self.store.list_machines().await?;
        Ok(machines
            .iter()
            .map(|machine| MachineSummary::project(machine, now))
            .collect())
    }

    pub async fn machine_details(&self, id: &MachineId) -> CoordResult<MachineDetails> {
        let machine = self.load(id).await?;
        let held = TaskStats::from_counts(self.store.task_status_counts(Some(id)).await?);
        Ok(MachineDetails::project(&machine, held.active(), self.clock.now()))
    }

    pub async fn machine_stats(&self, id: &MachineId) -> CoordResult<MachineStats> {
        let machine = self.load(id).await?;
        let machine_task_stats =
            TaskStats::from_counts(self.store.task_status_counts(Some(id)).await?);
        let global_task_stats = self.task_stats().await?;
        Ok(MachineStats {
            machine_id: machine.id,
            completed_tasks_count: machine.success_count,
            failed_tasks_count: machine.failed_count,
            machine_task_stats,
            global_task_stats,
        })
    }

    /// Register a machine. The returned record carries its token.
    pub async fn register_machine(&self, name: &str, ip: &str) -> CoordResult<Machine> {
        let name = name.trim();
        let ip = ip.trim();
        if name.is_empty() {
            return Err(CoordinatorError::validation("name is required"));
        }
        if ip.is_empty() {
            return Err(CoordinatorError::validation("ip is required"));
        }

        let machine = Machine::new(name, ip, self.clock.now());
        self.store.create_machine(&machine).await?;
        info!(machine_id = %machine.id, name = %machine.name, ip = %machine.ip, "Machine registered");
        Ok(machine)
    }

    pub async fn remove_machine(&self, id: &MachineId) -> CoordResult<()> {
        if !self.store.delete_machine(id).await? {
            return Err(CoordinatorError::not_found("Machine", id));
        }
        info!(machine_id = %id, "Machine removed");
        Ok(())
    }

    /// Global task-status histogram.
    pub async fn task_stats(&self) -> CoordResult<TaskStats> {
        Ok(TaskStats::from_counts(self.store.task_status_counts(None).await?))
    }

    async fn load(&self, id: &MachineId) -> CoordResult<Machine> {
        self.store
            .get_machine(id)
            .await?
            .ok_or_else(|| CoordinatorError::not_found("Machine", id))
    }
}
