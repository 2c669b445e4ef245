//! Worker machine records and the views derived from them.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::liveness::{is_online, uptime_secs};
use crate::token::generate_secret;
use crate::MachineId;

/// A worker machine registered with the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: MachineId,
    /// Unique
    pub name: String,
    /// Unique
    pub ip: String,
    /// Bearer credential, unique
    pub token: String,
    /// Last heartbeat received
    pub heartbeat: Option<DateTime<Utc>>,
    /// Stamped once, by the first online/heartbeat call
    pub first_heartbeat: Option<DateTime<Utc>>,
    /// Opaque hardware description reported by the machine
    pub device_info: Option<serde_json::Value>,
    /// Encoder capability string
    pub encoder: Option<String>,
    pub success_count: u64,
    pub failed_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Machine {
    /// Create a new machine record with a freshly generated token.
    pub fn new(name: impl Into<String>, ip: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MachineId::new(),
            name: name.into(),
            ip: ip.into(),
            token: generate_secret(),
            heartbeat: None,
            first_heartbeat: None,
            device_info: None,
            encoder: None,
            success_count: 0,
            failed_count: 0,
            created_at: now,
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        is_online(self.heartbeat, now)
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> i64 {
        uptime_secs(self.first_heartbeat, now)
    }

    /// Record a heartbeat. The first one also stamps `first_heartbeat`.
    pub fn record_heartbeat(
        &mut self,
        device_info: serde_json::Value,
        encoder: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.heartbeat = Some(now);
        self.first_heartbeat.get_or_insert(now);
        self.device_info = Some(device_info);
        self.encoder = Some(encoder.into());
    }

    /// Stamp `first_heartbeat` if it was never set. Idempotent.
    pub fn mark_online(&mut self, now: DateTime<Utc>) {
        self.first_heartbeat.get_or_insert(now);
    }
}

/// Machine as shown in listings. Never carries the token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineSummary {
    pub id: MachineId,
    pub name: String,
    pub ip: String,
    pub is_online: bool,
    pub heartbeat: Option<DateTime<Utc>>,
    pub first_heartbeat: Option<DateTime<Utc>>,
    pub device_info: Option<serde_json::Value>,
    pub encoder: Option<String>,
    pub success_count: u64,
    pub failed_count: u64,
}

impl MachineSummary {
    pub fn project(machine: &Machine, now: DateTime<Utc>) -> Self {
        Self {
            id: machine.id.clone(),
            name: machine.name.clone(),
            ip: machine.ip.clone(),
            is_online: machine.is_online(now),
            heartbeat: machine.heartbeat,
            first_heartbeat: machine.first_heartbeat,
            device_info: machine.device_info.clone(),
            encoder: machine.encoder.clone(),
            success_count: machine.success_count,
            failed_count: machine.failed_count,
        }
    }
}

/// Single machine detail view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineDetails {
    pub id: MachineId,
    pub name: String,
    pub ip: String,
    pub device_info: Option<serde_json::Value>,
    pub encoder: Option<String>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub first_heartbeat: Option<DateTime<Utc>>,
    pub is_online: bool,
    /// "online" or "offline"
    pub status: String,
    /// Seconds since the first heartbeat
    pub uptime: i64,
    /// Tasks this machine currently holds in an active stage
    pub running_tasks_count: u64,
}

impl MachineDetails {
    pub fn project(machine: &Machine, running_tasks_count: u64, now: DateTime<Utc>) -> Self {
        let online = machine.is_online(now);
        Self {
            id: machine.id.clone(),
            name: machine.name.clone(),
            ip: machine.ip.clone(),
            device_info: machine.device_info.clone(),
            encoder: machine.encoder.clone(),
            heartbeat: machine.heartbeat,
            first_heartbeat: machine.first_heartbeat,
            is_online: online,
            status: if online { "online" } else { "offline" }.to_string(),
            uptime: machine.uptime_secs(now),
            running_tasks_count,
        }
    }
}
