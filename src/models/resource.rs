use serde::{Deserialize, Serialize};

/// Canonical per-resource status, rebuilt from both external sources on every
/// poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceStatus {
    pub resource_id: String,
    pub display_name: String,
    pub recovery_status: RecoveryStatus,
    pub launch_time: Option<String>,
    pub compute_instance_id: Option<String>,
    pub private_ip: Option<String>,
    pub hostname: Option<String>,
    pub instance_type: Option<String>,
    pub instance_state: Option<String>,
    pub last_updated: i64,
}

impl ResourceStatus {
    pub fn pending(resource_id: &str, now: i64) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            display_name: resource_id.to_string(),
            recovery_status: RecoveryStatus::Pending,
            launch_time: None,
            compute_instance_id: None,
            private_ip: None,
            hostname: None,
            instance_type: None,
            instance_state: None,
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStatus {
    Pending,
    InProgress,
    Launched,
    Failed,
    Terminated,
    Unknown,
}

