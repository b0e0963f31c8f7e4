//! Normalization boundary between the two external services and the canonical
//! [`ResourceStatus`] schema.
//!
//! The recovery service and the compute inventory name the same facts
//! differently (`recoveryInstanceID` vs `InstanceId`, `privateIPAddress` vs
//! `PrivateIpAddress`). Each source has an explicit rename table; any key not in
//! it falls back to a plain snake_case conversion.

use crate::clients::{ComputeInventory, ExternalError, RawRecord, RetryPolicy, ServiceScope, with_retry};
use crate::models::{RecoveryStatus, ResourceStatus};
use convert_case::{Case, Casing};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

const RECOVERY_RENAMES: &[(&str, &str)] = &[
    ("sourceServerID", "resource_id"),
    ("sourceServerId", "resource_id"),
    ("SourceServerID", "resource_id"),
    ("resourceID", "resource_id"),
    ("recoveryInstanceID", "compute_instance_id"),
    ("recoveryInstanceId", "compute_instance_id"),
    ("ec2InstanceID", "compute_instance_id"),
    ("launchStatus", "recovery_status"),
    ("LaunchStatus", "recovery_status"),
    ("status", "recovery_status"),
    ("launchTime", "launch_time"),
    ("launchedDateTime", "launch_time"),
    ("hostname", "display_name"),
    ("serverName", "display_name"),
    ("name", "display_name"),
    ("Name", "display_name"),
];

const COMPUTE_RENAMES: &[(&str, &str)] = &[
    ("InstanceId", "compute_instance_id"),
    ("instanceID", "compute_instance_id"),
    ("instanceId", "compute_instance_id"),
    ("PrivateIpAddress", "private_ip"),
    ("privateIPAddress", "private_ip"),
    ("privateIp", "private_ip"),
    ("PrivateDnsName", "hostname"),
    ("privateDnsName", "hostname"),
    ("hostName", "hostname"),
    ("InstanceType", "instance_type"),
    ("State", "instance_state"),
    ("state", "instance_state"),
];

/// Rewrites every key of `record` into the canonical field set.
///
/// Nested `{"Name": ...}` objects (the compute inventory's state shape) are
/// flattened to their name.
pub fn normalize_keys(record: &RawRecord, renames: &[(&str, &str)]) -> RawRecord {
    let table: HashMap<&str, &str> = renames.iter().copied().collect();
    let mut normalized = RawRecord::new();

    for (key, value) in record {
        let canonical = match table.get(key.as_str()) {
            Some(name) => (*name).to_string(),
            None => key.to_case(Case::Snake),
        };
        let value = match value {
            Value::Object(inner) => inner
                .get("Name")
                .or_else(|| inner.get("name"))
                .cloned()
                .unwrap_or_else(|| value.clone()),
            other => other.clone(),
        };
        // An explicit rename wins over a fallback conversion landing on the same key.
        if table.contains_key(key.as_str()) || !normalized.contains_key(&canonical) {
            normalized.insert(canonical, value);
        }
    }

    normalized
}

pub fn normalize_recovery_status(raw: &str) -> RecoveryStatus {
    match raw.trim().to_case(Case::Snake).as_str() {
        "pending" | "waiting" => RecoveryStatus::Pending,
        "in_progress" | "started" | "launching" => RecoveryStatus::InProgress,
        "launched" | "completed" | "succeeded" => RecoveryStatus::Launched,
        "failed" => RecoveryStatus::Failed,
        "terminated" => RecoveryStatus::Terminated,
        _ => RecoveryStatus::Unknown,
    }
}

/// Canonical view of one per-resource result from the recovery service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RecoveryRecord {
    pub resource_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub recovery_status: Option<String>,
    #[serde(default)]
    pub launch_time: Option<String>,
    #[serde(default)]
    pub compute_instance_id: Option<String>,
}

/// Canonical view of one compute inventory instance.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub compute_instance_id: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub instance_state: Option<String>,
}

pub fn parse_recovery_records(raw: &[RawRecord]) -> Vec<RecoveryRecord> {
    raw.iter()
        .filter_map(|record| {
            let normalized = normalize_keys(record, RECOVERY_RENAMES);
            match serde_json::from_value::<RecoveryRecord>(Value::Object(normalized)) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    tracing::warn!(error = %err, "Skipping unparseable recovery record");
                    None
                }
            }
        })
        .collect()
}

pub fn parse_instance_records(raw: &[RawRecord]) -> Vec<InstanceRecord> {
    raw.iter()
        .filter_map(|record| {
            let normalized = normalize_keys(record, COMPUTE_RENAMES);
            serde_json::from_value::<InstanceRecord>(Value::Object(normalized)).ok()
        })
        .collect()
}

/// Builds fresh resource statuses for a wave.
///
/// Every requested resource appears exactly once, in request order; resources
/// the service did not report yet are PENDING. Compute fields are filled only
/// when the resource has an instance and that instance was returned.
pub fn merge(
    requested: &[String],
    recovery: &[RecoveryRecord],
    instances: &[InstanceRecord],
    now: i64,
) -> Vec<ResourceStatus> {
    let by_resource: HashMap<&str, &RecoveryRecord> = recovery
        .iter()
        .map(|record| (record.resource_id.as_str(), record))
        .collect();
    let by_instance: HashMap<&str, &InstanceRecord> = instances
        .iter()
        .map(|instance| (instance.compute_instance_id.as_str(), instance))
        .collect();

    let mut seen = HashSet::new();
    let ordered_ids = requested
        .iter()
        .map(String::as_str)
        .chain(recovery.iter().map(|record| record.resource_id.as_str()))
        .filter(|id| seen.insert(*id))
        .collect::<Vec<_>>();

    ordered_ids
        .into_iter()
        .map(|resource_id| {
            let Some(record) = by_resource.get(resource_id) else {
                return ResourceStatus::pending(resource_id, now);
            };
            let instance = record
                .compute_instance_id
                .as_deref()
                .and_then(|id| by_instance.get(id).copied());

            ResourceStatus {
                resource_id: resource_id.to_string(),
                display_name: record
                    .display_name
                    .clone()
                    .unwrap_or_else(|| resource_id.to_string()),
                recovery_status: record
                    .recovery_status
                    .as_deref()
                    .map(normalize_recovery_status)
                    .unwrap_or(RecoveryStatus::Pending),
                launch_time: record.launch_time.clone(),
                compute_instance_id: record.compute_instance_id.clone(),
                private_ip: instance.and_then(|i| i.private_ip.clone()),
                hostname: instance.and_then(|i| i.hostname.clone()),
                instance_type: instance.and_then(|i| i.instance_type.clone()),
                instance_state: instance.and_then(|i| i.instance_state.clone()),
                last_updated: now,
            }
        })
        .collect()
}

/// Looks up compute instances in batches. A failed batch is logged and
/// skipped so the rest of the wave still gets enriched.
pub async fn fetch_instances(
    inventory: &dyn ComputeInventory,
    scope: &ServiceScope,
    instance_ids: &[String],
    batch_size: usize,
    retry: &RetryPolicy,
) -> Vec<InstanceRecord> {
    let mut records = Vec::new();

    for chunk in instance_ids.chunks(batch_size.max(1)) {
        let result: Result<Vec<RawRecord>, ExternalError> =
            with_retry(retry, "describe_instances", || {
                inventory.describe_instances(scope, chunk)
            })
            .await;
        match result {
            Ok(raw) => records.extend(parse_instance_records(&raw)),
            Err(err) => {
                tracing::warn!(
                    instances = chunk.len(),
                    error = %err,
                    "Compute inventory lookup failed, leaving batch unenriched"
                );
            }
        }
    }

    records
}
