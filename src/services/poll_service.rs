//! The poll operation: observe the active wave's job and record what was seen.
//!
//! Poll writes only wave progress fields and `last_polled_time`. It never
//! touches `execution.status` and never finalizes; the returned
//! [`PollOutcome`] is how callers learn that every wave has completed.

use super::enrichment;
use crate::clients::{
    ComputeInventory, ExternalError, RecoveryService, RetryPolicy, ScopeResolver, with_retry,
};
use crate::error::Result;
use crate::models::{Execution, ExecutionStatus, RecoveryStatus, Wave, WaveStatus};
use crate::repository::{ExecutionRepository, UpdateOutcome, WaveProgress};
use chrono::Utc;
use convert_case::{Case, Casing};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Started,
    Completed,
    Unknown,
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_case(Case::Snake).as_str() {
            "pending" | "submitted" => Self::Pending,
            "started" | "in_progress" | "running" => Self::Started,
            "completed" | "complete" | "finished" => Self::Completed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollOutcome {
    pub execution_id: String,
    /// Status as stored; poll never changes it.
    pub execution_status: ExecutionStatus,
    pub polled_wave: Option<u32>,
    pub wave_status: Option<WaveStatus>,
    pub has_active_wave: bool,
    pub all_waves_complete: bool,
}

impl PollOutcome {
    fn observe(execution: &Execution, polled_wave: Option<u32>) -> Self {
        Self {
            execution_id: execution.id.clone(),
            execution_status: execution.status,
            polled_wave,
            wave_status: polled_wave
                .and_then(|n| execution.wave(n))
                .map(|wave| wave.status),
            has_active_wave: execution.active_wave().is_some(),
            all_waves_complete: execution.all_waves_complete(),
        }
    }
}

#[derive(Clone)]
pub struct PollService {
    repo: ExecutionRepository,
    recovery: Arc<dyn RecoveryService>,
    compute: Arc<dyn ComputeInventory>,
    scopes: ScopeResolver,
    retry: RetryPolicy,
    compute_batch_size: usize,
}

impl PollService {
    pub fn new(
        repo: ExecutionRepository,
        recovery: Arc<dyn RecoveryService>,
        compute: Arc<dyn ComputeInventory>,
        scopes: ScopeResolver,
        retry: RetryPolicy,
        compute_batch_size: usize,
    ) -> Self {
        Self {
            repo,
            recovery,
            compute,
            scopes,
            retry,
            compute_batch_size,
        }
    }

    pub async fn poll(&self, execution_id: &str) -> Result<PollOutcome> {
        let execution = self.repo.get(execution_id).await?;
        if execution.status.is_terminal() {
            tracing::debug!(execution_id, status = %execution.status, "Skipping poll of terminal execution");
            return Ok(PollOutcome::observe(&execution, None));
        }

        let Some(wave) = execution.active_wave().cloned() else {
            return Ok(PollOutcome::observe(&execution, None));
        };

        let now = Utc::now().timestamp_millis();
        let progress = match self.observe_wave(&execution, &wave, now).await {
            Ok(progress) => progress,
            Err(err) => {
                tracing::error!(
                    execution_id,
                    wave = wave.wave_number,
                    job_id = wave.job_id.as_deref(),
                    error = %err,
                    "Wave poll failed, marking wave FAILED"
                );
                WaveProgress {
                    status: WaveStatus::Failed,
                    resources: wave.resources.clone(),
                    end_time: Some(now),
                    error: Some(err.to_string()),
                }
            }
        };

        let write = self
            .repo
            .record_poll(execution_id, wave.wave_number, &progress, now)
            .await?;
        if write == UpdateOutcome::ConditionFailed {
            tracing::debug!(
                execution_id,
                wave = wave.wave_number,
                "Wave left POLLING before the poll result was written"
            );
        } else if progress.status != WaveStatus::Polling {
            tracing::info!(
                execution_id,
                wave = wave.wave_number,
                status = ?progress.status,
                "Wave reached a terminal status"
            );
        }

        let refreshed = self.repo.get(execution_id).await?;
        Ok(PollOutcome::observe(&refreshed, Some(wave.wave_number)))
    }

    async fn observe_wave(
        &self,
        execution: &Execution,
        wave: &Wave,
        now: i64,
    ) -> std::result::Result<WaveProgress, ExternalError> {
        let Some(job_id) = wave.job_id.as_deref() else {
            return Err(ExternalError::Permanent(format!(
                "Wave {} is POLLING without a job id",
                wave.wave_number
            )));
        };

        let scope = self.scopes.resolve(&execution.account_context).await?;
        let snapshot = with_retry(&self.retry, "describe_job", || {
            self.recovery.describe_job(&scope, job_id)
        })
        .await?;

        let records = enrichment::parse_recovery_records(&snapshot.resources);
        let instance_ids: Vec<String> = records
            .iter()
            .filter_map(|record| record.compute_instance_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let instances = enrichment::fetch_instances(
            self.compute.as_ref(),
            &scope,
            &instance_ids,
            self.compute_batch_size,
            &self.retry,
        )
        .await;
        let resources = enrichment::merge(&wave.resource_ids, &records, &instances, now);

        let (status, error) = match JobStatus::parse(&snapshot.status) {
            JobStatus::Completed => {
                let not_launched: Vec<&str> = resources
                    .iter()
                    .filter(|resource| resource.recovery_status != RecoveryStatus::Launched)
                    .map(|resource| resource.resource_id.as_str())
                    .collect();
                if not_launched.is_empty() {
                    (WaveStatus::Completed, None)
                } else {
                    (
                        WaveStatus::Failed,
                        Some(format!(
                            "Job {} completed without launching: {}",
                            job_id,
                            not_launched.join(", ")
                        )),
                    )
                }
            }
            JobStatus::Pending | JobStatus::Started => (WaveStatus::Polling, None),
            JobStatus::Unknown => {
                tracing::warn!(job_id, status = %snapshot.status, "Unrecognized job status");
                (WaveStatus::Polling, None)
            }
        };

        Ok(WaveProgress {
            status,
            resources,
            end_time: status.is_terminal().then_some(now),
            error,
        })
    }
}
