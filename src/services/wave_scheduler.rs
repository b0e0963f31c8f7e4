//! Execution lifecycle: start, wave activation, advance/pause, resume, cancel.
//!
//! Status writes here are all conditional on the current status. Terminal
//! success and cancellation go through [`Finalizer`]; a poll never changes the
//! execution status, so the decision to move on is made in
//! [`WaveScheduler::handle_poll_outcome`].

use super::conflict_detector::ConflictDetector;
use super::finalizer::{FinalizeOutcome, Finalizer};
use super::poll_service::PollOutcome;
use super::quota_validator::QuotaValidator;
use crate::clients::{LaunchConfig, RecoveryService, RetryPolicy, ScopeResolver, with_retry};
use crate::error::{AppError, Result};
use crate::models::{
    AccountContext, Execution, ExecutionStatus, ResourceBatch, Wave, WaveStatus,
};
use crate::repository::{ExecutionRepository, UpdateOutcome};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdvanceDecision {
    /// A wave is still in flight.
    Waiting,
    Started { wave_number: u32 },
    Paused { next_wave: u32 },
    Finalized(FinalizeOutcome),
    Cancelled(FinalizeOutcome),
    Failed { wave_number: u32 },
    /// Nothing to do for the execution's current status.
    Idle,
}

#[derive(Clone)]
pub struct WaveScheduler {
    repo: ExecutionRepository,
    recovery: Arc<dyn RecoveryService>,
    scopes: ScopeResolver,
    conflicts: ConflictDetector,
    quotas: QuotaValidator,
    finalizer: Finalizer,
    retry: RetryPolicy,
    /// Serializes validate-then-claim so a concurrent start sees the
    /// resources the other one just persisted or reserved. Never held across
    /// a job launch.
    admission: Arc<Mutex<()>>,
}

impl WaveScheduler {
    pub fn new(
        repo: ExecutionRepository,
        recovery: Arc<dyn RecoveryService>,
        scopes: ScopeResolver,
        conflicts: ConflictDetector,
        quotas: QuotaValidator,
        finalizer: Finalizer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            recovery,
            scopes,
            conflicts,
            quotas,
            finalizer,
            retry,
            admission: Arc::new(Mutex::new(())),
        }
    }

    pub async fn start(
        &self,
        batches: Vec<ResourceBatch>,
        is_drill: bool,
        account_context: AccountContext,
    ) -> Result<Execution> {
        if batches.is_empty() {
            return Err(AppError::Validation(
                "An execution needs at least one wave".to_string(),
            ));
        }

        let mut all_resources = Vec::new();
        let mut seen = HashSet::new();
        for (wave_number, batch) in batches.iter().enumerate() {
            self.quotas.check_batch(wave_number, &batch.resource_ids)?;
            for resource_id in &batch.resource_ids {
                if !seen.insert(resource_id.as_str()) {
                    return Err(AppError::Validation(format!(
                        "Resource {} appears in more than one wave",
                        resource_id
                    )));
                }
                all_resources.push(resource_id.clone());
            }
        }

        let execution = {
            let _admission = self.admission.lock().await;

            let conflicts = self
                .conflicts
                .find_conflicts(&all_resources, &account_context, None)
                .await?;
            if !conflicts.is_empty() {
                return Err(AppError::Conflict {
                    resource_ids: conflicts,
                });
            }
            self.quotas
                .validate_wave_start(0, &batches[0].resource_ids, &account_context, None)
                .await?;

            let execution = build_execution(batches, is_drill, account_context);
            self.repo.create(&execution).await?;
            execution
        };

        tracing::info!(
            execution_id = %execution.id,
            total_waves = execution.total_waves,
            resources = all_resources.len(),
            is_drill,
            "Execution created"
        );

        match self.start_wave(&execution.id, 0).await {
            Ok(started) => Ok(started),
            Err(err) => {
                // Still PENDING means the first wave never reached the
                // recovery service: leave nothing behind.
                let current = self.repo.get(&execution.id).await?;
                if current.status == ExecutionStatus::Pending {
                    self.repo.delete(&execution.id).await?;
                }
                Err(err)
            }
        }
    }

    /// Re-validates, reserves and launches one PENDING wave. Validation
    /// failures leave no trace; a failed job start marks the wave and the
    /// execution FAILED.
    ///
    /// The launch runs on its own task, so it completes and is recorded even
    /// if the caller stops waiting.
    pub async fn start_wave(&self, execution_id: &str, wave_number: u32) -> Result<Execution> {
        let (execution, wave, adopted_job) = {
            let _admission = self.admission.lock().await;

            let execution = self.repo.get(execution_id).await?;
            if !matches!(
                execution.status,
                ExecutionStatus::Pending | ExecutionStatus::Polling | ExecutionStatus::Paused
            ) {
                return Err(invalid(&execution, "start_wave"));
            }
            let wave = execution.wave(wave_number).cloned().ok_or_else(|| {
                AppError::Validation(format!(
                    "Execution {} has no wave {}",
                    execution_id, wave_number
                ))
            })?;
            if wave.status != WaveStatus::Pending
                || execution.active_wave().is_some()
                || execution.waves[..wave_number as usize]
                    .iter()
                    .any(|earlier| earlier.status != WaveStatus::Completed)
            {
                return Err(AppError::InvalidTransition {
                    execution_id: execution_id.to_string(),
                    operation: "start_wave",
                    status: format!("{} (wave {} is {:?})", execution.status, wave_number, wave.status),
                });
            }

            let now = Utc::now().timestamp_millis();
            // Covers scope resolution plus the job call, both retried.
            let stale_before = now - (self.retry.worst_case() * 2).as_millis() as i64;
            let reserved = self
                .repo
                .reserve_wave(execution_id, wave_number, now, stale_before)
                .await?;
            if !reserved.is_applied() {
                return Err(AppError::WaveStarting {
                    execution_id: execution_id.to_string(),
                    wave_number,
                });
            }

            match self.prepare_launch(&execution, &wave).await {
                Ok(adopted_job) => (execution, wave, adopted_job),
                Err(err) => {
                    self.repo.release_wave(execution_id, wave_number).await?;
                    return Err(err);
                }
            }
        };

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.launch_wave(execution, wave, adopted_job).await }).await??;

        self.repo.get(execution_id).await
    }

    /// Returns a job already launched for this wave, if the service reports
    /// one. Otherwise checks conflicts and quotas for a fresh launch.
    async fn prepare_launch(&self, execution: &Execution, wave: &Wave) -> Result<Option<String>> {
        let scope = self.scopes.resolve(&execution.account_context).await?;
        let live_jobs = with_retry(&self.retry, "list_active_jobs", || {
            self.recovery.list_active_jobs(&scope)
        })
        .await?;
        let launched = live_jobs.into_iter().find(|job| {
            job.launched_by.as_ref().is_some_and(|tag| {
                tag.execution_id == execution.id && tag.wave_number == wave.wave_number
            })
        });
        if let Some(job) = launched {
            tracing::info!(
                execution_id = %execution.id,
                wave = wave.wave_number,
                job_id = %job.job_id,
                "Adopting job already launched for wave"
            );
            return Ok(Some(job.job_id));
        }

        let conflicts = self
            .conflicts
            .find_conflicts(&wave.resource_ids, &execution.account_context, Some(&execution.id))
            .await?;
        if !conflicts.is_empty() {
            return Err(AppError::Conflict {
                resource_ids: conflicts,
            });
        }
        let report = self
            .quotas
            .validate_wave_start(
                wave.wave_number as usize,
                &wave.resource_ids,
                &execution.account_context,
                Some(&execution.id),
            )
            .await?;
        if !report.warnings.is_empty() {
            tracing::warn!(
                execution_id = %execution.id,
                wave = wave.wave_number,
                warnings = report.warnings.len(),
                "Starting wave near quota"
            );
        }
        Ok(None)
    }

    /// Starts the wave's job, unless one was adopted, and records it.
    async fn launch_wave(self, execution: Execution, wave: Wave, adopted_job: Option<String>) -> Result<()> {
        let execution_id = execution.id.as_str();
        let wave_number = wave.wave_number;
        let now = Utc::now().timestamp_millis();

        let job_id = match adopted_job {
            Some(job_id) => job_id,
            None => match self.submit_job(&execution, &wave).await {
                Ok(job_id) => job_id,
                Err(err) => {
                    tracing::error!(execution_id, wave = wave_number, error = %err, "Failed to start wave job");
                    let detail = format!("Failed to start wave {}: {}", wave_number, err);
                    self.repo
                        .fail_wave(execution_id, wave_number, &detail, now)
                        .await?;
                    self.fail_execution(execution_id, &detail).await?;
                    return Err(err);
                }
            },
        };

        let outcome = self
            .repo
            .activate_wave(execution_id, wave_number, &job_id, now)
            .await?;
        if outcome == UpdateOutcome::ConditionFailed {
            tracing::warn!(
                execution_id,
                wave = wave_number,
                job_id = %job_id,
                "Wave changed while its job was starting; job is not tracked"
            );
        } else {
            tracing::info!(
                execution_id,
                wave = wave_number,
                job_id = %job_id,
                resources = wave.resource_ids.len(),
                "Wave started"
            );
        }
        Ok(())
    }

    /// Called once the active wave has completed: pause before the next wave
    /// if it asks for it, otherwise start it. Finalizes when nothing is left.
    pub async fn advance_or_pause(&self, execution_id: &str) -> Result<AdvanceDecision> {
        let execution = self.repo.get(execution_id).await?;
        if execution.status != ExecutionStatus::Polling {
            return Err(invalid(&execution, "advance"));
        }
        if execution.active_wave().is_some() {
            return Ok(AdvanceDecision::Waiting);
        }
        if let Some(failed) = execution.failed_wave() {
            return Err(AppError::InvalidTransition {
                execution_id: execution_id.to_string(),
                operation: "advance",
                status: format!("{} (wave {} FAILED)", execution.status, failed.wave_number),
            });
        }
        let Some(next) = execution.next_pending_wave() else {
            return Ok(AdvanceDecision::Finalized(
                self.finalizer.finalize(execution_id).await?,
            ));
        };
        let next_wave = next.wave_number;

        if next.pause_before {
            let outcome = self
                .repo
                .transition_status(
                    execution_id,
                    &[ExecutionStatus::Polling],
                    ExecutionStatus::Paused,
                    None,
                    None,
                )
                .await?;
            if outcome == UpdateOutcome::Applied {
                tracing::info!(execution_id, next_wave, "Execution paused before wave");
                return Ok(AdvanceDecision::Paused { next_wave });
            }
            return Ok(AdvanceDecision::Idle);
        }

        match self.start_wave(execution_id, next_wave).await {
            Ok(_) => Ok(AdvanceDecision::Started {
                wave_number: next_wave,
            }),
            Err(AppError::WaveStarting { .. }) => Ok(AdvanceDecision::Waiting),
            Err(err) => Err(err),
        }
    }

    /// Requests a pause once the wave in flight completes.
    pub async fn pause(&self, execution_id: &str) -> Result<Execution> {
        let execution = self.repo.get(execution_id).await?;
        if !matches!(
            execution.status,
            ExecutionStatus::Pending | ExecutionStatus::Polling
        ) {
            return Err(invalid(&execution, "pause"));
        }
        let next = execution
            .waves
            .iter()
            .find(|wave| wave.status == WaveStatus::Pending && wave.wave_number > 0)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Execution {} has no remaining wave to pause before",
                    execution_id
                ))
            })?;

        if self
            .repo
            .set_pause_before(execution_id, next.wave_number, true)
            .await?
            .is_applied()
        {
            tracing::info!(execution_id, next_wave = next.wave_number, "Pause requested");
        }
        self.repo.get(execution_id).await
    }

    pub async fn resume(&self, execution_id: &str) -> Result<Execution> {
        let execution = self.repo.get(execution_id).await?;
        if execution.status != ExecutionStatus::Paused {
            return Err(invalid(&execution, "resume"));
        }
        let next = execution.next_pending_wave().ok_or_else(|| {
            AppError::Validation(format!(
                "Execution {} has no pending wave to resume",
                execution_id
            ))
        })?;

        tracing::info!(execution_id, wave = next.wave_number, "Resuming execution");
        self.start_wave(execution_id, next.wave_number).await
    }

    /// Cooperative cancel: no further waves start, the wave in flight is left
    /// to finish and the next cycle finalizes the execution.
    pub async fn cancel(&self, execution_id: &str) -> Result<Execution> {
        let execution = self.repo.get(execution_id).await?;
        if execution.status == ExecutionStatus::Cancelling {
            return Ok(execution);
        }

        let outcome = self
            .repo
            .transition_status(
                execution_id,
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Polling,
                    ExecutionStatus::Paused,
                ],
                ExecutionStatus::Cancelling,
                None,
                None,
            )
            .await?;

        let current = self.repo.get(execution_id).await?;
        match outcome {
            UpdateOutcome::Applied => {
                tracing::info!(execution_id, "Cancellation requested");
                Ok(current)
            }
            UpdateOutcome::ConditionFailed if current.status == ExecutionStatus::Cancelling => {
                Ok(current)
            }
            UpdateOutcome::ConditionFailed => Err(invalid(&current, "cancel")),
        }
    }

    /// Decides what happens after a poll. This is the only place a poll
    /// result leads to a status change.
    pub async fn handle_poll_outcome(&self, outcome: &PollOutcome) -> Result<AdvanceDecision> {
        let execution = self.repo.get(&outcome.execution_id).await?;
        let execution_id = execution.id.as_str();

        match execution.status {
            ExecutionStatus::Cancelling => {
                if execution.active_wave().is_some() {
                    return Ok(AdvanceDecision::Waiting);
                }
                if outcome.all_waves_complete && execution.all_waves_complete() {
                    return Ok(AdvanceDecision::Finalized(
                        self.finalizer.finalize(execution_id).await?,
                    ));
                }
                Ok(AdvanceDecision::Cancelled(
                    self.finalizer.finalize_cancelled(execution_id).await?,
                ))
            }
            ExecutionStatus::Polling => {
                if execution.active_wave().is_some() {
                    return Ok(AdvanceDecision::Waiting);
                }
                if let Some(failed) = execution.failed_wave() {
                    let detail = failed
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("Wave {} failed", failed.wave_number));
                    let wave_number = failed.wave_number;
                    self.fail_execution(execution_id, &detail).await?;
                    return Ok(AdvanceDecision::Failed { wave_number });
                }
                if outcome.all_waves_complete {
                    return Ok(AdvanceDecision::Finalized(
                        self.finalizer.finalize(execution_id).await?,
                    ));
                }
                self.advance_or_pause(execution_id).await
            }
            _ => Ok(AdvanceDecision::Idle),
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution> {
        self.repo.get(execution_id).await
    }

    /// All executions, newest first, or those in any of `statuses`.
    pub async fn list_executions(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        if statuses.is_empty() {
            self.repo.list_all().await
        } else {
            self.repo.list_by_status(statuses).await
        }
    }

    async fn submit_job(&self, execution: &Execution, wave: &Wave) -> std::result::Result<String, AppError> {
        let scope = self.scopes.resolve(&execution.account_context).await?;
        let launch = LaunchConfig {
            execution_id: execution.id.clone(),
            wave_number: wave.wave_number,
            is_drill: execution.is_drill,
        };
        let job_id = with_retry(&self.retry, "start_job", || {
            self.recovery.start_job(&scope, &wave.resource_ids, &launch)
        })
        .await?;
        Ok(job_id)
    }

    /// Marks a live execution FAILED with `detail`. No-op once terminal.
    pub async fn fail_execution(&self, execution_id: &str, detail: &str) -> Result<()> {
        let outcome = self
            .repo
            .transition_status(
                execution_id,
                &ExecutionStatus::ACTIVE,
                ExecutionStatus::Failed,
                Some(Utc::now().timestamp_millis()),
                Some(detail),
            )
            .await?;
        if outcome.is_applied() {
            tracing::error!(execution_id, error = detail, "Execution failed");
        }
        Ok(())
    }
}

fn invalid(execution: &Execution, operation: &'static str) -> AppError {
    AppError::InvalidTransition {
        execution_id: execution.id.clone(),
        operation,
        status: execution.status.to_string(),
    }
}

fn build_execution(
    batches: Vec<ResourceBatch>,
    is_drill: bool,
    account_context: AccountContext,
) -> Execution {
    let waves: Vec<Wave> = batches
        .into_iter()
        .enumerate()
        .map(|(index, batch)| Wave {
            wave_number: index as u32,
            status: WaveStatus::Pending,
            job_id: None,
            resource_ids: batch.resource_ids,
            resources: Vec::new(),
            pause_before: index > 0 && batch.pause_before,
            start_time: None,
            end_time: None,
            error: None,
        })
        .collect();

    Execution {
        id: uuid::Uuid::new_v4().to_string(),
        status: ExecutionStatus::Pending,
        total_waves: waves.len() as u32,
        waves,
        is_drill,
        account_context,
        created_time: Utc::now().timestamp_millis(),
        last_polled_time: None,
        completed_time: None,
        error: None,
    }
}
