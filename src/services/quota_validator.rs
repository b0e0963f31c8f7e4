use crate::clients::{RecoveryService, RetryPolicy, ScopeResolver, with_retry};
use crate::error::{AppError, Result};
use crate::models::{AccountContext, WaveStatus};
use crate::repository::ExecutionRepository;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub max_resources_per_job: usize,
    pub max_concurrent_jobs: usize,
    pub max_resources_in_active_jobs: usize,
    /// Account-wide ceiling on resources engaged with the recovery service.
    pub account_ceiling: usize,
    pub warning_ratio: f64,
    pub blocking_ratio: f64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_resources_per_job: 100,
            max_concurrent_jobs: 20,
            max_resources_in_active_jobs: 500,
            account_ceiling: 300,
            warning_ratio: 0.83,
            blocking_ratio: 0.93,
        }
    }
}

impl QuotaLimits {
    pub fn warning_threshold(&self) -> usize {
        (self.account_ceiling as f64 * self.warning_ratio).round() as usize
    }

    pub fn blocking_threshold(&self) -> usize {
        (self.account_ceiling as f64 * self.blocking_ratio).round() as usize
    }
}

/// Live usage observed while validating a wave start.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QuotaReport {
    pub active_jobs: usize,
    pub resources_in_active_jobs: usize,
    pub engaged_resources: usize,
    pub projected_engaged_resources: usize,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct QuotaValidator {
    repo: ExecutionRepository,
    recovery: Arc<dyn RecoveryService>,
    scopes: ScopeResolver,
    retry: RetryPolicy,
    limits: QuotaLimits,
}

impl QuotaValidator {
    pub fn new(
        repo: ExecutionRepository,
        recovery: Arc<dyn RecoveryService>,
        scopes: ScopeResolver,
        retry: RetryPolicy,
        limits: QuotaLimits,
    ) -> Self {
        Self {
            repo,
            recovery,
            scopes,
            retry,
            limits,
        }
    }

    /// Local checks that need no external call: non-empty, no duplicates,
    /// within the per-job limit.
    pub fn check_batch(&self, wave_number: usize, resource_ids: &[String]) -> Result<()> {
        if resource_ids.is_empty() {
            return Err(AppError::Validation(format!(
                "Wave {} has no resources",
                wave_number
            )));
        }
        if resource_ids.len() > self.limits.max_resources_per_job {
            return Err(AppError::Validation(format!(
                "Wave {} requests {} resources, the per-job limit is {}",
                wave_number,
                resource_ids.len(),
                self.limits.max_resources_per_job
            )));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = resource_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(AppError::Validation(format!(
                "Wave {} lists resource {} more than once",
                wave_number, duplicate
            )));
        }
        Ok(())
    }

    /// Full pre-start validation for one wave's batch against live counts.
    /// Waves of `exclude_execution_id` are left out of the store's tally.
    pub async fn validate_wave_start(
        &self,
        wave_number: usize,
        resource_ids: &[String],
        account: &AccountContext,
        exclude_execution_id: Option<&str>,
    ) -> Result<QuotaReport> {
        self.check_batch(wave_number, resource_ids)?;
        let batch = resource_ids.len();
        let limits = &self.limits;

        let scope = self.scopes.resolve(account).await?;

        // In-flight jobs keyed by job id, or by execution and wave while the
        // job is still being launched. The service's view wins over the store's.
        let mut jobs: HashMap<String, usize> = HashMap::new();
        let mut launching = HashSet::new();
        let mut store_engaged = 0;
        for wave in self.repo.list_open_waves(exclude_execution_id).await? {
            if wave.account.scope_key() != account.scope_key() {
                continue;
            }
            let size = wave.resource_ids.len();
            match (wave.status, wave.job_id) {
                (WaveStatus::Polling, Some(job_id)) => {
                    jobs.insert(job_id, size);
                }
                (WaveStatus::Pending, _) if wave.launching => {
                    jobs.insert(launch_key(&wave.execution_id, wave.wave_number), size);
                    launching.insert(launch_key(&wave.execution_id, wave.wave_number));
                }
                _ => continue,
            }
            store_engaged += size;
        }
        let live_jobs = with_retry(&self.retry, "list_active_jobs", || {
            self.recovery.list_active_jobs(&scope)
        })
        .await?;
        for job in live_jobs {
            if let Some(tag) = &job.launched_by {
                if launching.contains(&launch_key(&tag.execution_id, tag.wave_number)) {
                    continue;
                }
            }
            jobs.insert(job.job_id, job.resource_ids.len());
        }

        let service_engaged = with_retry(&self.retry, "count_engaged_resources", || {
            self.recovery.count_engaged_resources(&scope)
        })
        .await?;
        let engaged = service_engaged.max(store_engaged);

        let mut report = QuotaReport {
            active_jobs: jobs.len(),
            resources_in_active_jobs: jobs.values().sum(),
            engaged_resources: engaged,
            projected_engaged_resources: engaged + batch,
            warnings: Vec::new(),
        };

        if report.active_jobs + 1 > limits.max_concurrent_jobs {
            return Err(AppError::Validation(format!(
                "{} jobs are already active in scope {}, the limit is {}",
                report.active_jobs,
                account.scope_key(),
                limits.max_concurrent_jobs
            )));
        }

        if report.resources_in_active_jobs + batch > limits.max_resources_in_active_jobs {
            return Err(AppError::Validation(format!(
                "Starting {} resources would bring active jobs to {} resources, the limit is {}",
                batch,
                report.resources_in_active_jobs + batch,
                limits.max_resources_in_active_jobs
            )));
        }

        if report.projected_engaged_resources > limits.blocking_threshold() {
            return Err(AppError::Validation(format!(
                "Starting {} resources would bring engaged resources to {} of {} (blocking at {})",
                batch,
                report.projected_engaged_resources,
                limits.account_ceiling,
                limits.blocking_threshold()
            )));
        }

        if report.projected_engaged_resources > limits.warning_threshold() {
            let warning = format!(
                "Engaged resources will reach {} of {} (warning at {})",
                report.projected_engaged_resources,
                limits.account_ceiling,
                limits.warning_threshold()
            );
            tracing::warn!(scope = account.scope_key(), "{}", warning);
            report.warnings.push(warning);
        }

        Ok(report)
    }
}

fn launch_key(execution_id: &str, wave_number: u32) -> String {
    format!("{}#{}", execution_id, wave_number)
}
