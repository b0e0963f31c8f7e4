use crate::clients::{RecoveryService, RetryPolicy, ScopeResolver, with_retry};
use crate::error::Result;
use crate::models::AccountContext;
use crate::repository::ExecutionRepository;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Finds requested resources that are already claimed, either by another
/// execution in the store or by a job the recovery service reports as live.
/// The service is consulted as well because the store lags anything started
/// out of band.
#[derive(Clone)]
pub struct ConflictDetector {
    repo: ExecutionRepository,
    recovery: Arc<dyn RecoveryService>,
    scopes: ScopeResolver,
    retry: RetryPolicy,
}

impl ConflictDetector {
    pub fn new(
        repo: ExecutionRepository,
        recovery: Arc<dyn RecoveryService>,
        scopes: ScopeResolver,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            recovery,
            scopes,
            retry,
        }
    }

    /// Returns the claimed subset of `resource_ids`, sorted.
    pub async fn find_conflicts(
        &self,
        resource_ids: &[String],
        account: &AccountContext,
        exclude_execution_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let requested: HashSet<&str> = resource_ids.iter().map(String::as_str).collect();
        let mut claimed = BTreeSet::new();

        let open_waves = self.repo.list_open_waves(None).await?;
        let mut own_job_ids = HashSet::new();
        for wave in &open_waves {
            if Some(wave.execution_id.as_str()) == exclude_execution_id {
                if let Some(job_id) = &wave.job_id {
                    own_job_ids.insert(job_id.clone());
                }
                continue;
            }
            for resource_id in &wave.resource_ids {
                if requested.contains(resource_id.as_str()) {
                    claimed.insert(resource_id.clone());
                }
            }
        }

        let scope = self.scopes.resolve(account).await?;
        let live_jobs = with_retry(&self.retry, "list_active_jobs", || {
            self.recovery.list_active_jobs(&scope)
        })
        .await?;
        for job in live_jobs {
            let own = own_job_ids.contains(&job.job_id)
                || exclude_execution_id.is_some_and(|id| job.launched_for(id));
            if own {
                continue;
            }
            for resource_id in job.resource_ids {
                if requested.contains(resource_id.as_str()) {
                    claimed.insert(resource_id);
                }
            }
        }

        if !claimed.is_empty() {
            tracing::info!(
                exclude_execution_id,
                conflicts = claimed.len(),
                "Requested resources are already claimed"
            );
        }

        Ok(claimed.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ActiveJob, JobTag};
    use crate::models::ExecutionStatus;
    use crate::testing::{TestHarness, ids, new_execution};

    #[tokio::test]
    async fn store_claims_from_other_executions_are_reported() {
        let harness = TestHarness::new().await;
        let other = new_execution(&[&["r-1", "r-2"], &["r-3"]]);
        harness.repo.create(&other).await.unwrap();

        let conflicts = harness
            .conflicts
            .find_conflicts(&ids(&["r-3", "r-9"]), &AccountContext::default(), None)
            .await
            .unwrap();

        assert_eq!(conflicts, vec!["r-3"]);
    }

    #[tokio::test]
    async fn live_job_missing_from_store_is_still_a_conflict() {
        let harness = TestHarness::new().await;
        harness.recovery.add_external_job(ActiveJob {
            job_id: "job-out-of-band".to_string(),
            resource_ids: ids(&["r-7"]),
            ..ActiveJob::default()
        });

        let conflicts = harness
            .conflicts
            .find_conflicts(&ids(&["r-7", "r-8"]), &AccountContext::default(), None)
            .await
            .unwrap();

        assert_eq!(conflicts, vec!["r-7"]);
    }

    #[tokio::test]
    async fn both_sources_are_unioned() {
        let harness = TestHarness::new().await;
        harness.repo.create(&new_execution(&[&["r-1"]])).await.unwrap();
        harness.recovery.add_external_job(ActiveJob {
            job_id: "job-x".to_string(),
            resource_ids: ids(&["r-2"]),
            ..ActiveJob::default()
        });

        let conflicts = harness
            .conflicts
            .find_conflicts(&ids(&["r-1", "r-2", "r-3"]), &AccountContext::default(), None)
            .await
            .unwrap();

        assert_eq!(conflicts, vec!["r-1", "r-2"]);
    }

    #[tokio::test]
    async fn excluded_execution_and_its_jobs_do_not_conflict() {
        let harness = TestHarness::new().await;
        let own = new_execution(&[&["r-1"]]);
        harness.repo.create(&own).await.unwrap();
        harness.repo.activate_wave(&own.id, 0, "job-own", 1).await.unwrap();
        harness.recovery.add_external_job(ActiveJob {
            job_id: "job-own".to_string(),
            resource_ids: ids(&["r-1"]),
            ..ActiveJob::default()
        });

        let conflicts = harness
            .conflicts
            .find_conflicts(&ids(&["r-1"]), &AccountContext::default(), Some(&own.id))
            .await
            .unwrap();

        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn live_job_tagged_with_excluded_execution_does_not_conflict() {
        let harness = TestHarness::new().await;
        let own = new_execution(&[&["r-1"], &["r-2"]]);
        harness.repo.create(&own).await.unwrap();
        harness.recovery.add_external_job(ActiveJob {
            job_id: "job-untracked".to_string(),
            resource_ids: ids(&["r-2"]),
            launched_by: Some(JobTag {
                execution_id: own.id.clone(),
                wave_number: 1,
            }),
        });

        let excluded = harness
            .conflicts
            .find_conflicts(&ids(&["r-2"]), &AccountContext::default(), Some(&own.id))
            .await
            .unwrap();
        let unexcluded = harness
            .conflicts
            .find_conflicts(&ids(&["r-2"]), &AccountContext::default(), None)
            .await
            .unwrap();

        assert!(excluded.is_empty());
        assert_eq!(unexcluded, vec!["r-2"]);
    }

    #[tokio::test]
    async fn terminal_executions_release_their_resources() {
        let harness = TestHarness::new().await;
        let done = new_execution(&[&["r-1"]]);
        harness.repo.create(&done).await.unwrap();
        harness
            .repo
            .transition_status(
                &done.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Cancelled,
                Some(1),
                None,
            )
            .await
            .unwrap();

        let conflicts = harness
            .conflicts
            .find_conflicts(&ids(&["r-1"]), &AccountContext::default(), None)
            .await
            .unwrap();

        assert!(conflicts.is_empty());
    }
}
