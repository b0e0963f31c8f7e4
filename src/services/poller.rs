use super::poll_service::PollService;
use super::wave_scheduler::{AdvanceDecision, WaveScheduler};
use crate::error::Result;
use crate::models::ExecutionStatus;
use crate::repository::ExecutionRepository;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub interval_secs: u64,
    /// Executions polled in parallel per cycle.
    pub concurrency: usize,
    /// Time allowed for one execution's poll and follow-up decision.
    pub budget_secs: u64,
    pub compute_batch_size: usize,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            concurrency: 8,
            budget_secs: 120,
            compute_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub found: usize,
    pub waiting: usize,
    pub started: usize,
    pub paused: usize,
    pub finalized: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub errors: usize,
    pub timed_out: usize,
}

impl TickReport {
    fn record(&mut self, decision: &AdvanceDecision) {
        match decision {
            AdvanceDecision::Waiting | AdvanceDecision::Idle => self.waiting += 1,
            AdvanceDecision::Started { .. } => self.started += 1,
            AdvanceDecision::Paused { .. } => self.paused += 1,
            AdvanceDecision::Finalized(_) => self.finalized += 1,
            AdvanceDecision::Cancelled(_) => self.cancelled += 1,
            AdvanceDecision::Failed { .. } => self.failed += 1,
        }
    }
}

/// Periodic driver: finds every execution with work in flight and runs one
/// poll plus its follow-up decision per execution, in bounded parallel.
#[derive(Clone)]
pub struct Poller {
    repo: ExecutionRepository,
    poll: PollService,
    scheduler: WaveScheduler,
    settings: PollerSettings,
}

impl Poller {
    pub fn new(
        repo: ExecutionRepository,
        poll: PollService,
        scheduler: WaveScheduler,
        settings: PollerSettings,
    ) -> Self {
        Self {
            repo,
            poll,
            scheduler,
            settings,
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let executions = self
            .repo
            .list_by_status(&[ExecutionStatus::Polling, ExecutionStatus::Cancelling])
            .await?;
        let mut report = TickReport {
            found: executions.len(),
            ..TickReport::default()
        };
        if executions.is_empty() {
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let budget = Duration::from_secs(self.settings.budget_secs);
        let mut tasks = JoinSet::new();

        for execution in executions {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let poll = self.poll.clone();
            let scheduler = self.scheduler.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let work = async {
                    let outcome = poll.poll(&execution.id).await?;
                    scheduler.handle_poll_outcome(&outcome).await
                };
                let result = tokio::time::timeout(budget, work).await;
                (execution.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(decision)))) => report.record(&decision),
                Ok((execution_id, Ok(Err(err)))) => {
                    tracing::warn!(execution_id, error = %err, "Poll cycle failed for execution");
                    report.errors += 1;
                }
                Ok((execution_id, Err(_))) => {
                    tracing::warn!(
                        execution_id,
                        budget_secs = budget.as_secs(),
                        "Poll exceeded its time budget, resuming next cycle"
                    );
                    report.timed_out += 1;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Poll task panicked");
                    report.errors += 1;
                }
            }
        }

        tracing::debug!(?report, "Poll cycle finished");
        Ok(report)
    }

    /// Runs poll cycles every `interval_secs` until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(
            interval_secs = self.settings.interval_secs,
            concurrency = self.settings.concurrency,
            "Poller started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::error!(error = %err, "Poll cycle failed");
                    }
                }
            }
        }
        tracing::info!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountContext, ResourceBatch, WaveStatus};
    use crate::testing::TestHarness;

    async fn one_second_budget() -> TestHarness {
        TestHarness::with_poller(PollerSettings {
            budget_secs: 1,
            ..PollerSettings::default()
        })
        .await
    }

    fn complete_job(harness: &TestHarness, job_id: &str, resources: &[&str]) {
        for resource_id in resources {
            harness
                .recovery
                .set_resource_status(job_id, resource_id, "LAUNCHED", None);
        }
        harness.recovery.complete_job(job_id);
    }

    #[tokio::test]
    async fn idle_store_yields_empty_report() {
        let harness = TestHarness::new().await;

        let report = harness.poller.tick().await.unwrap();

        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn tick_drives_executions_to_completion() {
        let harness = TestHarness::new().await;
        let execution = harness
            .scheduler
            .start(
                vec![ResourceBatch::new(["a"]), ResourceBatch::new(["b"])],
                false,
                AccountContext::default(),
            )
            .await
            .unwrap();

        let report = harness.poller.tick().await.unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.waiting, 1);

        let first_job = harness.recovery.started_jobs()[0].0.clone();
        complete_job(&harness, &first_job, &["a"]);
        let report = harness.poller.tick().await.unwrap();
        assert_eq!(report.started, 1);

        let second_job = harness.recovery.started_jobs()[1].0.clone();
        complete_job(&harness, &second_job, &["b"]);
        let report = harness.poller.tick().await.unwrap();
        assert_eq!(report.finalized, 1);

        let loaded = harness.repo.get(&execution.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(harness.poller.tick().await.unwrap().found, 0);
    }

    #[tokio::test]
    async fn executions_are_polled_independently() {
        let harness = TestHarness::new().await;
        for prefix in ["a", "b", "c"] {
            harness
                .scheduler
                .start(
                    vec![ResourceBatch::new([format!("{}-1", prefix)])],
                    false,
                    AccountContext::default(),
                )
                .await
                .unwrap();
        }
        let jobs = harness.recovery.started_jobs();
        complete_job(&harness, &jobs[0].0, &["a-1"]);

        let report = harness.poller.tick().await.unwrap();

        assert_eq!(report.found, 3);
        assert_eq!(report.finalized, 1);
        assert_eq!(report.waiting, 2);
    }

    #[tokio::test]
    async fn cancelled_execution_is_finalized_by_the_poller() {
        let harness = TestHarness::new().await;
        let execution = harness
            .scheduler
            .start(
                vec![ResourceBatch::new(["a"]), ResourceBatch::new(["b"])],
                false,
                AccountContext::default(),
            )
            .await
            .unwrap();
        harness.scheduler.cancel(&execution.id).await.unwrap();
        let job_id = harness.recovery.started_jobs()[0].0.clone();
        complete_job(&harness, &job_id, &["a"]);

        let report = harness.poller.tick().await.unwrap();

        assert_eq!(report.cancelled, 1);
        assert_eq!(
            harness.repo.get(&execution.id).await.unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn wave_launch_outlives_a_timed_out_cycle() {
        let harness = one_second_budget().await;
        let execution = harness
            .scheduler
            .start(
                vec![ResourceBatch::new(["a"]), ResourceBatch::new(["b"])],
                false,
                AccountContext::default(),
            )
            .await
            .unwrap();
        complete_job(&harness, "drs-job-0", &["a"]);
        harness.recovery.set_start_delay_ms(1_500);

        let report = harness.poller.tick().await.unwrap();
        assert_eq!(report.timed_out, 1);

        let report = harness.poller.tick().await.unwrap();
        assert_eq!(report.waiting, 1);
        assert_eq!(report.errors, 0);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let loaded = harness.repo.get(&execution.id).await.unwrap();
        assert_eq!(loaded.waves[1].status, WaveStatus::Polling);
        assert_eq!(loaded.waves[1].job_id.as_deref(), Some("drs-job-1"));

        harness.recovery.set_start_delay_ms(0);
        complete_job(&harness, "drs-job-1", &["b"]);
        let report = harness.poller.tick().await.unwrap();

        assert_eq!(report.finalized, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(harness.recovery.started_jobs().len(), 2);
        assert_eq!(
            harness.repo.get(&execution.id).await.unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test]
    async fn slow_execution_times_out_without_holding_up_others() {
        let harness = one_second_budget().await;
        let mut ids = Vec::new();
        for prefix in ["x", "y", "z"] {
            let execution = harness
                .scheduler
                .start(
                    vec![ResourceBatch::new([format!("{}-1", prefix)])],
                    false,
                    AccountContext::default(),
                )
                .await
                .unwrap();
            ids.push(execution.id);
        }
        harness.recovery.set_describe_delay_ms("drs-job-0", 1_500);
        complete_job(&harness, "drs-job-1", &["y-1"]);
        complete_job(&harness, "drs-job-2", &["z-1"]);

        let report = harness.poller.tick().await.unwrap();

        assert_eq!(report.found, 3);
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.finalized, 2);
        assert_eq!(
            harness.repo.get(&ids[0]).await.unwrap().status,
            ExecutionStatus::Polling
        );

        harness.recovery.set_describe_delay_ms("drs-job-0", 0);
        complete_job(&harness, "drs-job-0", &["x-1"]);
        let report = harness.poller.tick().await.unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.finalized, 1);
    }
}
