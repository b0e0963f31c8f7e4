//! In-memory collaborators and fixtures shared by the unit tests.

use crate::clients::{
    ActiveJob, ComputeInventory, CredentialBroker, ExternalError, JobSnapshot, JobTag,
    LaunchConfig, RawRecord, RecoveryService, RetryPolicy, ScopeCredentials, ScopeResolver,
    ServiceScope,
};
use crate::engine::{Collaborators, Engine, EngineSettings};
use crate::models::{AccountContext, Execution, ExecutionStatus, Wave, WaveStatus};
use crate::repository::{ExecutionRepository, establish_connection};
use crate::services::{
    ConflictDetector, Finalizer, PollService, Poller, PollerSettings, QuotaLimits, QuotaValidator,
    WaveScheduler,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub async fn test_repository() -> (TempDir, ExecutionRepository) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("test.db").display());
    let pool = establish_connection(&url).await.unwrap();
    (dir, ExecutionRepository::new(pool))
}

/// A PENDING execution in the default scope with every wave PENDING.
pub fn new_execution(batches: &[&[&str]]) -> Execution {
    let waves: Vec<Wave> = batches
        .iter()
        .enumerate()
        .map(|(index, batch)| Wave {
            wave_number: index as u32,
            status: WaveStatus::Pending,
            job_id: None,
            resource_ids: ids(batch),
            resources: Vec::new(),
            pause_before: false,
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
        is_drill: false,
        account_context: AccountContext::default(),
        created_time: chrono::Utc::now().timestamp_millis(),
        last_polled_time: None,
        completed_time: None,
        error: None,
    }
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

pub fn numbered_ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|n| format!("{}-{}", prefix, n)).collect()
}

fn into_record(value: serde_json::Value) -> RawRecord {
    match value {
        serde_json::Value::Object(map) => map,
        _ => RawRecord::new(),
    }
}

#[derive(Default)]
struct FakeJob {
    resource_ids: Vec<String>,
    statuses: HashMap<String, (String, Option<String>)>,
    completed: bool,
}

#[derive(Default)]
struct RecoveryState {
    jobs: HashMap<String, FakeJob>,
    started: Vec<(String, LaunchConfig)>,
    external: Vec<ActiveJob>,
    engaged: usize,
    describe_error: Option<ExternalError>,
    start_error: Option<ExternalError>,
    describe_calls: usize,
    start_delay_ms: u64,
    describe_delays_ms: HashMap<String, u64>,
}

/// Recovery service double. Jobs it starts stay live until completed.
#[derive(Default)]
pub struct FakeRecovery {
    state: Mutex<RecoveryState>,
}

impl FakeRecovery {
    pub fn register_job(&self, job_id: &str, resource_ids: &[&str]) {
        self.state.lock().unwrap().jobs.insert(
            job_id.to_string(),
            FakeJob {
                resource_ids: ids(resource_ids),
                ..FakeJob::default()
            },
        );
    }

    pub fn set_resource_status(
        &self,
        job_id: &str,
        resource_id: &str,
        status: &str,
        instance_id: Option<&str>,
    ) {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.entry(job_id.to_string()).or_default();
        job.statuses.insert(
            resource_id.to_string(),
            (status.to_string(), instance_id.map(str::to_string)),
        );
    }

    pub fn complete_job(&self, job_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.jobs.entry(job_id.to_string()).or_default().completed = true;
    }

    pub fn fail_describe(&self, err: ExternalError) {
        self.state.lock().unwrap().describe_error = Some(err);
    }

    pub fn fail_start(&self, err: ExternalError) {
        self.state.lock().unwrap().start_error = Some(err);
    }

    /// Delays `start_job` replies. The job is already live while the reply
    /// is delayed.
    pub fn set_start_delay_ms(&self, delay_ms: u64) {
        self.state.lock().unwrap().start_delay_ms = delay_ms;
    }

    pub fn set_describe_delay_ms(&self, job_id: &str, delay_ms: u64) {
        self.state
            .lock()
            .unwrap()
            .describe_delays_ms
            .insert(job_id.to_string(), delay_ms);
    }

    pub fn describe_calls(&self) -> usize {
        self.state.lock().unwrap().describe_calls
    }

    pub fn add_external_job(&self, job: ActiveJob) {
        self.state.lock().unwrap().external.push(job);
    }

    pub fn set_engaged_resources(&self, count: usize) {
        self.state.lock().unwrap().engaged = count;
    }

    /// Jobs started through `start_job`, oldest first.
    pub fn started_jobs(&self) -> Vec<(String, LaunchConfig)> {
        self.state.lock().unwrap().started.clone()
    }
}

#[async_trait]
impl RecoveryService for FakeRecovery {
    async fn start_job(
        &self,
        _scope: &ServiceScope,
        resource_ids: &[String],
        launch: &LaunchConfig,
    ) -> Result<String, ExternalError> {
        let (job_id, delay_ms) = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.start_error.clone() {
                return Err(err);
            }
            let job_id = format!("drs-job-{}", state.started.len());
            state.jobs.insert(
                job_id.clone(),
                FakeJob {
                    resource_ids: resource_ids.to_vec(),
                    ..FakeJob::default()
                },
            );
            state.started.push((job_id.clone(), launch.clone()));
            (job_id, state.start_delay_ms)
        };

        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(job_id)
    }

    async fn describe_job(
        &self,
        _scope: &ServiceScope,
        job_id: &str,
    ) -> Result<JobSnapshot, ExternalError> {
        let delay_ms = self.state.lock().unwrap().describe_delays_ms.get(job_id).copied();
        if let Some(delay_ms) = delay_ms {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let mut state = self.state.lock().unwrap();
        state.describe_calls += 1;
        if let Some(err) = state.describe_error.clone() {
            return Err(err);
        }
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| ExternalError::Permanent(format!("Job {} not found", job_id)))?;

        let resources = job
            .resource_ids
            .iter()
            .map(|resource_id| {
                let (status, instance) = job
                    .statuses
                    .get(resource_id)
                    .cloned()
                    .unwrap_or_else(|| ("PENDING".to_string(), None));
                let mut record = json!({
                    "sourceServerID": resource_id,
                    "launchStatus": status,
                });
                if let Some(instance) = instance {
                    record["recoveryInstanceID"] = json!(instance);
                }
                into_record(record)
            })
            .collect();

        Ok(JobSnapshot {
            status: if job.completed { "COMPLETED" } else { "STARTED" }.to_string(),
            resources,
        })
    }

    async fn list_active_jobs(&self, _scope: &ServiceScope) -> Result<Vec<ActiveJob>, ExternalError> {
        let state = self.state.lock().unwrap();
        let mut jobs = state.external.clone();
        for (job_id, launch) in &state.started {
            if let Some(job) = state.jobs.get(job_id).filter(|job| !job.completed) {
                jobs.push(ActiveJob {
                    job_id: job_id.clone(),
                    resource_ids: job.resource_ids.clone(),
                    launched_by: Some(JobTag {
                        execution_id: launch.execution_id.clone(),
                        wave_number: launch.wave_number,
                    }),
                });
            }
        }
        Ok(jobs)
    }

    async fn count_engaged_resources(&self, _scope: &ServiceScope) -> Result<usize, ExternalError> {
        Ok(self.state.lock().unwrap().engaged)
    }
}

#[derive(Default)]
struct ComputeState {
    instances: HashMap<String, String>,
    batch_sizes: Vec<usize>,
    error: Option<ExternalError>,
}

#[derive(Default)]
pub struct FakeCompute {
    state: Mutex<ComputeState>,
}

impl FakeCompute {
    pub fn add_instance(&self, instance_id: &str, private_ip: &str) {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance_id.to_string(), private_ip.to_string());
    }

    pub fn fail_with(&self, err: ExternalError) {
        self.state.lock().unwrap().error = Some(err);
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().batch_sizes.clone()
    }
}

#[async_trait]
impl ComputeInventory for FakeCompute {
    async fn describe_instances(
        &self,
        _scope: &ServiceScope,
        instance_ids: &[String],
    ) -> Result<Vec<RawRecord>, ExternalError> {
        let mut state = self.state.lock().unwrap();
        state.batch_sizes.push(instance_ids.len());
        if let Some(err) = state.error.clone() {
            return Err(err);
        }
        Ok(instance_ids
            .iter()
            .filter_map(|id| {
                state.instances.get(id).map(|ip| {
                    into_record(json!({
                        "InstanceId": id,
                        "PrivateIpAddress": ip,
                        "PrivateDnsName": format!("ip-{}.internal", ip.replace('.', "-")),
                        "InstanceType": "m5.large",
                        "State": {"Code": 16, "Name": "running"},
                    }))
                })
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeBroker {
    deny: bool,
    calls: Mutex<usize>,
}

impl FakeBroker {
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl CredentialBroker for FakeBroker {
    async fn assume_scope(
        &self,
        account_id: &str,
        role_name: &str,
    ) -> Result<ScopeCredentials, ExternalError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if self.deny {
            return Err(ExternalError::Permanent(format!(
                "AccessDenied: cannot assume {} in {}",
                role_name, account_id
            )));
        }
        Ok(ScopeCredentials {
            access_key_id: format!("AKIA{}{}", account_id, call),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
            expires_at: chrono::Utc::now().timestamp_millis() + 3_600_000,
        })
    }
}

/// Millisecond backoff so retry paths stay fast under test.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
        call_timeout_ms: 2_000,
    }
}

/// A full engine over a temporary store and in-memory collaborators.
pub struct TestHarness {
    pub _dir: TempDir,
    pub repo: ExecutionRepository,
    pub recovery: Arc<FakeRecovery>,
    pub compute: Arc<FakeCompute>,
    pub broker: Arc<FakeBroker>,
    pub retry: RetryPolicy,
    pub conflicts: ConflictDetector,
    pub quotas: QuotaValidator,
    pub poll: PollService,
    pub finalizer: Finalizer,
    pub scheduler: WaveScheduler,
    pub poller: Poller,
    pub engine: Engine,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_poller(PollerSettings {
            budget_secs: 10,
            ..PollerSettings::default()
        })
        .await
    }

    pub async fn with_poller(poller: PollerSettings) -> Self {
        let (dir, repo) = test_repository().await;
        let recovery = Arc::new(FakeRecovery::default());
        let compute = Arc::new(FakeCompute::default());
        let broker = Arc::new(FakeBroker::default());
        let retry = fast_retry();
        let role = "RecoveryOrchestrationRole".to_string();

        let scopes = ScopeResolver::new(broker.clone(), role.clone(), retry.clone());
        let conflicts = ConflictDetector::new(repo.clone(), recovery.clone(), scopes.clone(), retry.clone());
        let quotas = QuotaValidator::new(
            repo.clone(),
            recovery.clone(),
            scopes,
            retry.clone(),
            QuotaLimits::default(),
        );

        let engine = Engine::new(
            repo.clone(),
            Collaborators {
                recovery: recovery.clone(),
                compute: compute.clone(),
                broker: broker.clone(),
            },
            EngineSettings {
                default_role_name: role,
                retry: retry.clone(),
                quotas: QuotaLimits::default(),
                poller,
            },
        );

        Self {
            _dir: dir,
            repo,
            recovery,
            compute,
            broker,
            retry,
            conflicts,
            quotas,
            poll: engine.poll.clone(),
            finalizer: engine.finalizer.clone(),
            scheduler: engine.scheduler.clone(),
            poller: engine.poller.clone(),
            engine,
        }
    }
}
