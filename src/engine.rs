use crate::clients::{
    ComputeInventory, CredentialBroker, ExternalError, HttpComputeInventory, HttpCredentialBroker,
    HttpRecoveryService, RecoveryService, RetryPolicy, ScopeResolver,
};
use crate::config::Config;
use crate::repository::ExecutionRepository;
use crate::services::{
    ConflictDetector, Finalizer, PollService, Poller, PollerSettings, QuotaLimits, QuotaValidator,
    WaveScheduler,
};
use std::sync::Arc;
use std::time::Duration;

/// Handles to the external services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub recovery: Arc<dyn RecoveryService>,
    pub compute: Arc<dyn ComputeInventory>,
    pub broker: Arc<dyn CredentialBroker>,
}

impl Collaborators {
    pub fn http(config: &Config) -> Result<Self, ExternalError> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        Ok(Self {
            recovery: Arc::new(HttpRecoveryService::new(&config.recovery_service_url, timeout)?),
            compute: Arc::new(HttpComputeInventory::new(&config.compute_inventory_url, timeout)?),
            broker: Arc::new(HttpCredentialBroker::new(&config.credential_broker_url, timeout)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_role_name: String,
    pub retry: RetryPolicy,
    pub quotas: QuotaLimits,
    pub poller: PollerSettings,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_role_name: config.default_role_name.clone(),
            retry: config.retry.clone(),
            quotas: config.quotas.clone(),
            poller: config.poller.clone(),
        }
    }
}

/// Every component wired against one store and one set of collaborators.
#[derive(Clone)]
pub struct Engine {
    pub poll: PollService,
    pub finalizer: Finalizer,
    pub scheduler: WaveScheduler,
    pub poller: Poller,
}

impl Engine {
    pub fn new(repo: ExecutionRepository, collaborators: Collaborators, settings: EngineSettings) -> Self {
        let Collaborators {
            recovery,
            compute,
            broker,
        } = collaborators;
        let retry = settings.retry;
        let scopes = ScopeResolver::new(broker, settings.default_role_name, retry.clone());

        let conflicts = ConflictDetector::new(repo.clone(), recovery.clone(), scopes.clone(), retry.clone());
        let quotas = QuotaValidator::new(
            repo.clone(),
            recovery.clone(),
            scopes.clone(),
            retry.clone(),
            settings.quotas,
        );
        let poll = PollService::new(
            repo.clone(),
            recovery.clone(),
            compute,
            scopes.clone(),
            retry.clone(),
            settings.poller.compute_batch_size,
        );
        let finalizer = Finalizer::new(repo.clone());
        let scheduler = WaveScheduler::new(
            repo.clone(),
            recovery,
            scopes,
            conflicts,
            quotas,
            finalizer.clone(),
            retry,
        );
        let poller = Poller::new(repo, poll.clone(), scheduler.clone(), settings.poller);

        Self {
            poll,
            finalizer,
            scheduler,
            poller,
        }
    }
}
