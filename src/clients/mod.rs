//! Collaborator interfaces for the external recovery, compute inventory and
//! credential services.
//!
//! Every handle is injected into the components that need it; nothing here is
//! process-global.

pub mod http;
pub mod retry;
pub mod scope;

use crate::models::AccountContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use http::{HttpComputeInventory, HttpCredentialBroker, HttpRecoveryService};
pub use retry::{RetryPolicy, with_retry};
pub use scope::ScopeResolver;

/// Raw record as returned by a collaborator, before field normalization.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// Rate limiting, timeouts and internal service errors.
    #[error("{0}")]
    Transient(String),
    /// Access denied, not found, malformed responses.
    #[error("{0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ScopeCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: i64,
}

impl fmt::Debug for ScopeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// A resolved call scope: the account context plus delegated credentials when
/// the context targets a non-default account.
#[derive(Debug, Clone, Default)]
pub struct ServiceScope {
    pub account: AccountContext,
    pub credentials: Option<ScopeCredentials>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchConfig {
    pub execution_id: String,
    pub wave_number: u32,
    pub is_drill: bool,
}

#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// Raw job status as reported by the service.
    pub status: String,
    pub resources: Vec<RawRecord>,
}

/// The execution and wave a job was launched for, echoed back by the service
/// from the tags sent with [`LaunchConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTag {
    pub execution_id: String,
    pub wave_number: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveJob {
    pub job_id: String,
    pub resource_ids: Vec<String>,
    /// `None` for jobs started outside this engine.
    pub launched_by: Option<JobTag>,
}

impl ActiveJob {
    pub fn launched_for(&self, execution_id: &str) -> bool {
        self.launched_by
            .as_ref()
            .is_some_and(|tag| tag.execution_id == execution_id)
    }
}

#[async_trait]
pub trait RecoveryService: Send + Sync {
    async fn start_job(
        &self,
        scope: &ServiceScope,
        resource_ids: &[String],
        launch: &LaunchConfig,
    ) -> Result<String, ExternalError>;

    async fn describe_job(
        &self,
        scope: &ServiceScope,
        job_id: &str,
    ) -> Result<JobSnapshot, ExternalError>;

    /// Jobs the service currently considers live, including ones started
    /// outside this engine.
    async fn list_active_jobs(&self, scope: &ServiceScope) -> Result<Vec<ActiveJob>, ExternalError>;

    /// Account-wide count of resources actively engaged with the service.
    async fn count_engaged_resources(&self, scope: &ServiceScope) -> Result<usize, ExternalError>;
}

#[async_trait]
pub trait ComputeInventory: Send + Sync {
    async fn describe_instances(
        &self,
        scope: &ServiceScope,
        instance_ids: &[String],
    ) -> Result<Vec<RawRecord>, ExternalError>;
}

#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn assume_scope(
        &self,
        account_id: &str,
        role_name: &str,
    ) -> Result<ScopeCredentials, ExternalError>;
}
