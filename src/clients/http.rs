//! JSON-over-HTTP adapters for the collaborator services.

use super::{
    ActiveJob, ComputeInventory, CredentialBroker, ExternalError, JobSnapshot, JobTag, LaunchConfig,
    RawRecord, RecoveryService, ScopeCredentials, ServiceScope,
};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

const SCOPE_ACCOUNT_HEADER: &str = "x-scope-account";
const SCOPE_ACCESS_KEY_HEADER: &str = "x-scope-access-key";

fn build_client(timeout: Duration) -> Result<reqwest::Client, ExternalError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ExternalError::Permanent(format!("Failed to build HTTP client: {}", e)))
}

fn classify_status(status: StatusCode, body: &str) -> ExternalError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ExternalError::Transient(message)
    } else {
        ExternalError::Permanent(message)
    }
}

fn classify_request_error(err: reqwest::Error) -> ExternalError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ExternalError::Transient(err.to_string())
    } else {
        ExternalError::Permanent(err.to_string())
    }
}

fn with_scope(request: RequestBuilder, scope: &ServiceScope) -> RequestBuilder {
    let mut request = request;
    if let Some(account_id) = &scope.account.account_id {
        request = request.header(SCOPE_ACCOUNT_HEADER, account_id);
    }
    if let Some(credentials) = &scope.credentials {
        request = request
            .header(SCOPE_ACCESS_KEY_HEADER, &credentials.access_key_id)
            .bearer_auth(&credentials.session_token);
    }
    request
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ExternalError> {
    let response = request.send().await.map_err(classify_request_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ExternalError::Permanent(format!("Invalid response body: {}", e)))
}

#[derive(Clone)]
pub struct HttpRecoveryService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRecoveryService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExternalError> {
        Ok(Self {
            http: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StartJobResponse {
    #[serde(alias = "jobID", alias = "jobId", alias = "JobId")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct DescribeJobResponse {
    #[serde(alias = "Status")]
    status: String,
    #[serde(default, alias = "participatingResources", alias = "participatingServers")]
    resources: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct JobTagsEntry {
    #[serde(alias = "executionId")]
    execution_id: Option<String>,
    #[serde(alias = "waveNumber")]
    wave: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ActiveJobEntry {
    #[serde(alias = "jobID", alias = "jobId")]
    job_id: String,
    #[serde(default, alias = "resourceIds", alias = "sourceServerIDs")]
    resource_ids: Vec<String>,
    #[serde(default)]
    tags: Option<JobTagsEntry>,
}

impl ActiveJobEntry {
    fn into_active_job(self) -> ActiveJob {
        let launched_by = self.tags.and_then(|tags| {
            Some(JobTag {
                execution_id: tags.execution_id?,
                wave_number: tags.wave?,
            })
        });
        ActiveJob {
            job_id: self.job_id,
            resource_ids: self.resource_ids,
            launched_by,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActiveJobsResponse {
    #[serde(default)]
    items: Vec<ActiveJobEntry>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

#[async_trait]
impl RecoveryService for HttpRecoveryService {
    async fn start_job(
        &self,
        scope: &ServiceScope,
        resource_ids: &[String],
        launch: &LaunchConfig,
    ) -> Result<String, ExternalError> {
        let request = self
            .http
            .post(format!("{}/jobs", self.base_url))
            .json(&json!({
                "resourceIds": resource_ids,
                "isDrill": launch.is_drill,
                "tags": {
                    "executionId": launch.execution_id,
                    "wave": launch.wave_number,
                },
            }));
        let response: StartJobResponse = send_json(with_scope(request, scope)).await?;
        Ok(response.job_id)
    }

    async fn describe_job(
        &self,
        scope: &ServiceScope,
        job_id: &str,
    ) -> Result<JobSnapshot, ExternalError> {
        let request = self.http.get(format!("{}/jobs/{}", self.base_url, job_id));
        let response: DescribeJobResponse = send_json(with_scope(request, scope)).await?;
        Ok(JobSnapshot {
            status: response.status,
            resources: response.resources,
        })
    }

    async fn list_active_jobs(&self, scope: &ServiceScope) -> Result<Vec<ActiveJob>, ExternalError> {
        let request = self
            .http
            .get(format!("{}/jobs", self.base_url))
            .query(&[("status", "active")]);
        let response: ActiveJobsResponse = send_json(with_scope(request, scope)).await?;
        Ok(response
            .items
            .into_iter()
            .map(ActiveJobEntry::into_active_job)
            .collect())
    }

    async fn count_engaged_resources(&self, scope: &ServiceScope) -> Result<usize, ExternalError> {
        let request = self
            .http
            .get(format!("{}/engaged-resources/count", self.base_url));
        let response: CountResponse = send_json(with_scope(request, scope)).await?;
        Ok(response.count)
    }
}

#[derive(Clone)]
pub struct HttpComputeInventory {
    http: reqwest::Client,
    base_url: String,
}

impl HttpComputeInventory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExternalError> {
        Ok(Self {
            http: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DescribeInstancesResponse {
    #[serde(default, alias = "Instances", alias = "reservations")]
    instances: Vec<RawRecord>,
}

#[async_trait]
impl ComputeInventory for HttpComputeInventory {
    async fn describe_instances(
        &self,
        scope: &ServiceScope,
        instance_ids: &[String],
    ) -> Result<Vec<RawRecord>, ExternalError> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .http
            .post(format!("{}/instances/describe", self.base_url))
            .json(&json!({ "instanceIds": instance_ids }));
        let response: DescribeInstancesResponse = send_json(with_scope(request, scope)).await?;
        Ok(response.instances)
    }
}

#[derive(Clone)]
pub struct HttpCredentialBroker {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCredentialBroker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExternalError> {
        Ok(Self {
            http: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssumeScopeResponse {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    #[serde(alias = "expiration")]
    expires_at: i64,
}

#[async_trait]
impl CredentialBroker for HttpCredentialBroker {
    async fn assume_scope(
        &self,
        account_id: &str,
        role_name: &str,
    ) -> Result<ScopeCredentials, ExternalError> {
        let request = self
            .http
            .post(format!("{}/assume", self.base_url))
            .json(&json!({ "accountId": account_id, "roleName": role_name }));
        let response: AssumeScopeResponse = send_json(request).await?;
        Ok(ScopeCredentials {
            access_key_id: response.access_key_id,
            secret_access_key: response.secret_access_key,
            session_token: response.session_token,
            expires_at: response.expires_at,
        })
    }
}
