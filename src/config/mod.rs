use crate::clients::RetryPolicy;
use crate::services::{PollerSettings, QuotaLimits};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub recovery_service_url: String,
    pub compute_inventory_url: String,
    pub credential_broker_url: String,
    /// Role assumed for cross-account scopes that do not name one.
    pub default_role_name: String,
    pub http_timeout_secs: u64,
    pub poller: PollerSettings,
    pub quotas: QuotaLimits,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let database_url = crate::paths::data_dir()
            .map(|dir| format!("sqlite:{}", dir.join("wave_node.db").display()))
            .unwrap_or_else(|_| "sqlite:wave_node.db".to_string());
        Self {
            database_url,
            recovery_service_url: "http://127.0.0.1:6801".to_string(),
            compute_inventory_url: "http://127.0.0.1:6802".to_string(),
            credential_broker_url: "http://127.0.0.1:6803".to_string(),
            default_role_name: "RecoveryOrchestrationRole".to_string(),
            http_timeout_secs: 15,
            poller: PollerSettings::default(),
            quotas: QuotaLimits::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = Self::from_conf_file()? {
            config.apply_file(file_config);
        }

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }
        if let Ok(url) = std::env::var("RECOVERY_SERVICE_URL") {
            config.recovery_service_url = url;
        }
        if let Ok(url) = std::env::var("COMPUTE_INVENTORY_URL") {
            config.compute_inventory_url = url;
        }
        if let Ok(url) = std::env::var("CREDENTIAL_BROKER_URL") {
            config.credential_broker_url = url;
        }
        if let Ok(role) = std::env::var("DEFAULT_ROLE_NAME") {
            config.default_role_name = role;
        }

        env_override("HTTP_TIMEOUT_SECS", &mut config.http_timeout_secs)?;
        env_override("POLL_INTERVAL_SECS", &mut config.poller.interval_secs)?;
        env_override("POLL_CONCURRENCY", &mut config.poller.concurrency)?;
        env_override("POLL_BUDGET_SECS", &mut config.poller.budget_secs)?;
        env_override("MAX_RESOURCES_PER_JOB", &mut config.quotas.max_resources_per_job)?;
        env_override("MAX_CONCURRENT_JOBS", &mut config.quotas.max_concurrent_jobs)?;
        env_override(
            "MAX_RESOURCES_IN_ACTIVE_JOBS",
            &mut config.quotas.max_resources_in_active_jobs,
        )?;
        env_override("ACCOUNT_RESOURCE_CEILING", &mut config.quotas.account_ceiling)?;

        config.normalize_database_url()?;
        config.validate()?;
        Ok(config)
    }

    fn from_conf_file() -> Result<Option<FileConfig>> {
        let path = crate::paths::conf_dir()?.join("config.json");
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file_config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(Some(file_config))
    }

    fn apply_file(&mut self, file_config: FileConfig) {
        if let Some(database_url) = file_config.database_url {
            self.database_url = database_url;
        }
        if let Some(url) = file_config.recovery_service_url {
            self.recovery_service_url = url;
        }
        if let Some(url) = file_config.compute_inventory_url {
            self.compute_inventory_url = url;
        }
        if let Some(url) = file_config.credential_broker_url {
            self.credential_broker_url = url;
        }
        if let Some(role) = file_config.default_role_name {
            self.default_role_name = role;
        }
        if let Some(timeout) = file_config.http_timeout_secs {
            self.http_timeout_secs = timeout;
        }
        if let Some(poller) = file_config.poller {
            self.poller = poller;
        }
        if let Some(quotas) = file_config.quotas {
            self.quotas = quotas;
        }
        if let Some(retry) = file_config.retry {
            self.retry = retry;
        }
    }

    fn normalize_database_url(&mut self) -> Result<()> {
        let Some(path_str) = self.database_url.strip_prefix("sqlite:") else {
            return Ok(());
        };

        let path = Path::new(path_str);
        if path.is_absolute() {
            return Ok(());
        }

        if path
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            anyhow::bail!("SQLite database path cannot contain '..'");
        }

        let root = crate::paths::install_root()?;
        let absolute = root.join(path);
        self.database_url = format!("sqlite:{}", absolute.display());
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.poller.concurrency == 0 {
            anyhow::bail!("poller.concurrency must be at least 1");
        }
        if self.poller.compute_batch_size == 0 {
            anyhow::bail!("poller.compute_batch_size must be at least 1");
        }
        if self.quotas.max_resources_per_job == 0 {
            anyhow::bail!("quotas.max_resources_per_job must be at least 1");
        }
        let quotas = &self.quotas;
        if !(0.0..=1.0).contains(&quotas.warning_ratio)
            || !(0.0..=1.0).contains(&quotas.blocking_ratio)
            || quotas.warning_ratio > quotas.blocking_ratio
        {
            anyhow::bail!("quota ratios must satisfy 0 <= warning_ratio <= blocking_ratio <= 1");
        }
        Ok(())
    }
}

fn env_override<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", name, raw))?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    database_url: Option<String>,
    recovery_service_url: Option<String>,
    compute_inventory_url: Option<String>,
    credential_broker_url: Option<String>,
    default_role_name: Option<String>,
    http_timeout_secs: Option<u64>,
    poller: Option<PollerSettings>,
    quotas: Option<QuotaLimits>,
    retry: Option<RetryPolicy>,
}
