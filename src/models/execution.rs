use super::resource::ResourceStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub status: ExecutionStatus,
    pub total_waves: u32,
    pub waves: Vec<Wave>,
    pub is_drill: bool,
    pub account_context: AccountContext,
    pub created_time: i64,
    pub last_polled_time: Option<i64>,
    pub completed_time: Option<i64>,
    pub error: Option<String>,
}

impl Execution {
    /// Always derived from the wave list; there is no stored counter.
    pub fn completed_waves(&self) -> usize {
        self.waves
            .iter()
            .filter(|wave| wave.status == WaveStatus::Completed)
            .count()
    }

    pub fn all_waves_complete(&self) -> bool {
        !self.waves.is_empty()
            && self.waves.len() == self.total_waves as usize
            && self.completed_waves() == self.waves.len()
    }

    pub fn active_wave(&self) -> Option<&Wave> {
        self.waves
            .iter()
            .find(|wave| wave.status == WaveStatus::Polling)
    }

    pub fn next_pending_wave(&self) -> Option<&Wave> {
        self.waves
            .iter()
            .find(|wave| wave.status == WaveStatus::Pending)
    }

    pub fn failed_wave(&self) -> Option<&Wave> {
        self.waves
            .iter()
            .find(|wave| wave.status == WaveStatus::Failed)
    }

    pub fn wave(&self, wave_number: u32) -> Option<&Wave> {
        self.waves.get(wave_number as usize)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum ExecutionStatus {
    Pending = 0,
    Polling = 1,
    Paused = 2,
    Cancelling = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl ExecutionStatus {
    pub const TERMINAL: [ExecutionStatus; 3] = [Self::Completed, Self::Failed, Self::Cancelled];
    pub const ACTIVE: [ExecutionStatus; 4] =
        [Self::Pending, Self::Polling, Self::Paused, Self::Cancelling];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Polling => "POLLING",
            Self::Paused => "PAUSED",
            Self::Cancelling => "CANCELLING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    pub wave_number: u32,
    pub status: WaveStatus,
    pub job_id: Option<String>,
    /// The requested batch, fixed when the execution is created.
    pub resource_ids: Vec<String>,
    pub resources: Vec<ResourceStatus>,
    /// When set, the execution pauses after the preceding wave completes
    /// instead of starting this one.
    pub pause_before: bool,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum WaveStatus {
    Pending = 0,
    Polling = 1,
    Completed = 2,
    Failed = 3,
}

impl WaveStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Target scope for calls into the external services. `None` fields mean the
/// engine's own default scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AccountContext {
    pub account_id: Option<String>,
    pub role_name: Option<String>,
}

impl AccountContext {
    /// Key used when grouping counts per scope.
    pub fn scope_key(&self) -> &str {
        self.account_id.as_deref().unwrap_or("default")
    }
}

/// One wave's worth of resources as requested by the caller of `start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceBatch {
    pub resource_ids: Vec<String>,
    #[serde(default)]
    pub pause_before: bool,
}

#[cfg(test)]
impl ResourceBatch {
    pub fn new<I, S>(resource_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_ids: resource_ids.into_iter().map(Into::into).collect(),
            pause_before: false,
        }
    }

    pub fn paused(mut self) -> Self {
        self.pause_before = true;
        self
    }
}
