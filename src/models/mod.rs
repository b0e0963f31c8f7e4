pub mod execution;
pub mod resource;

pub use execution::{AccountContext, Execution, ExecutionStatus, ResourceBatch, Wave, WaveStatus};
pub use resource::{RecoveryStatus, ResourceStatus};
