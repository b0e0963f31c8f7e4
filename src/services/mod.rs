pub mod conflict_detector;
pub mod enrichment;
pub mod finalizer;
pub mod poll_service;
pub mod poller;
pub mod quota_validator;
pub mod wave_scheduler;

pub use conflict_detector::ConflictDetector;
pub use finalizer::Finalizer;
pub use poll_service::PollService;
pub use poller::{Poller, PollerSettings};
pub use quota_validator::{QuotaLimits, QuotaValidator};
pub use wave_scheduler::WaveScheduler;
