use crate::error::{AppError, Result};
use crate::models::{ExecutionStatus, WaveStatus};
use crate::repository::{ExecutionRepository, UpdateOutcome};
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub already_finalized: bool,
    pub completed_time: Option<i64>,
}

/// Owns the terminal success transitions. Safe to call concurrently: the
/// status write is conditional, and losing the race counts as success.
#[derive(Clone)]
pub struct Finalizer {
    repo: ExecutionRepository,
}

impl Finalizer {
    pub fn new(repo: ExecutionRepository) -> Self {
        Self { repo }
    }

    pub async fn finalize(&self, execution_id: &str) -> Result<FinalizeOutcome> {
        let execution = self.repo.get(execution_id).await?;

        let completed = execution.completed_waves();
        let total = execution.total_waves as usize;
        if completed != total || !execution.all_waves_complete() {
            return Err(AppError::FinalizationPrecondition {
                execution_id: execution_id.to_string(),
                completed,
                total,
            });
        }

        if execution.status == ExecutionStatus::Completed {
            return Ok(FinalizeOutcome {
                execution_id: execution.id,
                status: ExecutionStatus::Completed,
                already_finalized: true,
                completed_time: execution.completed_time,
            });
        }

        let now = Utc::now().timestamp_millis();
        let outcome = self
            .repo
            .transition_status(
                execution_id,
                &ExecutionStatus::ACTIVE,
                ExecutionStatus::Completed,
                Some(now),
                None,
            )
            .await?;

        match outcome {
            UpdateOutcome::Applied => {
                tracing::info!(execution_id, total_waves = total, "Execution finalized");
                Ok(FinalizeOutcome {
                    execution_id: execution_id.to_string(),
                    status: ExecutionStatus::Completed,
                    already_finalized: false,
                    completed_time: Some(now),
                })
            }
            UpdateOutcome::ConditionFailed => self.settled(execution_id, ExecutionStatus::Completed).await,
        }
    }

    /// Finishes a cooperative cancellation once no wave is in flight.
    pub async fn finalize_cancelled(&self, execution_id: &str) -> Result<FinalizeOutcome> {
        let execution = self.repo.get(execution_id).await?;

        if execution.status == ExecutionStatus::Cancelled {
            return Ok(FinalizeOutcome {
                execution_id: execution.id,
                status: ExecutionStatus::Cancelled,
                already_finalized: true,
                completed_time: execution.completed_time,
            });
        }
        if execution.status != ExecutionStatus::Cancelling {
            return Err(AppError::InvalidTransition {
                execution_id: execution_id.to_string(),
                operation: "finalize_cancelled",
                status: execution.status.to_string(),
            });
        }
        if execution
            .waves
            .iter()
            .any(|wave| wave.status == WaveStatus::Polling)
        {
            return Err(AppError::FinalizationPrecondition {
                execution_id: execution_id.to_string(),
                completed: execution.completed_waves(),
                total: execution.total_waves as usize,
            });
        }

        let now = Utc::now().timestamp_millis();
        let outcome = self
            .repo
            .transition_status(
                execution_id,
                &[ExecutionStatus::Cancelling],
                ExecutionStatus::Cancelled,
                Some(now),
                None,
            )
            .await?;

        match outcome {
            UpdateOutcome::Applied => {
                tracing::info!(execution_id, "Execution cancelled");
                Ok(FinalizeOutcome {
                    execution_id: execution_id.to_string(),
                    status: ExecutionStatus::Cancelled,
                    already_finalized: false,
                    completed_time: Some(now),
                })
            }
            UpdateOutcome::ConditionFailed => self.settled(execution_id, ExecutionStatus::Cancelled).await,
        }
    }

    /// Another writer changed the status first; succeed only if it reached
    /// the same terminal status.
    async fn settled(&self, execution_id: &str, expected: ExecutionStatus) -> Result<FinalizeOutcome> {
        let current = self.repo.get(execution_id).await?;
        if current.status == expected {
            tracing::debug!(execution_id, status = %expected, "Lost finalize race, already finalized");
            return Ok(FinalizeOutcome {
                execution_id: current.id,
                status: expected,
                already_finalized: true,
                completed_time: current.completed_time,
            });
        }
        Err(AppError::InvalidTransition {
            execution_id: execution_id.to_string(),
            operation: "finalize",
            status: current.status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::WaveProgress;
    use crate::testing::{new_execution, test_repository};

    async fn complete_wave(repo: &ExecutionRepository, id: &str, wave_number: u32) {
        repo.activate_wave(id, wave_number, &format!("job-{}", wave_number), 1)
            .await
            .unwrap();
        let progress = WaveProgress {
            status: WaveStatus::Completed,
            resources: Vec::new(),
            end_time: Some(2),
            error: None,
        };
        repo.record_poll(id, wave_number, &progress, 2).await.unwrap();
    }

    #[tokio::test]
    async fn incomplete_waves_block_finalization_without_mutation() {
        let (_dir, repo) = test_repository().await;
        let execution = new_execution(&[&["a"], &["b"]]);
        repo.create(&execution).await.unwrap();
        complete_wave(&repo, &execution.id, 0).await;
        repo.activate_wave(&execution.id, 1, "job-1", 3).await.unwrap();
        let finalizer = Finalizer::new(repo.clone());

        let err = finalizer.finalize(&execution.id).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::FinalizationPrecondition { completed: 1, total: 2, .. }
        ));
        let loaded = repo.get(&execution.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Polling);
        assert_eq!(loaded.completed_time, None);
    }

    #[tokio::test]
    async fn second_finalize_is_an_idempotent_noop() {
        let (_dir, repo) = test_repository().await;
        let execution = new_execution(&[&["a"]]);
        repo.create(&execution).await.unwrap();
        complete_wave(&repo, &execution.id, 0).await;
        let finalizer = Finalizer::new(repo.clone());

        let first = finalizer.finalize(&execution.id).await.unwrap();
        let second = finalizer.finalize(&execution.id).await.unwrap();

        assert!(!first.already_finalized);
        assert!(second.already_finalized);
        assert_eq!(first.completed_time, second.completed_time);
        assert_eq!(
            repo.get(&execution.id).await.unwrap().completed_time,
            first.completed_time
        );
    }

    #[tokio::test]
    async fn concurrent_finalize_has_exactly_one_winner() {
        let (_dir, repo) = test_repository().await;
        let execution = new_execution(&[&["a"], &["b"]]);
        repo.create(&execution).await.unwrap();
        complete_wave(&repo, &execution.id, 0).await;
        complete_wave(&repo, &execution.id, 1).await;
        let finalizer = Finalizer::new(repo.clone());

        let (a, b) = tokio::join!(
            finalizer.finalize(&execution.id),
            finalizer.finalize(&execution.id)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| !o.already_finalized).count(), 1);
        assert!(outcomes.iter().all(|o| o.status == ExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn cancelled_execution_finalizes_once_idle() {
        let (_dir, repo) = test_repository().await;
        let execution = new_execution(&[&["a"], &["b"]]);
        repo.create(&execution).await.unwrap();
        repo.transition_status(
            &execution.id,
            &[ExecutionStatus::Pending],
            ExecutionStatus::Cancelling,
            None,
            None,
        )
        .await
        .unwrap();
        let finalizer = Finalizer::new(repo.clone());

        let outcome = finalizer.finalize_cancelled(&execution.id).await.unwrap();
        let again = finalizer.finalize_cancelled(&execution.id).await.unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert!(!outcome.already_finalized);
        assert!(again.already_finalized);
    }
}
