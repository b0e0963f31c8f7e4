use crate::error::{AppError, Result};
use crate::models::{
    AccountContext, Execution, ExecutionStatus, ResourceStatus, Wave, WaveStatus,
};
use crate::repository::DbPool;

/// Result of a conditional write. `ConditionFailed` is an expected outcome
/// (another writer got there first), not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    ConditionFailed,
}

impl UpdateOutcome {
    fn from_rows(rows_affected: u64) -> Self {
        if rows_affected > 0 {
            Self::Applied
        } else {
            Self::ConditionFailed
        }
    }

    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}

/// The fields a poll cycle owns on a wave.
#[derive(Debug, Clone)]
pub struct WaveProgress {
    pub status: WaveStatus,
    pub resources: Vec<ResourceStatus>,
    pub end_time: Option<i64>,
    pub error: Option<String>,
}

/// A PENDING or POLLING wave belonging to a non-terminal execution.
#[derive(Debug, Clone)]
pub struct OpenWave {
    pub execution_id: String,
    pub account: AccountContext,
    pub wave_number: u32,
    pub status: WaveStatus,
    pub job_id: Option<String>,
    pub resource_ids: Vec<String>,
    /// PENDING wave whose job is being launched.
    pub launching: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    status: ExecutionStatus,
    total_waves: i64,
    is_drill: bool,
    account_id: Option<String>,
    role_name: Option<String>,
    created_time: i64,
    last_polled_time: Option<i64>,
    completed_time: Option<i64>,
    error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct WaveRow {
    wave_number: i64,
    status: WaveStatus,
    job_id: Option<String>,
    resource_ids: String,
    resources: String,
    pause_before: bool,
    start_time: Option<i64>,
    end_time: Option<i64>,
    error: Option<String>,
}

impl WaveRow {
    fn into_wave(self) -> Result<Wave> {
        Ok(Wave {
            wave_number: self.wave_number as u32,
            status: self.status,
            job_id: self.job_id,
            resource_ids: serde_json::from_str(&self.resource_ids)?,
            resources: serde_json::from_str(&self.resources)?,
            pause_before: self.pause_before,
            start_time: self.start_time,
            end_time: self.end_time,
            error: self.error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OpenWaveRow {
    execution_id: String,
    account_id: Option<String>,
    role_name: Option<String>,
    wave_number: i64,
    status: WaveStatus,
    job_id: Option<String>,
    resource_ids: String,
    reserved_at: Option<i64>,
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[derive(Clone)]
pub struct ExecutionRepository {
    pool: DbPool,
}

impl ExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persists an execution together with all of its planned waves.
    pub async fn create(&self, execution: &Execution) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, status, total_waves, is_drill, account_id, role_name, created_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(execution.status as i32)
        .bind(execution.total_waves as i64)
        .bind(execution.is_drill)
        .bind(&execution.account_context.account_id)
        .bind(&execution.account_context.role_name)
        .bind(execution.created_time)
        .execute(&mut *tx)
        .await?;

        for wave in &execution.waves {
            sqlx::query(
                r#"
                INSERT INTO waves (execution_id, wave_number, status, job_id, resource_ids, resources, pause_before)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&execution.id)
            .bind(wave.wave_number as i64)
            .bind(wave.status as i32)
            .bind(&wave.job_id)
            .bind(serde_json::to_string(&wave.resource_ids)?)
            .bind(serde_json::to_string(&wave.resources)?)
            .bind(wave.pause_before)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM waves WHERE execution_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ExecutionNotFound(id.to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Execution> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::ExecutionNotFound(id.to_string()))?;

        self.hydrate(row).await
    }

    pub async fn list_all(&self) -> Result<Vec<Execution>> {
        let rows =
            sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions ORDER BY created_time DESC")
                .fetch_all(&self.pool)
                .await?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            executions.push(self.hydrate(row).await?);
        }
        Ok(executions)
    }

    pub async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT * FROM executions WHERE status IN ({}) ORDER BY created_time ASC",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query_as::<_, ExecutionRow>(&sql);
        for status in statuses {
            query = query.bind(*status as i32);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            executions.push(self.hydrate(row).await?);
        }
        Ok(executions)
    }

    /// Waves that still hold their resources: PENDING or POLLING waves of
    /// executions that have not reached a terminal status.
    pub async fn list_open_waves(&self, exclude_execution_id: Option<&str>) -> Result<Vec<OpenWave>> {
        let mut sql = format!(
            r#"
            SELECT w.execution_id, e.account_id, e.role_name, w.wave_number, w.status, w.job_id, w.resource_ids, w.reserved_at
            FROM waves w
            JOIN executions e ON e.id = w.execution_id
            WHERE e.status IN ({}) AND w.status IN (?, ?)
            "#,
            placeholders(ExecutionStatus::ACTIVE.len())
        );
        if exclude_execution_id.is_some() {
            sql.push_str(" AND w.execution_id != ?");
        }

        let mut query = sqlx::query_as::<_, OpenWaveRow>(&sql);
        for status in ExecutionStatus::ACTIVE {
            query = query.bind(status as i32);
        }
        query = query
            .bind(WaveStatus::Pending as i32)
            .bind(WaveStatus::Polling as i32);
        if let Some(exclude) = exclude_execution_id {
            query = query.bind(exclude);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| -> Result<OpenWave> {
                Ok(OpenWave {
                    execution_id: row.execution_id,
                    account: AccountContext {
                        account_id: row.account_id,
                        role_name: row.role_name,
                    },
                    wave_number: row.wave_number as u32,
                    status: row.status,
                    job_id: row.job_id,
                    resource_ids: serde_json::from_str(&row.resource_ids)?,
                    launching: row.status == WaveStatus::Pending && row.reserved_at.is_some(),
                })
            })
            .collect()
    }

    /// Sets the execution status only if the current status is one of `from`.
    pub async fn transition_status(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        completed_time: Option<i64>,
        error: Option<&str>,
    ) -> Result<UpdateOutcome> {
        let sql = format!(
            r#"
            UPDATE executions
            SET status = ?, completed_time = COALESCE(?, completed_time), error = COALESCE(?, error)
            WHERE id = ? AND status IN ({})
            "#,
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to as i32)
            .bind(completed_time)
            .bind(error)
            .bind(id);
        for status in from {
            query = query.bind(*status as i32);
        }

        let result = query.execute(&self.pool).await?;
        Ok(UpdateOutcome::from_rows(result.rows_affected()))
    }

    /// Records a started job on a PENDING wave and moves a live execution to
    /// POLLING. The wave write is the condition; an execution that moved on
    /// (for example to CANCELLING) keeps its status.
    pub async fn activate_wave(
        &self,
        id: &str,
        wave_number: u32,
        job_id: &str,
        start_time: i64,
    ) -> Result<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        let wave = sqlx::query(
            r#"
            UPDATE waves
            SET status = ?, job_id = ?, start_time = ?, error = NULL, reserved_at = NULL
            WHERE execution_id = ? AND wave_number = ? AND status = ?
            "#,
        )
        .bind(WaveStatus::Polling as i32)
        .bind(job_id)
        .bind(start_time)
        .bind(id)
        .bind(wave_number as i64)
        .bind(WaveStatus::Pending as i32)
        .execute(&mut *tx)
        .await?;

        if wave.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(UpdateOutcome::ConditionFailed);
        }

        sqlx::query("UPDATE executions SET status = ? WHERE id = ? AND status IN (?, ?, ?)")
            .bind(ExecutionStatus::Polling as i32)
            .bind(id)
            .bind(ExecutionStatus::Pending as i32)
            .bind(ExecutionStatus::Polling as i32)
            .bind(ExecutionStatus::Paused as i32)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(UpdateOutcome::Applied)
    }

    /// Claims the launch of a PENDING wave. Fails while another launch holds
    /// a reservation taken at or after `stale_before`.
    pub async fn reserve_wave(
        &self,
        id: &str,
        wave_number: u32,
        reserved_at: i64,
        stale_before: i64,
    ) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE waves
            SET reserved_at = ?
            WHERE execution_id = ? AND wave_number = ? AND status = ?
              AND (reserved_at IS NULL OR reserved_at < ?)
            "#,
        )
        .bind(reserved_at)
        .bind(id)
        .bind(wave_number as i64)
        .bind(WaveStatus::Pending as i32)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(UpdateOutcome::from_rows(result.rows_affected()))
    }

    pub async fn release_wave(&self, id: &str, wave_number: u32) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            "UPDATE waves SET reserved_at = NULL WHERE execution_id = ? AND wave_number = ? AND status = ?",
        )
        .bind(id)
        .bind(wave_number as i64)
        .bind(WaveStatus::Pending as i32)
        .execute(&self.pool)
        .await?;

        Ok(UpdateOutcome::from_rows(result.rows_affected()))
    }

    pub async fn fail_wave(
        &self,
        id: &str,
        wave_number: u32,
        error: &str,
        end_time: i64,
    ) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE waves
            SET status = ?, error = ?, end_time = ?
            WHERE execution_id = ? AND wave_number = ? AND status IN (?, ?)
            "#,
        )
        .bind(WaveStatus::Failed as i32)
        .bind(error)
        .bind(end_time)
        .bind(id)
        .bind(wave_number as i64)
        .bind(WaveStatus::Pending as i32)
        .bind(WaveStatus::Polling as i32)
        .execute(&self.pool)
        .await?;

        Ok(UpdateOutcome::from_rows(result.rows_affected()))
    }

    /// Writes a poll cycle's result. Touches only the wave progress fields and
    /// `last_polled_time`, and only while the wave is still POLLING.
    pub async fn record_poll(
        &self,
        id: &str,
        wave_number: u32,
        progress: &WaveProgress,
        polled_at: i64,
    ) -> Result<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        let wave = sqlx::query(
            r#"
            UPDATE waves
            SET status = ?, resources = ?, end_time = ?, error = ?
            WHERE execution_id = ? AND wave_number = ? AND status = ?
            "#,
        )
        .bind(progress.status as i32)
        .bind(serde_json::to_string(&progress.resources)?)
        .bind(progress.end_time)
        .bind(&progress.error)
        .bind(id)
        .bind(wave_number as i64)
        .bind(WaveStatus::Polling as i32)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE executions SET last_polled_time = ? WHERE id = ?")
            .bind(polled_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(UpdateOutcome::from_rows(wave.rows_affected()))
    }

    pub async fn set_pause_before(
        &self,
        id: &str,
        wave_number: u32,
        pause_before: bool,
    ) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            "UPDATE waves SET pause_before = ? WHERE execution_id = ? AND wave_number = ? AND status = ?",
        )
        .bind(pause_before)
        .bind(id)
        .bind(wave_number as i64)
        .bind(WaveStatus::Pending as i32)
        .execute(&self.pool)
        .await?;

        Ok(UpdateOutcome::from_rows(result.rows_affected()))
    }

    async fn hydrate(&self, row: ExecutionRow) -> Result<Execution> {
        let wave_rows = sqlx::query_as::<_, WaveRow>(
            r#"
            SELECT wave_number, status, job_id, resource_ids, resources, pause_before, start_time, end_time, error
            FROM waves
            WHERE execution_id = ?
            ORDER BY wave_number ASC
            "#,
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        let waves = wave_rows
            .into_iter()
            .map(WaveRow::into_wave)
            .collect::<Result<Vec<_>>>()?;

        Ok(Execution {
            id: row.id,
            status: row.status,
            total_waves: row.total_waves as u32,
            waves,
            is_drill: row.is_drill,
            account_context: AccountContext {
                account_id: row.account_id,
                role_name: row.role_name,
            },
            created_time: row.created_time,
            last_polled_time: row.last_polled_time,
            completed_time: row.completed_time,
            error: row.error,
        })
    }
}
