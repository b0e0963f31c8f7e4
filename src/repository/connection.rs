use crate::repository::DbPool;
use anyhow::Result;

pub async fn establish_connection(database_url: &str) -> Result<DbPool> {
    // Ensure the database URL has the correct format
    let db_url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{}", database_url)
    };

    // Create connection with create_if_missing option
    let connection_string = format!("{}?mode=rwc", db_url);
    let pool = sqlx::SqlitePool::connect(&connection_string).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            status INTEGER NOT NULL,
            total_waves INTEGER NOT NULL,
            is_drill BOOLEAN NOT NULL DEFAULT 0,
            account_id TEXT,
            role_name TEXT,
            created_time INTEGER NOT NULL,
            last_polled_time INTEGER,
            completed_time INTEGER,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS waves (
            execution_id TEXT NOT NULL,
            wave_number INTEGER NOT NULL,
            status INTEGER NOT NULL,
            job_id TEXT,
            resource_ids TEXT NOT NULL,
            resources TEXT NOT NULL DEFAULT '[]',
            pause_before BOOLEAN NOT NULL DEFAULT 0,
            reserved_at INTEGER,
            start_time INTEGER,
            end_time INTEGER,
            error TEXT,
            PRIMARY KEY (execution_id, wave_number),
            FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_waves_status ON waves(status);
        CREATE INDEX IF NOT EXISTS idx_waves_job_id ON waves(job_id);
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}
