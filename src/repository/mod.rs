mod connection;
mod execution_repository;

pub use connection::establish_connection;
pub use execution_repository::{ExecutionRepository, UpdateOutcome, WaveProgress};

pub type DbPool = sqlx::SqlitePool;
