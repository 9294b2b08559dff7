//! PostgreSQL adapter for the engine store.
//!
//! Transactional source-of-truth backend. Records are stored as JSONB
//! documents alongside the columns the engine filters on (status,
//! workflow id, idempotency key), so the Rust types stay the single
//! schema authority. Conditional transitions run inside a row-scoped
//! transaction (`SELECT ... FOR UPDATE`), which is what converts
//! concurrent transition races into rejected updates.

use crate::model::{QueryWindow, RunPatch, StepPatch, TraceRecord};
use crate::traits::{LogStore, RunStore, TraceStore, VersionStore};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use flowline_types::{
    LogRecord, Run, RunId, RunStatus, RunStep, StepId, StepStatus, WorkflowId, WorkflowVersion,
    WorkflowVersionId,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

/// PostgreSQL-backed engine store.
#[derive(Clone)]
pub struct PostgresEngineStore {
    pool: PgPool,
}

impl PostgresEngineStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS flowline_versions (
                version_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                is_active BOOLEAN NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS flowline_runs (
                run_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version_id TEXT NOT NULL,
                status TEXT NOT NULL,
                idempotency_key TEXT,
                replay_of TEXT,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (version_id, idempotency_key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS flowline_run_steps (
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                execution_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                record JSONB NOT NULL,
                PRIMARY KEY (run_id, step_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS flowline_logs (
                log_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT,
                level TEXT NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS flowline_traces (
                run_id TEXT PRIMARY KEY,
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS flowline_runs_workflow_idx ON flowline_runs (workflow_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS flowline_runs_replay_idx ON flowline_runs (replay_of)",
            "CREATE INDEX IF NOT EXISTS flowline_logs_run_idx ON flowline_logs (run_id, created_at)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn row_record<T: serde::de::DeserializeOwned>(row: &sqlx::postgres::PgRow) -> StoreResult<T> {
    let value: serde_json::Value = row.try_get("record").map_err(backend)?;
    from_json(value)
}

fn to_i64(value: usize) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("window out of range".to_string()))
}

#[async_trait]
impl VersionStore for PostgresEngineStore {
    async fn put_version(&self, version: WorkflowVersion) -> StoreResult<()> {
        let record = to_json(&version)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        if version.is_active {
            sqlx::query(
                "UPDATE flowline_versions
                    SET is_active = FALSE,
                        record = jsonb_set(record, '{is_active}', 'false')
                  WHERE workflow_id = $1",
            )
            .bind(version.workflow_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        sqlx::query(
            r#"
            INSERT INTO flowline_versions (version_id, workflow_id, version, is_active, record, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (version_id) DO UPDATE
                SET is_active = EXCLUDED.is_active,
                    record = EXCLUDED.record
            "#,
        )
        .bind(version.id.as_str())
        .bind(version.workflow_id.as_str())
        .bind(version.version as i32)
        .bind(version.is_active)
        .bind(record)
        .bind(version.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)
    }

    async fn get_version(&self, id: &WorkflowVersionId) -> StoreResult<Option<WorkflowVersion>> {
        let row = sqlx::query("SELECT record FROM flowline_versions WHERE version_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_record).transpose()
    }

    async fn active_version(
        &self,
        workflow_id: &WorkflowId,
    ) -> StoreResult<Option<WorkflowVersion>> {
        let row = sqlx::query(
            "SELECT record FROM flowline_versions WHERE workflow_id = $1 AND is_active LIMIT 1",
        )
        .bind(workflow_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_record).transpose()
    }
}

#[async_trait]
impl RunStore for PostgresEngineStore {
    async fn create_run_with_steps(&self, run: Run, steps: Vec<RunStep>) -> StoreResult<()> {
        let run_record = to_json(&run)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO flowline_runs
                (run_id, workflow_id, version_id, status, idempotency_key, replay_of, record, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.id.as_str())
        .bind(run.workflow_id.as_str())
        .bind(run.workflow_version_id.as_str())
        .bind(run.status.as_str())
        .bind(run.idempotency_key.as_deref())
        .bind(run.replay.as_ref().map(|l| l.replay_of.as_str()))
        .bind(run_record)
        .bind(run.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("run {} conflicts: {e}", run.id))
            }
            _ => backend(e),
        })?;

        for step in &steps {
            sqlx::query(
                r#"
                INSERT INTO flowline_run_steps (run_id, step_id, execution_order, status, record)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(step.run_id.as_str())
            .bind(step.step_id.as_str())
            .bind(step.execution_order as i32)
            .bind(step.status.as_str())
            .bind(to_json(step)?)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)
    }

    async fn get_run(&self, id: &RunId) -> StoreResult<Option<Run>> {
        let row = sqlx::query("SELECT record FROM flowline_runs WHERE run_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_record).transpose()
    }

    async fn find_run_by_idempotency_key(
        &self,
        version_id: &WorkflowVersionId,
        key: &str,
    ) -> StoreResult<Option<Run>> {
        let row = sqlx::query(
            "SELECT record FROM flowline_runs WHERE version_id = $1 AND idempotency_key = $2",
        )
        .bind(version_id.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_record).transpose()
    }

    async fn transition_run(
        &self,
        id: &RunId,
        expected_from: RunStatus,
        to: RunStatus,
        patch: RunPatch,
    ) -> StoreResult<Run> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT record FROM flowline_runs WHERE run_id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("run {id} not found")))?;

        let mut run: Run = row_record(&row)?;
        if run.status != expected_from {
            return Err(StoreError::InvariantViolation(format!(
                "run {id}: expected status {expected_from}, found {}",
                run.status
            )));
        }

        run.status = to;
        patch.apply(&mut run);

        sqlx::query("UPDATE flowline_runs SET status = $1, record = $2 WHERE run_id = $3")
            .bind(run.status.as_str())
            .bind(to_json(&run)?)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(run)
    }

    async fn update_run(&self, id: &RunId, patch: RunPatch) -> StoreResult<Run> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT record FROM flowline_runs WHERE run_id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("run {id} not found")))?;

        let mut run: Run = row_record(&row)?;
        patch.apply(&mut run);

        sqlx::query(
            "UPDATE flowline_runs SET record = $1, replay_of = $2 WHERE run_id = $3",
        )
        .bind(to_json(&run)?)
        .bind(run.replay.as_ref().map(|l| l.replay_of.as_str()))
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(run)
    }

    async fn list_runs(
        &self,
        workflow_id: &WorkflowId,
        window: QueryWindow,
    ) -> StoreResult<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT record FROM flowline_runs
              WHERE workflow_id = $1
              ORDER BY created_at DESC
              LIMIT $2 OFFSET $3",
        )
        .bind(workflow_id.as_str())
        .bind(to_i64(window.limit)?)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_record).collect()
    }

    async fn replays_of(&self, id: &RunId) -> StoreResult<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT record FROM flowline_runs WHERE replay_of = $1 ORDER BY created_at",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_record).collect()
    }

    async fn steps_for_run(&self, run_id: &RunId) -> StoreResult<Vec<RunStep>> {
        let rows = sqlx::query(
            "SELECT record FROM flowline_run_steps WHERE run_id = $1 ORDER BY execution_order",
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_record).collect()
    }

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> StoreResult<Option<RunStep>> {
        let row = sqlx::query(
            "SELECT record FROM flowline_run_steps WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id.as_str())
        .bind(step_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_record).transpose()
    }

    async fn transition_step(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        expected_from: StepStatus,
        to: StepStatus,
        patch: StepPatch,
    ) -> StoreResult<RunStep> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query(
            "SELECT record FROM flowline_run_steps
              WHERE run_id = $1 AND step_id = $2 FOR UPDATE",
        )
        .bind(run_id.as_str())
        .bind(step_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(format!("step {run_id}/{step_id} not found")))?;

        let mut step: RunStep = row_record(&row)?;
        if step.status != expected_from {
            return Err(StoreError::InvariantViolation(format!(
                "step {run_id}/{step_id}: expected status {expected_from}, found {}",
                step.status
            )));
        }

        step.status = to;
        patch.apply(&mut step);

        sqlx::query(
            "UPDATE flowline_run_steps SET status = $1, record = $2
              WHERE run_id = $3 AND step_id = $4",
        )
        .bind(step.status.as_str())
        .bind(to_json(&step)?)
        .bind(run_id.as_str())
        .bind(step_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(step)
    }
}

#[async_trait]
impl LogStore for PostgresEngineStore {
    async fn append_log(&self, record: LogRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flowline_logs (log_id, run_id, step_id, level, record, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.id)
        .bind(record.run_id.as_str())
        .bind(record.step_id.as_ref().map(|s| s.as_str()))
        .bind(record.level.as_str())
        .bind(to_json(&record)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn logs_for_run(&self, run_id: &RunId) -> StoreResult<Vec<LogRecord>> {
        let rows = sqlx::query(
            "SELECT record FROM flowline_logs WHERE run_id = $1 ORDER BY created_at",
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_record).collect()
    }
}

#[async_trait]
impl TraceStore for PostgresEngineStore {
    async fn upsert_trace(&self, record: TraceRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flowline_traces (run_id, record, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (run_id) DO UPDATE
                SET record = EXCLUDED.record,
                    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.run_id.as_str())
        .bind(to_json(&record)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_trace(&self, run_id: &RunId) -> StoreResult<Option<TraceRecord>> {
        let row = sqlx::query("SELECT record FROM flowline_traces WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_record).transpose()
    }
}
