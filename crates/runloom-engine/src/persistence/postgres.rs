//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Atomic work claiming via SELECT ... FOR UPDATE SKIP LOCKED
//! - One transaction per state transition
//! - Orphaned-work recovery sweeps

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::retry::RetryPolicy;

/// PostgreSQL implementation of WorkflowStore
///
/// Uses a connection pool for efficient database access. Any number of
/// engine or worker processes may share one database.
///
/// # Example
///
/// ```ignore
/// use runloom_engine::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/runloom").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the workflow tables and indexes if they do not exist.
    /// Idempotent; safe to run on every startup.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id UUID PRIMARY KEY,
                workflow_id UUID NOT NULL,
                workflow_version_id UUID,
                trigger_id UUID,
                status TEXT NOT NULL DEFAULT 'pending',
                input JSONB NOT NULL DEFAULT '{}'::jsonb,
                variables JSONB NOT NULL DEFAULT '{}'::jsonb,
                output JSONB,
                error JSONB,
                timeout_seconds BIGINT,
                retry_policy JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                total_steps INT NOT NULL DEFAULT 0,
                completed_steps INT NOT NULL DEFAULT 0,
                failed_steps INT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_steps (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                step_number INT NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt_count INT NOT NULL DEFAULT 0,
                max_attempts INT NOT NULL DEFAULT 3,
                input JSONB,
                output JSONB,
                node_config JSONB NOT NULL DEFAULT '{}'::jsonb,
                error_details JSONB,
                assigned_worker_id TEXT,
                worker_heartbeat TIMESTAMPTZ,
                depends_on UUID[] NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (run_id, node_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_queue (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                step_id UUID REFERENCES workflow_steps(id) ON DELETE CASCADE,
                queue_type TEXT NOT NULL,
                priority INT NOT NULL DEFAULT 5,
                available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                claimed_at TIMESTAMPTZ,
                claimed_by TEXT,
                attempt_count INT NOT NULL DEFAULT 0,
                max_attempts INT NOT NULL DEFAULT 5,
                payload JSONB NOT NULL DEFAULT '{}'::jsonb
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_workers (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                pid INT,
                version TEXT,
                capabilities TEXT[] NOT NULL DEFAULT '{*}',
                status TEXT NOT NULL DEFAULT 'idle',
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_heartbeat TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                max_concurrent_steps INT NOT NULL DEFAULT 10,
                current_step_count INT NOT NULL DEFAULT 0,
                total_steps_executed BIGINT NOT NULL DEFAULT 0,
                total_steps_failed BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                step_id UUID NOT NULL REFERENCES workflow_steps(id) ON DELETE CASCADE,
                checkpoint_type TEXT NOT NULL,
                context JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_workflow_queue_claim
                 ON workflow_queue (claimed_by, available_at, priority, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_workflow_steps_run
                 ON workflow_steps (run_id)",
            "CREATE INDEX IF NOT EXISTS idx_workflow_steps_worker
                 ON workflow_steps (assigned_worker_id, worker_heartbeat)",
            "CREATE INDEX IF NOT EXISTS idx_workflow_workers_heartbeat
                 ON workflow_workers (last_heartbeat)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(db_err)?;
        }

        debug!("workflow tables migrated");
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, run), fields(run_id = %run.id))]
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let retry_policy = run
            .retry_policy
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(ser_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, workflow_id, workflow_version_id, trigger_id, status,
                input, variables, output, error, timeout_seconds, retry_policy,
                created_at, started_at, completed_at,
                total_steps, completed_steps, failed_steps
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(run.id)
        .bind(run.workflow_id)
        .bind(run.workflow_version_id)
        .bind(run.trigger_id)
        .bind(run.status.to_string())
        .bind(run.input.as_value())
        .bind(run.variables.as_value())
        .bind(run.output.as_ref().map(|o| o.as_value()))
        .bind(&run.error)
        .bind(run.timeout_seconds)
        .bind(retry_policy)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.total_steps)
        .bind(run.completed_steps)
        .bind(run.failed_steps)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunExists(run.id));
        }

        debug!(%run.id, %run.workflow_id, "inserted run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;

        run_from_row(&row)
    }

    #[instrument(skip(self, output, error))]
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<Envelope>,
        error: Option<Value>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT status FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;

        let current = parse_run_status(row.get("status"))?;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        let (started_at, completed_at): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            match status {
                RunStatus::Running => (Some(Utc::now()), None),
                s if s.is_terminal() => (None, Some(Utc::now())),
                _ => (None, None),
            };

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2,
                output = COALESCE($3, output),
                error = COALESCE($4, error),
                started_at = CASE WHEN $2 = 'pending' THEN NULL
                                  ELSE COALESCE(started_at, $5) END,
                completed_at = COALESCE(completed_at, $6)
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.to_string())
        .bind(output.map(|o| o.as_value()))
        .bind(error)
        .bind(started_at)
        .bind(completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, %status, "updated run status");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT status FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;

        let current = parse_run_status(row.get("status"))?;
        if !current.can_transition_to(RunStatus::Cancelled) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: RunStatus::Cancelled,
            });
        }

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled', completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Unclaimed items vanish; claimed items drain with their worker
        sqlx::query("DELETE FROM workflow_queue WHERE run_id = $1 AND claimed_by IS NULL")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'skipped'
            WHERE run_id = $1 AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, "cancelled run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover_failed_runs(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            SELECT r.id
            FROM workflow_runs r
            WHERE r.status = 'running'
              AND r.started_at IS NOT NULL
              AND r.started_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM workflow_steps s
                  WHERE s.run_id = r.id
                    AND s.status = 'running'
                    AND s.worker_heartbeat >= $1
              )
            FOR UPDATE OF r SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let abandoned: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();

        for run_id in &abandoned {
            sqlx::query(
                "UPDATE workflow_runs SET status = 'pending', started_at = NULL WHERE id = $1",
            )
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            sqlx::query(
                r#"
                INSERT INTO workflow_queue (id, run_id, queue_type, priority)
                VALUES ($1, $2, 'start_run', 7)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "recovered abandoned runs");
        }
        Ok(abandoned.len() as u64)
    }

    #[instrument(skip(self))]
    async fn fail_timed_out_runs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'failed',
                completed_at = NOW(),
                error = jsonb_build_object('error', 'run timed out')
            WHERE status = 'running'
              AND timeout_seconds IS NOT NULL
              AND started_at IS NOT NULL
              AND started_at + timeout_seconds * INTERVAL '1 second' < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, steps))]
    async fn insert_steps(&self, steps: &[Step]) -> Result<(), StoreError> {
        let Some(run_id) = steps.first().map(|s| s.run_id) else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps (
                    id, run_id, node_id, node_type, step_number, status,
                    attempt_count, max_attempts, input, output, node_config,
                    error_details, assigned_worker_id, worker_heartbeat,
                    depends_on, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (run_id, node_id) DO NOTHING
                "#,
            )
            .bind(step.id)
            .bind(step.run_id)
            .bind(&step.node_id)
            .bind(&step.node_type)
            .bind(step.step_number)
            .bind(step.status.to_string())
            .bind(step.attempt_count)
            .bind(step.max_attempts)
            .bind(step.input.as_ref().map(|i| i.as_value()))
            .bind(step.output.as_ref().map(|o| o.as_value()))
            .bind(&step.node_config)
            .bind(&step.error_details)
            .bind(&step.assigned_worker_id)
            .bind(step.worker_heartbeat)
            .bind(&step.depends_on)
            .bind(step.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET total_steps = (SELECT COUNT(*) FROM workflow_steps WHERE run_id = $1)
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, count = steps.len(), "inserted steps");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_step(&self, step_id: Uuid) -> Result<Step, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_steps WHERE id = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::StepNotFound(step_id))?;

        step_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_steps WHERE run_id = $1 ORDER BY step_number",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(step_from_row(row)?);
        }
        Ok(steps)
    }

    #[instrument(skip(self))]
    async fn update_step_running(&self, step_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'running',
                assigned_worker_id = $2,
                worker_heartbeat = NOW()
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound(step_id));
        }
        Ok(())
    }

    #[instrument(skip(self, output))]
    async fn update_step_completed(
        &self,
        step_id: Uuid,
        output: Envelope,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'completed', output = $2
            WHERE id = $1
            RETURNING run_id
            "#,
        )
        .bind(step_id)
        .bind(output.as_value())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::StepNotFound(step_id))?;

        let run_id: Uuid = row.get("run_id");
        sqlx::query(
            "UPDATE workflow_runs SET completed_steps = completed_steps + 1 WHERE id = $1",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn update_step_failed(&self, step_id: Uuid, error: Value) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'failed',
                error_details = $2,
                attempt_count = attempt_count + 1
            WHERE id = $1
            RETURNING run_id
            "#,
        )
        .bind(step_id)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::StepNotFound(step_id))?;

        let run_id: Uuid = row.get("run_id");
        sqlx::query("UPDATE workflow_runs SET failed_steps = failed_steps + 1 WHERE id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_step_status(
        &self,
        step_id: Uuid,
        status: StepStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = $2,
                assigned_worker_id = CASE WHEN $2 = 'pending' THEN NULL
                                          ELSE assigned_worker_id END,
                worker_heartbeat = CASE WHEN $2 = 'pending' THEN NULL
                                        ELSE worker_heartbeat END
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound(step_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dependencies_satisfied(&self, step_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT depends_on FROM workflow_steps WHERE id = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::StepNotFound(step_id))?;

        let depends_on: Vec<Uuid> = row.get("depends_on");
        if depends_on.is_empty() {
            return Ok(true);
        }

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS completed
            FROM workflow_steps
            WHERE id = ANY($1) AND status = 'completed'
            "#,
        )
        .bind(&depends_on)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let completed: i64 = row.get("completed");
        Ok(completed as usize == depends_on.len())
    }

    #[instrument(skip(self))]
    async fn pending_dependents(
        &self,
        run_id: Uuid,
        completed_step_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id
            FROM workflow_steps s
            WHERE s.run_id = $1
              AND s.status = 'pending'
              AND $2 = ANY(s.depends_on)
              AND NOT EXISTS (
                  SELECT 1 FROM workflow_steps d
                  WHERE d.id = ANY(s.depends_on) AND d.status <> 'completed'
              )
            ORDER BY s.step_number
            "#,
        )
        .bind(run_id)
        .bind(completed_step_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn unfinished_step_count(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS unfinished
            FROM workflow_steps
            WHERE run_id = $1 AND status IN ('pending', 'running', 'retrying')
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("unfinished"))
    }

    #[instrument(skip(self, item), fields(item_id = %item.id, queue_type = %item.queue_type))]
    async fn enqueue(&self, item: &QueueItem) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_queue (
                id, run_id, step_id, queue_type, priority, available_at,
                created_at, claimed_at, claimed_by, attempt_count, max_attempts, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(item.id)
        .bind(item.run_id)
        .bind(item.step_id)
        .bind(item.queue_type.to_string())
        .bind(item.priority)
        .bind(item.available_at)
        .bind(item.created_at)
        .bind(item.claimed_at)
        .bind(&item.claimed_by)
        .bind(item.attempt_count)
        .bind(item.max_attempts)
        .bind(&item.payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(item_id = %item.id, "enqueued item");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_batch(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        // SKIP LOCKED keeps concurrent claimers off each other's rows: two
        // workers never receive the same item. Items of paused, cancelled,
        // and failed runs are filtered in the claim predicate.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT q.id
                FROM workflow_queue q
                JOIN workflow_runs r ON r.id = q.run_id
                WHERE q.claimed_by IS NULL
                  AND q.available_at <= NOW()
                  AND q.attempt_count < q.max_attempts
                  AND r.status NOT IN ('paused', 'cancelled', 'failed')
                ORDER BY q.priority ASC, q.created_at ASC
                LIMIT $2
                FOR UPDATE OF q SKIP LOCKED
            )
            UPDATE workflow_queue t
            SET claimed_by = $1,
                claimed_at = NOW()
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.run_id, t.step_id, t.queue_type, t.priority,
                      t.available_at, t.created_at, t.claimed_at, t.claimed_by,
                      t.attempt_count, t.max_attempts, t.payload
            "#,
        )
        .bind(worker_id)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            claimed.push(item_from_row(row)?);
        }
        claimed.sort_by_key(|i| (i.priority, i.created_at));

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed items");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn delete_claimed(&self, item_id: Uuid, worker_id: &str) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let run_id = delete_claimed_tx(&mut tx, item_id, worker_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(run_id)
    }

    #[instrument(skip(self, result), fields(success = result.success))]
    async fn complete_work(
        &self,
        worker_id: &str,
        item_id: Uuid,
        result: &WorkResult,
    ) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT run_id, step_id, claimed_by, max_attempts
            FROM workflow_queue
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ItemNotFound(item_id))?;

        let claimed_by: Option<String> = row.get("claimed_by");
        if claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::StaleClaim {
                item_id,
                worker_id: worker_id.to_string(),
            });
        }

        // The retry item below carries this run id, never a fresh one
        let run_id: Uuid = row.get("run_id");
        let step_id: Option<Uuid> = row.get("step_id");
        let max_attempts: i32 = row.get("max_attempts");

        sqlx::query("DELETE FROM workflow_queue WHERE id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for next_step in &result.next_steps {
            sqlx::query(
                r#"
                INSERT INTO workflow_queue (id, run_id, step_id, queue_type, priority, max_attempts)
                VALUES ($1, $2, $3, 'execute_step', 5, $4)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(run_id)
            .bind(next_step)
            .bind(max_attempts)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if result.should_retry {
            let delay = result.retry_delay().unwrap_or_default();
            let available_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO workflow_queue (
                    id, run_id, step_id, queue_type, priority, available_at, max_attempts
                )
                VALUES ($1, $2, $3, 'retry_step', 8, $4, $5)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(run_id)
            .bind(step_id)
            .bind(available_at)
            .bind(max_attempts)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if result.run_completed {
            sqlx::query(
                r#"
                INSERT INTO workflow_queue (id, run_id, queue_type, priority)
                VALUES ($1, $2, 'complete_run', 5)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if !result.success && !result.should_retry {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "step failed".to_string());

            sqlx::query(
                r#"
                UPDATE workflow_runs
                SET status = 'failed',
                    completed_at = NOW(),
                    error = jsonb_build_object('error', $2::text)
                WHERE id = $1
                  AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(run_id)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(%item_id, %run_id, "completed work item");
        Ok(run_id)
    }

    #[instrument(skip(self))]
    async fn release_expired(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE workflow_queue
            SET claimed_by = NULL,
                claimed_at = NULL,
                attempt_count = attempt_count + 1
            WHERE claimed_by IS NOT NULL
              AND claimed_at < $1
              AND attempt_count < max_attempts
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let released = result.rows_affected();
        if released > 0 {
            debug!(released, "released expired claims");
        }
        Ok(released)
    }

    #[instrument(skip(self))]
    async fn reset_stale_running_steps(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'pending',
                assigned_worker_id = NULL,
                worker_heartbeat = NULL
            WHERE status = 'running'
              AND (worker_heartbeat IS NULL OR worker_heartbeat < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let reset = result.rows_affected();
        if reset > 0 {
            debug!(reset, "reset stale running steps");
        }
        Ok(reset)
    }

    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_workers (
                id, hostname, pid, version, capabilities, status,
                started_at, last_heartbeat, max_concurrent_steps,
                current_step_count, total_steps_executed, total_steps_failed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                pid = EXCLUDED.pid,
                version = EXCLUDED.version,
                capabilities = EXCLUDED.capabilities,
                status = EXCLUDED.status,
                last_heartbeat = NOW(),
                max_concurrent_steps = EXCLUDED.max_concurrent_steps,
                current_step_count = EXCLUDED.current_step_count
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.hostname)
        .bind(worker.pid)
        .bind(&worker.version)
        .bind(&worker.capabilities)
        .bind(worker.status.to_string())
        .bind(worker.started_at)
        .bind(worker.max_concurrent_steps)
        .bind(worker.current_step_count)
        .bind(worker.total_steps_executed)
        .bind(worker.total_steps_failed)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(worker_id = %worker.id, "registered worker");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        current_step_count: i32,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_workers
            SET last_heartbeat = NOW(),
                current_step_count = $2
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(current_step_count)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(worker_id.to_string()));
        }

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET worker_heartbeat = NOW()
            WHERE assigned_worker_id = $1 AND status = 'running'
            "#,
        )
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workflow_workers SET status = $2 WHERE id = $1")
            .bind(worker_id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_worker(&self, worker_id: &str) -> Result<WorkerInfo, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_workers WHERE id = $1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;

        worker_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn mark_stale_workers_offline(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE workflow_workers
            SET status = 'offline'
            WHERE status <> 'offline' AND last_heartbeat < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, checkpoint), fields(step_id = %checkpoint.step_id))]
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (id, run_id, step_id, checkpoint_type, context, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(checkpoint.id)
        .bind(checkpoint.run_id)
        .bind(checkpoint.step_id)
        .bind(checkpoint.checkpoint_type.to_string())
        .bind(&checkpoint.context)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_checkpoints(&self, step_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, step_id, checkpoint_type, context, created_at
            FROM workflow_checkpoints
            WHERE step_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            checkpoints.push(Checkpoint {
                id: row.get("id"),
                run_id: row.get("run_id"),
                step_id: row.get("step_id"),
                checkpoint_type: parse_checkpoint_type(row.get("checkpoint_type"))?,
                context: row.get("context"),
                created_at: row.get("created_at"),
            });
        }
        Ok(checkpoints)
    }
}

async fn delete_claimed_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    item_id: Uuid,
    worker_id: &str,
) -> Result<Uuid, StoreError> {
    let row = sqlx::query("SELECT run_id, claimed_by FROM workflow_queue WHERE id = $1 FOR UPDATE")
        .bind(item_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ItemNotFound(item_id))?;

    let claimed_by: Option<String> = row.get("claimed_by");
    if claimed_by.as_deref() != Some(worker_id) {
        return Err(StoreError::StaleClaim {
            item_id,
            worker_id: worker_id.to_string(),
        });
    }

    sqlx::query("DELETE FROM workflow_queue WHERE id = $1")
        .bind(item_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

    Ok(row.get("run_id"))
}

// Helper functions

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn parse_run_status(status: &str) -> Result<RunStatus, StoreError> {
    match status {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "paused" => Ok(RunStatus::Paused),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        _ => Err(StoreError::Database(format!("unknown run status: {status}"))),
    }
}

fn parse_step_status(status: &str) -> Result<StepStatus, StoreError> {
    match status {
        "pending" => Ok(StepStatus::Pending),
        "running" => Ok(StepStatus::Running),
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        "skipped" => Ok(StepStatus::Skipped),
        "retrying" => Ok(StepStatus::Retrying),
        _ => Err(StoreError::Database(format!(
            "unknown step status: {status}"
        ))),
    }
}

fn parse_queue_type(queue_type: &str) -> Result<QueueType, StoreError> {
    match queue_type {
        "start_run" => Ok(QueueType::StartRun),
        "execute_step" => Ok(QueueType::ExecuteStep),
        "retry_step" => Ok(QueueType::RetryStep),
        "complete_run" => Ok(QueueType::CompleteRun),
        _ => Err(StoreError::Database(format!(
            "unknown queue type: {queue_type}"
        ))),
    }
}

fn parse_worker_status(status: &str) -> Result<WorkerStatus, StoreError> {
    match status {
        "idle" => Ok(WorkerStatus::Idle),
        "busy" => Ok(WorkerStatus::Busy),
        "draining" => Ok(WorkerStatus::Draining),
        "offline" => Ok(WorkerStatus::Offline),
        _ => Err(StoreError::Database(format!(
            "unknown worker status: {status}"
        ))),
    }
}

fn parse_checkpoint_type(checkpoint_type: &str) -> Result<CheckpointType, StoreError> {
    match checkpoint_type {
        "pre_execution" => Ok(CheckpointType::PreExecution),
        "post_execution" => Ok(CheckpointType::PostExecution),
        _ => Err(StoreError::Database(format!(
            "unknown checkpoint type: {checkpoint_type}"
        ))),
    }
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let status: String = row.get("status");
    let retry_policy: Option<Value> = row.get("retry_policy");
    let retry_policy: Option<RetryPolicy> = retry_policy
        .map(serde_json::from_value)
        .transpose()
        .map_err(ser_err)?;
    let output: Option<Value> = row.get("output");

    Ok(Run {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        workflow_version_id: row.get("workflow_version_id"),
        trigger_id: row.get("trigger_id"),
        status: parse_run_status(&status)?,
        input: Envelope::from_value(row.get("input")),
        variables: Envelope::from_value(row.get("variables")),
        output: output.map(Envelope::from_value),
        error: row.get("error"),
        timeout_seconds: row.get("timeout_seconds"),
        retry_policy,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        total_steps: row.get("total_steps"),
        completed_steps: row.get("completed_steps"),
        failed_steps: row.get("failed_steps"),
    })
}

fn step_from_row(row: &PgRow) -> Result<Step, StoreError> {
    let status: String = row.get("status");
    let input: Option<Value> = row.get("input");
    let output: Option<Value> = row.get("output");

    Ok(Step {
        id: row.get("id"),
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        step_number: row.get("step_number"),
        status: parse_step_status(&status)?,
        attempt_count: row.get("attempt_count"),
        max_attempts: row.get("max_attempts"),
        input: input.map(Envelope::from_value),
        output: output.map(Envelope::from_value),
        node_config: row.get("node_config"),
        error_details: row.get("error_details"),
        assigned_worker_id: row.get("assigned_worker_id"),
        worker_heartbeat: row.get("worker_heartbeat"),
        depends_on: row.get("depends_on"),
        created_at: row.get("created_at"),
    })
}

fn item_from_row(row: &PgRow) -> Result<QueueItem, StoreError> {
    let queue_type: String = row.get("queue_type");

    Ok(QueueItem {
        id: row.get("id"),
        run_id: row.get("run_id"),
        step_id: row.get("step_id"),
        queue_type: parse_queue_type(&queue_type)?,
        priority: row.get("priority"),
        available_at: row.get("available_at"),
        created_at: row.get("created_at"),
        claimed_at: row.get("claimed_at"),
        claimed_by: row.get("claimed_by"),
        attempt_count: row.get("attempt_count"),
        max_attempts: row.get("max_attempts"),
        payload: row.get("payload"),
    })
}

fn worker_from_row(row: &PgRow) -> Result<WorkerInfo, StoreError> {
    let status: String = row.get("status");

    Ok(WorkerInfo {
        id: row.get("id"),
        hostname: row.get("hostname"),
        pid: row.get("pid"),
        version: row.get("version"),
        capabilities: row.get("capabilities"),
        status: parse_worker_status(&status)?,
        started_at: row.get("started_at"),
        last_heartbeat: row.get("last_heartbeat"),
        max_concurrent_steps: row.get("max_concurrent_steps"),
        current_step_count: row.get("current_step_count"),
        total_steps_executed: row.get("total_steps_executed"),
        total_steps_failed: row.get("total_steps_failed"),
    })
}
