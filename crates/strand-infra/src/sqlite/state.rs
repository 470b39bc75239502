//! SQLite implementation of the engine's state store.
//!
//! Runs, step executions, events, and suspensions live in the tables created
//! by the workspace migrations. JSON values are stored as canonical UTF-8
//! text, timestamps as RFC 3339 strings, statuses as their snake_case serde
//! form. Status transitions are enforced here, not just in the engine:
//! terminal rows are immutable (with the documented `running` pseudo-update
//! for crash fixtures).

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use strand_core::store::StateStore;
use strand_types::error::StoreError;
use strand_types::event::EventRecord;
use strand_types::workflow::{Run, RunStatus, StepExecution, StepStatus, TokenUsage};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed [`StateStore`].
pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_name: String,
    status: String,
    inputs: String,
    outputs: Option<String>,
    error: Option<String>,
    started_at: String,
    ended_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    fn into_run(self) -> Result<Run, StoreError> {
        Ok(Run {
            id: parse_uuid(&self.id)?,
            workflow_name: self.workflow_name,
            status: parse_status(&self.status)?,
            inputs: parse_json(&self.inputs)?,
            outputs: self.outputs.as_deref().map(parse_json).transpose()?,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    id: String,
    run_id: String,
    step_id: String,
    iteration: Option<i64>,
    status: String,
    attempt: i64,
    idempotency_key: Option<String>,
    output: Option<String>,
    error: Option<String>,
    usage: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            iteration: row.try_get("iteration")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            idempotency_key: row.try_get("idempotency_key")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            usage: row.try_get("usage")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    fn into_execution(self) -> Result<StepExecution, StoreError> {
        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            iteration: self.iteration.map(|i| i as u32),
            status: parse_step_status(&self.status)?,
            attempt: self.attempt as u32,
            idempotency_key: self.idempotency_key,
            output: self.output.as_deref().map(parse_json).transpose()?,
            error: self.error,
            usage: self
                .usage
                .as_deref()
                .map(|s| {
                    serde_json::from_str::<TokenUsage>(s)
                        .map_err(|e| StoreError::Query(format!("invalid usage JSON: {e}")))
                })
                .transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

const STEP_COLUMNS: &str =
    "id, run_id, step_id, iteration, status, attempt, idempotency_key, output, error, usage, started_at, ended_at";

/// Same shape with the output column nulled out, for the large-foreach path.
const STEP_COLUMNS_NO_OUTPUT: &str =
    "id, run_id, step_id, iteration, status, attempt, idempotency_key, NULL AS output, error, usage, started_at, ended_at";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse::<Uuid>()
        .map_err(|e| StoreError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json(s: &str) -> Result<Value, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Query(format!("invalid JSON: {e}")))
}

fn parse_status(s: &str) -> Result<RunStatus, StoreError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| StoreError::Query(format!("invalid run status: {s}")))
}

fn parse_step_status(s: &str) -> Result<StepStatus, StoreError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| StoreError::Query(format!("invalid step status: {s}")))
}

fn to_text(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Query(e.to_string()))
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// StateStore impl
// ---------------------------------------------------------------------------

impl StateStore for SqliteStateStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let inputs = to_text(&run.inputs)?;
        let outputs = run.outputs.as_ref().map(to_text).transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO runs (id, workflow_name, status, inputs, outputs, error, started_at, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(&inputs)
        .bind(&outputs)
        .bind(&run.error)
        .bind(format_datetime(&run.started_at))
        .bind(run.ended_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            // Idempotent only when the existing row matches.
            let existing = self.get_run(&run.id).await?.ok_or(StoreError::NotFound)?;
            if existing.workflow_name == run.workflow_name && existing.inputs == run.inputs {
                return Ok(());
            }
            return Err(StoreError::Conflict(format!("run {} exists", run.id)));
        }
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let current = self.get_run(run_id).await?.ok_or(StoreError::NotFound)?;
        if current.status != status && !current.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition(format!(
                "{} -> {}",
                current.status.as_str(),
                status.as_str()
            )));
        }

        let ended_at = matches!(status, RunStatus::Completed | RunStatus::Failed)
            .then(|| format_datetime(&Utc::now()));

        sqlx::query("UPDATE runs SET status = ?, error = ?, ended_at = COALESCE(?, ended_at) WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(ended_at)
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_run_outputs(&self, run_id: &Uuid, outputs: &Value) -> Result<(), StoreError> {
        sqlx::query("UPDATE runs SET outputs = ? WHERE id = ?")
            .bind(to_text(outputs)?)
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| RunRow::from_row(&row).map_err(query_err)?.into_run())
            .transpose()
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = match workflow_name {
            Some(name) => {
                sqlx::query(
                    "SELECT * FROM runs WHERE workflow_name = ? ORDER BY started_at DESC LIMIT ?",
                )
                .bind(name)
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY started_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(query_err)?.into_run())
            .collect()
    }

    async fn list_interrupted_runs(&self) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status IN ('running', 'paused') ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(query_err)?.into_run())
            .collect()
    }

    async fn create_step(&self, exec: &StepExecution) -> Result<(), StoreError> {
        let output = exec.output.as_ref().map(to_text).transpose()?;
        let usage = exec
            .usage
            .as_ref()
            .map(|u| serde_json::to_string(u).map_err(|e| StoreError::Query(e.to_string())))
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO step_executions
               (id, run_id, step_id, iteration, status, attempt, idempotency_key,
                output, error, usage, started_at, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(exec.id.to_string())
        .bind(exec.run_id.to_string())
        .bind(&exec.step_id)
        .bind(exec.iteration.map(|i| i as i64))
        .bind(exec.status.as_str())
        .bind(exec.attempt as i64)
        .bind(&exec.idempotency_key)
        .bind(&output)
        .bind(&exec.error)
        .bind(&usage)
        .bind(exec.started_at.as_ref().map(format_datetime))
        .bind(exec.ended_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn start_step(&self, exec_id: &Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE step_executions SET status = 'running', started_at = ? \
             WHERE id = ? AND status IN ('pending', 'suspended')",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(exec_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::IllegalTransition(format!(
                "execution {exec_id} is not pending"
            )));
        }
        Ok(())
    }

    async fn complete_step(
        &self,
        exec_id: &Uuid,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
        usage: Option<&TokenUsage>,
    ) -> Result<(), StoreError> {
        let output = output.map(to_text).transpose()?;
        let usage = usage
            .map(|u| serde_json::to_string(u).map_err(|e| StoreError::Query(e.to_string())))
            .transpose()?;
        // `running` is a pseudo-update: it stores output without terminating
        // the row, so crash fixtures (and the foreach item-list hint) work.
        let ended_at = status
            .is_terminal()
            .then(|| format_datetime(&Utc::now()));

        let result = sqlx::query(
            "UPDATE step_executions SET status = ?, output = ?, error = ?, usage = ?, \
             ended_at = COALESCE(?, ended_at) \
             WHERE id = ? AND status IN ('pending', 'running', 'suspended')",
        )
        .bind(status.as_str())
        .bind(&output)
        .bind(error)
        .bind(&usage)
        .bind(ended_at)
        .bind(exec_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::IllegalTransition(format!(
                "execution {exec_id} is already terminal"
            )));
        }
        Ok(())
    }

    async fn get_main_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        // Retries leave multiple parent rows; UUIDv7 ids order by time, so
        // the highest id is the latest attempt.
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE run_id = ? AND step_id = ? AND iteration IS NULL \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|row| StepRow::from_row(&row).map_err(query_err)?.into_execution())
            .transpose()
    }

    async fn get_step_iterations(
        &self,
        run_id: &Uuid,
        step_id: &str,
        include_output: bool,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let columns = if include_output {
            STEP_COLUMNS
        } else {
            STEP_COLUMNS_NO_OUTPUT
        };
        let rows = sqlx::query(&format!(
            "SELECT {columns} FROM step_executions \
             WHERE run_id = ? AND step_id = ? AND iteration IS NOT NULL \
             ORDER BY iteration ASC, id ASC"
        ))
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| StepRow::from_row(row).map_err(query_err)?.into_execution())
            .collect()
    }

    async fn count_step_iterations(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<u64, StoreError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT iteration) FROM step_executions \
             WHERE run_id = ? AND step_id = ? AND iteration IS NOT NULL",
        )
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_err)?;
        Ok(count.0 as u64)
    }

    async fn list_step_executions(
        &self,
        run_id: &Uuid,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions WHERE run_id = ? ORDER BY id ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| StepRow::from_row(row).map_err(query_err)?.into_execution())
            .collect()
    }

    async fn append_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO events (id, run_id, step_id, kind, payload, ts) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.run_id.map(|id| id.to_string()))
        .bind(&record.step_id)
        .bind(&record.kind)
        .bind(to_text(&record.payload)?)
        .bind(format_datetime(&record.ts))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_external_event(&self, name: &str) -> Result<Option<EventRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, run_id, step_id, kind, payload, ts FROM events \
             WHERE kind = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.try_get("id").map_err(query_err)?;
        let run_id: Option<String> = row.try_get("run_id").map_err(query_err)?;
        let step_id: Option<String> = row.try_get("step_id").map_err(query_err)?;
        let kind: String = row.try_get("kind").map_err(query_err)?;
        let payload: String = row.try_get("payload").map_err(query_err)?;
        let ts: String = row.try_get("ts").map_err(query_err)?;

        Ok(Some(EventRecord {
            id: parse_uuid(&id)?,
            run_id: run_id.as_deref().map(parse_uuid).transpose()?,
            step_id,
            kind,
            payload: parse_json(&payload)?,
            ts: parse_datetime(&ts)?,
        }))
    }

    async fn create_suspension(
        &self,
        run_id: &Uuid,
        step_id: &str,
        event_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO suspensions (run_id, step_id, event_name, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(run_id, step_id) DO UPDATE SET event_name = excluded.event_name",
        )
        .bind(run_id.to_string())
        .bind(step_id)
        .bind(event_name)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn remove_suspension(&self, run_id: &Uuid, step_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM suspensions WHERE run_id = ? AND step_id = ?")
            .bind(run_id.to_string())
            .bind(step_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_suspended_steps_for_event(
        &self,
        event_name: &str,
    ) -> Result<Vec<(Uuid, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, step_id FROM suspensions WHERE event_name = ? ORDER BY created_at ASC",
        )
        .bind(event_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let run_id: String = row.try_get("run_id").map_err(query_err)?;
                let step_id: String = row.try_get("step_id").map_err(query_err)?;
                Ok((parse_uuid(&run_id)?, step_id))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> SqliteStateStore {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("s.db").display());
        std::mem::forget(dir);
        SqliteStateStore::new(DatabasePool::new(&url).await.unwrap())
    }

    fn sample_run() -> Run {
        Run {
            id: Uuid::now_v7(),
            workflow_name: "wf".to_string(),
            status: RunStatus::Pending,
            inputs: json!({"k": "v"}),
            outputs: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn test_run_roundtrip_and_idempotent_create() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        store.create_run(&run).await.unwrap(); // identical: idempotent

        let mut conflicting = run.clone();
        conflicting.inputs = json!({"k": "other"});
        assert!(matches!(
            store.create_run(&conflicting).await,
            Err(StoreError::Conflict(_))
        ));

        let fetched = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.workflow_name, "wf");
        assert_eq!(fetched.inputs, json!({"k": "v"}));
        assert_eq!(fetched.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_status_machine() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        store
            .update_run_status(&run.id, RunStatus::Running, None)
            .await
            .unwrap();
        store
            .update_run_status(&run.id, RunStatus::Completed, None)
            .await
            .unwrap();
        assert!(matches!(
            store.update_run_status(&run.id, RunStatus::Running, None).await,
            Err(StoreError::IllegalTransition(_))
        ));

        let fetched = store.get_run(&run.id).await.unwrap().unwrap();
        assert!(fetched.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_step_lifecycle_and_pseudo_running_update() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        let exec = StepExecution::pending(run.id, "fan", None, 1);
        store.create_step(&exec).await.unwrap();
        store.start_step(&exec.id).await.unwrap();

        // Pseudo-update: keep running, persist the item-list hint.
        store
            .complete_step(
                &exec.id,
                StepStatus::Running,
                Some(&json!({"__foreach_items": [1, 2, 3]})),
                None,
                None,
            )
            .await
            .unwrap();
        let fetched = store.get_main_step(&run.id, "fan").await.unwrap().unwrap();
        assert_eq!(fetched.status, StepStatus::Running);
        assert!(fetched.ended_at.is_none());
        assert_eq!(fetched.output.unwrap()["__foreach_items"], json!([1, 2, 3]));

        // Terminal completion, then immutability.
        store
            .complete_step(
                &exec.id,
                StepStatus::Success,
                Some(&json!({"done": true})),
                None,
                Some(&TokenUsage {
                    input_tokens: 5,
                    output_tokens: 2,
                }),
            )
            .await
            .unwrap();
        assert!(store
            .complete_step(&exec.id, StepStatus::Failed, None, Some("late"), None)
            .await
            .is_err());

        let fetched = store.get_main_step(&run.id, "fan").await.unwrap().unwrap();
        assert_eq!(fetched.status, StepStatus::Success);
        assert!(fetched.ended_at.is_some());
        assert_eq!(fetched.usage.unwrap().input_tokens, 5);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        let exec = StepExecution::pending(run.id, "s", None, 1);
        store.create_step(&exec).await.unwrap();
        store.start_step(&exec.id).await.unwrap();
        assert!(matches!(
            store.start_step(&exec.id).await,
            Err(StoreError::IllegalTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_iterations_ordered_counted_and_output_elided() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        for i in [2u32, 0, 1] {
            let exec = StepExecution::pending(run.id, "fan", Some(i), 1);
            store.create_step(&exec).await.unwrap();
            store.start_step(&exec.id).await.unwrap();
            store
                .complete_step(
                    &exec.id,
                    StepStatus::Success,
                    Some(&json!({"i": i})),
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        let with_output = store.get_step_iterations(&run.id, "fan", true).await.unwrap();
        let indexes: Vec<u32> = with_output.iter().filter_map(|e| e.iteration).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(with_output[1].output.as_ref().unwrap()["i"], 1);

        let without = store.get_step_iterations(&run.id, "fan", false).await.unwrap();
        assert!(without.iter().all(|e| e.output.is_none()));
        assert_eq!(without.len(), 3);

        assert_eq!(store.count_step_iterations(&run.id, "fan").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_main_step_latest_attempt_wins() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        let first = StepExecution::pending(run.id, "s", None, 1);
        store.create_step(&first).await.unwrap();
        store.start_step(&first.id).await.unwrap();
        store
            .complete_step(&first.id, StepStatus::Failed, None, Some("boom"), None)
            .await
            .unwrap();

        let second = StepExecution::pending(run.id, "s", None, 2);
        store.create_step(&second).await.unwrap();

        let main = store.get_main_step(&run.id, "s").await.unwrap().unwrap();
        assert_eq!(main.attempt, 2);
        assert_eq!(main.status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_events_and_suspensions() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        store
            .create_suspension(&run.id, "approve", "deploy.approved")
            .await
            .unwrap();
        assert_eq!(
            store
                .get_suspended_steps_for_event("deploy.approved")
                .await
                .unwrap(),
            vec![(run.id, "approve".to_string())]
        );

        let unblocked =
            strand_core::store::deliver_event(&store, "deploy.approved", json!({"ok": true}))
                .await
                .unwrap();
        assert_eq!(unblocked.len(), 1);

        let event = store
            .get_external_event("deploy.approved")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["ok"], true);

        store.remove_suspension(&run.id, "approve").await.unwrap();
        assert!(store
            .get_suspended_steps_for_event("deploy.approved")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_interrupted_runs() {
        let store = test_store().await;
        let mut running = sample_run();
        running.status = RunStatus::Pending;
        store.create_run(&running).await.unwrap();
        store
            .update_run_status(&running.id, RunStatus::Running, None)
            .await
            .unwrap();

        let done = sample_run();
        store.create_run(&done).await.unwrap();
        store
            .update_run_status(&done.id, RunStatus::Running, None)
            .await
            .unwrap();
        store
            .update_run_status(&done.id, RunStatus::Completed, None)
            .await
            .unwrap();

        let interrupted = store.list_interrupted_runs().await.unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].id, running.id);
    }
}
