//! State-store trait: the durable record of runs, step executions, events,
//! and suspensions.
//!
//! `strand-infra` implements this over SQLite; [`MemoryStateStore`] is an
//! in-process implementation used by engine tests and embedders that do not
//! need durability. Uses native async fn in traits (RPITIT), so engine types
//! are generic over `S: StateStore` rather than holding trait objects.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use strand_types::error::StoreError;
use strand_types::event::EventRecord;
use strand_types::workflow::{Run, RunStatus, StepExecution, StepStatus, TokenUsage};
use uuid::Uuid;

/// Durable persistence for the engine.
///
/// Writes for one execution id are strictly ordered (`create_step` ->
/// `start_step` -> `complete_step`); reads may observe any committed prefix.
pub trait StateStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run. Idempotent on conflict only when the existing row is
    /// identical; otherwise `Conflict`.
    fn create_run(
        &self,
        run: &Run,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Transition a run's status, enforcing the state machine.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Write the evaluated workflow outputs.
    fn set_run_outputs(
        &self,
        run_id: &Uuid,
        outputs: &Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<Run>, StoreError>> + Send;

    /// Recent runs, newest first, optionally filtered by workflow name.
    fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Run>, StoreError>> + Send;

    /// Runs still marked `running`/`paused` (candidates for resume).
    fn list_interrupted_runs(
        &self,
    ) -> impl Future<Output = Result<Vec<Run>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Insert a `pending` execution record.
    fn create_step(
        &self,
        exec: &StepExecution,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `pending -> running`; sets `started_at`.
    fn start_step(
        &self,
        exec_id: &Uuid,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `running -> terminal`. `Running` is accepted as a pseudo-update that
    /// stores output/usage without terminating the row (crash fixtures).
    fn complete_step(
        &self,
        exec_id: &Uuid,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
        usage: Option<&TokenUsage>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// The parent record for a step (iteration IS NULL). When retries left
    /// several rows, the most recent wins.
    fn get_main_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> impl Future<Output = Result<Option<StepExecution>, StoreError>> + Send;

    /// All iteration children, ordered by iteration index ascending.
    /// With `include_output = false` the output column is left unset.
    fn get_step_iterations(
        &self,
        run_id: &Uuid,
        step_id: &str,
        include_output: bool,
    ) -> impl Future<Output = Result<Vec<StepExecution>, StoreError>> + Send;

    /// Cheap iteration count, used for the large-dataset hydration guard.
    fn count_step_iterations(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Every execution row of a run.
    fn list_step_executions(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<StepExecution>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Events and suspensions
    // -----------------------------------------------------------------------

    /// Append an audit row.
    fn append_event(
        &self,
        record: &EventRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Latest external event with the given name, if any was delivered.
    fn get_external_event(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<EventRecord>, StoreError>> + Send;

    /// Park a step awaiting an external event.
    fn create_suspension(
        &self,
        run_id: &Uuid,
        step_id: &str,
        event_name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn remove_suspension(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `(run_id, step_id)` pairs parked on the given event name.
    fn get_suspended_steps_for_event(
        &self,
        event_name: &str,
    ) -> impl Future<Output = Result<Vec<(Uuid, String)>, StoreError>> + Send;
}

/// Deliver an external event: append it to the audit trail and return the
/// suspended steps it unblocks. The caller resumes the affected runs.
pub async fn deliver_event<S: StateStore>(
    store: &S,
    name: &str,
    data: Value,
) -> Result<Vec<(Uuid, String)>, StoreError> {
    let record = EventRecord::external(name, data);
    store.append_event(&record).await?;
    store.get_suspended_steps_for_event(name).await
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<Uuid, Run>,
    steps: Vec<StepExecution>,
    events: Vec<EventRecord>,
    suspensions: HashMap<(Uuid, String), String>,
}

/// In-process store with the same transition rules as the SQLite backend.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(existing) = inner.runs.get(&run.id) {
            if existing.workflow_name == run.workflow_name && existing.inputs == run.inputs {
                return Ok(());
            }
            return Err(StoreError::Conflict(format!("run {} exists", run.id)));
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let run = inner.runs.get_mut(run_id).ok_or(StoreError::NotFound)?;
        if run.status != status && !run.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition(format!(
                "{} -> {}",
                run.status.as_str(),
                status.as_str()
            )));
        }
        run.status = status;
        run.error = error.map(String::from);
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            run.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_run_outputs(&self, run_id: &Uuid, outputs: &Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let run = inner.runs.get_mut(run_id).ok_or(StoreError::NotFound)?;
        run.outputs = Some(outputs.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.inner.lock().expect("store lock").runs.get(run_id).cloned())
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| workflow_name.is_none_or(|n| r.workflow_name == n))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_interrupted_runs(&self) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .runs
            .values()
            .filter(|r| matches!(r.status, RunStatus::Running | RunStatus::Paused))
            .cloned()
            .collect())
    }

    async fn create_step(&self, exec: &StepExecution) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.steps.push(exec.clone());
        Ok(())
    }

    async fn start_step(&self, exec_id: &Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let exec = inner
            .steps
            .iter_mut()
            .find(|e| e.id == *exec_id)
            .ok_or(StoreError::NotFound)?;
        if !matches!(exec.status, StepStatus::Pending | StepStatus::Suspended) {
            return Err(StoreError::IllegalTransition(format!(
                "{} -> running",
                exec.status.as_str()
            )));
        }
        exec.status = StepStatus::Running;
        exec.started_at = Some(Utc::now());
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
        let mut inner = self.inner.lock().expect("store lock");
        let exec = inner
            .steps
            .iter_mut()
            .find(|e| e.id == *exec_id)
            .ok_or(StoreError::NotFound)?;
        if exec.status.is_terminal() && exec.status != StepStatus::Suspended {
            return Err(StoreError::IllegalTransition(format!(
                "{} is terminal",
                exec.status.as_str()
            )));
        }
        exec.status = status;
        exec.output = output.cloned();
        exec.error = error.map(String::from);
        exec.usage = usage.copied();
        if status.is_terminal() {
            exec.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_main_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .steps
            .iter()
            .filter(|e| e.run_id == *run_id && e.step_id == step_id && e.iteration.is_none())
            .next_back()
            .cloned())
    }

    async fn get_step_iterations(
        &self,
        run_id: &Uuid,
        step_id: &str,
        include_output: bool,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut iterations: Vec<StepExecution> = inner
            .steps
            .iter()
            .filter(|e| e.run_id == *run_id && e.step_id == step_id && e.iteration.is_some())
            .cloned()
            .map(|mut e| {
                if !include_output {
                    e.output = None;
                }
                e
            })
            .collect();
        iterations.sort_by_key(|e| e.iteration);
        Ok(iterations)
    }

    async fn count_step_iterations(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .steps
            .iter()
            .filter(|e| e.run_id == *run_id && e.step_id == step_id && e.iteration.is_some())
            .count() as u64)
    }

    async fn list_step_executions(
        &self,
        run_id: &Uuid,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .steps
            .iter()
            .filter(|e| e.run_id == *run_id)
            .cloned()
            .collect())
    }

    async fn append_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.events.push(record.clone());
        Ok(())
    }

    async fn get_external_event(&self, name: &str) -> Result<Option<EventRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .events
            .iter()
            .filter(|e| e.kind == name)
            .next_back()
            .cloned())
    }

    async fn create_suspension(
        &self,
        run_id: &Uuid,
        step_id: &str,
        event_name: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .suspensions
            .insert((*run_id, step_id.to_string()), event_name.to_string());
        Ok(())
    }

    async fn remove_suspension(&self, run_id: &Uuid, step_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.suspensions.remove(&(*run_id, step_id.to_string()));
        Ok(())
    }

    async fn get_suspended_steps_for_event(
        &self,
        event_name: &str,
    ) -> Result<Vec<(Uuid, String)>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .suspensions
            .iter()
            .filter(|(_, name)| name.as_str() == event_name)
            .map(|((run_id, step_id), _)| (*run_id, step_id.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(id: Uuid) -> Run {
        Run {
            id,
            workflow_name: "wf".to_string(),
            status: RunStatus::Pending,
            inputs: json!({}),
            outputs: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_run_idempotent_when_identical() {
        let store = MemoryStateStore::new();
        let r = run(Uuid::now_v7());
        store.create_run(&r).await.unwrap();
        store.create_run(&r).await.unwrap();

        let mut different = r.clone();
        different.inputs = json!({"x": 1});
        assert!(matches!(
            store.create_run(&different).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_run_status_machine_enforced() {
        let store = MemoryStateStore::new();
        let r = run(Uuid::now_v7());
        store.create_run(&r).await.unwrap();

        store
            .update_run_status(&r.id, RunStatus::Running, None)
            .await
            .unwrap();
        store
            .update_run_status(&r.id, RunStatus::Completed, None)
            .await
            .unwrap();
        assert!(matches!(
            store
                .update_run_status(&r.id, RunStatus::Running, None)
                .await,
            Err(StoreError::IllegalTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_step_lifecycle_ordering() {
        let store = MemoryStateStore::new();
        let r = run(Uuid::now_v7());
        store.create_run(&r).await.unwrap();

        let exec = StepExecution::pending(r.id, "s1", None, 1);
        store.create_step(&exec).await.unwrap();
        store.start_step(&exec.id).await.unwrap();
        store
            .complete_step(
                &exec.id,
                StepStatus::Success,
                Some(&json!({"ok": true})),
                None,
                None,
            )
            .await
            .unwrap();

        let fetched = store.get_main_step(&r.id, "s1").await.unwrap().unwrap();
        assert_eq!(fetched.status, StepStatus::Success);
        assert!(fetched.ended_at.is_some());

        // Terminal rows are immutable.
        assert!(store
            .complete_step(&exec.id, StepStatus::Failed, None, Some("late"), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_complete_step_running_pseudo_update() {
        let store = MemoryStateStore::new();
        let r = run(Uuid::now_v7());
        store.create_run(&r).await.unwrap();

        let exec = StepExecution::pending(r.id, "fan", None, 1);
        store.create_step(&exec).await.unwrap();
        store.start_step(&exec.id).await.unwrap();
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

        let fetched = store.get_main_step(&r.id, "fan").await.unwrap().unwrap();
        assert_eq!(fetched.status, StepStatus::Running);
        assert!(fetched.ended_at.is_none());
        assert_eq!(fetched.output.unwrap()["__foreach_items"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_iterations_sorted_and_counted() {
        let store = MemoryStateStore::new();
        let r = run(Uuid::now_v7());
        store.create_run(&r).await.unwrap();

        for i in [2u32, 0, 1] {
            let exec = StepExecution::pending(r.id, "fan", Some(i), 1);
            store.create_step(&exec).await.unwrap();
        }

        let iterations = store.get_step_iterations(&r.id, "fan", true).await.unwrap();
        let indexes: Vec<u32> = iterations.iter().filter_map(|e| e.iteration).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(store.count_step_iterations(&r.id, "fan").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_event_delivery_finds_suspensions() {
        let store = MemoryStateStore::new();
        let r = run(Uuid::now_v7());
        store.create_run(&r).await.unwrap();
        store
            .create_suspension(&r.id, "approve", "deploy.approved")
            .await
            .unwrap();

        let unblocked = deliver_event(&store, "deploy.approved", json!({"by": "ops"}))
            .await
            .unwrap();
        assert_eq!(unblocked, vec![(r.id, "approve".to_string())]);

        let event = store
            .get_external_event("deploy.approved")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["by"], "ops");

        store.remove_suspension(&r.id, "approve").await.unwrap();
        assert!(store
            .get_suspended_steps_for_event("deploy.approved")
            .await
            .unwrap()
            .is_empty());
    }
}
