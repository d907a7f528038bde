use std::time::Duration;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 900;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Reserved,
    Processing,
    Succeeded,
    Failed,
    DeadLetter,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Reserved => "reserved",
            TaskState::Processing => "processing",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::DeadLetter)
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskTransition {
    Reserve,
    StartProcessing,
    Succeed,
    Fail,
    DeadLetter,
}

impl TaskTransition {
    fn as_str(&self) -> &'static str {
        match self {
            TaskTransition::Reserve => "reserve",
            TaskTransition::StartProcessing => "start_processing",
            TaskTransition::Succeed => "succeed",
            TaskTransition::Fail => "fail",
            TaskTransition::DeadLetter => "dead_letter",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: DispatchLifecycleMachine,
        initial: Pending,
        states: [Pending, Reserved, Processing, Succeeded, Failed, DeadLetter],
        events {
            reserve {
                transition: { from: Pending, to: Reserved }
                transition: { from: Failed, to: Reserved }
            }
            start_processing {
                transition: { from: Reserved, to: Processing }
            }
            succeed {
                transition: { from: Processing, to: Succeeded }
            }
            fail {
                transition: { from: Processing, to: Failed }
            }
            dead_letter {
                transition: { from: Processing, to: DeadLetter }
                transition: { from: Failed, to: DeadLetter }
            }
        }
    }

    pub(super) fn pending() -> DispatchLifecycleMachine<(), Pending> {
        DispatchLifecycleMachine::new(())
    }

    pub(super) fn reserved() -> Option<DispatchLifecycleMachine<(), Reserved>> {
        pending().reserve().ok()
    }

    pub(super) fn processing() -> Option<DispatchLifecycleMachine<(), Processing>> {
        reserved()?.start_processing().ok()
    }

    pub(super) fn failed() -> Option<DispatchLifecycleMachine<(), Failed>> {
        processing()?.fail().ok()
    }
}

fn invalid_transition(state: TaskState, event: TaskTransition) -> AppError {
    AppError::InvalidTransition(format!(
        "dispatch task {} does not accept {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: TaskState, event: TaskTransition) -> Result<TaskState, AppError> {
    use lifecycle::*;
    let next = match (state, event) {
        (TaskState::Pending, TaskTransition::Reserve) => {
            pending().reserve().ok().map(|_| TaskState::Reserved)
        }
        (TaskState::Failed, TaskTransition::Reserve) => failed()
            .and_then(|m| m.reserve().ok())
            .map(|_| TaskState::Reserved),
        (TaskState::Reserved, TaskTransition::StartProcessing) => reserved()
            .and_then(|m| m.start_processing().ok())
            .map(|_| TaskState::Processing),
        (TaskState::Processing, TaskTransition::Succeed) => processing()
            .and_then(|m| m.succeed().ok())
            .map(|_| TaskState::Succeeded),
        (TaskState::Processing, TaskTransition::Fail) => processing()
            .and_then(|m| m.fail().ok())
            .map(|_| TaskState::Failed),
        (TaskState::Processing, TaskTransition::DeadLetter) => processing()
            .and_then(|m| m.dead_letter().ok())
            .map(|_| TaskState::DeadLetter),
        (TaskState::Failed, TaskTransition::DeadLetter) => failed()
            .and_then(|m| m.dead_letter().ok())
            .map(|_| TaskState::DeadLetter),
        _ => None,
    };
    next.ok_or_else(|| invalid_transition(state, event))
}

stored_object!(DispatchTask, "dispatch_task", {
    operation: String,
    payload: String,
    tenant_id: String,
    state: TaskState,
    attempts: u32,
    max_attempts: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    scheduled_at: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    locked_at: Option<DateTime<Utc>>,
    lease_duration_secs: i64,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_error_at: Option<DateTime<Utc>>
});

impl DispatchTask {
    pub fn new(operation: &str, payload: String, tenant_id: &str, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            operation: operation.to_string(),
            payload,
            tenant_id: tenant_id.to_string(),
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            scheduled_at: now,
            locked_at: None,
            lease_duration_secs: DEFAULT_LEASE_SECS,
            worker_id: None,
            error_message: None,
            last_error_at: None,
        }
    }

    pub async fn enqueue(
        operation: &str,
        payload: String,
        tenant_id: &str,
        max_attempts: u32,
        db: &SurrealDbClient,
    ) -> Result<DispatchTask, AppError> {
        let task = Self::new(operation, payload, tenant_id, max_attempts);
        db.store_item(task.clone()).await?;
        Ok(task)
    }

    pub async fn get(task_id: &str, db: &SurrealDbClient) -> Result<Option<Self>, AppError> {
        db.get_item::<Self>(task_id).await
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.lease_duration_secs).unwrap_or(0))
    }

    /// Reserves the oldest due task. Tasks whose lease expired while reserved or
    /// processing are handed out again, which makes delivery at-least-once.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<DispatchTask>, AppError> {
        debug_assert!(compute_next_state(TaskState::Pending, TaskTransition::Reserve).is_ok());
        debug_assert!(compute_next_state(TaskState::Failed, TaskTransition::Reserve).is_ok());

        const CLAIM_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE state IN $candidate_states
                  AND scheduled_at <= $now
                  AND (
                        attempts < max_attempts
                        OR state IN $leased_states
                  )
                  AND (
                        locked_at = NONE
                        OR time::unix($now) - time::unix(locked_at) >= lease_duration_secs
                  )
                ORDER BY scheduled_at ASC, created_at ASC
                LIMIT 1
            )
            SET attempts = if state IN $increment_states THEN attempts + 1 ELSE attempts END,
                state = $reserved_state,
                locked_at = $now,
                worker_id = $worker_id,
                lease_duration_secs = $lease_secs,
                updated_at = $now
            RETURN AFTER;
        "#;

        let query = db
            .client
            .query(CLAIM_QUERY)
            .bind(("table", Self::table_name()))
            .bind((
                "candidate_states",
                vec![
                    TaskState::Pending.as_str(),
                    TaskState::Failed.as_str(),
                    TaskState::Reserved.as_str(),
                    TaskState::Processing.as_str(),
                ],
            ))
            .bind((
                "leased_states",
                vec![TaskState::Reserved.as_str(), TaskState::Processing.as_str()],
            ))
            .bind((
                "increment_states",
                vec![TaskState::Pending.as_str(), TaskState::Failed.as_str()],
            ))
            .bind(("reserved_state", TaskState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", worker_id.to_string()))
            .bind((
                "lease_secs",
                i64::try_from(lease_duration.as_secs()).unwrap_or(DEFAULT_LEASE_SECS),
            ));

        let task: Option<DispatchTask> = db.bounded("claim_dispatch_task", query).await?.take(0)?;
        Ok(task)
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<DispatchTask, AppError> {
        compute_next_state(self.state, TaskTransition::StartProcessing)?;

        const START_PROCESSING_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $processing,
                updated_at = $now,
                locked_at = $now
            WHERE state = $reserved AND worker_id = $worker_id
            RETURN AFTER;
        "#;

        let query = db
            .client
            .query(START_PROCESSING_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("reserved", TaskState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()));

        let updated: Option<DispatchTask> = db.bounded("task_processing", query).await?.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.state, TaskTransition::StartProcessing))
    }

    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<DispatchTask, AppError> {
        compute_next_state(self.state, TaskTransition::Succeed)?;

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $succeeded,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                error_message = NONE,
                last_error_at = NONE
            WHERE state = $processing AND worker_id = $worker_id
            RETURN AFTER;
        "#;

        let query = db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("succeeded", TaskState::Succeeded.as_str()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()));

        let updated: Option<DispatchTask> = db.bounded("task_succeeded", query).await?.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.state, TaskTransition::Succeed))
    }

    /// Releases the task for another attempt after `retry_delay`.
    pub async fn mark_failed(
        &self,
        message: &str,
        retry_delay: Duration,
        db: &SurrealDbClient,
    ) -> Result<DispatchTask, AppError> {
        compute_next_state(self.state, TaskTransition::Fail)?;

        let now = Utc::now();
        let retry_at = now
            + ChronoDuration::from_std(retry_delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $failed,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                scheduled_at = $retry_at,
                error_message = $error_message,
                last_error_at = $now
            WHERE state = $processing AND worker_id = $worker_id
            RETURN AFTER;
        "#;

        let query = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", TaskState::Failed.as_str()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("retry_at", SurrealDatetime::from(retry_at)))
            .bind(("error_message", message.to_string()))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()));

        let updated: Option<DispatchTask> = db.bounded("task_failed", query).await?.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.state, TaskTransition::Fail))
    }

    pub async fn mark_dead_letter(
        &self,
        message: &str,
        db: &SurrealDbClient,
    ) -> Result<DispatchTask, AppError> {
        compute_next_state(self.state, TaskTransition::DeadLetter)?;

        const DEAD_LETTER_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $dead,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                error_message = $error_message,
                last_error_at = $now
            WHERE state IN $sources
            RETURN AFTER;
        "#;

        let query = db
            .client
            .query(DEAD_LETTER_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("dead", TaskState::DeadLetter.as_str()))
            .bind((
                "sources",
                vec![TaskState::Processing.as_str(), TaskState::Failed.as_str()],
            ))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("error_message", message.to_string()));

        let updated: Option<DispatchTask> = db.bounded("task_dead_letter", query).await?.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.state, TaskTransition::DeadLetter))
    }

    /// Tasks not yet in a terminal state, oldest first.
    pub async fn unfinished(db: &SurrealDbClient) -> Result<Vec<DispatchTask>, AppError> {
        let query = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE state IN $active_states
                 ORDER BY scheduled_at ASC, created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind((
                "active_states",
                vec![
                    TaskState::Pending.as_str(),
                    TaskState::Reserved.as_str(),
                    TaskState::Processing.as_str(),
                    TaskState::Failed.as_str(),
                ],
            ));

        let tasks: Vec<DispatchTask> = db.bounded("unfinished_tasks", query).await?.take(0)?;
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb")
    }

    fn payload() -> String {
        r#"{"operation":"get_or_create","tenant_id":"t1"}"#.to_string()
    }

    #[tokio::test]
    async fn enqueued_task_defaults() {
        let db = memory_db().await;
        let task = DispatchTask::enqueue("get_or_create", payload(), "t1", 3, &db)
            .await
            .expect("enqueue");

        let stored = DispatchTask::get(&task.id, &db)
            .await
            .expect("fetch")
            .expect("stored");
        assert_eq!(stored.state, TaskState::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.payload, payload());
        assert!(stored.worker_id.is_none());
    }

    #[tokio::test]
    async fn claim_process_succeed() {
        let db = memory_db().await;
        DispatchTask::enqueue("get_or_create", payload(), "t1", 3, &db)
            .await
            .expect("enqueue");

        let claimed = DispatchTask::claim_next_ready(&db, "worker-1", Utc::now(), Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("task claimed");
        assert_eq!(claimed.state, TaskState::Reserved);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));

        // Leased, so nothing else is claimable.
        let none = DispatchTask::claim_next_ready(&db, "worker-2", Utc::now(), Duration::from_secs(60))
            .await
            .expect("claim");
        assert!(none.is_none());

        let processing = claimed.mark_processing(&db).await.expect("processing");
        let done = processing.mark_succeeded(&db).await.expect("succeeded");
        assert_eq!(done.state, TaskState::Succeeded);
        assert!(done.locked_at.is_none());
        assert!(DispatchTask::unfinished(&db).await.expect("unfinished").is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let db = memory_db().await;
        DispatchTask::enqueue("create_and_process", payload(), "t1", 3, &db)
            .await
            .expect("enqueue");

        let first = DispatchTask::claim_next_ready(&db, "crashed", Utc::now(), Duration::from_secs(1))
            .await
            .expect("claim")
            .expect("claimed");
        first.mark_processing(&db).await.expect("processing");

        let later = Utc::now() + ChronoDuration::seconds(5);
        let again = DispatchTask::claim_next_ready(&db, "rescuer", later, Duration::from_secs(60))
            .await
            .expect("reclaim")
            .expect("reclaimed");
        assert_eq!(again.id, first.id);
        assert_eq!(again.worker_id.as_deref(), Some("rescuer"));
        // Redelivery of a leased task does not burn an attempt.
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn failure_schedules_retry_then_dead_letters() {
        let db = memory_db().await;
        DispatchTask::enqueue("create_and_process", payload(), "t1", 1, &db)
            .await
            .expect("enqueue");

        let now = Utc::now();
        let claimed = DispatchTask::claim_next_ready(&db, "w", now, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("claimed");
        let processing = claimed.mark_processing(&db).await.expect("processing");

        let failed = processing
            .mark_failed("provider down", Duration::from_secs(30), &db)
            .await
            .expect("failed");
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.scheduled_at > now);
        assert!(!failed.can_retry());

        // Attempts are exhausted, so the task is no longer claimable.
        let later = now + ChronoDuration::minutes(5);
        assert!(DispatchTask::claim_next_ready(&db, "w", later, Duration::from_secs(60))
            .await
            .expect("claim")
            .is_none());

        let dead = failed.mark_dead_letter("provider down", &db).await.expect("dead");
        assert_eq!(dead.state, TaskState::DeadLetter);
        assert_eq!(dead.error_message.as_deref(), Some("provider down"));
    }

    #[test]
    fn terminal_tasks_reject_transitions() {
        assert!(compute_next_state(TaskState::Succeeded, TaskTransition::Fail).is_err());
        assert!(compute_next_state(TaskState::DeadLetter, TaskTransition::Reserve).is_err());
        assert_eq!(
            compute_next_state(TaskState::Processing, TaskTransition::DeadLetter).ok(),
            Some(TaskState::DeadLetter)
        );
    }
}
