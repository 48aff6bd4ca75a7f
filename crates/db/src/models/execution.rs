use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Execution not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "execution_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingForHumanInput,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "PENDING"),
            ExecutionStatus::Running => write!(f, "RUNNING"),
            ExecutionStatus::WaitingForHumanInput => write!(f, "WAITING_FOR_HUMAN_INPUT"),
            ExecutionStatus::Completed => write!(f, "COMPLETED"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
            ExecutionStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One run of a crew from start to a terminal status. Status transitions
/// are expressed as conditional updates so they stay monotonic even with
/// the gateway and worker writing from different processes.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Execution {
    pub id: Uuid,
    pub crew_id: Uuid,
    pub client_id: Uuid,
    pub status: ExecutionStatus,
    pub current_task_index: i64,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateExecution {
    pub crew_id: Uuid,
    pub client_id: Uuid,
}

impl Execution {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateExecution,
        id: Uuid,
    ) -> Result<Self, ExecutionError> {
        let execution = sqlx::query_as::<_, Execution>(
            r#"
            INSERT INTO executions (id, crew_id, client_id, status)
            VALUES (?1, ?2, ?3, 'PENDING')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.crew_id)
        .bind(data.client_id)
        .fetch_one(pool)
        .await?;

        Ok(execution)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, ExecutionError> {
        let execution =
            sqlx::query_as::<_, Execution>(r#"SELECT * FROM executions WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(pool)
                .await?;

        Ok(execution)
    }

    pub async fn find_by_crew(
        pool: &SqlitePool,
        crew_id: Uuid,
    ) -> Result<Vec<Self>, ExecutionError> {
        let executions = sqlx::query_as::<_, Execution>(
            r#"SELECT * FROM executions WHERE crew_id = ?1 ORDER BY created_at ASC"#,
        )
        .bind(crew_id)
        .fetch_all(pool)
        .await?;

        Ok(executions)
    }

    pub async fn find_pending(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, ExecutionError> {
        let executions = sqlx::query_as::<_, Execution>(
            r#"
            SELECT * FROM executions
            WHERE status = 'PENDING'
            ORDER BY created_at ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(executions)
    }

    /// Executions a previous worker left in flight.
    pub async fn find_unfinished(pool: &SqlitePool) -> Result<Vec<Self>, ExecutionError> {
        let executions = sqlx::query_as::<_, Execution>(
            r#"
            SELECT * FROM executions
            WHERE status IN ('RUNNING', 'WAITING_FOR_HUMAN_INPUT')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(executions)
    }

    /// Claim a pending execution. Returns `None` when it was not PENDING,
    /// which is how concurrent workers lose the race safely.
    pub async fn try_start(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, ExecutionError> {
        let execution = sqlx::query_as::<_, Execution>(
            r#"
            UPDATE executions
            SET status = 'RUNNING', started_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'PENDING'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(execution)
    }

    pub async fn set_waiting_for_input(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<bool, ExecutionError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'WAITING_FOR_HUMAN_INPUT'
            WHERE id = ?1 AND status = 'RUNNING'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Flip WAITING_FOR_HUMAN_INPUT back to RUNNING. Idempotent: returns
    /// `false` when the execution was not waiting.
    pub async fn resume_running(pool: &SqlitePool, id: Uuid) -> Result<bool, ExecutionError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'RUNNING'
            WHERE id = ?1 AND status = 'WAITING_FOR_HUMAN_INPUT'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_task_index(
        pool: &SqlitePool,
        id: Uuid,
        task_index: i64,
    ) -> Result<(), ExecutionError> {
        sqlx::query(
            r#"
            UPDATE executions
            SET current_task_index = ?2
            WHERE id = ?1 AND current_task_index <= ?2
            "#,
        )
        .bind(id)
        .bind(task_index)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Move to a terminal status. Returns `false` when the execution was
    /// already terminal, so repeated finishes are no-ops.
    pub async fn finish(
        pool: &SqlitePool,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<bool, ExecutionError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?2, error = ?3, completed_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Set the cancellation flag on a live execution. Returns `false` when
    /// the execution is already terminal.
    pub async fn request_cancel(pool: &SqlitePool, id: Uuid) -> Result<bool, ExecutionError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET cancel_requested = 1
            WHERE id = ?1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel_flag(pool: &SqlitePool, id: Uuid) -> Result<bool, ExecutionError> {
        let row: Option<(bool,)> =
            sqlx::query_as(r#"SELECT cancel_requested FROM executions WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(pool)
                .await?;

        match row {
            Some((flag,)) => Ok(flag),
            None => Err(ExecutionError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{create_test_crew, setup_test_pool};

    async fn create_pending(pool: &SqlitePool) -> Execution {
        let crew_id = create_test_crew(pool).await;
        Execution::create(
            pool,
            &CreateExecution {
                crew_id,
                client_id: Uuid::new_v4(),
            },
            Uuid::new_v4(),
        )
        .await
        .expect("failed to create execution")
    }

    #[tokio::test]
    async fn start_claims_pending_exactly_once() {
        let pool = setup_test_pool().await;
        let execution = create_pending(&pool).await;

        let first = Execution::try_start(&pool, execution.id).await.unwrap();
        assert_eq!(first.unwrap().status, ExecutionStatus::Running);

        let second = Execution::try_start(&pool, execution.id).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let pool = setup_test_pool().await;
        let execution = create_pending(&pool).await;
        Execution::try_start(&pool, execution.id).await.unwrap();

        assert!(
            Execution::finish(&pool, execution.id, ExecutionStatus::Completed, None)
                .await
                .unwrap()
        );
        assert!(
            !Execution::finish(&pool, execution.id, ExecutionStatus::Failed, Some("late"))
                .await
                .unwrap()
        );

        let row = Execution::find_by_id(&pool, execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert!(row.error.is_none());
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_flag_rejected_on_terminal_execution() {
        let pool = setup_test_pool().await;
        let execution = create_pending(&pool).await;

        assert!(Execution::request_cancel(&pool, execution.id).await.unwrap());
        assert!(Execution::cancel_flag(&pool, execution.id).await.unwrap());

        Execution::try_start(&pool, execution.id).await.unwrap();
        Execution::finish(&pool, execution.id, ExecutionStatus::Cancelled, None)
            .await
            .unwrap();

        assert!(!Execution::request_cancel(&pool, execution.id).await.unwrap());
    }

    #[tokio::test]
    async fn waiting_and_resume_follow_the_state_machine() {
        let pool = setup_test_pool().await;
        let execution = create_pending(&pool).await;

        // Cannot wait for input before the execution is running.
        assert!(
            !Execution::set_waiting_for_input(&pool, execution.id)
                .await
                .unwrap()
        );

        Execution::try_start(&pool, execution.id).await.unwrap();
        assert!(
            Execution::set_waiting_for_input(&pool, execution.id)
                .await
                .unwrap()
        );
        assert!(Execution::resume_running(&pool, execution.id).await.unwrap());
        assert!(!Execution::resume_running(&pool, execution.id).await.unwrap());
    }
}
