use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HumanInputRequestError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Input request not found")]
    NotFound,
    #[error("An unresolved input request already exists for this execution")]
    PendingRequestExists,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "input_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InputOutcome {
    Answered,
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for InputOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputOutcome::Answered => write!(f, "answered"),
            InputOutcome::TimedOut => write!(f, "timed_out"),
            InputOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A suspended question from the engine to whichever human answers first.
/// At most one row per execution is unresolved at a time (partial unique
/// index); resolution is a single conditional update so concurrent
/// submissions race safely.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct HumanInputRequest {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub prompt: String,
    pub answer: Option<String>,
    pub outcome: Option<InputOutcome>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateHumanInputRequest {
    pub execution_id: Uuid,
    pub prompt: String,
    pub deadline: Option<DateTime<Utc>>,
}

/// Result of a conditional resolve: exactly one concurrent caller gets
/// `Resolved`, every other one observes `AlreadyResolved`.
#[derive(Debug)]
pub enum ResolveOutcome {
    Resolved(HumanInputRequest),
    AlreadyResolved,
    NotFound,
}

impl HumanInputRequest {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateHumanInputRequest,
    ) -> Result<Self, HumanInputRequestError> {
        let id = Uuid::new_v4();

        let request = sqlx::query_as::<_, HumanInputRequest>(
            r#"
            INSERT INTO human_input_requests (id, execution_id, prompt, deadline)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.execution_id)
        .bind(&data.prompt)
        .bind(data.deadline)
        .fetch_one(pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => {
                HumanInputRequestError::PendingRequestExists
            }
            _ => HumanInputRequestError::Database(e),
        })?;

        Ok(request)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, HumanInputRequestError> {
        let request = sqlx::query_as::<_, HumanInputRequest>(
            r#"SELECT * FROM human_input_requests WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(request)
    }

    pub async fn find_unresolved(
        pool: &SqlitePool,
        execution_id: Uuid,
    ) -> Result<Option<Self>, HumanInputRequestError> {
        let request = sqlx::query_as::<_, HumanInputRequest>(
            r#"
            SELECT * FROM human_input_requests
            WHERE execution_id = ?1 AND resolved_at IS NULL
            "#,
        )
        .bind(execution_id)
        .fetch_optional(pool)
        .await?;

        Ok(request)
    }

    /// "Resolve iff still unresolved": the winning writer gets the row
    /// back, losers learn whether it was already resolved or never existed.
    pub async fn resolve(
        pool: &SqlitePool,
        execution_id: Uuid,
        outcome: InputOutcome,
        answer: Option<&str>,
    ) -> Result<ResolveOutcome, HumanInputRequestError> {
        let resolved = sqlx::query_as::<_, HumanInputRequest>(
            r#"
            UPDATE human_input_requests
            SET answer = ?2, outcome = ?3, resolved_at = datetime('now', 'subsec')
            WHERE execution_id = ?1 AND resolved_at IS NULL
            RETURNING *
            "#,
        )
        .bind(execution_id)
        .bind(answer)
        .bind(outcome)
        .fetch_optional(pool)
        .await?;

        if let Some(request) = resolved {
            return Ok(ResolveOutcome::Resolved(request));
        }

        let any: Option<(Uuid,)> = sqlx::query_as(
            r#"SELECT id FROM human_input_requests WHERE execution_id = ?1 LIMIT 1"#,
        )
        .bind(execution_id)
        .fetch_optional(pool)
        .await?;

        match any {
            Some(_) => Ok(ResolveOutcome::AlreadyResolved),
            None => Ok(ResolveOutcome::NotFound),
        }
    }

    /// Unresolved requests whose deadline has passed, for the sweep.
    pub async fn find_expired(
        pool: &SqlitePool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, HumanInputRequestError> {
        let requests = sqlx::query_as::<_, HumanInputRequest>(
            r#"
            SELECT * FROM human_input_requests
            WHERE resolved_at IS NULL AND deadline IS NOT NULL AND deadline <= ?1
            "#,
        )
        .bind(now)
        .fetch_all(pool)
        .await?;

        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::execution::{CreateExecution, Execution};
    use crate::models::test_utils::{create_test_crew, setup_test_pool};

    async fn create_execution(pool: &SqlitePool) -> Uuid {
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
        .id
    }

    fn request(execution_id: Uuid, deadline: Option<DateTime<Utc>>) -> CreateHumanInputRequest {
        CreateHumanInputRequest {
            execution_id,
            prompt: "Proceed with the audit?".to_string(),
            deadline,
        }
    }

    #[tokio::test]
    async fn at_most_one_unresolved_request_per_execution() {
        let pool = setup_test_pool().await;
        let execution_id = create_execution(&pool).await;

        HumanInputRequest::create(&pool, &request(execution_id, None))
            .await
            .unwrap();

        let err = HumanInputRequest::create(&pool, &request(execution_id, None))
            .await
            .unwrap_err();
        assert!(matches!(err, HumanInputRequestError::PendingRequestExists));

        // Resolving frees the slot for a later request.
        HumanInputRequest::resolve(&pool, execution_id, InputOutcome::Answered, Some("yes"))
            .await
            .unwrap();
        HumanInputRequest::create(&pool, &request(execution_id, None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_resolve_observes_already_resolved() {
        let pool = setup_test_pool().await;
        let execution_id = create_execution(&pool).await;
        HumanInputRequest::create(&pool, &request(execution_id, None))
            .await
            .unwrap();

        let first =
            HumanInputRequest::resolve(&pool, execution_id, InputOutcome::Answered, Some("yes"))
                .await
                .unwrap();
        let winner = match first {
            ResolveOutcome::Resolved(r) => r,
            other => panic!("first resolve should win, got {other:?}"),
        };
        assert_eq!(winner.answer.as_deref(), Some("yes"));
        assert_eq!(winner.outcome, Some(InputOutcome::Answered));

        let second =
            HumanInputRequest::resolve(&pool, execution_id, InputOutcome::Answered, Some("no"))
                .await
                .unwrap();
        assert!(matches!(second, ResolveOutcome::AlreadyResolved));

        // The stored answer is the winning call's payload.
        let row = HumanInputRequest::find_by_id(&pool, winner.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.answer.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn resolve_without_any_request_is_not_found() {
        let pool = setup_test_pool().await;
        let execution_id = create_execution(&pool).await;

        let outcome =
            HumanInputRequest::resolve(&pool, execution_id, InputOutcome::Answered, Some("yes"))
                .await
                .unwrap();
        assert!(matches!(outcome, ResolveOutcome::NotFound));
    }

    #[tokio::test]
    async fn expired_requests_are_picked_up_by_the_sweep_query() {
        let pool = setup_test_pool().await;
        let execution_id = create_execution(&pool).await;

        let deadline = Utc::now() - chrono::Duration::seconds(5);
        HumanInputRequest::create(&pool, &request(execution_id, Some(deadline)))
            .await
            .unwrap();

        let expired = HumanInputRequest::find_expired(&pool, Utc::now())
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].execution_id, execution_id);

        // A request without a deadline never expires.
        HumanInputRequest::resolve(&pool, execution_id, InputOutcome::TimedOut, None)
            .await
            .unwrap();
        let other = create_execution(&pool).await;
        HumanInputRequest::create(&pool, &request(other, None))
            .await
            .unwrap();
        let expired = HumanInputRequest::find_expired(&pool, Utc::now())
            .await
            .unwrap();
        assert!(expired.is_empty());
    }
}
