use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Stage not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "stage_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Status,
    Message,
    ToolCall,
    ToolResult,
    HumanInputRequest,
    Error,
    Terminal,
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageType::Status => write!(f, "status"),
            StageType::Message => write!(f, "message"),
            StageType::ToolCall => write!(f, "tool_call"),
            StageType::ToolResult => write!(f, "tool_result"),
            StageType::HumanInputRequest => write!(f, "human_input_request"),
            StageType::Error => write!(f, "error"),
            StageType::Terminal => write!(f, "terminal"),
        }
    }
}

/// One immutable progress event within an execution. `sequence` is the
/// sole ordering authority; rows are never updated after the append.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Stage {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub sequence: i64,
    pub task_index: i64,
    pub stage_type: StageType,
    pub title: String,
    pub content: String,
    pub agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateStage {
    pub execution_id: Uuid,
    pub task_index: i64,
    pub stage_type: StageType,
    pub title: String,
    pub content: String,
    pub agent: Option<String>,
}

impl Stage {
    /// Append a stage, assigning the next sequence number for the
    /// execution in the same statement. The engine is the only writer for
    /// a given execution, so the increment needs no distributed sequencer;
    /// the UNIQUE(execution_id, sequence) constraint backstops it.
    pub async fn append(pool: &SqlitePool, data: &CreateStage) -> Result<Self, StageError> {
        let id = Uuid::new_v4();

        let stage = sqlx::query_as::<_, Stage>(
            r#"
            INSERT INTO stages (id, execution_id, sequence, task_index, stage_type, title, content, agent)
            SELECT ?1, ?2, COALESCE(MAX(sequence), 0) + 1, ?3, ?4, ?5, ?6, ?7
            FROM stages WHERE execution_id = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.execution_id)
        .bind(data.task_index)
        .bind(data.stage_type)
        .bind(&data.title)
        .bind(&data.content)
        .bind(&data.agent)
        .fetch_one(pool)
        .await?;

        Ok(stage)
    }

    /// All persisted stages with a sequence number strictly greater than
    /// `after_sequence`, in order. `after_sequence = 0` replays everything.
    pub async fn find_after(
        pool: &SqlitePool,
        execution_id: Uuid,
        after_sequence: i64,
    ) -> Result<Vec<Self>, StageError> {
        let stages = sqlx::query_as::<_, Stage>(
            r#"
            SELECT * FROM stages
            WHERE execution_id = ?1 AND sequence > ?2
            ORDER BY sequence ASC
            "#,
        )
        .bind(execution_id)
        .bind(after_sequence)
        .fetch_all(pool)
        .await?;

        Ok(stages)
    }

    pub async fn latest_sequence(
        pool: &SqlitePool,
        execution_id: Uuid,
    ) -> Result<i64, StageError> {
        let row: (i64,) = sqlx::query_as(
            r#"SELECT COALESCE(MAX(sequence), 0) FROM stages WHERE execution_id = ?1"#,
        )
        .bind(execution_id)
        .fetch_one(pool)
        .await?;

        Ok(row.0)
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

    fn draft(execution_id: Uuid, task_index: i64, stage_type: StageType) -> CreateStage {
        CreateStage {
            execution_id,
            task_index,
            stage_type,
            title: "stage".to_string(),
            content: "content".to_string(),
            agent: None,
        }
    }

    #[tokio::test]
    async fn sequences_are_gap_free_from_one() {
        let pool = setup_test_pool().await;
        let execution_id = create_execution(&pool).await;

        for expected in 1..=5_i64 {
            let stage = Stage::append(&pool, &draft(execution_id, 0, StageType::Status))
                .await
                .unwrap();
            assert_eq!(stage.sequence, expected);
        }

        let replayed = Stage::find_after(&pool, execution_id, 0).await.unwrap();
        let sequences: Vec<i64> = replayed.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn sequences_are_independent_per_execution() {
        let pool = setup_test_pool().await;
        let first = create_execution(&pool).await;
        let second = create_execution(&pool).await;

        Stage::append(&pool, &draft(first, 0, StageType::Status))
            .await
            .unwrap();
        Stage::append(&pool, &draft(first, 0, StageType::Message))
            .await
            .unwrap();
        let other = Stage::append(&pool, &draft(second, 0, StageType::Status))
            .await
            .unwrap();

        assert_eq!(other.sequence, 1);
        assert_eq!(Stage::latest_sequence(&pool, first).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replay_after_a_watermark_skips_older_stages() {
        let pool = setup_test_pool().await;
        let execution_id = create_execution(&pool).await;

        for _ in 0..6 {
            Stage::append(&pool, &draft(execution_id, 0, StageType::Message))
                .await
                .unwrap();
        }

        let tail = Stage::find_after(&pool, execution_id, 3).await.unwrap();
        let sequences: Vec<i64> = tail.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![4, 5, 6]);
    }
}
