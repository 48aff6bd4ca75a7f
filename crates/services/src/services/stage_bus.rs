//! Append-then-publish pipeline for stages.
//!
//! Persistence is the source of truth: an append that fails the store is
//! an error for the caller, while publish failures after a successful
//! append only cost push latency (viewers fall back to replay).

use db::{
    DBService,
    models::{
        execution::{Execution, ExecutionError},
        stage::{CreateStage, Stage, StageError},
    },
};
use thiserror::Error;
use uuid::Uuid;

use super::events::{EventService, ExecutionEvent, Topic};

#[derive(Debug, Error)]
pub enum StageBusError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("Execution not found")]
    ExecutionNotFound,
}

#[derive(Clone)]
pub struct StageBus {
    db: DBService,
    events: EventService,
}

impl StageBus {
    pub fn new(db: DBService, events: EventService) -> Self {
        Self { db, events }
    }

    /// Persist a stage and publish it on the execution topic and the
    /// owning crew's topic. Returns the stored stage together with the
    /// execution row as of the append, which carries the status viewers
    /// see alongside the stage.
    pub async fn append(
        &self,
        crew_id: Uuid,
        data: CreateStage,
    ) -> Result<(Stage, Execution), StageBusError> {
        let stage = Stage::append(&self.db.pool, &data).await?;
        let execution = Execution::find_by_id(&self.db.pool, stage.execution_id)
            .await?
            .ok_or(StageBusError::ExecutionNotFound)?;

        let event = ExecutionEvent::StageAppended {
            execution_id: stage.execution_id,
            crew_id,
            sequence: stage.sequence,
            task_index: stage.task_index,
            status: execution.status,
            stage: stage.clone(),
        };
        self.events
            .publish(Topic::Execution(stage.execution_id), event.clone());
        self.events.publish(Topic::Crew(crew_id), event);

        Ok((stage, execution))
    }

    /// Persisted stages after `after_sequence`, in sequence order.
    pub async fn replay(
        &self,
        execution_id: Uuid,
        after_sequence: i64,
    ) -> Result<Vec<Stage>, StageBusError> {
        Ok(Stage::find_after(&self.db.pool, execution_id, after_sequence).await?)
    }

    pub async fn latest_sequence(&self, execution_id: Uuid) -> Result<i64, StageBusError> {
        Ok(Stage::latest_sequence(&self.db.pool, execution_id).await?)
    }
}
