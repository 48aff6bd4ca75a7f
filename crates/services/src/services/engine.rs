//! Execution engine.
//!
//! Drives one execution through its crew's task sequence: claims the
//! PENDING row, invokes the task executor per task, translates its
//! callbacks into stages, and settles the run into exactly one terminal
//! status. Cancellation is cooperative — observed at task boundaries and
//! inside gate waits, never by preempting an in-flight executor call.

use std::sync::Arc;

use db::{
    DBService,
    models::{
        crew::{Crew, CrewError},
        execution::{Execution, ExecutionError, ExecutionStatus},
        stage::{CreateStage, StageType},
    },
};
use thiserror::Error;
use uuid::Uuid;

use super::{
    cancellation::{CancellationError, CancellationRegistry},
    executor::{TaskContext, TaskExecutor, TaskExecutorError},
    gate::{GateError, HumanInputGate},
    stage_bus::{StageBus, StageBusError},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Crew(#[from] CrewError),
    #[error(transparent)]
    Bus(#[from] StageBusError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Cancellation(#[from] CancellationError),
    #[error("Execution is not pending")]
    NotPending,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    db: DBService,
    bus: StageBus,
    gate: HumanInputGate,
    cancellations: CancellationRegistry,
    executor: Arc<dyn TaskExecutor>,
}

impl ExecutionEngine {
    pub fn new(
        db: DBService,
        bus: StageBus,
        gate: HumanInputGate,
        cancellations: CancellationRegistry,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            db,
            bus,
            gate,
            cancellations,
            executor,
        }
    }

    /// Drive one execution from PENDING to a terminal status. Returns
    /// `NotPending` when another worker already claimed it, which callers
    /// treat as "nothing to do".
    pub async fn run(&self, execution_id: Uuid) -> Result<ExecutionStatus, EngineError> {
        let Some(mut execution) = Execution::try_start(&self.db.pool, execution_id).await? else {
            return Err(EngineError::NotPending);
        };

        tracing::info!(execution_id = %execution.id, crew_id = %execution.crew_id, "execution started");

        let Some(crew) = Crew::find_by_id(&self.db.pool, execution.crew_id).await? else {
            return self
                .finish_failed(&execution, 0, "Crew configuration is missing")
                .await;
        };
        let tasks = crew.task_list();

        let mut last_summary = String::new();
        for (index, task) in tasks.iter().enumerate() {
            let task_index = index as i64;

            // Task boundary: the one place a cancel can interleave with
            // task progress.
            if self.cancellations.is_cancelled(execution.id).await? {
                return self.finish_cancelled(&execution, task_index).await;
            }

            Execution::set_task_index(&self.db.pool, execution.id, task_index).await?;
            execution.current_task_index = task_index;

            self.bus
                .append(
                    execution.crew_id,
                    CreateStage {
                        execution_id: execution.id,
                        task_index,
                        stage_type: StageType::Status,
                        title: "Task started".to_string(),
                        content: format!("{} picked up \"{}\"", task.agent, task.name),
                        agent: Some(task.agent.clone()),
                    },
                )
                .await?;

            let ctx = TaskContext::new(
                &execution,
                task,
                task_index,
                &self.bus,
                &self.gate,
                &self.cancellations,
            );

            match self.executor.run_task(&ctx).await {
                Ok(output) => {
                    last_summary = output.summary;
                    // The row may have round-tripped through
                    // WAITING_FOR_HUMAN_INPUT while the task ran.
                    if let Some(row) = Execution::find_by_id(&self.db.pool, execution.id).await? {
                        execution = row;
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    match err {
                        TaskExecutorError::Cancelled => {
                            return self.finish_cancelled(&execution, task_index).await;
                        }
                        TaskExecutorError::InputRequired | TaskExecutorError::Failed(_) => {
                            return self.finish_failed(&execution, task_index, &message).await;
                        }
                        // Plumbing failures mean the audit trail can no
                        // longer be trusted; fail the run and bubble up.
                        TaskExecutorError::Gate(e) => {
                            let _ = self.finish_failed(&execution, task_index, &message).await;
                            return Err(EngineError::Gate(e));
                        }
                        TaskExecutorError::Bus(e) => {
                            let _ = self.finish_failed(&execution, task_index, &message).await;
                            return Err(EngineError::Bus(e));
                        }
                        TaskExecutorError::Cancellation(e) => {
                            let _ = self.finish_failed(&execution, task_index, &message).await;
                            return Err(EngineError::Cancellation(e));
                        }
                    }
                }
            }
        }

        let final_index = tasks.len().saturating_sub(1) as i64;
        if self.cancellations.is_cancelled(execution.id).await? {
            return self.finish_cancelled(&execution, final_index).await;
        }

        Execution::finish(&self.db.pool, execution.id, ExecutionStatus::Completed, None).await?;
        self.cancellations.forget(execution.id);
        self.bus
            .append(
                execution.crew_id,
                CreateStage {
                    execution_id: execution.id,
                    task_index: final_index,
                    stage_type: StageType::Terminal,
                    title: "Crew run completed".to_string(),
                    content: last_summary,
                    agent: None,
                },
            )
            .await?;

        tracing::info!(execution_id = %execution.id, "execution completed");
        Ok(ExecutionStatus::Completed)
    }

    async fn finish_cancelled(
        &self,
        execution: &Execution,
        task_index: i64,
    ) -> Result<ExecutionStatus, EngineError> {
        Execution::finish(&self.db.pool, execution.id, ExecutionStatus::Cancelled, None).await?;
        self.cancellations.forget(execution.id);
        self.bus
            .append(
                execution.crew_id,
                CreateStage {
                    execution_id: execution.id,
                    task_index,
                    stage_type: StageType::Terminal,
                    title: "Execution cancelled".to_string(),
                    content: "Cancellation requested".to_string(),
                    agent: None,
                },
            )
            .await?;

        tracing::info!(execution_id = %execution.id, "execution cancelled");
        Ok(ExecutionStatus::Cancelled)
    }

    async fn finish_failed(
        &self,
        execution: &Execution,
        task_index: i64,
        message: &str,
    ) -> Result<ExecutionStatus, EngineError> {
        Execution::finish(
            &self.db.pool,
            execution.id,
            ExecutionStatus::Failed,
            Some(message),
        )
        .await?;
        self.cancellations.forget(execution.id);
        self.bus
            .append(
                execution.crew_id,
                CreateStage {
                    execution_id: execution.id,
                    task_index,
                    stage_type: StageType::Error,
                    title: "Task failed".to_string(),
                    content: message.to_string(),
                    agent: None,
                },
            )
            .await?;

        tracing::warn!(execution_id = %execution.id, error = message, "execution failed");
        Ok(ExecutionStatus::Failed)
    }
}
