//! Seam to the task-reasoning backend.
//!
//! The engine invokes one `TaskExecutor` per task and hands it a
//! `TaskContext`; everything the executor reports back (messages, tool
//! activity, the need for human input) flows through the context, which
//! stamps the engine-assigned task index on every stage it emits.

use async_trait::async_trait;
use chrono::Utc;
use db::models::{
    crew::CrewTask,
    execution::Execution,
    stage::{CreateStage, StageType},
};
use thiserror::Error;

use super::{
    cancellation::{CancellationError, CancellationRegistry},
    gate::{GateError, GateOutcome, HumanInputGate},
    stage_bus::{StageBus, StageBusError},
};

#[derive(Debug, Error)]
pub enum TaskExecutorError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Bus(#[from] StageBusError),
    #[error(transparent)]
    Cancellation(#[from] CancellationError),
    #[error("Execution cancelled")]
    Cancelled,
    #[error("No input provided for a blocking step")]
    InputRequired,
    /// The reasoning backend's own failure, surfaced verbatim.
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub summary: String,
}

/// Execution-scoped callbacks available to a running task.
pub struct TaskContext<'a> {
    execution: &'a Execution,
    task: &'a CrewTask,
    task_index: i64,
    bus: &'a StageBus,
    gate: &'a HumanInputGate,
    cancellations: &'a CancellationRegistry,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        execution: &'a Execution,
        task: &'a CrewTask,
        task_index: i64,
        bus: &'a StageBus,
        gate: &'a HumanInputGate,
        cancellations: &'a CancellationRegistry,
    ) -> Self {
        Self {
            execution,
            task,
            task_index,
            bus,
            gate,
            cancellations,
        }
    }

    pub fn task(&self) -> &CrewTask {
        self.task
    }

    pub fn task_index(&self) -> i64 {
        self.task_index
    }

    pub async fn status(&self, title: &str, content: &str) -> Result<(), TaskExecutorError> {
        self.emit(StageType::Status, title, content).await
    }

    pub async fn message(&self, title: &str, content: &str) -> Result<(), TaskExecutorError> {
        self.emit(StageType::Message, title, content).await
    }

    pub async fn tool_call(&self, title: &str, content: &str) -> Result<(), TaskExecutorError> {
        self.emit(StageType::ToolCall, title, content).await
    }

    pub async fn tool_result(&self, title: &str, content: &str) -> Result<(), TaskExecutorError> {
        self.emit(StageType::ToolResult, title, content).await
    }

    /// Cooperative check for long-running tasks; the engine also checks
    /// at every task boundary.
    pub async fn is_cancelled(&self) -> Result<bool, TaskExecutorError> {
        Ok(self.cancellations.is_cancelled(self.execution.id).await?)
    }

    /// Suspend until a human answers, the configured timeout elapses, or
    /// the execution is cancelled. `None` means "no input provided":
    /// soft-blocking tasks continue with it, hard-blocking ones fail
    /// before this returns.
    pub async fn request_input(&self, prompt: &str) -> Result<Option<String>, TaskExecutorError> {
        let spec = self.task.human_input.as_ref();
        let deadline = spec
            .and_then(|s| s.timeout_seconds)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

        let handle = self
            .gate
            .request(
                self.execution,
                self.task_index,
                Some(self.task.agent.clone()),
                prompt,
                deadline,
            )
            .await?;

        match self.gate.await_resolution(&handle).await? {
            GateOutcome::Answered(answer) => {
                self.status("Human input received", &answer).await?;
                Ok(Some(answer))
            }
            GateOutcome::TimedOut => {
                if spec.is_some_and(|s| s.hard_blocking) {
                    return Err(TaskExecutorError::InputRequired);
                }
                self.status("No input before the deadline", "Continuing without input")
                    .await?;
                Ok(None)
            }
            GateOutcome::Cancelled => Err(TaskExecutorError::Cancelled),
        }
    }

    async fn emit(
        &self,
        stage_type: StageType,
        title: &str,
        content: &str,
    ) -> Result<(), TaskExecutorError> {
        self.bus
            .append(
                self.execution.crew_id,
                CreateStage {
                    execution_id: self.execution.id,
                    task_index: self.task_index,
                    stage_type,
                    title: title.to_string(),
                    content: content.to_string(),
                    agent: Some(self.task.agent.clone()),
                },
            )
            .await?;
        Ok(())
    }
}

/// The opaque reasoning backend invoked once per task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run_task(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput, TaskExecutorError>;
}

/// Development stand-in for a real reasoning backend. Walks the motions
/// of a task (a message, one tool round-trip, the configured human
/// checkpoint) without doing any analysis.
pub struct SimulatedExecutor {
    pub step_delay: std::time::Duration,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self {
            step_delay: std::time::Duration::from_millis(150),
        }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn run_task(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput, TaskExecutorError> {
        let task = ctx.task();

        ctx.message(
            "Planning",
            &format!("{} is working on \"{}\"", task.agent, task.name),
        )
        .await?;
        tokio::time::sleep(self.step_delay).await;

        ctx.tool_call("Running tool", &format!("Collect data for \"{}\"", task.name))
            .await?;
        tokio::time::sleep(self.step_delay).await;
        ctx.tool_result("Tool finished", &task.description).await?;

        if let Some(spec) = &task.human_input {
            if let Some(answer) = ctx.request_input(&spec.prompt).await? {
                ctx.message("Applying input", &answer).await?;
            }
        }

        Ok(TaskOutput {
            summary: format!("{} finished \"{}\"", task.agent, task.name),
        })
    }
}
