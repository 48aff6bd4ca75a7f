//! Human-input gate.
//!
//! Lets the engine suspend a task while a handler in another process
//! supplies the answer. The request row is the single arbiter: every
//! resolution path (human answer, deadline, cancellation, sweep) goes
//! through the same conditional "resolve iff still unresolved" write, so
//! exactly one of them takes effect no matter how close the race.

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{
        execution::{Execution, ExecutionError},
        human_input_request::{
            CreateHumanInputRequest, HumanInputRequest, HumanInputRequestError, InputOutcome,
            ResolveOutcome,
        },
        stage::{CreateStage, StageType},
    },
};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    cancellation::{CancellationError, CancellationRegistry},
    events::{EventService, ExecutionEvent, Topic},
    stage_bus::{StageBus, StageBusError},
};

/// Bounded store-polling interval backing up the pub/sub wake-up.
pub const GATE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Request(#[from] HumanInputRequestError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Bus(#[from] StageBusError),
    #[error(transparent)]
    Cancellation(#[from] CancellationError),
}

/// What the engine resumes with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Answered(String),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GateHandle {
    pub execution_id: Uuid,
    pub request_id: Uuid,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct HumanInputGate {
    db: DBService,
    events: EventService,
    bus: StageBus,
    cancellations: CancellationRegistry,
}

impl HumanInputGate {
    pub fn new(
        db: DBService,
        events: EventService,
        bus: StageBus,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            db,
            events,
            bus,
            cancellations,
        }
    }

    /// Open a gate: persist the request, move the execution to
    /// WAITING_FOR_HUMAN_INPUT and emit the `human_input_request` stage.
    /// Fails with `PendingRequestExists` when the caller already holds an
    /// unresolved gate for this execution.
    pub async fn request(
        &self,
        execution: &Execution,
        task_index: i64,
        agent: Option<String>,
        prompt: &str,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<GateHandle, GateError> {
        let request = HumanInputRequest::create(
            &self.db.pool,
            &CreateHumanInputRequest {
                execution_id: execution.id,
                prompt: prompt.to_string(),
                deadline,
            },
        )
        .await?;

        Execution::set_waiting_for_input(&self.db.pool, execution.id).await?;

        self.events.publish(
            Topic::Execution(execution.id),
            ExecutionEvent::InputRequested {
                execution_id: execution.id,
                prompt: prompt.to_string(),
            },
        );

        self.bus
            .append(
                execution.crew_id,
                CreateStage {
                    execution_id: execution.id,
                    task_index,
                    stage_type: StageType::HumanInputRequest,
                    title: "Waiting for human input".to_string(),
                    content: prompt.to_string(),
                    agent,
                },
            )
            .await?;

        Ok(GateHandle {
            execution_id: execution.id,
            request_id: request.id,
            deadline: request.deadline,
        })
    }

    /// Block the calling task (not the thread) until the request resolves.
    /// Wakes on the execution topic when the resolver is in-process, and
    /// on a bounded poll otherwise; the deadline and the cancellation flag
    /// are turned into resolutions through the same conditional write as
    /// everything else.
    pub async fn await_resolution(&self, handle: &GateHandle) -> Result<GateOutcome, GateError> {
        let mut rx = self.events.subscribe(Topic::Execution(handle.execution_id));
        let mut poll = tokio::time::interval(GATE_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if let Some(request) =
                HumanInputRequest::find_by_id(&self.db.pool, handle.request_id).await?
            {
                if request.resolved_at.is_some() {
                    return Ok(match request.outcome {
                        Some(InputOutcome::Answered) => {
                            GateOutcome::Answered(request.answer.unwrap_or_default())
                        }
                        Some(InputOutcome::Cancelled) => GateOutcome::Cancelled,
                        Some(InputOutcome::TimedOut) | None => GateOutcome::TimedOut,
                    });
                }
            }

            if self.cancellations.is_cancelled(handle.execution_id).await? {
                self.resolve_with(handle.execution_id, InputOutcome::Cancelled, None)
                    .await?;
                continue;
            }

            if let Some(deadline) = handle.deadline {
                if Utc::now() >= deadline {
                    self.resolve_with(handle.execution_id, InputOutcome::TimedOut, None)
                        .await?;
                    continue;
                }
            }

            tokio::select! {
                // Any event on the topic is only a hint; the store read at
                // the top of the loop decides.
                _ = rx.recv() => {}
                _ = poll.tick() => {}
            }
        }
    }

    /// Submit a human answer. Exactly one concurrent submission wins;
    /// the rest observe `AlreadyResolved`.
    pub async fn resolve(
        &self,
        execution_id: Uuid,
        answer: &str,
    ) -> Result<ResolveOutcome, GateError> {
        self.resolve_with(execution_id, InputOutcome::Answered, Some(answer))
            .await
    }

    /// Close a pending gate because the execution is being cancelled.
    /// Returns whether there was a gate to close.
    pub async fn cancel_pending_input(&self, execution_id: Uuid) -> Result<bool, GateError> {
        let outcome = self
            .resolve_with(execution_id, InputOutcome::Cancelled, None)
            .await?;
        Ok(matches!(outcome, ResolveOutcome::Resolved(_)))
    }

    async fn resolve_with(
        &self,
        execution_id: Uuid,
        outcome: InputOutcome,
        answer: Option<&str>,
    ) -> Result<ResolveOutcome, GateError> {
        let result =
            HumanInputRequest::resolve(&self.db.pool, execution_id, outcome, answer).await?;

        if let ResolveOutcome::Resolved(_) = &result {
            // A cancelled gate leaves the status alone; the engine moves
            // the execution to CANCELLED itself.
            if matches!(outcome, InputOutcome::Answered | InputOutcome::TimedOut) {
                Execution::resume_running(&self.db.pool, execution_id).await?;
            }
            self.events.publish(
                Topic::Execution(execution_id),
                ExecutionEvent::InputResolved { execution_id },
            );
        }

        Ok(result)
    }

    /// Resolve expired, still-unresolved requests to `timed_out`. Runs as
    /// a background loop so no gate waits forever even if nothing ever
    /// polls it.
    pub async fn sweep_expired(&self) -> Result<usize, GateError> {
        let expired = HumanInputRequest::find_expired(&self.db.pool, Utc::now()).await?;
        let mut resolved = 0;
        for request in expired {
            if let ResolveOutcome::Resolved(_) = self
                .resolve_with(request.execution_id, InputOutcome::TimedOut, None)
                .await?
            {
                tracing::info!(
                    execution_id = %request.execution_id,
                    "input request timed out"
                );
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    pub fn spawn_expiry_sweep(&self) -> JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(e) = gate.sweep_expired().await {
                    tracing::warn!("input deadline sweep failed: {}", e);
                }
            }
        })
    }
}
