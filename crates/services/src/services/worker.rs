//! Worker role: claims pending executions and hosts their engines.
//!
//! One worker process runs many executions concurrently, each as its own
//! tokio task; a gate wait yields the task, never a thread. The poll loop
//! is the cross-process hand-off from the gateway (which only inserts
//! PENDING rows) to whichever worker claims them first.

use db::{
    DBService,
    models::{
        execution::{Execution, ExecutionStatus},
        stage::{CreateStage, StageType},
    },
};
use tokio::task::JoinHandle;

use super::{
    engine::{EngineError, ExecutionEngine},
    gate::HumanInputGate,
    stage_bus::StageBus,
};

pub const WORKER_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1000);
const CLAIM_BATCH_SIZE: i64 = 16;

#[derive(Clone)]
pub struct ExecutionWorker {
    db: DBService,
    bus: StageBus,
    engine: ExecutionEngine,
    gate: HumanInputGate,
}

impl ExecutionWorker {
    pub fn new(
        db: DBService,
        bus: StageBus,
        engine: ExecutionEngine,
        gate: HumanInputGate,
    ) -> Self {
        Self {
            db,
            bus,
            engine,
            gate,
        }
    }

    /// Fail executions a previous worker left in flight. In-memory task
    /// state died with that process, so the honest terminal status is
    /// FAILED with the reason recorded. Runs once at boot, before the
    /// poll loop starts claiming new work.
    pub async fn recover_orphans(&self) -> Result<usize, EngineError> {
        let orphans = Execution::find_unfinished(&self.db.pool).await?;
        let mut recovered = 0;
        for execution in orphans {
            let message = "Worker restarted while the execution was in flight";
            let _ = self.gate.cancel_pending_input(execution.id).await;
            if Execution::finish(
                &self.db.pool,
                execution.id,
                ExecutionStatus::Failed,
                Some(message),
            )
            .await?
            {
                self.bus
                    .append(
                        execution.crew_id,
                        CreateStage {
                            execution_id: execution.id,
                            task_index: execution.current_task_index,
                            stage_type: StageType::Error,
                            title: "Execution interrupted".to_string(),
                            content: message.to_string(),
                            agent: None,
                        },
                    )
                    .await?;
                tracing::warn!(execution_id = %execution.id, "recovered orphaned execution");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Run the worker loop until the process exits. The expiry sweep for
    /// input deadlines rides along on the same role.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.recover_orphans().await {
                tracing::error!("orphan recovery failed: {}", e);
            }
            let _sweep = self.gate.spawn_expiry_sweep();

            let mut tick = tokio::time::interval(WORKER_POLL_INTERVAL);
            loop {
                tick.tick().await;
                let pending = match Execution::find_pending(&self.db.pool, CLAIM_BATCH_SIZE).await
                {
                    Ok(pending) => pending,
                    Err(e) => {
                        tracing::error!("failed to poll for pending executions: {}", e);
                        continue;
                    }
                };

                for execution in pending {
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        match engine.run(execution.id).await {
                            Ok(status) => {
                                tracing::info!(
                                    execution_id = %execution.id,
                                    status = %status,
                                    "execution finished"
                                );
                            }
                            // Another worker won the claim.
                            Err(EngineError::NotPending) => {}
                            Err(e) => {
                                tracing::error!(
                                    execution_id = %execution.id,
                                    "execution errored: {}",
                                    e
                                );
                            }
                        }
                    });
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::executor::{
        TaskContext, TaskExecutor, TaskExecutorError, TaskOutput,
    };
    use crate::services::test_support::TestHarness;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct NoopExecutor;

    #[async_trait]
    impl TaskExecutor for NoopExecutor {
        async fn run_task(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput, TaskExecutorError> {
            ctx.message("Working", "done in one step").await?;
            Ok(TaskOutput {
                summary: "ok".to_string(),
            })
        }
    }

    fn worker_for(harness: &TestHarness) -> ExecutionWorker {
        let engine = ExecutionEngine::new(
            harness.db.clone(),
            harness.bus.clone(),
            harness.gate.clone(),
            harness.cancellations.clone(),
            Arc::new(NoopExecutor),
        );
        ExecutionWorker::new(
            harness.db.clone(),
            harness.bus.clone(),
            engine,
            harness.gate.clone(),
        )
    }

    #[tokio::test]
    async fn worker_picks_up_pending_executions() {
        let harness = TestHarness::new().await;
        let (_, execution) = harness.create_crew_and_execution(2).await;

        let worker = worker_for(&harness);
        let handle = worker.spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let row = Execution::find_by_id(&harness.db.pool, execution.id)
                .await
                .unwrap()
                .unwrap();
            if row.status == ExecutionStatus::Completed {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker never completed the execution (status {})",
                row.status
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        handle.abort();
    }

    #[tokio::test]
    async fn orphaned_executions_are_failed_at_boot() {
        let harness = TestHarness::new().await;
        let (_, execution) = harness.create_crew_and_execution(1).await;
        Execution::try_start(&harness.db.pool, execution.id)
            .await
            .unwrap();

        let worker = worker_for(&harness);
        assert_eq!(worker.recover_orphans().await.unwrap(), 1);

        let row = Execution::find_by_id(&harness.db.pool, execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert!(row.error.is_some());

        // Idempotent: a second boot finds nothing to recover.
        assert_eq!(worker.recover_orphans().await.unwrap(), 0);
    }
}
