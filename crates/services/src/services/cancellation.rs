//! Process-wide cancellation flags.
//!
//! The durable flag lives on the execution row so it crosses the
//! gateway/worker process boundary; the in-memory map only short-circuits
//! the high-frequency reads at the engine's suspension points.

use std::sync::Arc;

use dashmap::DashMap;
use db::{
    DBService,
    models::execution::{Execution, ExecutionError},
};
use thiserror::Error;
use uuid::Uuid;

use super::events::{EventService, ExecutionEvent, Topic};

#[derive(Debug, Error)]
pub enum CancellationError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The flag is set; the engine picks it up at its next suspension point.
    Flagged,
    /// The execution already reached a terminal status.
    AlreadyTerminal,
    NotFound,
}

#[derive(Clone)]
pub struct CancellationRegistry {
    db: DBService,
    events: EventService,
    flags: Arc<DashMap<Uuid, ()>>,
}

impl CancellationRegistry {
    pub fn new(db: DBService, events: EventService) -> Self {
        Self {
            db,
            events,
            flags: Arc::new(DashMap::new()),
        }
    }

    /// Idempotent: repeated cancels of a live execution all report
    /// `Flagged`.
    pub async fn mark_cancelled(
        &self,
        execution_id: Uuid,
    ) -> Result<CancelOutcome, CancellationError> {
        let updated = Execution::request_cancel(&self.db.pool, execution_id).await?;
        if updated {
            self.flags.insert(execution_id, ());
            self.events.publish(
                Topic::Execution(execution_id),
                ExecutionEvent::CancelRequested { execution_id },
            );
            return Ok(CancelOutcome::Flagged);
        }

        match Execution::find_by_id(&self.db.pool, execution_id).await? {
            Some(_) => Ok(CancelOutcome::AlreadyTerminal),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// Cheap read for suspension points: the local map answers repeat
    /// queries, the store answers for flags set by another process.
    pub async fn is_cancelled(&self, execution_id: Uuid) -> Result<bool, CancellationError> {
        if self.flags.contains_key(&execution_id) {
            return Ok(true);
        }
        match Execution::cancel_flag(&self.db.pool, execution_id).await {
            Ok(true) => {
                self.flags.insert(execution_id, ());
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(ExecutionError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the local entry once an execution reaches a terminal status.
    pub fn forget(&self, execution_id: Uuid) {
        self.flags.remove(&execution_id);
    }
}
