//! Pub/sub fabric for execution progress.
//!
//! Topics are keyed by execution id (viewer streams, gate wake-ups) and by
//! crew id (board-wide aggregation). Delivery is best-effort and in-process;
//! anything that must not miss a signal also polls the store at a bounded
//! interval, so a dropped or lagged broadcast only costs latency.

use std::sync::Arc;

use dashmap::DashMap;
use db::models::{execution::ExecutionStatus, stage::Stage};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ts_rs::TS;
use uuid::Uuid;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Execution(Uuid),
    Crew(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    StageAppended {
        execution_id: Uuid,
        crew_id: Uuid,
        sequence: i64,
        task_index: i64,
        status: ExecutionStatus,
        stage: Stage,
    },
    InputRequested {
        execution_id: Uuid,
        prompt: String,
    },
    InputResolved {
        execution_id: Uuid,
    },
    CancelRequested {
        execution_id: Uuid,
    },
}

#[derive(Clone)]
pub struct EventService {
    channels: Arc<DashMap<Topic, broadcast::Sender<ExecutionEvent>>>,
}

impl Default for EventService {
    fn default() -> Self {
        Self::new()
    }
}

impl EventService {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<ExecutionEvent> {
        self.channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Best-effort publish. A topic nobody subscribed to is silently
    /// skipped; a full channel drops the oldest event for slow receivers,
    /// which resynchronize from the store.
    pub fn publish(&self, topic: Topic, event: ExecutionEvent) {
        if let Some(sender) = self.channels.get(&topic) {
            // Ignore send errors (no receivers).
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let events = EventService::new();
        let execution_id = Uuid::new_v4();
        let mut rx = events.subscribe(Topic::Execution(execution_id));

        events.publish(
            Topic::Execution(execution_id),
            ExecutionEvent::InputResolved { execution_id },
        );

        match rx.recv().await.unwrap() {
            ExecutionEvent::InputResolved { execution_id: id } => assert_eq!(id, execution_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let events = EventService::new();
        let execution_id = Uuid::new_v4();
        events.publish(
            Topic::Execution(execution_id),
            ExecutionEvent::CancelRequested { execution_id },
        );
        // Topics are isolated: a crew subscriber sees nothing from an
        // execution topic.
        let mut rx = events.subscribe(Topic::Crew(execution_id));
        events.publish(
            Topic::Execution(execution_id),
            ExecutionEvent::CancelRequested { execution_id },
        );
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
