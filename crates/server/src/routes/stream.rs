//! Realtime fan-out over WebSocket.
//!
//! Protocol: a snapshot frame, a store replay from the viewer's
//! `from_sequence` watermark, then a live tail. The store is the ordering
//! authority throughout — pub/sub events only hint that there is
//! something new to read, and every frame is deduplicated by sequence
//! number, so a reconnecting viewer converges with one that never
//! dropped. Duplicate delivery of the last few stages is possible and
//! benign.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use db::models::{
    crew::Crew,
    execution::{Execution, ExecutionStatus},
    stage::{Stage, StageType},
};
use deployment::Deployment;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use services::services::events::Topic;
use sqlx::SqlitePool;
use ts_rs::TS;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Grace multiple of the heartbeat interval before a silent viewer is
/// dropped.
pub const HEARTBEAT_GRACE: u32 = 3;
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Last sequence number the viewer already has; replay starts after it.
    pub from_sequence: Option<i64>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "snake_case")]
pub struct StagePayload {
    pub stage_type: StageType,
    pub title: String,
    pub content: String,
    pub agent: Option<String>,
}

impl From<&Stage> for StagePayload {
    fn from(stage: &Stage) -> Self {
        Self {
            stage_type: stage.stage_type,
            title: stage.title.clone(),
            content: stage.content.clone(),
            agent: stage.agent.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot {
        execution_id: Uuid,
        crew_id: Uuid,
        status: ExecutionStatus,
        task_index: i64,
        latest_sequence: i64,
    },
    ExecutionUpdate {
        execution_id: Uuid,
        task_index: i64,
        status: ExecutionStatus,
        sequence: i64,
        stage: StagePayload,
        human_input_request: Option<String>,
    },
    Ping,
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/executions/{execution_id}/stream", get(stream_execution))
        .route("/crews/{crew_id}/stream", get(stream_crew))
        .with_state(deployment.clone())
}

async fn stream_execution(
    ws: WebSocketUpgrade,
    Path(execution_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    State(deployment): State<DeploymentImpl>,
) -> Result<Response, ApiError> {
    let execution = Execution::find_by_id(&deployment.db().pool, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Execution not found".into()))?;
    let from_sequence = query.from_sequence.unwrap_or(0);

    Ok(ws.on_upgrade(move |socket| {
        run_execution_stream(deployment, execution, from_sequence, socket)
    }))
}

async fn stream_crew(
    ws: WebSocketUpgrade,
    Path(crew_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    State(deployment): State<DeploymentImpl>,
) -> Result<Response, ApiError> {
    let crew = Crew::find_by_id(&deployment.db().pool, crew_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Crew not found".into()))?;
    let from_sequence = query.from_sequence.unwrap_or(0);

    Ok(ws.on_upgrade(move |socket| run_crew_stream(deployment, crew, from_sequence, socket)))
}

fn update_message(execution: &Execution, stage: &Stage) -> ServerMessage {
    ServerMessage::ExecutionUpdate {
        execution_id: stage.execution_id,
        task_index: stage.task_index,
        status: execution.status,
        sequence: stage.sequence,
        human_input_request: (stage.stage_type == StageType::HumanInputRequest)
            .then(|| stage.content.clone()),
        stage: StagePayload::from(stage),
    }
}

fn snapshot_message(execution: &Execution, latest_sequence: i64) -> ServerMessage {
    ServerMessage::Snapshot {
        execution_id: execution.id,
        crew_id: execution.crew_id,
        status: execution.status,
        task_index: execution.current_task_index,
        latest_sequence,
    }
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message)
        .unwrap_or_else(|_| r#"{"type":"ping"}"#.to_string());
    sender.send(Message::Text(payload.into())).await
}

/// Push every stage after `last_sequence`, advancing the watermark. A
/// transient store error keeps the connection; only a failed send (the
/// viewer went away) tears it down.
async fn drain_execution(
    pool: &SqlitePool,
    sender: &mut SplitSink<WebSocket, Message>,
    execution_id: Uuid,
    last_sequence: &mut i64,
) -> Result<(), axum::Error> {
    let stages = match Stage::find_after(pool, execution_id, *last_sequence).await {
        Ok(stages) => stages,
        Err(e) => {
            tracing::error!("failed to read stages for fan-out: {}", e);
            return Ok(());
        }
    };
    if stages.is_empty() {
        return Ok(());
    }
    let execution = match Execution::find_by_id(pool, execution_id).await {
        Ok(Some(execution)) => execution,
        _ => return Ok(()),
    };

    for stage in stages {
        *last_sequence = stage.sequence;
        send_message(sender, &update_message(&execution, &stage)).await?;
    }
    Ok(())
}

async fn run_execution_stream(
    deployment: DeploymentImpl,
    execution: Execution,
    from_sequence: i64,
    socket: WebSocket,
) {
    let (mut sender, mut receiver) = socket.split();
    let pool = deployment.db().pool.clone();
    let mut last_sequence = from_sequence;

    let latest = Stage::latest_sequence(&pool, execution.id)
        .await
        .unwrap_or(0);
    if send_message(&mut sender, &snapshot_message(&execution, latest))
        .await
        .is_err()
    {
        return;
    }
    if drain_execution(&pool, &mut sender, execution.id, &mut last_sequence)
        .await
        .is_err()
    {
        return;
    }

    let mut rx = deployment.events().subscribe(Topic::Execution(execution.id));
    let mut poll = tokio::time::interval(TAIL_POLL_INTERVAL);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut last_activity = tokio::time::Instant::now();

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => last_activity = tokio::time::Instant::now(),
            },
            _ = rx.recv() => {
                if drain_execution(&pool, &mut sender, execution.id, &mut last_sequence).await.is_err() {
                    break;
                }
            }
            _ = poll.tick() => {
                if drain_execution(&pool, &mut sender, execution.id, &mut last_sequence).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > HEARTBEAT_INTERVAL * HEARTBEAT_GRACE {
                    tracing::debug!(execution_id = %execution.id, "dropping silent viewer");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                if send_message(&mut sender, &ServerMessage::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Board-level stream: one connection covering every execution of a
/// crew. Ordering is only guaranteed within an execution; the client
/// groups by execution id before interpreting order.
async fn run_crew_stream(
    deployment: DeploymentImpl,
    crew: Crew,
    from_sequence: i64,
    socket: WebSocket,
) {
    let (mut sender, mut receiver) = socket.split();
    let pool = deployment.db().pool.clone();
    let mut watermarks: HashMap<Uuid, i64> = HashMap::new();

    if drain_crew(&pool, &mut sender, crew.id, from_sequence, &mut watermarks)
        .await
        .is_err()
    {
        return;
    }

    let mut rx = deployment.events().subscribe(Topic::Crew(crew.id));
    let mut poll = tokio::time::interval(TAIL_POLL_INTERVAL);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut last_activity = tokio::time::Instant::now();

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => last_activity = tokio::time::Instant::now(),
            },
            _ = rx.recv() => {
                if drain_crew(&pool, &mut sender, crew.id, from_sequence, &mut watermarks).await.is_err() {
                    break;
                }
            }
            _ = poll.tick() => {
                if drain_crew(&pool, &mut sender, crew.id, from_sequence, &mut watermarks).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > HEARTBEAT_INTERVAL * HEARTBEAT_GRACE {
                    tracing::debug!(crew_id = %crew.id, "dropping silent viewer");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                if send_message(&mut sender, &ServerMessage::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Walk every execution of the crew, announcing new ones with a snapshot
/// and pushing their unseen stages. Executions started after the viewer
/// connected are picked up on the next pass.
async fn drain_crew(
    pool: &SqlitePool,
    sender: &mut SplitSink<WebSocket, Message>,
    crew_id: Uuid,
    from_sequence: i64,
    watermarks: &mut HashMap<Uuid, i64>,
) -> Result<(), axum::Error> {
    let executions = match Execution::find_by_crew(pool, crew_id).await {
        Ok(executions) => executions,
        Err(e) => {
            tracing::error!("failed to list crew executions for fan-out: {}", e);
            return Ok(());
        }
    };

    for execution in executions {
        if !watermarks.contains_key(&execution.id) {
            let latest = Stage::latest_sequence(pool, execution.id)
                .await
                .unwrap_or(0);
            send_message(sender, &snapshot_message(&execution, latest)).await?;
            watermarks.insert(execution.id, from_sequence);
        }
        let Some(last_sequence) = watermarks.get_mut(&execution.id) else {
            continue;
        };
        drain_execution(pool, sender, execution.id, last_sequence).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn execution_fixture(status: ExecutionStatus) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            crew_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            status,
            current_task_index: 1,
            cancel_requested: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn stage_fixture(execution: &Execution, stage_type: StageType) -> Stage {
        Stage {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            sequence: 4,
            task_index: 1,
            stage_type,
            title: "Waiting for human input".to_string(),
            content: "Which keyword set?".to_string(),
            agent: Some("Analyst".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn input_request_stages_carry_the_prompt_field() {
        let execution = execution_fixture(ExecutionStatus::WaitingForHumanInput);
        let stage = stage_fixture(&execution, StageType::HumanInputRequest);

        match update_message(&execution, &stage) {
            ServerMessage::ExecutionUpdate {
                sequence,
                status,
                human_input_request,
                ..
            } => {
                assert_eq!(sequence, 4);
                assert_eq!(status, ExecutionStatus::WaitingForHumanInput);
                assert_eq!(human_input_request.as_deref(), Some("Which keyword set?"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ordinary_stages_leave_the_prompt_field_empty() {
        let execution = execution_fixture(ExecutionStatus::Running);
        let stage = stage_fixture(&execution, StageType::ToolResult);

        match update_message(&execution, &stage) {
            ServerMessage::ExecutionUpdate {
                human_input_request,
                ..
            } => assert!(human_input_request.is_none()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn wire_shape_matches_the_documented_protocol() {
        let execution = execution_fixture(ExecutionStatus::Running);
        let stage = stage_fixture(&execution, StageType::ToolResult);

        let json = serde_json::to_value(update_message(&execution, &stage)).unwrap();
        assert_eq!(json["type"], "execution_update");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["stage"]["stage_type"], "tool_result");
        assert_eq!(json["stage"]["agent"], "Analyst");
        assert!(json["human_input_request"].is_null());
    }
}
