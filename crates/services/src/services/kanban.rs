//! Kanban projection of an execution's stage stream.
//!
//! Every stage carries the task index the engine stamped on it at
//! emission time, so placement is a pure grouping — the renderer never
//! guesses which lane a system-level update belongs to.

use db::models::{
    crew::Crew,
    execution::{Execution, ExecutionStatus},
    stage::Stage,
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum LaneState {
    Queued,
    Active,
    AwaitingInput,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct KanbanLane {
    pub task_index: i64,
    pub task_name: String,
    pub agent: String,
    pub state: LaneState,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct KanbanBoard {
    pub execution_id: Uuid,
    pub crew_id: Uuid,
    pub status: ExecutionStatus,
    pub current_task_index: i64,
    pub lanes: Vec<KanbanLane>,
}

/// Group an execution's stages into one lane per crew task.
pub fn project(crew: &Crew, execution: &Execution, stages: Vec<Stage>) -> KanbanBoard {
    let tasks = crew.task_list();
    let mut lanes: Vec<KanbanLane> = tasks
        .iter()
        .enumerate()
        .map(|(index, task)| KanbanLane {
            task_index: index as i64,
            task_name: task.name.clone(),
            agent: task.agent.clone(),
            state: lane_state(execution, index as i64),
            stages: Vec::new(),
        })
        .collect();

    for stage in stages {
        match lanes.get_mut(stage.task_index as usize) {
            Some(lane) => lane.stages.push(stage),
            None => tracing::warn!(
                execution_id = %stage.execution_id,
                task_index = stage.task_index,
                "stage task index outside crew definition"
            ),
        }
    }

    KanbanBoard {
        execution_id: execution.id,
        crew_id: execution.crew_id,
        status: execution.status,
        current_task_index: execution.current_task_index,
        lanes,
    }
}

fn lane_state(execution: &Execution, task_index: i64) -> LaneState {
    if execution.status == ExecutionStatus::Completed {
        return LaneState::Done;
    }
    let current = execution.current_task_index;
    if task_index < current {
        return LaneState::Done;
    }
    if task_index > current {
        return match execution.status {
            ExecutionStatus::Cancelled => LaneState::Cancelled,
            _ => LaneState::Queued,
        };
    }
    match execution.status {
        ExecutionStatus::Pending => LaneState::Queued,
        ExecutionStatus::Running => LaneState::Active,
        ExecutionStatus::WaitingForHumanInput => LaneState::AwaitingInput,
        ExecutionStatus::Completed => LaneState::Done,
        ExecutionStatus::Failed => LaneState::Failed,
        ExecutionStatus::Cancelled => LaneState::Cancelled,
    }
}
