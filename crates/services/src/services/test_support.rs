use std::str::FromStr;

use db::{
    DBService,
    models::{
        crew::{CreateCrew, Crew, CrewTask},
        execution::{CreateExecution, Execution},
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use uuid::Uuid;

use super::{
    cancellation::CancellationRegistry, events::EventService, gate::HumanInputGate,
    stage_bus::StageBus,
};

/// Fully wired service stack over an in-memory store.
pub(crate) struct TestHarness {
    pub db: DBService,
    pub events: EventService,
    pub bus: StageBus,
    pub gate: HumanInputGate,
    pub cancellations: CancellationRegistry,
}

impl TestHarness {
    pub async fn new() -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("invalid sqlite config")
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("failed to open sqlite memory db");
        sqlx::migrate!("../db/migrations")
            .run(&pool)
            .await
            .expect("failed to run migrations");

        let db = DBService { pool };
        let events = EventService::new();
        let bus = StageBus::new(db.clone(), events.clone());
        let cancellations = CancellationRegistry::new(db.clone(), events.clone());
        let gate = HumanInputGate::new(
            db.clone(),
            events.clone(),
            bus.clone(),
            cancellations.clone(),
        );

        Self {
            db,
            events,
            bus,
            gate,
            cancellations,
        }
    }

    pub fn simple_task(name: &str) -> CrewTask {
        CrewTask {
            name: name.to_string(),
            description: format!("{name} description"),
            agent: "Tester".to_string(),
            human_input: None,
        }
    }

    pub async fn create_crew(&self, tasks: Vec<CrewTask>) -> Crew {
        Crew::create(
            &self.db.pool,
            &CreateCrew {
                name: "Test Crew".to_string(),
                description: None,
                tasks,
            },
            Uuid::new_v4(),
        )
        .await
        .expect("failed to create crew")
    }

    pub async fn create_execution(&self, crew_id: Uuid) -> Execution {
        Execution::create(
            &self.db.pool,
            &CreateExecution {
                crew_id,
                client_id: Uuid::new_v4(),
            },
            Uuid::new_v4(),
        )
        .await
        .expect("failed to create execution")
    }

    pub async fn create_crew_and_execution(&self, task_count: usize) -> (Crew, Execution) {
        let tasks = (0..task_count)
            .map(|i| Self::simple_task(&format!("Task {i}")))
            .collect();
        let crew = self.create_crew(tasks).await;
        let execution = self.create_execution(crew.id).await;
        (crew, execution)
    }
}
