use std::sync::Arc;

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use services::services::{
    cancellation::CancellationRegistry,
    engine::ExecutionEngine,
    events::EventService,
    executor::{SimulatedExecutor, TaskExecutor},
    gate::HumanInputGate,
    stage_bus::StageBus,
    worker::ExecutionWorker,
};

/// Single-machine deployment: gateway and worker share one SQLite file
/// and an in-process pub/sub fabric.
#[derive(Clone)]
pub struct LocalDeployment {
    db: DBService,
    events: EventService,
    bus: StageBus,
    gate: HumanInputGate,
    cancellations: CancellationRegistry,
    engine: ExecutionEngine,
}

impl LocalDeployment {
    /// Wire the full service stack over an already-open store.
    pub fn from_db(db: DBService) -> Self {
        Self::with_executor(db, Arc::new(SimulatedExecutor::default()))
    }

    /// Same wiring with a caller-supplied reasoning backend.
    pub fn with_executor(db: DBService, executor: Arc<dyn TaskExecutor>) -> Self {
        let events = EventService::new();
        let bus = StageBus::new(db.clone(), events.clone());
        let cancellations = CancellationRegistry::new(db.clone(), events.clone());
        let gate = HumanInputGate::new(
            db.clone(),
            events.clone(),
            bus.clone(),
            cancellations.clone(),
        );
        let engine = ExecutionEngine::new(
            db.clone(),
            bus.clone(),
            gate.clone(),
            cancellations.clone(),
            executor,
        );

        Self {
            db,
            events,
            bus,
            gate,
            cancellations,
            engine,
        }
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let db = DBService::new().await?;
        Ok(Self::from_db(db))
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn events(&self) -> &EventService {
        &self.events
    }

    fn stage_bus(&self) -> &StageBus {
        &self.bus
    }

    fn gate(&self) -> &HumanInputGate {
        &self.gate
    }

    fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    fn worker(&self) -> ExecutionWorker {
        ExecutionWorker::new(
            self.db.clone(),
            self.bus.clone(),
            self.engine.clone(),
            self.gate.clone(),
        )
    }
}
