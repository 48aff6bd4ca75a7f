use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::{
    DBService,
    models::crew::{Crew, CrewError},
};
use services::services::{
    cancellation::CancellationRegistry, engine::ExecutionEngine, events::EventService,
    gate::HumanInputGate, stage_bus::StageBus, worker::ExecutionWorker,
};
use sqlx::Error as SqlxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Crew(#[from] CrewError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

/// Capability surface shared by the gateway and worker roles. Both sides
/// are wired from the same store and pub/sub fabric; which loops a
/// process actually runs is the binary's choice.
#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn db(&self) -> &DBService;

    fn events(&self) -> &EventService;

    fn stage_bus(&self) -> &StageBus;

    fn gate(&self) -> &HumanInputGate;

    fn cancellations(&self) -> &CancellationRegistry;

    fn engine(&self) -> &ExecutionEngine;

    /// A worker wired to this deployment's store and services.
    fn worker(&self) -> ExecutionWorker;

    async fn seed_default_crew(&self) -> Result<(), DeploymentError> {
        if let Some(crew) = Crew::seed_default(&self.db().pool).await? {
            tracing::info!(crew_id = %crew.id, name = %crew.name, "seeded starter crew");
        }
        Ok(())
    }
}
