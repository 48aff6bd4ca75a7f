//! Worker-role entry point: claims pending executions and runs their
//! engines. Serves no HTTP; it shares the store (and nothing else) with
//! the gateway process.

use deployment::Deployment;
use server::DeploymentImpl;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::assets::asset_dir;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},deployment={level},local_deployment={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    if !asset_dir().exists() {
        std::fs::create_dir_all(asset_dir())?;
    }

    let deployment = DeploymentImpl::new().await?;
    tracing::info!("crewdeck worker started");

    let handle = deployment.worker().spawn();
    handle.await?;

    Ok(())
}
