pub mod amqp;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod notification;
pub mod publisher;
pub mod reconciler;
pub mod schema;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod time;
pub mod verifier;

use crate::{
    config::Config,
    supervisor::{Role, Supervisor},
};
use std::path::Path;
use tracing::info;

/// Loads the configuration at `config_path` and runs the selected components
/// until a shutdown signal arrives.
pub async fn run(config_path: &Path, role: Role, init_schema: bool) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)?;
    info!(config = %config_path.display(), ?role, "starting stacktach");
    Supervisor::new(config, role, init_schema).await?.run().await
}
