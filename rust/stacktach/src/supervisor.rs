//! Process wiring: store selection, crash-recovery sweep, one ingest task per
//! `(deployment, exchange)` and the verifier loop.

use crate::amqp::{self, IngestBinding};
use crate::config::Config;
use crate::db;
use crate::error::{StoreError, StoreResult};
use crate::ingest::Ingestor;
use crate::models::ExistsStatus;
use crate::notification::ExchangeKind;
use crate::publisher::Publisher;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::store::{finish, MemoryStore, PgStore, Store};
use crate::time::Timestamp;
use crate::verifier::{NovaVerifier, ResultHandler, TaskOutcome, TaskResult, Verifier, VerifierSettings};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::ValueEnum;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Ingest and verify.
    All,
    /// Ingest only.
    Worker,
    /// Verify only.
    Verifier,
}

impl Role {
    fn ingests(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }

    fn verifies(self) -> bool {
        matches!(self, Role::All | Role::Verifier)
    }
}

pub async fn open_store(cfg: &Config, init_schema: bool) -> Result<Arc<dyn Store>> {
    if cfg.uses_memory_store() {
        info!("using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let pool = db::connect_pool(cfg).await?;
    if init_schema {
        db::ensure_schema(&pool).await?;
    }
    Ok(Arc::new(PgStore::new(pool)))
}

/// Returns exists abandoned mid-verification by a previous process to the
/// states they were claimed from.
pub async fn startup_sweep(store: &dyn Store) -> StoreResult<(u64, u64)> {
    let mut tx = store.begin().await?;
    let swept = async {
        let pending = tx
            .demote_exists(ExistsStatus::Verifying, ExistsStatus::Pending)
            .await?;
        let unsent = tx
            .demote_exists(ExistsStatus::SentVerifying, ExistsStatus::SentUnverified)
            .await?;
        Ok::<_, StoreError>((pending, unsent))
    }
    .await;
    finish(tx, swept).await
}

pub fn ingest_bindings(cfg: &Config) -> Vec<IngestBinding> {
    let mut bindings = Vec::new();
    for deployment in &cfg.deployments {
        let rabbit = cfg.rabbit_for(deployment);
        let mut topics: Vec<_> = cfg.ingest_topics(deployment).into_iter().collect();
        topics.sort();
        for (exchange, routing_keys) in topics {
            bindings.push(IngestBinding {
                deployment: deployment.name.clone(),
                exchange,
                routing_keys,
                rabbit: rabbit.clone(),
            });
        }
    }
    bindings
}

/// Post-verification work: publish what passed, reconcile what failed.
pub struct Callbacks {
    publisher: Option<Publisher>,
    reconciler: Option<Reconciler>,
}

impl Callbacks {
    pub fn new(publisher: Option<Publisher>, reconciler: Option<Reconciler>) -> Self {
        Self {
            publisher,
            reconciler,
        }
    }

    async fn publish(&self, exist_id: i64) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(err) = publisher.send_verified(exist_id).await {
            warn!(exist_id, error = %err, "could not publish verified exist");
        }
    }
}

#[async_trait]
impl ResultHandler for Callbacks {
    async fn handle(&self, result: &TaskResult) {
        let Some(exist) = &result.exist else {
            return;
        };
        match &result.outcome {
            TaskOutcome::Verified | TaskOutcome::Reconciled => self.publish(exist.id).await,
            TaskOutcome::Failed(_) => {
                let Some(reconciler) = &self.reconciler else {
                    return;
                };
                match reconciler.failed_validation(exist).await {
                    Ok(ReconcileOutcome::Reconciled) => self.publish(exist.id).await,
                    Ok(outcome) => debug!(exist_id = exist.id, ?outcome, "exist not reconciled"),
                    Err(err) => warn!(exist_id = exist.id, error = %err, "reconciliation failed"),
                }
            }
            _ => {}
        }
    }
}

pub struct Supervisor {
    cfg: Config,
    role: Role,
    store: Arc<dyn Store>,
}

impl Supervisor {
    pub async fn new(cfg: Config, role: Role, init_schema: bool) -> Result<Self> {
        let store = open_store(&cfg, init_schema).await?;
        Ok(Self { cfg, role, store })
    }

    pub fn with_store(cfg: Config, role: Role, store: Arc<dyn Store>) -> Self {
        Self { cfg, role, store }
    }

    pub async fn run(self) -> Result<()> {
        let (pending, unsent) = startup_sweep(self.store.as_ref())
            .await
            .context("startup sweep failed")?;
        if pending + unsent > 0 {
            info!(pending, sent_unverified = unsent, "recovered exists left mid-verification");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        if self.role.ingests() {
            for binding in ingest_bindings(&self.cfg) {
                let ingestor = Ingestor::new(
                    Arc::clone(&self.store),
                    binding.deployment.clone(),
                    ExchangeKind::from_exchange(&binding.exchange),
                );
                tasks.spawn(amqp::run_ingest(binding, ingestor, shutdown_rx.clone()));
            }
        }

        if self.role.verifies() {
            let verifier = Verifier::new(
                Arc::clone(&self.store),
                NovaVerifier::new(self.cfg.validation_level, self.cfg.flavor_field_name),
                VerifierSettings::from_config(&self.cfg),
            );
            let callbacks = Callbacks::new(
                Publisher::from_config(&self.cfg, Arc::clone(&self.store)),
                Reconciler::from_config(&self.cfg, Arc::clone(&self.store))?,
            );
            tasks.spawn(verifier_loop(
                verifier,
                callbacks,
                self.cfg.tick_interval(),
                shutdown_rx.clone(),
            ));
        }

        if tasks.is_empty() {
            warn!(role = ?self.role, "nothing to run; no deployments configured");
            return Ok(());
        }
        info!(role = ?self.role, tasks = tasks.len(), "stacktach running");

        shutdown_signal().await;
        info!("shutdown signal received; draining");
        let _ = shutdown_tx.send(true);
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "task ended abnormally");
            }
        }
        info!("stacktach stopped");
        Ok(())
    }
}

async fn verifier_loop(
    verifier: Verifier,
    callbacks: Callbacks,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(tick = ?tick, settle = ?verifier.settings().settle, "verifier started");
    loop {
        let now = Timestamp::from_datetime(Utc::now());
        if let Err(err) = verifier.run_tick(now, &callbacks).await {
            error!(error = %err, "verifier tick failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("verifier stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeploymentConfig, RabbitConfig};
    use crate::models::NewInstanceExists;

    fn stuck(status: ExistsStatus) -> NewInstanceExists {
        NewInstanceExists {
            instance: "i-1".into(),
            launched_at: None,
            deleted_at: None,
            audit_period_beginning: None,
            audit_period_ending: Some(Timestamp::from_seconds(100)),
            instance_type_id: None,
            instance_flavor_id: None,
            message_id: None,
            tenant: None,
            meta: Default::default(),
            status,
            raw_id: None,
            usage_id: None,
            delete_id: None,
        }
    }

    #[tokio::test]
    async fn sweep_demotes_in_flight_exists() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_exists(stuck(ExistsStatus::Verifying)).await.unwrap();
        tx.insert_exists(stuck(ExistsStatus::SentVerifying)).await.unwrap();
        tx.insert_exists(stuck(ExistsStatus::Verified)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(startup_sweep(&store).await.unwrap(), (1, 1));
        let statuses: Vec<_> = store
            .snapshot()
            .await
            .exists
            .iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                ExistsStatus::Pending,
                ExistsStatus::SentUnverified,
                ExistsStatus::Verified
            ]
        );
    }

    #[test]
    fn bindings_fall_back_to_shared_rabbit_and_default_topics() {
        let json = r#"{"database_url": "memory://", "deployments": [{"name": "east"}]}"#;
        let mut cfg: Config = serde_json::from_str(json).unwrap();
        cfg.deployments.push(DeploymentConfig {
            name: "west".into(),
            rabbit: Some(RabbitConfig {
                host: "rabbit-west".into(),
                ..RabbitConfig::default()
            }),
            topics: None,
        });

        let bindings = ingest_bindings(&cfg);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].deployment, "east");
        assert_eq!(bindings[0].exchange, "nova");
        assert_eq!(bindings[0].routing_keys, ["monitor.info", "monitor.error"]);
        assert_eq!(bindings[0].rabbit.host, "localhost");
        assert_eq!(bindings[1].rabbit.host, "rabbit-west");
    }

    #[test]
    fn roles_select_components() {
        assert!(Role::All.ingests() && Role::All.verifies());
        assert!(Role::Worker.ingests() && !Role::Worker.verifies());
        assert!(!Role::Verifier.ingests() && Role::Verifier.verifies());
    }
}
