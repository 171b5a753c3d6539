//! Periodic verification of settled exists.
//!
//! Each tick claims every exist whose audit period ended before the settle
//! cutoff, then verifies them on a bounded pool of tasks. The tick returns
//! only once every task it started has finished.

pub mod errors;
pub mod nova;
pub mod validity;

pub use errors::VerificationError;
pub use nova::{NovaVerifier, Verdict};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::models::{ExistsStatus, InstanceExists};
use crate::store::{finish, Store, Transaction};
use crate::time::Timestamp;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const DATABASE_ERROR: &str = "DatabaseError";

#[derive(Debug, Clone)]
pub struct VerifierSettings {
    pub settle: Duration,
    pub pool_size: usize,
    pub process_timeout: Option<Duration>,
}

impl VerifierSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            settle: cfg.settle_duration(),
            pool_size: cfg.pool_size.max(1),
            process_timeout: cfg.process_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Verified,
    Reconciled,
    Failed(String),
    /// A store error; the exist was marked failed with `DatabaseError`.
    Errored(String),
    /// The task overran `process_timeout` and the exist was left verifying.
    TimedOut,
    /// The exist vanished or had already left its claimed status.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub exist_id: i64,
    /// Claimed from `sent_unverified`; these get no post-verification callback.
    pub resend: bool,
    pub outcome: TaskOutcome,
    /// The exist as it was verified, when it could be loaded.
    pub exist: Option<InstanceExists>,
}

impl TaskResult {
    pub fn needs_callback(&self) -> bool {
        !self.resend && self.exist.is_some()
    }
}

/// Receives each finished task once its tick has drained.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    async fn handle(&self, result: &TaskResult);
}

#[derive(Clone)]
pub struct Verifier {
    store: Arc<dyn Store>,
    nova: NovaVerifier,
    settings: VerifierSettings,
}

impl Verifier {
    pub fn new(store: Arc<dyn Store>, nova: NovaVerifier, settings: VerifierSettings) -> Self {
        Self {
            store,
            nova,
            settings,
        }
    }

    pub fn settings(&self) -> &VerifierSettings {
        &self.settings
    }

    /// Claims and verifies everything settled as of `now`, then hands each
    /// result to `handler` in exist order.
    pub async fn run_tick(
        &self,
        now: Timestamp,
        handler: &dyn ResultHandler,
    ) -> StoreResult<Vec<TaskResult>> {
        let results = self.tick(now).await?;
        for result in &results {
            if result.needs_callback() {
                handler.handle(result).await;
            }
        }
        Ok(results)
    }

    pub async fn tick(&self, now: Timestamp) -> StoreResult<Vec<TaskResult>> {
        let cutoff = now.saturating_sub(self.settings.settle);
        let (resend, fresh) = self.claim(cutoff).await?;
        if resend.is_empty() && fresh.is_empty() {
            debug!(cutoff = %cutoff, "nothing settled to verify");
            return Ok(Vec::new());
        }
        info!(
            cutoff = %cutoff,
            pending = fresh.len(),
            sent_unverified = resend.len(),
            "verifying settled exists"
        );

        let permits = Arc::new(Semaphore::new(self.settings.pool_size));
        let mut tasks = JoinSet::new();
        let claimed = resend
            .into_iter()
            .map(|id| (id, true))
            .chain(fresh.into_iter().map(|id| (id, false)));
        for (exist_id, resend) in claimed {
            let worker = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                worker.run_task(exist_id, resend).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(error = %err, "verification task panicked"),
            }
        }
        results.sort_by_key(|r| r.exist_id);

        let failed = results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Failed(_) | TaskOutcome::Errored(_)))
            .count();
        info!(finished = results.len(), failed, "tick finished");
        Ok(results)
    }

    async fn claim(&self, cutoff: Timestamp) -> StoreResult<(Vec<i64>, Vec<i64>)> {
        let mut tx = self.store.begin().await?;
        let claimed = async {
            let resend = tx
                .claim_exists(cutoff, ExistsStatus::SentUnverified, ExistsStatus::SentVerifying)
                .await?;
            let fresh = tx
                .claim_exists(cutoff, ExistsStatus::Pending, ExistsStatus::Verifying)
                .await?;
            Ok::<_, StoreError>((resend, fresh))
        }
        .await;
        finish(tx, claimed).await
    }

    async fn run_task(&self, exist_id: i64, resend: bool) -> TaskResult {
        let work = self.verify_exist(exist_id, resend);
        let (outcome, exist) = match self.settings.process_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(done) => done,
                Err(_) => {
                    warn!(exist_id, timeout = ?limit, "verification timed out");
                    (TaskOutcome::TimedOut, None)
                }
            },
            None => work.await,
        };
        TaskResult {
            exist_id,
            resend,
            outcome,
            exist,
        }
    }

    async fn verify_exist(
        &self,
        exist_id: i64,
        resend: bool,
    ) -> (TaskOutcome, Option<InstanceExists>) {
        let claimed = if resend {
            ExistsStatus::SentVerifying
        } else {
            ExistsStatus::Verifying
        };

        match self.verify_in_tx(exist_id, claimed).await {
            Ok(Some((outcome, exist))) => (outcome, Some(exist)),
            Ok(None) => (TaskOutcome::Skipped, None),
            Err(err) => {
                error!(exist_id, error = %err, "verification hit a store error");
                if let Err(mark) = self.mark_database_error(exist_id).await {
                    error!(exist_id, error = %mark, "could not mark exist failed");
                }
                (TaskOutcome::Errored(err.to_string()), None)
            }
        }
    }

    async fn verify_in_tx(
        &self,
        exist_id: i64,
        claimed: ExistsStatus,
    ) -> StoreResult<Option<(TaskOutcome, InstanceExists)>> {
        let mut tx = self.store.begin().await?;
        let outcome = self.apply(tx.as_mut(), exist_id, claimed).await;
        finish(tx, outcome).await
    }

    async fn apply(
        &self,
        tx: &mut dyn Transaction,
        exist_id: i64,
        claimed: ExistsStatus,
    ) -> StoreResult<Option<(TaskOutcome, InstanceExists)>> {
        let Some(mut exist) = tx.get_exists(exist_id).await? else {
            warn!(exist_id, "claimed exist disappeared");
            return Ok(None);
        };
        if exist.status != claimed {
            debug!(exist_id, status = %exist.status, "exist no longer claimed");
            return Ok(None);
        }

        let verdict = self.nova.verify(tx, &exist).await?;
        let (status, outcome) = match verdict {
            Verdict::Verified => (ExistsStatus::Verified, TaskOutcome::Verified),
            Verdict::Reconciled => (ExistsStatus::Reconciled, TaskOutcome::Reconciled),
            Verdict::Failed(err) => {
                let reason = err.to_string();
                debug!(exist_id, instance = %exist.instance, %reason, "exist failed verification");
                (ExistsStatus::Failed, TaskOutcome::Failed(reason))
            }
        };
        let reason = match &outcome {
            TaskOutcome::Failed(reason) => Some(reason.as_str()),
            _ => None,
        };
        tx.set_exists_status(exist_id, status, reason).await?;

        exist.status = status;
        exist.fail_reason = reason.map(str::to_string);
        Ok(Some((outcome, exist)))
    }

    async fn mark_database_error(&self, exist_id: i64) -> StoreResult<()> {
        let mut tx = self.store.begin().await?;
        let marked = tx
            .set_exists_status(exist_id, ExistsStatus::Failed, Some(DATABASE_ERROR))
            .await;
        finish(tx, marked).await.map(|_| ())
    }
}
