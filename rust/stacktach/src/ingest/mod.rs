//! Per-message ingest: parse, store the raw record, then project it into
//! lifecycles and usage, all inside one transaction.

pub mod lifecycle;
pub mod usage;

use crate::error::StoreError;
use crate::models::RawId;
use crate::notification::{self, ExchangeKind, Notification};
use crate::store::{finish, Store, Transaction};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use usage::UsageAction;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Whether the delivery may be acknowledged, and what became of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { raw_id: RawId, usage: UsageAction },
    /// Unparseable deliveries are acknowledged so they cannot wedge the queue.
    Dropped { reason: String },
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    deployment: String,
    exchange: ExchangeKind,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, deployment: impl Into<String>, exchange: ExchangeKind) -> Self {
        Self {
            store,
            deployment: deployment.into(),
            exchange,
        }
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    pub fn exchange(&self) -> ExchangeKind {
        self.exchange
    }

    /// Handles one delivery. An `Err` means nothing was committed and the
    /// delivery must not be acknowledged.
    pub async fn process(&self, routing_key: &str, payload: &[u8]) -> Result<IngestOutcome, IngestError> {
        let parsed = match notification::parse(self.exchange, routing_key, payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    deployment = %self.deployment,
                    exchange = %self.exchange,
                    routing_key,
                    error = %err,
                    "dropping unparseable notification"
                );
                return Ok(IngestOutcome::Dropped {
                    reason: err.to_string(),
                });
            }
        };

        let mut tx = self.store.begin().await?;
        let outcome = self.project(tx.as_mut(), &parsed).await;
        let outcome = finish(tx, outcome).await?;
        debug!(
            deployment = %self.deployment,
            event = parsed.event_type(),
            instance = parsed.instance().unwrap_or("-"),
            "notification stored"
        );
        Ok(outcome)
    }

    async fn project(
        &self,
        tx: &mut dyn Transaction,
        parsed: &Notification,
    ) -> Result<IngestOutcome, IngestError> {
        let deployment_id = tx.deployment_id(&self.deployment).await?;
        let raw = tx.insert_raw(parsed.to_raw(deployment_id)).await?;

        let usage = match parsed {
            Notification::Nova(event) => {
                lifecycle::correlate(tx, &raw).await?;
                usage::aggregate(tx, event, &raw).await?
            }
            Notification::Glance(_) | Notification::Generic(_) => UsageAction::Ignored,
        };

        Ok(IngestOutcome::Stored {
            raw_id: raw.id,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn malformed_delivery_is_dropped_without_writes() {
        let store = MemoryStore::new();
        let ingestor = Ingestor::new(Arc::new(store.clone()), "east", ExchangeKind::Nova);
        let outcome = ingestor.process("monitor.info", b"not json").await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Dropped { .. }));
        assert!(store.snapshot().await.raws.is_empty());
    }

    #[tokio::test]
    async fn glance_delivery_is_stored_raw_only() {
        let store = MemoryStore::new();
        let ingestor = Ingestor::new(Arc::new(store.clone()), "east", ExchangeKind::Glance);
        let body = json!({
            "event_type": "image.exists",
            "publisher_id": "glance-api01",
            "payload": {"id": "img-1", "owner": "abc", "status": "active"}
        });
        let outcome = ingestor
            .process("monitor.info", body.to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Stored {
                raw_id: 1,
                usage: UsageAction::Ignored
            }
        );
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.raws[0].state.as_deref(), Some("active"));
        assert_eq!(snapshot.raws[0].tenant.as_deref(), Some("abc"));
        assert!(snapshot.lifecycles.is_empty());
    }
}
