//! Republishes verified exists downstream as `*.exists.verified` events.

use crate::amqp;
use crate::config::{Config, RabbitConfig};
use crate::error::{StoreError, TransportError};
use crate::notification::{parse_stored, ParseError};
use crate::store::{finish, Store};
use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel, Connection};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SENT_STATUS: i32 = 201;
const PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("exist {0} not found")]
    MissingExist(i64),
    #[error("exist {0} has no raw record")]
    MissingRaw(i64),
}

/// Where verified notifications are sent.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), TransportError>;

    /// Forgets the current connection so the next publish opens a new one.
    async fn reset(&self);
}

struct Session {
    connection: Connection,
    channel: Channel,
}

/// Publishes onto a durable topic exchange, connecting lazily.
pub struct AmqpSink {
    rabbit: RabbitConfig,
    exchange: String,
    session: Mutex<Option<Session>>,
}

impl AmqpSink {
    pub fn new(rabbit: RabbitConfig, exchange: impl Into<String>) -> Self {
        Self {
            rabbit,
            exchange: exchange.into(),
            session: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<Session, TransportError> {
        let connection = amqp::connect(&self.rabbit).await?;
        let channel = connection.create_channel().await?;
        amqp::declare_exchange(&channel, &self.exchange).await?;
        info!(exchange = %self.exchange, broker = %self.rabbit.display_addr(), "publisher connected");
        Ok(Session {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl NotificationSink for AmqpSink {
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.open().await?);
        }
        let Some(active) = session.as_ref() else {
            return Err(TransportError::Closed("publisher session unavailable".into()));
        };

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());
        active
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn reset(&self) {
        if let Some(old) = self.session.lock().await.take() {
            if let Err(err) = old.connection.close(200, "reconnecting").await {
                debug!(error = %err, "closing stale publisher connection");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Replacement `event_type` for republished bodies.
    pub event_type: String,
    /// Empty means each exist's original routing key.
    pub routing_keys: Vec<String>,
}

impl PublisherSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let event_type = if cfg.verifier_exchange == "glance" {
            cfg.glance_event_type.clone()
        } else {
            cfg.nova_event_type.clone()
        };
        Self {
            event_type,
            routing_keys: cfg.publish_routing_keys().to_vec(),
        }
    }
}

pub struct Publisher {
    store: Arc<dyn Store>,
    sink: Arc<dyn NotificationSink>,
    settings: PublisherSettings,
}

impl Publisher {
    pub fn new(store: Arc<dyn Store>, sink: Arc<dyn NotificationSink>, settings: PublisherSettings) -> Self {
        Self {
            store,
            sink,
            settings,
        }
    }

    /// The AMQP publisher described by `cfg`, or `None` when notifications
    /// are disabled.
    pub fn from_config(cfg: &Config, store: Arc<dyn Store>) -> Option<Self> {
        if !cfg.enable_notifications {
            return None;
        }
        let sink = AmqpSink::new(cfg.rabbit.clone(), cfg.verifier_exchange.clone());
        Some(Self::new(store, Arc::new(sink), PublisherSettings::from_config(cfg)))
    }

    /// Sends the verified form of exist `exist_id` under every routing key
    /// and records the send. Returns how many messages went out.
    pub async fn send_verified(&self, exist_id: i64) -> Result<usize, PublishError> {
        let mut tx = self.store.begin().await?;
        let raw = async {
            let exist = tx
                .get_exists(exist_id)
                .await?
                .ok_or(PublishError::MissingExist(exist_id))?;
            let raw_id = exist.raw_id.ok_or(PublishError::MissingRaw(exist_id))?;
            tx.get_raw(raw_id)
                .await?
                .ok_or(PublishError::MissingRaw(exist_id))
        }
        .await;
        let raw = finish(tx, raw).await?;

        let (original_key, mut body) = parse_stored(&raw.json)?;
        rewrite_body(&mut body, &self.settings.event_type);
        let payload = serde_json::to_vec(&body)
            .map_err(|err| ParseError::MalformedEnvelope(err.to_string()))?;

        let keys = if self.settings.routing_keys.is_empty() {
            vec![original_key]
        } else {
            self.settings.routing_keys.clone()
        };
        for key in &keys {
            self.publish_with_retry(key, &payload).await?;
        }

        let mut tx = self.store.begin().await?;
        let marked = tx.set_send_status(exist_id, SENT_STATUS).await;
        finish(tx, marked).await?;
        debug!(exist_id, routing_keys = ?keys, "verified exist published");
        Ok(keys.len())
    }

    async fn publish_with_retry(&self, routing_key: &str, payload: &[u8]) -> Result<(), TransportError> {
        match self.sink.publish(routing_key, payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(routing_key, error = %err, "publish failed; reconnecting once");
                self.sink.reset().await;
                self.sink.publish(routing_key, payload).await
            }
        }
    }
}

/// Marks a stored notification body as verified under a fresh message id.
pub fn rewrite_body(body: &mut Value, event_type: &str) {
    let Some(object) = body.as_object_mut() else {
        return;
    };
    let original = object.get("message_id").cloned().unwrap_or(Value::Null);
    object.insert("event_type".into(), Value::String(event_type.to_string()));
    object.insert("original_message_id".into(), original);
    object.insert(
        "message_id".into(),
        Value::String(Uuid::new_v4().to_string()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrite_keeps_original_message_id() {
        let mut body = json!({
            "event_type": "compute.instance.exists",
            "message_id": "m-1",
            "payload": {"instance_id": "i-1"}
        });
        rewrite_body(&mut body, "compute.instance.exists.verified");

        assert_eq!(body["event_type"], "compute.instance.exists.verified");
        assert_eq!(body["original_message_id"], "m-1");
        let fresh = body["message_id"].as_str().unwrap();
        assert_ne!(fresh, "m-1");
        assert!(Uuid::parse_str(fresh).is_ok());
        assert_eq!(body["payload"]["instance_id"], "i-1");
    }
}
