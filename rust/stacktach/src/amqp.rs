//! AMQP plumbing: connections, topology and the ingest consumer loop.

use crate::config::RabbitConfig;
use crate::error::TransportError;
use crate::ingest::{IngestError, IngestOutcome, Ingestor};
use futures::stream::{self, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind as AmqpExchangeKind};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub async fn connect(rabbit: &RabbitConfig) -> Result<Connection, TransportError> {
    let connection =
        Connection::connect_uri(rabbit.amqp_uri(), ConnectionProperties::default()).await?;
    debug!(broker = %rabbit.display_addr(), "amqp connection opened");
    Ok(connection)
}

/// Declares a durable topic exchange.
pub async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), TransportError> {
    channel
        .exchange_declare(
            exchange,
            AmqpExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("ingest failed: {0}")]
    Ingest(#[from] IngestError),
}

impl From<lapin::Error> for SessionError {
    fn from(err: lapin::Error) -> Self {
        SessionError::Transport(TransportError::Amqp(err))
    }
}

/// One `(deployment, exchange)` ingest binding.
#[derive(Debug, Clone)]
pub struct IngestBinding {
    pub deployment: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    pub rabbit: RabbitConfig,
}

impl IngestBinding {
    /// Queue names equal their routing keys.
    pub fn queues(&self) -> &[String] {
        &self.routing_keys
    }

    pub fn consumer_tag(&self, queue: &str) -> String {
        format!("stacktach-{}-{}-{}", self.deployment, self.exchange, queue)
    }
}

/// Consumes `binding` until `shutdown` flips, reconnecting after every
/// session failure.
pub async fn run_ingest(binding: IngestBinding, ingestor: Ingestor, mut shutdown: watch::Receiver<bool>) {
    info!(
        deployment = %binding.deployment,
        exchange = %binding.exchange,
        broker = %binding.rabbit.display_addr(),
        queues = ?binding.queues(),
        "starting ingest"
    );
    loop {
        if *shutdown.borrow() {
            break;
        }
        match consume_session(&binding, &ingestor, &mut shutdown).await {
            Ok(()) => break,
            Err(err) => {
                warn!(
                    deployment = %binding.deployment,
                    exchange = %binding.exchange,
                    error = %err,
                    delay = ?RECONNECT_DELAY,
                    "ingest session ended; reconnecting"
                );
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!(deployment = %binding.deployment, exchange = %binding.exchange, "ingest stopped");
}

/// Runs one connection's worth of consumption. Returns `Ok` only on shutdown.
async fn consume_session(
    binding: &IngestBinding,
    ingestor: &Ingestor,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let connection = connect(&binding.rabbit).await?;
    let channel = connection.create_channel().await?;
    declare_exchange(&channel, &binding.exchange).await?;

    let mut consumers = Vec::with_capacity(binding.queues().len());
    for queue in binding.queues() {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: binding.rabbit.durable_queue,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                queue,
                &binding.exchange,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let consumer = channel
            .basic_consume(
                queue,
                &binding.consumer_tag(queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        consumers.push(consumer);
    }
    let mut deliveries = stream::select_all(consumers);

    loop {
        let next = tokio::select! {
            next = deliveries.next() => next,
            _ = shutdown.changed() => {
                if let Err(err) = connection.close(200, "shutdown").await {
                    debug!(error = %err, "closing amqp connection");
                }
                return Ok(());
            }
        };
        let delivery = match next {
            Some(delivery) => delivery?,
            None => {
                return Err(TransportError::Closed("consumer stream ended".into()).into());
            }
        };

        let routing_key = delivery.routing_key.as_str();
        match ingestor.process(routing_key, &delivery.data).await {
            Ok(IngestOutcome::Stored { raw_id, .. }) => {
                debug!(deployment = %binding.deployment, routing_key, raw_id, "delivery stored");
            }
            Ok(IngestOutcome::Dropped { .. }) => {}
            Err(err) => {
                error!(
                    deployment = %binding.deployment,
                    routing_key,
                    error = %err,
                    "ingest failed; leaving delivery unacknowledged"
                );
                return Err(err.into());
            }
        }
        delivery.ack(BasicAckOptions::default()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_named_after_routing_keys() {
        let binding = IngestBinding {
            deployment: "east".into(),
            exchange: "nova".into(),
            routing_keys: vec!["monitor.info".into(), "monitor.error".into()],
            rabbit: RabbitConfig::default(),
        };
        assert_eq!(binding.queues(), ["monitor.info", "monitor.error"]);
        assert_eq!(binding.consumer_tag("monitor.info"), "stacktach-east-nova-monitor.info");
    }
}
