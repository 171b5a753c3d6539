//! Wire envelope parsing.
//!
//! A delivery is either the bare notification object (routing key taken from
//! the delivery) or the stored pair `[routing_key, object]`. Parsing is a pure
//! function from bytes to a [`Notification`] variant chosen by the exchange
//! the message arrived on.

mod glance;
mod image_type;
mod nova;

pub use glance::GlanceEvent;
pub use image_type::{
    fold_image_type, image_type_from_payload, BASE_IMAGE, FREEBSD_IMAGE, LINUX_IMAGE, OS_CENTOS,
    OS_DEBIAN, OS_RHEL, OS_UBUNTU, SNAPSHOT_IMAGE, WINDOWS_IMAGE,
};
pub use nova::NovaEvent;

use crate::models::NewRawRecord;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Nova,
    Glance,
    Generic,
}

impl ExchangeKind {
    pub fn from_exchange(name: &str) -> Self {
        match name {
            "nova" => ExchangeKind::Nova,
            "glance" => ExchangeKind::Glance,
            _ => ExchangeKind::Generic,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Nova => "nova",
            ExchangeKind::Glance => "glance",
            ExchangeKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Identity fields shared by every notification flavour.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub routing_key: String,
    pub body: Value,
    pub event_type: String,
    pub publisher: Option<String>,
    pub service: Option<String>,
    pub host: Option<String>,
    pub when: Option<Timestamp>,
    pub request_id: Option<String>,
    pub message_id: Option<String>,
}

impl Envelope {
    fn new(routing_key: String, body: Value) -> Self {
        let event_type = text(&body, "event_type").unwrap_or_default();
        let publisher = text(&body, "publisher_id");
        let (service, host) = split_publisher(publisher.as_deref());
        let when = text(&body, "timestamp")
            .or_else(|| text(&body, "_context_timestamp"))
            .and_then(|raw| Timestamp::parse_optional(Some(&raw)));
        let request_id = text(&body, "_context_request_id");
        let message_id = text(&body, "message_id");

        Self {
            routing_key,
            body,
            event_type,
            publisher,
            service,
            host,
            when,
            request_id,
            message_id,
        }
    }

    pub fn payload(&self) -> &Value {
        self.body.get("payload").unwrap_or(&Value::Null)
    }

    /// The verbatim stored form `[routing_key, body]`.
    pub fn stored_json(&self) -> String {
        Value::Array(vec![
            Value::String(self.routing_key.clone()),
            self.body.clone(),
        ])
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenericEvent {
    pub envelope: Envelope,
    pub tenant: Option<String>,
    pub instance: Option<String>,
}

impl GenericEvent {
    fn from_envelope(envelope: Envelope) -> Self {
        let tenant = text(&envelope.body, "_context_project_id");
        let instance = text(envelope.payload(), "instance_id");
        Self {
            envelope,
            tenant,
            instance,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Nova(NovaEvent),
    Glance(GlanceEvent),
    Generic(GenericEvent),
}

impl Notification {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Notification::Nova(event) => &event.envelope,
            Notification::Glance(event) => &event.envelope,
            Notification::Generic(event) => &event.envelope,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.envelope().event_type
    }

    pub fn instance(&self) -> Option<&str> {
        match self {
            Notification::Nova(event) => event.instance.as_deref(),
            Notification::Glance(event) => event.instance.as_deref(),
            Notification::Generic(event) => event.instance.as_deref(),
        }
    }

    pub fn tenant(&self) -> Option<&str> {
        match self {
            Notification::Nova(event) => event.tenant.as_deref(),
            Notification::Glance(event) => event.tenant.as_deref(),
            Notification::Generic(event) => event.tenant.as_deref(),
        }
    }

    pub fn to_raw(&self, deployment_id: i64) -> NewRawRecord {
        let envelope = self.envelope();
        let mut raw = NewRawRecord {
            deployment_id,
            routing_key: envelope.routing_key.clone(),
            event: envelope.event_type.clone(),
            publisher: envelope.publisher.clone(),
            service: envelope.service.clone(),
            host: envelope.host.clone(),
            when: envelope.when,
            tenant: self.tenant().map(str::to_string),
            instance: self.instance().map(str::to_string),
            request_id: envelope.request_id.clone(),
            state: None,
            old_state: None,
            task: None,
            old_task: None,
            image_type: 0,
            json: envelope.stored_json(),
        };

        match self {
            Notification::Nova(event) => {
                raw.state = event.state.clone();
                raw.old_state = event.old_state.clone();
                raw.task = event.task.clone();
                raw.old_task = event.old_task.clone();
                raw.image_type = event.image_type;
            }
            Notification::Glance(event) => {
                raw.state = event.status.clone();
                raw.image_type = event.image_type;
            }
            Notification::Generic(_) => {}
        }

        raw
    }
}

/// Parses one delivery into a typed notification.
pub fn parse(
    exchange: ExchangeKind,
    routing_key: &str,
    payload: &[u8],
) -> Result<Notification, ParseError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|err| ParseError::MalformedEnvelope(format!("invalid JSON: {err}")))?;
    let (routing_key, body) = split_envelope(routing_key, value)?;
    let envelope = Envelope::new(routing_key, body);

    Ok(match exchange {
        ExchangeKind::Nova => Notification::Nova(NovaEvent::from_envelope(envelope)),
        ExchangeKind::Glance => Notification::Glance(GlanceEvent::from_envelope(envelope)),
        ExchangeKind::Generic => Notification::Generic(GenericEvent::from_envelope(envelope)),
    })
}

/// Splits a stored `[routing_key, body]` pair.
pub fn parse_stored(json: &str) -> Result<(String, Value), ParseError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|err| ParseError::MalformedEnvelope(format!("invalid JSON: {err}")))?;
    split_envelope("", value)
}

fn split_envelope(delivery_key: &str, value: Value) -> Result<(String, Value), ParseError> {
    let (routing_key, body) = match value {
        Value::Array(mut parts) if parts.len() == 2 => {
            let body = parts.pop().unwrap_or(Value::Null);
            let key = match parts.pop() {
                Some(Value::String(key)) => key,
                _ => {
                    return Err(ParseError::MalformedEnvelope(
                        "envelope routing key must be a string".into(),
                    ))
                }
            };
            (key, body)
        }
        body @ Value::Object(_) => (delivery_key.to_string(), body),
        _ => {
            return Err(ParseError::MalformedEnvelope(
                "expected a notification object or [routing_key, object] pair".into(),
            ))
        }
    };

    if routing_key.is_empty() {
        return Err(ParseError::MalformedEnvelope("missing routing key".into()));
    }
    if !body.is_object() {
        return Err(ParseError::MalformedEnvelope(
            "notification body must be a JSON object".into(),
        ));
    }
    Ok((routing_key, body))
}

fn split_publisher(publisher: Option<&str>) -> (Option<String>, Option<String>) {
    match publisher {
        Some(publisher) => match publisher.split_once('.') {
            Some((service, host)) => (Some(service.to_string()), Some(host.to_string())),
            None => (Some(publisher.to_string()), None),
        },
        None => (None, None),
    }
}

/// Reads a scalar field as text; numbers and booleans are rendered, null and
/// structured values are absent.
pub(crate) fn text(value: &Value, key: &str) -> Option<String> {
    scalar_text(value.get(key)?)
}

pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

pub(crate) fn path<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().try_fold(value, |current, key| current.get(*key))
}
