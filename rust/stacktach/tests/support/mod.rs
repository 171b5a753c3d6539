#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use stacktach::config::ValidationLevel;
use stacktach::error::TransportError;
use stacktach::ingest::{IngestOutcome, Ingestor};
use stacktach::models::{FlavorField, InstanceExists};
use stacktach::notification::ExchangeKind;
use stacktach::publisher::{NotificationSink, Publisher, PublisherSettings};
use stacktach::reconciler::{Reconciler, ReconcilerClient};
use stacktach::store::{MemoryStore, Store};
use stacktach::supervisor::Callbacks;
use stacktach::time::Timestamp;
use stacktach::verifier::{NovaVerifier, TaskResult, Verifier, VerifierSettings};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEPLOYMENT: &str = "east";
pub const REGION: &str = "RegionOne";
pub const INSTANCE: &str = "08f685d9-6352-4dbc-8271-96cc54bf14cd";
pub const TENANT: &str = "3762854cd6f6435998188d5120e4c271";
pub const LAUNCHED_AT: &str = "2013-06-20 17:31:57.939614";
pub const PERIOD_START: &str = "2013-06-20 00:00:00";
pub const PERIOD_END: &str = "2013-06-21 00:00:00";
pub const VERIFIED_EVENT: &str = "compute.instance.exists.verified";

/// Captures everything the publisher sends; can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, Value)>>,
    failures_left: AtomicUsize,
    resets: AtomicUsize,
}

impl RecordingSink {
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), TransportError> {
        let pending = self.failures_left.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_left.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::Closed("broker went away".into()));
        }
        let body: Value = serde_json::from_slice(body).unwrap();
        self.sent
            .lock()
            .unwrap()
            .push((routing_key.to_string(), body));
        Ok(())
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Pipeline {
    pub store: MemoryStore,
    pub ingestor: Ingestor,
    pub verifier: Verifier,
    pub sink: Arc<RecordingSink>,
    pub callbacks: Callbacks,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::build(Vec::new(), None)
    }

    pub fn with_routing_keys(keys: &[&str]) -> Self {
        Self::build(keys.iter().map(|k| k.to_string()).collect(), None)
    }

    pub fn with_reconciler(client: Arc<dyn ReconcilerClient>) -> Self {
        Self::build(Vec::new(), Some(client))
    }

    fn build(routing_keys: Vec<String>, client: Option<Arc<dyn ReconcilerClient>>) -> Self {
        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let sink = Arc::new(RecordingSink::default());

        let publisher = Publisher::new(
            Arc::clone(&shared),
            sink.clone(),
            PublisherSettings {
                event_type: VERIFIED_EVENT.to_string(),
                routing_keys,
            },
        );
        let reconciler = client.map(|client| {
            Reconciler::new(
                Arc::clone(&shared),
                client,
                HashMap::from([(DEPLOYMENT.to_string(), REGION.to_string())]),
                FlavorField::InstanceTypeId,
            )
        });

        Self {
            ingestor: Ingestor::new(Arc::clone(&shared), DEPLOYMENT, ExchangeKind::Nova),
            verifier: Verifier::new(
                Arc::clone(&shared),
                NovaVerifier::new(ValidationLevel::All, FlavorField::InstanceTypeId),
                VerifierSettings {
                    settle: Duration::from_secs(60),
                    pool_size: 4,
                    process_timeout: Some(Duration::from_secs(5)),
                },
            ),
            callbacks: Callbacks::new(Some(publisher), reconciler),
            store,
            sink,
        }
    }

    pub async fn ingest(&self, body: Value) -> IngestOutcome {
        self.ingestor
            .process("monitor.info", body.to_string().as_bytes())
            .await
            .unwrap()
    }

    pub async fn tick_at(&self, now: &str) -> Vec<TaskResult> {
        self.verifier
            .run_tick(at(now), &self.callbacks)
            .await
            .unwrap()
    }

    pub async fn exists(&self) -> Vec<InstanceExists> {
        self.store.snapshot().await.exists
    }
}

pub fn at(text: &str) -> Timestamp {
    Timestamp::parse(text).unwrap()
}

pub fn image_meta() -> Value {
    json!({
        "org.openstack__1__architecture": "x64",
        "org.openstack__1__os_distro": "com.ubuntu",
        "org.openstack__1__os_version": "12.04",
        "com.rackspace__1__options": "0"
    })
}

pub fn nova(event: &str, request_id: &str, message_id: &str, when: &str, payload: Value) -> Value {
    json!({
        "event_type": event,
        "publisher_id": "compute.node-1",
        "timestamp": when,
        "message_id": message_id,
        "_context_request_id": request_id,
        "_context_project_id": TENANT,
        "payload": payload
    })
}

pub fn create_start(request_id: &str, flavor: &str) -> Value {
    nova(
        "compute.instance.create.start",
        request_id,
        "m-create-start",
        "2013-06-20 17:31:40.000000",
        json!({
            "instance_id": INSTANCE,
            "tenant_id": TENANT,
            "instance_type_id": flavor,
            "launched_at": "",
            "state": "building",
            "new_task_state": "spawning",
            "image_meta": image_meta()
        }),
    )
}

pub fn create_end(request_id: &str, flavor: &str) -> Value {
    nova(
        "compute.instance.create.end",
        request_id,
        "m-create-end",
        "2013-06-20 17:31:58.000000",
        json!({
            "instance_id": INSTANCE,
            "tenant_id": TENANT,
            "instance_type_id": flavor,
            "launched_at": LAUNCHED_AT,
            "state": "active",
            "old_task_state": "spawning",
            "message": "Success",
            "image_meta": image_meta()
        }),
    )
}

pub fn delete_end(deleted_at: &str) -> Value {
    nova(
        "compute.instance.delete.end",
        "r-delete",
        "m-delete-end",
        deleted_at,
        json!({
            "instance_id": INSTANCE,
            "tenant_id": TENANT,
            "launched_at": LAUNCHED_AT,
            "deleted_at": deleted_at,
            "state": "deleted"
        }),
    )
}

pub fn exists(message_id: &str, flavor: &str, deleted_at: Option<&str>) -> Value {
    exists_between(message_id, flavor, deleted_at, PERIOD_START, PERIOD_END)
}

pub fn exists_between(
    message_id: &str,
    flavor: &str,
    deleted_at: Option<&str>,
    beginning: &str,
    ending: &str,
) -> Value {
    nova(
        "compute.instance.exists",
        "r-audit",
        message_id,
        ending,
        json!({
            "instance_id": INSTANCE,
            "tenant_id": TENANT,
            "instance_type_id": flavor,
            "launched_at": LAUNCHED_AT,
            "deleted_at": deleted_at.unwrap_or(""),
            "audit_period_beginning": beginning,
            "audit_period_ending": ending,
            "state": "active",
            "image_meta": image_meta()
        }),
    )
}
