use super::{image_type_from_payload, path, scalar_text, text, Envelope};
use crate::models::ImageMeta;
use crate::time::Timestamp;
use serde_json::Value;

const META_ARCHITECTURE: &str = "org.openstack__1__architecture";
const META_OS_DISTRO: &str = "org.openstack__1__os_distro";
const META_OS_VERSION: &str = "org.openstack__1__os_version";
const META_RAX_OPTIONS: &str = "com.rackspace__1__options";

/// A compute notification with its instance identity and usage fields lifted out.
#[derive(Debug, Clone, PartialEq)]
pub struct NovaEvent {
    pub envelope: Envelope,
    pub instance: Option<String>,
    pub tenant: Option<String>,
    pub state: Option<String>,
    pub old_state: Option<String>,
    pub task: Option<String>,
    pub old_task: Option<String>,
    pub image_type: i32,
    pub meta: ImageMeta,
    pub instance_type_id: Option<String>,
    pub instance_flavor_id: Option<String>,
    pub new_instance_type_id: Option<String>,
    pub new_instance_flavor_id: Option<String>,
    pub launched_at: Option<Timestamp>,
    pub deleted_at: Option<Timestamp>,
    pub audit_period_beginning: Option<Timestamp>,
    pub audit_period_ending: Option<Timestamp>,
    pub message: Option<String>,
}

impl NovaEvent {
    pub(super) fn from_envelope(envelope: Envelope) -> Self {
        let payload = envelope.payload().clone();

        let instance = text(&payload, "instance_id")
            .or_else(|| text(&payload, "instance_uuid"))
            .or_else(|| path(&payload, &["exception", "kwargs", "uuid"]).and_then(scalar_text))
            .or_else(|| path(&payload, &["instance", "uuid"]).and_then(scalar_text));
        let tenant =
            text(&envelope.body, "_context_project_id").or_else(|| text(&payload, "tenant_id"));

        let image_meta = payload.get("image_meta").unwrap_or(&Value::Null);
        let meta = ImageMeta {
            os_architecture: text(image_meta, META_ARCHITECTURE),
            os_distro: text(image_meta, META_OS_DISTRO),
            os_version: text(image_meta, META_OS_VERSION),
            rax_options: text(image_meta, META_RAX_OPTIONS),
        };

        let timestamp = |key: &str| Timestamp::parse_optional(text(&payload, key).as_deref());

        Self {
            instance,
            tenant,
            state: text(&payload, "state"),
            old_state: text(&payload, "old_state"),
            task: text(&payload, "new_task_state"),
            old_task: text(&payload, "old_task_state"),
            image_type: image_type_from_payload(&payload),
            meta,
            instance_type_id: text(&payload, "instance_type_id"),
            instance_flavor_id: text(&payload, "instance_flavor_id"),
            new_instance_type_id: text(&payload, "new_instance_type_id"),
            new_instance_flavor_id: text(&payload, "new_instance_flavor_id"),
            launched_at: timestamp("launched_at"),
            deleted_at: timestamp("deleted_at"),
            audit_period_beginning: timestamp("audit_period_beginning"),
            audit_period_ending: timestamp("audit_period_ending"),
            message: text(&payload, "message"),
            envelope,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::notification::{parse, ExchangeKind, Notification, LINUX_IMAGE, OS_UBUNTU};
    use serde_json::{json, Value};

    fn parse_nova(body: Value) -> super::NovaEvent {
        let bytes = serde_json::to_vec(&body).unwrap();
        match parse(ExchangeKind::Nova, "monitor.info", &bytes).unwrap() {
            Notification::Nova(event) => event,
            other => panic!("expected nova event, got {other:?}"),
        }
    }

    #[test]
    fn instance_precedence() {
        let event = parse_nova(json!({"payload": {
            "instance_uuid": "second",
            "exception": {"kwargs": {"uuid": "third"}},
            "instance": {"uuid": "fourth"}
        }}));
        assert_eq!(event.instance.as_deref(), Some("second"));

        let event = parse_nova(json!({"payload": {
            "exception": {"kwargs": {"uuid": "third"}},
            "instance": {"uuid": "fourth"}
        }}));
        assert_eq!(event.instance.as_deref(), Some("third"));

        let event = parse_nova(json!({"payload": {"instance": {"uuid": "fourth"}}}));
        assert_eq!(event.instance.as_deref(), Some("fourth"));
    }

    #[test]
    fn tenant_prefers_context_project() {
        let event = parse_nova(json!({
            "_context_project_id": "abc123",
            "payload": {"tenant_id": "ffff"}
        }));
        assert_eq!(event.tenant.as_deref(), Some("abc123"));

        let event = parse_nova(json!({"payload": {"tenant_id": "ffff"}}));
        assert_eq!(event.tenant.as_deref(), Some("ffff"));
    }

    #[test]
    fn lifts_usage_fields_and_image_meta() {
        let event = parse_nova(json!({
            "event_type": "compute.instance.exists",
            "payload": {
                "instance_id": "i-1",
                "instance_type_id": 2,
                "instance_flavor_id": "performance1-1",
                "launched_at": "2013-06-20 17:31:57.939614",
                "deleted_at": "",
                "audit_period_beginning": "2013-06-20 00:00:00",
                "audit_period_ending": "2013-06-21 00:00:00",
                "state": "active",
                "old_state": "building",
                "new_task_state": null,
                "old_task_state": "spawning",
                "image_meta": {
                    "org.openstack__1__architecture": "x64",
                    "org.openstack__1__os_distro": "ubuntu",
                    "org.openstack__1__os_version": "12.04",
                    "com.rackspace__1__options": "4",
                    "os_type": "linux",
                    "os_distro": "ubuntu"
                }
            }
        }));
        assert_eq!(event.instance_type_id.as_deref(), Some("2"));
        assert_eq!(event.instance_flavor_id.as_deref(), Some("performance1-1"));
        assert_eq!(
            event.launched_at.map(|ts| ts.to_decimal_string()).as_deref(),
            Some("1371749517.939614")
        );
        assert_eq!(event.deleted_at, None);
        assert_eq!(
            event.audit_period_ending.map(|ts| ts.whole_seconds()),
            Some(1_371_772_800)
        );
        assert_eq!(event.state.as_deref(), Some("active"));
        assert_eq!(event.task, None);
        assert_eq!(event.old_task.as_deref(), Some("spawning"));
        assert_eq!(event.meta.os_architecture.as_deref(), Some("x64"));
        assert_eq!(event.meta.rax_options.as_deref(), Some("4"));
        assert_eq!(event.image_type, LINUX_IMAGE | OS_UBUNTU);
    }
}
