use super::{fold_image_type, path, scalar_text, text, Envelope};
use serde_json::Value;

/// An image-service notification. Only identity fields are lifted; glance
/// exists are stored raw and not verified here.
#[derive(Debug, Clone, PartialEq)]
pub struct GlanceEvent {
    pub envelope: Envelope,
    pub tenant: Option<String>,
    pub instance: Option<String>,
    pub status: Option<String>,
    pub image_type: i32,
}

impl GlanceEvent {
    pub(super) fn from_envelope(envelope: Envelope) -> Self {
        let payload = envelope.payload();
        let properties = payload.get("properties").unwrap_or(&Value::Null);

        let tenant =
            text(payload, "owner").or_else(|| text(&envelope.body, "_context_project_id"));
        let instance = path(properties, &["instance_uuid"]).and_then(scalar_text);
        let status = text(payload, "status");
        let image_type = fold_image_type(
            properties.get("image_type").and_then(Value::as_str),
            properties.get("os_type").and_then(Value::as_str),
            properties.get("os_distro").and_then(Value::as_str),
        );

        Self {
            envelope,
            tenant,
            instance,
            status,
            image_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::notification::{parse, ExchangeKind, Notification, SNAPSHOT_IMAGE, WINDOWS_IMAGE};
    use serde_json::json;

    #[test]
    fn lifts_image_identity() {
        let body = json!({
            "event_type": "image.upload",
            "publisher_id": "glance-api01-r2961.global.preprod-ord.ohthree.com",
            "_context_project_id": "fallback",
            "payload": {
                "id": "2df2ccf6-bc1b-4853-aab0-25fda346b3bb",
                "owner": "5ff4e2d8",
                "status": "active",
                "size": 12345,
                "properties": {
                    "instance_uuid": "i-9",
                    "image_type": "snapshot",
                    "os_type": "windows"
                }
            }
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let Notification::Glance(event) =
            parse(ExchangeKind::Glance, "monitor.info", &bytes).unwrap()
        else {
            panic!("expected glance event");
        };
        assert_eq!(event.tenant.as_deref(), Some("5ff4e2d8"));
        assert_eq!(event.instance.as_deref(), Some("i-9"));
        assert_eq!(event.image_type, SNAPSHOT_IMAGE | WINDOWS_IMAGE);
        assert_eq!(event.envelope.service.as_deref(), Some("glance-api01-r2961"));
    }
}
