//! Clients for the authoritative instance database.

use crate::models::ImageMeta;
use crate::notification::scalar_text;
use crate::time::Timestamp;
use crate::verifier::validity::is_uuid;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const GET_INSTANCE_QUERY: &str = "SELECT * FROM instances where uuid ='%s';";
const GET_INSTANCE_SYSTEM_METADATA: &str =
    "SELECT * FROM instance_system_metadata where instance_uuid='%s';";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("bridge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no database configured for region '{0}'")]
    UnknownRegion(String),
    #[error("Couldn't find instance {0}")]
    NotFound(String),
}

/// The authoritative view of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerInstance {
    pub id: String,
    pub launched_at: Option<Timestamp>,
    pub deleted_at: Option<Timestamp>,
    pub deleted: bool,
    pub instance_type_id: Option<String>,
    pub instance_flavor_id: Option<String>,
    pub tenant: Option<String>,
    pub meta: ImageMeta,
}

#[async_trait]
pub trait ReconcilerClient: Send + Sync {
    async fn get_instance(
        &self,
        region: &str,
        uuid: &str,
        get_metadata: bool,
    ) -> Result<ReconcilerInstance, ReconcilerError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonBridgeConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Region to database name.
    pub databases: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    result: Vec<Map<String, Value>>,
}

/// Runs SQL through an HTTP JSON bridge in front of each region's nova
/// database.
pub struct JsonBridgeClient {
    http: reqwest::Client,
    config: JsonBridgeConfig,
}

impl JsonBridgeClient {
    pub fn new(config: JsonBridgeConfig) -> Result<Self, ReconcilerError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, region: &str) -> Result<String, ReconcilerError> {
        let database = self
            .config
            .databases
            .get(region)
            .ok_or_else(|| ReconcilerError::UnknownRegion(region.to_string()))?;
        Ok(format!("{}/{}", self.config.url.trim_end_matches('/'), database))
    }

    async fn query(&self, region: &str, sql: String) -> Result<Vec<Map<String, Value>>, ReconcilerError> {
        let endpoint = self.endpoint(region)?;
        debug!(%endpoint, %sql, "querying reconciler bridge");
        let response = self
            .http
            .post(&endpoint)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .form(&[("sql", sql)])
            .send()
            .await?
            .error_for_status()?;
        let body: BridgeResponse = response.json().await?;
        Ok(body.result)
    }
}

#[async_trait]
impl ReconcilerClient for JsonBridgeClient {
    async fn get_instance(
        &self,
        region: &str,
        uuid: &str,
        get_metadata: bool,
    ) -> Result<ReconcilerInstance, ReconcilerError> {
        // The uuid is spliced into SQL, so only well-formed ones go out.
        if !is_uuid(uuid) {
            warn!(uuid, "refusing reconciler lookup for malformed instance uuid");
            return Err(ReconcilerError::NotFound(uuid.to_string()));
        }
        let rows = self
            .query(region, GET_INSTANCE_QUERY.replace("%s", uuid))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| ReconcilerError::NotFound(uuid.to_string()))?;
        let mut instance = instance_from_row(&row);

        if get_metadata {
            let metadata = self
                .query(region, GET_INSTANCE_SYSTEM_METADATA.replace("%s", uuid))
                .await?;
            apply_system_metadata(&mut instance, &metadata);
        }
        Ok(instance)
    }
}

fn row_text(row: &Map<String, Value>, key: &str) -> Option<String> {
    row.get(key).and_then(scalar_text)
}

fn row_time(row: &Map<String, Value>, key: &str) -> Option<Timestamp> {
    Timestamp::parse_optional(row_text(row, key).as_deref())
}

fn instance_from_row(row: &Map<String, Value>) -> ReconcilerInstance {
    let deleted = match row.get("deleted") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(text)) => !matches!(text.as_str(), "" | "0" | "false"),
        _ => false,
    };
    ReconcilerInstance {
        id: row_text(row, "uuid").unwrap_or_default(),
        launched_at: row_time(row, "launched_at"),
        deleted_at: row_time(row, "terminated_at"),
        deleted,
        instance_type_id: row_text(row, "instance_type_id"),
        instance_flavor_id: None,
        tenant: row_text(row, "project_id"),
        meta: ImageMeta::default(),
    }
}

fn apply_system_metadata(instance: &mut ReconcilerInstance, rows: &[Map<String, Value>]) {
    for row in rows {
        let Some(key) = row_text(row, "key") else {
            continue;
        };
        let item = row_text(row, "value");
        match key.as_str() {
            "image_org.openstack__1__architecture" => instance.meta.os_architecture = item,
            "image_org.openstack__1__os_distro" => instance.meta.os_distro = item,
            "image_org.openstack__1__os_version" => instance.meta.os_version = item,
            "image_com.rackspace__1__options" => instance.meta.rax_options = item,
            "instance_type_flavorid" => instance.instance_flavor_id = item,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn maps_instance_row() {
        let row = map(json!({
            "uuid": "i-1",
            "project_id": "abc123",
            "instance_type_id": 2,
            "launched_at": "2013-06-20 17:31:57.939614",
            "terminated_at": null,
            "deleted": 0
        }));
        let instance = instance_from_row(&row);
        assert_eq!(instance.id, "i-1");
        assert_eq!(instance.tenant.as_deref(), Some("abc123"));
        assert_eq!(instance.instance_type_id.as_deref(), Some("2"));
        assert_eq!(
            instance.launched_at,
            Some(Timestamp::from_micros(1_371_749_517_939_614))
        );
        assert!(!instance.deleted);
        assert_eq!(instance.deleted_at, None);
    }

    #[test]
    fn folds_system_metadata() {
        let mut instance = ReconcilerInstance::default();
        let rows = vec![
            map(json!({"key": "image_org.openstack__1__os_distro", "value": "com.ubuntu"})),
            map(json!({"key": "image_com.rackspace__1__options", "value": "0"})),
            map(json!({"key": "instance_type_flavorid", "value": "performance1-1"})),
            map(json!({"key": "unrelated", "value": "x"})),
        ];
        apply_system_metadata(&mut instance, &rows);
        assert_eq!(instance.meta.os_distro.as_deref(), Some("com.ubuntu"));
        assert_eq!(instance.meta.rax_options.as_deref(), Some("0"));
        assert_eq!(instance.instance_flavor_id.as_deref(), Some("performance1-1"));
        assert_eq!(instance.meta.os_version, None);
    }

    #[test]
    fn endpoint_requires_known_region() {
        let client = JsonBridgeClient::new(JsonBridgeConfig {
            url: "https://bridge.example/query/".into(),
            username: "u".into(),
            password: "p".into(),
            databases: HashMap::from([("RegionOne".to_string(), "nova".to_string())]),
        })
        .unwrap();
        assert_eq!(
            client.endpoint("RegionOne").unwrap(),
            "https://bridge.example/query/nova"
        );
        assert!(matches!(
            client.endpoint("RegionTwo"),
            Err(ReconcilerError::UnknownRegion(_))
        ));
    }
}
