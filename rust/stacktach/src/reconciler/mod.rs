//! Second opinion for failed exists, taken from the authoritative instance
//! database.

pub mod client;

pub use client::{
    JsonBridgeClient, JsonBridgeConfig, ReconcilerClient, ReconcilerError, ReconcilerInstance,
};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::models::{ExistsStatus, FlavorField, Flavored, InstanceExists, InstanceReconcile};
use crate::store::{finish, Store};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RECONCILER_SOURCE: &str = "reconciler:json_bridge:nova_db";
const JSON_BRIDGE_CLASS: &str = "JSONBridgeClient";

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_client_class")]
    pub client_class: String,
    pub client: JsonBridgeConfig,
    pub region_mapping_loc: PathBuf,
}

fn default_client_class() -> String {
    JSON_BRIDGE_CLASS.to_string()
}

impl ReconcilerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read reconciler config {}", path.display()))?;
        let cfg: ReconcilerConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse reconciler config {}", path.display()))?;
        if cfg.client_class != JSON_BRIDGE_CLASS {
            anyhow::bail!("unsupported reconciler client_class '{}'", cfg.client_class);
        }
        if cfg.client.url.is_empty() {
            anyhow::bail!("reconciler client url is required");
        }
        Ok(cfg)
    }
}

/// Deployment name to reconciler region.
pub fn load_region_mapping<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read region mapping {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse region mapping {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reconciled,
    /// The authoritative record disagrees with the exist.
    Mismatch(String),
    /// No region could be determined for the exist.
    Skipped(String),
    /// The authoritative source could not be consulted.
    Unavailable(String),
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    client: Arc<dyn ReconcilerClient>,
    regions: HashMap<String, String>,
    flavor_field: FlavorField,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn ReconcilerClient>,
        regions: HashMap<String, String>,
        flavor_field: FlavorField,
    ) -> Self {
        Self {
            store,
            client,
            regions,
            flavor_field,
        }
    }

    /// Builds the configured reconciler, or `None` when reconciliation is off.
    pub fn from_config(cfg: &Config, store: Arc<dyn Store>) -> Result<Option<Self>> {
        if !cfg.reconcile {
            return Ok(None);
        }
        let path = cfg
            .reconciler_config
            .as_ref()
            .context("reconcile is enabled without reconciler_config")?;
        let reconciler_cfg = ReconcilerConfig::from_file(path)?;
        let regions = load_region_mapping(&reconciler_cfg.region_mapping_loc)?;
        let client = JsonBridgeClient::new(reconciler_cfg.client)
            .context("failed to build reconciler HTTP client")?;
        info!(regions = regions.len(), "reconciler enabled");
        Ok(Some(Self::new(store, Arc::new(client), regions, cfg.flavor_field_name)))
    }

    /// Re-decides a failed exist against the authoritative record, promoting
    /// it to reconciled when every compared field agrees.
    pub async fn failed_validation(&self, exist: &InstanceExists) -> StoreResult<ReconcileOutcome> {
        let region = match self.region_for(exist).await? {
            Ok(region) => region,
            Err(reason) => {
                debug!(exist_id = exist.id, %reason, "reconciliation skipped");
                return Ok(ReconcileOutcome::Skipped(reason));
            }
        };

        let instance = match self.client.get_instance(&region, &exist.instance, true).await {
            Ok(instance) => instance,
            Err(err) => {
                warn!(exist_id = exist.id, instance = %exist.instance, error = %err, "reconciler lookup failed");
                return Ok(ReconcileOutcome::Unavailable(err.to_string()));
            }
        };

        if let Err(reason) = fields_match(exist, &instance, self.flavor_field) {
            debug!(exist_id = exist.id, %reason, "authoritative record disagrees");
            return Ok(ReconcileOutcome::Mismatch(reason));
        }

        let mut tx = self.store.begin().await?;
        let promoted = async {
            tx.insert_reconcile(reconcile_row(exist, instance)).await?;
            tx.set_exists_status(exist.id, ExistsStatus::Reconciled, None).await
        }
        .await;
        let promoted = finish(tx, promoted).await?;
        if promoted {
            info!(exist_id = exist.id, instance = %exist.instance, "exist reconciled");
        }
        Ok(ReconcileOutcome::Reconciled)
    }

    async fn region_for(&self, exist: &InstanceExists) -> StoreResult<Result<String, String>> {
        let Some(raw_id) = exist.raw_id else {
            return Ok(Err("exist has no raw record".to_string()));
        };
        let mut tx = self.store.begin().await?;
        let deployment = async {
            let Some(raw) = tx.get_raw(raw_id).await? else {
                return Ok::<_, StoreError>(None);
            };
            tx.deployment_name(raw.deployment_id).await
        }
        .await;
        let deployment = finish(tx, deployment).await?;

        Ok(match deployment {
            None => Err(format!("no deployment for raw record {raw_id}")),
            Some(name) => self
                .regions
                .get(&name)
                .cloned()
                .ok_or_else(|| format!("no region mapped for deployment '{name}'")),
        })
    }
}

fn fields_match(
    exist: &InstanceExists,
    instance: &ReconcilerInstance,
    flavor_field: FlavorField,
) -> Result<(), String> {
    let same_launch = match (exist.launched_at, instance.launched_at) {
        (Some(a), Some(b)) => a.same_second(b),
        _ => false,
    };
    if !same_launch {
        return Err("launched_at differs".to_string());
    }
    let authoritative_flavor = match flavor_field {
        FlavorField::InstanceTypeId => instance.instance_type_id.as_deref(),
        FlavorField::InstanceFlavorId => instance.instance_flavor_id.as_deref(),
    };
    if exist.flavor(flavor_field) != authoritative_flavor {
        return Err(format!("{} differs", flavor_field.name()));
    }
    if exist.tenant != instance.tenant {
        return Err("tenant differs".to_string());
    }
    if exist.meta != instance.meta {
        return Err("image metadata differs".to_string());
    }

    match exist.deleted_at {
        Some(deleted_at) => {
            let same_delete = instance.deleted_at.is_some_and(|d| d.same_second(deleted_at));
            if !instance.deleted || !same_delete {
                return Err("deletion differs".to_string());
            }
        }
        None if instance.deleted => {
            return Err("instance is deleted but the exist is not".to_string());
        }
        None => {}
    }
    Ok(())
}

fn reconcile_row(exist: &InstanceExists, instance: ReconcilerInstance) -> InstanceReconcile {
    InstanceReconcile {
        id: 0,
        instance: exist.instance.clone(),
        launched_at: instance.launched_at,
        deleted_at: instance.deleted.then_some(instance.deleted_at).flatten(),
        instance_type_id: instance.instance_type_id,
        instance_flavor_id: instance.instance_flavor_id,
        tenant: instance.tenant,
        meta: instance.meta,
        source: RECONCILER_SOURCE.to_string(),
    }
}
