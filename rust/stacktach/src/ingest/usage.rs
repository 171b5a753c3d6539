//! Folds compute notifications into launch, delete and exists rows.

use crate::error::StoreResult;
use crate::models::{
    ExistsStatus, ImageMeta, InstanceDelete, InstanceExists, InstanceUsage, NewInstanceExists,
    RawRecord,
};
use crate::notification::NovaEvent;
use crate::store::{DeleteKey, Transaction};
use tracing::{debug, warn};

const FLAVOR_ON_START: &[&str] = &[
    "compute.instance.create.start",
    "compute.instance.rebuild.start",
    "compute.instance.rescue.start",
];

const LAUNCH_IF_UNSET: &[&str] = &[
    "compute.instance.rebuild.start",
    "compute.instance.resize.prep.start",
    "compute.instance.resize.revert.start",
    "compute.instance.rescue.start",
];

const LAUNCH_ENDS: &[&str] = &[
    "compute.instance.create.end",
    "compute.instance.rebuild.end",
    "compute.instance.resize.finish.end",
    "compute.instance.resize.revert.end",
    "compute.instance.rescue.end",
];

const RESIZE_REVERT_END: &str = "compute.instance.resize.revert.end";
const RESIZE_PREP_END: &str = "compute.instance.resize.prep.end";
const DELETE_END: &str = "compute.instance.delete.end";
const EXISTS: &str = "compute.instance.exists";

/// What the aggregator did with one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageAction {
    Ignored,
    Launch(i64),
    Delete(i64),
    Exists(i64),
    Skipped(&'static str),
}

pub fn is_usage_event(event: &str) -> bool {
    FLAVOR_ON_START.contains(&event)
        || LAUNCH_IF_UNSET.contains(&event)
        || LAUNCH_ENDS.contains(&event)
        || event == RESIZE_PREP_END
        || event == DELETE_END
        || event == EXISTS
}

pub async fn aggregate(
    tx: &mut dyn Transaction,
    event: &NovaEvent,
    raw: &RawRecord,
) -> StoreResult<UsageAction> {
    let name = event.envelope.event_type.as_str();
    if !is_usage_event(name) {
        return Ok(UsageAction::Ignored);
    }
    let Some(instance) = event.instance.as_deref() else {
        warn!(event = name, raw_id = raw.id, "usage event without an instance");
        return Ok(UsageAction::Skipped("missing instance"));
    };

    match name {
        DELETE_END => record_delete(tx, event, instance, raw).await,
        EXISTS => record_exists(tx, event, instance, raw).await,
        _ => record_launch(tx, event, instance).await,
    }
}

fn merge_meta(target: &mut ImageMeta, incoming: &ImageMeta) {
    let fields = [
        (&mut target.os_architecture, &incoming.os_architecture),
        (&mut target.os_distro, &incoming.os_distro),
        (&mut target.os_version, &incoming.os_version),
        (&mut target.rax_options, &incoming.rax_options),
    ];
    for (slot, value) in fields {
        if value.is_some() {
            slot.clone_from(value);
        }
    }
}

async fn record_launch(
    tx: &mut dyn Transaction,
    event: &NovaEvent,
    instance: &str,
) -> StoreResult<UsageAction> {
    let name = event.envelope.event_type.as_str();
    if LAUNCH_ENDS.contains(&name) {
        if let Some(message) = event.message.as_deref().filter(|m| *m != "Success") {
            debug!(event = name, instance, message, "ignoring unsuccessful launch");
            return Ok(UsageAction::Skipped("unsuccessful operation"));
        }
    }

    let request_id = event.envelope.request_id.as_deref();
    let mut usage = tx
        .usage_for_request(instance, request_id)
        .await?
        .unwrap_or_else(|| InstanceUsage {
            instance: instance.to_string(),
            request_id: request_id.map(str::to_string),
            ..Default::default()
        });

    if FLAVOR_ON_START.contains(&name) || name == RESIZE_REVERT_END {
        usage.instance_type_id.clone_from(&event.instance_type_id);
        usage.instance_flavor_id.clone_from(&event.instance_flavor_id);
    }
    if name == RESIZE_PREP_END {
        usage.instance_type_id.clone_from(&event.new_instance_type_id);
        usage.instance_flavor_id.clone_from(&event.new_instance_flavor_id);
    }
    if LAUNCH_IF_UNSET.contains(&name) && usage.launched_at.is_none() {
        usage.launched_at = event.launched_at;
    }
    if LAUNCH_ENDS.contains(&name) {
        usage.launched_at = event.launched_at;
    }
    if event.tenant.is_some() {
        usage.tenant.clone_from(&event.tenant);
    }
    merge_meta(&mut usage.meta, &event.meta);

    let usage = tx.save_usage(usage).await?;
    Ok(UsageAction::Launch(usage.id))
}

async fn record_delete(
    tx: &mut dyn Transaction,
    event: &NovaEvent,
    instance: &str,
    raw: &RawRecord,
) -> StoreResult<UsageAction> {
    let key = match (event.launched_at, event.deleted_at) {
        (Some(launched), _) => DeleteKey::LaunchedAt(launched),
        (None, Some(deleted)) => DeleteKey::DeletedAt(deleted),
        (None, None) => {
            warn!(instance, raw_id = raw.id, "delete without launched_at or deleted_at");
            return Ok(UsageAction::Skipped("delete without timestamps"));
        }
    };

    let mut delete = tx
        .delete_for(instance, key)
        .await?
        .unwrap_or_else(|| InstanceDelete {
            instance: instance.to_string(),
            ..Default::default()
        });
    if event.launched_at.is_some() {
        delete.launched_at = event.launched_at;
    }
    delete.deleted_at = event.deleted_at;
    delete.raw_id = Some(raw.id);

    let delete = tx.save_delete(delete).await?;
    Ok(UsageAction::Delete(delete.id))
}

async fn record_exists(
    tx: &mut dyn Transaction,
    event: &NovaEvent,
    instance: &str,
    raw: &RawRecord,
) -> StoreResult<UsageAction> {
    let Some(launched_at) = event.launched_at else {
        warn!(instance, raw_id = raw.id, "exists without launched_at; dropping");
        return Ok(UsageAction::Skipped("exists without launched_at"));
    };

    if let Some(message_id) = event.envelope.message_id.as_deref() {
        if let Some(seen) = tx.exists_with_message(instance, message_id).await? {
            debug!(instance, message_id, exists_id = seen.id, "duplicate exists");
            return Ok(UsageAction::Exists(seen.id));
        }
    }

    let (beginning, ending) = (event.audit_period_beginning, event.audit_period_ending);
    if let Some(live) = tx.live_exists_for_period(instance, beginning, ending).await? {
        warn!(
            instance,
            exists_id = live.id,
            status = %live.status,
            "exists already recorded for this audit period; dropping"
        );
        return Ok(UsageAction::Skipped("duplicate audit period"));
    }

    let (from, to) = launched_at.second_window();
    let usages = tx.usages_launched_between(instance, from, to).await?;
    let usage_id = match usages.as_slice() {
        [usage] => Some(usage.id),
        _ => None,
    };
    let delete_id = if event.deleted_at.is_some() {
        match tx.deletes_launched_between(instance, from, to, None).await?.as_slice() {
            [delete] => Some(delete.id),
            _ => None,
        }
    } else {
        None
    };

    let exists: InstanceExists = tx
        .insert_exists(NewInstanceExists {
            instance: instance.to_string(),
            launched_at: Some(launched_at),
            deleted_at: event.deleted_at,
            audit_period_beginning: beginning,
            audit_period_ending: ending,
            instance_type_id: event.instance_type_id.clone(),
            instance_flavor_id: event.instance_flavor_id.clone(),
            message_id: event.envelope.message_id.clone(),
            tenant: event.tenant.clone(),
            meta: event.meta.clone(),
            status: ExistsStatus::Pending,
            raw_id: Some(raw.id),
            usage_id,
            delete_id,
        })
        .await?;
    Ok(UsageAction::Exists(exists.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{parse, ExchangeKind, Notification};
    use crate::store::{MemoryStore, Store};
    use crate::time::Timestamp;
    use serde_json::{json, Value};

    async fn feed(tx: &mut dyn Transaction, body: Value) -> UsageAction {
        let bytes = serde_json::to_vec(&body).unwrap();
        let Notification::Nova(event) = parse(ExchangeKind::Nova, "monitor.info", &bytes).unwrap()
        else {
            panic!("expected nova");
        };
        let raw = tx
            .insert_raw(Notification::Nova(event.clone()).to_raw(1))
            .await
            .unwrap();
        aggregate(tx, &event, &raw).await.unwrap()
    }

    fn launch(event: &str, request: &str, payload: Value) -> Value {
        json!({
            "event_type": event,
            "_context_request_id": request,
            "_context_project_id": "abc",
            "payload": payload,
        })
    }

    #[tokio::test]
    async fn create_then_resize_keeps_separate_launches() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let t = tx.as_mut();
        feed(t, launch("compute.instance.create.start", "r-1",
            json!({"instance_id": "i-1", "instance_type_id": "2"}))).await;
        feed(t, launch("compute.instance.create.end", "r-1",
            json!({"instance_id": "i-1", "launched_at": "2013-06-20 17:31:57.939614", "message": "Success"}))).await;
        feed(t, launch("compute.instance.resize.prep.start", "r-2",
            json!({"instance_id": "i-1", "launched_at": "2013-06-20 17:31:57.939614"}))).await;
        feed(t, launch("compute.instance.resize.prep.end", "r-2",
            json!({"instance_id": "i-1", "new_instance_type_id": "5"}))).await;
        feed(t, launch("compute.instance.resize.finish.end", "r-2",
            json!({"instance_id": "i-1", "launched_at": "2013-06-21 08:00:00"}))).await;
        tx.commit().await.unwrap();

        let usages = store.snapshot().await.usages;
        assert_eq!(usages.len(), 2);
        assert_eq!(usages[0].request_id.as_deref(), Some("r-1"));
        assert_eq!(usages[0].instance_type_id.as_deref(), Some("2"));
        assert_eq!(
            usages[0].launched_at.map(|ts| ts.as_micros()),
            Some(1_371_749_517_939_614)
        );
        assert_eq!(usages[0].tenant.as_deref(), Some("abc"));
        assert_eq!(usages[1].instance_type_id.as_deref(), Some("5"));
        assert_eq!(
            usages[1].launched_at.map(|ts| ts.whole_seconds()),
            Some(1_371_801_600)
        );
    }

    #[tokio::test]
    async fn failed_create_end_is_ignored() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let action = feed(tx.as_mut(), launch("compute.instance.create.end", "r-1",
            json!({"instance_id": "i-1", "launched_at": "2013-06-20 17:31:57", "message": "Error"}))).await;
        assert_eq!(action, UsageAction::Skipped("unsuccessful operation"));
    }

    #[tokio::test]
    async fn start_does_not_overwrite_launched_at() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let t = tx.as_mut();
        feed(t, launch("compute.instance.rebuild.start", "r-3",
            json!({"instance_id": "i-1", "launched_at": "2013-06-20 17:31:57"}))).await;
        feed(t, launch("compute.instance.rebuild.start", "r-3",
            json!({"instance_id": "i-1", "launched_at": "2013-06-20 18:00:00"}))).await;
        tx.commit().await.unwrap();

        let usages = store.snapshot().await.usages;
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].launched_at, Some(Timestamp::from_seconds(1_371_749_517)));
    }

    #[tokio::test]
    async fn delete_upserts_on_launch() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let body = launch("compute.instance.delete.end", "r-9", json!({
            "instance_id": "i-1",
            "launched_at": "2013-06-20 17:31:57",
            "deleted_at": "2013-06-20 19:00:00"
        }));
        let first = feed(tx.as_mut(), body.clone()).await;
        let second = feed(tx.as_mut(), body).await;
        assert_eq!(first, second);
        tx.commit().await.unwrap();
        assert_eq!(store.snapshot().await.deletes.len(), 1);
    }

    #[tokio::test]
    async fn exists_links_single_launch_and_dedupes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let t = tx.as_mut();
        feed(t, launch("compute.instance.create.end", "r-1",
            json!({"instance_id": "i-1", "launched_at": "2013-06-20 17:31:57.939614"}))).await;
        let exists = json!({
            "event_type": "compute.instance.exists",
            "message_id": "m-1",
            "payload": {
                "instance_id": "i-1",
                "launched_at": "2013-06-20 17:31:57",
                "audit_period_beginning": "2013-06-20 00:00:00",
                "audit_period_ending": "2013-06-21 00:00:00"
            }
        });
        let first = feed(t, exists.clone()).await;
        let replay = feed(t, exists.clone()).await;
        assert_eq!(first, replay);

        let mut other = exists;
        other["message_id"] = json!("m-2");
        assert_eq!(
            feed(t, other).await,
            UsageAction::Skipped("duplicate audit period")
        );

        let missing = json!({
            "event_type": "compute.instance.exists",
            "payload": {"instance_id": "i-1"}
        });
        assert_eq!(
            feed(t, missing).await,
            UsageAction::Skipped("exists without launched_at")
        );
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.exists.len(), 1);
        assert_eq!(snapshot.exists[0].usage_id, Some(snapshot.usages[0].id));
        assert_eq!(snapshot.exists[0].delete_id, None);
        assert_eq!(snapshot.exists[0].status, ExistsStatus::Pending);
    }
}
