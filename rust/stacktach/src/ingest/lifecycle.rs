//! Pairs `.start`/`.end` notifications into timings and tracks API requests
//! end to end.

use crate::error::StoreResult;
use crate::models::{Lifecycle, RawRecord, RequestTracker, Timing};
use crate::store::Transaction;
use tracing::{debug, warn};

const UPDATE_EVENT: &str = "compute.instance.update";

/// Splits `compute.instance.create.start` into `("compute.instance.create", "start")`.
pub fn split_event(event: &str) -> (&str, &str) {
    match event.rsplit_once('.') {
        Some((name, step)) => (name, step),
        None => (event, ""),
    }
}

pub async fn correlate(tx: &mut dyn Transaction, raw: &RawRecord) -> StoreResult<()> {
    let Some(instance) = raw.instance.as_deref() else {
        return Ok(());
    };

    let mut lifecycle = tx.lifecycle_for(instance).await?.unwrap_or_else(|| Lifecycle {
        id: 0,
        instance: instance.to_string(),
        last_raw_id: None,
        last_state: None,
        last_task_state: None,
    });
    lifecycle.last_raw_id = Some(raw.id);
    lifecycle.last_state = raw.state.clone();
    lifecycle.last_task_state = raw.old_task.clone();
    let lifecycle = tx.save_lifecycle(lifecycle).await?;

    let (name, step) = split_event(&raw.event);
    match step {
        "start" => start_timing(tx, &lifecycle, name, raw).await,
        "end" => end_timing(tx, &lifecycle, name, raw).await,
        _ => {
            let from_api = raw.service.as_deref().is_some_and(|s| s.contains("api"));
            if raw.event == UPDATE_EVENT && from_api {
                track_request(tx, &lifecycle, raw).await?;
            }
            Ok(())
        }
    }
}

async fn track_request(
    tx: &mut dyn Transaction,
    lifecycle: &Lifecycle,
    raw: &RawRecord,
) -> StoreResult<()> {
    let Some(request_id) = raw.request_id.as_deref() else {
        return Ok(());
    };
    if tx.tracker_for(request_id).await?.is_some() {
        return Ok(());
    }
    tx.save_tracker(RequestTracker {
        id: 0,
        request_id: request_id.to_string(),
        lifecycle_id: lifecycle.id,
        last_timing_id: None,
        start: raw.when,
        duration: 0,
        completed: false,
    })
    .await?;
    debug!(request_id, instance = %lifecycle.instance, "tracking request");
    Ok(())
}

async fn start_timing(
    tx: &mut dyn Transaction,
    lifecycle: &Lifecycle,
    name: &str,
    raw: &RawRecord,
) -> StoreResult<()> {
    let mut timing = tx
        .timings_named(lifecycle.id, name)
        .await?
        .into_iter()
        .rev()
        .find(|t| t.end_raw_id.is_none())
        .unwrap_or_else(|| Timing::new(lifecycle.id, name));

    timing.start_raw_id = Some(raw.id);
    timing.start_when = raw.when;
    timing.end_raw_id = None;
    timing.end_when = None;
    timing.diff = None;
    tx.save_timing(timing).await?;
    Ok(())
}

async fn end_timing(
    tx: &mut dyn Transaction,
    lifecycle: &Lifecycle,
    name: &str,
    raw: &RawRecord,
) -> StoreResult<()> {
    let mut timing = tx
        .timings_named(lifecycle.id, name)
        .await?
        .into_iter()
        .find(|t| t.end_raw_id.is_none())
        .unwrap_or_else(|| Timing::new(lifecycle.id, name));

    timing.end_raw_id = Some(raw.id);
    timing.end_when = raw.when;

    let (Some(start), Some(end)) = (timing.start_when, timing.end_when) else {
        tx.save_timing(timing).await?;
        return Ok(());
    };

    let mut diff = end.micros_since(start);
    if diff < 0 {
        warn!(
            instance = %lifecycle.instance,
            timing = name,
            diff,
            "end precedes start; recording a zero duration"
        );
        diff = 0;
    }
    timing.diff = Some(diff);
    let timing = tx.save_timing(timing).await?;

    let Some(request_id) = raw.request_id.as_deref() else {
        return Ok(());
    };
    if let Some(mut tracker) = tx.tracker_for(request_id).await? {
        tracker.last_timing_id = Some(timing.id);
        if let Some(tracker_start) = tracker.start {
            tracker.duration = end.micros_since(tracker_start);
        }
        tracker.completed = raw.task.is_none();
        tx.save_tracker(tracker).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewRawRecord;
    use crate::store::{MemoryStore, Store};
    use crate::time::Timestamp;

    fn raw(event: &str, seconds: i64) -> NewRawRecord {
        NewRawRecord {
            deployment_id: 1,
            routing_key: "monitor.info".into(),
            event: event.into(),
            publisher: Some("compute.node-1".into()),
            service: Some("compute".into()),
            host: Some("node-1".into()),
            when: Some(Timestamp::from_seconds(seconds)),
            tenant: None,
            instance: Some("i-1".into()),
            request_id: Some("r-1".into()),
            state: Some("building".into()),
            old_state: None,
            task: None,
            old_task: Some("spawning".into()),
            image_type: 0,
            json: "[]".into(),
        }
    }

    async fn ingest(tx: &mut dyn Transaction, new: NewRawRecord) {
        let raw = tx.insert_raw(new).await.unwrap();
        correlate(tx, &raw).await.unwrap();
    }

    #[test]
    fn splits_trailing_step() {
        assert_eq!(
            split_event("compute.instance.create.start"),
            ("compute.instance.create", "start")
        );
        assert_eq!(split_event("exists"), ("exists", ""));
    }

    #[tokio::test]
    async fn pairs_start_and_end() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut update = raw(UPDATE_EVENT, 5);
        update.service = Some("nova-api".into());
        ingest(tx.as_mut(), update).await;
        ingest(tx.as_mut(), raw("compute.instance.create.start", 10)).await;
        ingest(tx.as_mut(), raw("compute.instance.create.end", 25)).await;
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.lifecycles.len(), 1);
        let lifecycle = &snapshot.lifecycles[0];
        assert_eq!(lifecycle.last_raw_id, Some(3));
        assert_eq!(lifecycle.last_task_state.as_deref(), Some("spawning"));

        assert_eq!(snapshot.timings.len(), 1);
        let timing = &snapshot.timings[0];
        assert_eq!(timing.name, "compute.instance.create");
        assert_eq!((timing.start_raw_id, timing.end_raw_id), (Some(2), Some(3)));
        assert_eq!(timing.diff, Some(15_000_000));

        let tracker = &snapshot.trackers[0];
        assert_eq!(tracker.last_timing_id, Some(timing.id));
        assert_eq!(tracker.duration, 20_000_000);
        assert!(tracker.completed);
    }

    #[tokio::test]
    async fn end_without_start_opens_nothing() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        ingest(tx.as_mut(), raw("compute.instance.delete.end", 30)).await;
        ingest(tx.as_mut(), raw("compute.instance.delete.start", 40)).await;
        tx.commit().await.unwrap();

        let timings = store.snapshot().await.timings;
        assert_eq!(timings.len(), 2);
        assert_eq!(timings[0].start_raw_id, None);
        assert_eq!(timings[0].diff, None);
        assert!(timings[1].is_open());
    }

    #[tokio::test]
    async fn repeated_start_reuses_open_timing() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        ingest(tx.as_mut(), raw("compute.instance.reboot.start", 10)).await;
        ingest(tx.as_mut(), raw("compute.instance.reboot.start", 12)).await;
        ingest(tx.as_mut(), raw("compute.instance.reboot.end", 15)).await;
        ingest(tx.as_mut(), raw("compute.instance.reboot.start", 20)).await;
        tx.commit().await.unwrap();

        let timings = store.snapshot().await.timings;
        assert_eq!(timings.len(), 2);
        assert_eq!(timings[0].start_raw_id, Some(2));
        assert_eq!(timings[0].diff, Some(3_000_000));
        assert!(timings[1].is_open());
    }

    #[tokio::test]
    async fn update_from_compute_does_not_track() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        ingest(tx.as_mut(), raw(UPDATE_EVENT, 5)).await;
        let mut orphan = raw("compute.instance.create.start", 6);
        orphan.instance = None;
        ingest(tx.as_mut(), orphan).await;
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        assert!(snapshot.trackers.is_empty());
        assert!(snapshot.timings.is_empty());
        assert_eq!(snapshot.lifecycles.len(), 1);
    }
}
