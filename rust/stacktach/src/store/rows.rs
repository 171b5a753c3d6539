//! Diesel row shapes and their conversions to the domain records.

use crate::error::StoreError;
use crate::models::{
    ImageMeta, InstanceDelete, InstanceExists, InstanceReconcile, InstanceUsage, Lifecycle,
    NewInstanceExists, NewRawRecord, RawRecord, RequestTracker, Timing,
};
use crate::schema::{
    instance_deletes, instance_exists, instance_reconciles, instance_usages, lifecycles,
    raw_records, request_trackers, timings,
};
use crate::time::Timestamp;
use diesel::prelude::*;

fn micros(ts: Option<Timestamp>) -> Option<i64> {
    ts.map(Timestamp::as_micros)
}

fn stamp(micros: Option<i64>) -> Option<Timestamp> {
    micros.map(Timestamp::from_micros)
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = raw_records, check_for_backend(diesel::pg::Pg))]
pub(super) struct RawRow {
    id: i64,
    deployment_id: i64,
    routing_key: String,
    event: String,
    publisher: Option<String>,
    service: Option<String>,
    host: Option<String>,
    when_at: Option<i64>,
    tenant: Option<String>,
    instance: Option<String>,
    request_id: Option<String>,
    state: Option<String>,
    old_state: Option<String>,
    task: Option<String>,
    old_task: Option<String>,
    image_type: i32,
    json: String,
}

impl From<RawRow> for RawRecord {
    fn from(row: RawRow) -> Self {
        RawRecord {
            id: row.id,
            deployment_id: row.deployment_id,
            routing_key: row.routing_key,
            event: row.event,
            publisher: row.publisher,
            service: row.service,
            host: row.host,
            when: stamp(row.when_at),
            tenant: row.tenant,
            instance: row.instance,
            request_id: row.request_id,
            state: row.state,
            old_state: row.old_state,
            task: row.task,
            old_task: row.old_task,
            image_type: row.image_type,
            json: row.json,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = raw_records)]
pub(super) struct NewRawRow {
    deployment_id: i64,
    routing_key: String,
    event: String,
    publisher: Option<String>,
    service: Option<String>,
    host: Option<String>,
    when_at: Option<i64>,
    tenant: Option<String>,
    instance: Option<String>,
    request_id: Option<String>,
    state: Option<String>,
    old_state: Option<String>,
    task: Option<String>,
    old_task: Option<String>,
    image_type: i32,
    json: String,
}

impl From<NewRawRecord> for NewRawRow {
    fn from(raw: NewRawRecord) -> Self {
        NewRawRow {
            deployment_id: raw.deployment_id,
            routing_key: raw.routing_key,
            event: raw.event,
            publisher: raw.publisher,
            service: raw.service,
            host: raw.host,
            when_at: micros(raw.when),
            tenant: raw.tenant,
            instance: raw.instance,
            request_id: raw.request_id,
            state: raw.state,
            old_state: raw.old_state,
            task: raw.task,
            old_task: raw.old_task,
            image_type: raw.image_type,
            json: raw.json,
        }
    }
}

#[derive(Debug, Queryable, Selectable, AsChangeset)]
#[diesel(table_name = lifecycles, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub(super) struct LifecycleRow {
    pub id: i64,
    instance: String,
    last_raw_id: Option<i64>,
    last_state: Option<String>,
    last_task_state: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = lifecycles)]
pub(super) struct NewLifecycleRow {
    instance: String,
    last_raw_id: Option<i64>,
    last_state: Option<String>,
    last_task_state: Option<String>,
}

impl From<LifecycleRow> for Lifecycle {
    fn from(row: LifecycleRow) -> Self {
        Lifecycle {
            id: row.id,
            instance: row.instance,
            last_raw_id: row.last_raw_id,
            last_state: row.last_state,
            last_task_state: row.last_task_state,
        }
    }
}

impl From<Lifecycle> for LifecycleRow {
    fn from(l: Lifecycle) -> Self {
        LifecycleRow {
            id: l.id,
            instance: l.instance,
            last_raw_id: l.last_raw_id,
            last_state: l.last_state,
            last_task_state: l.last_task_state,
        }
    }
}

impl From<Lifecycle> for NewLifecycleRow {
    fn from(l: Lifecycle) -> Self {
        NewLifecycleRow {
            instance: l.instance,
            last_raw_id: l.last_raw_id,
            last_state: l.last_state,
            last_task_state: l.last_task_state,
        }
    }
}

#[derive(Debug, Queryable, Selectable, AsChangeset)]
#[diesel(table_name = timings, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub(super) struct TimingRow {
    pub id: i64,
    lifecycle_id: i64,
    name: String,
    start_raw_id: Option<i64>,
    end_raw_id: Option<i64>,
    start_when: Option<i64>,
    end_when: Option<i64>,
    diff: Option<i64>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = timings)]
pub(super) struct NewTimingRow {
    lifecycle_id: i64,
    name: String,
    start_raw_id: Option<i64>,
    end_raw_id: Option<i64>,
    start_when: Option<i64>,
    end_when: Option<i64>,
    diff: Option<i64>,
}

impl From<TimingRow> for Timing {
    fn from(row: TimingRow) -> Self {
        Timing {
            id: row.id,
            lifecycle_id: row.lifecycle_id,
            name: row.name,
            start_raw_id: row.start_raw_id,
            end_raw_id: row.end_raw_id,
            start_when: stamp(row.start_when),
            end_when: stamp(row.end_when),
            diff: row.diff,
        }
    }
}

impl From<Timing> for TimingRow {
    fn from(t: Timing) -> Self {
        TimingRow {
            id: t.id,
            lifecycle_id: t.lifecycle_id,
            name: t.name,
            start_raw_id: t.start_raw_id,
            end_raw_id: t.end_raw_id,
            start_when: micros(t.start_when),
            end_when: micros(t.end_when),
            diff: t.diff,
        }
    }
}

impl From<Timing> for NewTimingRow {
    fn from(t: Timing) -> Self {
        NewTimingRow {
            lifecycle_id: t.lifecycle_id,
            name: t.name,
            start_raw_id: t.start_raw_id,
            end_raw_id: t.end_raw_id,
            start_when: micros(t.start_when),
            end_when: micros(t.end_when),
            diff: t.diff,
        }
    }
}

#[derive(Debug, Queryable, Selectable, AsChangeset)]
#[diesel(table_name = request_trackers, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub(super) struct TrackerRow {
    pub id: i64,
    request_id: String,
    lifecycle_id: i64,
    last_timing_id: Option<i64>,
    start_when: Option<i64>,
    duration: i64,
    completed: bool,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = request_trackers)]
pub(super) struct NewTrackerRow {
    request_id: String,
    lifecycle_id: i64,
    last_timing_id: Option<i64>,
    start_when: Option<i64>,
    duration: i64,
    completed: bool,
}

impl From<TrackerRow> for RequestTracker {
    fn from(row: TrackerRow) -> Self {
        RequestTracker {
            id: row.id,
            request_id: row.request_id,
            lifecycle_id: row.lifecycle_id,
            last_timing_id: row.last_timing_id,
            start: stamp(row.start_when),
            duration: row.duration,
            completed: row.completed,
        }
    }
}

impl From<RequestTracker> for TrackerRow {
    fn from(t: RequestTracker) -> Self {
        TrackerRow {
            id: t.id,
            request_id: t.request_id,
            lifecycle_id: t.lifecycle_id,
            last_timing_id: t.last_timing_id,
            start_when: micros(t.start),
            duration: t.duration,
            completed: t.completed,
        }
    }
}

impl From<RequestTracker> for NewTrackerRow {
    fn from(t: RequestTracker) -> Self {
        NewTrackerRow {
            request_id: t.request_id,
            lifecycle_id: t.lifecycle_id,
            last_timing_id: t.last_timing_id,
            start_when: micros(t.start),
            duration: t.duration,
            completed: t.completed,
        }
    }
}

#[derive(Debug, Queryable, Selectable, AsChangeset)]
#[diesel(table_name = instance_usages, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub(super) struct UsageRow {
    pub id: i64,
    instance: String,
    launched_at: Option<i64>,
    request_id: Option<String>,
    instance_type_id: Option<String>,
    instance_flavor_id: Option<String>,
    tenant: Option<String>,
    os_architecture: Option<String>,
    os_distro: Option<String>,
    os_version: Option<String>,
    rax_options: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = instance_usages)]
pub(super) struct NewUsageRow {
    instance: String,
    launched_at: Option<i64>,
    request_id: Option<String>,
    instance_type_id: Option<String>,
    instance_flavor_id: Option<String>,
    tenant: Option<String>,
    os_architecture: Option<String>,
    os_distro: Option<String>,
    os_version: Option<String>,
    rax_options: Option<String>,
}

impl From<UsageRow> for InstanceUsage {
    fn from(row: UsageRow) -> Self {
        InstanceUsage {
            id: row.id,
            instance: row.instance,
            launched_at: stamp(row.launched_at),
            request_id: row.request_id,
            instance_type_id: row.instance_type_id,
            instance_flavor_id: row.instance_flavor_id,
            tenant: row.tenant,
            meta: ImageMeta {
                os_architecture: row.os_architecture,
                os_distro: row.os_distro,
                os_version: row.os_version,
                rax_options: row.rax_options,
            },
        }
    }
}

impl From<InstanceUsage> for UsageRow {
    fn from(u: InstanceUsage) -> Self {
        UsageRow {
            id: u.id,
            instance: u.instance,
            launched_at: micros(u.launched_at),
            request_id: u.request_id,
            instance_type_id: u.instance_type_id,
            instance_flavor_id: u.instance_flavor_id,
            tenant: u.tenant,
            os_architecture: u.meta.os_architecture,
            os_distro: u.meta.os_distro,
            os_version: u.meta.os_version,
            rax_options: u.meta.rax_options,
        }
    }
}

impl From<InstanceUsage> for NewUsageRow {
    fn from(u: InstanceUsage) -> Self {
        NewUsageRow {
            instance: u.instance,
            launched_at: micros(u.launched_at),
            request_id: u.request_id,
            instance_type_id: u.instance_type_id,
            instance_flavor_id: u.instance_flavor_id,
            tenant: u.tenant,
            os_architecture: u.meta.os_architecture,
            os_distro: u.meta.os_distro,
            os_version: u.meta.os_version,
            rax_options: u.meta.rax_options,
        }
    }
}

#[derive(Debug, Queryable, Selectable, AsChangeset)]
#[diesel(table_name = instance_deletes, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub(super) struct DeleteRow {
    pub id: i64,
    instance: String,
    launched_at: Option<i64>,
    deleted_at: Option<i64>,
    raw_id: Option<i64>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = instance_deletes)]
pub(super) struct NewDeleteRow {
    instance: String,
    launched_at: Option<i64>,
    deleted_at: Option<i64>,
    raw_id: Option<i64>,
}

impl From<DeleteRow> for InstanceDelete {
    fn from(row: DeleteRow) -> Self {
        InstanceDelete {
            id: row.id,
            instance: row.instance,
            launched_at: stamp(row.launched_at),
            deleted_at: stamp(row.deleted_at),
            raw_id: row.raw_id,
        }
    }
}

impl From<InstanceDelete> for DeleteRow {
    fn from(d: InstanceDelete) -> Self {
        DeleteRow {
            id: d.id,
            instance: d.instance,
            launched_at: micros(d.launched_at),
            deleted_at: micros(d.deleted_at),
            raw_id: d.raw_id,
        }
    }
}

impl From<InstanceDelete> for NewDeleteRow {
    fn from(d: InstanceDelete) -> Self {
        NewDeleteRow {
            instance: d.instance,
            launched_at: micros(d.launched_at),
            deleted_at: micros(d.deleted_at),
            raw_id: d.raw_id,
        }
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = instance_exists, check_for_backend(diesel::pg::Pg))]
pub(super) struct ExistsRow {
    id: i64,
    instance: String,
    launched_at: Option<i64>,
    deleted_at: Option<i64>,
    audit_period_beginning: Option<i64>,
    audit_period_ending: Option<i64>,
    instance_type_id: Option<String>,
    instance_flavor_id: Option<String>,
    message_id: Option<String>,
    tenant: Option<String>,
    os_architecture: Option<String>,
    os_distro: Option<String>,
    os_version: Option<String>,
    rax_options: Option<String>,
    status: String,
    send_status: i32,
    fail_reason: Option<String>,
    raw_id: Option<i64>,
    usage_id: Option<i64>,
    delete_id: Option<i64>,
}

impl TryFrom<ExistsRow> for InstanceExists {
    type Error = StoreError;

    fn try_from(row: ExistsRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(StoreError::Corrupt)?;
        Ok(InstanceExists {
            id: row.id,
            instance: row.instance,
            launched_at: stamp(row.launched_at),
            deleted_at: stamp(row.deleted_at),
            audit_period_beginning: stamp(row.audit_period_beginning),
            audit_period_ending: stamp(row.audit_period_ending),
            instance_type_id: row.instance_type_id,
            instance_flavor_id: row.instance_flavor_id,
            message_id: row.message_id,
            tenant: row.tenant,
            meta: ImageMeta {
                os_architecture: row.os_architecture,
                os_distro: row.os_distro,
                os_version: row.os_version,
                rax_options: row.rax_options,
            },
            status,
            send_status: row.send_status,
            fail_reason: row.fail_reason,
            raw_id: row.raw_id,
            usage_id: row.usage_id,
            delete_id: row.delete_id,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = instance_exists)]
pub(super) struct NewExistsRow {
    instance: String,
    launched_at: Option<i64>,
    deleted_at: Option<i64>,
    audit_period_beginning: Option<i64>,
    audit_period_ending: Option<i64>,
    instance_type_id: Option<String>,
    instance_flavor_id: Option<String>,
    message_id: Option<String>,
    tenant: Option<String>,
    os_architecture: Option<String>,
    os_distro: Option<String>,
    os_version: Option<String>,
    rax_options: Option<String>,
    status: String,
    raw_id: Option<i64>,
    usage_id: Option<i64>,
    delete_id: Option<i64>,
}

impl From<NewInstanceExists> for NewExistsRow {
    fn from(e: NewInstanceExists) -> Self {
        NewExistsRow {
            instance: e.instance,
            launched_at: micros(e.launched_at),
            deleted_at: micros(e.deleted_at),
            audit_period_beginning: micros(e.audit_period_beginning),
            audit_period_ending: micros(e.audit_period_ending),
            instance_type_id: e.instance_type_id,
            instance_flavor_id: e.instance_flavor_id,
            message_id: e.message_id,
            tenant: e.tenant,
            os_architecture: e.meta.os_architecture,
            os_distro: e.meta.os_distro,
            os_version: e.meta.os_version,
            rax_options: e.meta.rax_options,
            status: e.status.as_str().to_string(),
            raw_id: e.raw_id,
            usage_id: e.usage_id,
            delete_id: e.delete_id,
        }
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = instance_reconciles, check_for_backend(diesel::pg::Pg))]
pub(super) struct ReconcileRow {
    id: i64,
    instance: String,
    launched_at: Option<i64>,
    deleted_at: Option<i64>,
    instance_type_id: Option<String>,
    instance_flavor_id: Option<String>,
    tenant: Option<String>,
    os_architecture: Option<String>,
    os_distro: Option<String>,
    os_version: Option<String>,
    rax_options: Option<String>,
    source: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = instance_reconciles)]
pub(super) struct NewReconcileRow {
    instance: String,
    launched_at: Option<i64>,
    deleted_at: Option<i64>,
    instance_type_id: Option<String>,
    instance_flavor_id: Option<String>,
    tenant: Option<String>,
    os_architecture: Option<String>,
    os_distro: Option<String>,
    os_version: Option<String>,
    rax_options: Option<String>,
    source: String,
}

impl From<ReconcileRow> for InstanceReconcile {
    fn from(row: ReconcileRow) -> Self {
        InstanceReconcile {
            id: row.id,
            instance: row.instance,
            launched_at: stamp(row.launched_at),
            deleted_at: stamp(row.deleted_at),
            instance_type_id: row.instance_type_id,
            instance_flavor_id: row.instance_flavor_id,
            tenant: row.tenant,
            meta: ImageMeta {
                os_architecture: row.os_architecture,
                os_distro: row.os_distro,
                os_version: row.os_version,
                rax_options: row.rax_options,
            },
            source: row.source,
        }
    }
}

impl From<InstanceReconcile> for NewReconcileRow {
    fn from(r: InstanceReconcile) -> Self {
        NewReconcileRow {
            instance: r.instance,
            launched_at: micros(r.launched_at),
            deleted_at: micros(r.deleted_at),
            instance_type_id: r.instance_type_id,
            instance_flavor_id: r.instance_flavor_id,
            tenant: r.tenant,
            os_architecture: r.meta.os_architecture,
            os_distro: r.meta.os_distro,
            os_version: r.meta.os_version,
            rax_options: r.meta.rax_options,
            source: r.source,
        }
    }
}
