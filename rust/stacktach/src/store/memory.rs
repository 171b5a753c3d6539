//! In-process store. Transactions take the whole-store lock and work on a
//! private copy that replaces the shared tables on commit, so at most one
//! transaction is open at a time.

use super::{DeleteKey, Store, Transaction};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Deployment, ExistsStatus, InstanceDelete, InstanceExists, InstanceReconcile, InstanceUsage,
    Lifecycle, NewInstanceExists, NewRawRecord, RawId, RawRecord, RequestTracker, Timing,
};
use crate::time::Timestamp;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone)]
struct Table<T> {
    rows: BTreeMap<i64, T>,
    last_id: i64,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            last_id: 0,
        }
    }
}

impl<T: Clone> Table<T> {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn get(&self, id: i64) -> Option<T> {
        self.rows.get(&id).cloned()
    }

    fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        self.rows.values().find(|row| pred(row)).cloned()
    }

    fn filter(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        self.rows.values().filter(|row| pred(row)).cloned().collect()
    }

    /// Inserts when `id == 0`, otherwise replaces the existing row.
    fn save(
        &mut self,
        entity: &'static str,
        id: i64,
        row: impl FnOnce(i64) -> T,
    ) -> StoreResult<T> {
        let id = if id == 0 {
            self.next_id()
        } else if self.rows.contains_key(&id) {
            id
        } else {
            return Err(StoreError::missing(entity, id));
        };
        let row = row(id);
        self.rows.insert(id, row.clone());
        Ok(row)
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    deployments: Table<Deployment>,
    raws: Table<RawRecord>,
    lifecycles: Table<Lifecycle>,
    timings: Table<Timing>,
    trackers: Table<RequestTracker>,
    usages: Table<InstanceUsage>,
    deletes: Table<InstanceDelete>,
    exists: Table<InstanceExists>,
    reconciles: Table<InstanceReconcile>,
}

/// Committed contents of a [`MemoryStore`], ordered by id.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub raws: Vec<RawRecord>,
    pub lifecycles: Vec<Lifecycle>,
    pub timings: Vec<Timing>,
    pub trackers: Vec<RequestTracker>,
    pub usages: Vec<InstanceUsage>,
    pub deletes: Vec<InstanceDelete>,
    pub exists: Vec<InstanceExists>,
    pub reconciles: Vec<InstanceReconcile>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Snapshot {
        let tables = self.tables.lock().await;
        Snapshot {
            raws: tables.raws.filter(|_| true),
            lifecycles: tables.lifecycles.filter(|_| true),
            timings: tables.timings.filter(|_| true),
            trackers: tables.trackers.filter(|_| true),
            usages: tables.usages.filter(|_| true),
            deletes: tables.deletes.filter(|_| true),
            exists: tables.exists.filter(|_| true),
            reconciles: tables.reconciles.filter(|_| true),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, work }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

fn in_window(value: Option<Timestamp>, from: Timestamp, to: Timestamp) -> bool {
    value.is_some_and(|ts| ts >= from && ts <= to)
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }

    async fn deployment_id(&mut self, name: &str) -> StoreResult<i64> {
        if let Some(found) = self.work.deployments.find(|d| d.name == name) {
            return Ok(found.id);
        }
        let created = self.work.deployments.save("deployment", 0, |id| Deployment {
            id,
            name: name.to_string(),
        })?;
        Ok(created.id)
    }

    async fn deployment_name(&mut self, id: i64) -> StoreResult<Option<String>> {
        Ok(self.work.deployments.get(id).map(|d| d.name))
    }

    async fn insert_raw(&mut self, raw: NewRawRecord) -> StoreResult<RawRecord> {
        self.work
            .raws
            .save("raw record", 0, |id| RawRecord::from_new(id, raw))
    }

    async fn get_raw(&mut self, id: RawId) -> StoreResult<Option<RawRecord>> {
        Ok(self.work.raws.get(id))
    }

    async fn lifecycle_for(&mut self, instance: &str) -> StoreResult<Option<Lifecycle>> {
        Ok(self.work.lifecycles.find(|l| l.instance == instance))
    }

    async fn save_lifecycle(&mut self, lifecycle: Lifecycle) -> StoreResult<Lifecycle> {
        let current = lifecycle.id;
        self.work
            .lifecycles
            .save("lifecycle", current, |id| Lifecycle { id, ..lifecycle })
    }

    async fn timings_named(&mut self, lifecycle_id: i64, name: &str) -> StoreResult<Vec<Timing>> {
        Ok(self
            .work
            .timings
            .filter(|t| t.lifecycle_id == lifecycle_id && t.name == name))
    }

    async fn save_timing(&mut self, timing: Timing) -> StoreResult<Timing> {
        let current = timing.id;
        self.work
            .timings
            .save("timing", current, |id| Timing { id, ..timing })
    }

    async fn tracker_for(&mut self, request_id: &str) -> StoreResult<Option<RequestTracker>> {
        Ok(self.work.trackers.find(|t| t.request_id == request_id))
    }

    async fn save_tracker(&mut self, tracker: RequestTracker) -> StoreResult<RequestTracker> {
        let current = tracker.id;
        self.work
            .trackers
            .save("request tracker", current, |id| RequestTracker { id, ..tracker })
    }

    async fn usage_for_request(
        &mut self,
        instance: &str,
        request_id: Option<&str>,
    ) -> StoreResult<Option<InstanceUsage>> {
        Ok(self
            .work
            .usages
            .find(|u| u.instance == instance && u.request_id.as_deref() == request_id))
    }

    async fn usages_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> StoreResult<Vec<InstanceUsage>> {
        Ok(self
            .work
            .usages
            .filter(|u| u.instance == instance && in_window(u.launched_at, from, to)))
    }

    async fn get_usage(&mut self, id: i64) -> StoreResult<Option<InstanceUsage>> {
        Ok(self.work.usages.get(id))
    }

    async fn save_usage(&mut self, usage: InstanceUsage) -> StoreResult<InstanceUsage> {
        let current = usage.id;
        self.work
            .usages
            .save("instance usage", current, |id| InstanceUsage { id, ..usage })
    }

    async fn delete_for(
        &mut self,
        instance: &str,
        key: DeleteKey,
    ) -> StoreResult<Option<InstanceDelete>> {
        Ok(self.work.deletes.find(|d| {
            d.instance == instance
                && match key {
                    DeleteKey::LaunchedAt(ts) => d.launched_at == Some(ts),
                    DeleteKey::DeletedAt(ts) => d.launched_at.is_none() && d.deleted_at == Some(ts),
                }
        }))
    }

    async fn deletes_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
        deleted_max: Option<Timestamp>,
    ) -> StoreResult<Vec<InstanceDelete>> {
        Ok(self.work.deletes.filter(|d| {
            d.instance == instance
                && in_window(d.launched_at, from, to)
                && match deleted_max {
                    Some(max) => d.deleted_at.is_some_and(|deleted| deleted <= max),
                    None => true,
                }
        }))
    }

    async fn get_delete(&mut self, id: i64) -> StoreResult<Option<InstanceDelete>> {
        Ok(self.work.deletes.get(id))
    }

    async fn save_delete(&mut self, delete: InstanceDelete) -> StoreResult<InstanceDelete> {
        let current = delete.id;
        self.work
            .deletes
            .save("instance delete", current, |id| InstanceDelete { id, ..delete })
    }

    async fn exists_with_message(
        &mut self,
        instance: &str,
        message_id: &str,
    ) -> StoreResult<Option<InstanceExists>> {
        Ok(self.work.exists.find(|e| {
            e.instance == instance && e.message_id.as_deref() == Some(message_id)
        }))
    }

    async fn live_exists_for_period(
        &mut self,
        instance: &str,
        beginning: Option<Timestamp>,
        ending: Option<Timestamp>,
    ) -> StoreResult<Option<InstanceExists>> {
        Ok(self.work.exists.find(|e| {
            e.instance == instance
                && e.audit_period_beginning == beginning
                && e.audit_period_ending == ending
                && e.status.is_live()
        }))
    }

    async fn insert_exists(&mut self, exists: NewInstanceExists) -> StoreResult<InstanceExists> {
        self.work
            .exists
            .save("instance exists", 0, |id| InstanceExists::from_new(id, exists))
    }

    async fn get_exists(&mut self, id: i64) -> StoreResult<Option<InstanceExists>> {
        Ok(self.work.exists.get(id))
    }

    async fn claim_exists(
        &mut self,
        ending_max: Timestamp,
        from: ExistsStatus,
        to: ExistsStatus,
    ) -> StoreResult<Vec<i64>> {
        let mut claimed = Vec::new();
        for row in self.work.exists.rows.values_mut() {
            let settled = row.audit_period_ending.is_some_and(|end| end <= ending_max);
            if row.status == from && settled {
                row.status = to;
                claimed.push(row.id);
            }
        }
        Ok(claimed)
    }

    async fn set_exists_status(
        &mut self,
        id: i64,
        status: ExistsStatus,
        fail_reason: Option<&str>,
    ) -> StoreResult<bool> {
        let row = self
            .work
            .exists
            .rows
            .get_mut(&id)
            .ok_or(StoreError::missing("instance exists", id))?;
        if row.status.is_final() {
            return Ok(false);
        }
        row.status = status;
        if let Some(reason) = fail_reason {
            row.fail_reason = Some(reason.to_string());
        }
        Ok(true)
    }

    async fn set_send_status(&mut self, id: i64, send_status: i32) -> StoreResult<()> {
        let row = self
            .work
            .exists
            .rows
            .get_mut(&id)
            .ok_or(StoreError::missing("instance exists", id))?;
        row.send_status = send_status;
        Ok(())
    }

    async fn demote_exists(&mut self, from: ExistsStatus, to: ExistsStatus) -> StoreResult<u64> {
        let mut moved = 0;
        for row in self.work.exists.rows.values_mut() {
            if row.status == from {
                row.status = to;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn reconciles_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> StoreResult<Vec<InstanceReconcile>> {
        Ok(self
            .work
            .reconciles
            .filter(|r| r.instance == instance && in_window(r.launched_at, from, to)))
    }

    async fn insert_reconcile(
        &mut self,
        reconcile: InstanceReconcile,
    ) -> StoreResult<InstanceReconcile> {
        self.work
            .reconciles
            .save("instance reconcile", 0, |id| InstanceReconcile { id, ..reconcile })
    }
}
