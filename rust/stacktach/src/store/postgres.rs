//! PostgreSQL store on top of the diesel-async pool.

use super::rows::{
    DeleteRow, ExistsRow, LifecycleRow, NewDeleteRow, NewExistsRow, NewLifecycleRow, NewRawRow,
    NewReconcileRow, NewTimingRow, NewTrackerRow, NewUsageRow, RawRow, ReconcileRow, TimingRow,
    TrackerRow, UsageRow,
};
use super::{DeleteKey, Store, Transaction};
use crate::db::{PgConnectionManager, PgPool};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ExistsStatus, InstanceDelete, InstanceExists, InstanceReconcile, InstanceUsage, Lifecycle,
    NewInstanceExists, NewRawRecord, RawId, RawRecord, RequestTracker, Timing,
};
use crate::schema::{
    deployments, instance_deletes, instance_exists, instance_reconciles, instance_usages,
    lifecycles, raw_records, request_trackers, timings,
};
use crate::time::Timestamp;
use async_trait::async_trait;
use bb8::PooledConnection;
use diesel::prelude::*;
use diesel::PgExpressionMethods;
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use tracing::warn;

type OwnedConn = PooledConnection<'static, PgConnectionManager>;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let mut conn = self.pool.get_owned().await?;
        conn.batch_execute("BEGIN").await?;
        Ok(Box::new(PgTransaction { conn: Some(conn) }))
    }
}

struct PgTransaction {
    conn: Option<OwnedConn>,
}

impl PgTransaction {
    fn conn(&mut self) -> StoreResult<&mut AsyncPgConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| StoreError::Pool("transaction already finished".into()))
    }

    async fn end(&mut self, statement: &str) -> StoreResult<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| StoreError::Pool("transaction already finished".into()))?;
        conn.batch_execute(statement).await?;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = conn.batch_execute("ROLLBACK").await {
                        warn!(error = %err, "rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => warn!("transaction dropped outside the runtime; connection discarded"),
        }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.end("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.end("ROLLBACK").await
    }

    async fn deployment_id(&mut self, name: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        let found: Option<i64> = deployments::table
            .filter(deployments::name.eq(name))
            .select(deployments::id)
            .first(conn)
            .await
            .optional()?;
        if let Some(id) = found {
            return Ok(id);
        }
        let id = diesel::insert_into(deployments::table)
            .values(deployments::name.eq(name))
            .on_conflict(deployments::name)
            .do_update()
            .set(deployments::name.eq(name))
            .returning(deployments::id)
            .get_result(conn)
            .await?;
        Ok(id)
    }

    async fn deployment_name(&mut self, id: i64) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        Ok(deployments::table
            .find(id)
            .select(deployments::name)
            .first(conn)
            .await
            .optional()?)
    }

    async fn insert_raw(&mut self, raw: NewRawRecord) -> StoreResult<RawRecord> {
        let conn = self.conn()?;
        let row: RawRow = diesel::insert_into(raw_records::table)
            .values(NewRawRow::from(raw))
            .returning(RawRow::as_returning())
            .get_result(conn)
            .await?;
        Ok(row.into())
    }

    async fn get_raw(&mut self, id: RawId) -> StoreResult<Option<RawRecord>> {
        let conn = self.conn()?;
        let row = raw_records::table
            .find(id)
            .select(RawRow::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn lifecycle_for(&mut self, instance: &str) -> StoreResult<Option<Lifecycle>> {
        let conn = self.conn()?;
        let row = lifecycles::table
            .filter(lifecycles::instance.eq(instance))
            .select(LifecycleRow::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn save_lifecycle(&mut self, lifecycle: Lifecycle) -> StoreResult<Lifecycle> {
        let conn = self.conn()?;
        let row: LifecycleRow = if lifecycle.id == 0 {
            diesel::insert_into(lifecycles::table)
                .values(NewLifecycleRow::from(lifecycle))
                .returning(LifecycleRow::as_returning())
                .get_result(conn)
                .await?
        } else {
            let row = LifecycleRow::from(lifecycle);
            diesel::update(lifecycles::table.find(row.id))
                .set(&row)
                .returning(LifecycleRow::as_returning())
                .get_result(conn)
                .await?
        };
        Ok(row.into())
    }

    async fn timings_named(&mut self, lifecycle_id: i64, name: &str) -> StoreResult<Vec<Timing>> {
        let conn = self.conn()?;
        let rows: Vec<TimingRow> = timings::table
            .filter(timings::lifecycle_id.eq(lifecycle_id))
            .filter(timings::name.eq(name))
            .order(timings::id.asc())
            .select(TimingRow::as_select())
            .load(conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_timing(&mut self, timing: Timing) -> StoreResult<Timing> {
        let conn = self.conn()?;
        let row: TimingRow = if timing.id == 0 {
            diesel::insert_into(timings::table)
                .values(NewTimingRow::from(timing))
                .returning(TimingRow::as_returning())
                .get_result(conn)
                .await?
        } else {
            let row = TimingRow::from(timing);
            diesel::update(timings::table.find(row.id))
                .set(&row)
                .returning(TimingRow::as_returning())
                .get_result(conn)
                .await?
        };
        Ok(row.into())
    }

    async fn tracker_for(&mut self, request_id: &str) -> StoreResult<Option<RequestTracker>> {
        let conn = self.conn()?;
        let row = request_trackers::table
            .filter(request_trackers::request_id.eq(request_id))
            .select(TrackerRow::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn save_tracker(&mut self, tracker: RequestTracker) -> StoreResult<RequestTracker> {
        let conn = self.conn()?;
        let row: TrackerRow = if tracker.id == 0 {
            diesel::insert_into(request_trackers::table)
                .values(NewTrackerRow::from(tracker))
                .returning(TrackerRow::as_returning())
                .get_result(conn)
                .await?
        } else {
            let row = TrackerRow::from(tracker);
            diesel::update(request_trackers::table.find(row.id))
                .set(&row)
                .returning(TrackerRow::as_returning())
                .get_result(conn)
                .await?
        };
        Ok(row.into())
    }

    async fn usage_for_request(
        &mut self,
        instance: &str,
        request_id: Option<&str>,
    ) -> StoreResult<Option<InstanceUsage>> {
        let conn = self.conn()?;
        let row = instance_usages::table
            .filter(instance_usages::instance.eq(instance))
            .filter(instance_usages::request_id.is_not_distinct_from(request_id))
            .order(instance_usages::id.asc())
            .select(UsageRow::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn usages_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> StoreResult<Vec<InstanceUsage>> {
        let conn = self.conn()?;
        let rows: Vec<UsageRow> = instance_usages::table
            .filter(instance_usages::instance.eq(instance))
            .filter(instance_usages::launched_at.between(from.as_micros(), to.as_micros()))
            .order(instance_usages::id.asc())
            .select(UsageRow::as_select())
            .load(conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_usage(&mut self, id: i64) -> StoreResult<Option<InstanceUsage>> {
        let conn = self.conn()?;
        let row = instance_usages::table
            .find(id)
            .select(UsageRow::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn save_usage(&mut self, usage: InstanceUsage) -> StoreResult<InstanceUsage> {
        let conn = self.conn()?;
        let row: UsageRow = if usage.id == 0 {
            diesel::insert_into(instance_usages::table)
                .values(NewUsageRow::from(usage))
                .returning(UsageRow::as_returning())
                .get_result(conn)
                .await?
        } else {
            let row = UsageRow::from(usage);
            diesel::update(instance_usages::table.find(row.id))
                .set(&row)
                .returning(UsageRow::as_returning())
                .get_result(conn)
                .await?
        };
        Ok(row.into())
    }

    async fn delete_for(
        &mut self,
        instance: &str,
        key: DeleteKey,
    ) -> StoreResult<Option<InstanceDelete>> {
        let conn = self.conn()?;
        let mut query = instance_deletes::table
            .filter(instance_deletes::instance.eq(instance))
            .into_boxed();
        query = match key {
            DeleteKey::LaunchedAt(ts) => {
                query.filter(instance_deletes::launched_at.eq(ts.as_micros()))
            }
            DeleteKey::DeletedAt(ts) => query
                .filter(instance_deletes::launched_at.is_null())
                .filter(instance_deletes::deleted_at.eq(ts.as_micros())),
        };
        let row = query
            .order(instance_deletes::id.asc())
            .select(DeleteRow::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn deletes_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
        deleted_max: Option<Timestamp>,
    ) -> StoreResult<Vec<InstanceDelete>> {
        let conn = self.conn()?;
        let mut query = instance_deletes::table
            .filter(instance_deletes::instance.eq(instance))
            .filter(instance_deletes::launched_at.between(from.as_micros(), to.as_micros()))
            .into_boxed();
        if let Some(max) = deleted_max {
            query = query.filter(instance_deletes::deleted_at.le(max.as_micros()));
        }
        let rows: Vec<DeleteRow> = query
            .order(instance_deletes::id.asc())
            .select(DeleteRow::as_select())
            .load(conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_delete(&mut self, id: i64) -> StoreResult<Option<InstanceDelete>> {
        let conn = self.conn()?;
        let row = instance_deletes::table
            .find(id)
            .select(DeleteRow::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn save_delete(&mut self, delete: InstanceDelete) -> StoreResult<InstanceDelete> {
        let conn = self.conn()?;
        let row: DeleteRow = if delete.id == 0 {
            diesel::insert_into(instance_deletes::table)
                .values(NewDeleteRow::from(delete))
                .returning(DeleteRow::as_returning())
                .get_result(conn)
                .await?
        } else {
            let row = DeleteRow::from(delete);
            diesel::update(instance_deletes::table.find(row.id))
                .set(&row)
                .returning(DeleteRow::as_returning())
                .get_result(conn)
                .await?
        };
        Ok(row.into())
    }

    async fn exists_with_message(
        &mut self,
        instance: &str,
        message_id: &str,
    ) -> StoreResult<Option<InstanceExists>> {
        let conn = self.conn()?;
        let row = instance_exists::table
            .filter(instance_exists::instance.eq(instance))
            .filter(instance_exists::message_id.eq(message_id))
            .select(ExistsRow::as_select())
            .first(conn)
            .await
            .optional()?;
        row.map(TryInto::try_into).transpose()
    }

    async fn live_exists_for_period(
        &mut self,
        instance: &str,
        beginning: Option<Timestamp>,
        ending: Option<Timestamp>,
    ) -> StoreResult<Option<InstanceExists>> {
        let conn = self.conn()?;
        let live = [
            ExistsStatus::Pending.as_str(),
            ExistsStatus::Verifying.as_str(),
            ExistsStatus::Verified.as_str(),
        ];
        let row = instance_exists::table
            .filter(instance_exists::instance.eq(instance))
            .filter(
                instance_exists::audit_period_beginning
                    .is_not_distinct_from(beginning.map(Timestamp::as_micros)),
            )
            .filter(
                instance_exists::audit_period_ending
                    .is_not_distinct_from(ending.map(Timestamp::as_micros)),
            )
            .filter(instance_exists::status.eq_any(live))
            .order(instance_exists::id.asc())
            .select(ExistsRow::as_select())
            .first(conn)
            .await
            .optional()?;
        row.map(TryInto::try_into).transpose()
    }

    async fn insert_exists(&mut self, exists: NewInstanceExists) -> StoreResult<InstanceExists> {
        let conn = self.conn()?;
        let row: ExistsRow = diesel::insert_into(instance_exists::table)
            .values(NewExistsRow::from(exists))
            .returning(ExistsRow::as_returning())
            .get_result(conn)
            .await?;
        row.try_into()
    }

    async fn get_exists(&mut self, id: i64) -> StoreResult<Option<InstanceExists>> {
        let conn = self.conn()?;
        let row = instance_exists::table
            .find(id)
            .select(ExistsRow::as_select())
            .first(conn)
            .await
            .optional()?;
        row.map(TryInto::try_into).transpose()
    }

    async fn claim_exists(
        &mut self,
        ending_max: Timestamp,
        from: ExistsStatus,
        to: ExistsStatus,
    ) -> StoreResult<Vec<i64>> {
        let conn = self.conn()?;
        let mut ids: Vec<i64> = diesel::update(
            instance_exists::table
                .filter(instance_exists::status.eq(from.as_str()))
                .filter(instance_exists::audit_period_ending.le(ending_max.as_micros())),
        )
        .set(instance_exists::status.eq(to.as_str()))
        .returning(instance_exists::id)
        .get_results(conn)
        .await?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn set_exists_status(
        &mut self,
        id: i64,
        status: ExistsStatus,
        fail_reason: Option<&str>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let target = instance_exists::table
            .find(id)
            .filter(instance_exists::status.ne(ExistsStatus::Verified.as_str()))
            .filter(instance_exists::status.ne(ExistsStatus::Reconciled.as_str()));
        let changed = match fail_reason {
            Some(reason) => {
                diesel::update(target)
                    .set((
                        instance_exists::status.eq(status.as_str()),
                        instance_exists::fail_reason.eq(reason),
                    ))
                    .execute(conn)
                    .await?
            }
            None => {
                diesel::update(target)
                    .set(instance_exists::status.eq(status.as_str()))
                    .execute(conn)
                    .await?
            }
        };
        if changed > 0 {
            return Ok(true);
        }
        let present: i64 = instance_exists::table
            .find(id)
            .count()
            .get_result(conn)
            .await?;
        if present == 0 {
            return Err(StoreError::missing("instance exists", id));
        }
        Ok(false)
    }

    async fn set_send_status(&mut self, id: i64, send_status: i32) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = diesel::update(instance_exists::table.find(id))
            .set(instance_exists::send_status.eq(send_status))
            .execute(conn)
            .await?;
        if changed == 0 {
            return Err(StoreError::missing("instance exists", id));
        }
        Ok(())
    }

    async fn demote_exists(&mut self, from: ExistsStatus, to: ExistsStatus) -> StoreResult<u64> {
        let conn = self.conn()?;
        let stuck = instance_exists::table.filter(instance_exists::status.eq(from.as_str()));
        let moved = diesel::update(stuck)
            .set(instance_exists::status.eq(to.as_str()))
            .execute(conn)
            .await?;
        Ok(moved as u64)
    }

    async fn reconciles_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> StoreResult<Vec<InstanceReconcile>> {
        let conn = self.conn()?;
        let rows: Vec<ReconcileRow> = instance_reconciles::table
            .filter(instance_reconciles::instance.eq(instance))
            .filter(instance_reconciles::launched_at.between(from.as_micros(), to.as_micros()))
            .order(instance_reconciles::id.asc())
            .select(ReconcileRow::as_select())
            .load(conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_reconcile(
        &mut self,
        reconcile: InstanceReconcile,
    ) -> StoreResult<InstanceReconcile> {
        let conn = self.conn()?;
        let row: ReconcileRow = diesel::insert_into(instance_reconciles::table)
            .values(NewReconcileRow::from(reconcile))
            .returning(ReconcileRow::as_returning())
            .get_result(conn)
            .await?;
        Ok(row.into())
    }
}
