//! Persistence seam.
//!
//! Every unit of work (one ingested message, one verifier claim, one verified
//! exist) runs inside a single [`Transaction`]. Dropping a transaction without
//! committing discards its writes.

mod memory;
mod postgres;
mod rows;

pub use memory::{MemoryStore, Snapshot};
pub use postgres::PgStore;

use crate::error::StoreResult;
use crate::models::{
    ExistsStatus, InstanceDelete, InstanceExists, InstanceReconcile, InstanceUsage, Lifecycle,
    NewInstanceExists, NewRawRecord, RawId, RawRecord, RequestTracker, Timing,
};
use crate::time::Timestamp;
use async_trait::async_trait;

/// Lookup key for the delete upsert: the launch it ends, or the deletion
/// time when the notification carried no launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKey {
    LaunchedAt(Timestamp),
    DeletedAt(Timestamp),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;
}

#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;

    /// Returns the id of the named deployment, creating it on first use.
    async fn deployment_id(&mut self, name: &str) -> StoreResult<i64>;
    async fn deployment_name(&mut self, id: i64) -> StoreResult<Option<String>>;

    async fn insert_raw(&mut self, raw: NewRawRecord) -> StoreResult<RawRecord>;
    async fn get_raw(&mut self, id: RawId) -> StoreResult<Option<RawRecord>>;

    async fn lifecycle_for(&mut self, instance: &str) -> StoreResult<Option<Lifecycle>>;
    /// Inserts when `id == 0`, updates otherwise.
    async fn save_lifecycle(&mut self, lifecycle: Lifecycle) -> StoreResult<Lifecycle>;
    /// Timings of one operation on a lifecycle, oldest first.
    async fn timings_named(&mut self, lifecycle_id: i64, name: &str) -> StoreResult<Vec<Timing>>;
    async fn save_timing(&mut self, timing: Timing) -> StoreResult<Timing>;
    async fn tracker_for(&mut self, request_id: &str) -> StoreResult<Option<RequestTracker>>;
    async fn save_tracker(&mut self, tracker: RequestTracker) -> StoreResult<RequestTracker>;

    async fn usage_for_request(
        &mut self,
        instance: &str,
        request_id: Option<&str>,
    ) -> StoreResult<Option<InstanceUsage>>;
    /// Usages whose `launched_at` falls in `[from, to]`.
    async fn usages_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> StoreResult<Vec<InstanceUsage>>;
    async fn get_usage(&mut self, id: i64) -> StoreResult<Option<InstanceUsage>>;
    async fn save_usage(&mut self, usage: InstanceUsage) -> StoreResult<InstanceUsage>;

    async fn delete_for(&mut self, instance: &str, key: DeleteKey)
        -> StoreResult<Option<InstanceDelete>>;
    /// Deletes whose `launched_at` falls in `[from, to]`, optionally limited
    /// to those deleted no later than `deleted_max`.
    async fn deletes_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
        deleted_max: Option<Timestamp>,
    ) -> StoreResult<Vec<InstanceDelete>>;
    async fn get_delete(&mut self, id: i64) -> StoreResult<Option<InstanceDelete>>;
    async fn save_delete(&mut self, delete: InstanceDelete) -> StoreResult<InstanceDelete>;

    async fn exists_with_message(
        &mut self,
        instance: &str,
        message_id: &str,
    ) -> StoreResult<Option<InstanceExists>>;
    /// A pending, verifying or verified exist covering the same audit period.
    async fn live_exists_for_period(
        &mut self,
        instance: &str,
        beginning: Option<Timestamp>,
        ending: Option<Timestamp>,
    ) -> StoreResult<Option<InstanceExists>>;
    async fn insert_exists(&mut self, exists: NewInstanceExists) -> StoreResult<InstanceExists>;
    async fn get_exists(&mut self, id: i64) -> StoreResult<Option<InstanceExists>>;
    /// Moves every exist in `from` whose audit period ended by `ending_max`
    /// into `to` and returns their ids in ascending order.
    async fn claim_exists(
        &mut self,
        ending_max: Timestamp,
        from: ExistsStatus,
        to: ExistsStatus,
    ) -> StoreResult<Vec<i64>>;
    /// Sets the status unless the exist already sits in a final status.
    /// Returns whether the row changed.
    async fn set_exists_status(
        &mut self,
        id: i64,
        status: ExistsStatus,
        fail_reason: Option<&str>,
    ) -> StoreResult<bool>;
    async fn set_send_status(&mut self, id: i64, send_status: i32) -> StoreResult<()>;
    /// Moves every exist in `from` to `to`, returning the count.
    async fn demote_exists(&mut self, from: ExistsStatus, to: ExistsStatus) -> StoreResult<u64>;

    async fn reconciles_launched_between(
        &mut self,
        instance: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> StoreResult<Vec<InstanceReconcile>>;
    async fn insert_reconcile(
        &mut self,
        reconcile: InstanceReconcile,
    ) -> StoreResult<InstanceReconcile>;
}

/// Commits on success and rolls back on failure, handing the outcome back.
pub async fn finish<T, E>(tx: Box<dyn Transaction>, outcome: Result<T, E>) -> Result<T, E>
where
    E: From<crate::error::StoreError>,
{
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}
