//! Domain records shared by the ingest, verification and publishing paths.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type RawId = i64;

/// Image metadata carried on launches, exists and reconciles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub os_architecture: Option<String>,
    pub os_distro: Option<String>,
    pub os_version: Option<String>,
    pub rax_options: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRawRecord {
    pub deployment_id: i64,
    pub routing_key: String,
    pub event: String,
    pub publisher: Option<String>,
    pub service: Option<String>,
    pub host: Option<String>,
    pub when: Option<Timestamp>,
    pub tenant: Option<String>,
    pub instance: Option<String>,
    pub request_id: Option<String>,
    pub state: Option<String>,
    pub old_state: Option<String>,
    pub task: Option<String>,
    pub old_task: Option<String>,
    pub image_type: i32,
    pub json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: RawId,
    pub deployment_id: i64,
    pub routing_key: String,
    pub event: String,
    pub publisher: Option<String>,
    pub service: Option<String>,
    pub host: Option<String>,
    pub when: Option<Timestamp>,
    pub tenant: Option<String>,
    pub instance: Option<String>,
    pub request_id: Option<String>,
    pub state: Option<String>,
    pub old_state: Option<String>,
    pub task: Option<String>,
    pub old_task: Option<String>,
    pub image_type: i32,
    pub json: String,
}

impl RawRecord {
    pub fn from_new(id: RawId, raw: NewRawRecord) -> Self {
        Self {
            id,
            deployment_id: raw.deployment_id,
            routing_key: raw.routing_key,
            event: raw.event,
            publisher: raw.publisher,
            service: raw.service,
            host: raw.host,
            when: raw.when,
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    pub id: i64,
    pub instance: String,
    pub last_raw_id: Option<RawId>,
    pub last_state: Option<String>,
    pub last_task_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub id: i64,
    pub lifecycle_id: i64,
    pub name: String,
    pub start_raw_id: Option<RawId>,
    pub end_raw_id: Option<RawId>,
    pub start_when: Option<Timestamp>,
    pub end_when: Option<Timestamp>,
    /// Microseconds between `start_when` and `end_when`.
    pub diff: Option<i64>,
}

impl Timing {
    pub fn new(lifecycle_id: i64, name: &str) -> Self {
        Self {
            id: 0,
            lifecycle_id,
            name: name.to_string(),
            start_raw_id: None,
            end_raw_id: None,
            start_when: None,
            end_when: None,
            diff: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.start_raw_id.is_some() && self.end_raw_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTracker {
    pub id: i64,
    pub request_id: String,
    pub lifecycle_id: i64,
    pub last_timing_id: Option<i64>,
    pub start: Option<Timestamp>,
    /// Microseconds from `start` to the latest `.end` for this request.
    pub duration: i64,
    pub completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUsage {
    pub id: i64,
    pub instance: String,
    pub launched_at: Option<Timestamp>,
    pub request_id: Option<String>,
    pub instance_type_id: Option<String>,
    pub instance_flavor_id: Option<String>,
    pub tenant: Option<String>,
    pub meta: ImageMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDelete {
    pub id: i64,
    pub instance: String,
    pub launched_at: Option<Timestamp>,
    pub deleted_at: Option<Timestamp>,
    pub raw_id: Option<RawId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistsStatus {
    Pending,
    Verifying,
    SentUnverified,
    SentVerifying,
    Verified,
    Reconciled,
    Failed,
}

impl ExistsStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExistsStatus::Pending => "pending",
            ExistsStatus::Verifying => "verifying",
            ExistsStatus::SentUnverified => "sent_unverified",
            ExistsStatus::SentVerifying => "sent_verifying",
            ExistsStatus::Verified => "verified",
            ExistsStatus::Reconciled => "reconciled",
            ExistsStatus::Failed => "failed",
        }
    }

    /// Statuses that may never be left once reached.
    pub fn is_final(self) -> bool {
        matches!(self, ExistsStatus::Verified | ExistsStatus::Reconciled)
    }

    /// Statuses that count towards the one-live-exists-per-period rule.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ExistsStatus::Pending | ExistsStatus::Verifying | ExistsStatus::Verified
        )
    }
}

impl fmt::Display for ExistsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExistsStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ExistsStatus::Pending),
            "verifying" => Ok(ExistsStatus::Verifying),
            "sent_unverified" => Ok(ExistsStatus::SentUnverified),
            "sent_verifying" => Ok(ExistsStatus::SentVerifying),
            "verified" => Ok(ExistsStatus::Verified),
            "reconciled" => Ok(ExistsStatus::Reconciled),
            "failed" => Ok(ExistsStatus::Failed),
            other => Err(format!("unknown exists status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstanceExists {
    pub instance: String,
    pub launched_at: Option<Timestamp>,
    pub deleted_at: Option<Timestamp>,
    pub audit_period_beginning: Option<Timestamp>,
    pub audit_period_ending: Option<Timestamp>,
    pub instance_type_id: Option<String>,
    pub instance_flavor_id: Option<String>,
    pub message_id: Option<String>,
    pub tenant: Option<String>,
    pub meta: ImageMeta,
    pub status: ExistsStatus,
    pub raw_id: Option<RawId>,
    pub usage_id: Option<i64>,
    pub delete_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceExists {
    pub id: i64,
    pub instance: String,
    pub launched_at: Option<Timestamp>,
    pub deleted_at: Option<Timestamp>,
    pub audit_period_beginning: Option<Timestamp>,
    pub audit_period_ending: Option<Timestamp>,
    pub instance_type_id: Option<String>,
    pub instance_flavor_id: Option<String>,
    pub message_id: Option<String>,
    pub tenant: Option<String>,
    pub meta: ImageMeta,
    pub status: ExistsStatus,
    pub send_status: i32,
    pub fail_reason: Option<String>,
    pub raw_id: Option<RawId>,
    pub usage_id: Option<i64>,
    pub delete_id: Option<i64>,
}

impl InstanceExists {
    pub fn from_new(id: i64, exists: NewInstanceExists) -> Self {
        Self {
            id,
            instance: exists.instance,
            launched_at: exists.launched_at,
            deleted_at: exists.deleted_at,
            audit_period_beginning: exists.audit_period_beginning,
            audit_period_ending: exists.audit_period_ending,
            instance_type_id: exists.instance_type_id,
            instance_flavor_id: exists.instance_flavor_id,
            message_id: exists.message_id,
            tenant: exists.tenant,
            meta: exists.meta,
            status: exists.status,
            send_status: 0,
            fail_reason: None,
            raw_id: exists.raw_id,
            usage_id: exists.usage_id,
            delete_id: exists.delete_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReconcile {
    pub id: i64,
    pub instance: String,
    pub launched_at: Option<Timestamp>,
    pub deleted_at: Option<Timestamp>,
    pub instance_type_id: Option<String>,
    pub instance_flavor_id: Option<String>,
    pub tenant: Option<String>,
    pub meta: ImageMeta,
    pub source: String,
}

/// Which flavor column the verifier and reconciler compare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlavorField {
    #[default]
    InstanceTypeId,
    InstanceFlavorId,
}

impl FlavorField {
    pub fn name(self) -> &'static str {
        match self {
            FlavorField::InstanceTypeId => "instance_type_id",
            FlavorField::InstanceFlavorId => "instance_flavor_id",
        }
    }
}

/// Rows that carry both flavor columns.
pub trait Flavored {
    fn instance_type_id(&self) -> Option<&str>;
    fn instance_flavor_id(&self) -> Option<&str>;

    fn flavor(&self, field: FlavorField) -> Option<&str> {
        match field {
            FlavorField::InstanceTypeId => self.instance_type_id(),
            FlavorField::InstanceFlavorId => self.instance_flavor_id(),
        }
    }
}

macro_rules! impl_flavored {
    ($($ty:ty),+) => {
        $(impl Flavored for $ty {
            fn instance_type_id(&self) -> Option<&str> {
                self.instance_type_id.as_deref()
            }

            fn instance_flavor_id(&self) -> Option<&str> {
                self.instance_flavor_id.as_deref()
            }
        })+
    };
}

impl_flavored!(InstanceUsage, InstanceExists, InstanceReconcile);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ExistsStatus::Pending,
            ExistsStatus::Verifying,
            ExistsStatus::SentUnverified,
            ExistsStatus::SentVerifying,
            ExistsStatus::Verified,
            ExistsStatus::Reconciled,
            ExistsStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ExistsStatus>(), Ok(status));
        }
        assert!("bogus".parse::<ExistsStatus>().is_err());
    }

    #[test]
    fn flavor_field_selects_column() {
        let usage = InstanceUsage {
            instance_type_id: Some("2".into()),
            instance_flavor_id: Some("performance1-1".into()),
            ..Default::default()
        };
        assert_eq!(usage.flavor(FlavorField::InstanceTypeId), Some("2"));
        assert_eq!(
            usage.flavor(FlavorField::InstanceFlavorId),
            Some("performance1-1")
        );
    }
}
