//! Agreement checks between a nova exist and the launch and delete facts
//! recorded for the same instance.

use super::errors::{show, VerificationError};
use super::validity::verify_validity;
use crate::config::ValidationLevel;
use crate::error::StoreError;
use crate::models::{FlavorField, Flavored, ImageMeta, InstanceExists, InstanceReconcile};
use crate::store::Transaction;
use crate::time::Timestamp;
use tracing::debug;

/// Result of verifying one exist. Store failures are reported separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    /// Failed against usage data but agreed with reconciled data.
    Reconciled,
    Failed(VerificationError),
}

enum CheckError {
    Verify(VerificationError),
    Store(StoreError),
}

impl From<VerificationError> for CheckError {
    fn from(err: VerificationError) -> Self {
        CheckError::Verify(err)
    }
}

impl From<StoreError> for CheckError {
    fn from(err: StoreError) -> Self {
        CheckError::Store(err)
    }
}

/// The launch-side fields an exist is compared against.
struct LaunchFacts<'a> {
    launched_at: Option<Timestamp>,
    flavor: Option<&'a str>,
    tenant: Option<&'a str>,
    meta: &'a ImageMeta,
}

#[derive(Debug, Clone, Copy)]
pub struct NovaVerifier {
    level: ValidationLevel,
    flavor_field: FlavorField,
}

impl NovaVerifier {
    pub fn new(level: ValidationLevel, flavor_field: FlavorField) -> Self {
        Self {
            level,
            flavor_field,
        }
    }

    pub fn flavor_field(&self) -> FlavorField {
        self.flavor_field
    }

    /// Verifies `exist` against usage and delete data, falling back to
    /// reconciled data when that fails. Nothing is written.
    pub async fn verify(
        &self,
        tx: &mut dyn Transaction,
        exist: &InstanceExists,
    ) -> Result<Verdict, StoreError> {
        let original = match self.check(tx, exist).await {
            Ok(()) => return Ok(Verdict::Verified),
            Err(CheckError::Store(err)) => return Err(err),
            Err(CheckError::Verify(err)) => err,
        };
        if exist.launched_at.is_none() {
            return Ok(Verdict::Failed(original));
        }

        debug!(exist_id = exist.id, reason = %original, "trying reconciled data");
        match self.check_reconciled(tx, exist).await {
            Ok(()) => Ok(Verdict::Reconciled),
            Err(CheckError::Store(err)) => Err(err),
            Err(CheckError::Verify(err)) if err.is_not_found() => Ok(Verdict::Failed(original)),
            Err(CheckError::Verify(err)) => Ok(Verdict::Failed(err)),
        }
    }

    async fn check(&self, tx: &mut dyn Transaction, exist: &InstanceExists) -> Result<(), CheckError> {
        let Some(launched_at) = exist.launched_at else {
            return Err(VerificationError::Verification("Exists without a launched_at".into()).into());
        };

        verify_validity(exist, self.level, self.flavor_field)?;
        self.check_launch(tx, exist, launched_at).await?;
        self.check_delete(tx, exist, launched_at).await?;
        Ok(())
    }

    async fn check_launch(
        &self,
        tx: &mut dyn Transaction,
        exist: &InstanceExists,
        launched_at: Timestamp,
    ) -> Result<(), CheckError> {
        let usage = match exist.usage_id {
            Some(id) => tx
                .get_usage(id)
                .await?
                .ok_or_else(|| VerificationError::not_found("InstanceUsage", &[("id", id.to_string())]))?,
            None => {
                let (from, to) = launched_at.second_window();
                let mut found = tx.usages_launched_between(&exist.instance, from, to).await?;
                let params = [
                    ("instance", exist.instance.clone()),
                    ("launched_at", launched_at.to_decimal_string()),
                ];
                match found.len() {
                    0 => return Err(VerificationError::not_found("InstanceUsage", &params).into()),
                    1 => found.remove(0),
                    _ => return Err(VerificationError::ambiguous("InstanceUsage", &params).into()),
                }
            }
        };

        let facts = LaunchFacts {
            launched_at: usage.launched_at,
            flavor: usage.flavor(self.flavor_field),
            tenant: usage.tenant.as_deref(),
            meta: &usage.meta,
        };
        self.compare_launch(exist, &facts)?;
        Ok(())
    }

    async fn check_delete(
        &self,
        tx: &mut dyn Transaction,
        exist: &InstanceExists,
        launched_at: Timestamp,
    ) -> Result<(), CheckError> {
        let (from, to) = launched_at.second_window();
        let params = [
            ("instance", exist.instance.clone()),
            ("launched_at", launched_at.to_decimal_string()),
        ];

        let delete = if let Some(id) = exist.delete_id {
            tx.get_delete(id)
                .await?
                .ok_or_else(|| VerificationError::not_found("InstanceDelete", &[("id", id.to_string())]))?
        } else if exist.deleted_at.is_some() {
            let mut found = tx
                .deletes_launched_between(&exist.instance, from, to, None)
                .await?;
            match found.len() {
                0 => return Err(VerificationError::not_found("InstanceDelete", &params).into()),
                1 => found.remove(0),
                _ => return Err(VerificationError::ambiguous("InstanceDelete", &params).into()),
            }
        } else {
            let found = tx
                .deletes_launched_between(&exist.instance, from, to, exist.audit_period_ending)
                .await?;
            if found.is_empty() {
                return Ok(());
            }
            return Err(VerificationError::Verification(
                "Found InstanceDeletes for non-delete exist".into(),
            )
            .into());
        };

        compare_delete(exist, delete.launched_at, delete.deleted_at)?;
        Ok(())
    }

    async fn check_reconciled(
        &self,
        tx: &mut dyn Transaction,
        exist: &InstanceExists,
    ) -> Result<(), CheckError> {
        let Some(launched_at) = exist.launched_at else {
            return Err(VerificationError::Verification("Exists without a launched_at".into()).into());
        };
        let (from, to) = launched_at.second_window();
        let params = [
            ("instance", exist.instance.clone()),
            ("launched_at", launched_at.to_decimal_string()),
        ];
        let mut found = tx.reconciles_launched_between(&exist.instance, from, to).await?;
        let reconcile: InstanceReconcile = match found.len() {
            0 => return Err(VerificationError::not_found("InstanceReconcile", &params).into()),
            1 => found.remove(0),
            _ => return Err(VerificationError::ambiguous("InstanceReconcile", &params).into()),
        };

        let facts = LaunchFacts {
            launched_at: reconcile.launched_at,
            flavor: reconcile.flavor(self.flavor_field),
            tenant: reconcile.tenant.as_deref(),
            meta: &reconcile.meta,
        };
        self.compare_launch(exist, &facts)?;
        // Without a reconciled deletion, the recorded deletes decide.
        match reconcile.deleted_at {
            Some(deleted_at) => compare_delete(exist, reconcile.launched_at, Some(deleted_at))?,
            None => self.check_delete(tx, exist, launched_at).await?,
        }
        verify_validity(exist, self.level, self.flavor_field)?;
        Ok(())
    }

    fn compare_launch(
        &self,
        exist: &InstanceExists,
        launch: &LaunchFacts<'_>,
    ) -> Result<(), VerificationError> {
        let uuid = exist.instance.as_str();
        if !same_second(launch.launched_at, exist.launched_at) {
            return Err(VerificationError::timestamp_mismatch(
                "launched_at",
                launch.launched_at,
                exist.launched_at,
                uuid,
            ));
        }

        let field = self.flavor_field.name();
        compare_text(field, launch.flavor, exist.flavor(self.flavor_field), uuid)?;
        compare_text("tenant", launch.tenant, exist.tenant.as_deref(), uuid)?;

        let (expected, actual) = (launch.meta, &exist.meta);
        compare_text(
            "rax_options",
            expected.rax_options.as_deref(),
            actual.rax_options.as_deref(),
            uuid,
        )?;
        compare_text(
            "os_distro",
            expected.os_distro.as_deref(),
            actual.os_distro.as_deref(),
            uuid,
        )?;
        compare_text(
            "os_architecture",
            expected.os_architecture.as_deref(),
            actual.os_architecture.as_deref(),
            uuid,
        )?;
        compare_text(
            "os_version",
            expected.os_version.as_deref(),
            actual.os_version.as_deref(),
            uuid,
        )
    }
}

fn same_second(expected: Option<Timestamp>, actual: Option<Timestamp>) -> bool {
    match (expected, actual) {
        (Some(a), Some(b)) => a.same_second(b),
        _ => false,
    }
}

fn compare_text(
    field: &str,
    expected: Option<&str>,
    actual: Option<&str>,
    uuid: &str,
) -> Result<(), VerificationError> {
    if expected == actual {
        Ok(())
    } else {
        Err(VerificationError::mismatch(field, show(expected), show(actual), uuid))
    }
}

fn compare_delete(
    exist: &InstanceExists,
    launched_at: Option<Timestamp>,
    deleted_at: Option<Timestamp>,
) -> Result<(), VerificationError> {
    let uuid = exist.instance.as_str();
    if !same_second(launched_at, exist.launched_at) {
        return Err(VerificationError::timestamp_mismatch(
            "launched_at",
            launched_at,
            exist.launched_at,
            uuid,
        ));
    }
    if !same_second(deleted_at, exist.deleted_at) {
        return Err(VerificationError::timestamp_mismatch(
            "deleted_at",
            deleted_at,
            exist.deleted_at,
            uuid,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExistsStatus, InstanceDelete, InstanceUsage, NewInstanceExists};
    use crate::store::{MemoryStore, Store};

    const LAUNCH: i64 = 1_371_749_517_939_614;
    const TENANT: &str = "3762854cd6f6435998188d5120e4c271";

    fn meta() -> ImageMeta {
        ImageMeta {
            os_architecture: Some("x64".into()),
            os_distro: Some("com.ubuntu".into()),
            os_version: Some("12.04".into()),
            rax_options: Some("0".into()),
        }
    }

    fn usage(launched_at: i64, flavor: &str) -> InstanceUsage {
        InstanceUsage {
            id: 0,
            instance: "i-1".into(),
            launched_at: Some(Timestamp::from_micros(launched_at)),
            request_id: Some("r-1".into()),
            instance_type_id: Some(flavor.into()),
            instance_flavor_id: None,
            tenant: Some(TENANT.into()),
            meta: meta(),
        }
    }

    fn exist(launched_at: i64, flavor: &str) -> NewInstanceExists {
        NewInstanceExists {
            instance: "i-1".into(),
            launched_at: Some(Timestamp::from_micros(launched_at)),
            deleted_at: None,
            audit_period_beginning: Some(Timestamp::from_seconds(1_371_686_400)),
            audit_period_ending: Some(Timestamp::from_seconds(1_371_772_800)),
            instance_type_id: Some(flavor.into()),
            instance_flavor_id: None,
            message_id: Some("m-1".into()),
            tenant: Some(TENANT.into()),
            meta: meta(),
            status: ExistsStatus::Verifying,
            raw_id: None,
            usage_id: None,
            delete_id: None,
        }
    }

    fn verifier() -> NovaVerifier {
        NovaVerifier::new(ValidationLevel::All, FlavorField::InstanceTypeId)
    }

    #[tokio::test]
    async fn matching_usage_verifies() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.save_usage(usage(LAUNCH + 12, "2")).await.unwrap();
        let exist = tx.insert_exists(exist(LAUNCH, "2")).await.unwrap();

        let verdict = verifier().verify(tx.as_mut(), &exist).await.unwrap();
        assert_eq!(verdict, Verdict::Verified);
    }

    #[tokio::test]
    async fn flavor_mismatch_fails_with_field_detail() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.save_usage(usage(LAUNCH, "2")).await.unwrap();
        let exist = tx.insert_exists(exist(LAUNCH, "3")).await.unwrap();

        let Verdict::Failed(err) = verifier().verify(tx.as_mut(), &exist).await.unwrap() else {
            panic!("expected a failure");
        };
        assert!(err
            .to_string()
            .ends_with("for i-1: Expected instance_type_id to be '2' got '3'"));
    }

    #[tokio::test]
    async fn missing_and_ambiguous_usage() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let exist_row = tx.insert_exists(exist(LAUNCH, "2")).await.unwrap();
        let Verdict::Failed(err) = verifier().verify(tx.as_mut(), &exist_row).await.unwrap() else {
            panic!("expected a failure");
        };
        assert!(err.is_not_found());

        tx.save_usage(usage(LAUNCH, "2")).await.unwrap();
        let mut second = usage(LAUNCH + 1, "2");
        second.request_id = Some("r-2".into());
        tx.save_usage(second).await.unwrap();
        let Verdict::Failed(err) = verifier().verify(tx.as_mut(), &exist_row).await.unwrap() else {
            panic!("expected a failure");
        };
        assert!(matches!(err, VerificationError::AmbiguousResults { .. }));
    }

    #[tokio::test]
    async fn delete_within_period_fails_non_delete_exist() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.save_usage(usage(LAUNCH, "2")).await.unwrap();
        tx.save_delete(InstanceDelete {
            id: 0,
            instance: "i-1".into(),
            launched_at: Some(Timestamp::from_micros(LAUNCH)),
            deleted_at: Some(Timestamp::from_seconds(1_371_700_000)),
            raw_id: None,
        })
        .await
        .unwrap();
        let exist = tx.insert_exists(exist(LAUNCH, "2")).await.unwrap();

        let Verdict::Failed(err) = verifier().verify(tx.as_mut(), &exist).await.unwrap() else {
            panic!("expected a failure");
        };
        assert_eq!(err.to_string(), "Found InstanceDeletes for non-delete exist");
    }

    #[tokio::test]
    async fn reconciled_data_rescues_a_failure() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.save_usage(usage(LAUNCH, "2")).await.unwrap();
        tx.insert_reconcile(InstanceReconcile {
            id: 0,
            instance: "i-1".into(),
            launched_at: Some(Timestamp::from_micros(LAUNCH)),
            deleted_at: None,
            instance_type_id: Some("3".into()),
            instance_flavor_id: None,
            tenant: Some(TENANT.into()),
            meta: meta(),
            source: "test".into(),
        })
        .await
        .unwrap();
        let exist = tx.insert_exists(exist(LAUNCH, "3")).await.unwrap();

        let verdict = verifier().verify(tx.as_mut(), &exist).await.unwrap();
        assert_eq!(verdict, Verdict::Reconciled);
    }

    #[tokio::test]
    async fn exist_without_launch_fails_outright() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut row = exist(LAUNCH, "2");
        row.launched_at = None;
        let exist = tx.insert_exists(row).await.unwrap();

        let verdict = verifier().verify(tx.as_mut(), &exist).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Failed(VerificationError::Verification(
                "Exists without a launched_at".into()
            ))
        );
    }

    fn reconcile(flavor: &str, deleted_at: Option<Timestamp>) -> InstanceReconcile {
        InstanceReconcile {
            id: 0,
            instance: "i-1".into(),
            launched_at: Some(Timestamp::from_micros(LAUNCH)),
            deleted_at,
            instance_type_id: Some(flavor.into()),
            instance_flavor_id: None,
            tenant: Some(TENANT.into()),
            meta: meta(),
            source: "test".into(),
        }
    }

    #[tokio::test]
    async fn malformed_tenant_is_reported_before_missing_usage() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut row = exist(LAUNCH, "2");
        row.tenant = Some("not-hex!".into());
        let exist = tx.insert_exists(row).await.unwrap();

        let Verdict::Failed(err) = verifier().verify(tx.as_mut(), &exist).await.unwrap() else {
            panic!("expected a failure");
        };
        assert!(
            matches!(err, VerificationError::WrongType { field: "tenant", .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn several_reconciles_for_one_launch_are_ambiguous() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_reconcile(reconcile("9", None)).await.unwrap();
        tx.insert_reconcile(reconcile("2", None)).await.unwrap();
        let exist = tx.insert_exists(exist(LAUNCH, "2")).await.unwrap();

        let Verdict::Failed(err) = verifier().verify(tx.as_mut(), &exist).await.unwrap() else {
            panic!("expected a failure");
        };
        assert!(
            matches!(
                err,
                VerificationError::AmbiguousResults {
                    object_type: "InstanceReconcile",
                    ..
                }
            ),
            "{err}"
        );
    }

    #[tokio::test]
    async fn os_distro_is_compared_before_architecture() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut launch = usage(LAUNCH, "2");
        launch.meta.os_architecture = Some("x86".into());
        launch.meta.os_distro = Some("rhel".into());
        tx.save_usage(launch).await.unwrap();
        let exist = tx.insert_exists(exist(LAUNCH, "2")).await.unwrap();

        let Verdict::Failed(VerificationError::FieldMismatch { field, .. }) =
            verifier().verify(tx.as_mut(), &exist).await.unwrap()
        else {
            panic!("expected a field mismatch");
        };
        assert_eq!(field, "os_distro");
    }

    #[tokio::test]
    async fn reconcile_without_deletion_checks_recorded_deletes() {
        let deleted_at = Timestamp::from_seconds(1_371_760_000);
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_reconcile(reconcile("2", None)).await.unwrap();
        tx.save_delete(InstanceDelete {
            id: 0,
            instance: "i-1".into(),
            launched_at: Some(Timestamp::from_micros(LAUNCH)),
            deleted_at: Some(deleted_at),
            raw_id: None,
        })
        .await
        .unwrap();
        let mut row = exist(LAUNCH, "2");
        row.deleted_at = Some(deleted_at);
        let exist = tx.insert_exists(row).await.unwrap();

        let verdict = verifier().verify(tx.as_mut(), &exist).await.unwrap();
        assert_eq!(verdict, Verdict::Reconciled);
    }
}
