use tracing::{debug, warn};

use crate::error::{StoreError, VerifyError};
use crate::model::{ExistsRecord, ExistsStatus};
use crate::reconcile::verify_with_reconciled_data;
use crate::store::RecordStore;
use crate::verify::{verify_for_delete, verify_for_launch, NO_LAUNCHED_AT_REASON};

/// Final state of one verification attempt. `verified` echoes `exist.status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub exist: ExistsRecord,
}

/// # Errors
/// Returns a [`StoreError`] when the record cannot be saved.
pub fn mark_verified(store: &dyn RecordStore, exist: &mut ExistsRecord) -> Result<(), StoreError> {
    exist.status = ExistsStatus::Verified;
    store.save(exist)
}

/// # Errors
/// Returns a [`StoreError`] when the record cannot be saved.
pub fn mark_failed(
    store: &dyn RecordStore,
    exist: &mut ExistsRecord,
    reason: &str,
) -> Result<(), StoreError> {
    exist.status = ExistsStatus::Failed;
    exist.fail_reason = Some(reason.to_string());
    store.save(exist)
}

/// Run launch and delete verification for one exists record, falling back to
/// reconcile data, and persist the outcome.
///
/// Verification failures never surface as errors; they are persisted as a
/// FAILED status with a reason.
///
/// # Errors
/// Returns a [`StoreError`] only when persisting the outcome fails.
pub fn verify(
    store: &dyn RecordStore,
    mut exist: ExistsRecord,
) -> Result<VerificationOutcome, StoreError> {
    if exist.launched_at.is_none() {
        mark_failed(store, &mut exist, NO_LAUNCHED_AT_REASON)?;
        match verify_with_reconciled_data(store, &exist, None) {
            Ok(()) => mark_verified(store, &mut exist)?,
            Err(err) => debug!(exists_id = exist.id, error = %err, "no reconcile rescue"),
        }
        return Ok(finish(exist));
    }

    let primary =
        verify_for_launch(store, &exist, None).and_then(|()| verify_for_delete(store, &exist, None));

    match primary {
        Ok(()) => mark_verified(store, &mut exist)?,
        Err(VerifyError::Fault(fault)) => {
            match verify_with_reconciled_data(store, &exist, Some(&fault)) {
                Ok(()) => mark_verified(store, &mut exist)?,
                Err(err) if err.is_not_found() => {
                    mark_failed(store, &mut exist, &fault.to_string())?;
                }
                Err(err) => {
                    warn!(exists_id = exist.id, error = %err, "reconciliation failed");
                    mark_failed(store, &mut exist, &err.failure_reason())?;
                }
            }
        }
        Err(err @ VerifyError::Store(_)) => {
            warn!(exists_id = exist.id, error = %err, "verification aborted by store failure");
            mark_failed(store, &mut exist, &err.failure_reason())?;
        }
    }
    Ok(finish(exist))
}

fn finish(exist: ExistsRecord) -> VerificationOutcome {
    debug!(
        exists_id = exist.id,
        instance = %exist.instance,
        status = exist.status.as_str(),
        reason = exist.fail_reason.as_deref(),
        "verification finished"
    );
    VerificationOutcome { verified: exist.status == ExistsStatus::Verified, exist }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::{DeleteRecord, ReconcileRecord, UsageRecord};
    use crate::store::RecordKind;

    fn exists_fixture() -> ExistsRecord {
        ExistsRecord {
            id: 0,
            instance: "i-1".to_string(),
            tenant: "tenant-1".to_string(),
            launched_at: Some(Decimal::new(11, 1)),
            deleted_at: None,
            instance_type_id: "2".to_string(),
            rax_options: "0".to_string(),
            os_distro: "linux".to_string(),
            os_architecture: "x64".to_string(),
            os_version: "1".to_string(),
            audit_period_beginning: None,
            audit_period_ending: Decimal::new(100, 0),
            status: ExistsStatus::Verifying,
            fail_reason: None,
            usage: None,
            delete: None,
            raw_json: r#"["monitor.info", {"message_id": "m-1"}]"#.to_string(),
        }
    }

    fn usage_for(exist: &ExistsRecord) -> UsageRecord {
        UsageRecord {
            id: 0,
            instance: exist.instance.clone(),
            launched_at: Decimal::new(12, 1),
            instance_type_id: exist.instance_type_id.clone(),
            tenant: exist.tenant.clone(),
            rax_options: exist.rax_options.clone(),
            os_distro: exist.os_distro.clone(),
            os_architecture: exist.os_architecture.clone(),
            os_version: exist.os_version.clone(),
        }
    }

    fn reconcile_for(exist: &ExistsRecord, launched_at: Decimal) -> ReconcileRecord {
        ReconcileRecord {
            id: 0,
            instance: exist.instance.clone(),
            launched_at,
            deleted_at: exist.deleted_at,
            instance_type_id: exist.instance_type_id.clone(),
            tenant: exist.tenant.clone(),
            rax_options: exist.rax_options.clone(),
            os_distro: exist.os_distro.clone(),
            os_architecture: exist.os_architecture.clone(),
            os_version: exist.os_version.clone(),
        }
    }

    fn stored(store: &MemoryStore, exist: ExistsRecord) -> ExistsRecord {
        let id = store.insert_exists(exist);
        match store.exists(id) {
            Some(exist) => exist,
            None => panic!("exists {id} was just inserted"),
        }
    }

    #[test]
    fn corroborated_record_is_verified() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut exist = exists_fixture();
        exist.usage = Some(usage_for(&exist));
        let exist = stored(&store, exist);

        let outcome = verify(&store, exist)?;

        assert!(outcome.verified);
        assert_eq!(outcome.exist.status, ExistsStatus::Verified);
        assert_eq!(outcome.exist.fail_reason, None);
        assert_eq!(store.exists(outcome.exist.id), Some(outcome.exist));
        Ok(())
    }

    #[test]
    fn launch_failure_skips_delete_verification() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut exist = exists_fixture();
        let mut usage = usage_for(&exist);
        usage.tenant = "tenant-2".to_string();
        exist.usage = Some(usage);
        let exist = stored(&store, exist);

        let outcome = verify(&store, exist)?;

        assert!(!outcome.verified);
        assert_eq!(
            outcome.exist.fail_reason.as_deref(),
            Some("Expected tenant to be 'tenant-1' got 'tenant-2'")
        );
        assert!(!store.query_log().iter().any(|entry| entry.kind() == RecordKind::Delete));
        Ok(())
    }

    #[test]
    fn delete_violation_is_persisted_when_no_reconcile_exists() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut exist = exists_fixture();
        exist.usage = Some(usage_for(&exist));
        store.insert_delete(DeleteRecord {
            id: 0,
            instance: exist.instance.clone(),
            launched_at: Decimal::new(11, 1),
            deleted_at: Decimal::new(50, 0),
        });
        let exist = stored(&store, exist);

        let outcome = verify(&store, exist)?;

        assert_eq!(outcome.exist.status, ExistsStatus::Failed);
        assert_eq!(
            outcome.exist.fail_reason.as_deref(),
            Some("Found InstanceDeletes for non-delete exist")
        );
        Ok(())
    }

    #[test]
    fn reconcile_rescues_failed_launch() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let exist = exists_fixture();
        store.insert_reconcile(reconcile_for(&exist, Decimal::new(15, 1)));
        let exist = stored(&store, exist);

        let outcome = verify(&store, exist)?;

        assert!(outcome.verified);
        assert_eq!(outcome.exist.status, ExistsStatus::Verified);
        Ok(())
    }

    #[test]
    fn reconcile_not_found_keeps_original_reason() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let exist = stored(&store, exists_fixture());

        let outcome = verify(&store, exist)?;

        assert_eq!(
            outcome.exist.fail_reason.as_deref(),
            Some("Couldn't find InstanceUsage using {'instance': 'i-1'}")
        );
        Ok(())
    }

    #[test]
    fn reconcile_mismatch_persists_the_field_and_values() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let exist = exists_fixture();
        let mut reconcile = reconcile_for(&exist, Decimal::new(11, 1));
        reconcile.os_distro = "windows".to_string();
        store.insert_reconcile(reconcile);
        let exist = stored(&store, exist);

        let outcome = verify(&store, exist)?;

        assert!(!outcome.verified);
        assert_eq!(
            outcome.exist.fail_reason.as_deref(),
            Some("Expected os_distro to be 'linux' got 'windows'")
        );
        Ok(())
    }

    #[test]
    fn ambiguous_reconcile_persists_its_search() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let exist = exists_fixture();
        store.insert_reconcile(reconcile_for(&exist, Decimal::new(11, 1)));
        store.insert_reconcile(reconcile_for(&exist, Decimal::new(17, 1)));
        let exist = stored(&store, exist);

        let outcome = verify(&store, exist)?;

        assert_eq!(
            outcome.exist.fail_reason.as_deref(),
            Some(
                "Ambiguous results for InstanceReconcile using \
                 {'instance': 'i-1', 'launched_at': '1.1'}"
            )
        );
        Ok(())
    }

    #[test]
    fn missing_launched_at_is_failed_before_reconcile() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut exist = exists_fixture();
        exist.launched_at = None;
        let exist = stored(&store, exist);

        let outcome = verify(&store, exist)?;

        assert!(!outcome.verified);
        let saves = store.save_log();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].status, ExistsStatus::Failed);
        assert_eq!(saves[0].fail_reason.as_deref(), Some("Exists without a launched_at"));
        Ok(())
    }

    #[test]
    fn store_failure_bypasses_reconciler() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let exist = stored(&store, exists_fixture());
        store.fail_queries_for(RecordKind::Usage);

        let outcome = verify(&store, exist)?;

        assert_eq!(outcome.exist.fail_reason.as_deref(), Some("StoreError"));
        assert!(!store.query_log().iter().any(|entry| entry.kind() == RecordKind::Reconcile));
        Ok(())
    }

    #[test]
    fn save_failure_is_returned() {
        let store = MemoryStore::new();
        let mut exist = exists_fixture();
        exist.usage = Some(usage_for(&exist));
        let exist = stored(&store, exist);
        store.fail_saves();

        assert!(matches!(verify(&store, exist), Err(StoreError::Backend(_))));
    }
}
