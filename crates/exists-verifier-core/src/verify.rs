use rust_decimal::Decimal;

use crate::compare::{compare_exact, compare_same_second};
use crate::error::{VerificationFault, VerifyError};
use crate::model::{DeleteRecord, ExistsRecord, UsageRecord};
use crate::store::{NumericField, RecordKind, RecordStore};
use crate::window::{find_in_window, same_second_filter};

pub const NO_LAUNCHED_AT_REASON: &str = "Exists without a launched_at";

/// Launch-side facts an exists record is checked against.
pub trait LaunchFacts {
    fn launched_at(&self) -> Decimal;
    fn instance_type_id(&self) -> &str;
    fn tenant(&self) -> &str;
    fn rax_options(&self) -> &str;
    fn os_distro(&self) -> &str;
    fn os_architecture(&self) -> &str;
    fn os_version(&self) -> &str;
}

/// Delete-side facts an exists record is checked against.
pub trait DeleteFacts {
    fn launched_at(&self) -> Decimal;
    fn deleted_at(&self) -> Option<Decimal>;
}

fn require_launched_at(exist: &ExistsRecord) -> Result<Decimal, VerificationFault> {
    exist.launched_at.ok_or_else(|| VerificationFault::violation(NO_LAUNCHED_AT_REASON))
}

/// Field order is fixed; the first divergence is the one reported.
fn compare_launch(
    exist: &ExistsRecord,
    launched_at: Decimal,
    launch: &dyn LaunchFacts,
) -> Result<(), VerificationFault> {
    compare_same_second("launched_at", launched_at, launch.launched_at())?;
    compare_exact("instance_type_id", exist.instance_type_id.as_str(), launch.instance_type_id())?;
    compare_exact("tenant", exist.tenant.as_str(), launch.tenant())?;
    compare_exact("rax_options", exist.rax_options.as_str(), launch.rax_options())?;
    compare_exact("os_distro", exist.os_distro.as_str(), launch.os_distro())?;
    compare_exact("os_architecture", exist.os_architecture.as_str(), launch.os_architecture())?;
    compare_exact("os_version", exist.os_version.as_str(), launch.os_version())
}

fn compare_delete(
    exist: &ExistsRecord,
    launched_at: Decimal,
    delete: &dyn DeleteFacts,
) -> Result<(), VerificationFault> {
    compare_same_second("launched_at", launched_at, delete.launched_at())?;
    compare_exact("deleted_at", exist.deleted_at, delete.deleted_at())
}

/// Corroborate an exists record's launch claim.
///
/// `launch` overrides the fact source; otherwise the linked usage is used,
/// or a same-second usage is looked up in the store.
///
/// # Errors
/// Returns the first field mismatch, a lookup fault, or a store failure.
pub fn verify_for_launch(
    store: &dyn RecordStore,
    exist: &ExistsRecord,
    launch: Option<&dyn LaunchFacts>,
) -> Result<(), VerifyError> {
    let launched_at = require_launched_at(exist)?;

    if let Some(launch) = launch {
        return Ok(compare_launch(exist, launched_at, launch)?);
    }
    if let Some(usage) = &exist.usage {
        return Ok(compare_launch(exist, launched_at, usage)?);
    }

    let usage = find_in_window::<UsageRecord>(store, &exist.instance, launched_at)?;
    Ok(compare_launch(exist, launched_at, &usage)?)
}

/// Corroborate an exists record's deletion claim, or its absence.
///
/// When the record claims no deletion, any delete recorded for the same
/// launch at or before the audit period end is a violation.
///
/// # Errors
/// Returns the first field mismatch, a lookup fault, a violation, or a store
/// failure.
pub fn verify_for_delete(
    store: &dyn RecordStore,
    exist: &ExistsRecord,
    delete: Option<&dyn DeleteFacts>,
) -> Result<(), VerifyError> {
    let launched_at = require_launched_at(exist)?;

    if let Some(delete) = delete {
        return Ok(compare_delete(exist, launched_at, delete)?);
    }
    if let Some(linked) = &exist.delete {
        return Ok(compare_delete(exist, launched_at, linked)?);
    }

    if exist.deleted_at.is_some() {
        let found = find_in_window::<DeleteRecord>(store, &exist.instance, launched_at)?;
        return Ok(compare_delete(exist, launched_at, &found)?);
    }

    let filter = same_second_filter(&exist.instance, launched_at)
        .lte(NumericField::DeletedAt, exist.audit_period_ending);
    if store.count_matching(RecordKind::Delete, &filter)? > 0 {
        return Err(VerificationFault::violation(format!(
            "Found {} for non-delete exist",
            RecordKind::Delete.object_type()
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldValue;
    use crate::memory::MemoryStore;
    use crate::model::ExistsStatus;
    use crate::window::{instance_params, launch_params};

    fn exists_fixture(launched_at: Decimal) -> ExistsRecord {
        ExistsRecord {
            id: 1,
            instance: "08f685d9-6352-4dbc-8271-96cc54bf14cd".to_string(),
            tenant: "3762854cd6f6435998188d5120e4c271".to_string(),
            launched_at: Some(launched_at),
            deleted_at: None,
            instance_type_id: "2".to_string(),
            rax_options: "0".to_string(),
            os_distro: "linux".to_string(),
            os_architecture: "x64".to_string(),
            os_version: "1".to_string(),
            audit_period_beginning: None,
            audit_period_ending: Decimal::new(11, 1),
            status: ExistsStatus::Verifying,
            fail_reason: None,
            usage: None,
            delete: None,
            raw_json: r#"["monitor.info", {"message_id": "some_uuid"}]"#.to_string(),
        }
    }

    fn usage_matching(exist: &ExistsRecord, launched_at: Decimal) -> UsageRecord {
        UsageRecord {
            id: 0,
            instance: exist.instance.clone(),
            launched_at,
            instance_type_id: exist.instance_type_id.clone(),
            tenant: exist.tenant.clone(),
            rax_options: exist.rax_options.clone(),
            os_distro: exist.os_distro.clone(),
            os_architecture: exist.os_architecture.clone(),
            os_version: exist.os_version.clone(),
        }
    }

    fn delete_for(exist: &ExistsRecord, launched_at: Decimal, deleted_at: Decimal) -> DeleteRecord {
        DeleteRecord { id: 0, instance: exist.instance.clone(), launched_at, deleted_at }
    }

    fn expect_mismatch(result: Result<(), VerifyError>) -> (&'static str, FieldValue, FieldValue) {
        match result {
            Err(VerifyError::Fault(VerificationFault::FieldMismatch {
                field_name,
                expected,
                actual,
            })) => (field_name, expected, actual),
            other => panic!("expected field mismatch, got {other:?}"),
        }
    }

    #[test]
    fn linked_usage_in_same_second_verifies() {
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.usage = Some(usage_matching(&exist, Decimal::new(14, 1)));

        assert_eq!(verify_for_launch(&MemoryStore::new(), &exist, None), Ok(()));
    }

    #[test]
    fn linked_usage_in_next_second_mismatches_launched_at() {
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.usage = Some(usage_matching(&exist, Decimal::new(21, 1)));

        let (field, expected, actual) =
            expect_mismatch(verify_for_launch(&MemoryStore::new(), &exist, None));

        assert_eq!(field, "launched_at");
        assert_eq!(expected, FieldValue::Timestamp(Decimal::new(11, 1)));
        assert_eq!(actual, FieldValue::Timestamp(Decimal::new(21, 1)));
    }

    #[test]
    fn each_launch_field_reports_its_own_mismatch() {
        type Mutator = fn(&mut UsageRecord);
        let cases: [(&str, Mutator); 6] = [
            ("instance_type_id", |u| u.instance_type_id = "3".to_string()),
            ("tenant", |u| u.tenant = "other-tenant".to_string()),
            ("rax_options", |u| u.rax_options = "1".to_string()),
            ("os_distro", |u| u.os_distro = "windows".to_string()),
            ("os_architecture", |u| u.os_architecture = "x86".to_string()),
            ("os_version", |u| u.os_version = "2".to_string()),
        ];

        for (expected_field, mutate) in cases {
            let mut exist = exists_fixture(Decimal::new(11, 1));
            let mut usage = usage_matching(&exist, Decimal::new(11, 1));
            mutate(&mut usage);
            exist.usage = Some(usage);

            let (field, _, _) =
                expect_mismatch(verify_for_launch(&MemoryStore::new(), &exist, None));
            assert_eq!(field, expected_field);
        }
    }

    #[test]
    fn earliest_diverging_field_wins() {
        let mut exist = exists_fixture(Decimal::new(11, 1));
        let mut usage = usage_matching(&exist, Decimal::new(11, 1));
        usage.tenant = "other-tenant".to_string();
        usage.os_version = "9".to_string();
        usage.rax_options = "7".to_string();
        exist.usage = Some(usage);

        let (field, expected, actual) =
            expect_mismatch(verify_for_launch(&MemoryStore::new(), &exist, None));

        assert_eq!(field, "tenant");
        assert_eq!(expected, FieldValue::Text(exist.tenant.clone()));
        assert_eq!(actual, FieldValue::Text("other-tenant".to_string()));
    }

    #[test]
    fn launched_at_mismatch_hides_later_divergence() {
        let mut exist = exists_fixture(Decimal::new(11, 1));
        let mut usage = usage_matching(&exist, Decimal::new(21, 1));
        usage.instance_type_id = "3".to_string();
        exist.usage = Some(usage);

        let (field, _, _) = expect_mismatch(verify_for_launch(&MemoryStore::new(), &exist, None));

        assert_eq!(field, "launched_at");
    }

    #[test]
    fn late_usage_is_found_in_store() {
        let store = MemoryStore::new();
        let exist = exists_fixture(Decimal::new(11, 1));
        store.insert_usage(usage_matching(&exist, Decimal::new(11, 1)));

        assert_eq!(verify_for_launch(&store, &exist, None), Ok(()));
    }

    #[test]
    fn missing_usage_reports_instance_only() {
        let store = MemoryStore::new();
        let exist = exists_fixture(Decimal::new(11, 1));

        let result = verify_for_launch(&store, &exist, None);

        assert_eq!(
            result,
            Err(VerifyError::Fault(VerificationFault::NotFound {
                object_type: "InstanceUsage",
                search_params: instance_params(&exist.instance),
            }))
        );
    }

    #[test]
    fn ambiguous_late_usage_is_refused() {
        let store = MemoryStore::new();
        let exist = exists_fixture(Decimal::new(11, 1));
        store.insert_usage(usage_matching(&exist, Decimal::new(11, 1)));
        store.insert_usage(usage_matching(&exist, Decimal::new(15, 1)));

        let result = verify_for_launch(&store, &exist, None);

        assert_eq!(
            result,
            Err(VerifyError::Fault(VerificationFault::AmbiguousResults {
                object_type: "InstanceUsage",
                search_params: launch_params(&exist.instance, Decimal::new(11, 1)),
            }))
        );
    }

    #[test]
    fn linked_delete_matching_verifies() {
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.deleted_at = Some(Decimal::new(51, 1));
        exist.delete = Some(delete_for(&exist, Decimal::new(11, 1), Decimal::new(51, 1)));

        assert_eq!(verify_for_delete(&MemoryStore::new(), &exist, None), Ok(()));
    }

    #[test]
    fn linked_delete_launched_at_mismatch_is_reported_first() {
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.deleted_at = Some(Decimal::new(51, 1));
        exist.delete = Some(delete_for(&exist, Decimal::new(21, 1), Decimal::new(61, 1)));

        let (field, expected, actual) =
            expect_mismatch(verify_for_delete(&MemoryStore::new(), &exist, None));

        assert_eq!(field, "launched_at");
        assert_eq!(expected, FieldValue::Timestamp(Decimal::new(11, 1)));
        assert_eq!(actual, FieldValue::Timestamp(Decimal::new(21, 1)));
    }

    #[test]
    fn deleted_at_is_compared_exactly() {
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.deleted_at = Some(Decimal::new(51, 1));
        exist.delete = Some(delete_for(&exist, Decimal::new(11, 1), Decimal::new(52, 1)));

        let (field, expected, actual) =
            expect_mismatch(verify_for_delete(&MemoryStore::new(), &exist, None));

        assert_eq!(field, "deleted_at");
        assert_eq!(expected, FieldValue::Timestamp(Decimal::new(51, 1)));
        assert_eq!(actual, FieldValue::Timestamp(Decimal::new(52, 1)));
    }

    #[test]
    fn unlinked_delete_is_found_in_store() {
        let store = MemoryStore::new();
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.deleted_at = Some(Decimal::new(51, 1));
        store.insert_delete(delete_for(&exist, Decimal::new(11, 1), Decimal::new(51, 1)));

        assert_eq!(verify_for_delete(&store, &exist, None), Ok(()));
    }

    #[test]
    fn unlinked_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.deleted_at = Some(Decimal::new(51, 1));

        let result = verify_for_delete(&store, &exist, None);

        assert!(matches!(
            result,
            Err(VerifyError::Fault(VerificationFault::NotFound {
                object_type: "InstanceDeletes",
                ..
            }))
        ));
    }

    #[test]
    fn live_exists_without_deletes_verifies() {
        let store = MemoryStore::new();
        let exist = exists_fixture(Decimal::new(11, 1));

        assert_eq!(verify_for_delete(&store, &exist, None), Ok(()));
    }

    #[test]
    fn live_exists_with_delete_before_period_end_is_violation() {
        let store = MemoryStore::new();
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.audit_period_ending = Decimal::new(13, 1);
        store.insert_delete(delete_for(&exist, Decimal::new(11, 1), Decimal::new(12, 1)));

        let result = verify_for_delete(&store, &exist, None);

        assert_eq!(
            result,
            Err(VerifyError::Fault(VerificationFault::violation(
                "Found InstanceDeletes for non-delete exist"
            )))
        );
    }

    #[test]
    fn live_exists_ignores_delete_after_period_end() {
        let store = MemoryStore::new();
        let mut exist = exists_fixture(Decimal::new(11, 1));
        exist.audit_period_ending = Decimal::new(13, 1);
        store.insert_delete(delete_for(&exist, Decimal::new(11, 1), Decimal::new(90, 1)));

        assert_eq!(verify_for_delete(&store, &exist, None), Ok(()));
    }
}
