use tracing::debug;

use crate::error::{VerificationFault, VerifyError};
use crate::model::{ExistsRecord, ReconcileRecord};
use crate::store::RecordStore;
use crate::verify::{verify_for_delete, verify_for_launch, NO_LAUNCHED_AT_REASON};
use crate::window::find_in_window;

/// Re-verify `exist` against an operator-supplied reconcile record.
///
/// `trigger` is the fault that sent the record here; it is only logged.
///
/// # Errors
/// - [`VerificationFault::NotFound`] for `InstanceReconcile` when no correction
///   exists, which callers treat as "no rescue available",
/// - any fault raised while checking the corrected values,
/// - [`VerifyError::Store`] when the store fails.
pub fn verify_with_reconciled_data(
    store: &dyn RecordStore,
    exist: &ExistsRecord,
    trigger: Option<&VerificationFault>,
) -> Result<(), VerifyError> {
    let Some(launched_at) = exist.launched_at else {
        return Err(VerificationFault::violation(NO_LAUNCHED_AT_REASON).into());
    };
    debug!(
        exists_id = exist.id,
        instance = %exist.instance,
        trigger = trigger.map(VerificationFault::kind_name),
        "consulting reconcile records"
    );

    let reconciled = find_in_window::<ReconcileRecord>(store, &exist.instance, launched_at)?;

    verify_for_launch(store, exist, Some(&reconciled))?;
    if reconciled.deleted_at.is_some() {
        verify_for_delete(store, exist, Some(&reconciled))
    } else {
        verify_for_delete(store, exist, None)
    }
}
