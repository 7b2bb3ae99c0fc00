use rust_decimal::Decimal;

use crate::error::{SearchParams, VerificationFault, VerifyError};
use crate::store::{fetch_typed, Filter, NumericField, Order, RecordStore, StoredRecord};
use crate::timestamp::second_window;

/// Filter for `instance` records launched within the same second as `launched_at`.
#[must_use]
pub fn same_second_filter(instance: &str, launched_at: Decimal) -> Filter {
    let (start, end) = second_window(launched_at);
    Filter::new()
        .instance(instance)
        .gte(NumericField::LaunchedAt, start)
        .lte(NumericField::LaunchedAt, end)
}

/// Locate the single `T` launched in the same second as `launched_at`.
///
/// A coarse instance-only count runs first so a categorically missing record
/// never pays for the windowed query, and so the fault names only `instance`.
///
/// # Errors
/// - [`VerificationFault::NotFound`] when no candidate exists,
/// - [`VerificationFault::AmbiguousResults`] when two or more candidates match,
/// - [`VerifyError::Store`] when the store fails.
pub fn find_in_window<T: StoredRecord>(
    store: &dyn RecordStore,
    instance: &str,
    launched_at: Decimal,
) -> Result<T, VerifyError> {
    let object_type = T::KIND.object_type();

    let coarse = Filter::new().instance(instance);
    if store.count_matching(T::KIND, &coarse)? == 0 {
        return Err(VerificationFault::NotFound {
            object_type,
            search_params: instance_params(instance),
        }
        .into());
    }

    let windowed = same_second_filter(instance, launched_at);
    let search_params = launch_params(instance, launched_at);
    match store.count_matching(T::KIND, &windowed)? {
        0 => Err(VerificationFault::NotFound { object_type, search_params }.into()),
        1 => fetch_typed::<T>(store, &windowed, Order::IdAscending, Some(1))?
            .into_iter()
            .next()
            .ok_or_else(|| VerificationFault::NotFound { object_type, search_params }.into()),
        _ => Err(VerificationFault::AmbiguousResults { object_type, search_params }.into()),
    }
}

#[must_use]
pub fn instance_params(instance: &str) -> SearchParams {
    SearchParams::from([("instance".to_string(), instance.to_string())])
}

#[must_use]
pub fn launch_params(instance: &str, launched_at: Decimal) -> SearchParams {
    let mut params = instance_params(instance);
    params.insert("launched_at".to_string(), launched_at.to_string());
    params
}
