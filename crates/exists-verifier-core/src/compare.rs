use rust_decimal::Decimal;

use crate::error::{FieldValue, VerificationFault};
use crate::timestamp::same_second;

/// Fail with [`VerificationFault::FieldMismatch`] unless both values are equal.
///
/// # Errors
/// Returns the mismatch carrying `expected` and `actual` unchanged.
pub fn compare_exact<V>(
    field_name: &'static str,
    expected: V,
    actual: V,
) -> Result<(), VerificationFault>
where
    V: PartialEq + Into<FieldValue>,
{
    if expected == actual {
        return Ok(());
    }
    Err(VerificationFault::FieldMismatch {
        field_name,
        expected: expected.into(),
        actual: actual.into(),
    })
}

/// Same-second comparison used for `launched_at`: `floor(a) == floor(b)`.
///
/// # Errors
/// Returns a mismatch reporting the untruncated values.
pub fn compare_same_second(
    field_name: &'static str,
    expected: Decimal,
    actual: Decimal,
) -> Result<(), VerificationFault> {
    if same_second(expected, actual) {
        return Ok(());
    }
    Err(VerificationFault::FieldMismatch {
        field_name,
        expected: expected.into(),
        actual: actual.into(),
    })
}
