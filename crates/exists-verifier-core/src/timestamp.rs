//! Decimal-seconds timestamps as carried by exists, usage and delete records.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use time::OffsetDateTime;

/// Microsecond precision used for stored timestamps.
pub const MICROS_SCALE: u32 = 6;

/// Upper bound offset of a same-second window, kept inclusive under decimal
/// arithmetic.
#[must_use]
pub fn window_span() -> Decimal {
    Decimal::new(999_999, MICROS_SCALE)
}

/// `[floor(t), floor(t) + 0.999999]`
#[must_use]
pub fn second_window(value: Decimal) -> (Decimal, Decimal) {
    let start = value.floor();
    (start, start + window_span())
}

/// Two timestamps match when they fall in the same whole second.
#[must_use]
pub fn same_second(lhs: Decimal, rhs: Decimal) -> bool {
    lhs.floor() == rhs.floor()
}

#[must_use]
pub fn from_datetime(value: OffsetDateTime) -> Decimal {
    Decimal::from(value.unix_timestamp())
        + Decimal::new(i64::from(value.microsecond()), MICROS_SCALE)
}

/// Truncate to whole microseconds for integer storage.
#[must_use]
pub fn to_micros(value: Decimal) -> Option<i64> {
    (value * Decimal::from(1_000_000_i64)).trunc().to_i64()
}

#[must_use]
pub fn from_micros(micros: i64) -> Decimal {
    Decimal::new(micros, MICROS_SCALE).normalize()
}
