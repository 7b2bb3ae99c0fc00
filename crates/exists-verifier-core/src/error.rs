use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use rust_decimal::Decimal;

use crate::store::{NumericField, RecordKind};

/// Search parameters echoed back by lookup faults, keyed by field name.
pub type SearchParams = BTreeMap<String, String>;

/// One side of a field comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Timestamp(Decimal),
    Text(String),
    Null,
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timestamp(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Null => f.write_str("None"),
        }
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Option<Decimal>> for FieldValue {
    fn from(value: Option<Decimal>) -> Self {
        value.map_or(Self::Null, Self::Timestamp)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Reason-bearing verification failures. The `Display` output is what gets
/// persisted as an exists record's failure reason.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum VerificationFault {
    #[error("Expected {field_name} to be '{expected}' got '{actual}'")]
    FieldMismatch { field_name: &'static str, expected: FieldValue, actual: FieldValue },
    #[error("Couldn't find {object_type} using {}", render_params(.search_params))]
    NotFound { object_type: &'static str, search_params: SearchParams },
    #[error("Ambiguous results for {object_type} using {}", render_params(.search_params))]
    AmbiguousResults { object_type: &'static str, search_params: SearchParams },
    #[error("{reason}")]
    Violation { reason: String },
}

impl VerificationFault {
    #[must_use]
    pub fn violation(reason: impl Into<String>) -> Self {
        Self::Violation { reason: reason.into() }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::FieldMismatch { .. } => "FieldMismatch",
            Self::NotFound { .. } => "NotFound",
            Self::AmbiguousResults { .. } => "AmbiguousResults",
            Self::Violation { .. } => "Violation",
        }
    }
}

fn render_params(params: &SearchParams) -> String {
    let rendered =
        params.iter().map(|(key, value)| format!("'{key}': '{value}'")).collect::<Vec<_>>();
    format!("{{{}}}", rendered.join(", "))
}

/// Failures raised by a [`crate::RecordStore`] backend.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store decode error: {0}")]
    Decode(String),
    #[error("{} records cannot be filtered by {}", .kind.object_type(), .field.as_str())]
    UnsupportedFilter { kind: RecordKind, field: NumericField },
    #[error("{} records cannot be filtered by status", .0.object_type())]
    UnsupportedStatusFilter(RecordKind),
}

/// Everything the verifiers can return. `Store` is the unclassified class:
/// it is never handed to the reconciler.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum VerifyError {
    #[error(transparent)]
    Fault(#[from] VerificationFault),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VerifyError {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Fault(fault) => fault.kind_name(),
            Self::Store(_) => "StoreError",
        }
    }

    /// Text persisted as the exists record's failure reason: the fault's own
    /// message, or the kind name when a store failure carries no fault.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        match self {
            Self::Fault(fault) => fault.to_string(),
            Self::Store(_) => self.kind_name().to_string(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fault(VerificationFault::NotFound { .. }))
    }
}
