use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{DeleteRecord, ExistsRecord, ExistsStatus, ReconcileRecord, UsageRecord};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Exists,
    Usage,
    Delete,
    Reconcile,
}

impl RecordKind {
    /// Name used in lookup faults and failure reasons.
    #[must_use]
    pub fn object_type(self) -> &'static str {
        match self {
            Self::Exists => "InstanceExists",
            Self::Usage => "InstanceUsage",
            Self::Delete => "InstanceDeletes",
            Self::Reconcile => "InstanceReconcile",
        }
    }

    #[must_use]
    pub fn supports(self, field: NumericField) -> bool {
        match field {
            NumericField::LaunchedAt => true,
            NumericField::DeletedAt => !matches!(self, Self::Usage),
            NumericField::AuditPeriodEnding => matches!(self, Self::Exists),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NumericField {
    LaunchedAt,
    DeletedAt,
    AuditPeriodEnding,
}

impl NumericField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LaunchedAt => "launched_at",
            Self::DeletedAt => "deleted_at",
            Self::AuditPeriodEnding => "audit_period_ending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Instance(String),
    Status(ExistsStatus),
    Gte(NumericField, Decimal),
    Lte(NumericField, Decimal),
}

/// Conjunction of exact-match and inclusive range conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn instance(mut self, instance: &str) -> Self {
        self.conditions.push(Condition::Instance(instance.to_string()));
        self
    }

    #[must_use]
    pub fn status(mut self, status: ExistsStatus) -> Self {
        self.conditions.push(Condition::Status(status));
        self
    }

    #[must_use]
    pub fn gte(mut self, field: NumericField, value: Decimal) -> Self {
        self.conditions.push(Condition::Gte(field, value));
        self
    }

    #[must_use]
    pub fn lte(mut self, field: NumericField, value: Decimal) -> Self {
        self.conditions.push(Condition::Lte(field, value));
        self
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Reject conditions the record kind has no column for.
    ///
    /// # Errors
    /// Returns [`StoreError::UnsupportedFilter`] or
    /// [`StoreError::UnsupportedStatusFilter`] for the first offending condition.
    pub fn check_supported(&self, kind: RecordKind) -> Result<(), StoreError> {
        for condition in &self.conditions {
            match condition {
                Condition::Instance(_) => {}
                Condition::Status(_) if kind != RecordKind::Exists => {
                    return Err(StoreError::UnsupportedStatusFilter(kind));
                }
                Condition::Status(_) => {}
                Condition::Gte(field, _) | Condition::Lte(field, _) => {
                    if !kind.supports(*field) {
                        return Err(StoreError::UnsupportedFilter { kind, field: *field });
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Order {
    Unordered,
    IdAscending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Exists(ExistsRecord),
    Usage(UsageRecord),
    Delete(DeleteRecord),
    Reconcile(ReconcileRecord),
}

impl Record {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Exists(_) => RecordKind::Exists,
            Self::Usage(_) => RecordKind::Usage,
            Self::Delete(_) => RecordKind::Delete,
            Self::Reconcile(_) => RecordKind::Reconcile,
        }
    }
}

/// Typed view over one [`RecordKind`].
pub trait StoredRecord: Sized {
    const KIND: RecordKind;

    fn from_record(record: Record) -> Option<Self>;
}

impl StoredRecord for ExistsRecord {
    const KIND: RecordKind = RecordKind::Exists;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Exists(exist) => Some(exist),
            _ => None,
        }
    }
}

impl StoredRecord for UsageRecord {
    const KIND: RecordKind = RecordKind::Usage;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Usage(usage) => Some(usage),
            _ => None,
        }
    }
}

impl StoredRecord for DeleteRecord {
    const KIND: RecordKind = RecordKind::Delete;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Delete(delete) => Some(delete),
            _ => None,
        }
    }
}

impl StoredRecord for ReconcileRecord {
    const KIND: RecordKind = RecordKind::Reconcile;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Reconcile(reconcile) => Some(reconcile),
            _ => None,
        }
    }
}

/// Queryable persistence for exists, usage, delete and reconcile records.
///
/// Implementations must make `save` atomic per row; workers share one store.
pub trait RecordStore: Send + Sync {
    /// Count records of `kind` matching every condition in `filter`.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the filter is unsupported or the backend fails.
    fn count_matching(&self, kind: RecordKind, filter: &Filter) -> Result<u64, StoreError>;

    /// Fetch records of `kind` matching `filter`, optionally ordered and capped.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the filter is unsupported or the backend fails.
    fn fetch_matching(
        &self,
        kind: RecordKind,
        filter: &Filter,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Persist an exists record in place.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the row is missing or the write fails.
    fn save(&self, exist: &ExistsRecord) -> Result<(), StoreError>;
}

/// [`RecordStore::fetch_matching`] narrowed to one record type.
///
/// # Errors
/// Returns a [`StoreError`] from the backend, or [`StoreError::Decode`] when
/// the backend hands back a record of another kind.
pub fn fetch_typed<T: StoredRecord>(
    store: &dyn RecordStore,
    filter: &Filter,
    order: Order,
    limit: Option<usize>,
) -> Result<Vec<T>, StoreError> {
    store
        .fetch_matching(T::KIND, filter, order, limit)?
        .into_iter()
        .map(|record| {
            let found = record.kind();
            T::from_record(record).ok_or_else(|| {
                StoreError::Decode(format!(
                    "expected {} record, store returned {}",
                    T::KIND.object_type(),
                    found.object_type()
                ))
            })
        })
        .collect()
}
