//! In-process [`RecordStore`] used by tests and embedders without a database.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::model::{DeleteRecord, ExistsRecord, ReconcileRecord, UsageRecord};
use crate::store::{Condition, Filter, NumericField, Order, Record, RecordKind, RecordStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryLogEntry {
    Count(RecordKind, Filter),
    Fetch(RecordKind, Filter),
}

impl QueryLogEntry {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Count(kind, _) | Self::Fetch(kind, _) => *kind,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    exists: BTreeMap<i64, ExistsRecord>,
    usages: Vec<UsageRecord>,
    deletes: Vec<DeleteRecord>,
    reconciles: Vec<ReconcileRecord>,
    query_log: Vec<QueryLogEntry>,
    save_log: Vec<ExistsRecord>,
    failing_kinds: BTreeSet<RecordKind>,
    fail_saves: bool,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, kind: RecordKind, filter: &Filter) -> Result<(), StoreError> {
        filter.check_supported(kind)?;
        if self.failing_kinds.contains(&kind) {
            return Err(StoreError::Backend(format!(
                "{} queries are unavailable",
                kind.object_type()
            )));
        }
        Ok(())
    }

    fn matching(&self, kind: RecordKind, filter: &Filter) -> Vec<Record> {
        let records: Vec<Record> = match kind {
            RecordKind::Exists => self.exists.values().cloned().map(Record::Exists).collect(),
            RecordKind::Usage => self.usages.iter().cloned().map(Record::Usage).collect(),
            RecordKind::Delete => self.deletes.iter().cloned().map(Record::Delete).collect(),
            RecordKind::Reconcile => {
                self.reconciles.iter().cloned().map(Record::Reconcile).collect()
            }
        };
        records.into_iter().filter(|record| matches_filter(record, filter)).collect()
    }
}

/// Thread-safe in-memory store that also records every query and save.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an exists record, assigning it a fresh id.
    pub fn insert_exists(&self, mut exist: ExistsRecord) -> i64 {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        exist.id = id;
        state.exists.insert(id, exist);
        id
    }

    pub fn insert_usage(&self, mut usage: UsageRecord) -> i64 {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        usage.id = id;
        state.usages.push(usage);
        id
    }

    pub fn insert_delete(&self, mut delete: DeleteRecord) -> i64 {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        delete.id = id;
        state.deletes.push(delete);
        id
    }

    pub fn insert_reconcile(&self, mut reconcile: ReconcileRecord) -> i64 {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        reconcile.id = id;
        state.reconciles.push(reconcile);
        id
    }

    #[must_use]
    pub fn exists(&self, id: i64) -> Option<ExistsRecord> {
        self.state.lock().exists.get(&id).cloned()
    }

    /// Every record passed to `save`, in call order.
    #[must_use]
    pub fn save_log(&self) -> Vec<ExistsRecord> {
        self.state.lock().save_log.clone()
    }

    #[must_use]
    pub fn query_log(&self) -> Vec<QueryLogEntry> {
        self.state.lock().query_log.clone()
    }

    /// Make every query against `kind` fail with a backend error.
    pub fn fail_queries_for(&self, kind: RecordKind) {
        self.state.lock().failing_kinds.insert(kind);
    }

    pub fn fail_saves(&self) {
        self.state.lock().fail_saves = true;
    }
}

impl RecordStore for MemoryStore {
    fn count_matching(&self, kind: RecordKind, filter: &Filter) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.query_log.push(QueryLogEntry::Count(kind, filter.clone()));
        state.check(kind, filter)?;
        Ok(u64::try_from(state.matching(kind, filter).len()).unwrap_or(u64::MAX))
    }

    fn fetch_matching(
        &self,
        kind: RecordKind,
        filter: &Filter,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        let mut state = self.state.lock();
        state.query_log.push(QueryLogEntry::Fetch(kind, filter.clone()));
        state.check(kind, filter)?;
        let mut records = state.matching(kind, filter);
        if order == Order::IdAscending {
            records.sort_by_key(record_id);
        }
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn save(&self, exist: &ExistsRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.fail_saves {
            return Err(StoreError::Backend("saves are unavailable".to_string()));
        }
        let Some(slot) = state.exists.get_mut(&exist.id) else {
            return Err(StoreError::Backend(format!("no InstanceExists row with id {}", exist.id)));
        };
        *slot = exist.clone();
        state.save_log.push(exist.clone());
        Ok(())
    }
}

fn record_id(record: &Record) -> i64 {
    match record {
        Record::Exists(exist) => exist.id,
        Record::Usage(usage) => usage.id,
        Record::Delete(delete) => delete.id,
        Record::Reconcile(reconcile) => reconcile.id,
    }
}

fn record_instance(record: &Record) -> &str {
    match record {
        Record::Exists(exist) => &exist.instance,
        Record::Usage(usage) => &usage.instance,
        Record::Delete(delete) => &delete.instance,
        Record::Reconcile(reconcile) => &reconcile.instance,
    }
}

fn record_numeric(record: &Record, field: NumericField) -> Option<Decimal> {
    match (record, field) {
        (Record::Exists(exist), NumericField::LaunchedAt) => exist.launched_at,
        (Record::Exists(exist), NumericField::DeletedAt) => exist.deleted_at,
        (Record::Exists(exist), NumericField::AuditPeriodEnding) => {
            Some(exist.audit_period_ending)
        }
        (Record::Usage(usage), NumericField::LaunchedAt) => Some(usage.launched_at),
        (Record::Delete(delete), NumericField::LaunchedAt) => Some(delete.launched_at),
        (Record::Delete(delete), NumericField::DeletedAt) => Some(delete.deleted_at),
        (Record::Reconcile(reconcile), NumericField::LaunchedAt) => Some(reconcile.launched_at),
        (Record::Reconcile(reconcile), NumericField::DeletedAt) => reconcile.deleted_at,
        _ => None,
    }
}

// Range conditions never match a missing value, as in SQL.
fn matches_filter(record: &Record, filter: &Filter) -> bool {
    filter.conditions().iter().all(|condition| match condition {
        Condition::Instance(instance) => record_instance(record) == instance,
        Condition::Status(status) => {
            matches!(record, Record::Exists(exist) if exist.status == *status)
        }
        Condition::Gte(field, bound) => record_numeric(record, *field).is_some_and(|v| v >= *bound),
        Condition::Lte(field, bound) => record_numeric(record, *field).is_some_and(|v| v <= *bound),
    })
}
