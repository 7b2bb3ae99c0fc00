use std::path::Path;

use anyhow::{anyhow, Context, Result};
use exists_verifier_core::timestamp::{from_micros, to_micros};
use exists_verifier_core::{
    Condition, DeleteRecord, ExistsRecord, ExistsStatus, Filter, Order, Record, RecordKind,
    RecordStore, ReconcileRecord, StoreError, UsageRecord,
};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::info;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// Timestamps are integer microseconds since the epoch.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS instance_usage (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance TEXT NOT NULL,
  launched_at INTEGER NOT NULL,
  instance_type_id TEXT NOT NULL,
  tenant TEXT NOT NULL,
  rax_options TEXT NOT NULL,
  os_distro TEXT NOT NULL,
  os_architecture TEXT NOT NULL,
  os_version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instance_deletes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance TEXT NOT NULL,
  launched_at INTEGER NOT NULL,
  deleted_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS instance_reconcile (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance TEXT NOT NULL,
  launched_at INTEGER NOT NULL,
  deleted_at INTEGER,
  instance_type_id TEXT NOT NULL,
  tenant TEXT NOT NULL,
  rax_options TEXT NOT NULL,
  os_distro TEXT NOT NULL,
  os_architecture TEXT NOT NULL,
  os_version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instance_exists (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance TEXT NOT NULL,
  tenant TEXT NOT NULL,
  launched_at INTEGER,
  deleted_at INTEGER,
  instance_type_id TEXT NOT NULL,
  rax_options TEXT NOT NULL,
  os_distro TEXT NOT NULL,
  os_architecture TEXT NOT NULL,
  os_version TEXT NOT NULL,
  audit_period_beginning INTEGER,
  audit_period_ending INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','verifying','verified','failed')),
  fail_reason TEXT,
  usage_id INTEGER,
  delete_id INTEGER,
  raw_json TEXT NOT NULL,
  FOREIGN KEY (usage_id) REFERENCES instance_usage(id),
  FOREIGN KEY (delete_id) REFERENCES instance_deletes(id)
);

CREATE INDEX IF NOT EXISTS idx_instance_usage_launch ON instance_usage(instance, launched_at);
CREATE INDEX IF NOT EXISTS idx_instance_deletes_launch ON instance_deletes(instance, launched_at);
CREATE INDEX IF NOT EXISTS idx_instance_reconcile_launch ON instance_reconcile(instance, launched_at);
CREATE INDEX IF NOT EXISTS idx_instance_exists_status ON instance_exists(status, audit_period_ending);
";

const EXISTS_SELECT_SQL: &str = "SELECT
    t.id, t.instance, t.tenant, t.launched_at, t.deleted_at,
    t.instance_type_id, t.rax_options, t.os_distro, t.os_architecture, t.os_version,
    t.audit_period_beginning, t.audit_period_ending, t.status, t.fail_reason, t.raw_json,
    u.id, u.instance, u.launched_at, u.instance_type_id, u.tenant,
    u.rax_options, u.os_distro, u.os_architecture, u.os_version,
    d.id, d.instance, d.launched_at, d.deleted_at
 FROM instance_exists t
 LEFT JOIN instance_usage u ON u.id = t.usage_id
 LEFT JOIN instance_deletes d ON d.id = t.delete_id";

const USAGE_SELECT_SQL: &str = "SELECT
    t.id, t.instance, t.launched_at, t.instance_type_id, t.tenant,
    t.rax_options, t.os_distro, t.os_architecture, t.os_version
 FROM instance_usage t";

const DELETE_SELECT_SQL: &str =
    "SELECT t.id, t.instance, t.launched_at, t.deleted_at FROM instance_deletes t";

const RECONCILE_SELECT_SQL: &str = "SELECT
    t.id, t.instance, t.launched_at, t.deleted_at, t.instance_type_id, t.tenant,
    t.rax_options, t.os_distro, t.os_architecture, t.os_version
 FROM instance_reconcile t";

// Column offsets of the joined usage and delete rows in EXISTS_SELECT_SQL.
const EXISTS_USAGE_OFFSET: usize = 15;
const EXISTS_DELETE_OFFSET: usize = 24;

/// [`RecordStore`] over a single `SQLite` connection shared by all workers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// An exists row linking to a usage or delete row that no longer exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingLink {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
}

/// Startup health of a verifier database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHealth {
    /// First line of `PRAGMA quick_check`; `"ok"` when the file is sound.
    pub quick_check: String,
    pub dangling_links: Vec<DanglingLink>,
    /// Exists records left VERIFYING by a run that stopped mid-pass. The
    /// scheduler only selects PENDING records, so these stay put until
    /// ingestion re-enqueues them.
    pub stranded_verifying: u64,
}

impl StoreHealth {
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.quick_check != "ok"
    }
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn.lock();
        schema_status(&conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;
        if version == 0 {
            let tx = conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            info!(version = 1, "applied schema migration");
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Insert an exists record, linking its usage and delete by id when present.
    /// The record's own `id` is ignored.
    ///
    /// # Errors
    /// Returns an error when a timestamp is out of range or the insert fails.
    pub fn insert_exists(&self, exist: &ExistsRecord) -> Result<i64> {
        let columns = ExistsColumns::from_record(exist)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instance_exists(
                instance, tenant, launched_at, deleted_at,
                instance_type_id, rax_options, os_distro, os_architecture, os_version,
                audit_period_beginning, audit_period_ending, status, fail_reason,
                usage_id, delete_id, raw_json
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13,
                ?14, ?15, ?16
            )",
            params![
                exist.instance,
                exist.tenant,
                columns.launched_at,
                columns.deleted_at,
                exist.instance_type_id,
                exist.rax_options,
                exist.os_distro,
                exist.os_architecture,
                exist.os_version,
                columns.audit_period_beginning,
                columns.audit_period_ending,
                exist.status.as_str(),
                exist.fail_reason,
                exist.usage.as_ref().map(|usage| usage.id),
                exist.delete.as_ref().map(|delete| delete.id),
                exist.raw_json,
            ],
        )
        .context("failed to insert exists record")?;
        Ok(conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when the timestamp is out of range or the insert fails.
    pub fn insert_usage(&self, usage: &UsageRecord) -> Result<i64> {
        let launched_at = micros(usage.launched_at)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instance_usage(
                instance, launched_at, instance_type_id, tenant,
                rax_options, os_distro, os_architecture, os_version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                usage.instance,
                launched_at,
                usage.instance_type_id,
                usage.tenant,
                usage.rax_options,
                usage.os_distro,
                usage.os_architecture,
                usage.os_version,
            ],
        )
        .context("failed to insert usage record")?;
        Ok(conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when a timestamp is out of range or the insert fails.
    pub fn insert_delete(&self, delete: &DeleteRecord) -> Result<i64> {
        let launched_at = micros(delete.launched_at)?;
        let deleted_at = micros(delete.deleted_at)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instance_deletes(instance, launched_at, deleted_at) VALUES (?1, ?2, ?3)",
            params![delete.instance, launched_at, deleted_at],
        )
        .context("failed to insert delete record")?;
        Ok(conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when a timestamp is out of range or the insert fails.
    pub fn insert_reconcile(&self, reconcile: &ReconcileRecord) -> Result<i64> {
        let launched_at = micros(reconcile.launched_at)?;
        let deleted_at = reconcile.deleted_at.map(micros).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instance_reconcile(
                instance, launched_at, deleted_at, instance_type_id, tenant,
                rax_options, os_distro, os_architecture, os_version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                reconcile.instance,
                launched_at,
                deleted_at,
                reconcile.instance_type_id,
                reconcile.tenant,
                reconcile.rax_options,
                reconcile.os_distro,
                reconcile.os_architecture,
                reconcile.os_version,
            ],
        )
        .context("failed to insert reconcile record")?;
        Ok(conn.last_insert_rowid())
    }

    /// Check file integrity, exists links, and records stranded mid-verification.
    ///
    /// # Errors
    /// Returns an error when any of the health queries fails.
    pub fn health_check(&self) -> Result<StoreHealth> {
        let conn = self.conn.lock();
        let quick_check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = conn
            .prepare("PRAGMA foreign_key_check(instance_exists)")
            .context("failed to prepare foreign key check")?;
        let dangling_links = stmt
            .query_map([], |row| {
                Ok(DanglingLink { table: row.get(0)?, rowid: row.get(1)?, parent: row.get(2)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read foreign key check")?;

        let stranded: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM instance_exists WHERE status = ?1",
                params![ExistsStatus::Verifying.as_str()],
                |row| row.get(0),
            )
            .context("failed to count VERIFYING exists records")?;

        Ok(StoreHealth {
            quick_check,
            dangling_links,
            stranded_verifying: u64::try_from(stranded).unwrap_or_default(),
        })
    }
}

impl RecordStore for SqliteStore {
    fn count_matching(&self, kind: RecordKind, filter: &Filter) -> Result<u64, StoreError> {
        let (where_sql, values) = where_clause(kind, filter)?;
        let sql = format!("SELECT COUNT(*) FROM {} t{where_sql}", table_name(kind));
        let conn = self.conn.lock();
        let count = conn
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get::<_, i64>(0))
            .map_err(backend)?;
        u64::try_from(count).map_err(|_| StoreError::Decode(format!("negative count {count}")))
    }

    fn fetch_matching(
        &self,
        kind: RecordKind,
        filter: &Filter,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        let (where_sql, mut values) = where_clause(kind, filter)?;
        let mut sql = format!("{}{where_sql}", select_sql(kind));
        if order == Order::IdAscending {
            sql.push_str(" ORDER BY t.id ASC");
        }
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let mut rows = stmt.query(params_from_iter(values.iter())).map_err(backend)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            let record = match kind {
                RecordKind::Exists => Record::Exists(exists_from_row(row)?),
                RecordKind::Usage => Record::Usage(usage_from_row(row, 0).map_err(backend)?),
                RecordKind::Delete => Record::Delete(delete_from_row(row, 0).map_err(backend)?),
                RecordKind::Reconcile => {
                    Record::Reconcile(reconcile_from_row(row).map_err(backend)?)
                }
            };
            records.push(record);
        }
        Ok(records)
    }

    fn save(&self, exist: &ExistsRecord) -> Result<(), StoreError> {
        let columns = ExistsColumns::from_record(exist)?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE instance_exists SET
                    instance = ?1, tenant = ?2, launched_at = ?3, deleted_at = ?4,
                    instance_type_id = ?5, rax_options = ?6, os_distro = ?7,
                    os_architecture = ?8, os_version = ?9,
                    audit_period_beginning = ?10, audit_period_ending = ?11,
                    status = ?12, fail_reason = ?13, usage_id = ?14, delete_id = ?15,
                    raw_json = ?16
                 WHERE id = ?17",
                params![
                    exist.instance,
                    exist.tenant,
                    columns.launched_at,
                    columns.deleted_at,
                    exist.instance_type_id,
                    exist.rax_options,
                    exist.os_distro,
                    exist.os_architecture,
                    exist.os_version,
                    columns.audit_period_beginning,
                    columns.audit_period_ending,
                    exist.status.as_str(),
                    exist.fail_reason,
                    exist.usage.as_ref().map(|usage| usage.id),
                    exist.delete.as_ref().map(|delete| delete.id),
                    exist.raw_json,
                    exist.id,
                ],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::Backend(format!(
                "no InstanceExists row with id {}",
                exist.id
            )));
        }
        Ok(())
    }
}

struct ExistsColumns {
    launched_at: Option<i64>,
    deleted_at: Option<i64>,
    audit_period_beginning: Option<i64>,
    audit_period_ending: i64,
}

impl ExistsColumns {
    fn from_record(exist: &ExistsRecord) -> Result<Self, StoreError> {
        Ok(Self {
            launched_at: exist.launched_at.map(micros).transpose()?,
            deleted_at: exist.deleted_at.map(micros).transpose()?,
            audit_period_beginning: exist.audit_period_beginning.map(micros).transpose()?,
            audit_period_ending: micros(exist.audit_period_ending)?,
        })
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn micros(value: Decimal) -> Result<i64, StoreError> {
    to_micros(value).ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {value}")))
}

// Round range bounds inward so sub-microsecond bounds stay inclusive-exact.
fn bound_micros(value: Decimal, lower: bool) -> Result<i64, StoreError> {
    let scaled = value
        .checked_mul(Decimal::from(1_000_000_i64))
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {value}")))?;
    let rounded = if lower { scaled.ceil() } else { scaled.floor() };
    rounded.to_i64().ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {value}")))
}

fn table_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Exists => "instance_exists",
        RecordKind::Usage => "instance_usage",
        RecordKind::Delete => "instance_deletes",
        RecordKind::Reconcile => "instance_reconcile",
    }
}

fn select_sql(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Exists => EXISTS_SELECT_SQL,
        RecordKind::Usage => USAGE_SELECT_SQL,
        RecordKind::Delete => DELETE_SELECT_SQL,
        RecordKind::Reconcile => RECONCILE_SELECT_SQL,
    }
}

fn where_clause(kind: RecordKind, filter: &Filter) -> Result<(String, Vec<Value>), StoreError> {
    filter.check_supported(kind)?;

    let mut clauses = Vec::new();
    let mut values = Vec::new();
    for condition in filter.conditions() {
        match condition {
            Condition::Instance(instance) => {
                clauses.push("t.instance = ?".to_string());
                values.push(Value::Text(instance.clone()));
            }
            Condition::Status(status) => {
                clauses.push("t.status = ?".to_string());
                values.push(Value::Text(status.as_str().to_string()));
            }
            Condition::Gte(field, bound) => {
                clauses.push(format!("t.{} >= ?", field.as_str()));
                values.push(Value::Integer(bound_micros(*bound, true)?));
            }
            Condition::Lte(field, bound) => {
                clauses.push(format!("t.{} <= ?", field.as_str()));
                values.push(Value::Integer(bound_micros(*bound, false)?));
            }
        }
    }

    if clauses.is_empty() {
        return Ok((String::new(), values));
    }
    Ok((format!(" WHERE {}", clauses.join(" AND ")), values))
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    Ok(from_micros(row.get(idx)?))
}

fn optional_decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_micros))
}

fn usage_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(offset)?,
        instance: row.get(offset + 1)?,
        launched_at: decimal_at(row, offset + 2)?,
        instance_type_id: row.get(offset + 3)?,
        tenant: row.get(offset + 4)?,
        rax_options: row.get(offset + 5)?,
        os_distro: row.get(offset + 6)?,
        os_architecture: row.get(offset + 7)?,
        os_version: row.get(offset + 8)?,
    })
}

fn delete_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<DeleteRecord> {
    Ok(DeleteRecord {
        id: row.get(offset)?,
        instance: row.get(offset + 1)?,
        launched_at: decimal_at(row, offset + 2)?,
        deleted_at: decimal_at(row, offset + 3)?,
    })
}

fn reconcile_from_row(row: &Row<'_>) -> rusqlite::Result<ReconcileRecord> {
    Ok(ReconcileRecord {
        id: row.get(0)?,
        instance: row.get(1)?,
        launched_at: decimal_at(row, 2)?,
        deleted_at: optional_decimal_at(row, 3)?,
        instance_type_id: row.get(4)?,
        tenant: row.get(5)?,
        rax_options: row.get(6)?,
        os_distro: row.get(7)?,
        os_architecture: row.get(8)?,
        os_version: row.get(9)?,
    })
}

fn exists_from_row(row: &Row<'_>) -> Result<ExistsRecord, StoreError> {
    let status_raw: String = row.get(12).map_err(backend)?;
    let status = ExistsStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown exists status: {status_raw}")))?;

    let usage = match row.get::<_, Option<i64>>(EXISTS_USAGE_OFFSET).map_err(backend)? {
        Some(_) => Some(usage_from_row(row, EXISTS_USAGE_OFFSET).map_err(backend)?),
        None => None,
    };
    let delete = match row.get::<_, Option<i64>>(EXISTS_DELETE_OFFSET).map_err(backend)? {
        Some(_) => Some(delete_from_row(row, EXISTS_DELETE_OFFSET).map_err(backend)?),
        None => None,
    };

    let read = || -> rusqlite::Result<ExistsRecord> {
        Ok(ExistsRecord {
            id: row.get(0)?,
            instance: row.get(1)?,
            tenant: row.get(2)?,
            launched_at: optional_decimal_at(row, 3)?,
            deleted_at: optional_decimal_at(row, 4)?,
            instance_type_id: row.get(5)?,
            rax_options: row.get(6)?,
            os_distro: row.get(7)?,
            os_architecture: row.get(8)?,
            os_version: row.get(9)?,
            audit_period_beginning: optional_decimal_at(row, 10)?,
            audit_period_ending: decimal_at(row, 11)?,
            status,
            fail_reason: row.get(13)?,
            usage,
            delete,
            raw_json: row.get(14)?,
        })
    };
    read().map_err(backend)
}

fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
