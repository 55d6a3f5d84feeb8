#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use personnel_mutation_core::{
    format_rfc3339, now_utc, ActiveRecord, AddressCreateRequest, AddressRecord, EmploymentType,
    JobKey, JobRecord, JobStatus, LaborDistributionLine, MutationError, ParameterSet, Person,
    PersonLookup, PhoneCreateRequest, PhoneRecord, RecordKind, SessionFactory,
    TransactionalSession, WriteOperation,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

mod procedures;

const PERSONNEL_MIGRATION_VERSION: i64 = 1;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA_PERSONNEL_V1: &str = r"
CREATE TABLE IF NOT EXISTS persons (
  internal_id INTEGER PRIMARY KEY AUTOINCREMENT,
  person_id TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS change_reason_codes (
  code TEXT PRIMARY KEY,
  description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
  internal_id INTEGER NOT NULL,
  position_number TEXT NOT NULL,
  suffix TEXT NOT NULL,
  employment_type TEXT NOT NULL CHECK (employment_type IN ('student', 'graduate')),
  status TEXT NOT NULL CHECK (status IN ('active', 'terminated')),
  change_reason_code TEXT NOT NULL,
  effective_date TEXT,
  fields_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (internal_id, position_number, suffix),
  FOREIGN KEY (internal_id) REFERENCES persons(internal_id)
);

CREATE TABLE IF NOT EXISTS labor_distributions (
  internal_id INTEGER NOT NULL,
  position_number TEXT NOT NULL,
  suffix TEXT NOT NULL,
  line_number INTEGER NOT NULL CHECK (line_number >= 1),
  effective_date TEXT,
  account_index TEXT,
  fund TEXT,
  organization TEXT,
  account TEXT,
  program TEXT,
  activity TEXT,
  location TEXT,
  distribution_percent REAL,
  PRIMARY KEY (internal_id, position_number, suffix, line_number),
  FOREIGN KEY (internal_id, position_number, suffix)
    REFERENCES jobs(internal_id, position_number, suffix)
);

CREATE TABLE IF NOT EXISTS addresses (
  internal_id INTEGER NOT NULL,
  address_type TEXT NOT NULL,
  sequence_number INTEGER NOT NULL CHECK (sequence_number >= 1),
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  street_line1 TEXT NOT NULL,
  street_line2 TEXT,
  street_line3 TEXT,
  city TEXT NOT NULL,
  state_code TEXT,
  postal_code TEXT,
  nation_code TEXT,
  activity_date TEXT NOT NULL,
  PRIMARY KEY (internal_id, address_type, sequence_number),
  FOREIGN KEY (internal_id) REFERENCES persons(internal_id)
);

CREATE INDEX IF NOT EXISTS idx_addresses_active
  ON addresses(internal_id, address_type, active);

CREATE TABLE IF NOT EXISTS phones (
  internal_id INTEGER NOT NULL,
  phone_type TEXT NOT NULL,
  sequence_number INTEGER NOT NULL CHECK (sequence_number >= 1),
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  area_code TEXT,
  phone_number TEXT NOT NULL,
  phone_extension TEXT,
  primary_ind INTEGER NOT NULL CHECK (primary_ind IN (0, 1)),
  address_sequence_number INTEGER NOT NULL,
  activity_date TEXT NOT NULL,
  PRIMARY KEY (internal_id, phone_type, sequence_number),
  FOREIGN KEY (internal_id) REFERENCES persons(internal_id)
);

CREATE INDEX IF NOT EXISTS idx_phones_active
  ON phones(internal_id, phone_type, active);
";

const SEED_CHANGE_REASON_CODES: [(&str, &str); 8] = [
    ("HIRE", "New hire"),
    ("BREAP", "Employment type reappointment"),
    ("NONE", "No change; labor distribution only"),
    ("LCHNG", "Labor distribution change"),
    ("TERME", "Termination of employment"),
    ("TERMJ", "Termination of job"),
    ("PAYCH", "Pay change"),
    ("TRANS", "Transfer"),
];

const JOB_COLUMNS: &str = "internal_id, position_number, suffix, employment_type, status,
    change_reason_code, effective_date, fields_json, updated_at";

const ADDRESS_COLUMNS: &str = "internal_id, address_type, sequence_number, active, street_line1,
    street_line2, street_line3, city, state_code, postal_code, nation_code, activity_date";

const PHONE_COLUMNS: &str = "internal_id, phone_type, sequence_number, active, area_code,
    phone_number, phone_extension, primary_ind, address_sequence_number, activity_date";

/// Administrative handle over the personnel database: schema, seeding and reads.
pub struct SqlitePersonnelStore {
    conn: Connection,
    path: PathBuf,
}

impl SqlitePersonnelStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout)
            .context("failed to set sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(admin_error)
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(admin_error)
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_PERSONNEL_V1)
            .map_err(admin_error)
            .context("failed to apply personnel schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PERSONNEL_MIGRATION_VERSION, now],
            )
            .map_err(admin_error)
            .context("failed to register personnel schema migration")?;

        for (code, description) in SEED_CHANGE_REASON_CODES {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO change_reason_codes(code, description) VALUES (?1, ?2)",
                    params![code, description],
                )
                .map_err(admin_error)
                .with_context(|| format!("failed to seed change reason code {code}"))?;
        }

        tracing::debug!(
            version = PERSONNEL_MIGRATION_VERSION,
            "personnel schema migrated"
        );
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Session factory over the same database file.
    #[must_use]
    pub fn session_factory(&self, busy_timeout: Duration) -> SqliteSessionFactory {
        SqliteSessionFactory::new(&self.path, busy_timeout)
    }

    pub fn add_person(&self, person_id: &str) -> Result<Person> {
        if person_id.trim().is_empty() {
            return Err(anyhow!("person_id MUST be non-empty"));
        }

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO persons(person_id, created_at) VALUES (?1, ?2)",
                params![person_id, now],
            )
            .with_context(|| format!("failed to insert person {person_id}"))?;

        Ok(Person {
            person_id: person_id.to_string(),
            internal_id: self.conn.last_insert_rowid(),
        })
    }

    pub fn add_change_reason_code(&self, code: &str, description: &str) -> Result<()> {
        if code.trim().is_empty() {
            return Err(anyhow!("change reason code MUST be non-empty"));
        }

        self.conn
            .execute(
                "INSERT INTO change_reason_codes(code, description) VALUES (?1, ?2)
                 ON CONFLICT(code) DO UPDATE SET description = excluded.description",
                params![code, description],
            )
            .with_context(|| format!("failed to upsert change reason code {code}"))?;
        Ok(())
    }

    pub fn resolve_person(&self, person_id: &str) -> Result<Option<Person>> {
        query_person(&self.conn, person_id)
            .with_context(|| format!("failed to resolve person {person_id}"))
    }

    pub fn get_job(&self, internal_id: i64, key: &JobKey) -> Result<Option<JobRecord>> {
        query_job(&self.conn, internal_id, key)
            .with_context(|| format!("failed to load job {key}"))
    }

    pub fn list_jobs(&self, internal_id: i64) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT position_number, suffix FROM jobs
             WHERE internal_id = ?1
             ORDER BY position_number ASC, suffix ASC",
        )?;
        let rows = stmt.query_map(params![internal_id], |row| {
            Ok(JobKey {
                position_number: row.get(0)?,
                suffix: row.get(1)?,
            })
        })?;
        let keys = collect_rows(rows)?;

        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(job) = self.get_job(internal_id, &key)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub fn list_addresses(&self, internal_id: i64) -> Result<Vec<AddressRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses
             WHERE internal_id = ?1
             ORDER BY address_type ASC, sequence_number ASC"
        ))?;
        let rows = stmt.query_map(params![internal_id], parse_address_row)?;
        collect_rows(rows)
    }

    pub fn list_phones(&self, internal_id: i64) -> Result<Vec<PhoneRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PHONE_COLUMNS} FROM phones
             WHERE internal_id = ?1
             ORDER BY phone_type ASC, sequence_number ASC"
        ))?;
        let rows = stmt.query_map(params![internal_id], parse_phone_row)?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Opens one connection per session against a fixed database path.
#[derive(Debug, Clone)]
pub struct SqliteSessionFactory {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteSessionFactory {
    #[must_use]
    pub fn new(path: &Path, busy_timeout: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            busy_timeout,
        }
    }

    fn connect(&self) -> Result<Connection, MutationError> {
        let conn = Connection::open(&self.path).map_err(map_sqlite_error)?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(map_sqlite_error)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(map_sqlite_error)?;
        Ok(conn)
    }
}

impl SessionFactory for SqliteSessionFactory {
    type Session = SqliteSession;

    fn open_session(&self) -> Result<SqliteSession, MutationError> {
        let conn = self.connect()?;
        // Take the write lock up front so concurrent deactivate/insert pairs serialize.
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(map_sqlite_error)?;
        Ok(SqliteSession {
            conn,
            finished: false,
        })
    }
}

impl PersonLookup for SqliteSessionFactory {
    fn resolve(&self, person_id: &str) -> Result<Option<Person>, MutationError> {
        let conn = self.connect()?;
        query_person(&conn, person_id).map_err(map_sqlite_error)
    }
}

/// One `BEGIN IMMEDIATE` transaction. Dropping an unfinished session rolls back.
pub struct SqliteSession {
    conn: Connection,
    finished: bool,
}

impl SqliteSession {
    fn next_sequence(
        &self,
        kind: RecordKind,
        internal_id: i64,
        type_code: &str,
    ) -> Result<i64, MutationError> {
        let sql = match kind {
            RecordKind::Address => {
                "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM addresses
                 WHERE internal_id = ?1 AND address_type = ?2"
            }
            RecordKind::Phone => {
                "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM phones
                 WHERE internal_id = ?1 AND phone_type = ?2"
            }
        };
        self.conn
            .query_row(sql, params![internal_id, type_code], |row| row.get(0))
            .map_err(map_sqlite_error)
    }
}

impl TransactionalSession for SqliteSession {
    fn execute(
        &mut self,
        operation: WriteOperation,
        params: &ParameterSet,
    ) -> Result<Option<String>, MutationError> {
        tracing::debug!(operation = operation.as_str(), "executing job write");
        procedures::execute(&self.conn, operation, params)
    }

    fn change_reason_code_exists(&mut self, code: &str) -> Result<bool, MutationError> {
        let exists: i64 = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM change_reason_codes WHERE code = ?1)",
                params![code],
                |row| row.get(0),
            )
            .map_err(map_sqlite_error)?;
        Ok(exists == 1)
    }

    fn find_job(
        &mut self,
        internal_id: i64,
        key: &JobKey,
    ) -> Result<Option<JobRecord>, MutationError> {
        query_job(&self.conn, internal_id, key).map_err(map_sqlite_error)
    }

    fn active_records(
        &mut self,
        internal_id: i64,
        kind: RecordKind,
        type_code: &str,
    ) -> Result<Vec<ActiveRecord>, MutationError> {
        let sql = match kind {
            RecordKind::Address => {
                "SELECT sequence_number, NULL FROM addresses
                 WHERE internal_id = ?1 AND address_type = ?2 AND active = 1
                 ORDER BY sequence_number ASC"
            }
            RecordKind::Phone => {
                "SELECT sequence_number, address_sequence_number FROM phones
                 WHERE internal_id = ?1 AND phone_type = ?2 AND active = 1
                 ORDER BY sequence_number ASC"
            }
        };
        let mut stmt = self.conn.prepare(sql).map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params![internal_id, type_code], |row| {
                Ok(ActiveRecord {
                    kind,
                    internal_id,
                    type_code: type_code.to_string(),
                    sequence_number: row.get(0)?,
                    linked_sequence_number: row.get(1)?,
                })
            })
            .map_err(map_sqlite_error)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(map_sqlite_error)?);
        }
        Ok(records)
    }

    fn deactivate_record(&mut self, record: &ActiveRecord) -> Result<(), MutationError> {
        let now = format_rfc3339(now_utc())?;
        let sql = match record.kind {
            RecordKind::Address => {
                "UPDATE addresses SET active = 0, activity_date = ?4
                 WHERE internal_id = ?1 AND address_type = ?2 AND sequence_number = ?3 AND active = 1"
            }
            RecordKind::Phone => {
                "UPDATE phones SET active = 0, activity_date = ?4
                 WHERE internal_id = ?1 AND phone_type = ?2 AND sequence_number = ?3 AND active = 1"
            }
        };
        let changed = self
            .conn
            .execute(
                sql,
                params![
                    record.internal_id,
                    record.type_code,
                    record.sequence_number,
                    now
                ],
            )
            .map_err(map_sqlite_error)?;

        if changed != 1 {
            return Err(MutationError::IntegrityViolation(format!(
                "expected to deactivate one {} record {}/{}, changed {changed}",
                record.kind, record.type_code, record.sequence_number
            )));
        }
        Ok(())
    }

    fn insert_address(
        &mut self,
        internal_id: i64,
        request: &AddressCreateRequest,
    ) -> Result<AddressRecord, MutationError> {
        let sequence_number =
            self.next_sequence(RecordKind::Address, internal_id, &request.address_type)?;
        let now = format_rfc3339(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO addresses(
                    internal_id, address_type, sequence_number, active, street_line1,
                    street_line2, street_line3, city, state_code, postal_code, nation_code,
                    activity_date
                 ) VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    internal_id,
                    request.address_type,
                    sequence_number,
                    request.street_line1,
                    request.street_line2,
                    request.street_line3,
                    request.city,
                    request.state_code,
                    request.postal_code,
                    request.nation_code,
                    now
                ],
            )
            .map_err(map_sqlite_error)?;

        Ok(AddressRecord {
            internal_id,
            address_type: request.address_type.clone(),
            sequence_number,
            active: true,
            street_line1: request.street_line1.clone(),
            street_line2: request.street_line2.clone(),
            street_line3: request.street_line3.clone(),
            city: request.city.clone(),
            state_code: request.state_code.clone(),
            postal_code: request.postal_code.clone(),
            nation_code: request.nation_code.clone(),
            activity_date: now,
        })
    }

    fn insert_phone(
        &mut self,
        internal_id: i64,
        request: &PhoneCreateRequest,
        address_sequence_number: i64,
    ) -> Result<PhoneRecord, MutationError> {
        let sequence_number =
            self.next_sequence(RecordKind::Phone, internal_id, &request.phone_type)?;
        let now = format_rfc3339(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO phones(
                    internal_id, phone_type, sequence_number, active, area_code, phone_number,
                    phone_extension, primary_ind, address_sequence_number, activity_date
                 ) VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    internal_id,
                    request.phone_type,
                    sequence_number,
                    request.area_code,
                    request.phone_number,
                    request.phone_extension,
                    bool_to_sql(request.primary_ind),
                    address_sequence_number,
                    now
                ],
            )
            .map_err(map_sqlite_error)?;

        Ok(PhoneRecord {
            internal_id,
            phone_type: request.phone_type.clone(),
            sequence_number,
            active: true,
            area_code: request.area_code.clone(),
            phone_number: request.phone_number.clone(),
            phone_extension: request.phone_extension.clone(),
            primary_ind: request.primary_ind,
            address_sequence_number,
            activity_date: now,
        })
    }

    fn relink_phone_address(
        &mut self,
        phone: &ActiveRecord,
        address_sequence_number: i64,
    ) -> Result<(), MutationError> {
        let now = format_rfc3339(now_utc())?;
        let changed = self
            .conn
            .execute(
                "UPDATE phones SET address_sequence_number = ?4, activity_date = ?5
                 WHERE internal_id = ?1 AND phone_type = ?2 AND sequence_number = ?3",
                params![
                    phone.internal_id,
                    phone.type_code,
                    phone.sequence_number,
                    address_sequence_number,
                    now
                ],
            )
            .map_err(map_sqlite_error)?;

        if changed != 1 {
            return Err(MutationError::IntegrityViolation(format!(
                "phone {}/{} vanished while relinking",
                phone.type_code, phone.sequence_number
            )));
        }
        Ok(())
    }

    fn commit(mut self) -> Result<(), MutationError> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(map_sqlite_error)?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), MutationError> {
        self.finished = true;
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(map_sqlite_error)
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %err, "rollback of abandoned session failed");
        } else {
            tracing::debug!("abandoned session rolled back");
        }
    }
}

/// Lock contention on the admin connection surfaces as a retryable [`MutationError`].
fn admin_error(err: rusqlite::Error) -> anyhow::Error {
    if is_lock_contention(&err) {
        MutationError::TransientStore(err.to_string()).into()
    } else {
        err.into()
    }
}

fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Sorts a sqlite failure into the mutation error taxonomy.
#[must_use]
pub fn map_sqlite_error(err: rusqlite::Error) -> MutationError {
    match &err {
        _ if is_lock_contention(&err) => MutationError::TransientStore(err.to_string()),
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::CannotOpen => {
            MutationError::TransientStore(err.to_string())
        }
        _ => MutationError::Store(err.to_string()),
    }
}

fn query_person(conn: &Connection, person_id: &str) -> rusqlite::Result<Option<Person>> {
    conn.query_row(
        "SELECT person_id, internal_id FROM persons WHERE person_id = ?1",
        params![person_id],
        |row| {
            Ok(Person {
                person_id: row.get(0)?,
                internal_id: row.get(1)?,
            })
        },
    )
    .optional()
}

fn query_job(
    conn: &Connection,
    internal_id: i64,
    key: &JobKey,
) -> rusqlite::Result<Option<JobRecord>> {
    let job = conn
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE internal_id = ?1 AND position_number = ?2 AND suffix = ?3"
            ),
            params![internal_id, key.position_number, key.suffix],
            parse_job_row,
        )
        .optional()?;

    let Some(mut job) = job else {
        return Ok(None);
    };
    job.labor_distribution = query_labor_distribution(conn, internal_id, key)?;
    Ok(Some(job))
}

fn query_labor_distribution(
    conn: &Connection,
    internal_id: i64,
    key: &JobKey,
) -> rusqlite::Result<Vec<LaborDistributionLine>> {
    let mut stmt = conn.prepare(
        "SELECT effective_date, account_index, fund, organization, account, program,
                activity, location, distribution_percent
         FROM labor_distributions
         WHERE internal_id = ?1 AND position_number = ?2 AND suffix = ?3
         ORDER BY line_number ASC",
    )?;
    let rows = stmt.query_map(params![internal_id, key.position_number, key.suffix], |row| {
        Ok(LaborDistributionLine {
            effective_date: row.get(0)?,
            account_index: row.get(1)?,
            fund: row.get(2)?,
            organization: row.get(3)?,
            account: row.get(4)?,
            program: row.get(5)?,
            activity: row.get(6)?,
            location: row.get(7)?,
            distribution_percent: row.get(8)?,
        })
    })?;
    rows.collect()
}

fn parse_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let employment_type_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let fields_json: String = row.get(7)?;

    let employment_type = EmploymentType::parse(&employment_type_raw).ok_or_else(|| {
        invalid_column(3, format!("invalid employment_type: {employment_type_raw}"))
    })?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(4, format!("invalid status: {status_raw}")))?;
    let fields = serde_json::from_str(&fields_json)
        .map_err(|err| invalid_column(7, format!("invalid fields_json: {err}")))?;

    Ok(JobRecord {
        internal_id: row.get(0)?,
        position_number: row.get(1)?,
        suffix: row.get(2)?,
        employment_type,
        status,
        change_reason_code: row.get(5)?,
        effective_date: row.get(6)?,
        fields,
        labor_distribution: Vec::new(),
        updated_at: row.get(8)?,
    })
}

fn parse_address_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AddressRecord> {
    let active: i64 = row.get(3)?;
    Ok(AddressRecord {
        internal_id: row.get(0)?,
        address_type: row.get(1)?,
        sequence_number: row.get(2)?,
        active: active == 1,
        street_line1: row.get(4)?,
        street_line2: row.get(5)?,
        street_line3: row.get(6)?,
        city: row.get(7)?,
        state_code: row.get(8)?,
        postal_code: row.get(9)?,
        nation_code: row.get(10)?,
        activity_date: row.get(11)?,
    })
}

fn parse_phone_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhoneRecord> {
    let active: i64 = row.get(3)?;
    let primary_ind: i64 = row.get(7)?;
    Ok(PhoneRecord {
        internal_id: row.get(0)?,
        phone_type: row.get(1)?,
        sequence_number: row.get(2)?,
        active: active == 1,
        area_code: row.get(4)?,
        phone_number: row.get(5)?,
        phone_extension: row.get(6)?,
        primary_ind: primary_ind == 1,
        address_sequence_number: row.get(8)?,
        activity_date: row.get(9)?,
    })
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use personnel_mutation_core::{
        transform, ParamValue, LABOR_CHANGE_FIELDS, STANDARD_UPDATE_FIELDS, STUDENT_FIELDS,
    };
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_mutation<T>(result: Result<T, MutationError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("personnel-store-{}.sqlite3", Ulid::new()))
    }

    fn fixture_store() -> SqlitePersonnelStore {
        let store = must(SqlitePersonnelStore::open(&fixture_db_path()));
        must(store.migrate());
        store
    }

    fn fixture_params(person: &Person, code: &str, allowed: &[&str], extra: &Value) -> ParameterSet {
        let mut payload = json!({
            "positionNumber": "C50001",
            "suffix": "00",
            "employmentType": "student",
            "changeReason": { "code": code },
            "effectiveDate": "2026-01-05",
        });
        if let (Some(target), Some(source)) = (payload.as_object_mut(), extra.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        let payload = match serde_json::from_value(payload) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture payload: {err}"),
        };
        must_mutation(transform(person, &payload, allowed))
    }

    fn fixture_key() -> JobKey {
        JobKey {
            position_number: "C50001".to_string(),
            suffix: "00".to_string(),
        }
    }

    fn labor_lines(percents: &[u8]) -> Value {
        Value::Array(
            percents
                .iter()
                .enumerate()
                .map(|(index, percent)| {
                    json!({
                        "effectiveDate": "2026-01-05",
                        "accountIndex": format!("IDX{index}"),
                        "fund": format!("F{index}"),
                        "distributionPercent": percent,
                    })
                })
                .collect(),
        )
    }

    #[test]
    fn migrate_is_idempotent_and_seeds_reference_codes() {
        let store = fixture_store();
        must(store.migrate());

        let count: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM change_reason_codes",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(count, 8);

        let migrations: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(migrations, 1);
    }

    #[test]
    fn person_lookup_returns_none_for_unknown_ids() {
        let store = fixture_store();
        let person = must(store.add_person("930000001"));

        let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);
        assert_eq!(
            must_mutation(factory.resolve("930000001")),
            Some(person.clone())
        );
        assert_eq!(must_mutation(factory.resolve("930999999")), None);
        assert_eq!(must(store.resolve_person("930000001")), Some(person));
    }

    #[test]
    fn reference_lookup_reports_seeded_and_added_codes() {
        let store = fixture_store();
        must(store.add_change_reason_code("XFER2", "Secondary transfer"));
        let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);

        let mut session = must_mutation(factory.open_session());
        assert!(must_mutation(session.change_reason_code_exists("HIRE")));
        assert!(must_mutation(session.change_reason_code_exists("XFER2")));
        assert!(!must_mutation(session.change_reason_code_exists("BOGUS")));
        must_mutation(session.rollback());
    }

    #[test]
    fn create_then_update_merges_fields_and_replaces_labor() {
        let store = fixture_store();
        let person = must(store.add_person("930000001"));
        let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);

        let create = fixture_params(
            &person,
            "HIRE",
            &STUDENT_FIELDS,
            &json!({
                "hourlyRate": 15.5,
                "jobDescription": "Lab assistant",
                "accruesLeaveInd": true,
                "laborDistribution": labor_lines(&[60, 40]),
            }),
        );
        let mut session = must_mutation(factory.open_session());
        assert_eq!(
            must_mutation(session.execute(WriteOperation::StudentCreate, &create)),
            None
        );
        must_mutation(session.commit());

        let update = fixture_params(
            &person,
            "PAYCH",
            &STANDARD_UPDATE_FIELDS,
            &json!({ "hourlyRate": 17.25 }),
        );
        let mut session = must_mutation(factory.open_session());
        assert_eq!(
            must_mutation(session.execute(WriteOperation::StandardUpdate, &update)),
            None
        );
        must_mutation(session.commit());

        let job = match must(store.get_job(person.internal_id, &fixture_key())) {
            Some(job) => job,
            None => panic!("job should exist"),
        };
        assert_eq!(job.employment_type, EmploymentType::Student);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.change_reason_code, "PAYCH");
        assert_eq!(job.fields.get("hourlyRate"), Some(&json!(17.25)));
        assert_eq!(job.fields.get("jobDescription"), Some(&json!("Lab assistant")));
        assert_eq!(job.fields.get("accruesLeaveInd"), Some(&json!("Y")));
        assert!(!job.fields.contains_key("laborFundCodes"));
        assert_eq!(job.labor_distribution.len(), 2);
        assert_eq!(job.labor_distribution[0].fund.as_deref(), Some("F0"));
        assert_eq!(job.labor_distribution[1].distribution_percent, Some(40.0));
        assert_eq!(job.labor_distribution[1].organization, None);

        let relabor = fixture_params(
            &person,
            "LCHNG",
            &LABOR_CHANGE_FIELDS,
            &json!({ "laborDistribution": labor_lines(&[100]) }),
        );
        let mut session = must_mutation(factory.open_session());
        assert_eq!(
            must_mutation(session.execute(WriteOperation::UpdateLaborDistribution, &relabor)),
            None
        );
        must_mutation(session.commit());

        let jobs = must(store.list_jobs(person.internal_id));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].labor_distribution.len(), 1);
        assert_eq!(jobs[0].fields.get("hourlyRate"), Some(&json!(17.25)));
    }

    #[test]
    fn procedures_report_business_failures_as_messages() {
        let store = fixture_store();
        let person = must(store.add_person("930000001"));
        let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);

        let mut session = must_mutation(factory.open_session());
        let update = fixture_params(&person, "PAYCH", &STANDARD_UPDATE_FIELDS, &json!({}));
        let missing = must_mutation(session.execute(WriteOperation::StandardUpdate, &update));
        assert_eq!(missing.as_deref(), Some("Job C50001-00 not found"));

        let unbalanced = fixture_params(
            &person,
            "HIRE",
            &STUDENT_FIELDS,
            &json!({ "laborDistribution": labor_lines(&[60, 30]) }),
        );
        let rejected = must_mutation(session.execute(WriteOperation::StudentCreate, &unbalanced));
        assert!(matches!(rejected, Some(message) if message.contains("total 100")));

        let over = fixture_params(
            &person,
            "HIRE",
            &STUDENT_FIELDS,
            &json!({ "appointmentPercent": 120 }),
        );
        let rejected = must_mutation(session.execute(WriteOperation::StudentCreate, &over));
        assert!(matches!(rejected, Some(message) if message.contains("Appointment percent")));

        let create = fixture_params(&person, "HIRE", &STUDENT_FIELDS, &json!({}));
        assert_eq!(
            must_mutation(session.execute(WriteOperation::StudentCreate, &create)),
            None
        );
        let duplicate = must_mutation(session.execute(WriteOperation::GraduateCreate, &create));
        assert_eq!(duplicate.as_deref(), Some("Job C50001-00 already exists"));

        let terminate = fixture_params(&person, "TERME", &[], &json!({}));
        assert_eq!(
            must_mutation(session.execute(WriteOperation::Terminate, &terminate)),
            None
        );
        let again = must_mutation(session.execute(WriteOperation::Terminate, &terminate));
        assert_eq!(again.as_deref(), Some("Job C50001-00 is already terminated"));
        let after = must_mutation(session.execute(WriteOperation::StandardUpdate, &update));
        assert_eq!(after.as_deref(), Some("Job C50001-00 is terminated"));
        must_mutation(session.rollback());

        assert!(must(store.list_jobs(person.internal_id)).is_empty());
    }

    #[test]
    fn labor_segment_count_must_match_labor_count() {
        let store = fixture_store();
        let person = must(store.add_person("930000001"));
        let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);

        let mut params = fixture_params(
            &person,
            "HIRE",
            &STUDENT_FIELDS,
            &json!({ "laborDistribution": labor_lines(&[50, 50]) }),
        );
        params.insert("laborCount", ParamValue::Integer(3));

        let mut session = must_mutation(factory.open_session());
        let rejected = must_mutation(session.execute(WriteOperation::StudentCreate, &params));
        assert!(matches!(rejected, Some(message) if message.contains("expected 3")));
    }

    #[test]
    fn oversized_labor_count_is_a_business_failure() {
        let store = fixture_store();
        let person = must(store.add_person("930000001"));
        let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);

        let mut params = fixture_params(&person, "HIRE", &STUDENT_FIELDS, &json!({}));
        params.insert("laborCount", ParamValue::Integer(i64::MAX));

        let mut session = must_mutation(factory.open_session());
        let rejected = must_mutation(session.execute(WriteOperation::StudentCreate, &params));
        assert!(matches!(rejected, Some(message) if message.contains("segments")));
        must_mutation(session.rollback());
        assert!(must(store.list_jobs(person.internal_id)).is_empty());
    }

    #[test]
    fn migrate_against_a_locked_database_is_retryable() {
        let store = fixture_store();
        let holder = must_mutation(
            store
                .session_factory(DEFAULT_BUSY_TIMEOUT)
                .open_session(),
        );

        let impatient = must(SqlitePersonnelStore::open_with_busy_timeout(
            store.path(),
            Duration::from_millis(50),
        ));
        let err = match impatient.migrate() {
            Ok(()) => panic!("migrate should not acquire the write lock"),
            Err(err) => err,
        };
        let mutation = match err.downcast_ref::<MutationError>() {
            Some(mutation) => mutation,
            None => panic!("busy migrate should carry a mutation error: {err:#}"),
        };
        assert!(mutation.is_retryable(), "unexpected error: {mutation}");
        drop(holder);
    }

    #[test]
    fn dropped_session_rolls_back() {
        let store = fixture_store();
        let person = must(store.add_person("930000001"));
        let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);

        {
            let mut session = must_mutation(factory.open_session());
            let request = AddressCreateRequest {
                address_type: "PR".to_string(),
                street_line1: "1500 SW Jefferson Way".to_string(),
                street_line2: None,
                street_line3: None,
                city: "Corvallis".to_string(),
                state_code: Some("OR".to_string()),
                postal_code: Some("97331".to_string()),
                nation_code: None,
            };
            let record = must_mutation(session.insert_address(person.internal_id, &request));
            assert_eq!(record.sequence_number, 1);
        }

        assert!(must(store.list_addresses(person.internal_id)).is_empty());
    }

    #[test]
    fn second_writer_times_out_as_transient_error() {
        let store = fixture_store();
        let holder = must_mutation(
            store
                .session_factory(DEFAULT_BUSY_TIMEOUT)
                .open_session(),
        );

        let impatient = store.session_factory(Duration::from_millis(50));
        let err = match impatient.open_session() {
            Ok(_) => panic!("second immediate transaction should not acquire the lock"),
            Err(err) => err,
        };
        assert!(err.is_retryable(), "unexpected error: {err}");
        drop(holder);
    }

    #[test]
    fn deactivate_and_relink_phone() {
        let store = fixture_store();
        let person = must(store.add_person("930000001"));
        let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);

        let mut session = must_mutation(factory.open_session());
        let phone = PhoneCreateRequest {
            phone_type: "PR".to_string(),
            area_code: Some("541".to_string()),
            phone_number: "5550100".to_string(),
            phone_extension: None,
            primary_ind: true,
        };
        must_mutation(session.insert_phone(person.internal_id, &phone, 1));
        let active = must_mutation(session.active_records(
            person.internal_id,
            RecordKind::Phone,
            "PR",
        ));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].linked_sequence_number, Some(1));

        must_mutation(session.relink_phone_address(&active[0], 2));
        must_mutation(session.deactivate_record(&ActiveRecord {
            linked_sequence_number: Some(2),
            ..active[0].clone()
        }));
        let err = match session.deactivate_record(&active[0]) {
            Ok(()) => panic!("second deactivation should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, MutationError::IntegrityViolation(_)));
        must_mutation(session.commit());

        let phones = must(store.list_phones(person.internal_id));
        assert_eq!(phones.len(), 1);
        assert!(!phones[0].active);
        assert_eq!(phones[0].address_sequence_number, 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_labor_lines_persist_in_order(percents in prop::collection::vec(1u8..=20, 1..6)) {
            let store = fixture_store();
            let person = must(store.add_person("930000001"));
            let factory = store.session_factory(DEFAULT_BUSY_TIMEOUT);

            let mut balanced = percents.clone();
            let used: u32 = percents.iter().map(|value| u32::from(*value)).sum();
            balanced.push(u8::try_from(100 - used).unwrap_or(0));

            let params = fixture_params(
                &person,
                "HIRE",
                &STUDENT_FIELDS,
                &json!({ "laborDistribution": labor_lines(&balanced) }),
            );
            let mut session = must_mutation(factory.open_session());
            prop_assert_eq!(must_mutation(session.execute(WriteOperation::StudentCreate, &params)), None);
            must_mutation(session.commit());

            let job = must(store.get_job(person.internal_id, &fixture_key()));
            let funds = job
                .map(|job| job.labor_distribution.into_iter().filter_map(|line| line.fund).collect::<Vec<_>>())
                .unwrap_or_default();
            let expected = (0..balanced.len()).map(|index| format!("F{index}")).collect::<Vec<_>>();
            prop_assert_eq!(funds, expected);
        }
    }
}
