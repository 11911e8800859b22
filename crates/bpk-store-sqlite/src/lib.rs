use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bpk_core::{
    format_date, parse_date, BpkConfig, BpkError, BpkRecord, BpkStatus, BpkStore, ContactType,
    Person, PersonId, PersonSnapshot, PersonUpdate,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 1;

const SETTINGS_KEY: &str = "bpk_settings";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS persons (
  id INTEGER PRIMARY KEY,
  contact_type TEXT NOT NULL CHECK (contact_type IN ('individual','household','organization')),
  first_name TEXT NOT NULL DEFAULT '',
  last_name TEXT NOT NULL DEFAULT '',
  birth_date TEXT,
  postal_code TEXT,
  is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1))
);

CREATE TABLE IF NOT EXISTS bpk_records (
  person_id INTEGER PRIMARY KEY,
  bpk_extern TEXT NOT NULL DEFAULT '',
  vbpk TEXT NOT NULL DEFAULT '',
  status INTEGER CHECK (status BETWEEN 1 AND 6),
  error_code TEXT NOT NULL DEFAULT '',
  error_note TEXT NOT NULL DEFAULT '',
  lookup_date TEXT,
  FOREIGN KEY (person_id) REFERENCES persons(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lookup_runs (
  run_id TEXT PRIMARY KEY,
  started_at TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  success INTEGER NOT NULL CHECK (success >= 0),
  failed INTEGER NOT NULL CHECK (failed >= 0),
  person_ids_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bpk_records_status ON bpk_records(status);
CREATE INDEX IF NOT EXISTS idx_lookup_runs_started_at ON lookup_runs(started_at);
";

const PERSON_COLUMNS: &str =
    "p.id, p.contact_type, p.first_name, p.last_name, p.birth_date, p.postal_code, p.is_deleted";

const BPK_COLUMNS: &str =
    "b.person_id, b.bpk_extern, b.vbpk, b.status, b.error_code, b.error_note, b.lookup_date";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// A person that has not been assigned an id yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPerson {
    pub contact_type: ContactType,
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "bpk_core::iso_date_option", default)]
    pub birth_date: Option<time::Date>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

/// One finished batch lookup pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupRun {
    pub run_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub success: u32,
    pub failed: u32,
    pub person_ids: Vec<PersonId>,
}

impl SqliteStore {
    /// Open a SQLite-backed bPK store and configure required runtime pragmas.
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

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
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

    /// Insert a new person and return it with its assigned id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_person(&mut self, person: &NewPerson) -> Result<Person> {
        let birth_date = person.birth_date.map(format_date).transpose()?;
        self.conn
            .execute(
                "INSERT INTO persons(contact_type, first_name, last_name, birth_date, postal_code, is_deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    person.contact_type.as_str(),
                    person.first_name,
                    person.last_name,
                    birth_date,
                    person.postal_code,
                ],
            )
            .context("failed to insert person")?;

        Ok(Person {
            id: self.conn.last_insert_rowid(),
            contact_type: person.contact_type,
            first_name: person.first_name.clone(),
            last_name: person.last_name.clone(),
            birth_date: person.birth_date,
            postal_code: person.postal_code.clone(),
            is_deleted: false,
        })
    }

    /// Insert or fully replace a person row.
    ///
    /// Replacing an existing person with different identity attributes resets
    /// its bPK sub-record, exactly like [`SqliteStore::update_person_identity`].
    ///
    /// # Errors
    /// Returns an error when any read or write in the transaction fails.
    pub fn upsert_person(&mut self, person: &Person) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        let existing = load_person(&tx, person.id)?;
        let birth_date = person.birth_date.map(format_date).transpose()?;
        tx.execute(
            "INSERT INTO persons(id, contact_type, first_name, last_name, birth_date, postal_code, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
               contact_type = excluded.contact_type,
               first_name = excluded.first_name,
               last_name = excluded.last_name,
               birth_date = excluded.birth_date,
               postal_code = excluded.postal_code,
               is_deleted = excluded.is_deleted",
            params![
                person.id,
                person.contact_type.as_str(),
                person.first_name,
                person.last_name,
                birth_date,
                person.postal_code,
                person.is_deleted,
            ],
        )
        .with_context(|| format!("failed to upsert person {}", person.id))?;

        if let Some(existing) = existing {
            let identity = PersonUpdate {
                first_name: Some(person.first_name.clone()),
                last_name: Some(person.last_name.clone()),
                birth_date: person.birth_date,
            };
            let changed = identity.changed_attributes(&existing);
            if !changed.is_empty() {
                reset_on_identity_edit(&tx, person.id, &changed)?;
            }
        }

        tx.commit().context("failed to commit person upsert")?;
        Ok(())
    }

    /// Apply identity attribute changes to a person and return the attributes that changed.
    ///
    /// Any actual change resets the person's bPK sub-record to `Unknown`
    /// (creating it when absent) with a `reset: <date>` note.
    ///
    /// # Errors
    /// Returns an error when the person does not exist or a write fails.
    pub fn update_person_identity(
        &mut self,
        person_id: PersonId,
        update: &PersonUpdate,
    ) -> Result<Vec<&'static str>> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        let mut person =
            load_person(&tx, person_id)?.ok_or_else(|| anyhow!("person {person_id} not found"))?;
        let changed = update.changed_attributes(&person);
        if changed.is_empty() {
            return Ok(changed);
        }

        update.apply_to(&mut person);
        let birth_date = person.birth_date.map(format_date).transpose()?;
        tx.execute(
            "UPDATE persons SET first_name = ?2, last_name = ?3, birth_date = ?4 WHERE id = ?1",
            params![
                person_id,
                person.first_name,
                person.last_name,
                birth_date
            ],
        )
        .with_context(|| format!("failed to update person {person_id}"))?;
        reset_on_identity_edit(&tx, person_id, &changed)?;

        tx.commit().context("failed to commit person update")?;
        Ok(changed)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_person(&self, person_id: PersonId) -> Result<Option<Person>> {
        load_person(&self.conn, person_id)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_persons(&self) -> Result<Vec<Person>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PERSON_COLUMNS} FROM persons p ORDER BY p.id ASC"))
            .context("failed to prepare person listing")?;
        let mut rows = stmt.query([])?;
        let mut persons = Vec::new();
        while let Some(row) = rows.next()? {
            persons.push(person_from_row(row, 0)?);
        }
        Ok(persons)
    }

    /// Every person joined with its bPK sub-record, ordered by person id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_population(&self) -> Result<Vec<PersonSnapshot>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PERSON_COLUMNS}, {BPK_COLUMNS}
                 FROM persons p
                 LEFT JOIN bpk_records b ON b.person_id = p.id
                 ORDER BY p.id ASC"
            ))
            .context("failed to prepare population query")?;
        let mut rows = stmt.query([])?;
        let mut population = Vec::new();
        while let Some(row) = rows.next()? {
            let person = person_from_row(row, 0)?;
            let bpk = if row.get::<_, Option<i64>>(7)?.is_some() {
                Some(record_from_row(row, 7)?)
            } else {
                None
            };
            population.push(PersonSnapshot { person, bpk });
        }
        Ok(population)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_bpk_record(&self, person_id: PersonId) -> Result<Option<BpkRecord>> {
        load_bpk_record(&self.conn, person_id)
    }

    /// Insert or replace the bPK sub-record of `record.person_id`.
    ///
    /// # Errors
    /// Returns an error when the owning person is missing or the write fails.
    pub fn put_bpk_record(&mut self, record: &BpkRecord) -> Result<()> {
        write_bpk_record(&self.conn, record)
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove_bpk_record(&mut self, person_id: PersonId) -> Result<()> {
        self.conn
            .execute("DELETE FROM bpk_records WHERE person_id = ?1", params![person_id])
            .with_context(|| format!("failed to delete bPK record of person {person_id}"))?;
        Ok(())
    }

    /// Re-own the bPK sub-record of `from` to `to`.
    ///
    /// # Errors
    /// Returns an error when `to` is missing, already owns a record, or the update fails.
    pub fn reassign_bpk_record(&mut self, from: PersonId, to: PersonId) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if load_bpk_record(&self.conn, to)?.is_some() {
            return Err(anyhow!("person {to} already owns a bPK record"));
        }
        self.conn
            .execute(
                "UPDATE bpk_records SET person_id = ?2 WHERE person_id = ?1",
                params![from, to],
            )
            .with_context(|| format!("failed to move bPK record from person {from} to {to}"))?;
        Ok(())
    }

    /// Overwrite the vbPK of a person, creating an `Unknown` sub-record when absent.
    ///
    /// # Errors
    /// Returns an error when the owning person is missing or the write fails.
    pub fn write_vbpk(&mut self, person_id: PersonId, vbpk: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO bpk_records(person_id, vbpk, status) VALUES (?1, ?2, ?3)
                 ON CONFLICT(person_id) DO UPDATE SET vbpk = excluded.vbpk",
                params![person_id, vbpk, i64::from(BpkStatus::Unknown.code())],
            )
            .with_context(|| format!("failed to set vbPK of person {person_id}"))?;
        Ok(())
    }

    /// Stored configuration, or the defaults when none was saved yet.
    ///
    /// # Errors
    /// Returns an error when the settings row cannot be read or decoded.
    pub fn load_config(&self) -> Result<BpkConfig> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                params![SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read bPK settings")?;

        match raw {
            Some(raw) => serde_json::from_str(&raw).context("failed to decode bPK settings"),
            None => Ok(BpkConfig::default()),
        }
    }

    /// # Errors
    /// Returns an error when the config is invalid or cannot be written.
    pub fn save_config(&mut self, config: &BpkConfig) -> Result<()> {
        config.validate().map_err(|err| anyhow!("config validation failed: {err}"))?;
        let value_json = serde_json::to_string(config).context("failed to encode bPK settings")?;
        self.conn
            .execute(
                "INSERT INTO settings(key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value_json = excluded.value_json,
                   updated_at = excluded.updated_at",
                params![SETTINGS_KEY, value_json, now_rfc3339()?],
            )
            .context("failed to write bPK settings")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the run cannot be encoded or written.
    pub fn record_lookup_run(&mut self, run: &LookupRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lookup_runs(run_id, started_at, finished_at, success, failed, person_ids_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.run_id,
                    rfc3339(run.started_at)?,
                    rfc3339(run.finished_at)?,
                    run.success,
                    run.failed,
                    serde_json::to_string(&run.person_ids)
                        .context("failed to encode run person ids")?,
                ],
            )
            .with_context(|| format!("failed to record lookup run {}", run.run_id))?;
        Ok(())
    }

    /// Most recent runs first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_lookup_runs(&self, limit: Option<u32>) -> Result<Vec<LookupRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, started_at, finished_at, success, failed, person_ids_json
                 FROM lookup_runs
                 ORDER BY started_at DESC, run_id DESC
                 LIMIT ?1",
            )
            .context("failed to prepare lookup run listing")?;
        let limit = limit.map_or(-1, i64::from);
        let mut rows = stmt.query(params![limit])?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            let person_ids_json: String = row.get(5)?;
            runs.push(LookupRun {
                run_id: row.get(0)?,
                started_at: parse_rfc3339(&row.get::<_, String>(1)?)?,
                finished_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
                success: row.get(3)?,
                failed: row.get(4)?,
                person_ids: serde_json::from_str(&person_ids_json)
                    .context("failed to decode run person ids")?,
            });
        }
        Ok(runs)
    }

    /// Write a consistent copy of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn store_error(err: &anyhow::Error) -> BpkError {
    BpkError::Store(format!("{err:#}"))
}

impl BpkStore for SqliteStore {
    fn population(&self) -> Result<Vec<PersonSnapshot>, BpkError> {
        self.list_population().map_err(|err| store_error(&err))
    }

    fn person(&self, person_id: PersonId) -> Result<Option<Person>, BpkError> {
        self.get_person(person_id).map_err(|err| store_error(&err))
    }

    fn update_person(
        &mut self,
        person_id: PersonId,
        update: &PersonUpdate,
    ) -> Result<(), BpkError> {
        self.update_person_identity(person_id, update).map(|_| ()).map_err(|err| store_error(&err))
    }

    fn bpk_record(&self, person_id: PersonId) -> Result<Option<BpkRecord>, BpkError> {
        self.get_bpk_record(person_id).map_err(|err| store_error(&err))
    }

    fn store_bpk_record(&mut self, record: &BpkRecord) -> Result<(), BpkError> {
        self.put_bpk_record(record).map_err(|err| store_error(&err))
    }

    fn delete_bpk_record(&mut self, person_id: PersonId) -> Result<(), BpkError> {
        self.remove_bpk_record(person_id).map_err(|err| store_error(&err))
    }

    fn move_bpk_record(&mut self, from: PersonId, to: PersonId) -> Result<(), BpkError> {
        self.reassign_bpk_record(from, to).map_err(|err| store_error(&err))
    }

    fn set_vbpk(&mut self, person_id: PersonId, vbpk: &str) -> Result<(), BpkError> {
        self.write_vbpk(person_id, vbpk).map_err(|err| store_error(&err))
    }
}

fn reset_on_identity_edit(conn: &Connection, person_id: PersonId, changed: &[&str]) -> Result<()> {
    let previous = load_bpk_record(conn, person_id)?;
    let today = OffsetDateTime::now_utc().date();
    write_bpk_record(conn, &BpkRecord::reset(person_id, previous.as_ref(), today)?)?;
    debug!(person_id, ?changed, "identity attributes changed, bPK record reset");
    Ok(())
}

fn load_person(conn: &Connection, person_id: PersonId) -> Result<Option<Person>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {PERSON_COLUMNS} FROM persons p WHERE p.id = ?1"))
        .context("failed to prepare person query")?;
    let mut rows = stmt.query(params![person_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(person_from_row(row, 0)?)),
        None => Ok(None),
    }
}

fn load_bpk_record(conn: &Connection, person_id: PersonId) -> Result<Option<BpkRecord>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {BPK_COLUMNS} FROM bpk_records b WHERE b.person_id = ?1"))
        .context("failed to prepare bPK record query")?;
    let mut rows = stmt.query(params![person_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(record_from_row(row, 0)?)),
        None => Ok(None),
    }
}

fn write_bpk_record(conn: &Connection, record: &BpkRecord) -> Result<()> {
    let lookup_date = record.lookup_date.map(rfc3339).transpose()?;
    conn.execute(
        "INSERT INTO bpk_records(person_id, bpk_extern, vbpk, status, error_code, error_note, lookup_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(person_id) DO UPDATE SET
           bpk_extern = excluded.bpk_extern,
           vbpk = excluded.vbpk,
           status = excluded.status,
           error_code = excluded.error_code,
           error_note = excluded.error_note,
           lookup_date = excluded.lookup_date",
        params![
            record.person_id,
            record.bpk_extern,
            record.vbpk,
            i64::from(record.status.code()),
            record.error_code,
            record.error_note,
            lookup_date,
        ],
    )
    .with_context(|| format!("failed to store bPK record of person {}", record.person_id))?;
    Ok(())
}

fn person_from_row(row: &Row<'_>, offset: usize) -> Result<Person> {
    let contact_type_raw: String = row.get(offset + 1)?;
    let birth_date_raw: Option<String> = row.get(offset + 4)?;
    let birth_date = match birth_date_raw.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_date(raw).map_err(|err| anyhow!("stored birth date: {err}"))?),
    };

    Ok(Person {
        id: row.get(offset)?,
        contact_type: ContactType::parse(&contact_type_raw)
            .ok_or_else(|| anyhow!("unknown contact_type: {contact_type_raw}"))?,
        first_name: row.get(offset + 2)?,
        last_name: row.get(offset + 3)?,
        birth_date,
        postal_code: row.get(offset + 5)?,
        is_deleted: row.get(offset + 6)?,
    })
}

fn record_from_row(row: &Row<'_>, offset: usize) -> Result<BpkRecord> {
    let status = match row.get::<_, Option<i64>>(offset + 3)? {
        None => BpkStatus::Unknown,
        Some(code) => u8::try_from(code)
            .ok()
            .and_then(BpkStatus::from_code)
            .ok_or_else(|| anyhow!("unknown bPK status code: {code}"))?,
    };
    let lookup_date = row
        .get::<_, Option<String>>(offset + 6)?
        .map(|raw| parse_rfc3339(&raw))
        .transpose()?;

    Ok(BpkRecord {
        person_id: row.get(offset)?,
        bpk_extern: row.get(offset + 1)?,
        vbpk: row.get(offset + 2)?,
        status,
        error_code: row.get(offset + 4)?,
        error_note: row.get(offset + 5)?,
        lookup_date,
    })
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
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
