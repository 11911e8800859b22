use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bpk_core::{
    query_bpk, reset_bpk, resolve_merge, run_lookup_batch, BpkConfig, BpkQuery, BpkQueryResult,
    BpkRecord, LookupClient, MergeOutcome, Person, PersonId, PersonUpdate, SelectionRequest,
};
use bpk_store_sqlite::{IntegrityReport, LookupRun, NewPerson, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use ulid::Ulid;

mod lookup;

pub use lookup::{OfflineLookup, ReplayLookup, ReplayResponse, NO_MATCH_ERROR_CODE};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub rate_limit: Option<u32>,
    pub retry_interval_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonView {
    pub person: Person,
    pub bpk: Option<BpkRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonUpdateResult {
    pub person: Person,
    pub changed_attributes: Vec<String>,
    pub bpk: Option<BpkRecord>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchRequest {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub person_id: Option<PersonId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResult {
    pub run_id: String,
    pub success: u32,
    pub failed: u32,
    pub person_ids: Vec<PersonId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeRequest {
    pub main_person_id: PersonId,
    pub other_person_ids: Vec<PersonId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetRequest {
    pub person_ids: Vec<PersonId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetResult {
    pub records: Vec<BpkRecord>,
}

/// Synchronous facade over the SQLite store and a registry lookup client.
///
/// Every call opens the database, migrates it, and reads the stored config.
#[derive(Clone)]
pub struct BpkApi {
    db_path: PathBuf,
    lookup: Arc<dyn LookupClient + Send + Sync>,
}

impl Debug for BpkApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpkApi").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}

impl BpkApi {
    /// Facade using [`OfflineLookup`] until another client is attached.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, lookup: Arc::new(OfflineLookup) }
    }

    #[must_use]
    pub fn with_lookup<C>(mut self, client: C) -> Self
    where
        C: LookupClient + Send + Sync + 'static,
    {
        self.lookup = Arc::new(client);
        self
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_migrated()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the settings cannot be read.
    pub fn config_show(&self) -> Result<BpkConfig> {
        let store = self.open_migrated()?;
        store.load_config()
    }

    /// Merge the given values into the stored config and return the result.
    ///
    /// # Errors
    /// Returns an error when the merged config is invalid or cannot be written.
    pub fn config_set(&self, update: ConfigUpdate) -> Result<BpkConfig> {
        let mut store = self.open_migrated()?;
        let mut config = store.load_config()?;
        if let Some(rate_limit) = update.rate_limit {
            config.rate_limit = rate_limit;
        }
        if let Some(retry_interval_days) = update.retry_interval_days {
            config.retry_interval_days = retry_interval_days;
        }
        store.save_config(&config)?;
        info!(
            rate_limit = config.rate_limit,
            retry_interval_days = config.retry_interval_days,
            "bPK config updated"
        );
        Ok(config)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_person(&self, input: &NewPerson) -> Result<Person> {
        let mut store = self.open_migrated()?;
        store.insert_person(input)
    }

    /// # Errors
    /// Returns an error when persons cannot be listed.
    pub fn list_persons(&self) -> Result<Vec<Person>> {
        let store = self.open_migrated()?;
        store.list_persons()
    }

    /// A person together with its bPK sub-record.
    ///
    /// # Errors
    /// Returns an error when the person does not exist or cannot be loaded.
    pub fn show_person(&self, person_id: PersonId) -> Result<PersonView> {
        let store = self.open_migrated()?;
        let person =
            store.get_person(person_id)?.ok_or_else(|| anyhow!("person not found: {person_id}"))?;
        let bpk = store.get_bpk_record(person_id)?;
        Ok(PersonView { person, bpk })
    }

    /// Edit identity attributes; an actual change resets the bPK sub-record.
    ///
    /// # Errors
    /// Returns an error when the update is empty, the person does not exist, or persistence fails.
    pub fn update_person(
        &self,
        person_id: PersonId,
        update: &PersonUpdate,
    ) -> Result<PersonUpdateResult> {
        if update.is_empty() {
            return Err(anyhow!("person update must change at least one attribute"));
        }
        let mut store = self.open_migrated()?;
        let changed = store.update_person_identity(person_id, update)?;
        let person =
            store.get_person(person_id)?.ok_or_else(|| anyhow!("person not found: {person_id}"))?;
        Ok(PersonUpdateResult {
            person,
            changed_attributes: changed.into_iter().map(str::to_string).collect(),
            bpk: store.get_bpk_record(person_id)?,
        })
    }

    /// Select due candidates, look them up one by one, and record the pass.
    ///
    /// # Errors
    /// Returns an error for a zero limit, an invalid stored config, a fatal
    /// lookup result, or a persistence failure.
    pub fn run_lookup_batch(&self, request: BatchRequest) -> Result<BatchResult> {
        if request.limit == Some(0) {
            return Err(anyhow!("limit MUST be >= 1"));
        }
        let mut store = self.open_migrated()?;
        let config = store.load_config()?;

        let run_id = Ulid::new().to_string();
        let started_at = OffsetDateTime::now_utc();
        info!(
            run_id = %run_id,
            limit = ?request.limit,
            person_id = ?request.person_id,
            "starting bPK lookup run"
        );

        let summary = run_lookup_batch(
            &mut store,
            self.lookup.as_ref(),
            &config,
            &SelectionRequest { limit: request.limit, person_id: request.person_id },
            started_at,
        )?;

        store.record_lookup_run(&LookupRun {
            run_id: run_id.clone(),
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            success: summary.success,
            failed: summary.failed,
            person_ids: summary.person_ids.clone(),
        })?;
        info!(
            run_id = %run_id,
            success = summary.success,
            failed = summary.failed,
            "bPK lookup run recorded"
        );

        Ok(BatchResult {
            run_id,
            success: summary.success,
            failed: summary.failed,
            person_ids: summary.person_ids,
        })
    }

    /// Ask the registry about unsaved person data. Nothing is persisted.
    ///
    /// # Errors
    /// Returns an error when a name is blank or the birth date is unparsable.
    pub fn query(&self, query: &BpkQuery) -> Result<BpkQueryResult> {
        Ok(query_bpk(self.lookup.as_ref(), query)?)
    }

    /// # Errors
    /// Returns an error when more than one person holds a verified bPK, or persistence fails.
    pub fn resolve_merge(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        let mut store = self.open_migrated()?;
        Ok(resolve_merge(&mut store, request.main_person_id, &request.other_person_ids)?)
    }

    /// Reset the bPK sub-record of every listed person.
    ///
    /// # Errors
    /// Returns an error when no ids are given or a reset fails; earlier resets stay applied.
    pub fn reset(&self, request: &ResetRequest) -> Result<ResetResult> {
        if request.person_ids.is_empty() {
            return Err(anyhow!("at least one person id is required"));
        }
        let mut store = self.open_migrated()?;
        let today = OffsetDateTime::now_utc().date();
        let mut records = Vec::with_capacity(request.person_ids.len());
        for person_id in &request.person_ids {
            records.push(reset_bpk(&mut store, *person_id, today)?);
        }
        Ok(ResetResult { records })
    }

    /// # Errors
    /// Returns an error when the run history cannot be read.
    pub fn list_runs(&self, limit: Option<u32>) -> Result<Vec<LookupRun>> {
        let store = self.open_migrated()?;
        store.list_lookup_runs(limit)
    }
}
