use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::model::{BpkError, BpkRecord, Person, PersonId, PersonUpdate};
use crate::selector::PersonSnapshot;

/// Person and bPK sub-record persistence consumed by the runner and the merge resolver.
///
/// Missing rows are reported as `Ok(None)`; `Err` is reserved for storage failures.
pub trait BpkStore {
    /// Every person together with its bPK sub-record.
    ///
    /// # Errors
    /// Returns [`BpkError::Store`] when the population cannot be loaded.
    fn population(&self) -> Result<Vec<PersonSnapshot>, BpkError>;

    /// # Errors
    /// Returns [`BpkError::Store`] when the person cannot be loaded.
    fn person(&self, person_id: PersonId) -> Result<Option<Person>, BpkError>;

    /// Apply identity attribute changes.
    ///
    /// Implementations must reset the person's bPK sub-record (creating it when
    /// absent) whenever first name, last name or birth date actually change.
    ///
    /// # Errors
    /// Returns [`BpkError::Store`] when the person is missing or the write fails.
    fn update_person(&mut self, person_id: PersonId, update: &PersonUpdate)
        -> Result<(), BpkError>;

    /// # Errors
    /// Returns [`BpkError::Store`] when the record cannot be loaded.
    fn bpk_record(&self, person_id: PersonId) -> Result<Option<BpkRecord>, BpkError>;

    /// Insert or replace the sub-record of `record.person_id`.
    ///
    /// # Errors
    /// Returns [`BpkError::Store`] when the owning person is missing or the write fails.
    fn store_bpk_record(&mut self, record: &BpkRecord) -> Result<(), BpkError>;

    /// Delete the sub-record of a person. Deleting a missing record is not an error.
    ///
    /// # Errors
    /// Returns [`BpkError::Store`] when the delete fails.
    fn delete_bpk_record(&mut self, person_id: PersonId) -> Result<(), BpkError>;

    /// Re-own the sub-record of `from` to `to`. A no-op when both ids are equal.
    ///
    /// # Errors
    /// Returns [`BpkError::Store`] when `to` already owns a record or the write fails.
    fn move_bpk_record(&mut self, from: PersonId, to: PersonId) -> Result<(), BpkError>;

    /// Overwrite the vbPK of a person, creating an `Unknown` sub-record when absent.
    ///
    /// # Errors
    /// Returns [`BpkError::Store`] when the owning person is missing or the write fails.
    fn set_vbpk(&mut self, person_id: PersonId, vbpk: &str) -> Result<(), BpkError>;
}

/// Map-backed [`BpkStore`], used by tests, benches and dry runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    persons: BTreeMap<PersonId, Person>,
    records: BTreeMap<PersonId, BpkRecord>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_person(&mut self, person: Person) {
        self.persons.insert(person.id, person);
    }

    pub fn insert_record(&mut self, record: BpkRecord) {
        self.records.insert(record.person_id, record);
    }

    #[must_use]
    pub fn records(&self) -> &BTreeMap<PersonId, BpkRecord> {
        &self.records
    }

    fn require_person(&self, person_id: PersonId) -> Result<&Person, BpkError> {
        self.persons
            .get(&person_id)
            .ok_or_else(|| BpkError::Store(format!("person {person_id} not found")))
    }
}

impl BpkStore for InMemoryStore {
    fn population(&self) -> Result<Vec<PersonSnapshot>, BpkError> {
        Ok(self
            .persons
            .values()
            .map(|person| PersonSnapshot {
                person: person.clone(),
                bpk: self.records.get(&person.id).cloned(),
            })
            .collect())
    }

    fn person(&self, person_id: PersonId) -> Result<Option<Person>, BpkError> {
        Ok(self.persons.get(&person_id).cloned())
    }

    fn update_person(
        &mut self,
        person_id: PersonId,
        update: &PersonUpdate,
    ) -> Result<(), BpkError> {
        let person = self.require_person(person_id)?;
        if update.changed_attributes(person).is_empty() {
            return Ok(());
        }

        let today = OffsetDateTime::now_utc().date();
        let reset = BpkRecord::reset(person_id, self.records.get(&person_id), today)?;
        if let Some(person) = self.persons.get_mut(&person_id) {
            update.apply_to(person);
        }
        self.records.insert(person_id, reset);
        Ok(())
    }

    fn bpk_record(&self, person_id: PersonId) -> Result<Option<BpkRecord>, BpkError> {
        Ok(self.records.get(&person_id).cloned())
    }

    fn store_bpk_record(&mut self, record: &BpkRecord) -> Result<(), BpkError> {
        self.require_person(record.person_id)?;
        self.records.insert(record.person_id, record.clone());
        Ok(())
    }

    fn delete_bpk_record(&mut self, person_id: PersonId) -> Result<(), BpkError> {
        self.records.remove(&person_id);
        Ok(())
    }

    fn move_bpk_record(&mut self, from: PersonId, to: PersonId) -> Result<(), BpkError> {
        if from == to {
            return Ok(());
        }
        self.require_person(to)?;
        if self.records.contains_key(&to) {
            return Err(BpkError::Store(format!("person {to} already owns a bPK record")));
        }
        if let Some(mut record) = self.records.remove(&from) {
            record.person_id = to;
            self.records.insert(to, record);
        }
        Ok(())
    }

    fn set_vbpk(&mut self, person_id: PersonId, vbpk: &str) -> Result<(), BpkError> {
        self.require_person(person_id)?;
        self.records
            .entry(person_id)
            .or_insert_with(|| BpkRecord::unknown(person_id))
            .vbpk = vbpk.to_string();
        Ok(())
    }
}
