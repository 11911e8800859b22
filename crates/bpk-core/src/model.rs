use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

pub type PersonId = i64;

pub const DEFAULT_RATE_LIMIT: u32 = 200;
pub const DEFAULT_RETRY_INTERVAL_DAYS: u32 = 90;

const ISO_DATE: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]");
const COMPACT_DATE: &[BorrowedFormatItem<'_>] = format_description!("[year][month][day]");
const ISO_DATE_TIME: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Error code the registry client reports when the service itself was unreachable.
pub const RETRYABLE_ERROR_CODE: &str = "XXXX";
/// Registry fault codes starting with this prefix are transient server-side failures.
pub const RETRYABLE_ERROR_PREFIX: &str = "F5";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BpkError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: incomplete lookup result (expected person {expected}, got {returned:?})")]
    IncompleteResult { expected: PersonId, returned: Option<PersonId> },
    #[error("cannot merge multiple valid bPKs (holders: {0:?})")]
    MultipleValidHolders(Vec<PersonId>),
    #[error("store error: {0}")]
    Store(String),
}

/// Lifecycle status of a bPK sub-record.
///
/// The numeric codes are shared with the registry-side option group and are
/// persisted verbatim, so they must never be renumbered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BpkStatus {
    Unknown,
    Manual,
    Resolved,
    NoMatch,
    Error,
    Ambiguous,
}

impl BpkStatus {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 1,
            Self::Manual => 2,
            Self::Resolved => 3,
            Self::NoMatch => 4,
            Self::Error => 5,
            Self::Ambiguous => 6,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Unknown),
            2 => Some(Self::Manual),
            3 => Some(Self::Resolved),
            4 => Some(Self::NoMatch),
            5 => Some(Self::Error),
            6 => Some(Self::Ambiguous),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Manual => "manual",
            Self::Resolved => "resolved",
            Self::NoMatch => "no_match",
            Self::Error => "error",
            Self::Ambiguous => "ambiguous",
        }
    }

    /// `Manual` and `Resolved` records are verified identities; lookups never touch them again.
    #[must_use]
    pub fn is_verified(self) -> bool {
        matches!(self, Self::Manual | Self::Resolved)
    }
}

impl Display for BpkStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    Individual,
    Household,
    Organization,
}

impl ContactType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Household => "household",
            Self::Organization => "organization",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "individual" => Some(Self::Individual),
            "household" => Some(Self::Household),
            "organization" => Some(Self::Organization),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Person {
    pub id: PersonId,
    pub contact_type: ContactType,
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "iso_date_option", default)]
    pub birth_date: Option<Date>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Person {
    /// True when first name, last name and birth date are all present.
    #[must_use]
    pub fn has_lookup_attributes(&self) -> bool {
        !self.first_name.trim().is_empty()
            && !self.last_name.trim().is_empty()
            && self.birth_date.is_some()
    }

    /// True when the person may take part in automatic batch lookups at all.
    #[must_use]
    pub fn is_lookup_eligible(&self) -> bool {
        self.contact_type == ContactType::Individual
            && !self.is_deleted
            && self.has_lookup_attributes()
    }
}

/// Changes to the identity attributes of a person. `None` fields stay untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersonUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(with = "iso_date_option", default)]
    pub birth_date: Option<Date>,
}

impl PersonUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none() && self.last_name.is_none() && self.birth_date.is_none()
    }

    /// Names of the attributes this update would actually change on `person`.
    #[must_use]
    pub fn changed_attributes(&self, person: &Person) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.first_name.as_ref().is_some_and(|value| *value != person.first_name) {
            changed.push("first_name");
        }
        if self.last_name.as_ref().is_some_and(|value| *value != person.last_name) {
            changed.push("last_name");
        }
        if self.birth_date.is_some() && self.birth_date != person.birth_date {
            changed.push("birth_date");
        }
        changed
    }

    pub fn apply_to(&self, person: &mut Person) {
        if let Some(first_name) = &self.first_name {
            person.first_name.clone_from(first_name);
        }
        if let Some(last_name) = &self.last_name {
            person.last_name.clone_from(last_name);
        }
        if let Some(birth_date) = self.birth_date {
            person.birth_date = Some(birth_date);
        }
    }
}

/// The bPK sub-record of one person.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BpkRecord {
    pub person_id: PersonId,
    pub bpk_extern: String,
    pub vbpk: String,
    pub status: BpkStatus,
    pub error_code: String,
    pub error_note: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub lookup_date: Option<OffsetDateTime>,
}

impl BpkRecord {
    #[must_use]
    pub fn unknown(person_id: PersonId) -> Self {
        Self {
            person_id,
            bpk_extern: String::new(),
            vbpk: String::new(),
            status: BpkStatus::Unknown,
            error_code: String::new(),
            error_note: String::new(),
            lookup_date: None,
        }
    }

    /// Record written after a lookup attempt; every lookup field is overwritten.
    #[must_use]
    pub fn from_lookup(
        person_id: PersonId,
        result: &LookupResult,
        looked_up_at: OffsetDateTime,
    ) -> Self {
        Self {
            person_id,
            bpk_extern: result.bpk_extern.clone(),
            vbpk: result.vbpk.clone(),
            status: result.status,
            error_code: result.error_code.clone(),
            error_note: result.error_note.clone(),
            lookup_date: Some(looked_up_at),
        }
    }

    /// Reset identifiers and status. The previous `lookup_date` is carried over untouched.
    ///
    /// # Errors
    /// Returns [`BpkError::Validation`] when `today` cannot be rendered into the note.
    pub fn reset(
        person_id: PersonId,
        previous: Option<&Self>,
        today: Date,
    ) -> Result<Self, BpkError> {
        Ok(Self {
            person_id,
            bpk_extern: String::new(),
            vbpk: String::new(),
            status: BpkStatus::Unknown,
            error_code: String::new(),
            error_note: format!("reset: {}", format_date(today)?),
            lookup_date: previous.and_then(|record| record.lookup_date),
        })
    }

    fn has_identifiers(&self) -> bool {
        !self.bpk_extern.is_empty() && !self.vbpk.is_empty()
    }

    fn has_any_identifier(&self) -> bool {
        !self.bpk_extern.is_empty() || !self.vbpk.is_empty()
    }

    /// `Resolved` must hold exactly when both identifiers are present.
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        if self.status == BpkStatus::Resolved {
            !self.has_identifiers()
        } else {
            self.has_any_identifier()
        }
    }

    #[must_use]
    pub fn has_retryable_error(&self) -> bool {
        self.status == BpkStatus::Error && is_retryable_error_code(&self.error_code)
    }

    #[must_use]
    pub fn is_valid_holder(&self) -> bool {
        self.status.is_verified()
    }
}

#[must_use]
pub fn is_retryable_error_code(code: &str) -> bool {
    code == RETRYABLE_ERROR_CODE || code.starts_with(RETRYABLE_ERROR_PREFIX)
}

/// Input handed to the registry lookup collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LookupRequest {
    pub person_id: Option<PersonId>,
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "iso_date_option", default)]
    pub birth_date: Option<Date>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

/// Answer of the registry lookup collaborator.
///
/// `person_id` echoes the request. Registry-side problems (no match, faults,
/// transport failures) are reported through `error_code`/`error_note`, never as errors.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LookupResult {
    pub person_id: Option<PersonId>,
    pub bpk_extern: String,
    pub vbpk: String,
    pub status: BpkStatus,
    pub error_code: String,
    pub error_note: String,
}

impl LookupResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_code.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct BpkConfig {
    /// Maximum number of registry lookups per batch pass (the per-minute quota).
    pub rate_limit: u32,
    pub retry_interval_days: u32,
}

impl Default for BpkConfig {
    fn default() -> Self {
        Self { rate_limit: DEFAULT_RATE_LIMIT, retry_interval_days: DEFAULT_RETRY_INTERVAL_DAYS }
    }
}

impl BpkConfig {
    /// # Errors
    /// Returns [`BpkError::Validation`] when the rate limit is zero.
    pub fn validate(&self) -> Result<(), BpkError> {
        if self.rate_limit == 0 {
            return Err(BpkError::Validation("rate_limit MUST be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Parse a birth date given as `YYYY-MM-DD`, `YYYYMMDD` or `YYYY-MM-DD HH:MM:SS`.
///
/// # Errors
/// Returns [`BpkError::Validation`] when the value is not a valid calendar date.
pub fn parse_date(raw: &str) -> Result<Date, BpkError> {
    let trimmed = raw.trim();
    Date::parse(trimmed, ISO_DATE)
        .or_else(|_| Date::parse(trimmed, COMPACT_DATE))
        .or_else(|_| {
            PrimitiveDateTime::parse(trimmed, ISO_DATE_TIME).map(PrimitiveDateTime::date)
        })
        .map_err(|err| BpkError::Validation(format!("invalid date: {raw} ({err})")))
}

/// Canonical `YYYY-MM-DD` form used for storage and output.
///
/// # Errors
/// Returns [`BpkError::Validation`] when the date cannot be rendered.
pub fn format_date(date: Date) -> Result<String, BpkError> {
    date.format(ISO_DATE)
        .map_err(|err| BpkError::Validation(format!("cannot format date {date}: {err}")))
}

/// Serde adapter for optional `YYYY-MM-DD` dates; accepts every form [`parse_date`] does.
pub mod iso_date_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S>(value: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(date) => {
                let formatted = super::format_date(*date).map_err(serde::ser::Error::custom)?;
                serializer.serialize_str(&formatted)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Date>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => super::parse_date(value).map(Some).map_err(serde::de::Error::custom),
        }
    }
}
