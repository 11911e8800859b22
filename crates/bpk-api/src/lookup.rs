use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bpk_core::{BpkStatus, LookupClient, LookupRequest, LookupResult, RETRYABLE_ERROR_CODE};
use serde::{Deserialize, Serialize};
use time::Date;

/// Error code the registry uses for "no person found".
pub const NO_MATCH_ERROR_CODE: &str = "F230";

/// Registry client used when no transport is configured.
///
/// Every lookup reports the transport-unavailable outcome, so affected persons
/// are re-selected as retryable errors on the next pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineLookup;

impl LookupClient for OfflineLookup {
    fn lookup(&self, request: &LookupRequest) -> LookupResult {
        LookupResult {
            person_id: request.person_id,
            bpk_extern: String::new(),
            vbpk: String::new(),
            status: BpkStatus::Error,
            error_code: RETRYABLE_ERROR_CODE.to_string(),
            error_note: "registry transport not configured".to_string(),
        }
    }
}

/// One canned registry answer, matched on name and birth date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayResponse {
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "bpk_core::iso_date_option")]
    pub birth_date: Option<Date>,
    #[serde(default)]
    pub bpk_extern: String,
    #[serde(default)]
    pub vbpk: String,
    pub status: BpkStatus,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_note: String,
}

type ReplayKey = (String, String, Date);

fn replay_key(first_name: &str, last_name: &str, birth_date: Date) -> ReplayKey {
    (first_name.trim().to_lowercase(), last_name.trim().to_lowercase(), birth_date)
}

/// Registry client answering from a fixed set of responses.
#[derive(Debug, Clone, Default)]
pub struct ReplayLookup {
    responses: BTreeMap<ReplayKey, ReplayResponse>,
}

impl ReplayLookup {
    /// # Errors
    /// Returns an error when a response has no birth date.
    pub fn new(responses: Vec<ReplayResponse>) -> Result<Self> {
        let mut indexed = BTreeMap::new();
        for response in responses {
            let birth_date = response.birth_date.ok_or_else(|| {
                anyhow!(
                    "replay response for {} {} has no birth_date",
                    response.first_name,
                    response.last_name
                )
            })?;
            indexed.insert(
                replay_key(&response.first_name, &response.last_name, birth_date),
                response,
            );
        }
        Ok(Self { responses: indexed })
    }

    /// Load responses from a JSON array file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or decoded.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read replay responses from {}", path.display()))?;
        let responses: Vec<ReplayResponse> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode replay responses in {}", path.display()))?;
        Self::new(responses)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

impl LookupClient for ReplayLookup {
    fn lookup(&self, request: &LookupRequest) -> LookupResult {
        let found = request.birth_date.and_then(|birth_date| {
            self.responses.get(&replay_key(&request.first_name, &request.last_name, birth_date))
        });

        match found {
            Some(response) => LookupResult {
                person_id: request.person_id,
                bpk_extern: response.bpk_extern.clone(),
                vbpk: response.vbpk.clone(),
                status: response.status,
                error_code: response.error_code.clone(),
                error_note: response.error_note.clone(),
            },
            None => LookupResult {
                person_id: request.person_id,
                bpk_extern: String::new(),
                vbpk: String::new(),
                status: BpkStatus::NoMatch,
                error_code: NO_MATCH_ERROR_CODE.to_string(),
                error_note: "no matching person in registry".to_string(),
            },
        }
    }
}
