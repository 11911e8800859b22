use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::model::{
    parse_date, BpkConfig, BpkError, BpkRecord, BpkStatus, LookupRequest, LookupResult, PersonId,
};
use crate::selector::{select_candidates, LookupCandidate, LookupPriority, SelectionRequest};
use crate::store::BpkStore;

/// The identity-registry lookup collaborator.
///
/// Calls are synchronous and never fail: transport problems, timeouts and
/// registry faults come back as a [`LookupResult`] with a non-empty `error_code`.
pub trait LookupClient {
    fn lookup(&self, request: &LookupRequest) -> LookupResult;
}

impl<F> LookupClient for F
where
    F: Fn(&LookupRequest) -> LookupResult,
{
    fn lookup(&self, request: &LookupRequest) -> LookupResult {
        self(request)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LookupSummary {
    pub success: u32,
    /// Includes registry "no match" answers: any result with an error code counts here.
    pub failed: u32,
    pub person_ids: Vec<PersonId>,
}

/// Look up every candidate in order and persist each outcome.
///
/// Lookups run strictly one after another. Every result is stored with a fresh
/// `lookup_date`, failed ones included.
///
/// # Errors
/// Returns [`BpkError::IncompleteResult`] when the client answers for a
/// different (or no) person, and propagates store failures. Results stored
/// before the failure stay stored.
pub fn run_lookups<S, C>(
    candidates: &[LookupCandidate],
    client: &C,
    store: &mut S,
) -> Result<LookupSummary, BpkError>
where
    S: BpkStore + ?Sized,
    C: LookupClient + ?Sized,
{
    let mut summary = LookupSummary::default();

    for candidate in candidates {
        debug!(
            person_id = candidate.person_id,
            priority = candidate.priority.map_or("explicit", |priority| priority.as_str()),
            class = ?candidate.priority.map(LookupPriority::rank),
            "looking up bPK"
        );
        let result = client.lookup(&candidate.lookup_request());

        let person_id = match result.person_id {
            Some(person_id) if person_id == candidate.person_id => person_id,
            returned => {
                error!(expected = candidate.person_id, ?returned, "incomplete lookup result");
                return Err(BpkError::IncompleteResult {
                    expected: candidate.person_id,
                    returned,
                });
            }
        };

        summary.person_ids.push(person_id);
        if result.is_success() {
            summary.success += 1;
        } else {
            summary.failed += 1;
            warn!(
                person_id,
                status = %result.status,
                error_code = %result.error_code,
                error_note = %result.error_note,
                "bPK lookup failed"
            );
        }

        store.store_bpk_record(&BpkRecord::from_lookup(
            person_id,
            &result,
            OffsetDateTime::now_utc(),
        ))?;
    }

    Ok(summary)
}

/// Select the candidates due at `now` and run one lookup pass over them.
///
/// # Errors
/// Returns [`BpkError::Validation`] for an invalid config, and everything
/// [`run_lookups`] returns.
pub fn run_lookup_batch<S, C>(
    store: &mut S,
    client: &C,
    config: &BpkConfig,
    request: &SelectionRequest,
    now: OffsetDateTime,
) -> Result<LookupSummary, BpkError>
where
    S: BpkStore + ?Sized,
    C: LookupClient + ?Sized,
{
    config.validate()?;
    let population = store.population()?;
    let candidates = select_candidates(&population, request, config, now);
    info!(
        population = population.len(),
        selected = candidates.len(),
        limit = request.limit.unwrap_or(config.rate_limit),
        "selected bPK lookup candidates"
    );

    let summary = run_lookups(&candidates, client, store)?;
    info!(success = summary.success, failed = summary.failed, "bPK lookup pass finished");
    Ok(summary)
}

/// Reset a person's bPK sub-record so that it is picked up again on the next pass.
///
/// # Errors
/// Propagates store failures.
pub fn reset_bpk<S>(store: &mut S, person_id: PersonId, today: Date) -> Result<BpkRecord, BpkError>
where
    S: BpkStore + ?Sized,
{
    let previous = store.bpk_record(person_id)?;
    let record = BpkRecord::reset(person_id, previous.as_ref(), today)?;
    store.store_bpk_record(&record)?;
    info!(person_id, "bPK record reset");
    Ok(record)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BpkQuery {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: String,
    #[serde(default)]
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BpkQueryResult {
    pub bpk_extern: String,
    pub vbpk: String,
    pub bpk_status: BpkStatus,
    pub bpk_error_code: String,
    pub bpk_error_note: String,
}

impl From<LookupResult> for BpkQueryResult {
    fn from(result: LookupResult) -> Self {
        Self {
            bpk_extern: result.bpk_extern,
            vbpk: result.vbpk,
            bpk_status: result.status,
            bpk_error_code: result.error_code,
            bpk_error_note: result.error_note,
        }
    }
}

/// Ask the registry about a person that is not (yet) stored. Nothing is persisted.
///
/// # Errors
/// Returns [`BpkError::Validation`] when a name is blank or the birth date is unparsable.
pub fn query_bpk<C>(client: &C, query: &BpkQuery) -> Result<BpkQueryResult, BpkError>
where
    C: LookupClient + ?Sized,
{
    for (field, value) in [("first_name", &query.first_name), ("last_name", &query.last_name)] {
        if value.trim().is_empty() {
            return Err(BpkError::Validation(format!("{field} MUST be provided")));
        }
    }
    let birth_date = parse_date(&query.birth_date)?;
    let postal_code = query.postal_code.as_ref().filter(|code| !code.trim().is_empty()).cloned();

    let request = LookupRequest {
        person_id: None,
        first_name: query.first_name.clone(),
        last_name: query.last_name.clone(),
        birth_date: Some(birth_date),
        postal_code,
    };
    Ok(client.lookup(&request).into())
}
