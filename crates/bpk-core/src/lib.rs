//! bPK lookup scheduling and merge reconciliation.
//!
//! Pure domain logic: persistence and the registry transport are reached
//! through the [`BpkStore`] and [`LookupClient`] traits.

mod merge;
mod model;
mod runner;
mod selector;
mod store;

pub use merge::{resolve_merge, MergeOutcome};
pub use model::{
    format_date, is_retryable_error_code, iso_date_option, parse_date, BpkConfig, BpkError,
    BpkRecord, BpkStatus, ContactType, LookupRequest, LookupResult, Person, PersonId, PersonUpdate,
    DEFAULT_RATE_LIMIT, DEFAULT_RETRY_INTERVAL_DAYS, RETRYABLE_ERROR_CODE, RETRYABLE_ERROR_PREFIX,
};
pub use runner::{
    query_bpk, reset_bpk, run_lookup_batch, run_lookups, BpkQuery, BpkQueryResult, LookupClient,
    LookupSummary,
};
pub use selector::{
    classify, select_candidates, LookupCandidate, LookupPriority, PersonSnapshot,
    SelectionRequest,
};
pub use store::{BpkStore, InMemoryStore};
