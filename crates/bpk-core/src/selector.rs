use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};

use crate::model::{BpkConfig, BpkRecord, BpkStatus, LookupRequest, Person, PersonId};

/// Priority class of a lookup candidate. Lower classes are looked up first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LookupPriority {
    NeverAttempted,
    InvalidState,
    RetryableError,
    RetryDue,
}

impl LookupPriority {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::NeverAttempted => 1,
            Self::InvalidState => 2,
            Self::RetryableError => 3,
            Self::RetryDue => 4,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverAttempted => "never_attempted",
            Self::InvalidState => "invalid_state",
            Self::RetryableError => "retryable_error",
            Self::RetryDue => "retry_due",
        }
    }
}

/// One person together with its bPK sub-record, if it has one yet.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersonSnapshot {
    pub person: Person,
    pub bpk: Option<BpkRecord>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SelectionRequest {
    /// Overrides [`BpkConfig::rate_limit`] for this pass.
    pub limit: Option<u32>,
    /// Select exactly this person, bypassing every eligibility filter.
    pub person_id: Option<PersonId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LookupCandidate {
    pub person_id: PersonId,
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "crate::model::iso_date_option", default)]
    pub birth_date: Option<Date>,
    #[serde(default)]
    pub postal_code: Option<String>,
    /// `None` only for an explicitly requested person that matches no class.
    pub priority: Option<LookupPriority>,
}

impl LookupCandidate {
    fn new(person: &Person, priority: Option<LookupPriority>) -> Self {
        Self {
            person_id: person.id,
            first_name: person.first_name.clone(),
            last_name: person.last_name.clone(),
            birth_date: person.birth_date,
            postal_code: person.postal_code.clone(),
            priority,
        }
    }

    #[must_use]
    pub fn lookup_request(&self) -> LookupRequest {
        LookupRequest {
            person_id: Some(self.person_id),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            birth_date: self.birth_date,
            postal_code: self.postal_code.clone(),
        }
    }
}

struct RetryWindow {
    due_before: OffsetDateTime,
}

impl RetryWindow {
    fn new(config: &BpkConfig, now: OffsetDateTime) -> Self {
        let interval = Duration::days(i64::from(config.retry_interval_days));
        Self { due_before: now.checked_sub(interval).unwrap_or(now) }
    }

    fn is_due(&self, lookup_date: Option<OffsetDateTime>) -> bool {
        match lookup_date {
            None => true,
            Some(looked_up_at) => looked_up_at <= self.due_before,
        }
    }
}

type PriorityRule = fn(Option<&BpkRecord>, &RetryWindow) -> bool;

/// Evaluated top to bottom; a person lands in the first class whose rule holds.
const PRIORITY_RULES: [(LookupPriority, PriorityRule); 4] = [
    (LookupPriority::NeverAttempted, never_attempted),
    (LookupPriority::InvalidState, invalid_state),
    (LookupPriority::RetryableError, retryable_error),
    (LookupPriority::RetryDue, retry_due),
];

fn never_attempted(record: Option<&BpkRecord>, _: &RetryWindow) -> bool {
    match record {
        None => true,
        Some(record) => record.status == BpkStatus::Unknown,
    }
}

fn invalid_state(record: Option<&BpkRecord>, _: &RetryWindow) -> bool {
    record.is_some_and(BpkRecord::is_invalid_state)
}

fn retryable_error(record: Option<&BpkRecord>, _: &RetryWindow) -> bool {
    record.is_some_and(BpkRecord::has_retryable_error)
}

fn retry_due(record: Option<&BpkRecord>, window: &RetryWindow) -> bool {
    record.is_some_and(|record| !record.status.is_verified() && window.is_due(record.lookup_date))
}

fn classify_in(record: Option<&BpkRecord>, window: &RetryWindow) -> Option<LookupPriority> {
    PRIORITY_RULES
        .iter()
        .find(|(_, rule)| rule(record, window))
        .map(|(priority, _)| *priority)
}

/// Priority class of a bPK sub-record at `now`, or `None` when no lookup is due.
#[must_use]
pub fn classify(
    record: Option<&BpkRecord>,
    config: &BpkConfig,
    now: OffsetDateTime,
) -> Option<LookupPriority> {
    classify_in(record, &RetryWindow::new(config, now))
}

/// Build the ordered candidate list for one lookup pass.
///
/// Candidates are ordered by priority class, then by person id, and truncated
/// to the request limit (defaulting to the configured rate limit). A person
/// never appears twice.
#[must_use]
pub fn select_candidates(
    population: &[PersonSnapshot],
    request: &SelectionRequest,
    config: &BpkConfig,
    now: OffsetDateTime,
) -> Vec<LookupCandidate> {
    let limit = usize::try_from(request.limit.unwrap_or(config.rate_limit)).unwrap_or(usize::MAX);
    let window = RetryWindow::new(config, now);

    if let Some(person_id) = request.person_id {
        return population
            .iter()
            .find(|snapshot| snapshot.person.id == person_id)
            .map(|snapshot| {
                LookupCandidate::new(&snapshot.person, classify_in(snapshot.bpk.as_ref(), &window))
            })
            .into_iter()
            .take(limit)
            .collect();
    }

    let mut seen = BTreeSet::new();
    let mut ranked: Vec<(LookupPriority, &Person)> = population
        .iter()
        .filter(|snapshot| snapshot.person.is_lookup_eligible())
        .filter(|snapshot| seen.insert(snapshot.person.id))
        .filter_map(|snapshot| {
            classify_in(snapshot.bpk.as_ref(), &window).map(|priority| (priority, &snapshot.person))
        })
        .collect();

    ranked.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0).then_with(|| lhs.1.id.cmp(&rhs.1.id)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(priority, person)| LookupCandidate::new(person, Some(priority)))
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Month;

    use super::*;
    use crate::model::ContactType;

    fn fixture_now() -> OffsetDateTime {
        match OffsetDateTime::from_unix_timestamp(1_735_689_600) {
            Ok(value) => value,
            Err(err) => panic!("fixture timestamp should be valid: {err}"),
        }
    }

    fn birth_date() -> Date {
        match Date::from_calendar_date(1975, Month::June, 15) {
            Ok(date) => date,
            Err(err) => panic!("fixture date should be valid: {err}"),
        }
    }

    fn person(id: PersonId) -> Person {
        Person {
            id,
            contact_type: ContactType::Individual,
            first_name: format!("First{id}"),
            last_name: format!("Last{id}"),
            birth_date: Some(birth_date()),
            postal_code: Some("1010".to_string()),
            is_deleted: false,
        }
    }

    fn bpk(id: PersonId, status: BpkStatus, days_ago: Option<i64>) -> BpkRecord {
        let (bpk_extern, vbpk) = if status == BpkStatus::Resolved {
            (format!("AT{id}"), format!("V{id}"))
        } else {
            (String::new(), String::new())
        };
        BpkRecord {
            person_id: id,
            bpk_extern,
            vbpk,
            status,
            error_code: String::new(),
            error_note: String::new(),
            lookup_date: days_ago.map(|days| fixture_now() - Duration::days(days)),
        }
    }

    fn snapshot(person: Person, bpk: Option<BpkRecord>) -> PersonSnapshot {
        PersonSnapshot { person, bpk }
    }

    fn select(population: &[PersonSnapshot], limit: Option<u32>) -> Vec<LookupCandidate> {
        select_candidates(
            population,
            &SelectionRequest { limit, person_id: None },
            &BpkConfig::default(),
            fixture_now(),
        )
    }

    fn ids(candidates: &[LookupCandidate]) -> Vec<PersonId> {
        candidates.iter().map(|candidate| candidate.person_id).collect()
    }

    #[test]
    fn classes_are_emitted_in_priority_order() {
        let mut retryable = bpk(1, BpkStatus::Error, Some(1));
        retryable.error_code = "XXXX".to_string();
        let mut invalid = bpk(2, BpkStatus::Resolved, Some(1));
        invalid.vbpk.clear();
        let population = vec![
            snapshot(person(1), Some(retryable)),
            snapshot(person(2), Some(invalid)),
            snapshot(person(3), Some(bpk(3, BpkStatus::NoMatch, Some(120)))),
            snapshot(person(4), None),
            snapshot(person(5), Some(bpk(5, BpkStatus::Unknown, Some(2)))),
        ];

        let candidates = select(&population, None);
        assert_eq!(ids(&candidates), vec![4, 5, 2, 1, 3]);
        assert_eq!(
            candidates.iter().map(|candidate| candidate.priority).collect::<Vec<_>>(),
            vec![
                Some(LookupPriority::NeverAttempted),
                Some(LookupPriority::NeverAttempted),
                Some(LookupPriority::InvalidState),
                Some(LookupPriority::RetryableError),
                Some(LookupPriority::RetryDue),
            ]
        );
    }

    #[test]
    fn verified_and_recent_records_are_skipped() {
        let population = vec![
            snapshot(person(1), Some(bpk(1, BpkStatus::Resolved, Some(400)))),
            snapshot(person(2), Some(bpk(2, BpkStatus::Manual, None))),
            snapshot(person(3), Some(bpk(3, BpkStatus::NoMatch, Some(10)))),
            snapshot(person(4), Some(bpk(4, BpkStatus::Ambiguous, Some(89)))),
        ];
        assert!(select(&population, None).is_empty());
    }

    #[test]
    fn retry_interval_boundary_is_inclusive() {
        let population = vec![
            snapshot(person(1), Some(bpk(1, BpkStatus::NoMatch, Some(90)))),
            snapshot(person(2), Some(bpk(2, BpkStatus::Error, None))),
        ];
        assert_eq!(ids(&select(&population, None)), vec![1, 2]);
    }

    #[test]
    fn retry_interval_comes_from_config() {
        let population = vec![snapshot(person(1), Some(bpk(1, BpkStatus::NoMatch, Some(10))))];
        let config = BpkConfig { retry_interval_days: 7, ..BpkConfig::default() };
        let candidates =
            select_candidates(&population, &SelectionRequest::default(), &config, fixture_now());
        assert_eq!(ids(&candidates), vec![1]);
    }

    #[test]
    fn non_retryable_error_waits_for_interval() {
        let mut fault = bpk(1, BpkStatus::Error, Some(1));
        fault.error_code = "F230".to_string();
        let population = vec![snapshot(person(1), Some(fault))];
        assert!(select(&population, None).is_empty());
    }

    #[test]
    fn ineligible_persons_are_filtered() {
        let mut organization = person(1);
        organization.contact_type = ContactType::Organization;
        let mut deleted = person(2);
        deleted.is_deleted = true;
        let mut nameless = person(3);
        nameless.first_name = "  ".to_string();
        let mut no_last_name = person(4);
        no_last_name.last_name.clear();
        let mut undated = person(5);
        undated.birth_date = None;

        let population = vec![
            snapshot(organization, None),
            snapshot(deleted, None),
            snapshot(nameless, None),
            snapshot(no_last_name, None),
            snapshot(undated, None),
            snapshot(person(6), None),
        ];
        assert_eq!(ids(&select(&population, None)), vec![6]);
    }

    #[test]
    fn explicit_person_bypasses_every_filter() {
        let mut undated = person(9);
        undated.birth_date = None;
        undated.is_deleted = true;
        let population = vec![
            snapshot(person(1), None),
            snapshot(undated, Some(bpk(9, BpkStatus::Resolved, Some(1)))),
        ];

        let candidates = select_candidates(
            &population,
            &SelectionRequest { limit: None, person_id: Some(9) },
            &BpkConfig::default(),
            fixture_now(),
        );
        assert_eq!(ids(&candidates), vec![9]);
        assert_eq!(candidates[0].priority, None);
        assert_eq!(candidates[0].birth_date, None);

        let missing = select_candidates(
            &population,
            &SelectionRequest { limit: None, person_id: Some(42) },
            &BpkConfig::default(),
            fixture_now(),
        );
        assert!(missing.is_empty());
    }

    #[test]
    fn limit_truncates_lowest_priority_class() {
        let population = vec![
            snapshot(person(1), Some(bpk(1, BpkStatus::NoMatch, None))),
            snapshot(person(2), Some(bpk(2, BpkStatus::NoMatch, None))),
            snapshot(person(3), None),
        ];
        assert_eq!(ids(&select(&population, Some(2))), vec![3, 1]);
        assert!(select(&population, Some(0)).is_empty());
    }

    #[test]
    fn default_limit_is_rate_limit() {
        let population: Vec<PersonSnapshot> =
            (1..=5).map(|id| snapshot(person(id), None)).collect();
        let config = BpkConfig { rate_limit: 3, ..BpkConfig::default() };
        let candidates =
            select_candidates(&population, &SelectionRequest::default(), &config, fixture_now());
        assert_eq!(ids(&candidates), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_snapshots_are_emitted_once() {
        let population = vec![snapshot(person(1), None), snapshot(person(1), None)];
        assert_eq!(ids(&select(&population, None)), vec![1]);
    }

    #[test]
    fn candidate_carries_lookup_inputs() {
        let candidates = select(&[snapshot(person(4), None)], None);
        let request = candidates[0].lookup_request();
        assert_eq!(request.person_id, Some(4));
        assert_eq!(request.first_name, "First4");
        assert_eq!(request.last_name, "Last4");
        assert_eq!(request.birth_date, Some(birth_date()));
        assert_eq!(request.postal_code.as_deref(), Some("1010"));
    }

    fn arb_status() -> impl Strategy<Value = BpkStatus> {
        prop_oneof![
            Just(BpkStatus::Unknown),
            Just(BpkStatus::Manual),
            Just(BpkStatus::Resolved),
            Just(BpkStatus::NoMatch),
            Just(BpkStatus::Error),
            Just(BpkStatus::Ambiguous),
        ]
    }

    fn arb_snapshot() -> impl Strategy<Value = PersonSnapshot> {
        (
            1_i64..500,
            any::<bool>(),
            any::<bool>(),
            proptest::option::of((arb_status(), any::<bool>(), any::<bool>(), 0_u8..4, 0_i64..200)),
        )
            .prop_map(|(id, has_birth_date, deleted, bpk)| {
                let mut person = person(id);
                if !has_birth_date {
                    person.birth_date = None;
                }
                person.is_deleted = deleted;
                let bpk = bpk.map(|(status, with_bpk, with_vbpk, code, days_ago)| BpkRecord {
                    person_id: id,
                    bpk_extern: if with_bpk { format!("AT{id}") } else { String::new() },
                    vbpk: if with_vbpk { format!("V{id}") } else { String::new() },
                    status,
                    error_code: ["", "XXXX", "F501", "F230"][usize::from(code)].to_string(),
                    error_note: String::new(),
                    lookup_date: Some(fixture_now() - Duration::days(days_ago)),
                });
                snapshot(person, bpk)
            })
    }

    proptest! {
        #[test]
        fn property_selection_respects_limit_filters_and_order(
            population in proptest::collection::vec(arb_snapshot(), 0..60),
            limit in 0_u32..40,
        ) {
            let candidates = select(&population, Some(limit));
            prop_assert!(candidates.len() <= usize::try_from(limit).unwrap_or(usize::MAX));

            let mut seen = BTreeSet::new();
            for candidate in &candidates {
                prop_assert!(seen.insert(candidate.person_id));
                prop_assert!(candidate.birth_date.is_some());
                prop_assert!(!candidate.first_name.is_empty());
                prop_assert!(!candidate.last_name.is_empty());
                prop_assert!(candidate.priority.is_some());
            }

            for pair in candidates.windows(2) {
                let key = |candidate: &LookupCandidate| {
                    (candidate.priority.map(LookupPriority::rank), candidate.person_id)
                };
                prop_assert!(key(&pair[0]) < key(&pair[1]));
            }
        }

        #[test]
        fn property_resolved_records_are_selected_only_when_inconsistent(
            snapshot in arb_snapshot(),
        ) {
            let priority = classify(snapshot.bpk.as_ref(), &BpkConfig::default(), fixture_now());
            if let Some(record) = &snapshot.bpk {
                if record.status == BpkStatus::Resolved {
                    let consistent = !record.bpk_extern.is_empty() && !record.vbpk.is_empty();
                    prop_assert_eq!(priority.is_some(), !consistent);
                }
            } else {
                prop_assert_eq!(priority, Some(LookupPriority::NeverAttempted));
            }
        }
    }
}
