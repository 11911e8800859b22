use bpk_core::{
    select_candidates, BpkConfig, BpkRecord, BpkStatus, ContactType, Person, PersonSnapshot,
    SelectionRequest,
};
use criterion::{criterion_group, criterion_main, Criterion};
use time::{Date, Duration, Month, OffsetDateTime};

fn mk_snapshot(index: usize, now: OffsetDateTime) -> PersonSnapshot {
    let id = i64::try_from(index).unwrap_or(i64::MAX);
    let year = 1950 + i32::try_from(index % 50).unwrap_or(0);
    let birth_date = match Date::from_calendar_date(year, Month::March, 1) {
        Ok(date) => date,
        Err(err) => panic!("benchmark birth date should be valid: {err}"),
    };
    let person = Person {
        id,
        contact_type: ContactType::Individual,
        first_name: format!("First{index}"),
        last_name: format!("Last{index}"),
        birth_date: Some(birth_date),
        postal_code: Some("1010".to_string()),
        is_deleted: index % 97 == 0,
    };

    let bpk = match index % 5 {
        0 => None,
        1 => Some(BpkRecord {
            status: BpkStatus::Resolved,
            bpk_extern: format!("AT{index}"),
            vbpk: format!("V{index}"),
            lookup_date: Some(now - Duration::days(3)),
            ..BpkRecord::unknown(id)
        }),
        2 => Some(BpkRecord {
            status: BpkStatus::Error,
            error_code: "F501".to_string(),
            lookup_date: Some(now - Duration::days(1)),
            ..BpkRecord::unknown(id)
        }),
        3 => Some(BpkRecord {
            status: BpkStatus::NoMatch,
            error_code: "F230".to_string(),
            lookup_date: Some(now - Duration::days(i64::try_from(index % 180).unwrap_or(0))),
            ..BpkRecord::unknown(id)
        }),
        _ => Some(BpkRecord {
            status: BpkStatus::Error,
            bpk_extern: format!("AT{index}"),
            lookup_date: Some(now - Duration::days(10)),
            ..BpkRecord::unknown(id)
        }),
    };

    PersonSnapshot { person, bpk }
}

fn bench_selection(c: &mut Criterion) {
    let now = OffsetDateTime::UNIX_EPOCH + Duration::days(20_000);
    let population = (0..10_000).map(|index| mk_snapshot(index, now)).collect::<Vec<_>>();
    let config = BpkConfig::default();

    c.bench_function("select_candidates_10000_persons", |b| {
        b.iter(|| {
            let candidates =
                select_candidates(&population, &SelectionRequest::default(), &config, now);
            if candidates.len() > 200 {
                panic!("selection exceeded rate limit: {}", candidates.len());
            }
        });
    });
}

criterion_group!(selector_benches, bench_selection);
criterion_main!(selector_benches);
