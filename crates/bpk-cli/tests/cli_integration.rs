use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_bpk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_bpk"))
        .args(args)
        .env("RUST_LOG", "debug")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute bpk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_bpk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "bpk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn ids(value: &Value, key: &str) -> Vec<i64> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
        .iter()
        .filter_map(Value::as_i64)
        .collect()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn add_person(db: &Path, first_name: &str, last_name: &str, birth_date: &str) -> i64 {
    let person = run_json([
        "--db",
        path_str(db),
        "person",
        "add",
        "--first-name",
        first_name,
        "--last-name",
        last_name,
        "--birth-date",
        birth_date,
    ]);
    as_i64(&person, "id")
}

fn write_responses(dir: &Path) -> PathBuf {
    let path = dir.join("responses.json");
    let responses = serde_json::json!([
        {
            "first_name": "Anna",
            "last_name": "Berger",
            "birth_date": "1979-11-03",
            "bpk_extern": "AT-ANNA",
            "vbpk": "V-ANNA",
            "status": "resolved"
        },
        {
            "first_name": "Franz",
            "last_name": "Koller",
            "birth_date": "1955-01-20",
            "status": "error",
            "error_code": "F503",
            "error_note": "registry busy"
        }
    ]);
    fs::write(&path, responses.to_string())
        .unwrap_or_else(|err| panic!("failed to write responses {}: {err}", path.display()));
    path
}

#[test]
fn db_commands_cover_schema_migrate_integrity_and_backup() {
    let sandbox = unique_temp_dir("bpk-cli-db");
    let db = sandbox.join("bpk.sqlite3");
    let backup = sandbox.join("backup.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(ids(&dry_run, "would_apply_versions"), vec![1]);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 1);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));

    let written = run_json(["--db", path_str(&db), "db", "backup", "--out", path_str(&backup)]);
    assert_eq!(written.get("backup_written"), Some(&Value::Bool(true)));
    assert!(backup.exists());

    let restored = run_json(["--db", path_str(&backup), "db", "schema-version"]);
    assert_eq!(as_i64(&restored, "current_version"), 1);
}

#[test]
fn offline_lookup_run_records_retryable_failures() {
    let sandbox = unique_temp_dir("bpk-cli-offline");
    let db = sandbox.join("bpk.sqlite3");
    let first = add_person(&db, "Anna", "Berger", "1979-11-03");
    let second = add_person(&db, "Franz", "Koller", "19550120");

    let persons = run_json(["--db", path_str(&db), "person", "list"]);
    assert_eq!(persons.get("persons").and_then(Value::as_array).map(Vec::len), Some(2));

    let run = run_json(["--db", path_str(&db), "lookup", "run"]);
    assert_eq!(as_i64(&run, "success"), 0);
    assert_eq!(as_i64(&run, "failed"), 2);
    assert_eq!(ids(&run, "person_ids"), vec![first, second]);
    assert!(!as_str(&run, "run_id").is_empty());

    let second_id = second.to_string();
    let shown = run_json(["--db", path_str(&db), "bpk", "show", "--person-id", &second_id]);
    let bpk = shown.get("bpk").unwrap_or_else(|| panic!("bpk missing: {shown}"));
    assert_eq!(as_str(bpk, "status"), "error");
    assert_eq!(as_str(bpk, "error_code"), "XXXX");

    let runs = run_json(["--db", path_str(&db), "runs", "list"]);
    let listed = runs.get("runs").and_then(Value::as_array).map(Vec::len);
    assert_eq!(listed, Some(1));
}

#[test]
fn replay_lookup_merge_and_reset_flow() {
    let sandbox = unique_temp_dir("bpk-cli-replay");
    let db = sandbox.join("bpk.sqlite3");
    let responses = write_responses(&sandbox);

    let main = add_person(&db, "Anna", "Berger-Hofer", "1979-11-03");
    let duplicate = add_person(&db, "Anna", "Berger", "1979-11-03");
    let retry = add_person(&db, "Franz", "Koller", "1955-01-20");

    let run = run_json([
        "--db",
        path_str(&db),
        "--responses",
        path_str(&responses),
        "lookup",
        "run",
    ]);
    assert_eq!(as_i64(&run, "success"), 1);
    assert_eq!(as_i64(&run, "failed"), 2);

    // F5xx faults are retried on the very next pass; the no-match is not.
    let rerun = run_json([
        "--db",
        path_str(&db),
        "--responses",
        path_str(&responses),
        "lookup",
        "run",
    ]);
    assert_eq!(ids(&rerun, "person_ids"), vec![retry]);

    let merged = run_json([
        "--db",
        path_str(&db),
        "merge",
        "--main",
        &main.to_string(),
        "--other",
        &duplicate.to_string(),
    ]);
    assert_eq!(merged.get("merged"), Some(&Value::Bool(true)));
    assert_eq!(as_i64(&merged, "holder"), duplicate);

    let main_view = run_json(["--db", path_str(&db), "person", "show", "--id", &main.to_string()]);
    let person = main_view.get("person").unwrap_or_else(|| panic!("person missing: {main_view}"));
    assert_eq!(as_str(person, "last_name"), "Berger");
    let bpk = main_view.get("bpk").unwrap_or_else(|| panic!("bpk missing: {main_view}"));
    assert_eq!(as_str(bpk, "bpk_extern"), "AT-ANNA");
    assert_eq!(as_str(bpk, "status"), "resolved");

    let reset = run_json([
        "--db",
        path_str(&db),
        "bpk",
        "reset",
        "--person-id",
        &main.to_string(),
        "--person-id",
        &retry.to_string(),
    ]);
    let records = reset
        .get("records")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("records missing: {reset}"));
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|record| as_str(record, "status") == "unknown"));
}

#[test]
fn query_normalizes_birth_date_without_persisting() {
    let sandbox = unique_temp_dir("bpk-cli-query");
    let db = sandbox.join("bpk.sqlite3");
    let responses = write_responses(&sandbox);

    let found = run_json([
        "--db",
        path_str(&db),
        "--responses",
        path_str(&responses),
        "bpk",
        "query",
        "--first-name",
        "Anna",
        "--last-name",
        "Berger",
        "--birth-date",
        "1979-11-03 00:00:00",
    ]);
    assert_eq!(as_str(&found, "bpk_extern"), "AT-ANNA");
    assert_eq!(as_str(&found, "bpk_status"), "resolved");
    assert!(!db.exists());

    for birth_date in ["03.11.1979", "1979-11-03 garbage"] {
        let invalid = run_bpk([
            "--db",
            path_str(&db),
            "bpk",
            "query",
            "--first-name",
            "Anna",
            "--last-name",
            "Berger",
            "--birth-date",
            birth_date,
        ]);
        assert!(!invalid.status.success(), "{birth_date} should be rejected");
    }
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let sandbox = unique_temp_dir("bpk-cli-flags");
    let db = sandbox.join("bpk.sqlite3");
    let responses = write_responses(&sandbox);
    let anna = add_person(&db, "Anna", "Berger", "1979-11-03");

    let persons = run_json(["person", "list", "--db", path_str(&db)]);
    assert_eq!(persons.get("persons").and_then(Value::as_array).map(Vec::len), Some(1));

    let run = run_json([
        "lookup",
        "run",
        "--db",
        path_str(&db),
        "--responses",
        path_str(&responses),
    ]);
    assert_eq!(as_i64(&run, "success"), 1);
    assert_eq!(ids(&run, "person_ids"), vec![anna]);
}

#[test]
fn config_and_identity_edit_commands() {
    let sandbox = unique_temp_dir("bpk-cli-config");
    let db = sandbox.join("bpk.sqlite3");

    let defaults = run_json(["--db", path_str(&db), "config", "show"]);
    assert_eq!(as_i64(&defaults, "rate_limit"), 200);
    assert_eq!(as_i64(&defaults, "retry_interval_days"), 90);

    let updated = run_json(["--db", path_str(&db), "config", "set", "--rate-limit", "1"]);
    assert_eq!(as_i64(&updated, "rate_limit"), 1);

    let rejected = run_bpk(["--db", path_str(&db), "config", "set", "--rate-limit", "0"]);
    assert!(!rejected.status.success());

    let first = add_person(&db, "Anna", "Berger", "1979-11-03");
    let _second = add_person(&db, "Franz", "Koller", "1955-01-20");
    let run = run_json(["--db", path_str(&db), "lookup", "run"]);
    assert_eq!(ids(&run, "person_ids"), vec![first]);

    let edited = run_json([
        "--db",
        path_str(&db),
        "person",
        "update",
        "--id",
        &first.to_string(),
        "--last-name",
        "Berger-Hofer",
    ]);
    let changed = edited
        .get("changed_attributes")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("changed_attributes missing: {edited}"));
    assert_eq!(changed, &vec![Value::String("last_name".to_string())]);
    let bpk = edited.get("bpk").unwrap_or_else(|| panic!("bpk missing: {edited}"));
    assert_eq!(as_str(bpk, "status"), "unknown");
    assert!(as_str(bpk, "error_note").starts_with("reset: "));
}
