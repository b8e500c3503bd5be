use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_featmgr<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_featmgr"))
        .arg("--db")
        .arg(db)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute featmgr binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_featmgr(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "featmgr command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(as_str(&value, "contract_version"), "cli.v1");
    value
}

fn run_failure<I, S>(db: &Path, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_featmgr(db, args);
    assert!(!output.status.success(), "command unexpectedly succeeded");
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn set_query_and_boot_bookkeeping() {
    let sandbox = unique_temp_dir("featmgr-cli-set");
    let db = sandbox.join("featmgr.sqlite3");

    let stamp = run_json(&db, ["change-stamp"]);
    assert_eq!(as_u64(&stamp, "change_stamp"), 0);

    let set = run_json(&db, ["set", "--id", "36354489,12345", "--state", "enabled"]);
    assert_eq!(as_u64(&set, "change_stamp"), 1);
    let applied = as_array(&set, "applied");
    assert_eq!(applied.len(), 2);
    assert_eq!(as_str(&applied[0], "section"), "runtime");
    assert_eq!(as_u64(&applied[0], "applied"), 2);
    let bookkeeping = applied[1]
        .get("bookkeeping")
        .unwrap_or_else(|| panic!("boot write should report bookkeeping: {set}"));
    assert_eq!(as_str(bookkeeping, "boot_state"), "boot_pending");

    let query = run_json(&db, ["query", "--id", "36354489,999"]);
    let records = as_array(&query, "records");
    assert_eq!(records.len(), 1);
    assert_eq!(as_u64(&records[0], "feature_id"), 36_354_489);
    assert_eq!(as_u64(&records[0], "priority"), 8);
    assert_eq!(as_str(&records[0], "enabled_state"), "enabled");
    assert_eq!(as_array(&query, "missing").as_slice(), [Value::from(999)]);

    let pending = run_json(&db, ["query", "--pending"]);
    assert_eq!(as_array(&pending, "pending").len(), 2);

    let boot_state = run_json(&db, ["boot-state", "get"]);
    assert_eq!(as_str(&boot_state, "boot_state"), "boot_pending");
    let committed = run_json(&db, ["boot-state", "set", "--state", "committed"]);
    assert_eq!(as_str(&committed, "boot_state"), "committed");
    let initialized = run_json(&db, ["boot-state", "init"]);
    assert_eq!(initialized.get("initialized"), Some(&Value::Bool(true)));
    assert_eq!(as_str(&initialized, "boot_state"), "uninitialized");

    let stamp = run_json(&db, ["change-stamp"]);
    assert_eq!(as_u64(&stamp, "change_stamp"), 1);

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup temp dir {}: {err}", sandbox.display()));
}

#[test]
fn rejected_batches_leave_stores_untouched() {
    let sandbox = unique_temp_dir("featmgr-cli-reject");
    let db = sandbox.join("featmgr.sqlite3");

    let stderr = run_failure(
        &db,
        ["set", "--id", "7", "--state", "enabled", "--priority", "imagedefault"],
    );
    assert!(stderr.contains("protected"), "unexpected stderr: {stderr}");

    let stderr = run_failure(
        &db,
        ["set", "--id", "7", "--state", "enabled", "--priority", "userpolicy", "--variant", "2"],
    );
    assert!(stderr.contains("UserPolicy"), "unexpected stderr: {stderr}");

    let _first = run_json(&db, ["set", "--id", "7", "--state", "disabled", "--store", "runtime"]);
    let stderr = run_failure(
        &db,
        ["set", "--id", "8", "--state", "enabled", "--store", "runtime", "--stamp", "42"],
    );
    assert!(stderr.contains("stale"), "unexpected stderr: {stderr}");

    let query = run_json(&db, ["query"]);
    assert_eq!(as_u64(&query, "change_stamp"), 1);
    assert_eq!(as_array(&query, "records").len(), 1);
    let pending = run_json(&db, ["query", "--pending"]);
    assert!(as_array(&pending, "pending").is_empty());

    let stderr = run_failure(&db, ["set", "--id", "7"]);
    assert!(stderr.contains("--state"), "unexpected stderr: {stderr}");

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup temp dir {}: {err}", sandbox.display()));
}

#[test]
fn reset_and_full_reset_clear_overrides() {
    let sandbox = unique_temp_dir("featmgr-cli-reset");
    let db = sandbox.join("featmgr.sqlite3");

    let _set = run_json(&db, ["set", "--id", "1,2,3", "--state", "enabled", "--priority", "service"]);
    let _reset = run_json(&db, ["reset", "--id", "1", "--priority", "service"]);

    let query = run_json(&db, ["query"]);
    assert_eq!(as_array(&query, "records").len(), 2);
    let pending = run_json(&db, ["query", "--pending"]);
    assert_eq!(as_array(&pending, "pending").len(), 2);

    let full = run_json(&db, ["full-reset"]);
    assert_eq!(as_array(&full, "applied").len(), 2);

    let query = run_json(&db, ["query"]);
    assert!(as_array(&query, "records").is_empty());
    let pending = run_json(&db, ["query", "--pending"]);
    assert!(as_array(&pending, "pending").is_empty());

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup temp dir {}: {err}", sandbox.display()));
}

#[test]
fn subscriptions_and_usage_reports() {
    let sandbox = unique_temp_dir("featmgr-cli-subs");
    let db = sandbox.join("featmgr.sqlite3");

    let stderr = run_failure(&db, ["notify-usage", "--id", "55", "--kind", "2"]);
    assert!(stderr.contains("0xc0000225"), "unexpected stderr: {stderr}");

    let _added = run_json(
        &db,
        ["subs", "add", "--id", "55", "--kind", "2", "--options", "1", "--target", "9"],
    );
    let live = run_json(&db, ["subs", "query"]);
    assert_eq!(as_array(&live, "subscriptions").len(), 1);
    let persisted = run_json(&db, ["subs", "query", "--section", "boot"]);
    let persisted = as_array(&persisted, "subscriptions");
    assert_eq!(persisted.len(), 1);
    assert_eq!(as_u64(&persisted[0], "reporting_target"), 9);

    let notified = run_json(&db, ["notify-usage", "--id", "55", "--kind", "2"]);
    assert_eq!(as_u64(&notified["notified"], "feature_id"), 55);

    // Options differ: the live entry goes, the persisted leaf stays.
    let _removed = run_json(
        &db,
        ["subs", "remove", "--id", "55", "--kind", "2", "--options", "0", "--target", "9"],
    );
    let live = run_json(&db, ["subs", "query"]);
    assert!(as_array(&live, "subscriptions").is_empty());
    let persisted = run_json(&db, ["subs", "query", "--section", "boot"]);
    assert_eq!(as_array(&persisted, "subscriptions").len(), 1);

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup temp dir {}: {err}", sandbox.display()));
}

#[test]
fn export_then_import_into_fresh_database() {
    let sandbox = unique_temp_dir("featmgr-cli-export");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let blob = sandbox.join("features.bin");

    let _set = run_json(&db_a, ["set", "--id", "100,200", "--state", "enabled"]);
    let _policy = run_json(
        &db_a,
        ["set", "--id", "300", "--state", "disabled", "--priority", "userpolicy", "--store", "boot"],
    );

    let exported = run_json(&db_a, ["export", "--out", path_str(&blob)]);
    assert_eq!(as_u64(&exported, "runtime_records"), 2);
    assert_eq!(as_u64(&exported, "boot_records"), 3);
    assert_eq!(as_u64(&exported, "bytes"), 4 + 2 * 12 + 4 + 3 * 12);

    let imported = run_json(&db_b, ["import", "--in", path_str(&blob)]);
    assert_eq!(as_u64(&imported, "runtime_applied"), 2);
    assert_eq!(as_u64(&imported, "boot_applied"), 3);
    assert_eq!(as_u64(&imported, "dropped_protected"), 0);

    let query = run_json(&db_b, ["query", "--id", "100"]);
    assert_eq!(as_str(&as_array(&query, "records")[0], "enabled_state"), "enabled");
    let pending = run_json(&db_b, ["query", "--pending"]);
    assert_eq!(as_array(&pending, "pending").len(), 3);

    fs::write(&blob, [1_u8, 0, 0]).unwrap_or_else(|err| panic!("failed to truncate blob: {err}"));
    let stderr = run_failure(&db_b, ["import", "--in", path_str(&blob)]);
    assert!(stderr.contains("malformed"), "unexpected stderr: {stderr}");

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup temp dir {}: {err}", sandbox.display()));
}

#[test]
fn layout_file_relocates_boot_store() {
    let sandbox = unique_temp_dir("featmgr-cli-layout");
    let db = sandbox.join("featmgr.sqlite3");
    let layout = sandbox.join("layout.json");
    fs::write(&layout, r#"{ "overrides": "Test\\Overrides" }"#)
        .unwrap_or_else(|err| panic!("failed to write layout: {err}"));

    let _set = run_json(
        &db,
        ["--layout", path_str(&layout), "set", "--id", "5", "--state", "enabled", "--store", "boot"],
    );
    let relocated = run_json(&db, ["--layout", path_str(&layout), "query", "--pending"]);
    assert_eq!(as_array(&relocated, "pending").len(), 1);
    let default_layout = run_json(&db, ["query", "--pending"]);
    assert!(as_array(&default_layout, "pending").is_empty());

    let fix = run_json(&db, ["fix-lkg"]);
    assert!(fix.get("lkg_repair").is_some());

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup temp dir {}: {err}", sandbox.display()));
}
