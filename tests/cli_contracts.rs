use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use std::time::{Duration, Instant};
use tempfile::tempdir;

const MANIFEST: &str = r#"{
  "root_group": "Main",
  "sections": [
    { "kind": "group", "name": "Main", "children": ["Sources"] },
    { "kind": "group", "name": "Sources", "path": "Sources", "files": ["App.swift"] }
  ]
}
"#;

const ENV_KEYS: [&str; 11] = [
    "LOG_LEVEL",
    "LOG_FILE",
    "TRANSACTION_LOG_FILE",
    "ERROR_HANDLING_ENABLED",
    "AUTO_REPAIR",
    "AUTO_COMMIT_DELAY_MS",
    "KEEP_BACKUP_DAYS",
    "INTEGRITY_CHECK_MODE",
    "LOCK_TIMEOUT_MS",
    "TRANSACTION_STALE_MS",
    "MANIFEST_FILE",
];

fn projguard(project: &Path, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_projguard"));
    cmd.current_dir(project).args(args);
    for key in ENV_KEYS {
        cmd.env_remove(key);
    }
    cmd.env("LOG_LEVEL", "error");
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.output().expect("failed to execute projguard")
}

fn json_stdout(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}): {}",
            e,
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn write_tree(root: &Path) {
    fs::create_dir_all(root.join("Sources")).unwrap();
    fs::write(root.join("Sources/App.swift"), "").unwrap();
    fs::write(root.join("project.json"), MANIFEST).unwrap();
}

#[test]
fn begin_backup_rollback_across_processes() {
    let dir = tempdir().unwrap();
    write_tree(dir.path());
    let root = dir.path();

    let begin = projguard(root, &["--format", "json", "transaction", "begin", "EDIT"], &[]);
    assert_eq!(begin.status.code(), Some(0), "{:?}", begin);
    let envelope = json_stdout(&begin);
    assert_eq!(envelope["cmd"], "transaction.begin");
    assert_eq!(envelope["transaction"]["status"], "OPEN");
    let txn = envelope["transaction"]["id"].as_str().unwrap().to_string();

    let backup = projguard(root, &["transaction", "backup_file", &txn, "project.json"], &[]);
    assert_eq!(backup.status.code(), Some(0), "{:?}", backup);
    fs::write(root.join("project.json"), "garbage").unwrap();

    let status = projguard(
        root,
        &["--format", "json", "transaction", "status", "project.json"],
        &[],
    );
    assert_eq!(json_stdout(&status)["status"]["state"], "transaction");

    let rollback = projguard(root, &["transaction", "rollback", &txn], &[]);
    assert_eq!(rollback.status.code(), Some(0), "{:?}", rollback);
    assert_eq!(fs::read_to_string(root.join("project.json")).unwrap(), MANIFEST);

    let again = projguard(root, &["transaction", "commit", &txn], &[]);
    assert_eq!(again.status.code(), Some(2));
}

#[test]
fn second_begin_on_same_manifest_is_busy_within_timeout() {
    let dir = tempdir().unwrap();
    write_tree(dir.path());
    let root = dir.path();
    let env = [("LOCK_TIMEOUT_MS", "300")];

    let first = projguard(root, &["transaction", "begin", "EDIT"], &env);
    assert_eq!(first.status.code(), Some(0), "{:?}", first);

    let started = Instant::now();
    let second = projguard(root, &["--format", "json", "transaction", "begin", "EDIT"], &env);
    let elapsed = started.elapsed();

    assert_eq!(second.status.code(), Some(1), "{:?}", second);
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
    let envelope = json_stdout(&second);
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["error"]["code"], "RESOURCE_BUSY");
}

#[test]
fn integrity_check_exit_codes() {
    let dir = tempdir().unwrap();
    write_tree(dir.path());
    let root = dir.path().to_str().unwrap();

    let clean = projguard(dir.path(), &["integrity", "check", root, "detailed"], &[]);
    assert_eq!(clean.status.code(), Some(0), "{:?}", clean);

    fs::write(dir.path().join("Sources/Orphan.swift"), "").unwrap();
    let dirty = projguard(
        dir.path(),
        &["--format", "json", "integrity", "check", root, "normal"],
        &[],
    );
    assert_eq!(dirty.status.code(), Some(1));
    let envelope = json_stdout(&dirty);
    assert_eq!(envelope["issues"][0]["id"], "I001");
    assert_eq!(envelope["issues"][0]["category"], "OrphanedResource");
    assert_eq!(envelope["summary"]["fixable"], 1);

    let bad_mode = projguard(dir.path(), &["integrity", "check", root, "exhaustive"], &[]);
    assert_eq!(bad_mode.status.code(), Some(2));

    let bad_env = projguard(
        dir.path(),
        &["integrity", "check", root],
        &[("INTEGRITY_CHECK_MODE", "exhaustive")],
    );
    assert_eq!(bad_env.status.code(), Some(2));
}

#[test]
fn auto_repair_follows_the_check() {
    let dir = tempdir().unwrap();
    write_tree(dir.path());
    fs::write(dir.path().join("Sources/Orphan.swift"), "").unwrap();
    let root = dir.path().to_str().unwrap();

    let out = projguard(
        dir.path(),
        &["--format", "json", "integrity", "check", root],
        &[("AUTO_REPAIR", "true")],
    );
    assert_eq!(out.status.code(), Some(0), "{:?}", out);
    assert_eq!(json_stdout(&out)["repair"]["applied"], 1);
    assert!(
        fs::read_to_string(dir.path().join("project.json"))
            .unwrap()
            .contains("Orphan.swift")
    );
}

#[test]
fn automatic_repair_reports_partial_success() {
    let dir = tempdir().unwrap();
    write_tree(dir.path());
    let with_malformed = MANIFEST.replace(
        r#""sections": ["#,
        r#""sections": [
    { "kind": "widget" },"#,
    );
    fs::write(dir.path().join("project.json"), with_malformed).unwrap();
    fs::write(dir.path().join("Sources/Orphan.swift"), "").unwrap();
    let root = dir.path().to_str().unwrap();

    let out = projguard(
        dir.path(),
        &["--format", "json", "repair", root, "automatic"],
        &[],
    );
    assert_eq!(out.status.code(), Some(1), "{:?}", out);
    let envelope = json_stdout(&out);
    assert_eq!(envelope["report"]["applied"], 1);
    assert_eq!(envelope["report"]["unresolved"], 1);

    let listed = projguard(
        dir.path(),
        &["--format", "json", "transaction", "list"],
        &[],
    );
    let txns = json_stdout(&listed)["transactions"].as_array().unwrap().clone();
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0]["kind"], "REPAIR");
    assert_eq!(txns[0]["status"], "COMMITTED");
}

#[test]
fn invalid_invocations_exit_two() {
    let dir = tempdir().unwrap();
    write_tree(dir.path());
    let missing = dir.path().join("nope");

    let bad_policy = projguard(
        dir.path(),
        &["repair", dir.path().to_str().unwrap(), "yolo"],
        &[],
    );
    assert_eq!(bad_policy.status.code(), Some(2));

    let bad_path = projguard(
        dir.path(),
        &["integrity", "check", missing.to_str().unwrap()],
        &[],
    );
    assert_eq!(bad_path.status.code(), Some(2));

    let unknown_txn = projguard(dir.path(), &["transaction", "commit", "01NOPE"], &[]);
    assert_eq!(unknown_txn.status.code(), Some(2));

    let usage = projguard(dir.path(), &["transaction", "frobnicate"], &[]);
    assert_eq!(usage.status.code(), Some(2));

    let bad_bool = projguard(
        dir.path(),
        &["transaction", "list"],
        &[("ERROR_HANDLING_ENABLED", "maybe")],
    );
    assert_eq!(bad_bool.status.code(), Some(2));
}

#[test]
fn startup_sweep_rolls_back_stale_cli_transactions() {
    let dir = tempdir().unwrap();
    write_tree(dir.path());
    let root = dir.path();

    let begin = projguard(root, &["--format", "json", "transaction", "begin", "EDIT"], &[]);
    let txn = json_stdout(&begin)["transaction"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    projguard(root, &["transaction", "backup_file", &txn, "project.json"], &[]);
    fs::write(root.join("project.json"), "half-written").unwrap();

    // With the sweep disabled nothing is touched.
    let untouched = projguard(
        root,
        &["transaction", "list", "--open"],
        &[("ERROR_HANDLING_ENABLED", "false"), ("TRANSACTION_STALE_MS", "1")],
    );
    assert_eq!(untouched.status.code(), Some(0));
    assert_eq!(fs::read_to_string(root.join("project.json")).unwrap(), "half-written");

    std::thread::sleep(Duration::from_millis(20));
    let swept = projguard(
        root,
        &["--format", "json", "transaction", "list", "--open"],
        &[("TRANSACTION_STALE_MS", "1")],
    );
    assert_eq!(swept.status.code(), Some(0));
    assert!(json_stdout(&swept)["transactions"].as_array().unwrap().is_empty());
    assert_eq!(fs::read_to_string(root.join("project.json")).unwrap(), MANIFEST);
}

#[test]
fn rejected_arguments_leave_open_transactions_untouched() {
    let dir = tempdir().unwrap();
    write_tree(dir.path());
    let root = dir.path();
    let root_arg = root.to_str().unwrap();

    let begin = projguard(root, &["--format", "json", "transaction", "begin", "EDIT"], &[]);
    let txn = json_stdout(&begin)["transaction"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    projguard(root, &["transaction", "backup_file", &txn, "project.json"], &[]);
    fs::write(root.join("project.json"), "edited").unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let stale = [("TRANSACTION_STALE_MS", "1")];
    let bad_mode = projguard(root, &["integrity", "check", root_arg, "bogus"], &stale);
    assert_eq!(bad_mode.status.code(), Some(2));
    let bad_policy = projguard(root, &["repair", root_arg, "yolo"], &stale);
    assert_eq!(bad_policy.status.code(), Some(2));

    assert_eq!(fs::read_to_string(root.join("project.json")).unwrap(), "edited");
    let open = projguard(
        root,
        &["--format", "json", "transaction", "list", "--open"],
        &[("ERROR_HANDLING_ENABLED", "false")],
    );
    assert_eq!(json_stdout(&open)["transactions"].as_array().unwrap().len(), 1);
}
