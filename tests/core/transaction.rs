use projguard::core::config::Config;
use projguard::core::error::GuardError;
use projguard::core::store::Store;
use projguard::core::transaction::{TransactionManager, TxStatus};
use projguard::core::txlog::{LogEvent, ResourceStatus};
use std::fs;
use std::path::PathBuf;
use tempfile::{TempDir, tempdir};

fn setup_with(config: Config) -> (TempDir, Store, TransactionManager) {
    let tmp = tempdir().unwrap();
    let store = Store::for_project(tmp.path()).unwrap();
    store.ensure_layout().unwrap();
    let manager = TransactionManager::new(&store, &config);
    (tmp, store, manager)
}

fn setup() -> (TempDir, Store, TransactionManager) {
    setup_with(Config {
        lock_timeout_ms: 50,
        ..Config::default()
    })
}

#[test]
fn rollback_restores_previous_content() {
    let (_tmp, store, manager) = setup();
    let x = store.project_root.join("X");
    fs::write(&x, "old").unwrap();

    let txn = manager.begin("FILE_UPDATE", &[x.clone()]).unwrap();
    manager.backup_file(&txn.id, &x, false).unwrap();
    fs::write(&x, "new").unwrap();
    let done = manager.rollback(&txn.id).unwrap();

    assert_eq!(done.status, TxStatus::RolledBack);
    assert_eq!(fs::read_to_string(&x).unwrap(), "old");
}

#[test]
fn rollback_removes_file_created_after_placeholder_backup() {
    let (_tmp, store, manager) = setup();
    let y = store.project_root.join("Y");

    let txn = manager.begin("FILE_CREATE", &[y.clone()]).unwrap();
    let handle = manager.backup_file(&txn.id, &y, true).unwrap();
    assert!(!handle.entry.original_existed);
    fs::write(&y, "created").unwrap();
    manager.rollback(&txn.id).unwrap();

    assert!(!y.exists());
}

#[test]
fn backing_up_missing_file_without_optional_is_not_found() {
    let (_tmp, store, manager) = setup();
    let ghost = store.project_root.join("ghost");
    let txn = manager.begin("FILE_UPDATE", &[ghost.clone()]).unwrap();
    assert!(matches!(
        manager.backup_file(&txn.id, &ghost, false),
        Err(GuardError::NotFound(_))
    ));
    manager.rollback(&txn.id).unwrap();
}

#[test]
fn failing_mutation_leaves_every_file_as_before() {
    let (_tmp, store, manager) = setup();
    let a = store.project_root.join("a.txt");
    let b = store.project_root.join("b.txt");
    let created = store.project_root.join("new.txt");
    fs::write(&a, "a0").unwrap();
    fs::write(&b, "b0").unwrap();

    let result = manager.execute("BULK_EDIT", &[a.clone(), b.clone()], |scope| {
        scope.write(&a, b"a1")?;
        scope.write(&b, b"b1")?;
        scope.write(&created, b"n1")?;
        Err::<(), _>(GuardError::Manifest("simulated mid-edit failure".into()))
    });

    match result {
        Err(GuardError::MutationFailure { reason, .. }) => {
            assert!(reason.contains("simulated mid-edit failure"))
        }
        other => panic!("expected MutationFailure, got {:?}", other),
    }
    assert_eq!(fs::read_to_string(&a).unwrap(), "a0");
    assert_eq!(fs::read_to_string(&b).unwrap(), "b0");
    assert!(!created.exists());
}

#[test]
fn successful_execute_commits_and_releases() {
    let (_tmp, store, manager) = setup();
    let a = store.project_root.join("a.txt");
    fs::write(&a, "a0").unwrap();

    let done = manager
        .execute("FILE_UPDATE", &[a.clone()], |scope| {
            scope.write(&a, b"a1")?;
            scope.note("bumped a");
            Ok(42)
        })
        .unwrap();
    assert_eq!(done.value, 42);
    assert_eq!(done.transaction.status, TxStatus::Committed);
    assert_eq!(fs::read_to_string(&a).unwrap(), "a1");
    assert_eq!(manager.current_status(&a).unwrap(), ResourceStatus::Idle);

    // Lock is free again.
    let again = manager.begin("FILE_UPDATE", &[a.clone()]).unwrap();
    manager.commit(&again.id).unwrap();
}

#[test]
fn second_begin_on_locked_resource_is_busy() {
    let (_tmp, store, manager) = setup();
    let m = store.project_root.join("project.json");
    fs::write(&m, "{}").unwrap();

    let first = manager.begin("EDIT", &[m.clone()]).unwrap();
    let err = manager.begin("EDIT", &[m.clone()]).unwrap_err();
    assert!(matches!(err, GuardError::ResourceBusy { .. }));
    assert_eq!(err.exit_code(), 1);

    match manager.current_status(&m).unwrap() {
        ResourceStatus::Transaction { txn_id, status } => {
            assert_eq!(txn_id, first.id);
            assert_eq!(status, TxStatus::Open);
        }
        other => panic!("expected open transaction, got {:?}", other),
    }
    manager.commit(&first.id).unwrap();
}

#[test]
fn restore_can_be_repeated() {
    let (_tmp, store, manager) = setup();
    let x = store.project_root.join("X");
    fs::write(&x, "old").unwrap();
    let txn = manager.begin("FILE_UPDATE", &[x.clone()]).unwrap();
    let handle = manager.backup_file(&txn.id, &x, false).unwrap();

    fs::write(&x, "new").unwrap();
    manager.backups().restore(&handle).unwrap();
    manager.backups().restore(&handle).unwrap();
    assert_eq!(fs::read_to_string(&x).unwrap(), "old");
    manager.commit(&txn.id).unwrap();
}

#[test]
fn corrupted_backup_marks_transaction_failed() {
    let (_tmp, store, manager) = setup();
    let good = store.project_root.join("good.txt");
    let bad = store.project_root.join("bad.txt");
    fs::write(&good, "g0").unwrap();
    fs::write(&bad, "b0").unwrap();

    let txn = manager.begin("FILE_UPDATE", &[good.clone(), bad.clone()]).unwrap();
    manager.backup_file(&txn.id, &good, false).unwrap();
    let bad_handle = manager.backup_file(&txn.id, &bad, false).unwrap();
    fs::write(&good, "g1").unwrap();
    fs::write(&bad, "b1").unwrap();
    fs::write(bad_handle.entry.backup_path.as_ref().unwrap(), "tampered").unwrap();

    match manager.rollback(&txn.id) {
        Err(GuardError::RestoreFailure { txn_id, paths }) => {
            assert_eq!(txn_id, txn.id);
            assert_eq!(paths, vec![bad_handle.entry.original_path.clone()]);
        }
        other => panic!("expected RestoreFailure, got {:?}", other),
    }
    // The intact file is still restored.
    assert_eq!(fs::read_to_string(&good).unwrap(), "g0");
    assert_eq!(
        manager.log().status_of(&txn.id).unwrap(),
        Some(TxStatus::Failed)
    );
    let last = manager.log().tail(1).unwrap();
    assert_eq!(last[0].event, LogEvent::Fail);

    // Failed backups are kept for manual recovery.
    let pruned = manager.prune(0).unwrap();
    assert_eq!(pruned.kept_failed, 1);
    assert!(manager.backups().txn_dir(&txn.id).exists());
}

#[test]
fn recover_rolls_back_stale_transactions() {
    let (_tmp, store, manager) = setup_with(Config {
        lock_timeout_ms: 50,
        stale_after_ms: 0,
        ..Config::default()
    });
    let x = store.project_root.join("X");
    fs::write(&x, "old").unwrap();
    let txn = manager.begin_detached("FILE_UPDATE", &[x.clone()]).unwrap();
    manager.backup_file(&txn.id, &x, false).unwrap();
    fs::write(&x, "half-written").unwrap();

    let report = manager.recover().unwrap();
    assert_eq!(report.rolled_back, vec![txn.id.clone()]);
    assert_eq!(fs::read_to_string(&x).unwrap(), "old");
    assert!(manager.list(true).unwrap().is_empty());
}

#[test]
fn auto_commit_only_when_enabled() {
    let (_tmp, store, manager) = setup_with(Config {
        lock_timeout_ms: 50,
        auto_commit_delay_ms: 1,
        ..Config::default()
    });
    let x = store.project_root.join("X");
    fs::write(&x, "v").unwrap();
    let txn = manager.begin_detached("FILE_UPDATE", &[x.clone()]).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    let report = manager.recover().unwrap();
    assert_eq!(report.auto_committed, vec![txn.id.clone()]);
    assert_eq!(
        manager.log().status_of(&txn.id).unwrap(),
        Some(TxStatus::Committed)
    );

    let (_tmp2, store2, default_manager) = setup();
    let y = store2.project_root.join("Y");
    let open = default_manager.begin_detached("FILE_UPDATE", &[y]).unwrap();
    let report = default_manager.recover().unwrap();
    assert_eq!(report.still_open, vec![open.id]);
}

#[test]
fn prune_removes_only_finished_transactions() {
    let (_tmp, store, manager) = setup();
    let a = store.project_root.join("a.txt");
    let b = store.project_root.join("b.txt");
    fs::write(&a, "a").unwrap();
    fs::write(&b, "b").unwrap();

    let done = manager.begin("FILE_UPDATE", &[a.clone()]).unwrap();
    manager.backup_file(&done.id, &a, false).unwrap();
    manager.commit(&done.id).unwrap();
    let open = manager.begin("FILE_UPDATE", &[b.clone()]).unwrap();
    manager.backup_file(&open.id, &b, false).unwrap();

    let report = manager.prune(0).unwrap();
    assert_eq!(report.removed, vec![done.id.clone()]);
    assert_eq!(report.kept_open, 1);
    assert!(!manager.backups().txn_dir(&done.id).exists());

    // Commit after prune of others still works.
    manager.commit(&open.id).unwrap();
    let listed: Vec<PathBuf> = manager
        .list(false)
        .unwrap()
        .iter()
        .flat_map(|t| t.resources.iter().map(PathBuf::from))
        .collect();
    assert_eq!(listed.len(), 2);
}

#[test]
fn recovery_sweep_leaves_in_flight_execute_alone() {
    let (_tmp, store, manager) = setup();
    let x = store.project_root.join("x.txt");
    fs::write(&x, "old").unwrap();
    let sweeper = TransactionManager::new(
        &store,
        &Config {
            auto_commit_delay_ms: 1,
            stale_after_ms: 0,
            ..Config::default()
        },
    );

    let result = manager.execute("FILE_UPDATE", &[x.clone()], |scope| {
        scope.write(&x, b"new")?;
        std::thread::sleep(std::time::Duration::from_millis(10));
        let report = sweeper.recover()?;
        assert!(report.auto_committed.is_empty());
        assert!(report.rolled_back.is_empty());
        assert_eq!(report.still_open, vec![scope.id().to_string()]);
        Err::<(), _>(GuardError::Manifest("edit rejected".into()))
    });

    assert!(matches!(result, Err(GuardError::MutationFailure { .. })));
    assert_eq!(fs::read_to_string(&x).unwrap(), "old");
    assert!(manager.list(true).unwrap().is_empty());
}

#[test]
fn prune_compacts_log_of_finished_transactions() {
    let (_tmp, store, manager) = setup();
    let a = store.project_root.join("a.txt");
    fs::write(&a, "a").unwrap();
    let done = manager.begin("FILE_UPDATE", &[a.clone()]).unwrap();
    manager.commit(&done.id).unwrap();

    let report = manager.prune(0).unwrap();
    assert!(report.log.rotated);
    // Rotated history is still replayed until it settles.
    assert_eq!(
        manager.log().status_of(&done.id).unwrap(),
        Some(TxStatus::Committed)
    );
    let again = manager.begin("FILE_UPDATE", &[a.clone()]).unwrap();
    manager.commit(&again.id).unwrap();
    assert_eq!(manager.list(false).unwrap().len(), 2);
}

#[test]
fn begin_after_torn_log_tail_stays_visible() {
    use std::io::Write;

    let (_tmp, store, manager) = setup();
    let x = store.project_root.join("x.txt");
    fs::write(&x, "v").unwrap();
    let warmup = manager.begin("FILE_UPDATE", &[x.clone()]).unwrap();
    manager.commit(&warmup.id).unwrap();
    let mut log = fs::OpenOptions::new()
        .append(true)
        .open(manager.log().path())
        .unwrap();
    log.write_all(b"{\"ts\":\"17").unwrap();
    drop(log);

    let txn = manager.begin("FILE_UPDATE", &[x.clone()]).unwrap();
    assert_eq!(manager.log().status_of(&txn.id).unwrap(), Some(TxStatus::Open));
    let open: Vec<String> = manager.list(true).unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(open, vec![txn.id.clone()]);
    assert!(matches!(
        manager.begin("FILE_UPDATE", &[x.clone()]),
        Err(GuardError::ResourceBusy { .. })
    ));
    manager.commit(&txn.id).unwrap();
}
