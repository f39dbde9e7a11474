use super::*;
use crate::engine::types::TxnState;
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> CommitCoordinator {
    CommitCoordinator::open(dir.to_path_buf(), WalConfig::default()).unwrap()
}

fn commit_file(coord: &CommitCoordinator, filename: &str, chunks: &[&str]) -> (TxnId, Lsn) {
    let txn_id = coord.new_transaction(filename).unwrap();
    for (i, chunk) in chunks.iter().enumerate() {
        coord
            .write(txn_id, i as SeqNo + 1, chunk.as_bytes().to_vec())
            .unwrap();
    }
    match coord.request_commit(txn_id, chunks.len() as SeqNo).unwrap() {
        CommitOutcome::Committed { commit_lsn, newly } => {
            assert!(newly);
            (txn_id, commit_lsn)
        }
        other => panic!("unexpected commit outcome {:?}", other),
    }
}

#[test]
fn test_hello_world_commit() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());

    let txn_id = coord.new_transaction("report.txt").unwrap();
    assert!(txn_id >= 1 && txn_id <= i32::MAX as TxnId);
    assert_eq!(coord.write(txn_id, 1, b"hello".to_vec()).unwrap(), WriteOutcome::Buffered);
    assert_eq!(coord.write(txn_id, 2, b" world".to_vec()).unwrap(), WriteOutcome::Buffered);

    let outcome = coord.request_commit(txn_id, 2).unwrap();
    assert_eq!(outcome, CommitOutcome::Committed { commit_lsn: 1, newly: true });
    assert_eq!(coord.read_file("report.txt").unwrap(), b"hello world".to_vec());

    let rec = coord.snapshot(txn_id).unwrap();
    assert_eq!(rec.state(), TxnState::Committed { flushed: true });
    assert_eq!(coord.pending_commits(), 0);
}

#[test]
fn test_out_of_order_writes_and_resend() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());

    let txn_id = coord.new_transaction("order.txt").unwrap();
    coord.write(txn_id, 4, b"d".to_vec()).unwrap();
    coord.write(txn_id, 1, b"a".to_vec()).unwrap();
    coord.write(txn_id, 3, b"c".to_vec()).unwrap();

    assert_eq!(coord.request_commit(txn_id, 4).unwrap(), CommitOutcome::Missing(vec![2]));
    assert_eq!(coord.current_lsn(), 0);
    assert!(coord.read_file("order.txt").is_err());

    // The resent write closes the gap and completes the commit
    let outcome = coord.write(txn_id, 2, b"b".to_vec()).unwrap();
    assert_eq!(outcome, WriteOutcome::Committed { commit_lsn: 1 });
    assert_eq!(coord.read_file("order.txt").unwrap(), b"abcd".to_vec());
}

#[test]
fn test_commit_appends_to_existing_file() {
    let temp_dir = tempdir().unwrap();
    fs::write(temp_dir.path().join("log.txt"), b"first;").unwrap();
    let coord = open(temp_dir.path());
    assert_eq!(coord.access_table().state("log.txt"), Some(0));

    commit_file(&coord, "log.txt", &["second;"]);
    commit_file(&coord, "log.txt", &["third;"]);
    assert_eq!(coord.read_file("log.txt").unwrap(), b"first;second;third;".to_vec());
}

#[test]
fn test_repeated_commit_is_acknowledged() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    let (txn_id, lsn) = commit_file(&coord, "a.txt", &["x"]);

    let again = coord.request_commit(txn_id, 1).unwrap();
    assert_eq!(again, CommitOutcome::Committed { commit_lsn: lsn, newly: false });
    // payload applied once
    assert_eq!(coord.read_file("a.txt").unwrap(), b"x".to_vec());

    let err = coord.request_commit(txn_id, 2).unwrap_err();
    assert!(matches!(err, SlateError::InvalidOperation(_)));
}

#[test]
fn test_commit_bound_mismatch() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    let txn_id = coord.new_transaction("a.txt").unwrap();
    coord.write(txn_id, 1, b"x".to_vec()).unwrap();
    assert_eq!(coord.request_commit(txn_id, 3).unwrap(), CommitOutcome::Missing(vec![2, 3]));
    let err = coord.request_commit(txn_id, 2).unwrap_err();
    assert!(matches!(err, SlateError::SequenceMismatch { expected: 3, .. }));
}

#[test]
fn test_abort_and_commit_are_exclusive() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());

    let aborted = coord.new_transaction("a.txt").unwrap();
    coord.write(aborted, 1, b"x".to_vec()).unwrap();
    assert!(coord.abort(aborted).unwrap());
    assert!(!coord.abort(aborted).unwrap());
    let before = coord.snapshot(aborted).unwrap();
    assert!(matches!(
        coord.request_commit(aborted, 1),
        Err(SlateError::InvalidOperation(_))
    ));
    assert!(matches!(
        coord.write(aborted, 2, b"y".to_vec()),
        Err(SlateError::InvalidOperation(_))
    ));
    assert_eq!(coord.snapshot(aborted).unwrap(), before);

    let (committed, _) = commit_file(&coord, "b.txt", &["y"]);
    let before = coord.snapshot(committed).unwrap();
    assert!(matches!(coord.abort(committed), Err(SlateError::InvalidOperation(_))));
    assert_eq!(coord.snapshot(committed).unwrap(), before);
}

#[test]
fn test_unknown_transaction() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    assert!(matches!(
        coord.write(12345, 1, vec![]),
        Err(SlateError::InvalidTransactionId(12345))
    ));
    assert!(matches!(
        coord.request_commit(12345, 1),
        Err(SlateError::InvalidTransactionId(_))
    ));
    assert!(matches!(coord.abort(12345), Err(SlateError::InvalidTransactionId(_))));
}

#[test]
fn test_invalid_filename_rejected() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    assert!(matches!(
        coord.new_transaction(".slatelog"),
        Err(SlateError::WrongMessageFormat(_))
    ));
    assert!(matches!(
        coord.read_file("../x"),
        Err(SlateError::WrongMessageFormat(_))
    ));
    assert_eq!(coord.transaction_count(), 0);
}

#[test]
fn test_concurrent_commits_get_gap_free_lsns() {
    let temp_dir = tempdir().unwrap();
    let coord = Arc::new(open(temp_dir.path()));

    let mut handles = Vec::new();
    for t in 0..8 {
        let coord = Arc::clone(&coord);
        handles.push(thread::spawn(move || {
            let mut lsns = Vec::new();
            for i in 0..5 {
                // half the threads share one file
                let filename = if t % 2 == 0 {
                    "shared.txt".to_string()
                } else {
                    format!("file-{}.txt", t)
                };
                let (_, lsn) = commit_file(&coord, &filename, &[&format!("{}-{};", t, i)]);
                lsns.push(lsn);
            }
            lsns
        }));
    }

    let mut all: Vec<Lsn> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (1..=40).collect::<Vec<Lsn>>());
    assert_eq!(coord.current_lsn(), 40);

    // shared file holds all 20 chunks, each exactly once
    let shared = String::from_utf8(coord.read_file("shared.txt").unwrap()).unwrap();
    assert_eq!(shared.matches(';').count(), 20);
}

#[test]
fn test_same_file_applied_in_lsn_order() {
    let temp_dir = tempdir().unwrap();
    let coord = Arc::new(open(temp_dir.path()));

    let handles: Vec<_> = (0..6)
        .map(|t| {
            let coord = Arc::clone(&coord);
            thread::spawn(move || {
                for i in 0..5 {
                    let txn_id = coord.new_transaction("ordered.txt").unwrap();
                    coord
                        .write(txn_id, 1, format!("{}-{};", t, i).into_bytes())
                        .unwrap();
                    coord.request_commit(txn_id, 1).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Replay the file from the commit index: LSN order must equal file order
    let expected: Vec<u8> = coord
        .records_after(0)
        .iter()
        .flat_map(|rec| rec.committed_payload().unwrap())
        .collect();
    assert_eq!(coord.read_file("ordered.txt").unwrap(), expected);
    assert_eq!(coord.records_after(0).len(), 30);
}

#[test]
fn test_different_files_do_not_block_each_other() {
    let temp_dir = tempdir().unwrap();
    let coord = Arc::new(open(temp_dir.path()));

    // Hold a reader on one file; commits to another file still go through
    let _reader = coord.access_table().acquire_read("busy.txt");
    let handle = {
        let coord = Arc::clone(&coord);
        thread::spawn(move || commit_file(&coord, "free.txt", &["ok"]))
    };
    handle.join().unwrap();
    assert_eq!(coord.read_file("free.txt").unwrap(), b"ok".to_vec());
}

#[test]
fn test_commit_waits_for_readers() {
    let temp_dir = tempdir().unwrap();
    let coord = Arc::new(open(temp_dir.path()));
    let txn_id = coord.new_transaction("r.txt").unwrap();
    coord.write(txn_id, 1, b"data".to_vec()).unwrap();

    let reader = coord.access_table().acquire_read("r.txt");
    let handle = {
        let coord = Arc::clone(&coord);
        thread::spawn(move || coord.request_commit(txn_id, 1).unwrap())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!coord.snapshot(txn_id).unwrap().is_flushed());
    drop(reader);

    handle.join().unwrap();
    assert!(coord.snapshot(txn_id).unwrap().is_flushed());
}

#[test]
fn test_recovery_restores_state() {
    let temp_dir = tempdir().unwrap();
    let (committed, aborted, open_txn) = {
        let coord = open(temp_dir.path());
        let (committed, _) = commit_file(&coord, "a.txt", &["one", "two"]);
        let aborted = coord.new_transaction("b.txt").unwrap();
        coord.abort(aborted).unwrap();
        let open_txn = coord.new_transaction("c.txt").unwrap();
        coord.write(open_txn, 2, b"later".to_vec()).unwrap();
        (committed, aborted, open_txn)
    };

    let coord = open(temp_dir.path());
    assert_eq!(coord.current_lsn(), 1);
    assert!(coord.snapshot(committed).unwrap().is_flushed());
    assert!(coord.snapshot(aborted).unwrap().is_aborted());
    assert_eq!(coord.read_file("a.txt").unwrap(), b"onetwo".to_vec());

    // an open transaction keeps going after restart
    coord.write(open_txn, 1, b"first-".to_vec()).unwrap();
    coord.request_commit(open_txn, 2).unwrap();
    assert_eq!(coord.read_file("c.txt").unwrap(), b"first-later".to_vec());
    assert_eq!(coord.current_lsn(), 2);
}

#[test]
fn test_recovery_is_idempotent() {
    let temp_dir = tempdir().unwrap();
    {
        let coord = open(temp_dir.path());
        commit_file(&coord, "a.txt", &["1", "2", "3"]);
        commit_file(&coord, "a.txt", &["4"]);
        commit_file(&coord, "b.txt", &["b"]);
        let t = coord.new_transaction("c.txt").unwrap();
        coord.write(t, 1, b"pending".to_vec()).unwrap();
    }

    let (first_table, first_a, first_b) = {
        let coord = open(temp_dir.path());
        (
            coord.table_snapshot(),
            coord.read_file("a.txt").unwrap(),
            coord.read_file("b.txt").unwrap(),
        )
    };
    let coord = open(temp_dir.path());
    assert_eq!(coord.table_snapshot(), first_table);
    assert_eq!(coord.read_file("a.txt").unwrap(), first_a);
    assert_eq!(coord.read_file("b.txt").unwrap(), first_b);
    assert_eq!(first_a, b"1234".to_vec());
}

#[test]
fn test_recovery_materializes_unflushed_commit() {
    let temp_dir = tempdir().unwrap();
    let txn_id = {
        let coord = open(temp_dir.path());
        let txn_id = coord.new_transaction("late.txt").unwrap();
        coord.write(txn_id, 1, b"abc".to_vec()).unwrap();
        txn_id
    };

    // Crash right after the commit record: no flushed record, no file
    {
        let wal = WalWriter::open(
            temp_dir.path().join(crate::storage::LOG_FILE),
            WalConfig::synchronous(),
            false,
        )
        .unwrap();
        wal.append(LogRecord::new(
            txn_id,
            LogOperation::Commit {
                bound: 1,
                commit_lsn: 1,
                flushed: false,
            },
        ))
        .unwrap();
    }
    assert!(!temp_dir.path().join("late.txt").exists());

    let coord = open(temp_dir.path());
    assert_eq!(coord.read_file("late.txt").unwrap(), b"abc".to_vec());
    assert!(coord.snapshot(txn_id).unwrap().is_flushed());
    assert!(coord.store().staging_files().unwrap().is_empty());

    // a second restart does not append the payload again
    drop(coord);
    let coord = open(temp_dir.path());
    assert_eq!(coord.read_file("late.txt").unwrap(), b"abc".to_vec());
}

#[test]
fn test_recovered_flush_marker_lands_in_live_log() {
    let temp_dir = tempdir().unwrap();
    {
        let wal = WalWriter::open(
            temp_dir.path().join(crate::storage::LOG_FILE),
            WalConfig::synchronous(),
            false,
        )
        .unwrap();
        wal.append_all(vec![
            LogRecord::new(1, LogOperation::NewTxn { filename: "a.txt".into() }),
            LogRecord::new(1, LogOperation::Write { seq: 1, data: b"x".to_vec() }),
            LogRecord::new(
                1,
                LogOperation::Commit {
                    bound: 1,
                    commit_lsn: 1,
                    flushed: false,
                },
            ),
        ])
        .unwrap();
    }

    let coord = open(temp_dir.path());
    assert_eq!(coord.read_file("a.txt").unwrap(), b"x".to_vec());
    drop(coord);

    // whatever point a crash hits after publishing, .slatelog already says flushed
    assert!(!temp_dir.path().join(crate::storage::RECOVERY_LOG_FILE).exists());
    let live = fs::read_to_string(temp_dir.path().join(crate::storage::LOG_FILE)).unwrap();
    let flushed = live
        .lines()
        .map(|line| LogRecord::decode_line(line).unwrap())
        .filter(|r| matches!(r.op, LogOperation::Commit { flushed: true, .. }))
        .count();
    assert_eq!(flushed, 1);

    for _ in 0..2 {
        let coord = open(temp_dir.path());
        assert_eq!(coord.read_file("a.txt").unwrap(), b"x".to_vec());
        assert_eq!(coord.pending_commits(), 0);
    }
}

#[test]
fn test_records_by_lsn() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    let (t1, _) = commit_file(&coord, "a.txt", &["a"]);
    let (t2, _) = commit_file(&coord, "b.txt", &["b"]);
    let (t3, _) = commit_file(&coord, "c.txt", &["c"]);

    assert_eq!(coord.record_by_lsn(2).unwrap().id(), t2);
    assert!(coord.record_by_lsn(4).is_none());
    let ids: Vec<TxnId> = coord.records_after(1).iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec![t2, t3]);
    assert_eq!(coord.records_after(0)[0].id(), t1);
    assert!(coord.records_after(3).is_empty());
}

#[test]
fn test_apply_replicated_enforces_lsn_order() {
    let primary_dir = tempdir().unwrap();
    let backup_dir = tempdir().unwrap();
    let primary = open(primary_dir.path());
    let backup = open(backup_dir.path());

    commit_file(&primary, "a.txt", &["one"]);
    commit_file(&primary, "a.txt", &["two"]);
    commit_file(&primary, "b.txt", &["three"]);

    let rec = |lsn| primary.record_by_lsn(lsn).unwrap();

    assert_eq!(backup.apply_replicated(rec(2)).unwrap(), ApplyOutcome::Expected(1));
    assert_eq!(backup.current_lsn(), 0);
    assert_eq!(backup.apply_replicated(rec(1)).unwrap(), ApplyOutcome::Applied(1));
    assert_eq!(backup.apply_replicated(rec(1)).unwrap(), ApplyOutcome::Duplicate(1));
    assert_eq!(backup.apply_replicated(rec(3)).unwrap(), ApplyOutcome::Expected(2));
    assert_eq!(backup.apply_replicated(rec(2)).unwrap(), ApplyOutcome::Applied(2));
    assert_eq!(backup.apply_replicated(rec(3)).unwrap(), ApplyOutcome::Applied(3));

    assert_eq!(backup.read_file("a.txt").unwrap(), b"onetwo".to_vec());
    assert_eq!(backup.read_file("b.txt").unwrap(), b"three".to_vec());
    assert!(backup.snapshot(rec(3).id()).unwrap().received_backup_ack());
}

#[test]
fn test_replicated_transactions_survive_backup_restart() {
    let primary_dir = tempdir().unwrap();
    let backup_dir = tempdir().unwrap();
    let primary = open(primary_dir.path());
    commit_file(&primary, "a.txt", &["x", "y"]);
    {
        let backup = open(backup_dir.path());
        backup
            .apply_replicated(primary.record_by_lsn(1).unwrap())
            .unwrap();
    }

    let backup = open(backup_dir.path());
    assert_eq!(backup.current_lsn(), 1);
    assert_eq!(backup.read_file("a.txt").unwrap(), b"xy".to_vec());
    assert_eq!(backup.record_by_lsn(1).unwrap().committed_payload().unwrap(), b"xy".to_vec());
}

#[test]
fn test_apply_rejects_uncommitted_record() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    let rec = TransactionRecord::new(5, "a.txt");
    assert!(matches!(
        coord.apply_replicated(rec),
        Err(SlateError::Replication(_))
    ));
}

#[test]
fn test_mark_backup_ack() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    let (txn_id, _) = commit_file(&coord, "a.txt", &["x"]);
    assert!(!coord.snapshot(txn_id).unwrap().received_backup_ack());
    coord.mark_backup_ack(txn_id).unwrap();
    assert!(coord.snapshot(txn_id).unwrap().received_backup_ack());
}

#[test]
fn test_wait_flushed_times_out() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    let txn_id = coord.new_transaction("a.txt").unwrap();
    let err = coord
        .wait_flushed(txn_id, Duration::from_millis(20))
        .unwrap_err();
    assert!(matches!(err, SlateError::Timeout(_)));
}

#[test]
fn test_process_commits_on_empty_queue() {
    let temp_dir = tempdir().unwrap();
    let coord = open(temp_dir.path());
    assert_eq!(coord.process_commits().unwrap(), 0);
}
