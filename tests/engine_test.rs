use std::sync::Arc;
use std::thread;
use std::time::Duration;

use granite::config::EngineConfig;
use granite::page::DataPage;
use granite::wal::{LogManager, LogRecordKind};
use granite::{Engine, LockMode, PageId, Rid};
use serial_test::serial;
use tempfile::tempdir;

fn engine_at(dir: &std::path::Path) -> Engine {
    let config = EngineConfig {
        buffer_pool_pages: 32,
        log_filename: dir.join("engine.log").display().to_string(),
        log_buffer_mb: 1,
    };
    Engine::start(config).unwrap()
}

#[test]
fn inserts_fill_pages_in_order_and_track_free_slots() {
    let dir = tempdir().unwrap();
    let engine = engine_at(dir.path());
    let table = engine.create_table(dir.path().join("numbers"), 8).unwrap();

    let capacity = DataPage::capacity(8) as usize;
    assert!(capacity < 1000);

    let mut rids = Vec::new();
    for n in 0..1000u64 {
        let rid = table.insert(&n.to_le_bytes());
        assert!(rid.is_valid());
        rids.push(rid);
    }

    // The first `capacity` records land on page 0, the rest on page 1.
    for (n, rid) in rids.iter().enumerate() {
        let expected_page = (n / capacity) as u16;
        assert_eq!(rid.page_id().page_num(), expected_page, "record {n}");
    }

    // Directory accounting: page 0 is full, page 1 holds the remainder.
    let file = table.paged_file();
    let data_file_id = file.data_file().id();
    let page0 = file.dir_entry(PageId::new(data_file_id, 0)).unwrap();
    assert_eq!(page0.free_slots, 0);
    let page1 = file.dir_entry(PageId::new(data_file_id, 1)).unwrap();
    assert_eq!(page1.free_slots, (capacity - (1000 - capacity)) as u16);

    // Every record reads back.
    for (n, rid) in rids.iter().enumerate() {
        let mut out = [0u8; 8];
        assert!(table.read(*rid, &mut out));
        assert_eq!(u64::from_le_bytes(out), n as u64);
    }
}

#[test]
fn deleted_records_free_their_slots_for_reuse() {
    let dir = tempdir().unwrap();
    let engine = engine_at(dir.path());
    let table = engine.create_table(dir.path().join("churn"), 8).unwrap();

    let rid = table.insert(b"churn-00");
    assert!(table.delete(rid));

    let mut out = [0u8; 8];
    assert!(!table.read(rid, &mut out));

    // The freed slot is handed out again.
    let reused = table.insert(b"churn-01");
    assert_eq!(reused, rid);
    assert!(table.read(reused, &mut out));
    assert_eq!(&out, b"churn-01");
}

#[test]
#[serial]
fn younger_exclusive_requester_aborts_itself() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_at(dir.path()));

    let older = engine.begin();
    let younger = engine.begin();
    assert!(older.timestamp() < younger.timestamp());

    let rid = Rid::new(PageId::new(1, 0), 3);
    assert!(engine
        .lock_manager()
        .acquire_lock(&older, rid, LockMode::XL, false));

    let handle = {
        let engine = Arc::clone(&engine);
        let younger = Arc::clone(&younger);
        thread::spawn(move || {
            engine
                .lock_manager()
                .acquire_lock(&younger, rid, LockMode::XL, false)
        })
    };

    assert!(!handle.join().unwrap());
    assert!(younger.is_aborted());
    assert!(!engine.transactions().is_active(&younger));

    // The older holder is unaffected and commits cleanly.
    assert!(older.is_in_progress());
    assert!(engine.commit(&older));
}

#[test]
#[serial]
fn conflicting_exclusive_locks_never_overlap() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_at(dir.path()));
    let rid = Rid::new(PageId::new(2, 0), 1);

    // The younger transaction takes the lock first; the older one must
    // wait (not die) and win it after the release.
    let older_waiter = engine.begin();
    let younger_holder = engine.begin();
    assert!(older_waiter.timestamp() < younger_holder.timestamp());

    assert!(engine
        .lock_manager()
        .acquire_lock(&younger_holder, rid, LockMode::XL, false));

    let handle = {
        let engine = Arc::clone(&engine);
        let older_waiter = Arc::clone(&older_waiter);
        thread::spawn(move || {
            let granted = engine
                .lock_manager()
                .acquire_lock(&older_waiter, rid, LockMode::XL, false);
            (granted, older_waiter.held_locks())
        })
    };

    thread::sleep(Duration::from_millis(50));
    // While the holder still owns the lock the waiter holds nothing.
    assert_eq!(older_waiter.held_locks(), Vec::<Rid>::new());
    assert!(engine.lock_manager().release_lock(&younger_holder, rid));

    let (granted, held) = handle.join().unwrap();
    assert!(granted);
    assert_eq!(held, vec![rid]);
}

#[test]
fn commit_makes_the_commit_record_durable_before_the_end_record() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("engine.log");
    let engine = engine_at(dir.path());
    let table = engine.create_table(dir.path().join("wal_rows"), 8).unwrap();

    let tx = engine.begin();
    let rid = table.insert(b"txn-data");
    assert!(rid.is_valid());
    assert!(engine.commit(&tx));

    // Inspect the on-disk log as a crash would see it: the insert and the
    // commit are durable, the end record is still buffered.
    let image = std::fs::read(&log_path).unwrap();
    let records = LogManager::decode_all(&image);
    let kinds: Vec<LogRecordKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![LogRecordKind::Insert, LogRecordKind::Commit]);
    assert_eq!(records[0].id, rid.value());
    assert_eq!(records[0].payload, b"txn-data");
    assert_eq!(records[1].id, tx.timestamp());

    // After another flush the end record follows the commit record.
    assert!(engine.log().flush());
    let image = std::fs::read(&log_path).unwrap();
    let records = LogManager::decode_all(&image);
    let kinds: Vec<LogRecordKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            LogRecordKind::Insert,
            LogRecordKind::Commit,
            LogRecordKind::End
        ]
    );
}

#[test]
fn abort_leaves_the_insert_logged_but_uncommitted() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("engine.log");
    let engine = engine_at(dir.path());
    let table = engine.create_table(dir.path().join("aborted"), 8).unwrap();

    let tx = engine.begin();
    let ts = tx.timestamp();
    let rid = table.insert(b"doomed!!");
    assert!(rid.is_valid());
    assert_eq!(engine.abort(&tx), ts);

    assert!(engine.log().flush());
    let image = std::fs::read(&log_path).unwrap();
    let records = LogManager::decode_all(&image);
    let kinds: Vec<LogRecordKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            LogRecordKind::Insert,
            LogRecordKind::Abort,
            LogRecordKind::End
        ]
    );
    assert!(!kinds.contains(&LogRecordKind::Commit));
    assert_eq!(records[1].id, ts);
}

#[test]
fn log_replay_matches_append_order_across_table_operations() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("engine.log");
    let engine = engine_at(dir.path());
    let table = engine.create_table(dir.path().join("mix"), 8).unwrap();

    let r0 = table.insert(b"record-a");
    let r1 = table.insert(b"record-b");
    assert!(table.update(r0, b"record-c"));
    assert!(table.delete(r1));
    assert!(engine.log().flush());

    let image = std::fs::read(&log_path).unwrap();
    let records = LogManager::decode_all(&image);
    let summary: Vec<(LogRecordKind, u64)> = records.iter().map(|r| (r.kind, r.id)).collect();
    assert_eq!(
        summary,
        vec![
            (LogRecordKind::Insert, r0.value()),
            (LogRecordKind::Insert, r1.value()),
            (LogRecordKind::Update, r0.value()),
            (LogRecordKind::Delete, r1.value()),
        ]
    );

    // Trailing LSNs equal each record's byte offset, so a replay walks the
    // exact append order.
    let mut offset = 0u64;
    for record in &records {
        assert_eq!(record.lsn, offset);
        offset += (granite::wal::LOG_RECORD_HEADER_SIZE + record.payload.len() + 8) as u64;
    }
    assert_eq!(offset, image.len() as u64);
}

#[test]
fn engine_teardown_flushes_dirty_pages() {
    let dir = tempdir().unwrap();
    let table_path = dir.path().join("durable");

    let rid;
    {
        let engine = engine_at(dir.path());
        let table = engine.create_table(&table_path, 8).unwrap();
        rid = table.insert(b"survives");
        assert!(rid.is_valid());
        // Engine drop flushes the pool and the log.
    }

    let data = std::fs::read(&table_path).unwrap();
    assert!(data
        .windows(8)
        .any(|window| window == b"survives"));
}
