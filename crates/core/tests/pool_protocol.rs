#![cfg(unix)]

mod common;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use capture_aligner_core::{
    align, scan, AlignOptions, CorruptionType, ExifToolPool, ExifToolProcess, PoolOptions,
    ProbeOptions, ProcessState, ToolError, ToolSession,
};

use common::{write_media_file, write_stub_tool};

fn pool_with(stub: PathBuf, pool_size: usize, checkout_timeout: Duration) -> ExifToolPool {
    ExifToolPool::new(PoolOptions {
        pool_size,
        executable: Some(stub),
        checkout_timeout,
        drain_timeout: Duration::from_secs(10),
        stop_wait: Duration::from_millis(300),
    })
    .expect("pool starts against the stub tool")
}

#[test]
fn execute_round_trips_args_through_the_sentinel_protocol() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_stub_tool(dir.path());

    let mut process = ExifToolProcess::new(stub);
    process.start().expect("stub session starts");

    let output = process
        .execute(
            &["first arg".to_string(), "second arg".to_string()],
            Duration::from_secs(5),
        )
        .expect("command round-trips");

    assert_eq!(output.stdout, "first arg\nsecond arg\n");
    assert_eq!(process.state(), ProcessState::Running);
    process.stop();
    assert_eq!(process.state(), ProcessState::Stopped);
}

#[test]
fn timeout_marks_the_session_dead_and_restart_revives_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_stub_tool(dir.path());

    let mut process = ExifToolProcess::new(stub).with_stop_wait(Duration::from_millis(200));
    process.start().expect("stub session starts");

    let error = process
        .execute(&["slow request".to_string()], Duration::from_millis(250))
        .expect_err("stalled command times out");
    assert!(matches!(error, ToolError::Timeout { .. }));
    assert_eq!(process.state(), ProcessState::Dead);

    process.restart().expect("restart after timeout");
    assert_eq!(process.state(), ProcessState::Running);
    let output = process
        .execute(&["after restart".to_string()], Duration::from_secs(5))
        .expect("session usable again");
    assert_eq!(output.stdout, "after restart\n");
    process.stop();
}

#[test]
fn pool_capacity_is_conserved_across_checkouts_and_restarts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_stub_tool(dir.path());
    let pool = pool_with(stub, 2, Duration::from_millis(300));

    assert_eq!(pool.pool_size(), 2);
    assert_eq!(pool.available_now(), 2);

    {
        let _first = pool.checkout().expect("first checkout");
        let _second = pool.checkout().expect("second checkout");
        assert_eq!(pool.available_now(), 0);
        assert_eq!(pool.checked_out_now(), 2);

        let error = pool.checkout().expect_err("pool exhausted");
        assert!(matches!(error, ToolError::PoolExhausted { .. }));
    }
    assert_eq!(pool.available_now(), 2, "guards returned on drop");

    pool.restart_pool().expect("restart with idle pool");
    pool.restart_pool().expect("second restart");
    assert_eq!(pool.restarts(), 2);
    assert_eq!(pool.available_now() + pool.checked_out_now(), pool.pool_size());

    pool.shutdown();
    assert!(matches!(pool.checkout(), Err(ToolError::PoolClosed)));
}

#[test]
fn restart_drains_outstanding_checkouts_instead_of_killing_them() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_stub_tool(dir.path());
    let pool = pool_with(stub, 2, Duration::from_millis(300));

    thread::scope(|scope| {
        let guard = pool.checkout().expect("checkout before restart");

        let restarter = scope.spawn(|| pool.restart_pool());

        // Give the restart time to enter its draining phase, then observe
        // that new checkouts are refused rather than queued.
        thread::sleep(Duration::from_millis(200));
        let error = pool.checkout().expect_err("checkout refused while draining");
        assert!(matches!(error, ToolError::PoolDraining));

        drop(guard);
        restarter
            .join()
            .expect("restart thread")
            .expect("restart completes once the checkout returns");
    });

    assert_eq!(pool.restarts(), 1);
    assert_eq!(pool.available_now(), 2);
}

#[test]
fn restart_fails_rather_than_killing_a_session_that_never_returns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_stub_tool(dir.path());
    let pool = ExifToolPool::new(PoolOptions {
        pool_size: 2,
        executable: Some(stub),
        checkout_timeout: Duration::from_millis(300),
        drain_timeout: Duration::from_millis(300),
        stop_wait: Duration::from_millis(300),
    })
    .expect("pool starts");

    let held = pool.checkout().expect("held checkout");
    let error = pool.restart_pool().expect_err("drain deadline expires");
    assert!(matches!(error, ToolError::Timeout { .. }));
    assert_eq!(pool.restarts(), 0);

    drop(held);
    assert_eq!(pool.available_now(), 2, "capacity intact after failed restart");
    pool.restart_pool().expect("restart once the session is back");
}

#[test]
fn batch_dispatch_preserves_input_order_across_workers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_stub_tool(dir.path());
    let pool = pool_with(stub, 2, Duration::from_secs(10));

    let paths: Vec<PathBuf> = (0..6)
        .map(|index| PathBuf::from(format!("/photos/IMG_{index:04}.jpg")))
        .collect();

    // One worker per path, six workers racing for two sessions.
    let results = pool.dispatch_chunks(&paths, 1, |session, chunk, out| {
        let output = session
            .execute(&[chunk[0].display().to_string()], Duration::from_secs(5))
            .expect("echo command");
        out[0] = Some(output.stdout.trim().to_string());
    });

    let flattened: Vec<String> = results.into_iter().map(|slot| slot.expect("slot filled")).collect();
    let expected: Vec<String> = paths.iter().map(|path| path.display().to_string()).collect();
    assert_eq!(flattened, expected);
}

#[test]
fn scan_classifies_staged_corruption_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_stub_tool(dir.path());
    let pool = pool_with(stub, 2, Duration::from_secs(10));

    let healthy = write_media_file(dir.path(), "healthy.jpg");
    let unreadable = write_media_file(dir.path(), "unreadable.jpg");
    let maker_notes = write_media_file(dir.path(), "makernotes.jpg");
    let paths = vec![healthy.clone(), unreadable.clone(), maker_notes.clone()];

    let records = scan(&pool, &paths, &ProbeOptions::default());
    pool.shutdown();

    let healthy_record = &records[&healthy];
    assert_eq!(healthy_record.corruption_type, CorruptionType::Healthy);
    assert!(healthy_record.is_repairable);
    assert_eq!(healthy_record.estimated_success_rate, 1.0);

    let unreadable_record = &records[&unreadable];
    assert_eq!(
        unreadable_record.corruption_type,
        CorruptionType::SevereCorruption
    );
    assert!(!unreadable_record.is_repairable);
    assert_eq!(unreadable_record.estimated_success_rate, 0.1);

    let maker_record = &records[&maker_notes];
    assert_eq!(maker_record.corruption_type, CorruptionType::MakerNotes);
    assert!(maker_record.is_repairable);
    assert_eq!(maker_record.estimated_success_rate, 0.9);

    // Probes left no mutation or backup debris behind.
    assert_eq!(
        std::fs::read(&healthy).expect("read"),
        b"image bytes of healthy.jpg"
    );
    assert!(!dir.path().join("healthy_backup.jpg").exists());
}

#[test]
fn align_restarts_the_pool_at_each_group_boundary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_stub_tool(dir.path());
    let pool = pool_with(stub, 2, Duration::from_secs(10));

    let paths: Vec<PathBuf> = (0..7)
        .map(|index| write_media_file(dir.path(), &format!("IMG_{index:04}.jpg")))
        .collect();

    let options = AlignOptions {
        offset_seconds: 3_600,
        group_size: 3,
        chunk_size: 2,
        backup_dir: dir.path().join("backups"),
        ..AlignOptions::default()
    };
    let report = align(&pool, &paths, &options);
    pool.shutdown();

    // 7 files in groups of 3: restarts before group two and group three.
    assert_eq!(report.pool_restarts, 2);
    assert_eq!(pool.restarts(), 2);
    assert_eq!(report.scanned_files, 7);
    assert_eq!(report.healthy_files, 7);
    assert_eq!(report.updated_files, 7);
    assert_eq!(report.write_failures, 0);
    assert!(report.warnings.is_empty());
}
