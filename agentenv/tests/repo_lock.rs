//! Repository locks contended from several threads, each with its own manager
//! and lock file handle, the way separate agent processes would.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use agentenv::cancel::CancelToken;
use agentenv::error::EnvError;
use agentenv::io::repo_lock::{LockDomain, RepositoryLockManager, RepositoryLocks};

const POLL: Duration = Duration::from_millis(5);

fn manager(locks: &Path, repo: &Path) -> RepositoryLockManager {
    RepositoryLocks::new(locks, POLL)
        .for_repo(repo)
        .expect("lock manager")
}

#[test]
fn exclusive_lock_serializes_holders() {
    let temp = tempfile::tempdir().expect("tempdir");
    let locks = temp.path().join("locks");
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mgr = manager(&locks, temp.path());
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            thread::spawn(move || {
                let cancel = CancelToken::with_timeout(Duration::from_secs(10));
                mgr.with_lock(LockDomain::Notes, &cancel, || {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, EnvError>(())
                })
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread").expect("locked section");
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn domains_do_not_block_each_other() {
    let temp = tempfile::tempdir().expect("tempdir");
    let locks = temp.path().join("locks");
    let holder = manager(&locks, temp.path());
    let other = manager(&locks, temp.path());

    let _notes = holder
        .lock(LockDomain::Notes, &CancelToken::new())
        .expect("notes lock");

    let started = Instant::now();
    let worktree = other
        .lock(
            LockDomain::Worktree,
            &CancelToken::with_timeout(Duration::from_millis(200)),
        )
        .expect("worktree lock is independent");
    assert_eq!(worktree.domain(), LockDomain::Worktree);
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn different_repositories_do_not_block_each_other() {
    let temp = tempfile::tempdir().expect("tempdir");
    let locks = temp.path().join("locks");
    let first = temp.path().join("first");
    let second = temp.path().join("second");
    std::fs::create_dir_all(&first).expect("mkdir");
    std::fs::create_dir_all(&second).expect("mkdir");

    let _held = manager(&locks, &first)
        .lock(LockDomain::Repo, &CancelToken::new())
        .expect("first repo");
    manager(&locks, &second)
        .lock(
            LockDomain::Repo,
            &CancelToken::with_timeout(Duration::from_millis(200)),
        )
        .expect("second repo");
}

#[test]
fn readers_share_and_writer_waits() {
    let temp = tempfile::tempdir().expect("tempdir");
    let locks = temp.path().join("locks");
    let readers = 3;
    let barrier = Arc::new(Barrier::new(readers + 1));
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(parking_lot::Mutex::new(release_rx));

    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let mgr = manager(&locks, temp.path());
            let barrier = Arc::clone(&barrier);
            let release_rx = Arc::clone(&release_rx);
            thread::spawn(move || {
                let cancel = CancelToken::with_timeout(Duration::from_secs(5));
                let guard = mgr.rlock(LockDomain::Worktree, &cancel).expect("read lock");
                // Every reader holds its lock at once before any is released.
                barrier.wait();
                release_rx.lock().recv().expect("release signal");
                drop(guard);
            })
        })
        .collect();
    barrier.wait();

    let writer = manager(&locks, temp.path());
    let blocked = writer.lock(
        LockDomain::Worktree,
        &CancelToken::with_timeout(Duration::from_millis(50)),
    );
    assert!(matches!(blocked, Err(EnvError::LockTimeout { .. })));

    for _ in 0..readers {
        release_tx.send(()).expect("send");
    }
    for handle in handles {
        handle.join().expect("reader");
    }
    writer
        .lock(
            LockDomain::Worktree,
            &CancelToken::with_timeout(Duration::from_secs(2)),
        )
        .expect("write lock after readers");
}

#[test]
fn waiting_writer_acquires_after_release() {
    let temp = tempfile::tempdir().expect("tempdir");
    let locks = temp.path().join("locks");
    let holder = manager(&locks, temp.path());
    let waiter = manager(&locks, temp.path());

    let guard = holder
        .lock(LockDomain::Repo, &CancelToken::new())
        .expect("first");
    let handle = thread::spawn(move || {
        let started = Instant::now();
        waiter
            .lock(
                LockDomain::Repo,
                &CancelToken::with_timeout(Duration::from_secs(5)),
            )
            .map(|_| started.elapsed())
    });
    thread::sleep(Duration::from_millis(50));
    drop(guard);

    let waited = handle.join().expect("thread").expect("acquired");
    assert!(waited >= Duration::from_millis(40));
}

#[test]
fn cancelled_wait_reports_lock_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let locks = temp.path().join("locks");
    let holder = manager(&locks, temp.path());
    let waiter = manager(&locks, temp.path());
    let _guard = holder
        .lock(LockDomain::Notes, &CancelToken::new())
        .expect("first");

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = waiter
        .lock(LockDomain::Notes, &cancel)
        .expect_err("cancelled");
    assert!(err.is_cancellation());
    assert!(err.to_string().contains("notes lock"));
}

#[test]
fn closure_error_is_returned_and_lock_released() {
    let temp = tempfile::tempdir().expect("tempdir");
    let locks = temp.path().join("locks");
    let mgr = manager(&locks, temp.path());

    let result: anyhow::Result<()> =
        mgr.with_lock(LockDomain::Notes, &CancelToken::new(), || {
            anyhow::bail!("save failed")
        });
    assert_eq!(
        result.expect_err("closure error").to_string(),
        "save failed"
    );

    let value = mgr
        .with_rlock(
            LockDomain::Notes,
            &CancelToken::with_timeout(Duration::from_millis(200)),
            || Ok::<_, EnvError>(7),
        )
        .expect("lock released after error");
    assert_eq!(value, 7);
}
