//! Concurrent stress test for the state pool.
//!
//! Many threads doing get/put cycles against a small bounded pool must never
//! exceed capacity, lose a state, or leave the counters inconsistent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use lspool::{Config, Context, Error, Manager, Status};

const THREADS: usize = 16;
const ITERATIONS: usize = 100;
const MAX_NUM: usize = 4;

#[test]
fn stress_get_put_respects_capacity() {
    let config = Config::new(MAX_NUM as i64, 2, 0, 120, "1h").unwrap();
    let pm = Manager::new(&Context::background(), config, None).unwrap();
    let successes = Arc::new(AtomicU64::new(0));
    let full = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pm = pm.clone();
            let successes = Arc::clone(&successes);
            let full = Arc::clone(&full);
            thread::spawn(move || {
                let ctx = Context::new(format!("stress-{t}"));
                for i in 0..ITERATIONS {
                    match pm.get(&ctx) {
                        Ok(ls) => {
                            assert!(pm.len() <= MAX_NUM);
                            let n: i64 = ls
                                .lua()
                                .unwrap()
                                .load(format!("return {i} + 1"))
                                .eval()
                                .unwrap();
                            assert_eq!(n, i as i64 + 1);
                            pm.put(ls).unwrap();
                            successes.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(Error::PoolFull { max_num }) => {
                            assert_eq!(max_num, MAX_NUM);
                            full.fetch_add(1, Ordering::Relaxed);
                            thread::yield_now();
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let stats = pm.stats();
    assert_eq!(stats.serving, 0);
    assert!(stats.length <= MAX_NUM);
    assert_eq!(stats.idle, stats.length);
    assert_eq!(stats.total_requested, successes.load(Ordering::Relaxed));
    assert_eq!(
        successes.load(Ordering::Relaxed) + full.load(Ordering::Relaxed),
        (THREADS * ITERATIONS) as u64
    );
}

#[test]
fn stress_with_request_budget_keeps_counters_consistent() {
    let config = Config::new(MAX_NUM as i64, 1, 3, 120, "1h").unwrap();
    let pm = Manager::new(&Context::background(), config, None).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pm = pm.clone();
            thread::spawn(move || {
                let ctx = Context::new(format!("budget-{t}"));
                for _ in 0..ITERATIONS {
                    match pm.get(&ctx) {
                        Ok(ls) => pm.put(ls).unwrap(),
                        Err(Error::PoolFull { .. }) => thread::yield_now(),
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let stats = pm.stats();
    assert_eq!(stats.serving, 0);
    assert_eq!(stats.idle, stats.length);
    assert!(stats.length <= MAX_NUM);
}

#[test]
fn shutdown_waits_for_concurrent_holders() {
    let config = Config::new(8, 1, 0, 120, "1h").unwrap();
    let pm = Manager::new(&Context::background(), config, None).unwrap();

    let held: Vec<_> = (0..4).map(|_| pm.get(&Context::new("holder")).unwrap()).collect();

    let returners: Vec<_> = held
        .into_iter()
        .enumerate()
        .map(|(i, ls)| {
            let pm = pm.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20 * (i as u64 + 1)));
                // Returning during shutdown closes the state.
                let _ = pm.put(ls);
            })
        })
        .collect();

    pm.shutdown();
    assert_eq!(pm.serving_num(), 0);
    assert_eq!(pm.len(), 0);

    for handle in returners {
        handle.join().unwrap();
    }
}

/// Run `f` on a thread and fail if it does not finish within `secs`.
fn finishes_within(secs: u64, f: impl FnOnce() + Send + 'static) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        f();
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(secs))
        .expect("lifecycle operations deadlocked");
    handle.join().expect("worker panicked");
}

#[test]
fn concurrent_restarts_with_traffic_complete() {
    finishes_within(30, || {
        let config = Config::new(MAX_NUM as i64, 2, 0, 120, "1h").unwrap();
        let pm = Manager::new(&Context::background(), config, None).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let pm = pm.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let ctx = Context::new("traffic");
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(ls) = pm.get(&ctx) {
                        // rejected returns during a drain are expected
                        let _ = pm.put(ls);
                    }
                    thread::yield_now();
                }
            })
        };

        let restarters: Vec<_> = (0..2)
            .map(|_| {
                let pm = pm.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        pm.restart(&Context::background()).unwrap();
                    }
                })
            })
            .collect();
        for handle in restarters {
            handle.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();

        let stats = pm.stats();
        assert_eq!(stats.status, Status::Running);
        assert_eq!(stats.serving, 0);
        assert_eq!(stats.idle, stats.length);
        assert_eq!(stats.length, 2);
    });
}

#[test]
fn terminate_wins_over_concurrent_restart() {
    finishes_within(30, || {
        let pm = Manager::with_defaults(&Context::background(), None).unwrap();

        let restarter = {
            let pm = pm.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    match pm.restart(&Context::background()) {
                        Ok(()) => {}
                        Err(Error::Dead) => return,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        };

        thread::sleep(Duration::from_millis(5));
        pm.terminate();
        restarter.join().unwrap();

        assert_eq!(pm.status(), Status::Dead);
        assert_eq!(pm.len(), 0);
        assert!(matches!(pm.get(&Context::new("late")), Err(Error::Dead)));
    });
}
