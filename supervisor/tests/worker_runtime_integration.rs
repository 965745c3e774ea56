//! Exercises a worker's accept-lock arbitration across two independent
//! `WorkerRuntime`s sharing one `AcceptLockRegion`, through the crate's
//! public API — the same cross-process contention spec §4.D describes,
//! minus the actual `fork()`.

use supervisor::network::TestNetworkApp;
use supervisor::runtime::{RuntimeConfig, WorkerRuntime};
use supervisor::signals::SignalSet;
use supervisor_proto::{AcceptLockRegion, WorkerRecord};

fn cfg() -> RuntimeConfig {
    RuntimeConfig {
        max_connections: 100,
        http_request_limit: 200,
        nlisteners: 1,
        pool_size: 4,
        keymgr_active: false,
        reseed_interval_ms: 60_000,
    }
}

#[test]
fn only_one_of_two_contending_workers_holds_the_lock_at_a_time() {
    let lock = AcceptLockRegion::zeroed();

    let record_a = WorkerRecord::empty();
    record_a.init(1, 0);
    let mut rt_a = WorkerRuntime::new(&record_a, &lock, 111, cfg());
    let mut app_a = TestNetworkApp::default();

    let record_b = WorkerRecord::empty();
    record_b.init(2, 1);
    let mut rt_b = WorkerRuntime::new(&record_b, &lock, 222, cfg());
    let mut app_b = TestNetworkApp::default();

    rt_a.run_round_with_signals(&mut app_a, 0, SignalSet::default());
    rt_b.run_round_with_signals(&mut app_b, 0, SignalSet::default());

    assert!(rt_a.has_lock());
    assert!(!rt_b.has_lock(), "second worker must not win a held lock");
    assert!(app_a.accept_enabled);
    assert!(!app_b.accept_enabled);
}

#[test]
fn releasing_worker_lets_the_other_acquire_after_accept_available() {
    let lock = AcceptLockRegion::zeroed();

    let record_a = WorkerRecord::empty();
    record_a.init(1, 0);
    let mut rt_a = WorkerRuntime::new(&record_a, &lock, 111, cfg());
    let mut app_a = TestNetworkApp::default();

    let record_b = WorkerRecord::empty();
    record_b.init(2, 1);
    let mut rt_b = WorkerRuntime::new(&record_b, &lock, 222, cfg());
    let mut app_b = TestNetworkApp::default();

    rt_a.run_round_with_signals(&mut app_a, 0, SignalSet::default());
    rt_b.run_round_with_signals(&mut app_b, 0, SignalSet::default());
    assert!(rt_a.has_lock());

    // worker A hits its connection ceiling and releases voluntarily.
    app_a.connections = 100;
    rt_a.run_round_with_signals(&mut app_a, 1, SignalSet::default());
    assert!(!rt_a.has_lock());

    // the broadcast that release produced would normally travel over the
    // bus via the parent; here it's delivered directly to worker B.
    rt_b.on_accept_available();
    rt_b.run_round_with_signals(&mut app_b, 1, SignalSet::default());
    assert!(rt_b.has_lock());
    assert_eq!(lock.current_holder(), 222);
}
