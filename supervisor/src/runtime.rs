//! Worker runtime (component D): the per-process main loop, spec §4.D.
//!
//! Drives a `NetworkWorkerApp` collaborator through the 12-step round and
//! the accept-lock acquire/release policy. One `WorkerRuntime` per process;
//! it owns no shared memory directly, only references into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use supervisor_proto::{AcceptLockRegion, WorkerRecord, WORKER_SOLO_COUNT};

use crate::network::NetworkWorkerApp;
use crate::signals::{self, SignalSet};

/// Millisecond clamp values from spec §4.D step 4.
const NETWAIT_SIGNAL_PENDING_MS: u64 = 10;
const NETWAIT_HTTP_INFLIGHT_MS: u64 = 100;
const NETWAIT_TASK_RUNNABLE_MS: u64 = 10;
/// Spec §4.D step 11: "at most every 500 ms".
const IDLE_SWEEP_INTERVAL_MS: u64 = 500;

pub struct RuntimeConfig {
    pub max_connections: u32,
    pub http_request_limit: u32,
    pub nlisteners: usize,
    pub pool_size: usize,
    pub keymgr_active: bool,
    pub reseed_interval_ms: u64,
}

impl RuntimeConfig {
    /// Spec glossary "solo threshold" and §4.D "declines to attempt
    /// acquisition ... there are no listeners ... pool size is at or below
    /// the solo threshold".
    pub fn no_arbitration(&self) -> bool {
        self.nlisteners == 0 || self.pool_size <= WORKER_SOLO_COUNT
    }
}

/// Outbound bus traffic a round wants to send, surfaced so the caller (which
/// owns the actual control channel) can deliver it. Keeping send off this
/// struct keeps `run_round` pure and unit-testable without a real socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    EntropyRequest,
    AcceptAvailableBroadcast,
}

pub struct WorkerRuntime<'a> {
    record: &'a WorkerRecord,
    lock: &'a AcceptLockRegion,
    pid: i32,
    cfg: RuntimeConfig,
    accept_avail: AtomicBool,
    last_seed_ms: u64,
    last_sweep_ms: u64,
    quit: bool,
}

impl<'a> WorkerRuntime<'a> {
    pub fn new(record: &'a WorkerRecord, lock: &'a AcceptLockRegion, pid: i32, cfg: RuntimeConfig) -> Self {
        if cfg.no_arbitration() {
            // "has_lock is effectively always true" (spec §4.D); never
            // released, per SPEC_FULL open question (2).
            record.set_has_lock(true);
        }
        Self {
            record,
            lock,
            pid,
            cfg,
            accept_avail: AtomicBool::new(true),
            last_seed_ms: 0,
            last_sweep_ms: 0,
            quit: false,
        }
    }

    pub fn has_lock(&self) -> bool {
        self.record.has_lock()
    }

    /// Called when an `ACCEPT_AVAILABLE` broadcast arrives over the control
    /// channel (spec §4.D "Receiving ACCEPT_AVAILABLE").
    pub fn on_accept_available(&self) {
        self.accept_avail.store(true, Ordering::Relaxed);
    }

    fn acquire_declined(&self, app: &dyn NetworkWorkerApp) -> bool {
        self.cfg.no_arbitration()
            || app.active_connections() >= self.cfg.max_connections
            || app.in_flight_requests() >= self.cfg.http_request_limit
    }

    fn release_due(&self, app: &dyn NetworkWorkerApp) -> bool {
        app.active_connections() >= self.cfg.max_connections
            || app.in_flight_requests() >= self.cfg.http_request_limit
    }

    fn compute_netwait(&self, signals_pending: bool, app: &dyn NetworkWorkerApp) -> Option<u64> {
        let mut wait = app.next_timer_ms();
        let mut clamp = |ms: u64| {
            wait = Some(wait.map_or(ms, |w| w.min(ms)));
        };
        if signals_pending {
            clamp(NETWAIT_SIGNAL_PENDING_MS);
        }
        if app.in_flight_requests() > 0 {
            clamp(NETWAIT_HTTP_INFLIGHT_MS);
        }
        if app.has_runnable_task() {
            clamp(NETWAIT_TASK_RUNNABLE_MS);
        }
        wait
    }

    /// Upstream `make_busy()` hook: voluntarily release before a long
    /// operation (spec §4.D "Accept-lock release policy").
    pub fn make_busy(&self, app: &mut dyn NetworkWorkerApp) -> Option<Outbound> {
        if self.cfg.no_arbitration() || !self.has_lock() {
            return None;
        }
        self.release(app)
    }

    fn release(&self, app: &mut dyn NetworkWorkerApp) -> Option<Outbound> {
        if let Err(e) = self.lock.release(self.pid) {
            log::warn!(target: "worker::runtime", "lock release soft error: {e}");
        }
        self.record.set_has_lock(false);
        if app.accept_enabled() {
            app.disable_accept();
        }
        Some(Outbound::AcceptAvailableBroadcast)
    }

    /// Run exactly one round of the §4.D loop using the real process-wide
    /// signal flag (spec §6: the worker handles the same signal set the
    /// supervisor does).
    pub fn run_round(&mut self, app: &mut dyn NetworkWorkerApp, now_ms: u64) -> (Vec<Outbound>, bool) {
        let signals = signals::drain();
        self.run_round_with_signals(app, now_ms, signals)
    }

    /// Same round, but with the pending signal set supplied by the caller
    /// instead of read from the process-wide flag — this is what lets unit
    /// tests exercise step 8 deterministically without racing the global
    /// signal flag against other tests in the same process.
    pub fn run_round_with_signals(
        &mut self,
        app: &mut dyn NetworkWorkerApp,
        now_ms: u64,
        signals: SignalSet,
    ) -> (Vec<Outbound>, bool) {
        let mut outbound = Vec::new();

        // Step 2: periodic entropy request.
        if self.cfg.keymgr_active && now_ms.saturating_sub(self.last_seed_ms) >= self.cfg.reseed_interval_ms {
            outbound.push(Outbound::EntropyRequest);
            self.last_seed_ms = now_ms;
        }

        // Step 3: attempt acquisition if eligible.
        if !self.has_lock() && self.accept_avail.load(Ordering::Relaxed) && !self.acquire_declined(app) {
            if self.lock.try_acquire(self.pid) {
                self.record.set_has_lock(true);
                self.accept_avail.store(false, Ordering::Relaxed);
                if !app.accept_enabled() {
                    app.enable_accept();
                }
            }
        }

        // Step 4-5: compute netwait and poll for events.
        let netwait = self.compute_netwait(!signals.is_empty(), app);
        app.poll_events(netwait);

        // Step 6: evaluate release conditions.
        if self.has_lock() && !self.cfg.no_arbitration() && self.release_due(app) {
            if let Some(o) = self.release(app) {
                outbound.push(o);
            }
        }

        // Step 7: disable accept if we no longer hold the lock but had it
        // enabled (covers the release-elsewhere/force-release case).
        if !self.has_lock() && app.accept_enabled() {
            app.disable_accept();
        }

        // Step 8: drain signals (already drained by the caller into
        // `signals`; SIGCHLD reaping of worker-owned sub-processes is the
        // caller's responsibility since it owns the process table).
        if signals.hup() {
            app.reload_modules();
        }
        if signals.wants_quit() {
            self.quit = true;
        }

        // Step 9.
        if self.quit {
            return (outbound, false);
        }

        // Steps 10-12.
        app.run_pending_work();
        if now_ms.saturating_sub(self.last_sweep_ms) >= IDLE_SWEEP_INTERVAL_MS {
            app.sweep_idle_connections();
            self.last_sweep_ms = now_ms;
        }
        app.prune_disconnected();

        (outbound, true)
    }

    /// Drive the loop to completion using the real wall clock, polling an
    /// app until a quit signal is drained. `deliver` is called once per
    /// round with any outbound bus traffic that round produced.
    pub fn run(&mut self, app: &mut dyn NetworkWorkerApp, mut deliver: impl FnMut(Outbound)) {
        let start = Instant::now();
        loop {
            let now_ms = Instant::now().duration_since(start).as_millis() as u64;
            let (outbound, keep_going) = self.run_round(app, now_ms);
            for o in outbound {
                deliver(o);
            }
            if !keep_going {
                break;
            }
        }
        app.teardown();
    }
}

/// Milliseconds since an arbitrary process-local epoch, used only to clamp
/// idle-sweep and reseed intervals. Never compared across processes.
pub fn monotonic_ms(epoch: Instant) -> u64 {
    Instant::now().duration_since(epoch).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TestNetworkApp;
    use supervisor_proto::{AcceptLockRegion, WorkerRecord};

    fn cfg(pool_size: usize, nlisteners: usize) -> RuntimeConfig {
        RuntimeConfig {
            max_connections: 10,
            http_request_limit: 20,
            nlisteners,
            pool_size,
            keymgr_active: false,
            reseed_interval_ms: 60_000,
        }
    }

    #[test]
    fn solo_pool_always_reports_has_lock_without_cas() {
        let record = WorkerRecord::empty();
        record.init(1, 0);
        let lock = AcceptLockRegion::zeroed();
        let rt = WorkerRuntime::new(&record, &lock, 100, cfg(2, 1));
        assert!(rt.has_lock());
        assert!(!lock.is_held(), "solo worker never touches the shared CAS");
    }

    #[test]
    fn no_listeners_also_skips_arbitration() {
        let record = WorkerRecord::empty();
        record.init(1, 0);
        let lock = AcceptLockRegion::zeroed();
        let rt = WorkerRuntime::new(&record, &lock, 100, cfg(8, 0));
        assert!(rt.has_lock());
    }

    #[test]
    fn acquires_lock_and_enables_accept_when_eligible() {
        let record = WorkerRecord::empty();
        record.init(1, 0);
        let lock = AcceptLockRegion::zeroed();
        let mut rt = WorkerRuntime::new(&record, &lock, 100, cfg(4, 1));
        let mut app = TestNetworkApp::default();

        assert!(!rt.has_lock());
        let (_out, keep_going) = rt.run_round_with_signals(&mut app, 0, SignalSet::default());
        assert!(keep_going);
        assert!(rt.has_lock());
        assert!(app.accept_enabled);
        assert_eq!(lock.current_holder(), 100);
    }

    #[test]
    fn releases_and_broadcasts_when_max_connections_reached() {
        let record = WorkerRecord::empty();
        record.init(1, 0);
        let lock = AcceptLockRegion::zeroed();
        let mut rt = WorkerRuntime::new(&record, &lock, 100, cfg(4, 1));
        let mut app = TestNetworkApp::default();
        rt.run_round_with_signals(&mut app, 0, SignalSet::default());
        assert!(rt.has_lock());

        app.connections = 10; // == max_connections
        let (outbound, _) = rt.run_round_with_signals(&mut app, 1, SignalSet::default());
        assert!(!rt.has_lock());
        assert!(!app.accept_enabled);
        assert!(outbound.contains(&Outbound::AcceptAvailableBroadcast));
        assert!(!lock.is_held());
    }

    #[test]
    fn make_busy_releases_voluntarily() {
        let record = WorkerRecord::empty();
        record.init(1, 0);
        let lock = AcceptLockRegion::zeroed();
        let mut rt = WorkerRuntime::new(&record, &lock, 100, cfg(4, 1));
        let mut app = TestNetworkApp::default();
        rt.run_round_with_signals(&mut app, 0, SignalSet::default());
        assert!(rt.has_lock());

        let outbound = rt.make_busy(&mut app);
        assert_eq!(outbound, Some(Outbound::AcceptAvailableBroadcast));
        assert!(!rt.has_lock());
    }

    #[test]
    fn accept_available_lets_a_declined_worker_try_again() {
        let record = WorkerRecord::empty();
        record.init(2, 1);
        let lock = AcceptLockRegion::zeroed();
        lock.try_acquire(999); // someone else holds it
        let mut rt = WorkerRuntime::new(&record, &lock, 100, cfg(4, 1));
        let mut app = TestNetworkApp::default();

        rt.run_round_with_signals(&mut app, 0, SignalSet::default());
        assert!(!rt.has_lock(), "lock already held elsewhere");

        lock.force_release();
        rt.on_accept_available();
        rt.run_round_with_signals(&mut app, 1, SignalSet::default());
        assert!(rt.has_lock());
    }

    #[test]
    fn entropy_request_fires_once_per_reseed_interval() {
        let record = WorkerRecord::empty();
        record.init(1, 0);
        let lock = AcceptLockRegion::zeroed();
        let mut rt_cfg = cfg(4, 1);
        rt_cfg.keymgr_active = true;
        rt_cfg.reseed_interval_ms = 1000;
        let mut rt = WorkerRuntime::new(&record, &lock, 100, rt_cfg);
        let mut app = TestNetworkApp::default();

        let (out0, _) = rt.run_round_with_signals(&mut app, 0, SignalSet::default());
        assert!(!out0.contains(&Outbound::EntropyRequest));
        let (out1, _) = rt.run_round_with_signals(&mut app, 500, SignalSet::default());
        assert!(!out1.contains(&Outbound::EntropyRequest));
        let (out2, _) = rt.run_round_with_signals(&mut app, 1000, SignalSet::default());
        assert!(out2.contains(&Outbound::EntropyRequest));
        let (out3, _) = rt.run_round_with_signals(&mut app, 1500, SignalSet::default());
        assert!(!out3.contains(&Outbound::EntropyRequest));
        let (out4, _) = rt.run_round_with_signals(&mut app, 2000, SignalSet::default());
        assert!(out4.contains(&Outbound::EntropyRequest));
    }

    #[test]
    fn quit_signal_stops_the_round_loop() {
        let record = WorkerRecord::empty();
        record.init(1, 0);
        let lock = AcceptLockRegion::zeroed();
        let mut rt = WorkerRuntime::new(&record, &lock, 100, cfg(4, 1));
        let mut app = TestNetworkApp::default();

        let (_out, keep_going) = rt.run_round_with_signals(&mut app, 0, SignalSet::term_only());
        assert!(!keep_going);
    }
}
