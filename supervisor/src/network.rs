//! `NetworkWorkerApp`: the external collaborator spec.md names only by
//! interface — the HTTP pipeline, TLS handshake code, and connection table
//! (spec §1 "Out of scope"). The worker runtime in `runtime.rs` drives this
//! trait's hooks exactly where spec.md's 12-step round describes them
//! (SPEC_FULL.md §4.D.1); this crate ships a minimal in-memory test double
//! so the round can be exercised without a real listener.

/// What the worker round needs from the network/HTTP subsystem each
/// iteration. A real implementation would own the listener, the connection
/// table, and the HTTP pipeline; none of that is this crate's concern.
pub trait NetworkWorkerApp {
    /// Milliseconds until the next internally-scheduled timer fires, or
    /// `None` if nothing is scheduled ("infinite" in spec §4.D step 4).
    fn next_timer_ms(&self) -> Option<u64>;

    /// True if a cooperative task is runnable right now (spec §4.D step 4).
    fn has_runnable_task(&self) -> bool;

    /// Active connection count, checked against `worker_max_connections`
    /// (spec §4.D acquire/release policy).
    fn active_connections(&self) -> u32;

    /// In-flight HTTP request count, checked against `http_request_limit`.
    fn in_flight_requests(&self) -> u32;

    /// Wait for network events with the given timeout in milliseconds, or
    /// block indefinitely if `None` (spec §5: "the only suspension point").
    fn poll_events(&mut self, timeout_ms: Option<u64>);

    /// Arm the listener's accept readiness. Only called while the worker
    /// holds the accept lock (spec invariant 2).
    fn enable_accept(&mut self);

    /// Disarm the listener's accept readiness.
    fn disable_accept(&mut self);

    fn accept_enabled(&self) -> bool;

    /// Run expired timers, scheduled outbound HTTP/curl work, the HTTP
    /// pipeline, and cooperative tasks (spec §4.D step 10).
    fn run_pending_work(&mut self);

    /// Sweep connections for idle timeout (spec §4.D step 11).
    fn sweep_idle_connections(&mut self);

    /// Prune connections already marked disconnected (spec §4.D step 12).
    fn prune_disconnected(&mut self);

    /// Reload modules in response to SIGHUP (spec §4.D step 8).
    fn reload_modules(&mut self);

    /// User-defined teardown hook run on loop exit (spec §4.D "On loop exit").
    fn teardown(&mut self);
}

/// No-op `NetworkWorkerApp` the `supervisor` binary wires in by default.
/// Never accepts a connection or runs a request — it exists so the worker
/// round in `runtime.rs` has something concrete to drive end to end without
/// this crate reimplementing the HTTP/TLS pipeline spec.md places out of
/// scope (§1). A real deployment supplies its own implementation through
/// `process::NetworkAppFactory`.
#[derive(Default)]
pub struct NullNetworkApp {
    accept_enabled: bool,
}

impl NetworkWorkerApp for NullNetworkApp {
    fn next_timer_ms(&self) -> Option<u64> {
        None
    }

    fn has_runnable_task(&self) -> bool {
        false
    }

    fn active_connections(&self) -> u32 {
        0
    }

    fn in_flight_requests(&self) -> u32 {
        0
    }

    fn poll_events(&mut self, timeout_ms: Option<u64>) {
        // A real listener would block in an OS-level wait here (spec §5:
        // "the only suspension point"); with no fd to wait on, clamp to a
        // short sleep so the round doesn't busy-spin a whole CPU.
        let wait = timeout_ms.unwrap_or(100).min(100);
        std::thread::sleep(std::time::Duration::from_millis(wait));
    }

    fn enable_accept(&mut self) {
        self.accept_enabled = true;
    }

    fn disable_accept(&mut self) {
        self.accept_enabled = false;
    }

    fn accept_enabled(&self) -> bool {
        self.accept_enabled
    }

    fn run_pending_work(&mut self) {}

    fn sweep_idle_connections(&mut self) {}

    fn prune_disconnected(&mut self) {}

    fn reload_modules(&mut self) {
        log::info!(target: "worker::app", "SIGHUP: module reload requested (no-op app)");
    }

    fn teardown(&mut self) {}
}

/// In-memory double used by the worker-runtime unit tests in `runtime.rs`.
/// Lets a test drive connection/request counts directly instead of running
/// a real listener.
#[derive(Default)]
pub struct TestNetworkApp {
    pub connections: u32,
    pub in_flight: u32,
    pub accept_enabled: bool,
    pub runnable_task: bool,
    pub next_timer_ms: Option<u64>,
    pub reload_count: u32,
    pub teardown_called: bool,
    pub poll_calls: u32,
    pub pruned: u32,
}

impl NetworkWorkerApp for TestNetworkApp {
    fn next_timer_ms(&self) -> Option<u64> {
        self.next_timer_ms
    }

    fn has_runnable_task(&self) -> bool {
        self.runnable_task
    }

    fn active_connections(&self) -> u32 {
        self.connections
    }

    fn in_flight_requests(&self) -> u32 {
        self.in_flight
    }

    fn poll_events(&mut self, _timeout_ms: Option<u64>) {
        self.poll_calls += 1;
    }

    fn enable_accept(&mut self) {
        self.accept_enabled = true;
    }

    fn disable_accept(&mut self) {
        self.accept_enabled = false;
    }

    fn accept_enabled(&self) -> bool {
        self.accept_enabled
    }

    fn run_pending_work(&mut self) {}

    fn sweep_idle_connections(&mut self) {}

    fn prune_disconnected(&mut self) {
        self.pruned += 1;
    }

    fn reload_modules(&mut self) {
        self.reload_count += 1;
    }

    fn teardown(&mut self) {
        self.teardown_called = true;
    }
}
