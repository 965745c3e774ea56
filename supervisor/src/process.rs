//! Supervisor (component C): spec §4.C.
//!
//! Owns the shared region, the worker table, and the one privileged process
//! that never enters a network event loop itself. `initialize` allocates and
//! forks everything; `run` is the supervisor's own round — reap, relay
//! messages between siblings and network workers, dispatch signals — driven
//! by the same deferred-flag-plus-poll pattern as a worker round
//! (SPEC_FULL.md §4.C.1).

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult, Pid};

use supervisor_proto::bus::{encode_keymgr_frame, parse_keymgr_frame, KeymgrMessage, MessageId};
use supervisor_proto::{ControlChannel, WorkerId, WORKER_ID_ACME, WORKER_ID_KEYMGR};

use crate::config::{Config, RestartPolicy};
use crate::error::SupervisorError;
use crate::message_handlers::LoggingDomainTlsContexts;
use crate::network::NetworkWorkerApp;
use crate::privilege;
use crate::runtime::{Outbound, RuntimeConfig, WorkerRuntime};
use crate::shared_mem::SharedRegion;
use crate::signals::{self, SignalSet};
use crate::worker_table::WorkerTable;

/// Builds the `NetworkWorkerApp` a freshly-forked network worker should
/// drive. Supplied by the binary's `main`, since the HTTP/TLS pipeline is an
/// external collaborator spec.md names only by interface.
pub type NetworkAppFactory = Arc<dyn Fn(WorkerId, i32) -> Box<dyn NetworkWorkerApp> + Send + Sync>;

/// Slot index reserved for the key-manager (spec §3 "two reserved slots").
const SLOT_KEYMGR: usize = 0;
/// Slot index reserved for the ACME sibling.
const SLOT_ACME: usize = 1;

pub struct Supervisor {
    cfg: Config,
    region: Arc<SharedRegion>,
    table: WorkerTable,
    factory: NetworkAppFactory,
    self_pipe_read: RawFd,
    /// Set by `reap()` when a loss requires whole-server shutdown (key-manager
    /// or ACME gone, or `terminate` policy tripped); consumed by `run()`.
    fatal_stop: bool,
}

impl Supervisor {
    /// Spec §4.C `initialize(pool_size)`. `pool_size == 0` uses the detected
    /// cpu count (spec §8 boundary behavior); no crate in this corpus offers
    /// a dedicated cpu-count helper, so this falls back to
    /// `std::thread::available_parallelism`, the stdlib's own idiom for it.
    pub fn initialize(cfg: Config, factory: NetworkAppFactory) -> Result<Self, SupervisorError> {
        let mut sup = Self::allocate(cfg, factory)?;
        sup.spawn_all()?;
        Ok(sup)
    }

    /// The non-forking half of `initialize`: size the pool, allocate the
    /// shared region, build the table, and wire up the self-pipe. Split out
    /// so unit tests can exercise slot/id/cpu assignment without `fork()`ing
    /// any real processes.
    fn allocate(cfg: Config, factory: NetworkAppFactory) -> Result<Self, SupervisorError> {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool_size = if cfg.worker_count == 0 {
            cpu_count
        } else {
            cfg.worker_count
        };
        let slot_count = pool_size + 2;

        let region = Arc::new(SharedRegion::allocate(slot_count).map_err(SupervisorError::SharedMemAlloc)?);

        let mut ids_and_cpus = vec![(WORKER_ID_KEYMGR, 0i32), (WORKER_ID_ACME, 0i32)];
        ids_and_cpus.extend((1..=pool_size as i32).map(|id| {
            let cpu = if cfg.worker_set_affinity {
                (id - 1) % cpu_count as i32
            } else {
                0
            };
            (id, cpu)
        }));
        let table = WorkerTable::new(region.clone(), &ids_and_cpus);

        let (read_end, write_end) = pipe().map_err(SupervisorError::Socketpair)?;
        set_nonblocking(read_end.as_raw_fd());
        set_nonblocking(write_end.as_raw_fd());
        let self_pipe_read = read_end.as_raw_fd();
        signals::set_self_pipe_write_fd(write_end.as_raw_fd());
        signals::install().map_err(SupervisorError::Fork)?;
        // The pipe fds must outlive this function; the supervisor holds the
        // read end for its lifetime and the handler holds the write end for
        // the process lifetime, so neither `OwnedFd` should close on drop.
        std::mem::forget(read_end);
        std::mem::forget(write_end);

        Ok(Self {
            cfg,
            region,
            table,
            factory,
            self_pipe_read,
            fatal_stop: false,
        })
    }

    /// Fork every slot: network workers round-robin across cpu indices
    /// first, then the siblings — ACME before key-manager, so the
    /// key-manager can immediately talk to it (spec §4.C initialize).
    fn spawn_all(&mut self) -> Result<(), SupervisorError> {
        let slot_count = self.table.slot_count();
        for slot in 2..slot_count {
            self.spawn(slot)?;
        }
        if self.cfg.keymgr_enabled {
            if self.cfg.acme_enabled {
                self.spawn(SLOT_ACME)?;
            }
            self.spawn(SLOT_KEYMGR)?;
        }
        Ok(())
    }

    /// Spec §4.C `spawn(slot, id, cpu)`.
    fn spawn(&mut self, slot: usize) -> Result<(), SupervisorError> {
        let id = self.table.slot(slot).id;
        let cpu = self.table.slot(slot).cpu;

        let (parent_end, child_end) = ControlChannel::pair().map_err(SupervisorError::Socketpair)?;

        match unsafe { fork() }.map_err(SupervisorError::Fork)? {
            ForkResult::Parent { child } => {
                drop(child_end);
                self.table.set_channel(slot, parent_end);
                let record = self.region.record(slot);
                record.set_pid(child.as_raw());
                record.set_running(true);
                log::info!(target: "supervisor::process", "spawned slot {slot} (id {id}) as pid {}", child.as_raw());
            }
            ForkResult::Child => {
                drop(parent_end);
                child_entry(id, cpu, slot, &self.cfg, &self.region, child_end, &self.factory);
                unreachable!("child_entry never returns");
            }
        }
        Ok(())
    }

    /// Spec §4.C `dispatch_signal(sig)`.
    fn dispatch_signal(&self, sig: Signal) {
        for pid in self.table.all_pids() {
            if let Err(e) = kill(Pid::from_raw(pid), sig) {
                log::warn!(target: "supervisor::process", "kill({pid}, {sig:?}) failed: {e}");
            }
        }
    }

    fn raise_self(&self, sig: Signal) {
        let _ = kill(Pid::from_raw(std::process::id() as i32), sig);
    }

    /// Spec §4.C `reap()`: non-blocking reap loop with policy branching.
    fn reap(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(WaitStatus::Exited(pid, code)) => self.on_child_gone(pid.as_raw(), code == 0),
                Ok(WaitStatus::Signaled(pid, _, _)) => self.on_child_gone(pid.as_raw(), false),
                Ok(_) => continue,
                Err(e) => {
                    log::warn!(target: "supervisor::reap", "waitpid failed: {e}");
                    break;
                }
            }
        }
    }

    fn on_child_gone(&mut self, pid: i32, clean_exit: bool) {
        let Some(slot) = self.table.slot_index_of_pid(pid) else {
            log::warn!(target: "supervisor::reap", "reaped unknown pid {pid}");
            return;
        };
        let id = self.table.slot(slot).id;
        let record = self.region.record(slot);
        record.set_running(false);
        self.table.close_channel(slot);

        if clean_exit {
            log::info!(target: "supervisor::reap", "slot {slot} (id {id}, pid {pid}) exited cleanly");
            return;
        }

        if supervisor_proto::worker::is_reserved(id) {
            log::error!(target: "supervisor::reap", "keymgr or acme process gone, stopping");
            self.fatal_stop = true;
            self.raise_self(Signal::SIGTERM);
            return;
        }

        match self.cfg.worker_policy {
            RestartPolicy::Terminate => {
                log::error!(target: "supervisor::reap", "worker policy is 'terminate', stopping");
                self.fatal_stop = true;
                self.raise_self(Signal::SIGTERM);
            }
            RestartPolicy::Restart => {
                if self.region.lock_region().current_holder() == pid {
                    self.region.lock_region().force_release();
                }
                record.set_restarted(true);
                log::warn!(target: "supervisor::reap", "restarting slot {slot} (id {id})");
                if let Err(e) = self.spawn(slot) {
                    log::error!(target: "supervisor::reap", "failed to respawn slot {slot}: {e}");
                }
            }
        }
    }

    /// Relay traffic between the two siblings and the network worker pool.
    /// The bus has no destination field of its own (spec §4.G names delivery
    /// only by interface), so this fixes one small, deliberate routing
    /// table: ACME → key-manager, key-manager → broadcast to every network
    /// worker, a network worker's `CERTIFICATE_REQ`/`ENTROPY_REQ` → the
    /// key-manager, and a network worker's `ACCEPT_AVAILABLE` → every other
    /// network worker (never the siblings).
    fn pump_messages(&mut self) {
        let mut from_acme = Vec::new();
        if let Some(ch) = self.table.channel_mut(SLOT_ACME) {
            while let Ok(Some(frame)) = ch.try_recv_frame() {
                from_acme.push(frame);
            }
        }
        for frame in from_acme {
            self.send_to(SLOT_KEYMGR, &frame);
        }

        let mut from_keymgr = Vec::new();
        if let Some(ch) = self.table.channel_mut(SLOT_KEYMGR) {
            while let Ok(Some(frame)) = ch.try_recv_frame() {
                from_keymgr.push(frame);
            }
        }
        for frame in from_keymgr {
            self.broadcast_to_network_workers(&frame, None);
        }

        let slot_count = self.table.slot_count();
        for slot in 2..slot_count {
            let mut from_worker = Vec::new();
            if let Some(ch) = self.table.channel_mut(slot) {
                while let Ok(Some(frame)) = ch.try_recv_frame() {
                    from_worker.push(frame);
                }
            }
            for frame in from_worker {
                match parse_keymgr_frame(&frame) {
                    Ok(KeymgrMessage::AcceptAvailable) => {
                        self.broadcast_to_network_workers(&frame, Some(slot));
                    }
                    Ok(KeymgrMessage::Shutdown) => {
                        log::debug!(target: "supervisor::bus", "slot {slot} announced shutdown");
                    }
                    Ok(_) => self.send_to(SLOT_KEYMGR, &frame),
                    Err(e) => log::warn!(target: "supervisor::bus", "dropping malformed frame from slot {slot}: {e}"),
                }
            }
        }
    }

    fn send_to(&mut self, slot: usize, frame: &[u8]) {
        if let Some(ch) = self.table.channel_mut(slot) {
            if let Err(e) = ch.send_frame(frame) {
                log::warn!(target: "supervisor::bus", "send to slot {slot} failed: {e}");
            }
        }
    }

    fn broadcast_to_network_workers(&mut self, frame: &[u8], exclude: Option<usize>) {
        let slot_count = self.table.slot_count();
        for slot in 2..slot_count {
            if Some(slot) == exclude {
                continue;
            }
            self.send_to(slot, frame);
        }
    }

    fn wait_for_activity(&mut self, timeout: Duration) {
        let mut fds: Vec<PollFd> = Vec::new();
        // SAFETY: `self_pipe_read` stays open for the supervisor's lifetime.
        let self_pipe = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.self_pipe_read) };
        fds.push(PollFd::new(self_pipe, PollFlags::POLLIN));
        for (_, ch) in self.table.open_channels_mut() {
            let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(ch.raw_fd()) };
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        let timeout_ms: i32 = timeout.as_millis().min(i32::MAX as u128) as i32;
        match poll(&mut fds, PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE)) {
            Ok(_) => {
                let mut drain_buf = [0u8; 64];
                let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.self_pipe_read) };
                while nix::unistd::read(fd.as_raw_fd(), &mut drain_buf).is_ok_and(|n| n > 0) {}
            }
            Err(e) => log::warn!(target: "supervisor::process", "poll failed: {e}"),
        }
    }

    /// The supervisor's own main loop: reap, relay messages, handle signals,
    /// wait for the next thing to happen. Returns once an orderly shutdown
    /// has fully drained (spec §4.C `shutdown()`).
    pub fn run(mut self) -> Result<(), SupervisorError> {
        loop {
            self.reap();
            self.pump_messages();

            let sigs = signals::drain();
            if sigs.hup() {
                log::info!(target: "supervisor::process", "SIGHUP: forwarding to all workers");
                self.dispatch_signal(Signal::SIGHUP);
            }
            if sigs.wants_quit() || self.fatal_stop {
                break;
            }

            self.wait_for_activity(Duration::from_millis(200));
        }

        log::info!(target: "supervisor::process", "shutting down: signaling all workers");
        self.dispatch_signal(Signal::SIGTERM);
        self.shutdown();
        Ok(())
    }

    /// Spec §4.C `shutdown()`: block for every worker to exit, then the
    /// shared region is dropped (unmapped) once this returns.
    fn shutdown(&mut self) {
        for pid in self.table.all_pids() {
            loop {
                match waitpid(Pid::from_raw(pid), None) {
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                    Ok(_) => continue,
                    Err(nix::errno::Errno::ECHILD) => break,
                    Err(e) => {
                        log::warn!(target: "supervisor::process", "waitpid({pid}) during shutdown failed: {e}");
                        break;
                    }
                }
            }
            if let Some(slot) = self.table.slot_index_of_pid(pid) {
                self.region.record(slot).set_running(false);
            }
        }
        debug_assert!(self.table.all_stopped(), "shutdown completed with a slot still running");
    }
}

fn set_nonblocking(fd: RawFd) {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let mut flags = OFlag::from_bits_truncate(flags);
        flags.insert(OFlag::O_NONBLOCK);
        let _ = fcntl(fd, FcntlArg::F_SETFL(flags));
    }
}

/// Runs in the child after `fork()`, for every role. Never returns.
fn child_entry(
    id: WorkerId,
    cpu: i32,
    slot: usize,
    cfg: &Config,
    region: &SharedRegion,
    channel: ControlChannel,
    factory: &NetworkAppFactory,
) -> ! {
    if let Err(e) = signals::install() {
        log::error!(target: "worker::init", "failed to install signal handlers: {e}");
    }
    if let Err(e) = privilege::drop_privileges(cfg) {
        log::error!(target: "worker::init", "privilege drop failed: {e}");
        std::process::exit(1);
    }

    match id {
        WORKER_ID_KEYMGR => {
            log::info!(target: "worker::init", "key-manager started (pid {})", std::process::id());
            keymgr::run_keymgr(keymgr::KeymgrConfig::from_domains(&cfg.domains), channel);
        }
        WORKER_ID_ACME => {
            log::info!(target: "worker::init", "ACME sibling started (pid {})", std::process::id());
            keymgr::run_acme(keymgr::KeymgrConfig::from_domains(&cfg.domains), channel);
        }
        _ => run_network_worker(id, cpu, slot, cfg, region, channel, factory),
    }

    std::process::exit(0);
}

fn run_network_worker(
    id: WorkerId,
    cpu: i32,
    slot: usize,
    cfg: &Config,
    region: &SharedRegion,
    mut channel: ControlChannel,
    factory: &NetworkAppFactory,
) {
    log::info!(target: "worker::init", "network worker {id} started (pid {}, cpu {cpu})", std::process::id());

    let record = region.record(slot);
    let lock = region.lock_region();
    let pid = std::process::id() as i32;
    let mut app = factory(id, cpu);
    let mut contexts = LoggingDomainTlsContexts::new(&cfg.domains);

    let rt_cfg = RuntimeConfig {
        max_connections: cfg.worker_max_connections,
        http_request_limit: cfg.http_request_limit,
        nlisteners: cfg.nlisteners,
        pool_size: region.slot_count() - 2,
        keymgr_active: cfg.keymgr_enabled,
        reseed_interval_ms: cfg.reseed_interval_ms,
    };
    let mut rt = WorkerRuntime::new(record, lock, pid, rt_cfg);

    // Restart semantics (spec §4.C): a restarted worker immediately asks the
    // key-manager for fresh certificates instead of waiting for the periodic
    // reseed timer. The flag is cleared here, once the request has gone out,
    // since only this process can observe "the first loop iteration is
    // about to run" (DESIGN.md records this as a deliberate exception to the
    // supervisor-only-writer convention for this one field).
    if record.restarted() && cfg.keymgr_enabled {
        for domain in &cfg.domains {
            if let Ok(d) = supervisor_proto::bus::DomainName::new(domain) {
                let frame = encode_keymgr_frame(MessageId::CertificateReq, Some(&d), &[]);
                let _ = channel.send_frame(&frame);
            }
        }
        record.set_restarted(false);
    }

    let start = std::time::Instant::now();
    loop {
        while let Ok(Some(frame)) = channel.try_recv_frame() {
            match parse_keymgr_frame(&frame) {
                Ok(KeymgrMessage::AcceptAvailable) => rt.on_accept_available(),
                Ok(KeymgrMessage::Shutdown) => {}
                Ok(_) => {
                    if let Err(e) = crate::message_handlers::handle_keymgr_frame(&frame, &mut contexts) {
                        log::warn!(target: "worker::bus", "dropping keymgr message: {e}");
                    }
                }
                Err(e) => log::warn!(target: "worker::bus", "malformed frame from parent: {e}"),
            }
        }

        let sigs = signals::drain();
        if sigs.chld() {
            reap_worker_children(id);
        }

        let now_ms = crate::runtime::monotonic_ms(start);
        let (outbound, keep_going) = rt.run_round_with_signals(app.as_mut(), now_ms, sigs);
        for o in outbound {
            let frame = match o {
                Outbound::EntropyRequest => encode_keymgr_frame(MessageId::EntropyReq, None, &[]),
                Outbound::AcceptAvailableBroadcast => {
                    encode_keymgr_frame(MessageId::AcceptAvailable, None, &[])
                }
            };
            if let Err(e) = channel.send_frame(&frame) {
                log::warn!(target: "worker::bus", "send to parent failed: {e}");
            }
        }
        if !keep_going {
            break;
        }
    }

    app.teardown();
    let _ = channel.send_frame(&encode_keymgr_frame(MessageId::Shutdown, None, &[]));
}

/// Step 8's "SIGCHLD → reap any child processes owned by the worker (e.g.
/// scripted sub-processes)" (spec §4.D). A network worker forks no children
/// of its own in this crate, but `NetworkWorkerApp` implementations that
/// shell out (CGI-style scripts, external filters) will, so the non-blocking
/// reap loop lives here regardless — unreaped zombies would otherwise
/// accumulate under the worker's own pid.
fn reap_worker_children(worker_id: WorkerId) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                log::debug!(target: "worker::children", "worker {worker_id} reaped child pid {} (exit {code})", pid.as_raw());
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                log::debug!(target: "worker::children", "worker {worker_id} reaped child pid {} (signal {sig:?})", pid.as_raw());
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                log::warn!(target: "worker::children", "worker {worker_id} waitpid failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TestNetworkApp;

    fn test_factory() -> NetworkAppFactory {
        Arc::new(|_id, _cpu| Box::new(TestNetworkApp::default()) as Box<dyn NetworkWorkerApp>)
    }

    fn base_cfg() -> Config {
        Config {
            skip_runas: true,
            skip_chroot: true,
            worker_count: 2,
            ..Config::default()
        }
    }

    // These exercise `allocate` only, never `spawn_all`/`initialize` — the
    // latter call real `fork()`, which has no place in a unit test process.

    #[test]
    fn allocate_sizes_region_for_pool_plus_two_reserved_slots() {
        let sup = Supervisor::allocate(base_cfg(), test_factory()).expect("allocate");
        assert_eq!(sup.table.slot_count(), 4);
    }

    #[test]
    fn allocate_zero_worker_count_detects_cpu_count() {
        let mut cfg = base_cfg();
        cfg.worker_count = 0;
        let sup = Supervisor::allocate(cfg, test_factory()).expect("allocate");
        let detected = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(sup.table.slot_count(), detected + 2);
    }

    #[test]
    fn reserved_slots_keep_their_sentinel_ids() {
        let sup = Supervisor::allocate(base_cfg(), test_factory()).expect("allocate");
        assert_eq!(sup.table.slot(SLOT_KEYMGR).id, WORKER_ID_KEYMGR);
        assert_eq!(sup.table.slot(SLOT_ACME).id, WORKER_ID_ACME);
    }

    #[test]
    fn network_worker_ids_round_robin_across_detected_cpus() {
        let mut cfg = base_cfg();
        cfg.worker_count = 4;
        let sup = Supervisor::allocate(cfg, test_factory()).expect("allocate");
        assert_eq!(sup.table.slot(2).id, 1);
        assert_eq!(sup.table.slot(3).id, 2);
        assert_eq!(sup.table.slot(4).id, 3);
        assert_eq!(sup.table.slot(5).id, 4);
    }

    #[test]
    fn disabling_affinity_pins_every_worker_to_cpu_zero() {
        let mut cfg = base_cfg();
        cfg.worker_count = 3;
        cfg.worker_set_affinity = false;
        let sup = Supervisor::allocate(cfg, test_factory()).expect("allocate");
        for slot in 2..sup.table.slot_count() {
            assert_eq!(sup.table.slot(slot).cpu, 0);
        }
    }
}
