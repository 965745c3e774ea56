//! The worker record table: one fixed-size entry per slot, shared between
//! the supervisor and every worker process (spec §3, §4.B).

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};

/// Width of the embedded handler-name scratch (spec §3 "Debug annotation").
/// A pointer would only be meaningful inside the owning process's address
/// space, so the name itself is copied into the shared record instead; per
/// spec §5 this field may be observed torn by other processes, which is
/// acceptable because it is diagnostic-only.
pub const HANDLER_NAME_LEN: usize = 32;

/// Logical worker identity. Two reserved sentinel values name the
/// key-manager and ACME sibling; network workers are numbered `1..=N`
/// (spec §3: "remaining ids number network workers from 1").
pub type WorkerId = i32;

pub const WORKER_ID_KEYMGR: WorkerId = -1;
pub const WORKER_ID_ACME: WorkerId = -2;

/// Pool sizes at or below this skip lock arbitration entirely (spec glossary
/// "solo threshold").
pub const WORKER_SOLO_COUNT: usize = 3;

pub fn is_reserved(id: WorkerId) -> bool {
    id == WORKER_ID_KEYMGR || id == WORKER_ID_ACME
}

/// One slot in the shared worker record array. Only plain-old-data fields
/// that must be visible across process boundaries live here; the control
/// socket fd and the currently-executing handler name are process-local and
/// kept by the owning process instead (spec §9 note 3, §3 "Debug annotation").
#[repr(C)]
pub struct WorkerRecord {
    id: AtomicI32,
    cpu: AtomicI32,
    pid: AtomicI32,
    running: AtomicBool,
    restarted: AtomicBool,
    has_lock: AtomicBool,
    /// Per-worker scratch offset into a process-local log buffer. The buffer
    /// itself is never shared (spec §9 note 3); only the offset lives here.
    log_buffer_offset: AtomicU32,
    /// Informational heartbeat, milliseconds since an arbitrary epoch chosen
    /// by the supervisor at startup. Never gates restart decisions — restart
    /// is reap-driven (spec §4.C), not liveness-driven.
    last_seen_ms: AtomicU32,
    /// Name of the request handler currently executing in this worker, for
    /// crash diagnostics (spec §3, §7). Written only by the owning process.
    handler_name: [AtomicU8; HANDLER_NAME_LEN],
}

impl WorkerRecord {
    pub const fn empty() -> Self {
        Self {
            id: AtomicI32::new(0),
            cpu: AtomicI32::new(0),
            pid: AtomicI32::new(0),
            running: AtomicBool::new(false),
            restarted: AtomicBool::new(false),
            has_lock: AtomicBool::new(false),
            log_buffer_offset: AtomicU32::new(0),
            last_seen_ms: AtomicU32::new(0),
            handler_name: [const { AtomicU8::new(0) }; HANDLER_NAME_LEN],
        }
    }

    pub fn init(&self, id: WorkerId, cpu: i32) {
        self.id.store(id, Ordering::Relaxed);
        self.cpu.store(cpu, Ordering::Relaxed);
        self.pid.store(0, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
        self.restarted.store(false, Ordering::Relaxed);
        self.has_lock.store(false, Ordering::Relaxed);
    }

    pub fn id(&self) -> WorkerId {
        self.id.load(Ordering::Relaxed)
    }

    pub fn cpu(&self) -> i32 {
        self.cpu.load(Ordering::Relaxed)
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Written only by the supervisor (spec §4.B).
    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Written only by the supervisor.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn restarted(&self) -> bool {
        self.restarted.load(Ordering::Acquire)
    }

    /// Written only by the supervisor.
    pub fn set_restarted(&self, restarted: bool) {
        self.restarted.store(restarted, Ordering::Release);
    }

    pub fn has_lock(&self) -> bool {
        self.has_lock.load(Ordering::Acquire)
    }

    /// Written only by the owning worker process.
    pub fn set_has_lock(&self, has_lock: bool) {
        self.has_lock.store(has_lock, Ordering::Release);
    }

    pub fn last_seen_ms(&self) -> u32 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    /// Written only by the owning worker process; informational only.
    pub fn touch(&self, now_ms: u32) {
        self.last_seen_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Written only by the owning worker process, before executing a
    /// request handler. Truncated silently to `HANDLER_NAME_LEN` bytes.
    pub fn set_handler_name(&self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(HANDLER_NAME_LEN);
        for (i, slot) in self.handler_name.iter().enumerate() {
            slot.store(if i < n { bytes[i] } else { 0 }, Ordering::Relaxed);
        }
    }

    /// Best-effort read of the handler name, for crash diagnostics (spec
    /// §7). May observe a torn value if read concurrently with a write from
    /// the owning process; that is an accepted tradeoff for diagnostics.
    pub fn handler_name(&self) -> String {
        let bytes: Vec<u8> = self
            .handler_name
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .take_while(|&b| b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_and_cpu_survive_restart_style_reinit() {
        let rec = WorkerRecord::empty();
        rec.init(3, 2);
        rec.set_pid(1234);
        rec.set_running(true);

        // simulate a crash+restart: supervisor marks not running, re-spawns
        // the same slot with the same id/cpu, pid changes.
        rec.set_running(false);
        rec.set_restarted(true);
        rec.set_pid(5678);
        rec.set_running(true);

        assert_eq!(rec.id(), 3);
        assert_eq!(rec.cpu(), 2);
        assert_eq!(rec.pid(), 5678);
        assert!(rec.restarted());
    }

    #[test]
    fn handler_name_round_trips_and_truncates() {
        let rec = WorkerRecord::empty();
        assert_eq!(rec.handler_name(), "");
        rec.set_handler_name("handle_get_request");
        assert_eq!(rec.handler_name(), "handle_get_request");

        let long_name = "x".repeat(HANDLER_NAME_LEN + 10);
        rec.set_handler_name(&long_name);
        assert_eq!(rec.handler_name().len(), HANDLER_NAME_LEN);
    }

    #[test]
    fn reserved_ids_are_recognized() {
        assert!(is_reserved(WORKER_ID_KEYMGR));
        assert!(is_reserved(WORKER_ID_ACME));
        assert!(!is_reserved(1));
        assert!(!is_reserved(42));
    }
}
