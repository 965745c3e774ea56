//! The accept-lock region: offset 0 of the shared-memory mapping (spec §6).

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// `lock_word` (4 bytes) + `current_pid` (4 bytes), laid out exactly as
/// spec.md §6 describes. `worker::WorkerRecord` entries follow this struct
/// in the same mapping, padded to the record's alignment.
#[repr(C)]
pub struct AcceptLockRegion {
    lock_word: AtomicU32,
    current_pid: AtomicI32,
}

const FREE: u32 = 0;
const HELD: u32 = 1;

impl AcceptLockRegion {
    /// Zeroed region: free, no holder. Safe to call on freshly-mapped,
    /// zero-filled shared memory; does not itself allocate.
    pub const fn zeroed() -> Self {
        Self {
            lock_word: AtomicU32::new(FREE),
            current_pid: AtomicI32::new(0),
        }
    }

    /// Atomic CAS of the lock word from free to held. On success records
    /// `pid` as the holder. Never blocks (spec §4.A: "a spin-free trylock").
    pub fn try_acquire(&self, pid: i32) -> bool {
        match self
            .lock_word
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                self.current_pid.store(pid, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    /// Release the lock held by `pid`. Clears `current_pid` first, then CAS
    /// the word back to free. A failed CAS (word already free) is a soft
    /// error: it means the supervisor pre-emptively force-released after a
    /// crash; the caller should log, not panic.
    pub fn release(&self, _pid: i32) -> Result<(), ReleaseError> {
        self.current_pid.store(0, Ordering::Release);
        match self
            .lock_word
            .compare_exchange(HELD, FREE, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => Ok(()),
            Err(_) => Err(ReleaseError::AlreadyFree),
        }
    }

    /// Forcibly reset the region to free/no-holder. Used by the supervisor
    /// after reaping a worker that died while holding the lock (invariant 5).
    pub fn force_release(&self) {
        self.current_pid.store(0, Ordering::Release);
        self.lock_word.store(FREE, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.lock_word.load(Ordering::Acquire) == HELD
    }

    pub fn current_holder(&self) -> i32 {
        self.current_pid.load(Ordering::Acquire)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("lock word was already free")]
    AlreadyFree,
}
