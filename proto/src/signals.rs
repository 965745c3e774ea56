//! Signal handlers as asynchronous events → deferred flag + drain point
//! (spec §9 design notes, §4.D step 8, §6).
//!
//! The handler touches nothing but a process-local atomic; all real work
//! (reload, quit, reap) happens later at the drain point in the event loop,
//! which avoids async-signal-safety traps entirely.
//!
//! Lives in `supervisor-proto` rather than the `supervisor` binary because
//! the key-manager and ACME siblings (the `keymgr` crate) run in the same
//! process image post-fork and need to observe the identical signal set
//! (spec §6: "Worker: same set handled as in §4.D" applies to siblings too).

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

const HUP: u32 = 1 << 0;
const INT: u32 = 1 << 1;
const TERM: u32 = 1 << 2;
const QUIT: u32 = 1 << 3;
const CHLD: u32 = 1 << 4;

static PENDING: AtomicU32 = AtomicU32::new(0);

/// Write end of the supervisor's self-pipe (SPEC_FULL §4.C.1), or -1 if none
/// has been installed. Workers never set this; only the supervisor's own
/// event loop needs to interrupt a `poll` wait promptly on signal delivery.
static SELF_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Register the write end of a self-pipe the signal handler should nudge on
/// every delivery. Call once, before `install()`, from the process that owns
/// the poll-based wait loop (the supervisor's `run()`).
pub fn set_self_pipe_write_fd(fd: RawFd) {
    SELF_PIPE_WRITE_FD.store(fd, Ordering::SeqCst);
}

extern "C" fn on_signal(raw: std::os::raw::c_int) {
    let bit = if raw == Signal::SIGHUP as i32 {
        HUP
    } else if raw == Signal::SIGINT as i32 {
        INT
    } else if raw == Signal::SIGTERM as i32 {
        TERM
    } else if raw == Signal::SIGQUIT as i32 {
        QUIT
    } else if raw == Signal::SIGCHLD as i32 {
        CHLD
    } else {
        0
    };
    PENDING.fetch_or(bit, Ordering::SeqCst);

    let fd = SELF_PIPE_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // SAFETY: the fd was handed to us by `set_self_pipe_write_fd` and
        // stays open for the process lifetime; `write` of one byte is
        // async-signal-safe. Errors (pipe full, closed) are ignored — the
        // pipe is only a wakeup nudge, never the source of truth.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = nix::unistd::write(borrowed, &[1u8]);
    }
}

/// Install handlers for the signal set the core cares about (spec §6:
/// "Worker: same set handled as in §4.D"). Must be called once per process,
/// after fork and before entering the event loop.
pub fn install() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        signal::sigaction(Signal::SIGHUP, &action)?;
        signal::sigaction(Signal::SIGINT, &action)?;
        signal::sigaction(Signal::SIGTERM, &action)?;
        signal::sigaction(Signal::SIGQUIT, &action)?;
        signal::sigaction(Signal::SIGCHLD, &action)?;
    }
    Ok(())
}

/// Snapshot of signals received since the last drain, consumed by step 8 of
/// the worker round and by the supervisor's own dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSet(u32);

impl SignalSet {
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
    pub fn hup(&self) -> bool {
        self.0 & HUP != 0
    }
    pub fn int(&self) -> bool {
        self.0 & INT != 0
    }
    pub fn term(&self) -> bool {
        self.0 & TERM != 0
    }
    pub fn quit(&self) -> bool {
        self.0 & QUIT != 0
    }
    pub fn chld(&self) -> bool {
        self.0 & CHLD != 0
    }
    /// SIGINT, SIGTERM, and SIGQUIT all mean "start orderly shutdown".
    pub fn wants_quit(&self) -> bool {
        self.int() || self.term() || self.quit()
    }

    /// Build a `SignalSet` directly, bypassing the process-wide flag. Used
    /// by other modules' unit tests (e.g. the worker round in `runtime.rs`)
    /// that want a deterministic signal set without racing the shared
    /// `PENDING` atomic against `signals::tests` running in parallel.
    #[cfg(test)]
    pub fn term_only() -> Self {
        Self(TERM)
    }

    #[cfg(test)]
    pub fn hup_and_chld() -> Self {
        Self(HUP | CHLD)
    }
}

/// Drain the flag set by the handler, resetting it atomically to empty.
pub fn drain() -> SignalSet {
    SignalSet(PENDING.swap(0, Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both cases share the process-global PENDING flag, so they run as one
    // test to avoid interference from cargo's parallel test execution.
    #[test]
    fn drain_reports_and_clears_delivered_signals() {
        drain(); // start from a clean slate regardless of test order

        // Exercise the handler directly rather than raising a real signal,
        // so the test is deterministic and doesn't depend on process state.
        on_signal(Signal::SIGHUP as i32);
        on_signal(Signal::SIGCHLD as i32);

        let set = drain();
        assert!(set.hup());
        assert!(set.chld());
        assert!(!set.wants_quit());

        // A second drain with nothing new delivered sees an empty set.
        assert!(drain().is_empty());

        for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT] {
            on_signal(sig as i32);
            assert!(drain().wants_quit());
        }
    }
}
