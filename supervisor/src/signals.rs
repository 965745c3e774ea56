//! Re-exports the shared deferred-signal module. The implementation lives
//! in `supervisor-proto` because `keymgr`'s siblings run in the same
//! process image post-fork and need to drain the identical signal flag
//! (spec §6, §4.F); keeping one copy avoids two independently-installed
//! `sigaction` tables racing each other.

pub use supervisor_proto::signals::*;
