//! Wire types shared between the `supervisor` and `keymgr` process roles.
//!
//! Mostly layout and message shapes (the shared-memory region, the worker
//! record, the control-socket frame, the keymgr request/response catalogue)
//! so both binaries agree on them without duplicating struct definitions.
//! `transport` is the one module that touches the OS: the control
//! socketpair is the only fd both roles need to open and drive identically.

pub mod bus;
pub mod lock;
pub mod signals;
pub mod transport;
pub mod worker;

pub use bus::{DomainName, FrameHeader, KeymgrMessage, MessageId};
pub use lock::AcceptLockRegion;
pub use signals::SignalSet;
pub use transport::ControlChannel;
pub use worker::{WorkerId, WorkerRecord, WORKER_ID_ACME, WORKER_ID_KEYMGR, WORKER_SOLO_COUNT};
