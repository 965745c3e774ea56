use thiserror::Error;

/// Class 1 in spec.md §7: initialization-fatal. Surfaced from `main` as
/// `anyhow::Error`; no workers are left running when this is returned.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to allocate shared memory region: {0}")]
    SharedMemAlloc(#[source] std::io::Error),
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),
    #[error("socketpair creation failed: {0}")]
    Socketpair(#[source] nix::Error),
    #[error("privilege drop failed: {0}")]
    PrivilegeDrop(#[from] crate::privilege::PrivilegeError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Class 2/3 in spec.md §7: worker-local fatal or soft/recoverable. Logged,
/// never propagated out of the worker round.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("bus send failed: {0}")]
    BusSend(#[source] std::io::Error),
    #[error("bus recv failed: {0}")]
    BusRecv(#[source] std::io::Error),
    #[error(transparent)]
    Bus(#[from] supervisor_proto::bus::BusError),
    #[error("lock release soft error: {0}")]
    LockRelease(#[from] supervisor_proto::lock::ReleaseError),
}
