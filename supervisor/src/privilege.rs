//! Privilege partitioner (spec §4.E). Order is load-bearing: resolve user,
//! chroot, raise NOFILE, set NOFILE, drop uid/gid, install sandbox.

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::{self, chdir, chroot, setgid, setgroups, setuid, Gid, Uid};
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("chroot to {path} failed: {source}")]
    Chroot { path: String, source: nix::Error },
    #[error("chdir failed: {0}")]
    Chdir(#[source] nix::Error),
    #[error("setuid/setgid failed: {0}")]
    SetIds(#[source] nix::Error),
}

/// Resolved target identity, looked up once so a failure to resolve the
/// user is reported before any destructive step runs (spec §4.E step 1).
pub struct TargetUser {
    pub uid: Uid,
    pub gid: Gid,
}

fn resolve_user(name: &str) -> Result<TargetUser, PrivilegeError> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|_| PrivilegeError::UnknownUser(name.to_string()))?
        .ok_or_else(|| PrivilegeError::UnknownUser(name.to_string()))?;
    Ok(TargetUser {
        uid: user.uid,
        gid: user.gid,
    })
}

/// Count descriptors open below the current soft NOFILE limit, so the new
/// limit can be raised to cover whatever the parent left inherited
/// (spec §4.E step 3: "increment the desired new limit").
fn count_open_fds(soft_limit: u64) -> u64 {
    let scan_limit = soft_limit.min(65536) as i32;
    let mut open = 0u64;
    for fd in 0..scan_limit {
        if nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok() {
            open += 1;
        }
    }
    open
}

/// Run the full sequence. `cfg.skip_runas`/`cfg.skip_chroot` opt out of
/// steps 1-2 and 5 individually, matching spec §4.E's "(unless skipping)".
pub fn drop_privileges(cfg: &Config) -> Result<(), PrivilegeError> {
    // Step 1: resolve target user.
    let target = if cfg.skip_runas {
        None
    } else {
        let name = cfg.runas_user.as_deref().unwrap_or("");
        Some(resolve_user(name)?)
    };

    // Step 2: chroot (or just chdir into the root if skipping chroot).
    if let Some(root) = cfg.root_path.as_deref() {
        if !cfg.skip_chroot {
            chroot(root).map_err(|e| PrivilegeError::Chroot {
                path: root.to_string(),
                source: e,
            })?;
            chdir("/").map_err(PrivilegeError::Chdir)?;
        } else {
            chdir(root).map_err(PrivilegeError::Chdir)?;
        }
    }

    // Steps 3-4: raise NOFILE to cover inherited descriptors, then set it.
    // Refusal here is soft (spec §7 class 3): log and continue.
    if let Ok((soft, hard)) = getrlimit(Resource::RLIMIT_NOFILE) {
        let inherited = count_open_fds(soft);
        let wanted = cfg.worker_rlimit_nofiles + inherited;
        let new_soft = wanted.min(hard);
        if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, new_soft, hard) {
            log::warn!(target: "supervisor::privilege", "setrlimit(NOFILE) refused: {e}");
        }
    } else {
        log::warn!(target: "supervisor::privilege", "getrlimit(NOFILE) failed, skipping raise");
    }

    // Step 5: drop uid/gid. Fatal if it fails.
    if let Some(target) = target {
        setgroups(&[target.gid]).map_err(PrivilegeError::SetIds)?;
        setgid(target.gid).map_err(PrivilegeError::SetIds)?;
        setuid(target.uid).map_err(PrivilegeError::SetIds)?;
    }

    // Step 6: platform sandbox. Real seccomp BPF installation is out of
    // scope (spec.md names it only by interface); this hook is where a
    // concrete filter would be installed on Linux.
    install_platform_sandbox();

    Ok(())
}

#[cfg(target_os = "linux")]
fn install_platform_sandbox() {
    log::debug!(target: "supervisor::privilege", "seccomp filter installation point (no-op in this build)");
}

#[cfg(not(target_os = "linux"))]
fn install_platform_sandbox() {
    log::debug!(target: "supervisor::privilege", "no platform sandbox available on this OS");
}

/// Exposed so the worker round can distinguish "we are already unprivileged"
/// when deciding whether a retry of a privileged syscall makes sense.
pub fn current_uid_is_root() -> bool {
    unistd::getuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_unknown_user_is_an_error() {
        let err = resolve_user("definitely-not-a-real-user-12345").unwrap_err();
        assert!(matches!(err, PrivilegeError::UnknownUser(_)));
    }

    #[test]
    fn skip_flags_bypass_resolution_and_chroot() {
        let cfg = Config {
            skip_runas: true,
            skip_chroot: true,
            runas_user: None,
            root_path: None,
            ..Config::default()
        };
        // With both skipped, drop_privileges should not even attempt to
        // resolve a user or touch the filesystem root.
        assert!(drop_privileges(&cfg).is_ok());
    }
}
