//! Configuration options recognized by the core (spec.md §6), loaded from
//! `supervisor.toml` and overridable by `SUPERVISOR_<OPTION>` environment
//! variables, mirroring the config-loading style the corpus uses.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    Restart,
    Terminate,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::Restart
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// 0 means "use detected cpu count" (spec §4.C initialize).
    pub worker_count: usize,
    pub worker_set_affinity: bool,
    pub worker_max_connections: u32,
    pub worker_rlimit_nofiles: u64,
    pub worker_accept_threshold: u32,
    pub worker_policy: RestartPolicy,
    pub http_request_limit: u32,
    pub runas_user: Option<String>,
    pub root_path: Option<String>,
    pub skip_runas: bool,
    pub skip_chroot: bool,
    pub keymgr_enabled: bool,
    pub acme_enabled: bool,
    pub reseed_interval_ms: u64,
    pub nlisteners: usize,
    /// Domains this server answers for, used to populate each network
    /// worker's TLS-context stub and to decide which domains a restarted
    /// worker requests certificates for on startup (spec §4.C restart
    /// semantics).
    pub domains: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 0,
            worker_set_affinity: true,
            worker_max_connections: 512,
            worker_rlimit_nofiles: 768,
            worker_accept_threshold: 16,
            worker_policy: RestartPolicy::default(),
            http_request_limit: 1024,
            runas_user: None,
            root_path: None,
            skip_runas: false,
            skip_chroot: false,
            keymgr_enabled: false,
            acme_enabled: false,
            reseed_interval_ms: 60_000,
            nlisteners: 1,
            domains: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg: Config = toml::from_str(&text)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env_only() -> anyhow::Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SUPERVISOR_WORKER_COUNT") {
            if let Ok(n) = v.parse() {
                self.worker_count = n;
            }
        }
        if let Ok(v) = std::env::var("SUPERVISOR_WORKER_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.worker_max_connections = n;
            }
        }
        if let Ok(v) = std::env::var("SUPERVISOR_WORKER_POLICY") {
            match v.as_str() {
                "restart" => self.worker_policy = RestartPolicy::Restart,
                "terminate" => self.worker_policy = RestartPolicy::Terminate,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("SUPERVISOR_RUNAS_USER") {
            self.runas_user = Some(v);
        }
        if let Ok(v) = std::env::var("SUPERVISOR_ROOT_PATH") {
            self.root_path = Some(v);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.skip_runas && self.runas_user.is_none() {
            anyhow::bail!("runas_user is required unless skip_runas is set");
        }
        if !self.skip_chroot && self.root_path.is_none() {
            anyhow::bail!("root_path is required unless skip_chroot is set");
        }
        Ok(())
    }
}
