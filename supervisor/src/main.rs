//! Supervisor entry point: parses CLI args, loads configuration, and runs
//! the parent process to completion (spec §4.C `initialize`/`run`/
//! `shutdown`).
//!
//! The HTTP/TLS pipeline each network worker drives is an external
//! collaborator spec.md names only by interface (§1 "Out of scope"); this
//! binary wires in `network::NullNetworkApp`, a no-op stand-in satisfying
//! `NetworkWorkerApp` so the worker round can actually run end to end
//! without a real listener. A production deployment replaces the factory
//! closure below with one that builds the real HTTP/TLS app.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use supervisor::config::Config;
use supervisor::network::{self, NullNetworkApp};
use supervisor::process::{NetworkAppFactory, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "supervisor", about = "Worker supervision and accept-arbitration core")]
struct Cli {
    /// Path to supervisor.toml. If omitted, defaults are used (overridable
    /// via SUPERVISOR_<OPTION> environment variables).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let cfg = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!(target: "supervisor::main", "configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg) {
        log::error!(target: "supervisor::main", "fatal: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env_only(),
    }
}

fn run(cfg: Config) -> anyhow::Result<()> {
    log::info!(target: "supervisor::main", "starting with worker_count={} policy={:?}", cfg.worker_count, cfg.worker_policy);

    let factory: NetworkAppFactory = Arc::new(|id, cpu| {
        log::debug!(target: "supervisor::main", "building network app for worker {id} (cpu {cpu})");
        Box::new(NullNetworkApp::default()) as Box<dyn network::NetworkWorkerApp>
    });

    let supervisor = Supervisor::initialize(cfg, factory)?;
    supervisor.run()?;

    log::info!(target: "supervisor::main", "shutdown complete");
    Ok(())
}
