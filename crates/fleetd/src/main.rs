//! fleetd - device identity and remodel daemon
//!
//! Registers the device, runs remodels and keeps boot assets in step with
//! the installed gadget.

use anyhow::{Context, Result};
use fleet_shared::State;
use fleetd::boot;
use fleetd::config::Config;
use fleetd::{Backends, DeviceManager, TaskRunner};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn load_state(path: &Path) -> Result<State> {
    match fs::read(path) {
        Ok(data) => State::from_checkpoint(&data).with_context(|| format!("cannot load state from {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No state at {}, starting fresh", path.display());
            Ok(State::new())
        }
        Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
    }
}

fn write_state(state: &State, path: &Path) -> Result<()> {
    let data = state.checkpoint()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level)))
        .init();

    info!("fleetd v{} starting", env!("CARGO_PKG_VERSION"));

    let state_file = config.paths.state_file.clone();
    let state = load_state(&state_file)?;
    match boot::read_boot_id(&config.paths.boot_id_file) {
        Ok(boot_id) => {
            let mut st = state.lock();
            if st.boot_started(&boot_id)? {
                info!("Restart completed");
            }
        }
        Err(e) => warn!("Cannot tell whether the system restarted: {}", e),
    }

    let interval = Duration::from_secs(config.daemon.ensure_interval_secs.max(1));
    let mut runner = TaskRunner::new(state.clone());
    let backends = Backends::system(&config);
    let manager = DeviceManager::new(state.clone(), config, backends, &mut runner);

    info!("fleetd ready");

    loop {
        if let Err(e) = manager.ensure() {
            warn!("{}", e);
        }
        let runs = runner.ensure();
        if runs > 0 {
            info!("Ran {} task(s)", runs);
        }
        if let Err(e) = write_state(&state, &state_file) {
            error!("Cannot write state: {:#}", e);
        }

        let next = {
            let mut st = state.lock();
            if !st.pending_restarts().is_empty() {
                warn!("Restart pending: {:?}", st.pending_restarts());
            }
            st.take_ensure_before().map_or(interval, |d| d.min(interval))
        };

        tokio::select! {
            _ = tokio::time::sleep(next.max(Duration::from_millis(100))) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down gracefully");
                break;
            }
        }
    }

    manager.stop();
    write_state(&state, &state_file)?;
    Ok(())
}
