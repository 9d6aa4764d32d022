//! System restart requests.
//!
//! Handlers only record that a restart is needed; whoever owns the
//! process (the daemon loop, or a test) acts on it and reports back
//! through [`StateData::restart_completed`].

use crate::error::StateError;
use crate::state::{StateData, Status};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Task key set on waiting tasks once the restart they waited for happened.
pub const RESTART_DONE_KEY: &str = "restart-done";

/// Boot id the daemon last started under.
pub const BOOT_ID_KEY: &str = "boot-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartType {
    /// Reboot at the next convenient point
    System,
    /// Reboot immediately
    SystemNow,
    /// Restart only the daemon
    Daemon,
}

impl StateData {
    pub fn request_restart(&mut self, rt: RestartType) {
        info!("Restart requested: {:?}", rt);
        self.restart_requests.push(rt);
    }

    /// Restarts requested since the last completion, oldest first.
    pub fn pending_restarts(&self) -> &[RestartType] {
        &self.restart_requests
    }

    /// Records that the requested restart happened: waiting tasks go back
    /// to `Do` and are marked so their handlers can finish up.
    pub fn restart_completed(&mut self) {
        self.restart_requests.clear();
        let waiting: Vec<String> = self
            .tasks()
            .filter(|t| t.status() == Status::Wait)
            .map(|t| t.id().clone())
            .collect();
        for id in waiting {
            if let Ok(t) = self.task_mut(&id) {
                t.set_status(Status::Do);
                // A bool always serializes.
                let _ = t.set(RESTART_DONE_KEY, &true);
            }
        }
    }
}

impl StateData {
    /// Records the boot the process started in. A system restart counts as
    /// completed only when the boot id differs from the recorded one; a
    /// plain process restart keeps waiting tasks parked.
    pub fn boot_started(&mut self, boot_id: &str) -> Result<bool, StateError> {
        let last: Option<String> = self.get_opt(BOOT_ID_KEY)?;
        self.set(BOOT_ID_KEY, boot_id)?;
        match last {
            Some(last) if last != boot_id => {
                info!("System restarted, previous boot {}", last);
                self.restart_completed();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
