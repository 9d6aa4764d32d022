//! Reseal coordinator.
//!
//! Resealing binds the disk encryption keys to the boot chain recorded in
//! the boot environment. A failure is always a task error: keys sealed to
//! the wrong chain can leave the device unbootable.

use crate::devicemgr::Inner;
use crate::error::{DeviceError, TaskError};
use fleet_shared::{RestartType, StateGuard, TaskId};
use tracing::info;

pub const RESEAL_KEYS: &str = "reseal-keys";

/// Task key asking for an immediate restart once resealed.
pub const REBOOT_AFTER_KEY: &str = "reboot-after";

pub(crate) fn do_reseal_keys(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    let reboot_after = st.task(id)?.get_opt::<bool>(REBOOT_AFTER_KEY)?.unwrap_or(false);
    let boot = inner.boot.clone();
    let modeenv = boot.read_modeenv().map_err(DeviceError::from)?;

    st.unlocked(|| boot.reseal_keys(&modeenv, true))
        .map_err(|e| TaskError::Failed(format!("cannot reseal keys: {}", e)))?;
    st.task_mut(id)?.logf("Resealed disk encryption keys");
    info!("Resealed disk encryption keys");

    if reboot_after {
        st.request_restart(RestartType::SystemNow);
    }
    Ok(())
}
