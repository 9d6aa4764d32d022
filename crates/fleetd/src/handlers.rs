//! Gadget and kernel asset update tasks.
//!
//! The task compares the gadget layout of the installed revision with the
//! candidate one, backs up and writes the selected boot structures, then
//! waits for a restart into the new assets. The rollback directory is
//! only removed once the task completes; a failed update leaves it behind
//! for inspection.

use crate::assets::TrustedAssetsUpdateObserver;
use crate::devicemgr::Inner;
use crate::error::{DeviceError, TaskError};
use crate::gadget::{
    default_update_policy, kernel_update_policy, ContentObserver, GadgetData, GadgetInfo, UpdatePolicy,
};
use crate::remodel;
use fleet_shared::restart::RESTART_DONE_KEY;
use fleet_shared::snap::{self, SideInfo, SnapInfo, SnapSetup, SnapType};
use fleet_shared::{Model, RestartType, StateData, StateGuard, Status, Task, TaskId};
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const UPDATE_GADGET_ASSETS: &str = "update-gadget-assets";
pub const UPDATE_GADGET_CMDLINE: &str = "update-gadget-cmdline";

pub(crate) const SNAP_SETUP_KEY: &str = "snap-setup";
const ROLLBACK_DIR_KEY: &str = "rollback-dir";
const RESTART_REQUIRED_KEY: &str = "gadget-restart-required";

fn current_side_info(st: &StateData, name: &str) -> Result<Option<SideInfo>, DeviceError> {
    Ok(snap::snap_state(st, name)?.and_then(|s| s.current_side_info().cloned()))
}

/// Gadget data of the installed gadget revision, `None` when no gadget is
/// installed yet.
pub(crate) fn current_gadget_data(inner: &Inner, st: &StateData, model: &Model) -> Result<Option<GadgetData>, DeviceError> {
    let Some(si) = current_side_info(st, &model.gadget)? else {
        return Ok(None);
    };
    let mount_root = &inner.config.paths.snap_mount_dir;
    let root_dir = snap::mount_dir(mount_root, &si.real_name, si.revision);
    let info = GadgetInfo::read(&root_dir).map_err(|e| DeviceError::CurrentGadget(e.to_string()))?;
    let kernel_root_dir = current_side_info(st, &model.kernel)?
        .map(|k| snap::mount_dir(mount_root, &k.real_name, k.revision));
    Ok(Some(GadgetData {
        info,
        root_dir,
        kernel_root_dir,
    }))
}

/// Gadget data of a candidate gadget revision, read from its unpacked
/// content without activating it.
pub(crate) fn pending_gadget_data(inner: &Inner, side_info: &SideInfo, kernel_root_dir: Option<PathBuf>) -> Result<GadgetData, DeviceError> {
    let mount_root = &inner.config.paths.snap_mount_dir;
    let info = SnapInfo::read(mount_root, side_info).map_err(|e| DeviceError::CandidateGadget(e.to_string()))?;
    let gadget = GadgetInfo::read(&info.mount_dir)
        .map_err(|e| DeviceError::CandidateGadget(format!("cannot read candidate snap gadget metadata: {}", e)))?;
    Ok(GadgetData {
        info: gadget,
        root_dir: info.mount_dir,
        kernel_root_dir,
    })
}

fn snap_kind(snap_type: SnapType) -> &'static str {
    match snap_type {
        SnapType::Kernel => "kernel",
        _ => "gadget",
    }
}

/// Fails unless `snapsup` is the gadget (or kernel) the model names.
pub(crate) fn check_model_snap(model: &Model, snapsup: &SnapSetup) -> Result<(), TaskError> {
    let (kind, expected) = match snapsup.snap_type {
        SnapType::Kernel => ("kernel", &model.kernel),
        _ => ("gadget", &model.gadget),
    };
    if snapsup.instance_name() != expected {
        return Err(TaskError::Failed(format!(
            "cannot apply {} assets update from non-model {} snap {:?}, expected {:?} snap",
            kind,
            kind,
            snapsup.instance_name(),
            expected
        )));
    }
    Ok(())
}

fn remove_rollback_dir(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove gadget rollback directory {}: {}", dir.display(), e),
    }
}

pub(crate) fn do_update_gadget_assets(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    if inner.config.daemon.is_plain_classic() {
        return Err(TaskError::Failed(
            "cannot run update gadget assets task on a classic system".to_string(),
        ));
    }

    let t = st.task(id)?;
    let snapsup: SnapSetup = t.get(SNAP_SETUP_KEY)?;
    if t.get_opt::<bool>(RESTART_DONE_KEY)?.unwrap_or(false) {
        if let Some(dir) = t.get_opt::<PathBuf>(ROLLBACK_DIR_KEY)? {
            remove_rollback_dir(&dir);
        }
        return Ok(());
    }

    let dctx = remodel::device_ctx(inner, st, id)?;
    let model = dctx.model;
    check_model_snap(&model, &snapsup)?;

    let Some(current) = current_gadget_data(inner, st, &model)? else {
        info!("No current gadget, skipping gadget assets update");
        return Ok(());
    };

    let mount_root = &inner.config.paths.snap_mount_dir;
    let (update, policy): (GadgetData, UpdatePolicy) = match snapsup.snap_type {
        SnapType::Kernel => {
            let kernel = SnapInfo::read(mount_root, &snapsup.side_info)
                .map_err(|e| DeviceError::CandidateKernel(e.to_string()))?;
            let update = GadgetData {
                kernel_root_dir: Some(kernel.mount_dir),
                ..current.clone()
            };
            (update, kernel_update_policy as UpdatePolicy)
        }
        _ => {
            let update = pending_gadget_data(inner, &snapsup.side_info, current.kernel_root_dir.clone())?;
            (update, default_update_policy as UpdatePolicy)
        }
    };

    let rollback_dir = inner
        .config
        .paths
        .rollback_dir
        .join(format!("{}_{}", snapsup.instance_name(), snapsup.revision()));
    DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(&rollback_dir)
        .map_err(|e| TaskError::Failed(format!("cannot prepare update rollback directory: {}", e)))?;

    let observer = TrustedAssetsUpdateObserver::for_model(&model, &update.info, inner.boot.clone())
        .map(|o| o as Arc<dyn ContentObserver>);

    let gadget = inner.gadget.clone();
    let res = st.unlocked(|| gadget.update(&model, &current, &update, &rollback_dir, policy, observer));
    match res {
        Err(e) if e.is_no_update() => {
            st.task_mut(id)?.logf("No gadget assets update needed");
            info!("No {} assets update needed", snap_kind(snapsup.snap_type));
            remove_rollback_dir(&rollback_dir);
            return Ok(());
        }
        Err(e) => {
            return Err(TaskError::Failed(format!(
                "cannot update {} assets: {}",
                snap_kind(snapsup.snap_type),
                e
            )))
        }
        Ok(()) => {}
    }

    let t = st.task_mut(id)?;
    let chg = t.change().cloned();
    t.set(ROLLBACK_DIR_KEY, &rollback_dir)?;
    t.logf(format!("Updated {} assets", snap_kind(snapsup.snap_type)));
    t.logf("Task set to wait until a system restart allows to continue");
    t.set_status(Status::Wait);
    if let Some(chg) = chg {
        st.change_mut(&chg)?.set(RESTART_REQUIRED_KEY, &true)?;
    }
    st.request_restart(RestartType::System);
    Ok(())
}

fn is_gadget_update(kind: &str) -> bool {
    kind == UPDATE_GADGET_ASSETS || kind == UPDATE_GADGET_CMDLINE
}

/// Gadget updates run alone: a gadget update waits for every running
/// task, and nothing starts while a gadget update runs.
pub fn gadget_update_blocked(candidate: &Task, running: &[&Task]) -> bool {
    if is_gadget_update(candidate.kind()) {
        return !running.is_empty();
    }
    running.iter().any(|t| is_gadget_update(t.kind()))
}
