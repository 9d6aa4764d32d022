//! Kernel command line updates driven by the gadget.
//!
//! The effective command line is the bootloader's static arguments, the
//! gadget's `cmdline.extra` (or a `cmdline.full` replacing everything),
//! user arguments the gadget allows, and on dangerous models any
//! dangerous arguments. A new line is added to the boot environment as a
//! candidate next to the current one and takes effect after a restart.

use crate::devicemgr::Inner;
use crate::error::{DeviceError, TaskError};
use crate::gadget::GadgetInfo;
use crate::handlers::{self, check_model_snap, SNAP_SETUP_KEY};
use crate::remodel;
use fleet_shared::restart::RESTART_DONE_KEY;
use fleet_shared::snap::{self, SnapSetup};
use fleet_shared::{Model, ModelGrade, RestartType, StateData, StateGuard, Status, TaskId};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const CMDLINE_EXTRA: &str = "cmdline.extra";
pub const CMDLINE_FULL: &str = "cmdline.full";

const APPEND_KEY: &str = "cmdline-append";
const DANGEROUS_APPEND_KEY: &str = "dangerous-cmdline-append";
const PREVIOUS_KEY: &str = "previous-cmdline";

/// Arguments a gadget contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GadgetCmdline {
    None,
    Extra(String),
    Full(String),
}

fn read_cmdline_file(path: &Path) -> Result<Option<String>, DeviceError> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let args: Vec<&str> = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .collect();
            Ok(Some(args.join(" ")))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DeviceError::Invalid(format!("cannot read {}: {}", path.display(), e))),
    }
}

/// Reads `cmdline.extra` / `cmdline.full` from a gadget directory.
pub fn gadget_cmdline(gadget_dir: &Path) -> Result<GadgetCmdline, DeviceError> {
    let extra = read_cmdline_file(&gadget_dir.join(CMDLINE_EXTRA))?;
    let full = read_cmdline_file(&gadget_dir.join(CMDLINE_FULL))?;
    match (extra, full) {
        (Some(_), Some(_)) => Err(DeviceError::Invalid(
            "cannot support both extra and full kernel command line".to_string(),
        )),
        (Some(extra), None) => Ok(GadgetCmdline::Extra(extra)),
        (None, Some(full)) => Ok(GadgetCmdline::Full(full)),
        (None, None) => Ok(GadgetCmdline::None),
    }
}

/// Whether `arg` matches an allow-list entry. `name=*` allows any value.
fn is_allowed(arg: &str, allow: &[String]) -> bool {
    allow.iter().any(|a| {
        if a == arg {
            return true;
        }
        match (a.strip_suffix("=*"), arg.split_once('=')) {
            (Some(name), Some((arg_name, _))) => name == arg_name,
            _ => false,
        }
    })
}

/// Splits `args` into allowed and rejected arguments. Without an allow
/// list everything is allowed.
pub fn filter_allowed(args: &str, allow: &[String]) -> (Vec<String>, Vec<String>) {
    args.split_whitespace()
        .map(str::to_string)
        .partition(|a| allow.is_empty() || is_allowed(a, allow))
}

pub fn compose_command_line(
    static_args: &str,
    gadget: &GadgetCmdline,
    allow: &[String],
    append: &str,
    dangerous: &str,
    grade: ModelGrade,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    match gadget {
        GadgetCmdline::Full(full) => parts.push(full.clone()),
        GadgetCmdline::Extra(extra) => {
            parts.push(static_args.to_string());
            parts.push(extra.clone());
        }
        GadgetCmdline::None => parts.push(static_args.to_string()),
    }

    let (allowed, rejected) = filter_allowed(append, allow);
    if !rejected.is_empty() {
        warn!("Kernel command line arguments not allowed by the gadget: {}", rejected.join(" "));
    }
    parts.extend(allowed);

    if grade == ModelGrade::Dangerous {
        parts.extend(dangerous.split_whitespace().map(str::to_string));
    } else if !dangerous.trim().is_empty() {
        warn!("Ignoring dangerous kernel command line arguments on a {} model", grade);
    }

    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

/// Command line for the gadget at `gadget_dir` plus the given user arguments.
fn command_line_for(
    inner: &Inner,
    gadget_dir: &Path,
    append: &str,
    dangerous: &str,
    grade: ModelGrade,
) -> Result<String, DeviceError> {
    let info = GadgetInfo::read(gadget_dir).map_err(|e| DeviceError::CandidateGadget(e.to_string()))?;
    let gadget = gadget_cmdline(gadget_dir)?;
    let static_args = inner.boot.static_command_line(true)?;
    Ok(compose_command_line(
        &static_args,
        &gadget,
        &info.kernel_cmdline.allow,
        append,
        dangerous,
        grade,
    ))
}

/// Command line of the installed gadget, or the static arguments alone
/// before any gadget is installed.
fn installed_command_line(inner: &Inner, st: &StateData, model: &Model) -> Result<String, DeviceError> {
    match handlers::current_gadget_data(inner, st, model)? {
        Some(current) => command_line_for(inner, &current.root_dir, "", "", model.grade),
        None => Ok(inner.boot.static_command_line(false)?),
    }
}

pub(crate) fn do_update_gadget_cmdline(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    if inner.config.daemon.is_plain_classic() {
        return Err(TaskError::Failed(
            "cannot run update gadget command line task on a classic system".to_string(),
        ));
    }

    let t = st.task(id)?;
    if t.get_opt::<bool>(RESTART_DONE_KEY)?.unwrap_or(false) {
        return Ok(());
    }
    let snapsup: SnapSetup = t.get(SNAP_SETUP_KEY)?;
    let append: String = t.get_opt(APPEND_KEY)?.unwrap_or_default();
    let dangerous: String = t.get_opt(DANGEROUS_APPEND_KEY)?.unwrap_or_default();

    let model = remodel::device_ctx(inner, st, id)?.model;
    check_model_snap(&model, &snapsup)?;

    let gadget_dir = snap::mount_dir(&inner.config.paths.snap_mount_dir, snapsup.instance_name(), snapsup.revision());
    let new = command_line_for(inner, &gadget_dir, &append, &dangerous, model.grade)?;

    let mut modeenv = inner.boot.read_modeenv().map_err(DeviceError::from)?;
    let old = match modeenv.current_kernel_command_lines.first() {
        Some(line) => line.clone(),
        None => installed_command_line(inner, st, &model)?,
    };
    if new == old {
        st.task_mut(id)?.logf("No kernel command line update needed");
        return Ok(());
    }
    modeenv.current_kernel_command_lines = vec![old.clone(), new.clone()];
    inner.boot.write_modeenv(&modeenv).map_err(DeviceError::from)?;
    info!("Kernel command line candidate: {}", new);

    let t = st.task_mut(id)?;
    t.set(PREVIOUS_KEY, &old)?;
    t.logf("Updated kernel command line");
    t.logf("Task set to wait until a system restart allows to continue");
    t.set_status(Status::Wait);
    if !inner.config.daemon.classic {
        st.request_restart(RestartType::System);
    }
    Ok(())
}

pub(crate) fn undo_update_gadget_cmdline(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    let previous: Option<String> = st.task(id)?.get_opt(PREVIOUS_KEY)?;
    let previous = match previous {
        Some(p) => p,
        None => {
            let model = remodel::device_ctx(inner, st, id)?.model;
            let Some(current) = handlers::current_gadget_data(inner, st, &model)? else {
                return Ok(());
            };
            command_line_for(inner, &current.root_dir, "", "", model.grade)?
        }
    };

    let mut modeenv = inner.boot.read_modeenv().map_err(DeviceError::from)?;
    let current = modeenv.current_kernel_command_lines.first().cloned().unwrap_or_default();
    if current == previous {
        // the candidate was never booted; just drop it
        if modeenv.current_kernel_command_lines.len() > 1 {
            modeenv.current_kernel_command_lines = vec![previous];
            inner.boot.write_modeenv(&modeenv).map_err(DeviceError::from)?;
        }
        return Ok(());
    }

    modeenv.current_kernel_command_lines = vec![current, previous];
    inner.boot.write_modeenv(&modeenv).map_err(DeviceError::from)?;
    let t = st.task_mut(id)?;
    t.logf("Reverted kernel command line");
    if inner.config.daemon.classic {
        t.logf("Skipping automatic restart on classic system");
        return Ok(());
    }
    st.request_restart(RestartType::System);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATIC: &str = "snapd_recovery_mode=run console=ttyS0";

    #[test]
    fn test_compose_static_only() {
        let line = compose_command_line(STATIC, &GadgetCmdline::None, &[], "", "", ModelGrade::Signed);
        assert_eq!(line, STATIC);
    }

    #[test]
    fn test_compose_extra_and_full() {
        let extra = GadgetCmdline::Extra("quiet splash".to_string());
        assert_eq!(
            compose_command_line(STATIC, &extra, &[], "", "", ModelGrade::Signed),
            format!("{} quiet splash", STATIC)
        );
        let full = GadgetCmdline::Full("console=ttyS1".to_string());
        assert_eq!(
            compose_command_line(STATIC, &full, &[], "", "", ModelGrade::Signed),
            "console=ttyS1"
        );
    }

    #[test]
    fn test_append_filtered_by_allow_list() {
        let allow = vec!["par1=val".to_string(), "par2".to_string(), "opt=*".to_string()];
        let line = compose_command_line(
            STATIC,
            &GadgetCmdline::None,
            &allow,
            "par1=val par1=other par2 opt=anything rogue",
            "",
            ModelGrade::Signed,
        );
        assert_eq!(line, format!("{} par1=val par2 opt=anything", STATIC));
    }

    #[test]
    fn test_dangerous_only_on_dangerous_grade() {
        let signed = compose_command_line(STATIC, &GadgetCmdline::None, &[], "", "debug", ModelGrade::Signed);
        assert_eq!(signed, STATIC);
        let dangerous = compose_command_line(STATIC, &GadgetCmdline::None, &[], "", "debug", ModelGrade::Dangerous);
        assert_eq!(dangerous, format!("{} debug", STATIC));
    }

    #[test]
    fn test_gadget_cmdline_files() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(gadget_cmdline(tmp.path()).unwrap(), GadgetCmdline::None);

        fs::write(tmp.path().join(CMDLINE_EXTRA), "# comment\nquiet\n  splash\n").unwrap();
        assert_eq!(
            gadget_cmdline(tmp.path()).unwrap(),
            GadgetCmdline::Extra("quiet splash".to_string())
        );

        fs::write(tmp.path().join(CMDLINE_FULL), "console=ttyS0\n").unwrap();
        let err = gadget_cmdline(tmp.path()).unwrap_err();
        assert_eq!(err.to_string(), "cannot support both extra and full kernel command line");
    }
}
