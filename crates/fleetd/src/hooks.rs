//! Snap hook execution.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("cannot run hook {hook:?} of snap {snap:?}: {msg}")]
    Failed { snap: String, hook: String, msg: String },
}

/// Which hook of which snap a "run-hook" task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HookSetup {
    pub snap: String,
    pub hook: String,
    /// Missing hook executables are not an error
    #[serde(default)]
    pub optional: bool,
}

pub trait HookRunner: Send + Sync {
    /// Runs the hook from the snap mounted at `mount_dir`. Slow; call unlocked.
    fn run_hook(&self, setup: &HookSetup, mount_dir: &Path) -> Result<(), HookError>;
}

/// Runs `meta/hooks/<hook>` as a child process.
pub struct ExecHookRunner;

impl HookRunner for ExecHookRunner {
    fn run_hook(&self, setup: &HookSetup, mount_dir: &Path) -> Result<(), HookError> {
        let fail = |msg: String| HookError::Failed {
            snap: setup.snap.clone(),
            hook: setup.hook.clone(),
            msg,
        };
        let path = mount_dir.join("meta").join("hooks").join(&setup.hook);
        if !path.exists() {
            if setup.optional {
                return Ok(());
            }
            return Err(fail(format!("missing {}", path.display())));
        }
        info!("Running hook {} of snap {}", setup.hook, setup.snap);
        let status = Command::new(&path)
            .env("SNAP", mount_dir)
            .env("SNAP_NAME", &setup.snap)
            .status()
            .map_err(|e| fail(e.to_string()))?;
        if !status.success() {
            return Err(fail(format!("exited with {}", status)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_optional_missing_hook() {
        let tmp = TempDir::new().unwrap();
        let mut setup = HookSetup {
            snap: "pc".to_string(),
            hook: "prepare-device".to_string(),
            optional: true,
        };
        assert!(ExecHookRunner.run_hook(&setup, tmp.path()).is_ok());

        setup.optional = false;
        let err = ExecHookRunner.run_hook(&setup, tmp.path()).unwrap_err();
        assert!(err.to_string().starts_with("cannot run hook \"prepare-device\" of snap \"pc\""));
    }
}
