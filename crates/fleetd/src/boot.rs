//! Boot environment access.
//!
//! The [`BootBackend`] trait is what the device manager needs from the
//! boot layer: the modeenv, recovery system bookkeeping, key resealing
//! and the static kernel command line. [`FsBoot`] keeps all of it as
//! files under one directory.

use crate::error::BootError;
use fleet_shared::{Model, ModelGrade, Unlocker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Boot environment of a system with recovery/run modes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Modeenv {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub recovery_system: String,
    #[serde(default)]
    pub current_recovery_systems: Vec<String>,
    #[serde(default)]
    pub good_recovery_systems: Vec<String>,
    #[serde(default)]
    pub brand_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub grade: String,
    /// Asset name to accepted hashes, current first
    #[serde(default)]
    pub current_trusted_boot_assets: BTreeMap<String, Vec<String>>,
    /// Current command line first, a pending candidate second
    #[serde(default)]
    pub current_kernel_command_lines: Vec<String>,
}

/// Model and mode the boot layer sees for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundDeviceContext {
    pub model: Model,
    pub system_mode: String,
}

impl GroundDeviceContext {
    pub fn new(model: Model, system_mode: &str) -> Self {
        Self {
            model,
            system_mode: system_mode.to_string(),
        }
    }
}

pub trait BootBackend: Send + Sync {
    /// Whether the system has a seed partition with recovery systems.
    fn has_system_seed(&self) -> Result<bool, BootError>;

    fn read_modeenv(&self) -> Result<Modeenv, BootError>;

    fn write_modeenv(&self, modeenv: &Modeenv) -> Result<(), BootError>;

    /// Creates a recovery system for `model` labelled `label`.
    fn create_recovery_system(&self, label: &str, model: &Model) -> Result<(), BootError>;

    fn mark_recovery_capable_system(&self, label: &str) -> Result<(), BootError>;

    /// Switches the boot environment from one model to another. Slow
    /// parts run with the state lock released through `unlocker`.
    fn device_change(
        &self,
        from: &GroundDeviceContext,
        to: &GroundDeviceContext,
        unlocker: &mut dyn Unlocker,
    ) -> Result<(), BootError>;

    /// Commits the boot that just happened as good.
    fn mark_boot_successful(&self) -> Result<(), BootError>;

    /// Reseals disk encryption keys against the boot chain in `modeenv`.
    fn reseal_keys(&self, modeenv: &Modeenv, force: bool) -> Result<(), BootError>;

    /// Bootloader-provided part of the kernel command line.
    fn static_command_line(&self, candidate: bool) -> Result<String, BootError>;
}

/// Static kernel arguments used when none are configured.
pub const DEFAULT_STATIC_ARGS: &str = "recovery_mode=run console=ttyS0 console=tty1 panic=-1";

/// File backed boot environment.
pub struct FsBoot {
    dir: PathBuf,
    static_args: String,
}

impl FsBoot {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            static_args: DEFAULT_STATIC_ARGS.to_string(),
        }
    }

    pub fn with_static_args(mut self, args: &str) -> Self {
        self.static_args = args.to_string();
        self
    }

    fn modeenv_path(&self) -> PathBuf {
        self.dir.join("modeenv.json")
    }

    fn systems_dir(&self) -> PathBuf {
        self.dir.join("systems")
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), BootError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| BootError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|source| BootError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| BootError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|s| s == item) {
        list.push(item.to_string());
    }
}

fn grade_str(grade: ModelGrade) -> String {
    if grade.is_set() {
        grade.to_string()
    } else {
        String::new()
    }
}

/// Reads the kernel's boot id, which is new on every boot.
pub fn read_boot_id(path: &Path) -> Result<String, BootError> {
    let id = fs::read_to_string(path).map_err(|source| BootError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let id = id.trim();
    if id.is_empty() {
        return Err(BootError::Parse(format!("empty boot id in {}", path.display())));
    }
    Ok(id.to_string())
}

impl BootBackend for FsBoot {
    fn has_system_seed(&self) -> Result<bool, BootError> {
        Ok(self.systems_dir().is_dir())
    }

    fn read_modeenv(&self) -> Result<Modeenv, BootError> {
        let path = self.modeenv_path();
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| BootError::Parse(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Modeenv::default()),
            Err(source) => Err(BootError::Read { path, source }),
        }
    }

    fn write_modeenv(&self, modeenv: &Modeenv) -> Result<(), BootError> {
        let data = serde_json::to_vec_pretty(modeenv).map_err(|e| BootError::Parse(e.to_string()))?;
        self.write_file(&self.modeenv_path(), &data)?;
        debug!("Wrote modeenv to {}", self.modeenv_path().display());
        Ok(())
    }

    fn create_recovery_system(&self, label: &str, model: &Model) -> Result<(), BootError> {
        let encoded = model.encode().map_err(|e| BootError::Other(e.to_string()))?;
        self.write_file(&self.systems_dir().join(label).join("model"), encoded.as_bytes())?;
        info!("Created recovery system {} for {}", label, model.key());
        Ok(())
    }

    fn mark_recovery_capable_system(&self, label: &str) -> Result<(), BootError> {
        let mut m = self.read_modeenv()?;
        push_unique(&mut m.current_recovery_systems, label);
        push_unique(&mut m.good_recovery_systems, label);
        self.write_modeenv(&m)
    }

    fn device_change(
        &self,
        _from: &GroundDeviceContext,
        to: &GroundDeviceContext,
        unlocker: &mut dyn Unlocker,
    ) -> Result<(), BootError> {
        let mut m = self.read_modeenv()?;
        m.brand_id = to.model.brand_id.clone();
        m.model = to.model.model.clone();
        m.grade = grade_str(to.model.grade);
        self.write_modeenv(&m)?;

        let mut res = Ok(());
        unlocker.run_unlocked(&mut || res = self.reseal_keys(&m, true));
        res
    }

    fn mark_boot_successful(&self) -> Result<(), BootError> {
        let mut m = self.read_modeenv()?;
        let before = m.clone();
        if m.current_kernel_command_lines.len() > 1 {
            m.current_kernel_command_lines.drain(..m.current_kernel_command_lines.len() - 1);
        }
        for hashes in m.current_trusted_boot_assets.values_mut() {
            if hashes.len() > 1 {
                hashes.drain(..hashes.len() - 1);
            }
        }
        if m != before {
            self.write_modeenv(&m)?;
        }
        Ok(())
    }

    fn reseal_keys(&self, modeenv: &Modeenv, force: bool) -> Result<(), BootError> {
        let record = serde_json::json!({
            "force": force,
            "trusted-boot-assets": modeenv.current_trusted_boot_assets,
            "kernel-command-lines": modeenv.current_kernel_command_lines,
        });
        self.write_file(&self.dir.join("sealed-keys.json"), record.to_string().as_bytes())?;
        info!("Resealed keys (force: {})", force);
        Ok(())
    }

    fn static_command_line(&self, _candidate: bool) -> Result<String, BootError> {
        Ok(self.static_args.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_shared::State;
    use tempfile::TempDir;

    fn model(grade: ModelGrade) -> Model {
        Model {
            brand_id: "canonical".to_string(),
            model: "pc-new".to_string(),
            grade,
            classic: false,
            gadget: "pc".to_string(),
            kernel: "pc-kernel".to_string(),
            base: "core20".to_string(),
            store: String::new(),
            revision: 1,
            timestamp: Utc::now(),
            required_snaps: vec![],
        }
    }

    #[test]
    fn test_missing_modeenv_is_default() {
        let tmp = TempDir::new().unwrap();
        let boot = FsBoot::new(tmp.path());
        assert_eq!(boot.read_modeenv().unwrap(), Modeenv::default());
        assert!(!boot.has_system_seed().unwrap());
    }

    #[test]
    fn test_mark_recovery_capable() {
        let tmp = TempDir::new().unwrap();
        let boot = FsBoot::new(tmp.path());
        boot.mark_recovery_capable_system("1234").unwrap();
        boot.mark_recovery_capable_system("1234").unwrap();
        let m = boot.read_modeenv().unwrap();
        assert_eq!(m.current_recovery_systems, vec!["1234".to_string()]);
        assert_eq!(m.good_recovery_systems, vec!["1234".to_string()]);
    }

    #[test]
    fn test_create_recovery_system_makes_seed() {
        let tmp = TempDir::new().unwrap();
        let boot = FsBoot::new(tmp.path());
        boot.create_recovery_system("1234", &model(ModelGrade::Dangerous)).unwrap();
        assert!(boot.has_system_seed().unwrap());
        assert!(tmp.path().join("systems/1234/model").exists());
    }

    #[test]
    fn test_device_change_writes_model_and_reseals() {
        let tmp = TempDir::new().unwrap();
        let boot = FsBoot::new(tmp.path());
        let st = State::new();
        let mut g = st.lock();
        let from = GroundDeviceContext::new(model(ModelGrade::Dangerous), "run");
        let to = GroundDeviceContext::new(model(ModelGrade::Signed), "run");
        boot.device_change(&from, &to, &mut g).unwrap();

        let m = boot.read_modeenv().unwrap();
        assert_eq!(m.model, "pc-new");
        assert_eq!(m.grade, "signed");
        assert!(tmp.path().join("sealed-keys.json").exists());
    }

    #[test]
    fn test_read_boot_id() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("boot_id");
        assert!(read_boot_id(&path).is_err());
        fs::write(&path, "").unwrap();
        assert!(matches!(read_boot_id(&path), Err(BootError::Parse(_))));
        fs::write(&path, "2f1f6b5c-boot\n").unwrap();
        assert_eq!(read_boot_id(&path).unwrap(), "2f1f6b5c-boot");
    }

    #[test]
    fn test_mark_boot_successful_commits_candidates() {
        let tmp = TempDir::new().unwrap();
        let boot = FsBoot::new(tmp.path());
        let mut m = Modeenv::default();
        m.current_kernel_command_lines = vec!["old".to_string(), "new".to_string()];
        m.current_trusted_boot_assets
            .insert("grubx64.efi".to_string(), vec!["a".to_string(), "b".to_string()]);
        boot.write_modeenv(&m).unwrap();

        boot.mark_boot_successful().unwrap();
        let m = boot.read_modeenv().unwrap();
        assert_eq!(m.current_kernel_command_lines, vec!["new".to_string()]);
        assert_eq!(m.current_trusted_boot_assets["grubx64.efi"], vec!["b".to_string()]);
    }
}
