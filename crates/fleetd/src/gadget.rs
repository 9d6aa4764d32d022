//! Gadget volume layout and the asset update engine.
//!
//! A gadget declares volumes made of structures in `meta/gadget.yaml`.
//! An update compares the current and candidate layouts structure by
//! structure, lets a policy pick which ones to write, backs them all up
//! into a rollback directory, then writes them, rolling back on failure.

use crate::error::GadgetError;
use fleet_shared::Model;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const GADGET_YAML: &str = "meta/gadget.yaml";

/// Prefix of content sources provided by the kernel snap.
pub const KERNEL_REF_PREFIX: &str = "$kernel:";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GadgetInfo {
    #[serde(default)]
    pub volumes: BTreeMap<String, Volume>,
    #[serde(default, rename = "kernel-cmdline")]
    pub kernel_cmdline: KernelCmdline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub bootloader: String,
    #[serde(default)]
    pub structure: Vec<VolumeStructure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeStructure {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub filesystem: String,
    #[serde(default)]
    pub size: Option<serde_yaml::Value>,
    #[serde(default)]
    pub content: Vec<VolumeContent>,
    #[serde(default)]
    pub update: VolumeUpdate,
}

impl VolumeStructure {
    /// Raw structure without a filesystem.
    pub fn is_bare(&self) -> bool {
        self.filesystem.is_empty() || self.filesystem == "none"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeContent {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeUpdate {
    #[serde(default)]
    pub edition: u32,
    #[serde(default)]
    pub preserve: Vec<String>,
}

/// Kernel command line arguments the gadget lets users append.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelCmdline {
    #[serde(default)]
    pub allow: Vec<String>,
}

impl GadgetInfo {
    pub fn from_yaml(data: &[u8], path: &Path) -> Result<Self, GadgetError> {
        let info: GadgetInfo = serde_yaml::from_slice(data).map_err(|source| GadgetError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        info.validate()?;
        Ok(info)
    }

    /// Reads `meta/gadget.yaml` from a gadget snap directory.
    pub fn read(gadget_dir: &Path) -> Result<Self, GadgetError> {
        let path = gadget_dir.join(GADGET_YAML);
        let data = fs::read(&path).map_err(|source| GadgetError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml(&data, &path)
    }

    fn validate(&self) -> Result<(), GadgetError> {
        if self.volumes.is_empty() {
            return Err(GadgetError::Invalid("no volumes defined".to_string()));
        }
        let with_bootloader = self.volumes.values().filter(|v| !v.bootloader.is_empty()).count();
        if with_bootloader > 1 {
            return Err(GadgetError::Invalid(
                "too many volumes with a bootloader".to_string(),
            ));
        }
        for (name, vol) in &self.volumes {
            for s in &vol.structure {
                for c in &s.content {
                    if s.is_bare() && !c.source.is_empty() {
                        return Err(GadgetError::Invalid(format!(
                            "invalid volume {:?}: structure {:?} without filesystem cannot have file content",
                            name, s.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn bootloader(&self) -> Option<&str> {
        self.volumes
            .values()
            .map(|v| v.bootloader.as_str())
            .find(|b| !b.is_empty())
    }
}

/// Gadget layout plus where its content lives on disk.
#[derive(Debug, Clone)]
pub struct GadgetData {
    pub info: GadgetInfo,
    pub root_dir: PathBuf,
    /// Kernel snap directory used to resolve `$kernel:` sources
    pub kernel_root_dir: Option<PathBuf>,
}

/// A structure chosen for update.
#[derive(Debug, Clone)]
pub struct LaidOutStructure {
    pub volume: String,
    pub index: usize,
    pub structure: VolumeStructure,
}

/// Decides whether a structure goes from `from` to `to`.
pub type UpdatePolicy = fn(&VolumeStructure, &VolumeStructure) -> bool;

/// Update when the candidate bumps the structure edition.
pub fn default_update_policy(from: &VolumeStructure, to: &VolumeStructure) -> bool {
    to.update.edition > from.update.edition
}

/// Update structures carrying kernel-provided content, whatever the edition.
pub fn kernel_update_policy(_from: &VolumeStructure, to: &VolumeStructure) -> bool {
    to.content.iter().any(|c| c.source.starts_with(KERNEL_REF_PREFIX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOperation {
    Update,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentChangeAction {
    Apply,
    Ignore,
}

/// A file about to change: its backup (if it existed) and new content.
#[derive(Debug, Clone)]
pub struct ContentChange {
    pub before: Option<PathBuf>,
    pub after: PathBuf,
}

/// Watches file writes of an update.
pub trait ContentObserver: Send + Sync {
    /// Called for each file in the backup phase (`Update`) and when a
    /// written file is restored (`Rollback`).
    fn observe(
        &self,
        op: ContentOperation,
        structure: &VolumeStructure,
        root: &Path,
        relative_target: &str,
        change: &ContentChange,
    ) -> Result<ContentChangeAction, GadgetError>;

    /// Called once after all backups and before the first write.
    fn before_write(&self) -> Result<(), GadgetError>;

    /// Called when the update failed and was rolled back.
    fn canceled(&self) -> Result<(), GadgetError>;
}

pub trait StructureUpdater {
    fn backup(&mut self) -> Result<(), GadgetError>;
    fn update(&mut self) -> Result<(), GadgetError>;
    fn rollback(&mut self) -> Result<(), GadgetError>;
}

pub trait StructureUpdaterFactory: Send + Sync {
    fn updater_for(
        &self,
        ps: &LaidOutStructure,
        update: &GadgetData,
        rollback_dir: &Path,
        observer: Option<Arc<dyn ContentObserver>>,
    ) -> Result<Box<dyn StructureUpdater>, GadgetError>;
}

/// Applies a gadget update. `Err(GadgetError::NoUpdate)` when nothing to do.
pub trait GadgetUpdater: Send + Sync {
    fn update(
        &self,
        model: &Model,
        current: &GadgetData,
        update: &GadgetData,
        rollback_dir: &Path,
        policy: UpdatePolicy,
        observer: Option<Arc<dyn ContentObserver>>,
    ) -> Result<(), GadgetError>;
}

/// Compares layouts and drives one structure updater per selected structure.
pub struct LayoutUpdater {
    factory: Arc<dyn StructureUpdaterFactory>,
}

impl LayoutUpdater {
    pub fn new(factory: Arc<dyn StructureUpdaterFactory>) -> Self {
        Self { factory }
    }
}

fn select_structures(
    current: &GadgetInfo,
    update: &GadgetInfo,
    policy: UpdatePolicy,
) -> Result<Vec<LaidOutStructure>, GadgetError> {
    let mut selected = Vec::new();
    for (vname, new_vol) in &update.volumes {
        let old_vol = current.volumes.get(vname).ok_or_else(|| {
            GadgetError::Invalid(format!("cannot find entry for volume {:?} in current gadget", vname))
        })?;
        if old_vol.structure.len() != new_vol.structure.len() {
            return Err(GadgetError::Invalid(format!(
                "cannot change the number of structures within volume {:?} from {} to {}",
                vname,
                old_vol.structure.len(),
                new_vol.structure.len()
            )));
        }
        for (index, (from, to)) in old_vol.structure.iter().zip(&new_vol.structure).enumerate() {
            if from.name != to.name {
                return Err(GadgetError::Invalid(format!(
                    "cannot change structure #{} name from {:?} to {:?}",
                    index, from.name, to.name
                )));
            }
            if from.filesystem != to.filesystem {
                return Err(GadgetError::Invalid(format!(
                    "cannot change filesystem of structure {:?} from {:?} to {:?}",
                    to.name, from.filesystem, to.filesystem
                )));
            }
            if policy(from, to) {
                selected.push(LaidOutStructure {
                    volume: vname.clone(),
                    index,
                    structure: to.clone(),
                });
            }
        }
    }
    Ok(selected)
}

impl GadgetUpdater for LayoutUpdater {
    fn update(
        &self,
        model: &Model,
        current: &GadgetData,
        update: &GadgetData,
        rollback_dir: &Path,
        policy: UpdatePolicy,
        observer: Option<Arc<dyn ContentObserver>>,
    ) -> Result<(), GadgetError> {
        let selected = select_structures(&current.info, &update.info, policy)?;
        if selected.is_empty() {
            return Err(GadgetError::NoUpdate);
        }
        debug!("Updating {} gadget structures for {}", selected.len(), model.key());

        let mut updaters = Vec::with_capacity(selected.len());
        for ps in &selected {
            updaters.push(self.factory.updater_for(ps, update, rollback_dir, observer.clone())?);
        }

        for u in updaters.iter_mut() {
            u.backup()?;
        }

        if let Some(obs) = &observer {
            obs.before_write()?;
        }

        let mut failed = None;
        let mut updated = 0;
        for (i, u) in updaters.iter_mut().enumerate() {
            match u.update() {
                Ok(()) => updated += 1,
                Err(e) if e.is_no_update() => {}
                Err(e) => {
                    failed = Some((i, e));
                    break;
                }
            }
        }
        if let Some((i, err)) = failed {
            warn!("Gadget update failed, rolling back: {}", err);
            for u in updaters[..=i].iter_mut().rev() {
                if let Err(e) = u.rollback() {
                    warn!("Cannot roll back structure: {}", e);
                }
            }
            if let Some(obs) = &observer {
                if let Err(e) = obs.canceled() {
                    warn!("Cannot cancel content observer: {}", e);
                }
            }
            return Err(err);
        }

        if updated == 0 {
            info!("Gadget structure content is unchanged");
            return Err(GadgetError::NoUpdate);
        }
        info!("Updated {} gadget structures", updated);
        Ok(())
    }
}

/// Builds filesystem updaters for structures mounted at known places.
#[derive(Default)]
pub struct MountedFilesystemFactory {
    /// Keyed by structure role, or by name when the role is empty
    mounts: BTreeMap<String, PathBuf>,
}

impl MountedFilesystemFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mount(mut self, role_or_name: &str, dir: impl Into<PathBuf>) -> Self {
        self.mounts.insert(role_or_name.to_string(), dir.into());
        self
    }
}

impl StructureUpdaterFactory for MountedFilesystemFactory {
    fn updater_for(
        &self,
        ps: &LaidOutStructure,
        update: &GadgetData,
        rollback_dir: &Path,
        observer: Option<Arc<dyn ContentObserver>>,
    ) -> Result<Box<dyn StructureUpdater>, GadgetError> {
        let name = ps.structure.name.clone();
        if ps.structure.is_bare() {
            return Err(GadgetError::Prepare {
                name,
                msg: "raw structure updates are not supported".to_string(),
            });
        }
        let mount = self
            .mounts
            .get(&ps.structure.role)
            .or_else(|| self.mounts.get(&ps.structure.name))
            .ok_or_else(|| GadgetError::Prepare {
                name: name.clone(),
                msg: "structure is not mounted".to_string(),
            })?;
        Ok(Box::new(FilesystemUpdater {
            ps: ps.clone(),
            gadget_root: update.root_dir.clone(),
            kernel_root: update.kernel_root_dir.clone(),
            mount: mount.clone(),
            backup_dir: rollback_dir.join(format!("struct-{}-{}", ps.volume, ps.index)),
            observer,
            planned: Vec::new(),
            written: Vec::new(),
        }))
    }
}

struct PlannedWrite {
    src: PathBuf,
    dst: PathBuf,
    rel: String,
    backup: Option<PathBuf>,
    skip: bool,
}

struct FilesystemUpdater {
    ps: LaidOutStructure,
    gadget_root: PathBuf,
    kernel_root: Option<PathBuf>,
    mount: PathBuf,
    backup_dir: PathBuf,
    observer: Option<Arc<dyn ContentObserver>>,
    planned: Vec<PlannedWrite>,
    written: Vec<usize>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> GadgetError + '_ {
    move |source| GadgetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn collect_files(dir: &Path, prefix: &Path, out: &mut Vec<PathBuf>) -> Result<(), GadgetError> {
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        let rel = prefix.join(entry.file_name());
        if path.is_dir() {
            collect_files(&path, &rel, out)?;
        } else {
            out.push(rel);
        }
    }
    Ok(())
}

impl FilesystemUpdater {
    fn resolve_source(&self, source: &str) -> Result<PathBuf, GadgetError> {
        match source.strip_prefix(KERNEL_REF_PREFIX) {
            Some(reference) => {
                let root = self.kernel_root.as_ref().ok_or_else(|| GadgetError::Backup {
                    name: self.ps.structure.name.clone(),
                    msg: format!("no kernel snap to resolve {:?}", source),
                })?;
                // "$kernel:<ref>/<path>" resolves to <path> in the kernel snap
                let path = reference.split_once('/').map(|(_, p)| p).unwrap_or("");
                Ok(root.join(path))
            }
            None => Ok(self.gadget_root.join(source)),
        }
    }

    fn plan(&mut self) -> Result<(), GadgetError> {
        let content = self.ps.structure.content.clone();
        for c in &content {
            let src = self.resolve_source(&c.source)?;
            let target = c.target.trim_start_matches('/');
            if src.is_dir() {
                let mut files = Vec::new();
                collect_files(&src, Path::new(""), &mut files)?;
                for f in files {
                    let rel = Path::new(target).join(&f);
                    self.push_plan(src.join(&f), rel);
                }
            } else if src.exists() {
                let rel = if target.is_empty() || c.target.ends_with('/') {
                    Path::new(target).join(src.file_name().unwrap_or_default())
                } else {
                    PathBuf::from(target)
                };
                self.push_plan(src, rel);
            } else {
                return Err(GadgetError::Backup {
                    name: self.ps.structure.name.clone(),
                    msg: format!("cannot find source {}", src.display()),
                });
            }
        }
        Ok(())
    }

    fn push_plan(&mut self, src: PathBuf, rel: PathBuf) {
        let rel = rel.to_string_lossy().into_owned();
        let preserved = self.ps.structure.update.preserve.iter().any(|p| p == &rel);
        let dst = self.mount.join(&rel);
        self.planned.push(PlannedWrite {
            src,
            skip: preserved && dst.exists(),
            dst,
            rel,
            backup: None,
        });
    }
}

impl StructureUpdater for FilesystemUpdater {
    fn backup(&mut self) -> Result<(), GadgetError> {
        self.plan()?;
        fs::create_dir_all(&self.backup_dir).map_err(io_err(&self.backup_dir))?;
        for p in self.planned.iter_mut() {
            if p.skip {
                continue;
            }
            if p.dst.exists() {
                let old = fs::read(&p.dst).map_err(io_err(&p.dst))?;
                let new = fs::read(&p.src).map_err(io_err(&p.src))?;
                if old == new {
                    p.skip = true;
                    continue;
                }
                let backup = self.backup_dir.join(format!("{}.backup", p.rel));
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent).map_err(io_err(parent))?;
                }
                fs::copy(&p.dst, &backup).map_err(io_err(&backup))?;
                p.backup = Some(backup);
            }
            if let Some(obs) = &self.observer {
                let change = ContentChange {
                    before: p.backup.clone(),
                    after: p.src.clone(),
                };
                let action = obs.observe(ContentOperation::Update, &self.ps.structure, &self.mount, &p.rel, &change)?;
                if action == ContentChangeAction::Ignore {
                    p.skip = true;
                }
            }
        }
        Ok(())
    }

    fn update(&mut self) -> Result<(), GadgetError> {
        let name = self.ps.structure.name.clone();
        for (i, p) in self.planned.iter().enumerate() {
            if p.skip {
                continue;
            }
            if let Some(parent) = p.dst.parent() {
                fs::create_dir_all(parent).map_err(|e| GadgetError::Update {
                    name: name.clone(),
                    msg: e.to_string(),
                })?;
            }
            fs::copy(&p.src, &p.dst).map_err(|e| GadgetError::Update {
                name: name.clone(),
                msg: format!("cannot write {}: {}", p.dst.display(), e),
            })?;
            self.written.push(i);
        }
        if self.written.is_empty() {
            return Err(GadgetError::NoUpdate);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), GadgetError> {
        for &i in self.written.iter().rev() {
            let p = &self.planned[i];
            match &p.backup {
                Some(b) => {
                    fs::copy(b, &p.dst).map_err(io_err(&p.dst))?;
                }
                None => {
                    fs::remove_file(&p.dst).map_err(io_err(&p.dst))?;
                }
            }
            if let Some(obs) = &self.observer {
                let change = ContentChange {
                    before: p.backup.clone(),
                    after: p.src.clone(),
                };
                obs.observe(ContentOperation::Rollback, &self.ps.structure, &self.mount, &p.rel, &change)?;
            }
        }
        self.written.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_shared::ModelGrade;
    use tempfile::TempDir;

    const GADGET_V1: &str = r#"
volumes:
  pc:
    bootloader: grub
    structure:
      - name: mbr
        type: mbr
        size: 440
      - name: ubuntu-boot
        role: system-boot
        filesystem: vfat
        type: EF,C12A7328-F81F-11D2-BA4B-00A0C93EC93B
        size: 10M
        content:
          - source: grubx64.efi
            target: EFI/boot/grubx64.efi
          - source: $kernel:dtbs/dtbs/
            target: dtbs/
"#;

    fn model() -> Model {
        Model {
            brand_id: "canonical".to_string(),
            model: "pc".to_string(),
            grade: ModelGrade::Dangerous,
            classic: false,
            gadget: "pc".to_string(),
            kernel: "pc-kernel".to_string(),
            base: "core20".to_string(),
            store: String::new(),
            revision: 0,
            timestamp: Utc::now(),
            required_snaps: vec![],
        }
    }

    fn with_edition(yaml: &str, edition: u32) -> GadgetInfo {
        let mut info = GadgetInfo::from_yaml(yaml.as_bytes(), Path::new("gadget.yaml")).unwrap();
        for vol in info.volumes.values_mut() {
            for s in vol.structure.iter_mut() {
                if s.name == "ubuntu-boot" {
                    s.update.edition = edition;
                }
            }
        }
        info
    }

    #[test]
    fn test_parse_gadget_yaml() {
        let info = GadgetInfo::from_yaml(GADGET_V1.as_bytes(), Path::new("gadget.yaml")).unwrap();
        assert_eq!(info.bootloader(), Some("grub"));
        let vol = &info.volumes["pc"];
        assert_eq!(vol.structure.len(), 2);
        assert!(vol.structure[0].is_bare());
        assert_eq!(vol.structure[1].content[0].target, "EFI/boot/grubx64.efi");
    }

    #[test]
    fn test_parse_rejects_empty() {
        let err = GadgetInfo::from_yaml(b"volumes: {}\n", Path::new("gadget.yaml")).unwrap_err();
        assert!(matches!(err, GadgetError::Invalid(_)));
    }

    #[test]
    fn test_policies() {
        let v1 = with_edition(GADGET_V1, 1);
        let v2 = with_edition(GADGET_V1, 2);
        let from = &v1.volumes["pc"].structure[1];
        let to = &v2.volumes["pc"].structure[1];
        assert!(default_update_policy(from, to));
        assert!(!default_update_policy(to, from));
        assert!(kernel_update_policy(to, from));
        assert!(!kernel_update_policy(from, &v1.volumes["pc"].structure[0]));
    }

    #[test]
    fn test_select_rejects_layout_change() {
        let v1 = with_edition(GADGET_V1, 1);
        let mut v2 = with_edition(GADGET_V1, 2);
        v2.volumes.get_mut("pc").unwrap().structure.pop();
        let err = select_structures(&v1, &v2, default_update_policy).unwrap_err();
        assert!(err.to_string().contains("cannot change the number of structures"));
    }

    fn setup_dirs(tmp: &TempDir) -> (GadgetData, GadgetData, PathBuf) {
        let old_root = tmp.path().join("gadget/1");
        let new_root = tmp.path().join("gadget/2");
        let kernel_root = tmp.path().join("kernel/1");
        let boot = tmp.path().join("boot");
        fs::create_dir_all(&old_root).unwrap();
        fs::create_dir_all(&new_root).unwrap();
        fs::create_dir_all(kernel_root.join("dtbs")).unwrap();
        fs::create_dir_all(boot.join("EFI/boot")).unwrap();
        fs::write(new_root.join("grubx64.efi"), b"grub v2").unwrap();
        fs::write(kernel_root.join("dtbs/board.dtb"), b"dtb").unwrap();
        fs::write(boot.join("EFI/boot/grubx64.efi"), b"grub v1").unwrap();

        let current = GadgetData {
            info: with_edition(GADGET_V1, 1),
            root_dir: old_root,
            kernel_root_dir: Some(kernel_root.clone()),
        };
        let update = GadgetData {
            info: with_edition(GADGET_V1, 2),
            root_dir: new_root,
            kernel_root_dir: Some(kernel_root),
        };
        (current, update, boot)
    }

    #[test]
    fn test_layout_updater_writes_and_backs_up() {
        let tmp = TempDir::new().unwrap();
        let (current, update, boot) = setup_dirs(&tmp);
        let rollback = tmp.path().join("rollback");
        fs::create_dir_all(&rollback).unwrap();
        let updater = LayoutUpdater::new(Arc::new(MountedFilesystemFactory::new().with_mount("system-boot", &boot)));

        updater
            .update(&model(), &current, &update, &rollback, default_update_policy, None)
            .unwrap();
        assert_eq!(fs::read(boot.join("EFI/boot/grubx64.efi")).unwrap(), b"grub v2");
        assert_eq!(fs::read(boot.join("dtbs/board.dtb")).unwrap(), b"dtb");
        assert!(rollback
            .join("struct-pc-1/EFI/boot/grubx64.efi.backup")
            .exists());
    }

    #[test]
    fn test_layout_updater_no_update() {
        let tmp = TempDir::new().unwrap();
        let (current, _, boot) = setup_dirs(&tmp);
        let updater = LayoutUpdater::new(Arc::new(MountedFilesystemFactory::new().with_mount("system-boot", &boot)));
        let err = updater
            .update(&model(), &current, &current, tmp.path(), default_update_policy, None)
            .unwrap_err();
        assert!(err.is_no_update());
    }

    #[test]
    fn test_bare_structure_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_, update, _) = setup_dirs(&tmp);
        let ps = LaidOutStructure {
            volume: "pc".to_string(),
            index: 0,
            structure: update.info.volumes["pc"].structure[0].clone(),
        };
        let res = MountedFilesystemFactory::new().updater_for(&ps, &update, tmp.path(), None);
        assert!(matches!(res, Err(GadgetError::Prepare { .. })));
    }

    #[test]
    fn test_rollback_restores_backup() {
        let tmp = TempDir::new().unwrap();
        let (_, update, boot) = setup_dirs(&tmp);
        let ps = LaidOutStructure {
            volume: "pc".to_string(),
            index: 1,
            structure: update.info.volumes["pc"].structure[1].clone(),
        };
        let factory = MountedFilesystemFactory::new().with_mount("system-boot", &boot);
        let mut u = factory.updater_for(&ps, &update, tmp.path(), None).unwrap();
        u.backup().unwrap();
        u.update().unwrap();
        assert_eq!(fs::read(boot.join("EFI/boot/grubx64.efi")).unwrap(), b"grub v2");

        u.rollback().unwrap();
        assert_eq!(fs::read(boot.join("EFI/boot/grubx64.efi")).unwrap(), b"grub v1");
        assert!(!boot.join("dtbs/board.dtb").exists());
    }

    #[test]
    fn test_unchanged_content_is_no_update() {
        let tmp = TempDir::new().unwrap();
        let (current, update, boot) = setup_dirs(&tmp);
        fs::write(boot.join("EFI/boot/grubx64.efi"), b"grub v2").unwrap();
        fs::create_dir_all(boot.join("dtbs")).unwrap();
        fs::write(boot.join("dtbs/board.dtb"), b"dtb").unwrap();
        let rollback = tmp.path().join("rollback");
        let updater = LayoutUpdater::new(Arc::new(MountedFilesystemFactory::new().with_mount("system-boot", &boot)));

        let err = updater
            .update(&model(), &current, &update, &rollback, default_update_policy, None)
            .unwrap_err();
        assert!(err.is_no_update());

        // kernel policy selects the structure whatever the edition
        let err = updater
            .update(&model(), &update, &update, &rollback, kernel_update_policy, None)
            .unwrap_err();
        assert!(err.is_no_update());
        assert_eq!(fs::read(boot.join("EFI/boot/grubx64.efi")).unwrap(), b"grub v2");
    }

    #[test]
    fn test_structure_updater_reports_no_update() {
        let tmp = TempDir::new().unwrap();
        let (_, update, boot) = setup_dirs(&tmp);
        fs::write(boot.join("EFI/boot/grubx64.efi"), b"grub v2").unwrap();
        fs::create_dir_all(boot.join("dtbs")).unwrap();
        fs::write(boot.join("dtbs/board.dtb"), b"dtb").unwrap();
        let ps = LaidOutStructure {
            volume: "pc".to_string(),
            index: 1,
            structure: update.info.volumes["pc"].structure[1].clone(),
        };
        let factory = MountedFilesystemFactory::new().with_mount("system-boot", &boot);
        let mut u = factory.updater_for(&ps, &update, tmp.path(), None).unwrap();
        u.backup().unwrap();
        assert!(u.update().unwrap_err().is_no_update());
    }
}
