//! Trusted boot asset tracking during gadget updates.
//!
//! Trusted assets are bootloader binaries measured into the sealed boot
//! chain. When an update is about to replace one, the hash of the new
//! file is added to the modeenv ledger next to the current one and the
//! keys are resealed before anything is written, so both the old and
//! the new boot chain can unseal. The bootloader's own configuration is
//! managed by the boot layer and gadget updates leave it alone.

use crate::boot::{BootBackend, Modeenv};
use crate::error::GadgetError;
use crate::gadget::{ContentChange, ContentChangeAction, ContentObserver, ContentOperation, GadgetInfo, VolumeStructure};
use fleet_shared::Model;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Hashes kept per asset: the current one and one candidate.
const MAX_ASSET_HASHES: usize = 2;

const GRUB_TRUSTED: &[&str] = &["EFI/boot/grubx64.efi", "EFI/boot/bootx64.efi"];
const GRUB_MANAGED: &[&str] = &["EFI/ubuntu/grub.cfg"];

/// Trusted and managed assets per bootloader, relative to the boot partition.
fn bootloader_assets(bootloader: &str) -> (&'static [&'static str], &'static [&'static str]) {
    match bootloader {
        "grub" => (GRUB_TRUSTED, GRUB_MANAGED),
        _ => (&[], &[]),
    }
}

fn asset_name(relative_target: &str) -> &str {
    relative_target.rsplit('/').next().unwrap_or(relative_target)
}

fn file_hash(path: &Path) -> Result<String, GadgetError> {
    let data = fs::read(path).map_err(|source| GadgetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(Sha256::digest(&data)))
}

#[derive(Default)]
struct Tracked {
    original: Option<Modeenv>,
    modeenv: Option<Modeenv>,
    changed: bool,
}

pub struct TrustedAssetsUpdateObserver {
    boot: Arc<dyn BootBackend>,
    trusted: &'static [&'static str],
    managed: &'static [&'static str],
    tracked: Mutex<Tracked>,
}

impl TrustedAssetsUpdateObserver {
    /// Observer for a model and gadget, or `None` when there is nothing
    /// to track (no grade, or a bootloader without trusted assets).
    pub fn for_model(model: &Model, gadget: &GadgetInfo, boot: Arc<dyn BootBackend>) -> Option<Arc<Self>> {
        if !model.grade.is_set() {
            return None;
        }
        let (trusted, managed) = bootloader_assets(gadget.bootloader()?);
        if trusted.is_empty() && managed.is_empty() {
            return None;
        }
        Some(Arc::new(Self {
            boot,
            trusted,
            managed,
            tracked: Mutex::new(Tracked::default()),
        }))
    }

    fn with_modeenv<R>(
        &self,
        f: impl FnOnce(&mut Modeenv, &mut bool) -> Result<R, GadgetError>,
    ) -> Result<R, GadgetError> {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if tracked.modeenv.is_none() {
            let m = self
                .boot
                .read_modeenv()
                .map_err(|e| GadgetError::Observer(e.to_string()))?;
            tracked.original = Some(m.clone());
            tracked.modeenv = Some(m);
        }
        let Tracked { modeenv, changed, .. } = &mut *tracked;
        match modeenv {
            Some(m) => f(m, changed),
            None => Err(GadgetError::Observer("boot environment not loaded".to_string())),
        }
    }

    fn write_and_reseal(&self, m: &Modeenv) -> Result<(), GadgetError> {
        self.boot
            .write_modeenv(m)
            .map_err(|e| GadgetError::Observer(e.to_string()))?;
        self.boot
            .reseal_keys(m, false)
            .map_err(|e| GadgetError::Observer(format!("cannot reseal keys: {}", e)))
    }
}

impl ContentObserver for TrustedAssetsUpdateObserver {
    fn observe(
        &self,
        op: ContentOperation,
        _structure: &VolumeStructure,
        _root: &Path,
        relative_target: &str,
        change: &ContentChange,
    ) -> Result<ContentChangeAction, GadgetError> {
        if self.managed.contains(&relative_target) {
            debug!("Leaving managed boot asset {} alone", relative_target);
            return Ok(ContentChangeAction::Ignore);
        }
        if !self.trusted.contains(&relative_target) {
            return Ok(ContentChangeAction::Apply);
        }
        let name = asset_name(relative_target).to_string();

        match op {
            ContentOperation::Update => {
                let hash = file_hash(&change.after)?;
                self.with_modeenv(|m, changed| {
                    let hashes = m.current_trusted_boot_assets.entry(name.clone()).or_default();
                    if hashes.contains(&hash) {
                        return Ok(ContentChangeAction::Apply);
                    }
                    if hashes.len() >= MAX_ASSET_HASHES {
                        return Err(GadgetError::Observer(format!(
                            "cannot track new {:?} hash: already tracking {} hashes",
                            name,
                            hashes.len()
                        )));
                    }
                    hashes.push(hash);
                    *changed = true;
                    Ok(ContentChangeAction::Apply)
                })
            }
            ContentOperation::Rollback => self.with_modeenv(|m, changed| {
                if let Some(hashes) = m.current_trusted_boot_assets.get_mut(&name) {
                    if hashes.len() > 1 {
                        hashes.pop();
                        *changed = true;
                    }
                }
                Ok(ContentChangeAction::Apply)
            }),
        }
    }

    fn before_write(&self) -> Result<(), GadgetError> {
        let tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if !tracked.changed {
            return Ok(());
        }
        if let Some(m) = &tracked.modeenv {
            self.write_and_reseal(m)?;
            info!("Recorded new trusted boot asset hashes");
        }
        Ok(())
    }

    fn canceled(&self) -> Result<(), GadgetError> {
        let tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if !tracked.changed {
            return Ok(());
        }
        if let Some(m) = &tracked.original {
            self.write_and_reseal(m)?;
            info!("Restored trusted boot asset hashes");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::FsBoot;
    use chrono::Utc;
    use fleet_shared::ModelGrade;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn model(grade: ModelGrade) -> Model {
        Model {
            brand_id: "canonical".to_string(),
            model: "pc".to_string(),
            grade,
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

    fn grub_gadget() -> GadgetInfo {
        GadgetInfo::from_yaml(
            b"volumes:\n  pc:\n    bootloader: grub\n    structure:\n      - name: ubuntu-boot\n        filesystem: vfat\n",
            Path::new("gadget.yaml"),
        )
        .unwrap()
    }

    fn change(path: PathBuf) -> ContentChange {
        ContentChange {
            before: None,
            after: path,
        }
    }

    #[test]
    fn test_not_applicable_without_grade() {
        let tmp = TempDir::new().unwrap();
        let boot: Arc<dyn BootBackend> = Arc::new(FsBoot::new(tmp.path()));
        assert!(TrustedAssetsUpdateObserver::for_model(&model(ModelGrade::Unset), &grub_gadget(), boot).is_none());
    }

    #[test]
    fn test_tracks_trusted_asset_and_reseals_before_write() {
        let tmp = TempDir::new().unwrap();
        let boot: Arc<dyn BootBackend> = Arc::new(FsBoot::new(tmp.path().join("boot")));
        let obs = TrustedAssetsUpdateObserver::for_model(&model(ModelGrade::Signed), &grub_gadget(), boot.clone()).unwrap();
        let new_grub = tmp.path().join("grubx64.efi");
        fs::write(&new_grub, b"new grub").unwrap();
        let s = VolumeStructure::default();

        let action = obs
            .observe(ContentOperation::Update, &s, tmp.path(), "EFI/boot/grubx64.efi", &change(new_grub.clone()))
            .unwrap();
        assert_eq!(action, ContentChangeAction::Apply);
        // nothing persisted until the write phase starts
        assert!(boot.read_modeenv().unwrap().current_trusted_boot_assets.is_empty());

        obs.before_write().unwrap();
        let m = boot.read_modeenv().unwrap();
        assert_eq!(m.current_trusted_boot_assets["grubx64.efi"], vec![file_hash(&new_grub).unwrap()]);
        assert!(tmp.path().join("boot/sealed-keys.json").exists());
    }

    #[test]
    fn test_managed_asset_ignored() {
        let tmp = TempDir::new().unwrap();
        let boot: Arc<dyn BootBackend> = Arc::new(FsBoot::new(tmp.path()));
        let obs = TrustedAssetsUpdateObserver::for_model(&model(ModelGrade::Signed), &grub_gadget(), boot).unwrap();
        let action = obs
            .observe(
                ContentOperation::Update,
                &VolumeStructure::default(),
                tmp.path(),
                "EFI/ubuntu/grub.cfg",
                &change(tmp.path().join("grub.cfg")),
            )
            .unwrap();
        assert_eq!(action, ContentChangeAction::Ignore);
    }

    #[test]
    fn test_too_many_hashes() {
        let tmp = TempDir::new().unwrap();
        let boot: Arc<dyn BootBackend> = Arc::new(FsBoot::new(tmp.path().join("boot")));
        let mut m = Modeenv::default();
        m.current_trusted_boot_assets
            .insert("grubx64.efi".to_string(), vec!["a".to_string(), "b".to_string()]);
        boot.write_modeenv(&m).unwrap();

        let obs = TrustedAssetsUpdateObserver::for_model(&model(ModelGrade::Signed), &grub_gadget(), boot).unwrap();
        let new_grub = tmp.path().join("grubx64.efi");
        fs::write(&new_grub, b"third").unwrap();
        let err = obs
            .observe(
                ContentOperation::Update,
                &VolumeStructure::default(),
                tmp.path(),
                "EFI/boot/grubx64.efi",
                &change(new_grub),
            )
            .unwrap_err();
        assert!(err.to_string().contains("already tracking 2 hashes"));
    }

    #[test]
    fn test_canceled_restores_original() {
        let tmp = TempDir::new().unwrap();
        let boot: Arc<dyn BootBackend> = Arc::new(FsBoot::new(tmp.path().join("boot")));
        let obs = TrustedAssetsUpdateObserver::for_model(&model(ModelGrade::Signed), &grub_gadget(), boot.clone()).unwrap();
        let new_grub = tmp.path().join("grubx64.efi");
        fs::write(&new_grub, b"new grub").unwrap();
        obs.observe(
            ContentOperation::Update,
            &VolumeStructure::default(),
            tmp.path(),
            "EFI/boot/grubx64.efi",
            &change(new_grub),
        )
        .unwrap();
        obs.before_write().unwrap();
        obs.canceled().unwrap();
        assert!(boot.read_modeenv().unwrap().current_trusted_boot_assets.is_empty());
    }
}
