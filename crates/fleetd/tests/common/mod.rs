//! Shared fixtures for fleetd integration tests.

#![allow(dead_code)]

use chrono::Utc;
use fleet_shared::device::{self, DeviceState};
use fleet_shared::snap::{self, Revision, SideInfo, SnapState, SnapType};
use fleet_shared::{Model, ModelGrade, Serial, State, StateData, Unlocker};
use fleetd::boot::{BootBackend, FsBoot, GroundDeviceContext, Modeenv};
use fleetd::config::Config;
use fleetd::error::{BootError, GadgetError, ServiceError, StoreError};
use fleetd::gadget::{ContentObserver, GadgetData, GadgetUpdater, UpdatePolicy};
use fleetd::hooks::{HookError, HookRunner, HookSetup};
use fleetd::keys::{Ed25519Keypairs, KeypairManager, KeypairSigner};
use fleetd::registration::SEEDED_KEY;
use fleetd::service::{DeviceService, SerialRequest};
use fleetd::store::{StoreContext, StoreFactory, StoreService};
use fleetd::{Backends, DeviceManager, TaskRunner};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const GADGET_YAML: &str = r#"
volumes:
  pc:
    bootloader: grub
    structure:
      - name: ubuntu-boot
        role: system-boot
        filesystem: vfat
        content:
          - source: grubx64.efi
            target: EFI/boot/grubx64.efi
"#;

pub fn model(brand: &str, name: &str, store: &str) -> Model {
    Model {
        brand_id: brand.to_string(),
        model: name.to_string(),
        grade: ModelGrade::Unset,
        classic: false,
        gadget: "pc".to_string(),
        kernel: "pc-kernel".to_string(),
        base: "core20".to_string(),
        store: store.to_string(),
        revision: 1,
        timestamp: Utc::now(),
        required_snaps: vec![],
    }
}

/// How the mock device service answers serial requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Issue,
    Poll,
    Transient,
    Reject,
}

pub struct MockDeviceService {
    pub mode: Mutex<ServiceMode>,
    pub requests: Mutex<Vec<SerialRequest>>,
    issued: AtomicUsize,
}

impl MockDeviceService {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(ServiceMode::Issue),
            requests: Mutex::new(Vec::new()),
            issued: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: ServiceMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn requests(&self) -> Vec<SerialRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl DeviceService for MockDeviceService {
    fn request_id(&self) -> Result<String, ServiceError> {
        Ok("request-id-1".to_string())
    }

    fn submit(&self, req: &SerialRequest) -> Result<Serial, ServiceError> {
        self.requests.lock().unwrap().push(req.clone());
        match *self.mode.lock().unwrap() {
            ServiceMode::Issue => {}
            ServiceMode::Poll => return Err(ServiceError::Poll),
            ServiceMode::Transient => return Err(ServiceError::Transient("connection refused".to_string())),
            ServiceMode::Reject => return Err(ServiceError::Rejected("bad request".to_string())),
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let header = |name: &str| req.request.header(name).unwrap_or_default().to_string();
        Ok(Serial {
            brand_id: header("brand-id"),
            model: header("model"),
            serial: format!("serial-{}", n),
            device_key_id: header("device-key-id"),
            device_key: req.request.public_key.clone(),
            revision: 0,
            timestamp: Utc::now(),
        })
    }
}

/// Store that hands out a session named after the model it serves.
pub struct MockStore {
    ctx: StoreContext,
}

impl StoreService for MockStore {
    fn ensure_device_session(&self) -> Result<(), StoreError> {
        let dev = self.ctx.device().map_err(|e| StoreError::Session(e.to_string()))?;
        if !dev.session_macaroon.is_empty() {
            return Ok(());
        }
        let model = self.ctx.model().map_err(|e| StoreError::Session(e.to_string()))?;
        let session = format!("session-{}-{}", model.model, model.store);
        self.ctx
            .update_device_session(&session)
            .map_err(|e| StoreError::Session(e.to_string()))
    }
}

#[derive(Default)]
pub struct MockStoreFactory {
    pub created: AtomicUsize,
}

impl StoreFactory for MockStoreFactory {
    fn new_store(&self, ctx: StoreContext) -> Arc<dyn StoreService> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockStore { ctx })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GadgetMode {
    Update,
    NoUpdate,
    Fail,
}

pub struct MockGadgetUpdater {
    pub mode: Mutex<GadgetMode>,
    pub calls: Mutex<Vec<(String, PathBuf)>>,
    pub kernel_roots: Mutex<Vec<Option<PathBuf>>>,
}

impl MockGadgetUpdater {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(GadgetMode::Update),
            calls: Mutex::new(Vec::new()),
            kernel_roots: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: GadgetMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

impl GadgetUpdater for MockGadgetUpdater {
    fn update(
        &self,
        _model: &Model,
        _current: &GadgetData,
        update: &GadgetData,
        rollback_dir: &Path,
        _policy: UpdatePolicy,
        _observer: Option<Arc<dyn ContentObserver>>,
    ) -> Result<(), GadgetError> {
        let structure = update
            .info
            .volumes
            .keys()
            .next()
            .cloned()
            .unwrap_or_default();
        self.calls.lock().unwrap().push((structure, rollback_dir.to_path_buf()));
        self.kernel_roots.lock().unwrap().push(update.kernel_root_dir.clone());
        match *self.mode.lock().unwrap() {
            GadgetMode::Update => Ok(()),
            GadgetMode::NoUpdate => Err(GadgetError::NoUpdate),
            GadgetMode::Fail => Err(GadgetError::Update {
                name: "ubuntu-boot".to_string(),
                msg: "write failed".to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct MockHooks {
    pub runs: Mutex<Vec<HookSetup>>,
}

impl HookRunner for MockHooks {
    fn run_hook(&self, setup: &HookSetup, _mount_dir: &Path) -> Result<(), HookError> {
        self.runs.lock().unwrap().push(setup.clone());
        Ok(())
    }
}

/// Boot operations [`FaultyBoot`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOp {
    DeviceChange,
    MarkRecoveryCapable,
    Reseal,
}

/// File backed boot environment that fails one chosen operation.
pub struct FaultyBoot {
    inner: FsBoot,
    fail: Mutex<Option<BootOp>>,
}

impl FaultyBoot {
    pub fn new(dir: &Path) -> Self {
        Self {
            inner: FsBoot::new(dir),
            fail: Mutex::new(None),
        }
    }

    pub fn fail(&self, op: BootOp) {
        *self.fail.lock().unwrap() = Some(op);
    }

    fn check(&self, op: BootOp, msg: &str) -> Result<(), BootError> {
        if *self.fail.lock().unwrap() == Some(op) {
            return Err(BootError::Other(msg.to_string()));
        }
        Ok(())
    }
}

impl BootBackend for FaultyBoot {
    fn has_system_seed(&self) -> Result<bool, BootError> {
        self.inner.has_system_seed()
    }

    fn read_modeenv(&self) -> Result<Modeenv, BootError> {
        self.inner.read_modeenv()
    }

    fn write_modeenv(&self, modeenv: &Modeenv) -> Result<(), BootError> {
        self.inner.write_modeenv(modeenv)
    }

    fn create_recovery_system(&self, label: &str, model: &Model) -> Result<(), BootError> {
        self.inner.create_recovery_system(label, model)
    }

    fn mark_recovery_capable_system(&self, label: &str) -> Result<(), BootError> {
        self.check(BootOp::MarkRecoveryCapable, "bootenv is read-only")?;
        self.inner.mark_recovery_capable_system(label)
    }

    fn device_change(
        &self,
        from: &GroundDeviceContext,
        to: &GroundDeviceContext,
        unlocker: &mut dyn Unlocker,
    ) -> Result<(), BootError> {
        self.check(BootOp::DeviceChange, "modeenv is locked")?;
        self.inner.device_change(from, to, unlocker)
    }

    fn mark_boot_successful(&self) -> Result<(), BootError> {
        self.inner.mark_boot_successful()
    }

    fn reseal_keys(&self, modeenv: &Modeenv, force: bool) -> Result<(), BootError> {
        self.check(BootOp::Reseal, "tpm unavailable")?;
        self.inner.reseal_keys(modeenv, force)
    }

    fn static_command_line(&self, candidate: bool) -> Result<String, BootError> {
        self.inner.static_command_line(candidate)
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub config: Config,
    pub state: State,
    pub runner: TaskRunner,
    pub manager: DeviceManager,
    pub boot: Arc<FaultyBoot>,
    pub keys: Arc<dyn KeypairManager>,
    pub service: Arc<MockDeviceService>,
    pub gadget: Arc<MockGadgetUpdater>,
    pub stores: Arc<MockStoreFactory>,
    pub hooks: Arc<MockHooks>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        configure(&mut config);

        let state = State::new();
        let boot = Arc::new(FaultyBoot::new(&config.paths.boot_dir));
        let service = Arc::new(MockDeviceService::new());
        let gadget = Arc::new(MockGadgetUpdater::new());
        let stores = Arc::new(MockStoreFactory::default());
        let hooks = Arc::new(MockHooks::default());
        let keys: Arc<dyn KeypairManager> = Arc::new(Ed25519Keypairs::in_memory());
        let backends = Backends {
            boot: boot.clone(),
            gadget: gadget.clone(),
            signer: Arc::new(KeypairSigner::new(keys.clone())),
            keys: keys.clone(),
            service: service.clone(),
            hooks: hooks.clone(),
            stores: stores.clone(),
        };

        let mut runner = TaskRunner::new(state.clone());
        let manager = DeviceManager::new(state.clone(), config.clone(), backends, &mut runner);
        Self {
            tmp,
            config,
            state,
            runner,
            manager,
            boot,
            keys,
            service,
            gadget,
            stores,
            hooks,
        }
    }

    /// Round-trips the state through a checkpoint and starts a fresh
    /// manager on it, sharing this harness's backends.
    pub fn reload(&self) -> (State, TaskRunner, DeviceManager) {
        let data = self.state.checkpoint().unwrap();
        let state = State::from_checkpoint(&data).unwrap();
        let backends = Backends {
            boot: self.boot.clone(),
            gadget: self.gadget.clone(),
            signer: Arc::new(KeypairSigner::new(self.keys.clone())),
            keys: self.keys.clone(),
            service: self.service.clone(),
            hooks: self.hooks.clone(),
            stores: self.stores.clone(),
        };
        let mut runner = TaskRunner::new(state.clone());
        let manager = DeviceManager::new(state.clone(), self.config.clone(), backends, &mut runner);
        (state, runner, manager)
    }

    /// Mounts a gadget revision and makes it current.
    pub fn install_gadget(&self, name: &str, rev: i32, hooks: &[&str]) -> SideInfo {
        let si = SideInfo {
            real_name: name.to_string(),
            revision: Revision(rev),
            snap_id: format!("{}-id", name),
        };
        let dir = snap::mount_dir(&self.config.paths.snap_mount_dir, name, si.revision);
        fs::create_dir_all(dir.join("meta/hooks")).unwrap();
        fs::write(dir.join("meta/snap.yaml"), format!("name: {}\ntype: gadget\nversion: \"1\"\n", name)).unwrap();
        fs::write(dir.join("meta/gadget.yaml"), GADGET_YAML).unwrap();
        for hook in hooks {
            fs::write(dir.join("meta/hooks").join(hook), "#!/bin/sh\n").unwrap();
        }

        let mut st = self.state.lock();
        let mut sequence = snap::snap_state(&st, name)
            .unwrap()
            .map(|s| s.sequence)
            .unwrap_or_default();
        sequence.push(si.clone());
        snap::set_snap_state(
            &mut st,
            name,
            SnapState {
                snap_type: SnapType::Gadget,
                sequence,
                current: si.revision,
                active: true,
            },
        )
        .unwrap();
        si
    }

    /// Mounts a gadget revision without making it current.
    pub fn mount_candidate_gadget(&self, name: &str, rev: i32) -> SideInfo {
        let si = SideInfo {
            real_name: name.to_string(),
            revision: Revision(rev),
            snap_id: format!("{}-id", name),
        };
        let dir = snap::mount_dir(&self.config.paths.snap_mount_dir, name, si.revision);
        fs::create_dir_all(dir.join("meta")).unwrap();
        fs::write(dir.join("meta/snap.yaml"), format!("name: {}\ntype: gadget\nversion: \"2\"\n", name)).unwrap();
        fs::write(dir.join("meta/gadget.yaml"), GADGET_YAML.replace("pc:", "foo:")).unwrap();
        si
    }

    /// Mounts a kernel revision without making it current.
    pub fn mount_candidate_kernel(&self, name: &str, rev: i32) -> SideInfo {
        let si = SideInfo {
            real_name: name.to_string(),
            revision: Revision(rev),
            snap_id: format!("{}-id", name),
        };
        let dir = snap::mount_dir(&self.config.paths.snap_mount_dir, name, si.revision);
        fs::create_dir_all(dir.join("meta")).unwrap();
        fs::write(dir.join("meta/snap.yaml"), format!("name: {}\ntype: kernel\nversion: \"5.15\"\n", name)).unwrap();
        si
    }

    /// Seeds the device with `model` as its identity.
    pub fn seed(&self, model: &Model) {
        let mut st = self.state.lock();
        st.assertions_mut().add_model(model.clone()).unwrap();
        let dev = DeviceState {
            brand: model.brand_id.clone(),
            model: model.model.clone(),
            ..DeviceState::default()
        };
        device::set_device(&mut st, &dev).unwrap();
        st.set(SEEDED_KEY, &true).unwrap();
    }

    /// Runs ensure passes until no task is runnable.
    pub fn settle(&self) {
        for _ in 0..50 {
            self.manager.ensure().unwrap();
            if self.runner.ensure() == 0 {
                return;
            }
        }
        panic!("state did not settle");
    }

    pub fn device(&self) -> DeviceState {
        device::device(&self.state.lock()).unwrap()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut StateData) -> R) -> R {
        let mut st = self.state.lock();
        f(&mut *st)
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }
}
