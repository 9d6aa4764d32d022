//! Device manager.
//!
//! Owns device identity, registration, remodeling and the gadget and boot
//! tasks. `ensure` runs on every daemon tick; the task handlers it
//! registers run from the [`TaskRunner`].

use crate::boot::{BootBackend, FsBoot};
use crate::cmdline;
use crate::config::Config;
use crate::error::{DeviceError, EnsureError, TaskError};
use crate::gadget::{GadgetUpdater, LayoutUpdater, MountedFilesystemFactory};
use crate::handlers::{self, UPDATE_GADGET_ASSETS, UPDATE_GADGET_CMDLINE};
use crate::hooks::{ExecHookRunner, HookRunner};
use crate::keys::{Ed25519Keypairs, KeypairManager, KeypairSigner, SignedRequest, Signer};
use crate::registration::{self, PAUSED_KEY, SEEDED_KEY};
use crate::remodel::{self, RemodelContext};
use crate::reseal::{self, REBOOT_AFTER_KEY, RESEAL_KEYS};
use crate::runner::TaskRunner;
use crate::service::{DeviceService, UnconfiguredDeviceService};
use crate::store::{GlobalDeviceBackend, OfflineStoreFactory, StoreContext, StoreFactory, StoreService};
use crate::systems::{self, MARK_SEEDED};
use chrono::Utc;
use fleet_shared::device::{self, DeviceState};
use fleet_shared::{ChangeId, Model, Serial, State, StateData, StateGuard, StoreAssertion, Task, TaskId};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Collaborators the device manager drives.
pub struct Backends {
    pub boot: Arc<dyn BootBackend>,
    pub gadget: Arc<dyn GadgetUpdater>,
    pub keys: Arc<dyn KeypairManager>,
    pub signer: Arc<dyn Signer>,
    pub service: Arc<dyn DeviceService>,
    pub hooks: Arc<dyn HookRunner>,
    pub stores: Arc<dyn StoreFactory>,
}

impl Backends {
    /// Backends of a real system laid out as described by `config`.
    pub fn system(config: &Config) -> Self {
        let paths = &config.paths;
        let keys: Arc<dyn KeypairManager> = Arc::new(Ed25519Keypairs::open(&paths.device_keys_dir));
        let structures = MountedFilesystemFactory::new().with_mount("system-boot", &paths.boot_assets_dir);
        Self {
            boot: Arc::new(FsBoot::new(&paths.boot_dir)),
            gadget: Arc::new(LayoutUpdater::new(Arc::new(structures))),
            signer: Arc::new(KeypairSigner::new(keys.clone())),
            keys,
            service: Arc::new(UnconfiguredDeviceService),
            hooks: Arc::new(ExecHookRunner),
            stores: Arc::new(OfflineStoreFactory),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) state: State,
    pub(crate) config: Config,
    pub(crate) boot: Arc<dyn BootBackend>,
    pub(crate) gadget: Arc<dyn GadgetUpdater>,
    pub(crate) keys: Arc<dyn KeypairManager>,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) service: Arc<dyn DeviceService>,
    pub(crate) hooks: Arc<dyn HookRunner>,
    pub(crate) stores: Arc<dyn StoreFactory>,
    store: Arc<dyn StoreService>,
    registered: watch::Sender<bool>,
    first_attempt: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
    boot_ok_done: AtomicBool,
}

impl Inner {
    pub(crate) fn mark_registered(&self) {
        if !*self.registered.borrow() {
            info!("Device is registered");
        }
        self.registered.send_replace(true);
    }

    pub(crate) fn signal_first_attempt(&self) {
        self.first_attempt.send_replace(true);
    }
}

type HandlerFn = fn(&Inner, &mut StateGuard<'_>, &TaskId) -> Result<(), TaskError>;

fn bind(inner: &Arc<Inner>, f: HandlerFn) -> impl Fn(&mut StateGuard<'_>, &TaskId) -> Result<(), TaskError> + Send + Sync + 'static {
    let inner = inner.clone();
    move |st: &mut StateGuard<'_>, id: &TaskId| f(&inner, st, id)
}

/// Parameters of a device session request.
#[derive(Debug, Clone)]
pub struct DeviceSessionRequestParams {
    pub request: SignedRequest,
    /// Encoded serial assertion
    pub serial: String,
    /// Encoded model assertion
    pub model: String,
}

pub struct DeviceManager {
    inner: Arc<Inner>,
}

impl DeviceManager {
    /// Creates the manager and registers its task handlers with `runner`.
    pub fn new(state: State, config: Config, backends: Backends, runner: &mut TaskRunner) -> Self {
        let store = backends
            .stores
            .new_store(StoreContext::new(state.clone(), Arc::new(GlobalDeviceBackend)));
        let registered = {
            let st = state.lock();
            device::device(&st).map(|d| d.is_registered()).unwrap_or(false)
        };

        let (registered, _) = watch::channel(registered);
        let (first_attempt, _) = watch::channel(false);
        let (stopped, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            state,
            config,
            boot: backends.boot,
            gadget: backends.gadget,
            keys: backends.keys,
            signer: backends.signer,
            service: backends.service,
            hooks: backends.hooks,
            stores: backends.stores,
            store,
            registered,
            first_attempt,
            stopped,
            boot_ok_done: AtomicBool::new(false),
        });

        runner.add_handler("run-hook", bind(&inner, registration::do_run_hook));
        runner.add_handler("generate-device-key", bind(&inner, registration::do_generate_device_key));
        runner.add_handler("request-serial", bind(&inner, registration::do_request_serial));
        runner.add_handler("prepare-remodeling", bind(&inner, remodel::do_prepare_remodeling));
        runner.add_handler("create-recovery-system", bind(&inner, remodel::do_create_recovery_system));
        runner.add_handler("set-model", bind(&inner, remodel::do_set_model));
        runner.add_handler(MARK_SEEDED, bind(&inner, systems::do_mark_seeded));
        runner.add_handler(UPDATE_GADGET_ASSETS, bind(&inner, handlers::do_update_gadget_assets));
        runner.add_handler_with_undo(
            UPDATE_GADGET_CMDLINE,
            bind(&inner, cmdline::do_update_gadget_cmdline),
            bind(&inner, cmdline::undo_update_gadget_cmdline),
        );
        runner.add_handler(RESEAL_KEYS, bind(&inner, reseal::do_reseal_keys));
        runner.add_blocked(|_st: &StateData, t: &Task, running: &[&Task]| handlers::gadget_update_blocked(t, running));

        Self { inner }
    }

    pub fn state(&self) -> &State {
        &self.inner.state
    }

    /// One pass of device housekeeping. Errors of independent steps are
    /// collected rather than stopping each other.
    pub fn ensure(&self) -> Result<(), EnsureError> {
        if *self.inner.stopped.borrow() {
            return Ok(());
        }
        let mut st = self.inner.state.lock();
        let mut errs = Vec::new();

        if let Err(e) = self.ensure_boot_ok(&st) {
            errs.push(e);
        }
        if let Err(e) = registration::ensure_operational(&self.inner, &mut st) {
            errs.push(e);
        }
        remodel::cleanup_cache(&mut st);

        if errs.is_empty() {
            Ok(())
        } else {
            Err(EnsureError(errs))
        }
    }

    fn ensure_boot_ok(&self, st: &StateData) -> Result<(), DeviceError> {
        if self.inner.config.daemon.is_plain_classic() || self.inner.boot_ok_done.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !st.get_opt::<bool>(SEEDED_KEY)?.unwrap_or(false) {
            return Ok(());
        }
        self.inner.boot.mark_boot_successful()?;
        self.inner.boot_ok_done.store(true, Ordering::SeqCst);
        debug!("Marked boot successful");
        Ok(())
    }

    pub fn model(&self) -> Result<Model, DeviceError> {
        find_model(&self.inner.state.lock())
    }

    pub fn serial(&self) -> Result<Serial, DeviceError> {
        find_serial(&self.inner.state.lock(), None)
    }

    /// Flips to true once the device has a serial.
    pub fn registered(&self) -> watch::Receiver<bool> {
        self.inner.registered.subscribe()
    }

    pub fn registration_attempts(&self, st: &StateData) -> Result<u32, DeviceError> {
        registration::registration_attempts(st)
    }

    /// Lets a registration paused after key generation go on.
    pub fn resume_registration(&self, st: &mut StateData) -> Result<(), DeviceError> {
        if st.get_opt::<bool>(PAUSED_KEY)? == Some(true) {
            info!("Resuming device registration");
        }
        st.set(PAUSED_KEY, &false)?;
        st.ensure_before(Duration::ZERO);
        Ok(())
    }

    /// Waits, with the lock released, until the device is registered, the
    /// first registration attempt finished or `timeout` elapsed. Resumes a
    /// paused registration first. Returns right away once more than one
    /// attempt was made. Cancellation or stopping the manager yield
    /// [`DeviceError::NoState`].
    pub async fn wait_for_registration(
        &self,
        st: &mut StateGuard<'_>,
        cancel: impl Future<Output = ()>,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        self.resume_registration(st)?;
        if device::device(st)?.is_registered() || registration::registration_attempts(st)? > 1 {
            return Ok(());
        }

        let mut registered = self.inner.registered.subscribe();
        let mut first_attempt = self.inner.first_attempt.subscribe();
        let mut stopped = self.inner.stopped.subscribe();
        st.unlocked_async(async move {
            tokio::select! {
                _ = registered.wait_for(|r| *r) => Ok(()),
                _ = first_attempt.wait_for(|f| *f) => Ok(()),
                _ = tokio::time::sleep(timeout) => Ok(()),
                _ = stopped.wait_for(|s| *s) => Err(DeviceError::NoState),
                _ = cancel => Err(DeviceError::NoState),
            }
        })
        .await
    }

    /// Signed parameters for requesting a store device session.
    pub fn device_session_request_params(&self, st: &StateData, nonce: &str) -> Result<DeviceSessionRequestParams, DeviceError> {
        let model = find_model(st)?;
        let serial = find_serial(st, None)?;
        let dev = device::device(st)?;

        let headers = BTreeMap::from([
            ("brand-id".to_string(), serial.brand_id.clone()),
            ("model".to_string(), serial.model.clone()),
            ("serial".to_string(), serial.serial.clone()),
            ("nonce".to_string(), nonce.to_string()),
            ("timestamp".to_string(), Utc::now().to_rfc3339()),
        ]);
        let request = self.inner.signer.sign_request(&dev.key_id, headers, None)?;
        Ok(DeviceSessionRequestParams {
            request,
            serial: serial.encode()?,
            model: model.encode()?,
        })
    }

    /// The store assertion of the model's store, when known.
    pub fn proxy_store(&self, st: &StateData) -> Result<Option<StoreAssertion>, DeviceError> {
        let model = find_model(st)?;
        if model.store.is_empty() {
            return Ok(None);
        }
        match st.assertions().find_store(&model.store) {
            Ok(store) => Ok(Some(store.clone())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store bound to the global device identity.
    pub fn store(&self) -> Arc<dyn StoreService> {
        self.inner.store.clone()
    }

    /// Starts a remodel to `new_model`, returning the change id.
    pub fn remodel(&self, st: &mut StateGuard<'_>, new_model: Model) -> Result<ChangeId, DeviceError> {
        remodel::remodel(&self.inner, st, new_model)
    }

    pub fn remodel_context(&self, st: &mut StateData, chg: &ChangeId) -> Result<Arc<RemodelContext>, DeviceError> {
        remodel::remodel_ctx_for_change(&self.inner, st, chg)
    }

    /// Whether automatic refreshes may run. Unregistered devices get
    /// them after a few failed registration attempts.
    pub fn can_auto_refresh(&self, st: &StateData) -> Result<bool, DeviceError> {
        if !st.get_opt::<bool>(SEEDED_KEY)?.unwrap_or(false) {
            return Ok(false);
        }
        let dev = device::device(st)?;
        if dev.has_model() && dev.is_registered() {
            return Ok(true);
        }
        if self.inner.config.daemon.classic && !dev.has_model() {
            return Ok(false);
        }
        Ok(registration::registration_attempts(st)? >= 3)
    }

    /// Creates a change resealing the keys, optionally rebooting after.
    pub fn force_reseal(&self, st: &mut StateData, reboot_after: bool) -> Result<ChangeId, DeviceError> {
        let t = st.new_task(RESEAL_KEYS, "Reseal disk encryption keys");
        st.task_mut(&t)?.set(REBOOT_AFTER_KEY, &reboot_after)?;
        let chg = st.new_change("reseal", "Reseal device against boot parameters");
        st.add_task(&chg, &t)?;
        st.ensure_before(Duration::ZERO);
        Ok(chg)
    }

    /// Creates the change that marks the system seeded.
    pub fn mark_seeded_change(&self, st: &mut StateData) -> Result<ChangeId, DeviceError> {
        let t = st.new_task(MARK_SEEDED, "Mark system seeded");
        let chg = st.new_change("seed", "Initialize system state");
        st.add_task(&chg, &t)?;
        st.ensure_before(Duration::ZERO);
        Ok(chg)
    }

    pub fn known_task_kinds() -> Vec<&'static str> {
        vec![
            "create-recovery-system",
            "generate-device-key",
            MARK_SEEDED,
            "prepare-remodeling",
            "request-serial",
            RESEAL_KEYS,
            "run-hook",
            "set-model",
            UPDATE_GADGET_ASSETS,
            UPDATE_GADGET_CMDLINE,
        ]
    }

    /// Resolves once [`DeviceManager::stop`] was called.
    pub async fn wait(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        if stopped.wait_for(|s| *s).await.is_err() {
            warn!("Device manager stop signal dropped");
        }
    }

    /// Stops ensure passes and releases registration waiters.
    pub fn stop(&self) {
        self.inner.stopped.send_replace(true);
        info!("Device manager stopped");
    }
}

/// Appends `tasks` to `chg`, each waiting for the previous one.
pub(crate) fn add_chain(st: &mut StateData, chg: &ChangeId, tasks: &[TaskId]) -> Result<(), fleet_shared::StateError> {
    for (i, id) in tasks.iter().enumerate() {
        if i > 0 {
            st.task_mut(id)?.wait_for(&tasks[i - 1]);
        }
        st.add_task(chg, id)?;
    }
    Ok(())
}

/// Model assertion of the global device identity.
pub fn find_model(st: &StateData) -> Result<Model, DeviceError> {
    let dev = device::device(st)?;
    if !dev.has_model() {
        return Err(DeviceError::NoState);
    }
    match st.assertions().find_model(&dev.brand, &dev.model) {
        Ok(m) => Ok(m.clone()),
        Err(e) if e.is_not_found() => Err(DeviceError::NoState),
        Err(e) => Err(e.into()),
    }
}

/// Serial assertion of `dev`, or of the global device identity.
pub fn find_serial(st: &StateData, dev: Option<&DeviceState>) -> Result<Serial, DeviceError> {
    let dev = match dev {
        Some(d) => d.clone(),
        None => device::device(st)?,
    };
    if dev.serial.is_empty() {
        return Err(DeviceError::NoState);
    }
    match st.assertions().find_serial(&dev.brand, &dev.model, &dev.serial) {
        Ok(s) => Ok(s.clone()),
        Err(e) if e.is_not_found() => Err(DeviceError::NoState),
        Err(e) => Err(e.into()),
    }
}
