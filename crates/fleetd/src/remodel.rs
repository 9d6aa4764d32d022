//! Remodel contexts.
//!
//! A remodel moves the device to a new model assertion. How much of the
//! device identity survives depends on what changed between the models:
//!
//! - same brand, model and store: only the model revision moves on
//! - same brand and model, new store: a new store session is needed
//! - new brand or model: the device must register again
//!
//! For the last two kinds the context keeps its own copy of the device
//! identity on the remodel change. Stores built for the remodel read and
//! write that copy; the global identity stays untouched until `finish`
//! commits the copy at the end of a successful remodel.

use crate::boot::GroundDeviceContext;
use crate::devicemgr::{add_chain, find_model, find_serial, Inner};
use crate::error::{DeviceError, TaskError};
use crate::registration::{RegistrationContext, SEEDED_KEY};
use crate::store::{DeviceBackend, StoreContext, StoreService};
use chrono::Utc;
use fleet_shared::device::{self, DeviceState};
use fleet_shared::systems::{self, SeededSystem};
use fleet_shared::{Assertion, ChangeId, Model, Serial, StateData, StateGuard, TaskId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

pub const REMODEL_KIND: &str = "remodel";

const NEW_MODEL_KEY: &str = "new-model";
const DEVICE_KEY: &str = "device";
const RECOVERY_LABEL_KEY: &str = "recovery-system-label";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemodelKind {
    UpdateRemodel,
    StoreSwitchRemodel,
    ReregRemodel,
}

impl fmt::Display for RemodelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemodelKind::UpdateRemodel => "revision update remodel",
            RemodelKind::StoreSwitchRemodel => "store switch remodel",
            RemodelKind::ReregRemodel => "re-registration remodel",
        };
        f.write_str(s)
    }
}

/// Kind of remodel from `old` to `new`. Only brand, model and store count.
pub fn classify_remodel(old: &Model, new: &Model) -> RemodelKind {
    if old.brand_id != new.brand_id || old.model != new.model {
        RemodelKind::ReregRemodel
    } else if old.store != new.store {
        RemodelKind::StoreSwitchRemodel
    } else {
        RemodelKind::UpdateRemodel
    }
}

fn cache_key(chg: &str) -> String {
    format!("remodel-ctx/{}", chg)
}

#[derive(Default)]
struct Association {
    change: Option<ChangeId>,
    /// Identity kept in memory until the context is tied to a change
    detached: DeviceState,
}

/// Device identity as seen from inside a remodel.
pub struct RemodelDeviceBackend {
    assoc: Mutex<Association>,
    model: Model,
}

impl RemodelDeviceBackend {
    fn new(detached: DeviceState, model: Model) -> Self {
        Self {
            assoc: Mutex::new(Association {
                change: None,
                detached,
            }),
            model,
        }
    }

    fn associate(&self, chg: &ChangeId) {
        let mut assoc = self.assoc.lock().unwrap_or_else(PoisonError::into_inner);
        assoc.change = Some(chg.clone());
    }

    fn detached(&self) -> DeviceState {
        self.assoc.lock().unwrap_or_else(PoisonError::into_inner).detached.clone()
    }

    fn change(&self) -> Option<ChangeId> {
        self.assoc.lock().unwrap_or_else(PoisonError::into_inner).change.clone()
    }
}

impl DeviceBackend for RemodelDeviceBackend {
    fn device(&self, st: &StateData) -> Result<DeviceState, DeviceError> {
        match self.change() {
            Some(chg) => Ok(st.change(&chg)?.get(DEVICE_KEY)?),
            None => Ok(self.detached()),
        }
    }

    fn set_device(&self, st: &mut StateData, device: &DeviceState) -> Result<(), DeviceError> {
        match self.change() {
            Some(chg) => Ok(st.change_mut(&chg)?.set(DEVICE_KEY, device)?),
            None => {
                self.assoc.lock().unwrap_or_else(PoisonError::into_inner).detached = device.clone();
                Ok(())
            }
        }
    }

    fn model(&self, _st: &StateData) -> Result<Model, DeviceError> {
        Ok(self.model.clone())
    }

    fn serial(&self, st: &StateData) -> Result<Serial, DeviceError> {
        let dev = self.device(st)?;
        find_serial(st, Some(&dev))
    }
}

enum Variant {
    Update,
    NewStore {
        backend: Arc<RemodelDeviceBackend>,
        store: Arc<dyn StoreService>,
    },
    Rereg {
        backend: Arc<RemodelDeviceBackend>,
        store: Arc<dyn StoreService>,
        orig_model: Model,
        orig_serial: Serial,
    },
}

pub struct RemodelContext {
    variant: Variant,
    old_model: Model,
    new_model: Model,
    system_mode: String,
}

impl RemodelContext {
    /// Builds the context for moving from `old` to `new`. Must be called
    /// with the lock held; nothing is persisted until [`RemodelContext::init`].
    pub(crate) fn new(inner: &Inner, st: &StateData, old: &Model, new: &Model) -> Result<Self, DeviceError> {
        let new_store = |dev: DeviceState| {
            let backend = Arc::new(RemodelDeviceBackend::new(dev, new.clone()));
            let ctx = StoreContext::new(inner.state.clone(), backend.clone());
            (backend.clone(), inner.stores.new_store(ctx))
        };

        let variant = match classify_remodel(old, new) {
            RemodelKind::UpdateRemodel => Variant::Update,
            RemodelKind::StoreSwitchRemodel => {
                let mut dev = device::device(st)?;
                dev.session_macaroon.clear();
                let (backend, store) = new_store(dev);
                Variant::NewStore { backend, store }
            }
            RemodelKind::ReregRemodel => {
                let dev = device::device(st)?;
                let orig_serial = find_serial(st, Some(&dev)).map_err(|e| {
                    DeviceError::Invalid(format!(
                        "cannot find current serial before proceeding with re-registration: {}",
                        e
                    ))
                })?;
                let snapshot = DeviceState {
                    brand: new.brand_id.clone(),
                    model: new.model.clone(),
                    key_id: dev.key_id.clone(),
                    ..DeviceState::default()
                };
                let (backend, store) = new_store(snapshot);
                Variant::Rereg {
                    backend,
                    store,
                    orig_model: old.clone(),
                    orig_serial,
                }
            }
        };

        Ok(Self {
            variant,
            old_model: old.clone(),
            new_model: new.clone(),
            system_mode: inner.config.daemon.system_mode.clone(),
        })
    }

    pub fn kind(&self) -> RemodelKind {
        match self.variant {
            Variant::Update => RemodelKind::UpdateRemodel,
            Variant::NewStore { .. } => RemodelKind::StoreSwitchRemodel,
            Variant::Rereg { .. } => RemodelKind::ReregRemodel,
        }
    }

    pub fn model(&self) -> &Model {
        &self.new_model
    }

    pub fn ground_context(&self) -> GroundDeviceContext {
        GroundDeviceContext::new(self.old_model.clone(), &self.system_mode)
    }

    /// Backend mediating device identity; `None` for revision updates,
    /// which keep using the global identity.
    pub fn device_backend(&self) -> Option<Arc<dyn DeviceBackend>> {
        self.backend().map(|b| b as Arc<dyn DeviceBackend>)
    }

    fn backend(&self) -> Option<Arc<RemodelDeviceBackend>> {
        match &self.variant {
            Variant::Update => None,
            Variant::NewStore { backend, .. } | Variant::Rereg { backend, .. } => Some(backend.clone()),
        }
    }

    /// Store bound to the remodel identity. Use with the lock released.
    pub fn store(&self) -> Option<Arc<dyn StoreService>> {
        match &self.variant {
            Variant::Update => None,
            Variant::NewStore { store, .. } | Variant::Rereg { store, .. } => Some(store.clone()),
        }
    }

    /// Device identity as seen by the remodel.
    pub fn device(&self, st: &StateData) -> Result<DeviceState, DeviceError> {
        match self.backend() {
            Some(b) => b.device(st),
            None => Ok(device::device(st)?),
        }
    }

    pub fn set_device(&self, st: &mut StateData, dev: &DeviceState) -> Result<(), DeviceError> {
        match self.backend() {
            Some(b) => b.set_device(st, dev),
            None => Ok(device::set_device(st, dev)?),
        }
    }

    /// Persists the new model and the remodel identity on `chg` and
    /// caches the context for the tasks of the change.
    pub fn init(self: &Arc<Self>, st: &mut StateData, chg: &ChangeId) -> Result<(), DeviceError> {
        st.change_mut(chg)?.set(NEW_MODEL_KEY, &self.new_model.encode()?)?;
        if let Some(backend) = self.backend() {
            let dev = backend.detached();
            st.change_mut(chg)?.set(DEVICE_KEY, &dev)?;
            backend.associate(chg);
        }
        st.cache(&cache_key(chg), self.clone());
        Ok(())
    }

    pub fn set_recovery_system_label(&self, st: &mut StateData, chg: &ChangeId, label: &str) -> Result<(), DeviceError> {
        Ok(st.change_mut(chg)?.set(RECOVERY_LABEL_KEY, label)?)
    }

    /// Commits the remodel: the remodel identity becomes the global one
    /// and the boot environment switches to the new model.
    pub(crate) fn finish(&self, inner: &Inner, st: &mut StateGuard<'_>, chg: &ChangeId) -> Result<(), DeviceError> {
        if let Some(backend) = self.backend() {
            let dev = backend.device(st)?;
            device::set_device(st, &dev)?;
            if dev.is_registered() {
                inner.mark_registered();
            }
        }
        self.update_run_mode_system(inner, st, chg)
    }

    fn update_run_mode_system(&self, inner: &Inner, st: &mut StateGuard<'_>, chg: &ChangeId) -> Result<(), DeviceError> {
        if !self.new_model.grade.is_set() {
            return Ok(());
        }
        let boot = inner.boot.clone();
        if !boot.has_system_seed()? {
            return Ok(());
        }
        let label: String = st.change(chg)?.get_opt(RECOVERY_LABEL_KEY)?.ok_or_else(|| {
            DeviceError::Internal("recovery system label is unset during remodel finish".to_string())
        })?;

        let from = self.ground_context();
        let to = GroundDeviceContext::new(self.new_model.clone(), &self.system_mode);
        boot.device_change(&from, &to, st).map_err(DeviceError::SwitchDevice)?;

        systems::record_seeded_system(
            st,
            SeededSystem {
                system: label.clone(),
                model: self.new_model.model.clone(),
                brand_id: self.new_model.brand_id.clone(),
                revision: self.new_model.revision,
                timestamp: self.new_model.timestamp,
                seed_time: Utc::now(),
            },
        )
        .map_err(DeviceError::RecordSeededSystem)?;
        systems::set_default_recovery_system(st, &label)?;
        boot.mark_recovery_capable_system(&label)
            .map_err(|source| DeviceError::MarkRecoveryCapable { label, source })
    }
}

/// Re-registration seen through the registration contract.
pub struct ReregRegistration {
    ctx: Arc<RemodelContext>,
}

impl ReregRegistration {
    /// `None` unless `ctx` is a re-registration remodel.
    pub fn new(ctx: Arc<RemodelContext>) -> Option<Self> {
        let rereg = matches!(ctx.variant, Variant::Rereg { .. });
        rereg.then_some(Self { ctx })
    }

    fn originals(&self) -> (&Model, &Serial) {
        match &self.ctx.variant {
            Variant::Rereg {
                orig_model, orig_serial, ..
            } => (orig_model, orig_serial),
            _ => unreachable!("re-registration context without original identity"),
        }
    }
}

impl RegistrationContext for ReregRegistration {
    fn for_remodeling(&self) -> bool {
        true
    }

    fn device(&self, st: &StateData) -> Result<DeviceState, DeviceError> {
        self.ctx.device(st)
    }

    fn set_device(&self, st: &mut StateData, device: &DeviceState) -> Result<(), DeviceError> {
        self.ctx.set_device(st, device)
    }

    fn model(&self) -> &Model {
        &self.ctx.new_model
    }

    fn gadget_for_serial_request_config(&self) -> &str {
        &self.originals().0.gadget
    }

    fn serial_request_extra_headers(&self) -> BTreeMap<String, String> {
        let (model, serial) = self.originals();
        BTreeMap::from([
            ("original-brand-id".to_string(), model.brand_id.clone()),
            ("original-model".to_string(), model.model.clone()),
            ("original-serial".to_string(), serial.serial.clone()),
        ])
    }

    fn serial_request_ancillary_assertions(&self) -> Vec<Assertion> {
        vec![
            Assertion::Model(self.ctx.new_model.clone()),
            Assertion::Serial(self.originals().1.clone()),
        ]
    }

    fn finish_registration(&self, st: &mut StateData, serial: &Serial) -> Result<(), DeviceError> {
        let mut dev = self.ctx.device(st)?;
        dev.serial = serial.serial.clone();
        self.ctx.set_device(st, &dev)
    }
}

/// The context of remodel change `chg`, rebuilt from the change when it
/// is not cached.
pub(crate) fn remodel_ctx_for_change(
    inner: &Inner,
    st: &mut StateData,
    chg: &ChangeId,
) -> Result<Arc<RemodelContext>, DeviceError> {
    let key = cache_key(chg);
    if let Some(ctx) = st.cached::<RemodelContext>(&key) {
        return Ok(ctx);
    }

    let encoded: String = st.change(chg)?.get(NEW_MODEL_KEY)?;
    let new_model = match Assertion::decode(&encoded) {
        Ok(Assertion::Model(m)) => m,
        _ => {
            return Err(DeviceError::Internal(
                "cannot use a remodel new-model, wrong type".to_string(),
            ))
        }
    };
    let old_model = find_model(st)?;
    let ctx = RemodelContext::new(inner, st, &old_model, &new_model)?;
    if let Some(backend) = ctx.backend() {
        backend.associate(chg);
    }
    debug!("Rebuilt {} context for change {}", ctx.kind(), chg);
    let ctx = Arc::new(ctx);
    st.cache(&key, ctx.clone());
    Ok(ctx)
}

fn remodel_ctx_for_task(inner: &Inner, st: &mut StateData, task: &TaskId) -> Result<(Arc<RemodelContext>, ChangeId), DeviceError> {
    let chg = st
        .task(task)?
        .change()
        .cloned()
        .ok_or_else(|| DeviceError::Internal(format!("task {} is not part of a change", task)))?;
    Ok((remodel_ctx_for_change(inner, st, &chg)?, chg))
}

/// Drops cached contexts of remodels that are over.
pub(crate) fn cleanup_cache(st: &mut StateData) {
    let done: Vec<ChangeId> = st
        .changes()
        .filter(|c| c.kind() == REMODEL_KIND && st.change_ready(c.id()))
        .map(|c| c.id().clone())
        .collect();
    for chg in done {
        st.uncache(&cache_key(&chg));
    }
}

/// Model and mode a task operates under: the new model inside a remodel.
pub struct DeviceCtx {
    pub model: Model,
    pub system_mode: String,
    pub for_remodeling: bool,
}

pub(crate) fn device_ctx(inner: &Inner, st: &mut StateData, task: &TaskId) -> Result<DeviceCtx, DeviceError> {
    let chg = st.task(task)?.change().cloned();
    if let Some(chg) = chg {
        if st.change(&chg)?.kind() == REMODEL_KIND {
            let ctx = remodel_ctx_for_change(inner, st, &chg)?;
            return Ok(DeviceCtx {
                model: ctx.new_model.clone(),
                system_mode: ctx.system_mode.clone(),
                for_remodeling: true,
            });
        }
    }
    Ok(DeviceCtx {
        model: find_model(st)?,
        system_mode: inner.config.daemon.system_mode.clone(),
        for_remodeling: false,
    })
}

/// Validates a remodel to `new` and creates its change.
pub(crate) fn remodel(inner: &Inner, st: &mut StateGuard<'_>, new: Model) -> Result<ChangeId, DeviceError> {
    if !st.get_opt::<bool>(SEEDED_KEY)?.unwrap_or(false) {
        return Err(DeviceError::Invalid("cannot remodel until fully seeded".to_string()));
    }
    if inner.config.daemon.classic {
        return Err(DeviceError::Invalid("cannot remodel a classic system".to_string()));
    }
    let old = find_model(st)?;
    if old.grade != new.grade {
        return Err(DeviceError::Invalid(format!(
            "cannot remodel from grade {} to grade {}",
            old.grade, new.grade
        )));
    }
    if old.key() == new.key() && new.revision <= old.revision {
        return Err(DeviceError::Invalid(format!(
            "cannot remodel to older revision {} of model {} than last revision {} known to the device",
            new.revision,
            new.key(),
            old.revision
        )));
    }
    check_no_concurrent_remodel(st)?;

    let ctx = Arc::new(RemodelContext::new(inner, st, &old, &new)?);
    let kind = ctx.kind();
    if kind == RemodelKind::StoreSwitchRemodel {
        if let Some(store) = ctx.store() {
            st.unlocked(|| store.ensure_device_session()).map_err(|e| {
                DeviceError::Invalid(format!(
                    "cannot get a store session based on the new model assertion: {}",
                    e
                ))
            })?;
        }
        // state may have moved while unlocked
        check_no_concurrent_remodel(st)?;
    }

    let mut tasks = Vec::new();
    if kind == RemodelKind::ReregRemodel {
        tasks.push(st.new_task("request-serial", "Request new device serial"));
        tasks.push(st.new_task("prepare-remodeling", "Prepare remodeling"));
    }
    if new.grade.is_set() && inner.boot.has_system_seed()? {
        let label = Utc::now().format("%Y%m%d").to_string();
        let t = st.new_task(
            "create-recovery-system",
            &format!("Create recovery system with label {:?}", label),
        );
        st.task_mut(&t)?.set(RECOVERY_LABEL_KEY, &label)?;
        tasks.push(t);
    }
    tasks.push(st.new_task("set-model", "Set new model assertion"));

    let summary = if kind == RemodelKind::UpdateRemodel {
        format!(
            "Refresh model assertion from revision {} to {}",
            old.revision, new.revision
        )
    } else {
        format!("Remodel device to {} ({})", new.key(), kind)
    };
    let chg = st.new_change(REMODEL_KIND, &summary);
    add_chain(st, &chg, &tasks)?;
    ctx.init(st, &chg)?;
    info!("Started {} from {} to {}", kind, old.key(), new.key());
    st.ensure_before(Duration::ZERO);
    Ok(chg)
}

fn check_no_concurrent_remodel(st: &StateData) -> Result<(), DeviceError> {
    let clash = st
        .changes()
        .any(|c| c.kind() == REMODEL_KIND && !st.change_ready(c.id()));
    if clash {
        return Err(DeviceError::Invalid(
            "cannot start remodel, clashing with concurrent remodel".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn do_prepare_remodeling(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    let (ctx, _) = remodel_ctx_for_task(inner, st, id)?;
    let Some(store) = ctx.store() else {
        return Ok(());
    };
    st.unlocked(|| store.ensure_device_session()).map_err(|e| {
        TaskError::Failed(format!(
            "cannot get a store session based on the new model assertion: {}",
            e
        ))
    })?;
    st.task_mut(id)?.logf("Obtained store session for the new model");
    Ok(())
}

pub(crate) fn do_create_recovery_system(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    let (ctx, chg) = remodel_ctx_for_task(inner, st, id)?;
    let label: String = st.task(id)?.get(RECOVERY_LABEL_KEY)?;
    let boot = inner.boot.clone();
    let model = ctx.model().clone();
    st.unlocked(|| boot.create_recovery_system(&label, &model))
        .map_err(|e| TaskError::Failed(format!("cannot create recovery system {:?}: {}", label, e)))?;
    ctx.set_recovery_system_label(st, &chg, &label)?;
    Ok(())
}

pub(crate) fn do_set_model(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    let (ctx, chg) = remodel_ctx_for_task(inner, st, id)?;
    let new_model = ctx.model().clone();
    match st.assertions_mut().add_model(new_model.clone()) {
        Err(e) if e.is_already_accepted() => {}
        r => r?,
    }

    let mut dev = ctx.device(st)?;
    dev.brand = new_model.brand_id.clone();
    dev.model = new_model.model.clone();
    ctx.set_device(st, &dev)?;

    ctx.finish(inner, st, &chg)?;
    st.uncache(&cache_key(&chg));
    st.task_mut(id)?.logf(format!("Set new model {} revision {}", new_model.key(), new_model.revision));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::ModelGrade;

    fn model(brand: &str, name: &str, store: &str) -> Model {
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

    #[test]
    fn test_classify_remodel() {
        let old = model("acme", "box", "");
        assert_eq!(classify_remodel(&old, &model("acme", "box", "")), RemodelKind::UpdateRemodel);
        assert_eq!(classify_remodel(&old, &model("acme", "box", "acme-store")), RemodelKind::StoreSwitchRemodel);
        assert_eq!(classify_remodel(&old, &model("acme", "box-2", "")), RemodelKind::ReregRemodel);
        assert_eq!(classify_remodel(&old, &model("other", "box", "acme-store")), RemodelKind::ReregRemodel);
    }

    #[test]
    fn test_classify_ignores_other_headers() {
        let old = model("acme", "box", "");
        let mut new = old.clone();
        new.revision = 7;
        new.required_snaps = vec!["extra".to_string()];
        new.gadget = "other-gadget".to_string();
        assert_eq!(classify_remodel(&old, &new), RemodelKind::UpdateRemodel);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(RemodelKind::ReregRemodel.to_string(), "re-registration remodel");
        assert_eq!(RemodelKind::StoreSwitchRemodel.to_string(), "store switch remodel");
    }

    #[test]
    fn test_detached_backend_keeps_device_in_memory() {
        let st = fleet_shared::State::new();
        let backend = RemodelDeviceBackend::new(DeviceState::default(), model("acme", "box", ""));
        let mut g = st.lock();
        let dev = DeviceState {
            brand: "acme".to_string(),
            session_macaroon: "remodel-session".to_string(),
            ..DeviceState::default()
        };
        backend.set_device(&mut g, &dev).unwrap();
        assert_eq!(backend.device(&g).unwrap(), dev);
        assert_eq!(device::device(&g).unwrap(), DeviceState::default());

        let chg = g.new_change(REMODEL_KIND, "remodel");
        g.change_mut(&chg).unwrap().set(DEVICE_KEY, &dev).unwrap();
        backend.associate(&chg);
        let mut moved = dev.clone();
        moved.serial = "new-serial".to_string();
        backend.set_device(&mut g, &moved).unwrap();
        let on_change: DeviceState = g.change(&chg).unwrap().get(DEVICE_KEY).unwrap();
        assert_eq!(on_change, moved);
        assert_eq!(device::device(&g).unwrap(), DeviceState::default());
    }
}
