//! Registration state machine.
//!
//! `ensure_operational` decides on every ensure pass whether to start a
//! "become-operational" change. The change runs the optional
//! prepare-device hook, generates the device key and, on a full attempt,
//! requests a serial from the device service.
//!
//! Serial requests go through a [`RegistrationContext`], so the same task
//! handlers serve both the first registration of a device and the
//! re-registration done by a remodel.

use crate::devicemgr::{add_chain, find_model, Inner};
use crate::error::{DeviceError, ServiceError, TaskError};
use crate::hooks::HookSetup;
use crate::remodel::{self, ReregRegistration, REMODEL_KIND};
use crate::service::SerialRequest;
use chrono::{DateTime, Utc};
use fleet_shared::device::{self, DeviceState};
use fleet_shared::snap::{self, SnapInfo};
use fleet_shared::{Assertion, Model, ModelGrade, Serial, StateData, StateGuard, TaskId};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

pub const BECOME_OPERATIONAL: &str = "become-operational";
pub const SEEDED_KEY: &str = "seeded";
pub(crate) const PAUSED_KEY: &str = "registration-paused";
const ATTEMPTS_KEY: &str = "registration-attempts";
const LAST_ATTEMPT_KEY: &str = "registration-last-attempt";
const STORE_ACCESS_KEY: &str = "store-access";
const PREPARE_DEVICE_HOOK: &str = "prepare-device";
const TENTATIVES_KEY: &str = "tentatives";

const INITIAL_BACKOFF: Duration = Duration::from_secs(5 * 60);
const MAX_BACKOFF: Duration = Duration::from_secs(12 * 60 * 60);
const LONG_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Pacing of full registration attempts.
pub struct Backoff;

impl Backoff {
    /// Time to wait after `attempts` full attempts before the next one.
    pub fn interval(attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        match INITIAL_BACKOFF.checked_mul(factor) {
            Some(d) if d <= MAX_BACKOFF => d,
            _ => LONG_BACKOFF,
        }
    }

    /// Whether an attempt at `now` would come too early.
    pub fn should_backoff(attempts: u32, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last else {
            return false;
        };
        let wait = chrono::Duration::from_std(Self::interval(attempts)).unwrap_or(chrono::Duration::zero());
        now < last + wait
    }
}

/// Full registration attempts made so far.
pub fn registration_attempts(st: &StateData) -> Result<u32, DeviceError> {
    Ok(st.get_opt(ATTEMPTS_KEY)?.unwrap_or(0))
}

/// What a serial request is made for and where its result goes.
pub trait RegistrationContext {
    fn for_remodeling(&self) -> bool;

    fn device(&self, st: &StateData) -> Result<DeviceState, DeviceError>;

    fn set_device(&self, st: &mut StateData, device: &DeviceState) -> Result<(), DeviceError>;

    /// Model the serial is requested for.
    fn model(&self) -> &Model;

    /// Gadget whose configuration selects the device service.
    fn gadget_for_serial_request_config(&self) -> &str;

    fn serial_request_extra_headers(&self) -> BTreeMap<String, String>;

    fn serial_request_ancillary_assertions(&self) -> Vec<Assertion>;

    /// Records the obtained serial.
    fn finish_registration(&self, st: &mut StateData, serial: &Serial) -> Result<(), DeviceError>;
}

/// First registration of the device against the global identity.
pub struct InitialRegistration {
    model: Model,
}

impl RegistrationContext for InitialRegistration {
    fn for_remodeling(&self) -> bool {
        false
    }

    fn device(&self, st: &StateData) -> Result<DeviceState, DeviceError> {
        Ok(device::device(st)?)
    }

    fn set_device(&self, st: &mut StateData, device: &DeviceState) -> Result<(), DeviceError> {
        Ok(device::set_device(st, device)?)
    }

    fn model(&self) -> &Model {
        &self.model
    }

    fn gadget_for_serial_request_config(&self) -> &str {
        &self.model.gadget
    }

    fn serial_request_extra_headers(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn serial_request_ancillary_assertions(&self) -> Vec<Assertion> {
        vec![Assertion::Model(self.model.clone())]
    }

    fn finish_registration(&self, st: &mut StateData, serial: &Serial) -> Result<(), DeviceError> {
        let mut dev = device::device(st)?;
        dev.serial = serial.serial.clone();
        device::set_device(st, &dev)?;
        st.ensure_before(Duration::ZERO);
        Ok(())
    }
}

/// Registration context for the change `task` belongs to.
pub(crate) fn registration_context(
    inner: &Inner,
    st: &mut StateData,
    task: &TaskId,
) -> Result<Box<dyn RegistrationContext>, DeviceError> {
    let chg = st.task(task)?.change().cloned();
    if let Some(chg) = chg {
        if st.change(&chg)?.kind() == REMODEL_KIND {
            let ctx = remodel::remodel_ctx_for_change(inner, st, &chg)?;
            if let Some(rereg) = ReregRegistration::new(ctx) {
                return Ok(Box::new(rereg));
            }
        }
    }
    Ok(Box::new(InitialRegistration { model: find_model(st)? }))
}

fn fallback_model(inner: &Inner) -> Model {
    let reg = &inner.config.registration;
    Model {
        brand_id: reg.fallback_brand.clone(),
        model: reg.fallback_model.clone(),
        grade: ModelGrade::Unset,
        classic: true,
        gadget: String::new(),
        kernel: String::new(),
        base: String::new(),
        store: String::new(),
        revision: 0,
        timestamp: DateTime::<Utc>::default(),
        required_snaps: Vec::new(),
    }
}

fn set_fallback_model(inner: &Inner, st: &mut StateData, dev: &mut DeviceState) -> Result<(), DeviceError> {
    let model = fallback_model(inner);
    match st.assertions_mut().add_model(model.clone()) {
        Err(e) if e.is_already_accepted() => {}
        r => r?,
    }
    info!("No model set on a seeded system, using fallback model {}", model.key());
    dev.brand = model.brand_id;
    dev.model = model.model;
    device::set_device(st, dev)?;
    Ok(())
}

/// Starts registration when the device is ready for it. Deferrals are
/// not errors; they just wait for a later pass.
pub(crate) fn ensure_operational(inner: &Inner, st: &mut StateData) -> Result<(), DeviceError> {
    let mut dev = device::device(st)?;
    if dev.is_registered() {
        inner.mark_registered();
        return Ok(());
    }

    let seeded = st.get_opt::<bool>(SEEDED_KEY)?.unwrap_or(false);
    if inner.config.daemon.classic && !seeded {
        return Ok(());
    }

    let attempt_finished = st
        .changes()
        .any(|c| c.kind() == BECOME_OPERATIONAL && st.change_ready(c.id()));
    if attempt_finished {
        inner.signal_first_attempt();
    }

    if !dev.has_model() {
        if !seeded {
            return Ok(());
        }
        set_fallback_model(inner, st, &mut dev)?;
    }

    let in_flight = st
        .changes()
        .any(|c| c.kind() == BECOME_OPERATIONAL && !st.change_ready(c.id()));
    if in_flight {
        return Ok(());
    }

    let model = match find_model(st) {
        Err(e) if e.is_no_state() => {
            return Err(DeviceError::Internal(
                "device brand and model are set but there is no model assertion".to_string(),
            ))
        }
        r => r?,
    };

    let mut has_prepare_hook = false;
    if !model.gadget.is_empty() {
        let Some(snapst) = snap::snap_state(st, &model.gadget)? else {
            debug!("Gadget {} not installed yet, deferring registration", model.gadget);
            return Ok(());
        };
        let Some(si) = snapst.current_side_info() else {
            return Ok(());
        };
        let info = SnapInfo::read(&inner.config.paths.snap_mount_dir, si)?;
        has_prepare_hook = info.has_hook(PREPARE_DEVICE_HOOK);
    }

    if st.get_opt::<String>(STORE_ACCESS_KEY)?.as_deref() == Some("offline") {
        debug!("Store access is offline, not registering");
        return Ok(());
    }

    let full = match st.get_opt::<bool>(PAUSED_KEY)? {
        Some(true) => return Ok(()),
        Some(false) => true,
        None => !inner.config.registration.pause_first_attempt,
    };

    if full {
        let attempts = registration_attempts(st)?;
        let last: Option<DateTime<Utc>> = st.get_opt(LAST_ATTEMPT_KEY)?;
        let now = Utc::now();
        if Backoff::should_backoff(attempts, last, now) {
            return Ok(());
        }
        st.set(ATTEMPTS_KEY, &(attempts + 1))?;
        st.set(LAST_ATTEMPT_KEY, &now)?;
    } else {
        info!("Pausing registration after device key generation");
        st.set(PAUSED_KEY, &true)?;
    }

    let mut tasks = Vec::new();
    if has_prepare_hook {
        let t = st.new_task("run-hook", &format!("Run {} hook", PREPARE_DEVICE_HOOK));
        st.task_mut(&t)?.set(
            "hook-setup",
            &HookSetup {
                snap: model.gadget.clone(),
                hook: PREPARE_DEVICE_HOOK.to_string(),
                optional: true,
            },
        )?;
        tasks.push(t);
    }
    tasks.push(st.new_task("generate-device-key", "Generate device key"));
    if full {
        tasks.push(st.new_task("request-serial", "Request device serial"));
    }

    let chg = st.new_change(BECOME_OPERATIONAL, "Initialize device");
    add_chain(st, &chg, &tasks)?;
    info!("Started device registration for {} ({} tasks)", model.key(), tasks.len());
    st.ensure_before(Duration::ZERO);
    Ok(())
}

pub(crate) fn do_run_hook(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    let setup: HookSetup = st.task(id)?.get("hook-setup")?;
    let Some(si) = snap::snap_state(st, &setup.snap)?.and_then(|s| s.current_side_info().cloned()) else {
        return Err(TaskError::Failed(format!("snap {:?} is not installed", setup.snap)));
    };
    let dir = snap::mount_dir(&inner.config.paths.snap_mount_dir, &si.real_name, si.revision);
    let hooks = inner.hooks.clone();
    st.unlocked(|| hooks.run_hook(&setup, &dir))
        .map_err(|e| TaskError::Failed(e.to_string()))
}

pub(crate) fn do_generate_device_key(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    let ctx = registration_context(inner, st, id)?;
    if !ctx.device(st)?.key_id.is_empty() {
        return Ok(());
    }

    let keys = inner.keys.clone();
    let key_id = st.unlocked(|| keys.generate()).map_err(DeviceError::Key)?;

    let mut dev = ctx.device(st)?;
    dev.key_id = key_id;
    ctx.set_device(st, &dev)?;
    st.task_mut(id)?.logf(format!("Generated device key {}", dev.key_id));
    st.ensure_before(Duration::ZERO);
    Ok(())
}

pub(crate) fn do_request_serial(inner: &Inner, st: &mut StateGuard<'_>, id: &TaskId) -> Result<(), TaskError> {
    let ctx = registration_context(inner, st, id)?;
    let dev = ctx.device(st)?;
    if dev.key_id.is_empty() {
        return Err(TaskError::Failed("internal error: cannot find device key pair".to_string()));
    }
    let model = ctx.model().clone();

    let existing: Vec<Serial> = st
        .assertions()
        .find_serials_for_key(&model.brand_id, &model.model, &dev.key_id)
        .into_iter()
        .cloned()
        .collect();
    match existing.as_slice() {
        [serial] => {
            ctx.finish_registration(st, serial)?;
            if !ctx.for_remodeling() {
                inner.mark_registered();
            }
            return Ok(());
        }
        [] => {}
        many => {
            return Err(TaskError::Failed(format!(
                "cannot find a unique serial for device key {}: found {}",
                dev.key_id,
                many.len()
            )))
        }
    }

    let service = inner.service.clone();
    let request_id = match st.unlocked(|| service.request_id()) {
        Ok(rid) => rid,
        Err(e) => return service_failure(inner, st, id, e),
    };

    let mut headers = BTreeMap::new();
    headers.insert("brand-id".to_string(), model.brand_id.clone());
    headers.insert("model".to_string(), model.model.clone());
    headers.insert("request-id".to_string(), request_id);
    headers.insert("device-key-id".to_string(), dev.key_id.clone());
    headers.insert("timestamp".to_string(), Utc::now().to_rfc3339());
    headers.extend(ctx.serial_request_extra_headers());

    let signer = inner.signer.clone();
    let key_id = dev.key_id.clone();
    let request = st
        .unlocked(|| signer.sign_request(&key_id, headers, None))
        .map_err(DeviceError::Key)?;
    let req = SerialRequest {
        request,
        ancillary: ctx.serial_request_ancillary_assertions(),
        gadget: ctx.gadget_for_serial_request_config().to_string(),
    };

    let serial = match st.unlocked(|| service.submit(&req)) {
        Ok(serial) => serial,
        Err(e) => return service_failure(inner, st, id, e),
    };

    if serial.brand_id != model.brand_id || serial.model != model.model || serial.device_key_id != dev.key_id {
        return Err(TaskError::Failed(format!(
            "obtained serial assertion for {}/{} does not match provided device identity information ({}/{})",
            serial.brand_id, serial.model, model.brand_id, model.model
        )));
    }
    match st.assertions_mut().add_serial(serial.clone()) {
        Err(e) if e.is_already_accepted() => {}
        r => r?,
    }
    ctx.finish_registration(st, &serial)?;
    if !ctx.for_remodeling() {
        inner.mark_registered();
    }
    st.task_mut(id)?.logf(format!("Obtained serial {}", serial.serial));
    info!("Device registered as {}/{} serial {}", serial.brand_id, serial.model, serial.serial);
    Ok(())
}

fn service_failure(inner: &Inner, st: &mut StateData, id: &TaskId, err: ServiceError) -> Result<(), TaskError> {
    let reg = &inner.config.registration;
    match err {
        ServiceError::Poll => {
            let after = Duration::from_secs(reg.poll_interval_secs);
            Err(TaskError::retry(
                after,
                format!("Will poll for device serial assertion in {} seconds", after.as_secs()),
            ))
        }
        ServiceError::Transient(msg) => {
            let t = st.task_mut(id)?;
            let tentatives = t.get_opt::<u32>(TENTATIVES_KEY)?.unwrap_or(0) + 1;
            t.set(TENTATIVES_KEY, &tentatives)?;
            if tentatives >= reg.max_tentatives {
                return Err(TaskError::Failed(format!("cannot deliver device serial request: {}", msg)));
            }
            let after = Duration::from_secs(reg.retry_interval_secs);
            Err(TaskError::retry(
                after,
                format!("Will retry device serial request in {} seconds: {}", after.as_secs(), msg),
            ))
        }
        ServiceError::Rejected(msg) => Err(TaskError::Failed(format!("cannot deliver device serial request: {}", msg))),
    }
}
