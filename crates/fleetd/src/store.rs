//! Store access bound to a device identity.
//!
//! A store never reads the global identity directly. It goes through a
//! [`StoreContext`], which takes the state lock and asks its
//! [`DeviceBackend`]. The global backend reads and writes the persisted
//! identity; a remodel installs its own backend so that a new store can
//! be bootstrapped with credentials that stay private to the remodel.

use crate::devicemgr::{find_model, find_serial};
use crate::error::{DeviceError, StoreError};
use fleet_shared::device::{self, DeviceState};
use fleet_shared::{Model, Serial, State, StateData};
use std::sync::Arc;
use tracing::debug;

/// Where a store context reads and writes device identity.
pub trait DeviceBackend: Send + Sync {
    fn device(&self, st: &StateData) -> Result<DeviceState, DeviceError>;

    fn set_device(&self, st: &mut StateData, device: &DeviceState) -> Result<(), DeviceError>;

    fn model(&self, st: &StateData) -> Result<Model, DeviceError>;

    fn serial(&self, st: &StateData) -> Result<Serial, DeviceError>;
}

/// Backend over the persisted device identity.
pub struct GlobalDeviceBackend;

impl DeviceBackend for GlobalDeviceBackend {
    fn device(&self, st: &StateData) -> Result<DeviceState, DeviceError> {
        Ok(device::device(st)?)
    }

    fn set_device(&self, st: &mut StateData, device: &DeviceState) -> Result<(), DeviceError> {
        Ok(device::set_device(st, device)?)
    }

    fn model(&self, st: &StateData) -> Result<Model, DeviceError> {
        find_model(st)
    }

    fn serial(&self, st: &StateData) -> Result<Serial, DeviceError> {
        find_serial(st, None)
    }
}

/// Identity access handed to a store. Every call takes the state lock,
/// so stores must only be used with the lock released.
#[derive(Clone)]
pub struct StoreContext {
    state: State,
    backend: Arc<dyn DeviceBackend>,
}

impl StoreContext {
    pub fn new(state: State, backend: Arc<dyn DeviceBackend>) -> Self {
        Self { state, backend }
    }

    pub fn device(&self) -> Result<DeviceState, DeviceError> {
        let st = self.state.lock();
        self.backend.device(&st)
    }

    /// Records a new device session for the backing identity.
    pub fn update_device_session(&self, macaroon: &str) -> Result<(), DeviceError> {
        let mut st = self.state.lock();
        let mut dev = self.backend.device(&st)?;
        dev.session_macaroon = macaroon.to_string();
        self.backend.set_device(&mut st, &dev)
    }

    pub fn model(&self) -> Result<Model, DeviceError> {
        let st = self.state.lock();
        self.backend.model(&st)
    }

    pub fn serial(&self) -> Result<Serial, DeviceError> {
        let st = self.state.lock();
        self.backend.serial(&st)
    }
}

pub trait StoreService: Send + Sync {
    /// Makes sure a device session exists, acquiring one if needed.
    fn ensure_device_session(&self) -> Result<(), StoreError>;
}

pub trait StoreFactory: Send + Sync {
    fn new_store(&self, ctx: StoreContext) -> Arc<dyn StoreService>;
}

/// Store used when no store client is configured.
pub struct OfflineStore {
    ctx: StoreContext,
}

impl StoreService for OfflineStore {
    fn ensure_device_session(&self) -> Result<(), StoreError> {
        let dev = self.ctx.device().map_err(|e| StoreError::Session(e.to_string()))?;
        if !dev.session_macaroon.is_empty() {
            debug!("Reusing existing device session");
            return Ok(());
        }
        Err(StoreError::Unavailable("no store client configured".to_string()))
    }
}

pub struct OfflineStoreFactory;

impl StoreFactory for OfflineStoreFactory {
    fn new_store(&self, ctx: StoreContext) -> Arc<dyn StoreService> {
        Arc::new(OfflineStore { ctx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_session_goes_to_global_device() {
        let st = State::new();
        let ctx = StoreContext::new(st.clone(), Arc::new(GlobalDeviceBackend));
        ctx.update_device_session("macaroon").unwrap();

        let g = st.lock();
        assert_eq!(device::device(&g).unwrap().session_macaroon, "macaroon");
    }

    #[test]
    fn test_offline_store() {
        let st = State::new();
        let ctx = StoreContext::new(st.clone(), Arc::new(GlobalDeviceBackend));
        let store = OfflineStoreFactory.new_store(ctx.clone());
        assert!(store.ensure_device_session().is_err());

        ctx.update_device_session("macaroon").unwrap();
        assert!(store.ensure_device_session().is_ok());
    }

    #[test]
    fn test_model_without_identity_is_no_state() {
        let st = State::new();
        let ctx = StoreContext::new(st, Arc::new(GlobalDeviceBackend));
        assert!(ctx.model().unwrap_err().is_no_state());
    }
}
