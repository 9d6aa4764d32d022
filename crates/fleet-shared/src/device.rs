//! Persisted device identity.
//!
//! The identity is a single global record. Both accessors take the
//! locked state so it can only be read or written under the lock.

use crate::error::StateError;
use crate::state::StateData;
use serde::{Deserialize, Serialize};

const DEVICE_KEY: &str = "device";

/// Brand, model, serial and key of this device plus the store session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brand: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_macaroon: String,
}

impl DeviceState {
    pub fn is_registered(&self) -> bool {
        !self.serial.is_empty()
    }

    pub fn has_model(&self) -> bool {
        !self.brand.is_empty() && !self.model.is_empty()
    }
}

/// Current device identity; empty when nothing was recorded yet.
pub fn device(st: &StateData) -> Result<DeviceState, StateError> {
    Ok(st.get_opt(DEVICE_KEY)?.unwrap_or_default())
}

pub fn set_device(st: &mut StateData, device: &DeviceState) -> Result<(), StateError> {
    st.set(DEVICE_KEY, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    #[test]
    fn test_device_defaults_to_empty() {
        let st = State::new();
        let g = st.lock();
        let d = device(&g).unwrap();
        assert_eq!(d, DeviceState::default());
        assert!(!d.is_registered());
        assert!(!d.has_model());
    }

    #[test]
    fn test_set_device() {
        let st = State::new();
        let mut g = st.lock();
        let d = DeviceState {
            brand: "canonical".to_string(),
            model: "pc".to_string(),
            serial: "serialserial".to_string(),
            ..Default::default()
        };
        set_device(&mut g, &d).unwrap();
        assert_eq!(device(&g).unwrap(), d);
        assert!(d.is_registered());
    }
}
