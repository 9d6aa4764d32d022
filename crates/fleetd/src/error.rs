//! Error types for the device manager.

use fleet_shared::{AssertsError, SnapError, StateError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the boot environment.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("cannot read boot environment {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write boot environment {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse boot environment: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Errors from the gadget asset update engine.
#[derive(Error, Debug)]
pub enum GadgetError {
    /// No structure needed updating. Not a failure.
    #[error("nothing to update")]
    NoUpdate,

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse gadget metadata {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid gadget metadata: {0}")]
    Invalid(String),

    #[error("cannot prepare update for volume structure {name:?}: {msg}")]
    Prepare { name: String, msg: String },

    #[error("cannot backup volume structure {name:?}: {msg}")]
    Backup { name: String, msg: String },

    #[error("cannot update volume structure {name:?}: {msg}")]
    Update { name: String, msg: String },

    #[error("cannot observe gadget content: {0}")]
    Observer(String),
}

impl GadgetError {
    pub fn is_no_update(&self) -> bool {
        matches!(self, GadgetError::NoUpdate)
    }
}

/// Errors from store access.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot get device session: {0}")]
    Session(String),

    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the device key store and signer.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("cannot find device key {0:?}")]
    NotFound(String),

    #[error("cannot sign with device key: {0}")]
    Sign(String),
}

/// Outcome of talking to the device registration service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Request accepted but the serial is not issued yet.
    #[error("serial request accepted, poll later")]
    Poll,

    #[error("cannot reach device service: {0}")]
    Transient(String),

    #[error("{0}")]
    Rejected(String),
}

/// Errors of the device manager and its contexts.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Deferral sentinel: the needed state does not exist yet.
    #[error("no state")]
    NoState,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Asserts(#[from] AssertsError),

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Gadget(#[from] GadgetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("cannot switch device: {0}")]
    SwitchDevice(#[source] BootError),

    #[error("cannot record a new seeded system: {0}")]
    RecordSeededSystem(#[source] StateError),

    #[error("cannot mark system {label:?} as recovery capable: {source}")]
    MarkRecoveryCapable {
        label: String,
        #[source]
        source: BootError,
    },

    #[error("cannot read current gadget snap details: {0}")]
    CurrentGadget(String),

    #[error("cannot read candidate gadget snap details: {0}")]
    CandidateGadget(String),

    #[error("cannot read candidate kernel snap details: {0}")]
    CandidateKernel(String),

    #[error("cannot read snap details: {0}")]
    Snap(#[from] SnapError),
}

impl DeviceError {
    pub fn is_no_state(&self) -> bool {
        match self {
            DeviceError::NoState => true,
            DeviceError::State(e) => e.is_no_state(),
            _ => false,
        }
    }
}

/// Result of a task handler run.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Run again later; the task stays pending.
    #[error("{reason}")]
    Retry { after: Duration, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn retry(after: Duration, reason: impl Into<String>) -> Self {
        TaskError::Retry {
            after,
            reason: reason.into(),
        }
    }
}

impl From<DeviceError> for TaskError {
    fn from(e: DeviceError) -> Self {
        TaskError::Failed(e.to_string())
    }
}

impl From<StateError> for TaskError {
    fn from(e: StateError) -> Self {
        TaskError::Failed(e.to_string())
    }
}

impl From<AssertsError> for TaskError {
    fn from(e: AssertsError) -> Self {
        TaskError::Failed(e.to_string())
    }
}

/// Errors collected from one ensure pass.
#[derive(Error, Debug)]
#[error("state ensure errors: [{}]", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(" "))]
pub struct EnsureError(pub Vec<DeviceError>);
