//! Error types for the shared layer.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the durable state store.
#[derive(Error, Debug)]
pub enum StateError {
    /// The key has never been set. Callers usually treat this as "not yet".
    #[error("no state entry for key {0:?}")]
    NoState(String),

    #[error("cannot unmarshal state entry {key:?}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot marshal state entry {key:?}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot find change {0:?}")]
    UnknownChange(String),

    #[error("cannot find task {0:?}")]
    UnknownTask(String),

    #[error("cannot read state checkpoint: {0}")]
    Checkpoint(#[source] serde_json::Error),
}

impl StateError {
    pub fn is_no_state(&self) -> bool {
        matches!(self, StateError::NoState(_))
    }
}

/// Errors from the assertion database and assertion codecs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssertsError {
    #[error("{kind} assertion not found")]
    NotFound { kind: &'static str },

    /// Adding an assertion that is already present at the same revision.
    #[error("{kind} assertion {key:?} is already accepted at revision {revision}")]
    AlreadyAccepted {
        kind: &'static str,
        key: String,
        revision: u32,
    },

    #[error("revision {new} of {kind} assertion {key:?} is older than current revision {current}")]
    Outdated {
        kind: &'static str,
        key: String,
        new: u32,
        current: u32,
    },

    #[error("cannot decode assertion: {0}")]
    Decode(String),

    #[error("cannot encode assertion: {0}")]
    Encode(String),
}

impl AssertsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AssertsError::NotFound { .. })
    }

    pub fn is_already_accepted(&self) -> bool {
        matches!(self, AssertsError::AlreadyAccepted { .. })
    }
}

/// Errors reading installed snap metadata.
#[derive(Error, Debug)]
pub enum SnapError {
    #[error("cannot find installed snap {name:?} at revision {revision}: missing file {}", .path.display())]
    NotInstalled {
        name: String,
        revision: i32,
        path: PathBuf,
    },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
