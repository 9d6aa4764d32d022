//! Seeded recovery systems history.

use crate::error::StateError;
use crate::state::StateData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const SEEDED_SYSTEMS_KEY: &str = "seeded-systems";
const DEFAULT_RECOVERY_SYSTEM_KEY: &str = "default-recovery-system";

/// A recovery system the device was seeded from or remodeled to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SeededSystem {
    /// Recovery system label
    pub system: String,
    pub model: String,
    pub brand_id: String,
    pub revision: u32,
    pub timestamp: DateTime<Utc>,
    pub seed_time: DateTime<Utc>,
}

/// Seeded systems, most recent first.
pub fn seeded_systems(st: &StateData) -> Result<Vec<SeededSystem>, StateError> {
    Ok(st.get_opt(SEEDED_SYSTEMS_KEY)?.unwrap_or_default())
}

/// Records `sys` as the most recent seeded system.
pub fn record_seeded_system(st: &mut StateData, sys: SeededSystem) -> Result<(), StateError> {
    let mut systems = seeded_systems(st)?;
    systems.insert(0, sys);
    st.set(SEEDED_SYSTEMS_KEY, &systems)
}

pub fn default_recovery_system(st: &StateData) -> Result<Option<String>, StateError> {
    st.get_opt(DEFAULT_RECOVERY_SYSTEM_KEY)
}

pub fn set_default_recovery_system(st: &mut StateData, label: &str) -> Result<(), StateError> {
    st.set(DEFAULT_RECOVERY_SYSTEM_KEY, label)
}
