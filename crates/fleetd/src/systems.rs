//! Seeding completion.

use crate::devicemgr::{find_model, Inner};
use crate::error::{DeviceError, TaskError};
use crate::registration::SEEDED_KEY;
use chrono::Utc;
use fleet_shared::systems::{self, SeededSystem};
use fleet_shared::{StateGuard, TaskId};
use std::time::Duration;
use tracing::info;

pub const MARK_SEEDED: &str = "mark-seeded";

/// Marks the system seeded. On graded models the recovery system the
/// device was installed from becomes the first seeded system.
pub(crate) fn do_mark_seeded(inner: &Inner, st: &mut StateGuard<'_>, _id: &TaskId) -> Result<(), TaskError> {
    if st.get_opt::<bool>(SEEDED_KEY)?.unwrap_or(false) {
        return Ok(());
    }

    let model = match find_model(st) {
        Ok(m) => Some(m),
        Err(e) if e.is_no_state() => None,
        Err(e) => return Err(e.into()),
    };
    if let Some(model) = model.filter(|m| m.grade.is_set()) {
        let modeenv = inner.boot.read_modeenv().map_err(DeviceError::from)?;
        if !modeenv.recovery_system.is_empty() {
            systems::record_seeded_system(
                st,
                SeededSystem {
                    system: modeenv.recovery_system.clone(),
                    model: model.model.clone(),
                    brand_id: model.brand_id.clone(),
                    revision: model.revision,
                    timestamp: model.timestamp,
                    seed_time: Utc::now(),
                },
            )
            .map_err(DeviceError::RecordSeededSystem)?;
            systems::set_default_recovery_system(st, &modeenv.recovery_system)?;
        }
    }

    st.set(SEEDED_KEY, &true)?;
    info!("System seeded");
    st.ensure_before(Duration::ZERO);
    Ok(())
}
