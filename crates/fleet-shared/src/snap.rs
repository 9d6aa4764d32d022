//! Installed snap bookkeeping.
//!
//! Only what the device manager needs: which revision of a snap is
//! current, where it is mounted, and its basic metadata.

use crate::error::{SnapError, StateError};
use crate::state::StateData;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const SNAPS_KEY: &str = "snaps";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub i32);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "x{}", -self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapType {
    #[default]
    App,
    Gadget,
    Kernel,
    Base,
    Os,
    Snapd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SideInfo {
    pub real_name: String,
    pub revision: Revision,
    #[serde(default)]
    pub snap_id: String,
}

/// What a task operating on a snap is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapSetup {
    pub side_info: SideInfo,
    #[serde(rename = "type")]
    pub snap_type: SnapType,
}

impl SnapSetup {
    pub fn instance_name(&self) -> &str {
        &self.side_info.real_name
    }

    pub fn revision(&self) -> Revision {
        self.side_info.revision
    }
}

/// Installed revisions of one snap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapState {
    #[serde(rename = "type")]
    pub snap_type: SnapType,
    pub sequence: Vec<SideInfo>,
    pub current: Revision,
    #[serde(default)]
    pub active: bool,
}

impl SnapState {
    pub fn current_side_info(&self) -> Option<&SideInfo> {
        self.sequence.iter().find(|si| si.revision == self.current)
    }
}

/// `<mount_root>/<name>/<revision>`
pub fn mount_dir(mount_root: &Path, name: &str, revision: Revision) -> PathBuf {
    mount_root.join(name).join(revision.to_string())
}

pub fn snap_state(st: &StateData, name: &str) -> Result<Option<SnapState>, StateError> {
    let snaps: BTreeMap<String, SnapState> = st.get_opt(SNAPS_KEY)?.unwrap_or_default();
    Ok(snaps.get(name).cloned())
}

pub fn set_snap_state(st: &mut StateData, name: &str, snapst: SnapState) -> Result<(), StateError> {
    let mut snaps: BTreeMap<String, SnapState> = st.get_opt(SNAPS_KEY)?.unwrap_or_default();
    snaps.insert(name.to_string(), snapst);
    st.set(SNAPS_KEY, &snaps)
}

#[derive(Debug, Deserialize)]
struct SnapYaml {
    name: String,
    #[serde(default, rename = "type")]
    snap_type: SnapType,
    #[serde(default)]
    version: String,
}

/// Metadata of a mounted snap revision.
#[derive(Debug, Clone)]
pub struct SnapInfo {
    pub name: String,
    pub snap_type: SnapType,
    pub version: String,
    pub revision: Revision,
    pub mount_dir: PathBuf,
    pub hooks: Vec<String>,
}

impl SnapInfo {
    /// Reads `meta/snap.yaml` and the hook names of a mounted revision.
    pub fn read(mount_root: &Path, side_info: &SideInfo) -> Result<Self, SnapError> {
        let dir = mount_dir(mount_root, &side_info.real_name, side_info.revision);
        let path = dir.join("meta").join("snap.yaml");
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapError::NotInstalled {
                    name: side_info.real_name.clone(),
                    revision: side_info.revision.0,
                    path,
                })
            }
            Err(source) => return Err(SnapError::Io { path, source }),
        };
        let y: SnapYaml =
            serde_yaml::from_slice(&content).map_err(|source| SnapError::Yaml { path: path.clone(), source })?;

        let hooks_dir = dir.join("meta").join("hooks");
        let mut hooks = Vec::new();
        if let Ok(entries) = fs::read_dir(&hooks_dir) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    hooks.push(name.to_string());
                }
            }
        }
        hooks.sort();

        Ok(Self {
            name: y.name,
            snap_type: y.snap_type,
            version: y.version,
            revision: side_info.revision,
            mount_dir: dir,
            hooks,
        })
    }

    pub fn has_hook(&self, hook: &str) -> bool {
        self.hooks.iter().any(|h| h == hook)
    }
}
