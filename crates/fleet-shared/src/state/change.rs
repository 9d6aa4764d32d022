//! Changes and tasks tracked by the state store.

use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub type ChangeId = String;
pub type TaskId = String;

/// Lifecycle status of a task (and, aggregated, of a change).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Do,
    Doing,
    Done,
    Abort,
    Undo,
    Undoing,
    Undone,
    Hold,
    Error,
    /// Parked until an external event, usually a system restart
    Wait,
}

impl Status {
    /// Whether nothing more will happen to a task in this status.
    pub fn ready(&self) -> bool {
        matches!(self, Status::Done | Status::Undone | Status::Hold | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Abort => "Abort",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Hold => "Hold",
            Status::Error => "Error",
            Status::Wait => "Wait",
        };
        f.write_str(s)
    }
}

pub(crate) fn kv_get<T: DeserializeOwned>(map: &BTreeMap<String, Value>, key: &str) -> Result<T, StateError> {
    let raw = map.get(key).ok_or_else(|| StateError::NoState(key.to_string()))?;
    serde_json::from_value(raw.clone()).map_err(|source| StateError::Decode {
        key: key.to_string(),
        source,
    })
}

pub(crate) fn kv_get_opt<T: DeserializeOwned>(map: &BTreeMap<String, Value>, key: &str) -> Result<Option<T>, StateError> {
    match kv_get(map, key) {
        Ok(v) => Ok(Some(v)),
        Err(StateError::NoState(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn kv_set<T: Serialize + ?Sized>(map: &mut BTreeMap<String, Value>, key: &str, value: &T) -> Result<(), StateError> {
    let raw = serde_json::to_value(value).map_err(|source| StateError::Encode {
        key: key.to_string(),
        source,
    })?;
    map.insert(key.to_string(), raw);
    Ok(())
}

/// A unit of work run by a handler registered for its kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    kind: String,
    summary: String,
    status: Status,
    #[serde(default)]
    change: Option<ChangeId>,
    #[serde(default)]
    wait_tasks: Vec<TaskId>,
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    log: Vec<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    at_time: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            change: None,
            wait_tasks: Vec::new(),
            data: BTreeMap::new(),
            log: Vec::new(),
            error: None,
            at_time: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn change(&self) -> Option<&ChangeId> {
        self.change.as_ref()
    }

    pub(crate) fn set_change(&mut self, chg: &ChangeId) {
        self.change = Some(chg.clone());
    }

    /// Makes this task run only after `other` is done.
    pub fn wait_for(&mut self, other: &TaskId) {
        if !self.wait_tasks.contains(other) {
            self.wait_tasks.push(other.clone());
        }
    }

    pub fn wait_tasks(&self) -> &[TaskId] {
        &self.wait_tasks
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        kv_get(&self.data, key)
    }

    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        kv_get_opt(&self.data, key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        kv_set(&mut self.data, key, value)
    }

    pub fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }

    /// Appends a timestamped line to the task log.
    pub fn logf(&mut self, msg: impl AsRef<str>) {
        self.log
            .push(format!("{} INFO {}", Utc::now().to_rfc3339(), msg.as_ref()));
    }

    /// Records an error: logged and kept as the task's failure reason.
    pub fn errorf(&mut self, msg: impl AsRef<str>) {
        self.log
            .push(format!("{} ERROR {}", Utc::now().to_rfc3339(), msg.as_ref()));
        self.error = Some(msg.as_ref().to_string());
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Earliest time the task may run again, if postponed.
    pub fn at_time(&self) -> Option<DateTime<Utc>> {
        self.at_time
    }

    pub fn set_at_time(&mut self, at: Option<DateTime<Utc>>) {
        self.at_time = at;
    }
}

/// A named group of tasks representing one user-visible operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    id: ChangeId,
    kind: String,
    summary: String,
    #[serde(default)]
    task_ids: Vec<TaskId>,
    #[serde(default)]
    data: BTreeMap<String, Value>,
    spawn_time: DateTime<Utc>,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            task_ids: Vec::new(),
            data: BTreeMap::new(),
            spawn_time: Utc::now(),
        }
    }

    pub fn id(&self) -> &ChangeId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    pub(crate) fn push_task(&mut self, id: &TaskId) {
        self.task_ids.push(id.clone());
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        kv_get(&self.data, key)
    }

    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        kv_get_opt(&self.data, key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        kv_set(&mut self.data, key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kv_and_log() {
        let mut t = Task::new("1".to_string(), "request-serial", "Request device serial");
        assert!(t.get::<String>("missing").unwrap_err().is_no_state());
        assert_eq!(t.get_opt::<String>("missing").unwrap(), None);

        t.set("label", "20240101").unwrap();
        assert_eq!(t.get::<String>("label").unwrap(), "20240101");

        t.logf("hello");
        t.errorf("boom");
        assert_eq!(t.log().len(), 2);
        assert!(t.log()[1].contains("ERROR boom"));
        assert_eq!(t.error(), Some("boom"));
    }

    #[test]
    fn test_wait_for_dedup() {
        let mut t = Task::new("2".to_string(), "k", "s");
        t.wait_for(&"1".to_string());
        t.wait_for(&"1".to_string());
        assert_eq!(t.wait_tasks(), &["1".to_string()]);
    }

    #[test]
    fn test_status_ready() {
        assert!(Status::Done.ready());
        assert!(Status::Error.ready());
        assert!(!Status::Wait.ready());
        assert!(!Status::Do.ready());
    }
}
