//! Durable state store guarded by one coarse lock.
//!
//! All business logic runs with the lock held through a [`StateGuard`].
//! Slow collaborator calls (key generation, network, boot environment)
//! must go through [`StateGuard::unlocked`] or the [`Unlocker`] trait so
//! the lock is released around them and reacquired before returning.
//! Anything read from the state before such a call may be stale after it.

mod change;

pub use change::{Change, ChangeId, Status, Task, TaskId};

use crate::asserts::AssertionDb;
use crate::error::StateError;
use crate::restart::RestartType;
use change::{kv_get, kv_get_opt, kv_set};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Shared handle to the state. Cloning is cheap.
#[derive(Clone, Default)]
pub struct State {
    inner: Arc<Mutex<StateData>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the state lock.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            lock: &self.inner,
            guard: Some(lock_data(&self.inner)),
        }
    }

    /// Restores a state previously written by [`State::checkpoint`].
    /// The ephemeral cache always starts out empty.
    pub fn from_checkpoint(data: &[u8]) -> Result<Self, StateError> {
        let cp: Checkpoint = serde_json::from_slice(data).map_err(StateError::Checkpoint)?;
        let st = StateData {
            data: cp.data,
            changes: cp.changes,
            tasks: cp.tasks,
            last_id: cp.last_id,
            assertions: cp.assertions,
            ..StateData::default()
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(st)),
        })
    }

    pub fn checkpoint(&self) -> Result<Vec<u8>, StateError> {
        self.lock().checkpoint()
    }
}

fn lock_data(lock: &Mutex<StateData>) -> MutexGuard<'_, StateData> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scoped unlock capability handed to collaborators that block.
pub trait Unlocker {
    /// Runs `f` with the state lock released and reacquires it afterwards.
    fn run_unlocked(&mut self, f: &mut dyn FnMut());
}

/// Holds the state lock. Dereferences to [`StateData`].
pub struct StateGuard<'a> {
    lock: &'a Mutex<StateData>,
    guard: Option<MutexGuard<'a, StateData>>,
}

/// Reacquires the lock when dropped, even on unwind or cancellation.
struct Relock<'g, 'a> {
    guard: &'g mut StateGuard<'a>,
}

impl Drop for Relock<'_, '_> {
    fn drop(&mut self) {
        if self.guard.guard.is_none() {
            self.guard.guard = Some(lock_data(self.guard.lock));
        }
    }
}

impl<'a> StateGuard<'a> {
    /// Runs `f` with the lock released.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let relock = Relock { guard: self };
        relock.guard.guard = None;
        let out = f();
        drop(relock);
        out
    }

    /// Awaits `fut` with the lock released.
    pub async fn unlocked_async<F: Future>(&mut self, fut: F) -> F::Output {
        let relock = Relock { guard: self };
        relock.guard.guard = None;
        let out = fut.await;
        drop(relock);
        out
    }
}

impl Unlocker for StateGuard<'_> {
    fn run_unlocked(&mut self, f: &mut dyn FnMut()) {
        self.unlocked(f)
    }
}

impl Deref for StateGuard<'_> {
    type Target = StateData;

    fn deref(&self) -> &StateData {
        match &self.guard {
            Some(g) => g,
            None => unreachable!("state accessed while unlocked"),
        }
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut StateData {
        match &mut self.guard {
            Some(g) => g,
            None => unreachable!("state accessed while unlocked"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    changes: BTreeMap<ChangeId, Change>,
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    last_id: u64,
    #[serde(default)]
    assertions: AssertionDb,
}

/// The state itself. Only reachable through a [`StateGuard`].
#[derive(Default)]
pub struct StateData {
    data: BTreeMap<String, Value>,
    changes: BTreeMap<ChangeId, Change>,
    tasks: BTreeMap<TaskId, Task>,
    last_id: u64,
    assertions: AssertionDb,
    cache: HashMap<String, Arc<dyn Any + Send + Sync>>,
    ensure_before: Option<Duration>,
    pub(crate) restart_requests: Vec<RestartType>,
}

impl StateData {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        kv_get(&self.data, key)
    }

    /// Like [`StateData::get`] but maps a missing key to `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        kv_get_opt(&self.data, key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        kv_set(&mut self.data, key, value)
    }

    pub fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }

    pub fn assertions(&self) -> &AssertionDb {
        &self.assertions
    }

    pub fn assertions_mut(&mut self) -> &mut AssertionDb {
        &mut self.assertions
    }

    /// Stores an ephemeral value. The cache is never checkpointed.
    pub fn cache<T: Any + Send + Sync>(&mut self, key: &str, value: Arc<T>) {
        self.cache.insert(key.to_string(), value);
    }

    pub fn cached<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.cache
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub fn uncache(&mut self, key: &str) {
        self.cache.remove(key);
    }

    fn next_id(&mut self) -> String {
        self.last_id += 1;
        self.last_id.to_string()
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        let id = self.next_id();
        self.changes.insert(id.clone(), Change::new(id.clone(), kind, summary));
        id
    }

    /// Creates a task not yet attached to any change.
    pub fn new_task(&mut self, kind: &str, summary: &str) -> TaskId {
        let id = self.next_id();
        self.tasks.insert(id.clone(), Task::new(id.clone(), kind, summary));
        id
    }

    pub fn add_task(&mut self, chg: &ChangeId, task: &TaskId) -> Result<(), StateError> {
        self.task_mut(task)?.set_change(chg);
        self.change_mut(chg)?.push_task(task);
        Ok(())
    }

    pub fn change(&self, id: &str) -> Result<&Change, StateError> {
        self.changes
            .get(id)
            .ok_or_else(|| StateError::UnknownChange(id.to_string()))
    }

    pub fn change_mut(&mut self, id: &str) -> Result<&mut Change, StateError> {
        self.changes
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownChange(id.to_string()))
    }

    pub fn task(&self, id: &str) -> Result<&Task, StateError> {
        self.tasks
            .get(id)
            .ok_or_else(|| StateError::UnknownTask(id.to_string()))
    }

    pub fn task_mut(&mut self, id: &str) -> Result<&mut Task, StateError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownTask(id.to_string()))
    }

    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn change_tasks(&self, id: &str) -> Vec<&Task> {
        match self.changes.get(id) {
            Some(chg) => chg
                .task_ids()
                .iter()
                .filter_map(|t| self.tasks.get(t))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Status of a change, derived from the statuses of its tasks.
    pub fn change_status(&self, id: &str) -> Status {
        let tasks = self.change_tasks(id);
        if tasks.is_empty() {
            return Status::Hold;
        }
        const ORDER: [Status; 10] = [
            Status::Abort,
            Status::Undoing,
            Status::Undo,
            Status::Doing,
            Status::Do,
            Status::Wait,
            Status::Error,
            Status::Undone,
            Status::Done,
            Status::Hold,
        ];
        ORDER
            .into_iter()
            .find(|s| tasks.iter().any(|t| t.status() == *s))
            .unwrap_or(Status::Hold)
    }

    pub fn change_ready(&self, id: &str) -> bool {
        self.change_status(id).ready()
    }

    /// Combined error of the failed tasks of a change, if any.
    pub fn change_err(&self, id: &str) -> Option<String> {
        let lines: Vec<String> = self
            .change_tasks(id)
            .into_iter()
            .filter(|t| t.status() == Status::Error)
            .filter_map(|t| t.error().map(|e| format!("- {} ({})", t.summary(), e)))
            .collect();
        if lines.is_empty() {
            return None;
        }
        Some(format!("cannot perform the following tasks:\n{}", lines.join("\n")))
    }

    /// Asks for the next ensure pass to happen within `d`.
    pub fn ensure_before(&mut self, d: Duration) {
        self.ensure_before = Some(match self.ensure_before {
            Some(cur) if cur < d => cur,
            _ => d,
        });
    }

    pub fn take_ensure_before(&mut self) -> Option<Duration> {
        self.ensure_before.take()
    }

    fn checkpoint(&self) -> Result<Vec<u8>, StateError> {
        let cp = Checkpoint {
            data: self.data.clone(),
            changes: self.changes.clone(),
            tasks: self.tasks.clone(),
            last_id: self.last_id,
            assertions: self.assertions.clone(),
        };
        serde_json::to_vec(&cp).map_err(|source| StateError::Encode {
            key: "checkpoint".to_string(),
            source,
        })
    }
}
