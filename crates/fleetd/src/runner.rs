//! Task runner.
//!
//! Runs pending tasks through the handlers registered for their kind.
//! Each handler gets the locked state and its task id. A handler can
//! finish the task, ask for a retry later, fail it (which holds the rest
//! of the change and undoes finished tasks that know how), or park it in
//! `Wait` until a restart.
//!
//! A task counts as running (`Doing`/`Undoing`) for as long as its handler
//! runs, including while the handler has the state lock released. Blocked
//! predicates see those tasks when `ensure` passes run on several threads.

use crate::error::TaskError;
use chrono::Utc;
use fleet_shared::{State, StateData, StateGuard, Status, Task, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type Handler = Arc<dyn Fn(&mut StateGuard<'_>, &TaskId) -> Result<(), TaskError> + Send + Sync>;

/// Returns true when a task must not start while `running` are in flight.
pub type BlockedPredicate = Arc<dyn Fn(&StateData, &Task, &[&Task]) -> bool + Send + Sync>;

/// Upper bound on handler runs per ensure pass.
const MAX_RUNS_PER_PASS: usize = 1000;

struct Handlers {
    run: Handler,
    undo: Option<Handler>,
}

pub struct TaskRunner {
    state: State,
    handlers: HashMap<String, Handlers>,
    blocked: Vec<BlockedPredicate>,
}

impl TaskRunner {
    pub fn new(state: State) -> Self {
        Self {
            state,
            handlers: HashMap::new(),
            blocked: Vec::new(),
        }
    }

    pub fn add_handler<F>(&mut self, kind: &str, run: F)
    where
        F: Fn(&mut StateGuard<'_>, &TaskId) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.handlers.insert(
            kind.to_string(),
            Handlers {
                run: Arc::new(run),
                undo: None,
            },
        );
    }

    pub fn add_handler_with_undo<F, U>(&mut self, kind: &str, run: F, undo: U)
    where
        F: Fn(&mut StateGuard<'_>, &TaskId) -> Result<(), TaskError> + Send + Sync + 'static,
        U: Fn(&mut StateGuard<'_>, &TaskId) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.handlers.insert(
            kind.to_string(),
            Handlers {
                run: Arc::new(run),
                undo: Some(Arc::new(undo)),
            },
        );
    }

    pub fn add_blocked<P>(&mut self, pred: P)
    where
        P: Fn(&StateData, &Task, &[&Task]) -> bool + Send + Sync + 'static,
    {
        self.blocked.push(Arc::new(pred));
    }

    /// Task kinds with a registered handler, sorted.
    pub fn known_task_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Runs tasks until none is runnable. Returns how many handler runs happened.
    pub fn ensure(&self) -> usize {
        let mut runs = 0;
        while runs < MAX_RUNS_PER_PASS {
            let next = {
                let st = self.state.lock();
                self.next_task(&st)
            };
            let Some((id, undo)) = next else {
                break;
            };
            self.run_one(&id, undo);
            runs += 1;
        }
        runs
    }

    fn next_task(&self, st: &StateData) -> Option<(TaskId, bool)> {
        let now = Utc::now();
        let running: Vec<&Task> = st
            .tasks()
            .filter(|t| matches!(t.status(), Status::Doing | Status::Undoing))
            .collect();

        for t in st.tasks() {
            if t.at_time().is_some_and(|at| at > now) {
                continue;
            }
            match t.status() {
                Status::Do => {
                    if !self.handlers.contains_key(t.kind()) {
                        continue;
                    }
                    let deps_done = t
                        .wait_tasks()
                        .iter()
                        .all(|w| st.task(w).map(|w| w.status() == Status::Done).unwrap_or(true));
                    if !deps_done {
                        continue;
                    }
                    if self.blocked.iter().any(|p| p(st, t, &running)) {
                        debug!("Task {} ({}) blocked", t.id(), t.kind());
                        continue;
                    }
                    return Some((t.id().clone(), false));
                }
                Status::Undo => {
                    // Undo in reverse: wait for dependents to be undone first.
                    let dependents_pending = st.tasks().any(|o| {
                        o.wait_tasks().contains(t.id())
                            && matches!(
                                o.status(),
                                Status::Undo | Status::Undoing | Status::Doing | Status::Done | Status::Wait
                            )
                            && self.has_undo(o.kind())
                    });
                    if !dependents_pending {
                        return Some((t.id().clone(), true));
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn has_undo(&self, kind: &str) -> bool {
        self.handlers.get(kind).is_some_and(|h| h.undo.is_some())
    }

    fn run_one(&self, id: &TaskId, undo: bool) {
        let mut st = self.state.lock();
        let Ok(kind) = st.task(id).map(|t| t.kind().to_string()) else {
            return;
        };
        let handler = match self.handlers.get(&kind) {
            Some(h) if undo => h.undo.clone(),
            Some(h) => Some(h.run.clone()),
            None => None,
        };
        let Some(handler) = handler else {
            if let Ok(t) = st.task_mut(id) {
                t.set_status(if undo { Status::Undone } else { Status::Hold });
            }
            return;
        };

        if let Ok(t) = st.task_mut(id) {
            t.set_status(if undo { Status::Undoing } else { Status::Doing });
        }
        debug!("Running {} task {} ({})", if undo { "undo" } else { "do" }, id, kind);

        let res = handler(&mut st, id);

        let chg = match st.task_mut(id) {
            Ok(t) => {
                let chg = t.change().cloned();
                match res {
                    Ok(()) => {
                        t.set_at_time(None);
                        match t.status() {
                            Status::Doing => t.set_status(Status::Done),
                            Status::Undoing => t.set_status(Status::Undone),
                            _ => {}
                        }
                        None
                    }
                    Err(TaskError::Retry { after, reason }) => {
                        t.set_status(if undo { Status::Undo } else { Status::Do });
                        let after = chrono::Duration::from_std(after).unwrap_or(chrono::Duration::zero());
                        t.set_at_time(Some(Utc::now() + after));
                        if !reason.is_empty() {
                            t.logf(&reason);
                        }
                        debug!("Task {} ({}) will retry: {}", id, kind, reason);
                        None
                    }
                    Err(TaskError::Failed(msg)) => {
                        t.errorf(&msg);
                        t.set_status(Status::Error);
                        warn!("Task {} ({}) failed: {}", id, kind, msg);
                        if undo {
                            None
                        } else {
                            chg
                        }
                    }
                }
            }
            Err(_) => None,
        };

        if let Some(chg) = chg {
            self.abort_change(&mut st, &chg);
        }
    }

    /// Holds pending tasks of a failed change and schedules undos.
    fn abort_change(&self, st: &mut StateData, chg: &str) {
        let ids: Vec<TaskId> = st.change_tasks(chg).iter().map(|t| t.id().clone()).collect();
        for id in ids {
            let Ok(t) = st.task_mut(&id) else {
                continue;
            };
            match t.status() {
                Status::Do => t.set_status(Status::Hold),
                Status::Done | Status::Wait if self.has_undo(t.kind()) => t.set_status(Status::Undo),
                _ => {}
            }
        }
        info!("Change {} aborted", chg);
    }
}
