use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use porter_types::TaskId;

use crate::request::{LogicalRequest, WeakRequest};
use crate::transport::NetworkTask;

pub const DEFAULT_CLEANUP_THRESHOLD: usize = 250;

enum Slot {
    /// The caller owns the request.
    Owned(WeakRequest),
    /// Discovered without an owner; held until reconciliation hands it out.
    Pending(LogicalRequest),
}

impl Slot {
    fn upgrade(&self) -> Option<LogicalRequest> {
        match self {
            Slot::Owned(weak) => weak.upgrade(),
            Slot::Pending(request) => Some(request.clone()),
        }
    }
}

/// Result of resolving an event's task against the registry.
#[derive(Debug)]
pub enum Resolved {
    Found(LogicalRequest),
    /// Unknown task, wrapped and stored as pending.
    Adopted(LogicalRequest),
    /// The id was registered once but its request has been dropped.
    Released,
}

struct RegistryState {
    slots: HashMap<TaskId, Slot>,
    cleanup_threshold: usize,
}

/// Maps task ids to logical requests.
///
/// One map with one slot per id, so a task id can never reach two requests.
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_cleanup_threshold(DEFAULT_CLEANUP_THRESHOLD)
    }

    pub fn with_cleanup_threshold(cleanup_threshold: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                slots: HashMap::new(),
                cleanup_threshold: cleanup_threshold.max(1),
            }),
        }
    }

    /// Track a caller-owned request without keeping it alive.
    pub fn register(&self, request: &LogicalRequest, task_id: TaskId) {
        debug_assert_eq!(request.id(), task_id);
        let mut state = self.state.lock();
        state.slots.insert(task_id, Slot::Owned(request.downgrade()));
        if state.slots.len() >= state.cleanup_threshold {
            sweep(&mut state.slots);
        }
    }

    /// Hold a request strongly until reconciliation claims it.
    pub fn register_pending(&self, request: LogicalRequest, task_id: TaskId) {
        debug_assert_eq!(request.id(), task_id);
        self.state.lock().slots.insert(task_id, Slot::Pending(request));
    }

    pub fn lookup(&self, task_id: TaskId) -> Option<LogicalRequest> {
        self.state.lock().slots.get(&task_id).and_then(Slot::upgrade)
    }

    /// True if the id has a slot, live or not.
    pub fn contains(&self, task_id: TaskId) -> bool {
        self.state.lock().slots.contains_key(&task_id)
    }

    pub fn all_owned(&self) -> Vec<LogicalRequest> {
        let state = self.state.lock();
        let mut owned: Vec<_> = state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Owned(weak) => weak.upgrade(),
                Slot::Pending(_) => None,
            })
            .collect();
        owned.sort_by_key(LogicalRequest::id);
        owned
    }

    pub fn all_pending(&self) -> Vec<LogicalRequest> {
        let state = self.state.lock();
        let mut pending: Vec<_> = state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Pending(request) => Some(request.clone()),
                Slot::Owned(_) => None,
            })
            .collect();
        pending.sort_by_key(LogicalRequest::id);
        pending
    }

    /// Turn every pending entry into a non-owning one.
    pub fn demote_to_weak(&self) {
        demote(&mut self.state.lock().slots);
    }

    pub fn remove(&self, task_id: TaskId) -> bool {
        self.state.lock().slots.remove(&task_id).is_some()
    }

    /// Drop the entry only if it is caller-owned. Pending entries wait for
    /// reconciliation even after their task completed.
    pub fn remove_owned(&self, task_id: TaskId) -> bool {
        let mut state = self.state.lock();
        if matches!(state.slots.get(&task_id), Some(Slot::Owned(_))) {
            state.slots.remove(&task_id);
            true
        } else {
            false
        }
    }

    pub fn remove_all(&self) {
        self.state.lock().slots.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the request for an event's task, adopting unknown tasks as
    /// pending. Released ids are left alone.
    pub fn resolve(
        &self,
        task: &Arc<dyn NetworkTask>,
        wrap: impl FnOnce(Arc<dyn NetworkTask>) -> LogicalRequest,
    ) -> Resolved {
        let id = task.id();
        let mut state = self.state.lock();
        match state.slots.get(&id) {
            Some(slot) => match slot.upgrade() {
                Some(request) => Resolved::Found(request),
                None => Resolved::Released,
            },
            None => {
                let request = wrap(task.clone());
                state.slots.insert(id, Slot::Pending(request.clone()));
                Resolved::Adopted(request)
            }
        }
    }

    /// Diff the transport's live tasks against the registry in one step.
    ///
    /// Tasks with a live owner are skipped. Unknown tasks, and tasks whose
    /// owner dropped them, are wrapped as pending unless they already
    /// completed: a completed task reaches the registry through its completion
    /// event instead. Every pending entry is returned and then demoted to
    /// weak, so the caller now owns them.
    pub fn reconcile(
        &self,
        tasks: Vec<Arc<dyn NetworkTask>>,
        mut wrap: impl FnMut(Arc<dyn NetworkTask>) -> LogicalRequest,
    ) -> Vec<LogicalRequest> {
        let mut state = self.state.lock();
        for task in tasks {
            let id = task.id();
            let tracked = match state.slots.get(&id) {
                Some(Slot::Owned(weak)) => weak.is_live(),
                Some(Slot::Pending(_)) => true,
                None => false,
            };
            if !tracked && !task.is_completed() {
                state.slots.insert(id, Slot::Pending(wrap(task)));
            }
        }
        let mut vended: Vec<_> = state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Pending(request) => Some(request.clone()),
                Slot::Owned(_) => None,
            })
            .collect();
        demote(&mut state.slots);
        vended.sort_by_key(LogicalRequest::id);
        vended
    }

    #[cfg(test)]
    fn set_cleanup_threshold(&self, threshold: usize) {
        self.state.lock().cleanup_threshold = threshold.max(1);
    }
}

fn demote(slots: &mut HashMap<TaskId, Slot>) {
    for slot in slots.values_mut() {
        if let Slot::Pending(request) = slot {
            *slot = Slot::Owned(request.downgrade());
        }
    }
}

fn sweep(slots: &mut HashMap<TaskId, Slot>) {
    let before = slots.len();
    slots.retain(|_, slot| match slot {
        Slot::Owned(weak) => weak.is_live(),
        Slot::Pending(_) => true,
    });
    debug!(before, after = slots.len(), "swept released registry entries");
}
