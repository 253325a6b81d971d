use conductor_core::{ConductorError, ConductorResult, Task, TaskId, TaskState};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Shared handle to one task record; the mutex is the per-task lock.
pub type TaskHandle = Arc<Mutex<Task>>;

/// Authoritative task records plus the reverse dependency index.
///
/// Admission and archival are serialized by a short admission lock so the
/// dependency graph never references a task that is not there. Everything
/// else touches one task lock at a time; the admission lock, when taken, is
/// always taken before any task lock.
#[derive(Default)]
pub struct TaskStore {
    tasks: DashMap<TaskId, TaskHandle>,
    /// dependency -> tasks that depend on it
    dependents: DashMap<TaskId, BTreeSet<TaskId>>,
    admission: Mutex<()>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert a batch of new tasks.
    ///
    /// Members of the batch may depend on each other. Each task's state is
    /// set to `Pending` when every dependency is already completed and to
    /// `Blocked` otherwise. `on_admit` sees each task right before it is
    /// inserted; the values it returns are held until the whole batch is
    /// visible, then dropped.
    pub fn admit_with<T>(
        &self,
        mut batch: Vec<Task>,
        mut on_admit: impl FnMut(&Task) -> T,
    ) -> ConductorResult<Vec<Task>> {
        let _admission = self.admission.lock();

        let mut batch_ids = HashSet::new();
        for task in &batch {
            if self.tasks.contains_key(&task.id) || !batch_ids.insert(task.id.clone()) {
                return Err(ConductorError::TaskValidation(format!(
                    "task '{}' already exists",
                    task.id
                )));
            }
        }

        let mut existing_states: HashMap<TaskId, TaskState> = HashMap::new();
        for task in &batch {
            for dep in &task.dependencies {
                if batch_ids.contains(dep) || existing_states.contains_key(dep) {
                    continue;
                }
                let state = self.state_of(dep).ok_or_else(|| {
                    ConductorError::TaskDependency(format!(
                        "task '{}' depends on unknown task '{dep}'",
                        task.id
                    ))
                })?;
                if matches!(state, TaskState::Failed | TaskState::Cancelled) {
                    return Err(ConductorError::TaskDependency(format!(
                        "task '{}' depends on '{dep}', which is {state}",
                        task.id
                    )));
                }
                existing_states.insert(dep.clone(), state);
            }
        }

        if let Some(cycle) = find_cycle(&batch) {
            let path: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
            return Err(ConductorError::TaskDependency(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }

        for task in &mut batch {
            let ready = task
                .dependencies_met(|dep| existing_states.get(dep) == Some(&TaskState::Completed));
            task.state = if ready {
                TaskState::Pending
            } else {
                TaskState::Blocked
            };
        }

        let mut held = Vec::with_capacity(batch.len());
        for task in &batch {
            held.push(on_admit(task));
            self.index(task);
            self.tasks
                .insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
        }
        drop(held);
        Ok(batch)
    }

    /// Put back a task rebuilt by recovery.
    pub fn restore(&self, task: Task) {
        self.index(&task);
        self.tasks.insert(task.id.clone(), Arc::new(Mutex::new(task)));
    }

    /// Remove a terminal task that no live task depends on.
    ///
    /// `on_archive` runs under the task lock and may veto by returning an
    /// error; its value is returned after the record is gone.
    pub fn archive_with<T>(
        &self,
        id: &TaskId,
        on_archive: impl FnOnce(&Task) -> ConductorResult<T>,
    ) -> ConductorResult<T> {
        let _admission = self.admission.lock();
        let handle = self
            .get(id)
            .ok_or_else(|| ConductorError::NotFound(format!("task '{id}'")))?;

        // Terminal states are absorbing, so this check cannot go stale.
        let live: Vec<TaskId> = self
            .dependents_of(id)
            .into_iter()
            .filter(|d| self.state_of(d).is_some_and(|s| !s.is_terminal()))
            .collect();
        if !live.is_empty() {
            return Err(ConductorError::TaskValidation(format!(
                "task '{id}' still has {} unfinished dependent(s)",
                live.len()
            )));
        }

        let task = handle.lock();
        if !task.state.is_terminal() {
            return Err(ConductorError::TaskValidation(format!(
                "task '{id}' is {} and cannot be archived",
                task.state
            )));
        }
        let out = on_archive(&task)?;
        for dep in &task.dependencies {
            if let Some(mut set) = self.dependents.get_mut(dep) {
                set.remove(id);
            }
        }
        self.dependents.remove(id);
        self.tasks.remove(id);
        Ok(out)
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskHandle> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn state_of(&self, id: &TaskId) -> Option<TaskState> {
        self.get(id).map(|handle| handle.lock().state)
    }

    /// Tasks that list `id` as a dependency.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Blocked dependents of `completed` whose dependencies are now all
    /// completed. Reads only; the caller performs the transitions.
    pub fn ready_dependents(&self, completed: &TaskId) -> Vec<TaskId> {
        self.dependents_of(completed)
            .into_iter()
            .filter(|id| {
                let Some(handle) = self.get(id) else {
                    return false;
                };
                let (state, deps) = {
                    let task = handle.lock();
                    (task.state, task.dependencies.clone())
                };
                state == TaskState::Blocked
                    && deps
                        .iter()
                        .all(|dep| self.state_of(dep) == Some(TaskState::Completed))
            })
            .collect()
    }

    /// Whether every dependency of `id` is completed.
    pub fn dependencies_completed(&self, id: &TaskId) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        let deps = handle.lock().dependencies.clone();
        deps.iter()
            .all(|dep| self.state_of(dep) == Some(TaskState::Completed))
    }

    /// First dependency of `id` that ended failed or cancelled.
    pub fn has_dead_dependency(&self, id: &TaskId) -> Option<TaskId> {
        let deps = self.get(id)?.lock().dependencies.clone();
        deps.into_iter().find(|dep| {
            matches!(
                self.state_of(dep),
                Some(TaskState::Failed | TaskState::Cancelled)
            )
        })
    }

    pub fn handles(&self) -> Vec<TaskHandle> {
        self.tasks.iter().map(|e| e.value().clone()).collect()
    }

    /// Copies of every task record, ordered by id.
    pub fn snapshot(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.handles().iter().map(|h| h.lock().clone()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    fn index(&self, task: &Task) {
        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task.id.clone());
        }
    }
}

/// Depth-first search for a cycle among `batch`. Returns the cycle as a path
/// that starts and ends on the same task.
///
/// Tasks outside the batch cannot depend on batch members, so edges leaving
/// the batch are never followed.
pub fn find_cycle(batch: &[Task]) -> Option<Vec<TaskId>> {
    let graph: HashMap<&TaskId, &BTreeSet<TaskId>> =
        batch.iter().map(|t| (&t.id, &t.dependencies)).collect();
    // 1 = on the current path, 2 = fully explored
    let mut visited: HashMap<&TaskId, u8> = HashMap::new();
    let mut path: Vec<&TaskId> = Vec::new();

    fn dfs<'a>(
        id: &'a TaskId,
        graph: &HashMap<&'a TaskId, &'a BTreeSet<TaskId>>,
        visited: &mut HashMap<&'a TaskId, u8>,
        path: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        match visited.get(id) {
            Some(1) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<TaskId> = path[start..].iter().map(|p| (*p).clone()).collect();
                cycle.push(id.clone());
                return Some(cycle);
            }
            Some(2) => return None,
            _ => {}
        }
        visited.insert(id, 1);
        path.push(id);
        if let Some(deps) = graph.get(id).copied() {
            for dep in deps {
                if graph.contains_key(dep) {
                    if let Some(cycle) = dfs(dep, graph, visited, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        visited.insert(id, 2);
        None
    }

    for task in batch {
        if let Some(cycle) = dfs(&task.id, &graph, &mut visited, &mut path) {
            return Some(cycle);
        }
    }
    None
}
