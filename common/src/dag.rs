use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::task::{Task, TaskId, TaskKind, TaskStatus, WorkerRef};

/// Errores de programación del scheduler: no se recuperan.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler invariant violated: {0}")]
    Invariant(String),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),
}

/// Qué pasó al completar una tarea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub is_last: bool,
    /// Tareas aguas abajo que quedaron listas con este resultado.
    pub unblocked: Vec<TaskId>,
}

/// Conteo de tareas por estado (para status y logs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TaskCounts {
    pub blocked: usize,
    pub ready: usize,
    pub assigned: usize,
    pub running: usize,
    pub done: usize,
}

/// Todas las tareas del job activo, indexadas por id (ids monótonos).
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    next_id: TaskId,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crea una tarea con el próximo id libre.
    pub fn add(&mut self, build: impl FnOnce(TaskId) -> Task) -> TaskId {
        self.next_id += 1;
        let id = self.next_id;
        let task = build(id);
        self.tasks.insert(id, task);
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, SchedulerError> {
        self.tasks
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownTask(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Descarta todo. Los ids siguen creciendo entre jobs.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Blocked -> Ready para toda tarea que ya juntó sus inputs.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let mut promoted = Vec::new();
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::Blocked && task.is_ready() {
                task.status = TaskStatus::Ready;
                promoted.push(task.id);
            }
        }
        promoted
    }

    /// Tareas Ready sin worker, en orden de id.
    pub fn ready_unassigned(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready && t.is_unassigned())
            .map(|t| t.id)
            .collect()
    }

    /// Ready -> Assigned.
    pub fn assign(&mut self, id: TaskId, worker: WorkerRef) -> Result<(), SchedulerError> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Ready || task.assigned_worker.is_some() {
            return Err(SchedulerError::Invariant(format!(
                "task {id} assigned while {:?} (worker {:?})",
                task.status, task.assigned_worker
            )));
        }
        task.status = TaskStatus::Assigned;
        task.assigned_worker = Some(worker);
        Ok(())
    }

    /// Pasa una tarea asignada/corriendo a otro worker sin volver a Ready
    /// (reasignación especulativa). Queda Assigned.
    pub fn reassign(&mut self, id: TaskId, worker: WorkerRef) -> Result<(), SchedulerError> {
        let task = self.task_mut(id)?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
            return Err(SchedulerError::Invariant(format!(
                "task {id} reassigned while {:?}",
                task.status
            )));
        }
        task.status = TaskStatus::Assigned;
        task.assigned_worker = Some(worker);
        Ok(())
    }

    /// Assigned -> Running.
    pub fn mark_running(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        let task = self.task_mut(id)?;
        match task.status {
            TaskStatus::Assigned => {
                task.status = TaskStatus::Running;
                Ok(())
            }
            TaskStatus::Running => Ok(()),
            other => Err(SchedulerError::Invariant(format!(
                "task {id} started while {other:?}"
            ))),
        }
    }

    /// Recuperación ante falla: Assigned/Running -> Ready, sin worker.
    /// Devuelve false si la tarea no estaba en vuelo (no hay nada que reencolar).
    pub fn requeue(&mut self, id: TaskId) -> Result<bool, SchedulerError> {
        let task = self.task_mut(id)?;
        match task.status {
            TaskStatus::Assigned | TaskStatus::Running => {
                task.status = TaskStatus::Ready;
                task.assigned_worker = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Marca la tarea como Done, corre sus hooks posteriores y pasa el
    /// resultado a cada tarea aguas abajo.
    pub fn complete(
        &mut self,
        id: TaskId,
        result_locator: &Path,
    ) -> Result<Completion, SchedulerError> {
        let task = self.task_mut(id)?;
        if task.status == TaskStatus::Done {
            return Err(SchedulerError::Invariant(format!(
                "task {id} marked done twice"
            )));
        }

        task.post_execute(result_locator);
        task.status = TaskStatus::Done;
        task.assigned_worker = None;

        let kind = task.kind;
        let is_last = task.is_last();
        let downstream = task.downstream.clone();

        let mut unblocked = Vec::new();
        for next in downstream {
            let next_task = self.task_mut(next)?;
            let was_ready = next_task.is_ready();
            next_task.inputs.push(result_locator.to_path_buf());
            if !was_ready && next_task.is_ready() {
                unblocked.push(next);
            }
        }

        Ok(Completion {
            task_id: id,
            kind,
            is_last,
            unblocked,
        })
    }

    pub fn remaining(&self, kind: TaskKind) -> usize {
        self.tasks
            .values()
            .filter(|t| t.kind == kind && !t.is_done())
            .count()
    }

    pub fn count(&self, kind: TaskKind) -> usize {
        self.tasks.values().filter(|t| t.kind == kind).count()
    }

    /// Tareas de un tipo en orden de partición.
    pub fn of_kind(&self, kind: TaskKind) -> Vec<&Task> {
        let mut out: Vec<&Task> = self.tasks.values().filter(|t| t.kind == kind).collect();
        out.sort_by_key(|t| (t.partition_index, t.id));
        out
    }

    pub fn counts(&self) -> TaskCounts {
        let mut c = TaskCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Blocked => c.blocked += 1,
                TaskStatus::Ready => c.ready += 1,
                TaskStatus::Assigned => c.assigned += 1,
                TaskStatus::Running => c.running += 1,
                TaskStatus::Done => c.done += 1,
            }
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Hook;
    use std::path::PathBuf;

    /// map -> reduce -> final, como un árbol de dos niveles.
    fn small_graph() -> (TaskGraph, TaskId, TaskId, TaskId) {
        let mut g = TaskGraph::new();
        let last = g.add(|id| {
            Task::new(id, TaskKind::Reduce, "word_count")
                .requiring(1)
                .after(Hook::RecordResultPath)
        });
        let reduce = g.add(|id| {
            Task::new(id, TaskKind::Reduce, "word_count")
                .requiring(1)
                .feeding(last)
        });
        let map = g.add(|id| {
            Task::new(id, TaskKind::Map, "word_count")
                .with_input("/tmp/p0")
                .feeding(reduce)
        });
        (g, map, reduce, last)
    }

    #[test]
    fn ids_are_monotonic() {
        let (mut g, map, reduce, last) = small_graph();
        assert!(last < reduce && reduce < map);
        g.clear();
        let next = g.add(|id| Task::new(id, TaskKind::Map, "x"));
        assert!(next > map);
    }

    #[test]
    fn completion_feeds_downstream_and_unblocks() {
        let (mut g, map, reduce, last) = small_graph();
        assert_eq!(g.promote_ready(), vec![map]);

        g.assign(map, 1).unwrap();
        g.mark_running(map).unwrap();
        let done = g.complete(map, Path::new("/tmp/map-out")).unwrap();
        assert!(!done.is_last);
        assert_eq!(done.unblocked, vec![reduce]);
        assert_eq!(g.get(reduce).unwrap().inputs, vec![PathBuf::from("/tmp/map-out")]);

        assert_eq!(g.promote_ready(), vec![reduce]);
        g.assign(reduce, 2).unwrap();
        g.complete(reduce, Path::new("/tmp/red-out")).unwrap();

        g.promote_ready();
        g.assign(last, 2).unwrap();
        let fin = g.complete(last, Path::new("/tmp/final")).unwrap();
        assert!(fin.is_last);
        assert_eq!(g.get(last).unwrap().result, Some(PathBuf::from("/tmp/final")));
        assert_eq!(g.remaining(TaskKind::Reduce), 0);
    }

    #[test]
    fn completing_twice_is_an_invariant_violation() {
        let (mut g, map, _, _) = small_graph();
        g.promote_ready();
        g.assign(map, 1).unwrap();
        g.complete(map, Path::new("/tmp/a")).unwrap();
        let err = g.complete(map, Path::new("/tmp/a")).unwrap_err();
        assert!(matches!(err, SchedulerError::Invariant(_)));
    }

    #[test]
    fn assigning_a_taken_task_is_rejected() {
        let (mut g, map, _, _) = small_graph();
        g.promote_ready();
        g.assign(map, 1).unwrap();
        assert!(g.assign(map, 2).is_err());
        assert!(g.ready_unassigned().is_empty());
    }

    #[test]
    fn requeue_returns_inflight_task_to_ready_once() {
        let (mut g, map, _, _) = small_graph();
        g.promote_ready();
        g.assign(map, 1).unwrap();
        g.mark_running(map).unwrap();

        assert!(g.requeue(map).unwrap());
        assert_eq!(g.get(map).unwrap().status, TaskStatus::Ready);
        assert_eq!(g.ready_unassigned(), vec![map]);

        // ya está en Ready: un segundo requeue no hace nada
        assert!(!g.requeue(map).unwrap());
    }

    #[test]
    fn counts_track_status() {
        let (mut g, map, _, _) = small_graph();
        g.promote_ready();
        g.assign(map, 1).unwrap();
        let c = g.counts();
        assert_eq!(c.assigned, 1);
        assert_eq!(c.blocked, 2);
    }
}
