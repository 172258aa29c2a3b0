use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::partition::sort_file_by_shard;
use crate::storage::{Storage, StorageError};

pub type TaskId = u64;

/// Identificador de la conexión del worker asignado.
pub type WorkerRef = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Map,
    Reduce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Blocked,
    Ready,
    Assigned,
    Running,
    Done,
}

/// Acciones que corren antes de despachar o después de completar una tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Junta todos los inputs acumulados en un solo archivo (pasa a ser el input).
    Concatenate,
    /// Ordena las líneas del input por (hash(key) mod W, key).
    Sort,
    /// Guarda el path del resultado en la tarea.
    RecordResultPath,
}

/// Un nodo del DAG: una unidad de trabajo map o reduce.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Nombre del kernel registrado que ejecuta esta tarea.
    pub kernel: String,
    pub input: Option<PathBuf>,
    pub required_inputs: usize,
    pub inputs: Vec<PathBuf>,
    pub downstream: Vec<TaskId>,
    pub assigned_worker: Option<WorkerRef>,
    pub status: TaskStatus,
    pub result: Option<PathBuf>,
    pub pre_hooks: Vec<Hook>,
    pub post_hooks: Vec<Hook>,
    pub partition_index: u32,
    pub worker_count: u32,
    /// `pre_execute` ya corrió (no se repite al reasignar).
    pub prepared: bool,
}

impl Task {
    pub fn new(id: TaskId, kind: TaskKind, kernel: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            kernel: kernel.into(),
            input: None,
            required_inputs: 0,
            inputs: Vec::new(),
            downstream: Vec::new(),
            assigned_worker: None,
            status: TaskStatus::Blocked,
            result: None,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            partition_index: 0,
            worker_count: 1,
            prepared: false,
        }
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input = Some(path.into());
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn requiring(mut self, n: usize) -> Self {
        self.required_inputs = n;
        self
    }

    pub fn feeding(mut self, downstream: TaskId) -> Self {
        self.downstream.push(downstream);
        self
    }

    pub fn partition(mut self, index: u32, worker_count: u32) -> Self {
        self.partition_index = index;
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn before(mut self, hook: Hook) -> Self {
        self.pre_hooks.push(hook);
        self
    }

    pub fn after(mut self, hook: Hook) -> Self {
        self.post_hooks.push(hook);
        self
    }

    /// Lista para correr: juntó todos los inputs que espera, o no espera ninguno.
    pub fn is_ready(&self) -> bool {
        self.required_inputs == 0 || self.inputs.len() >= self.required_inputs
    }

    /// Sin tareas aguas abajo: su resultado no alimenta a nadie más.
    pub fn is_last(&self) -> bool {
        self.downstream.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    pub fn is_unassigned(&self) -> bool {
        self.assigned_worker.is_none()
    }

    /// Corre los hooks previos en orden. Es idempotente: la segunda
    /// llamada no hace nada.
    pub fn pre_execute(&mut self, storage: &dyn Storage) -> Result<(), StorageError> {
        if self.prepared {
            return Ok(());
        }

        for hook in self.pre_hooks.clone() {
            match hook {
                Hook::Concatenate => {
                    let dest = storage.allocate_path();
                    storage.concatenate(&self.inputs, &dest)?;
                    debug!(
                        "tarea {}: {} inputs concatenados en {}",
                        self.id,
                        self.inputs.len(),
                        dest.display()
                    );
                    self.input = Some(dest);
                }
                Hook::Sort => {
                    if let Some(input) = &self.input {
                        sort_file_by_shard(storage, input, self.worker_count)?;
                    }
                }
                // no aplica antes de ejecutar
                Hook::RecordResultPath => {}
            }
        }

        self.prepared = true;
        Ok(())
    }

    /// Corre los hooks posteriores en orden con el localizador del resultado.
    /// La propagación a las tareas aguas abajo la hace el [`TaskGraph`](crate::dag::TaskGraph).
    pub fn post_execute(&mut self, result_locator: &Path) {
        for hook in &self.post_hooks {
            match hook {
                Hook::RecordResultPath => self.result = Some(result_locator.to_path_buf()),
                Hook::Concatenate | Hook::Sort => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use std::{env, fs};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("task_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn task_without_requirements_is_ready() {
        let task = Task::new(1, TaskKind::Map, "word_count").with_input("/tmp/p0");
        assert!(task.is_ready());
        assert!(task.is_last());
    }

    #[test]
    fn is_ready_flips_once_inputs_arrive_and_stays_true() {
        let mut task = Task::new(1, TaskKind::Reduce, "word_count").requiring(2);
        assert!(!task.is_ready());

        task.inputs.push("/tmp/a".into());
        assert!(!task.is_ready());
        task.inputs.push("/tmp/b".into());
        assert!(task.is_ready());

        // más inputs de los esperados no lo vuelven a bloquear
        task.inputs.push("/tmp/c".into());
        assert!(task.is_ready());
    }

    #[test]
    fn pre_execute_concatenates_then_sorts_once() {
        let dir = temp_dir("pre_execute");
        let storage = LocalStorage::new(dir.join("fs")).unwrap();

        let a = dir.join("a.txt");
        let b = dir.join("b.txt");
        fs::write(&a, "the\t1\ncat\t1\n").unwrap();
        fs::write(&b, "the\t1\n").unwrap();

        let mut task = Task::new(7, TaskKind::Reduce, "word_count")
            .with_inputs(vec![a, b])
            .partition(0, 1)
            .before(Hook::Concatenate)
            .before(Hook::Sort);

        task.pre_execute(&storage).unwrap();
        let input = task.input.clone().unwrap();
        let content = fs::read_to_string(&input).unwrap();
        assert_eq!(content, "cat\t1\nthe\t1\nthe\t1\n");
        assert!(task.prepared);

        // una segunda llamada no vuelve a concatenar
        task.pre_execute(&storage).unwrap();
        assert_eq!(task.input.unwrap(), input);
    }

    #[test]
    fn post_execute_records_result_path() {
        let mut task =
            Task::new(3, TaskKind::Map, "word_count").after(Hook::RecordResultPath);
        task.post_execute(Path::new("/tmp/out-3"));
        assert_eq!(task.result, Some(PathBuf::from("/tmp/out-3")));
    }
}
