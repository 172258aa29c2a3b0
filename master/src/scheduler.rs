//! Reparto de tareas y ciclo de vida del job.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use common::{
    partition, Hook, JobPhase, Message, MessageType, SchedulerError, SubmitJob, Task, TaskId,
    TaskKind, WorkerId, WorkerState,
};

use crate::coordinator::{CoordResult, Coordinator};
use crate::state::Job;

/// Motivos de rechazo de un SUBMIT_JOB. El texto va tal cual en la denegación.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("malformed submission: {0}")]
    Malformed(String),

    #[error("a job is already active; submission denied")]
    Busy,

    #[error("no workers subscribed")]
    NoWorkers,

    #[error("invalid submission: {}", .0.join("; "))]
    InvalidFields(Vec<String>),

    #[error("could not partition data file: {0}")]
    Partitioning(String),
}

impl Coordinator {
    /// 1) Blocked -> Ready, 2) Mapping -> Reducing cuando no quedan maps,
    /// 3) cada tarea Ready sin worker a un worker libre.
    pub fn distribute(&mut self, now: Instant) -> CoordResult {
        self.graph.promote_ready();

        if self.phase() == JobPhase::Mapping && self.graph.remaining(TaskKind::Map) == 0 {
            self.start_reducing()?;
            self.graph.promote_ready();
        }

        let ready = self.graph.ready_unassigned();
        if ready.is_empty() {
            return Ok(());
        }
        let idle = self.workers.idle_by_rate();
        for (task_id, worker_id) in ready.into_iter().zip(idle) {
            self.assign(task_id, worker_id, now)?;
        }
        Ok(())
    }

    /// `pre_execute` (una sola vez por tarea) y JOB_READY al worker.
    pub(crate) fn assign(&mut self, task_id: TaskId, worker: WorkerId, now: Instant) -> CoordResult {
        let task = self
            .graph
            .get_mut(task_id)
            .ok_or(SchedulerError::UnknownTask(task_id))?;
        task.pre_execute(self.storage.as_ref())?;
        self.graph.assign(task_id, worker)?;
        self.hand_over(task_id, worker, now)
    }

    /// Deja a `worker` esperando JOB_READY_TO_RECEIVE para `task_id`.
    /// La tarea ya tiene que estar asignada a él en el grafo.
    pub(crate) fn hand_over(&mut self, task_id: TaskId, worker: WorkerId, now: Instant) -> CoordResult {
        let input = self
            .graph
            .get(task_id)
            .and_then(|t| t.input.clone())
            .ok_or_else(|| {
                SchedulerError::Invariant(format!("task {task_id} dispatched without input"))
            })?;
        let chunk_size = self.storage.size_of(&input)?;

        let timeout = self.config.ack_timeout;
        let conn = self.workers.get_mut(worker).ok_or_else(|| {
            SchedulerError::Invariant(format!("task {task_id} handed to unknown worker {worker}"))
        })?;
        conn.task = Some(task_id);
        conn.state = WorkerState::Assigned;
        conn.instructions_acked = false;
        conn.data_acked = false;
        conn.progress = 0;
        conn.chunk_size = chunk_size;
        conn.send_expecting(
            Message::job_ready(task_id),
            MessageType::JobReadyToReceive,
            now,
            timeout,
        );
        info!(worker, task = task_id, chunk_size, "tarea asignada");
        Ok(())
    }

    /// Crea una tarea reduce por partición, leyendo el shard de esa
    /// partición de cada salida de map.
    fn start_reducing(&mut self) -> CoordResult {
        let Some(job) = self.job.as_mut() else {
            return Ok(());
        };
        job.phase = JobPhase::Reducing;
        let partitions = job.partitions;
        let reducer = job.reducer.clone();

        let map_outputs: Vec<PathBuf> = self
            .graph
            .of_kind(TaskKind::Map)
            .into_iter()
            .filter_map(|t| t.result.clone())
            .collect();

        for index in 0..partitions {
            let inputs = self.storage.list_partition_files(&map_outputs, index)?;
            let required = inputs.len();
            self.graph.add(|id| {
                Task::new(id, TaskKind::Reduce, reducer.as_str())
                    .with_inputs(inputs)
                    .requiring(required)
                    .partition(index, partitions)
                    .before(Hook::Concatenate)
                    .before(Hook::Sort)
                    .after(Hook::RecordResultPath)
            });
        }

        // los ritmos de map no sirven para comparar reduces
        self.workers.reset_performance();
        info!(
            partitions,
            map_outputs = map_outputs.len(),
            "fase map terminada, empieza reduce"
        );
        Ok(())
    }

    /// Fase Reducing y todas las reduce en Done.
    pub fn job_finished(&self) -> bool {
        self.phase() == JobPhase::Reducing && self.graph.remaining(TaskKind::Reduce) == 0
    }

    /// Junta los resultados de reduce en orden de partición y avisa al cliente.
    pub(crate) fn finish_job(&mut self, now: Instant) -> CoordResult {
        let results: Vec<PathBuf> = self
            .graph
            .of_kind(TaskKind::Reduce)
            .into_iter()
            .filter_map(|t| t.result.clone())
            .collect();
        let merged = self.storage.allocate_path();
        self.storage.concatenate(&results, &merged)?;

        let report = self.monitor.finish(now);
        let timeout = self.config.ack_timeout;
        let Some(job) = self.job.as_mut() else {
            return Ok(());
        };
        job.phase = JobPhase::Done;
        job.finished_at = Some(Utc::now());
        job.result = Some(merged.clone());
        info!(
            result = %merged.display(),
            reduce_outputs = results.len(),
            utilization = report.map(|r| r.average),
            "job terminado"
        );

        let submitter = job.submitter;
        match submitter.and_then(|id| self.workers.get_mut(id)) {
            Some(conn) => conn.send_expecting(
                Message::submitted_job_finished(merged.display().to_string()),
                MessageType::SubmittedJobFinishedAck,
                now,
                timeout,
            ),
            None => {
                warn!("no hay cliente a quien avisar; el job se descarta");
                self.reset_job();
            }
        }
        Ok(())
    }

    /// SUBMIT_JOB: valida, parte la entrada y crea las tareas map.
    /// Si se rechaza no se toca nada del estado.
    pub(crate) fn submit(&mut self, client: WorkerId, msg: &Message, now: Instant) -> CoordResult {
        let reply = match self.accept_job(client, msg, now) {
            Ok(()) => Message::empty(MessageType::SubmitJobAck),
            Err(denied) => {
                warn!(client, "job rechazado: {denied}");
                Message::submit_job_denied(denied.to_string())
            }
        };
        if let Some(conn) = self.workers.get_mut(client) {
            conn.send(&reply);
        }
        Ok(())
    }

    fn accept_job(
        &mut self,
        client: WorkerId,
        msg: &Message,
        now: Instant,
    ) -> Result<(), SubmissionError> {
        let req = msg
            .as_submit_job()
            .map_err(|e| SubmissionError::Malformed(e.to_string()))?;

        if self.phase().is_active() {
            return Err(SubmissionError::Busy);
        }
        let workers = self.workers.subscribed_count() as u32;
        if workers == 0 {
            return Err(SubmissionError::NoWorkers);
        }
        self.validate(&req)?;

        let data_path = PathBuf::from(&req.data_path);
        let parts = partition::partition(
            self.storage.as_ref(),
            &data_path,
            self.config.partitioning,
            workers,
        )
        .map_err(|e| SubmissionError::Partitioning(e.to_string()))?;

        // restos del job anterior; la entrada puede vivir dentro del storage
        let mut keep = parts.clone();
        keep.push(std::fs::canonicalize(&data_path).unwrap_or_else(|_| data_path.clone()));
        if let Err(e) = self.storage.clean(&keep) {
            warn!("no se pudo limpiar el storage: {e}");
        }

        self.graph.clear();
        for (index, part) in parts.iter().enumerate() {
            self.graph.add(|id| {
                Task::new(id, TaskKind::Map, req.mapper.as_str())
                    .with_input(part.clone())
                    .partition(index as u32, workers)
                    .after(Hook::RecordResultPath)
            });
        }

        self.job = Some(Job {
            phase: JobPhase::Mapping,
            mapper: req.mapper.clone(),
            reducer: req.reducer.clone(),
            data_path,
            partitions: workers,
            submitter: Some(client),
            submitted_at: Utc::now(),
            finished_at: None,
            result: None,
        });
        self.workers.reset_performance();
        self.monitor.start(now);

        info!(
            client,
            mapper = %req.mapper,
            reducer = %req.reducer,
            data = %req.data_path,
            map_tasks = parts.len(),
            partitions = workers,
            "job aceptado"
        );
        Ok(())
    }

    /// Junta todos los campos inválidos en un solo error.
    fn validate(&self, req: &SubmitJob) -> Result<(), SubmissionError> {
        let mut invalid = Vec::new();
        if !self.kernels.has_mapper(&req.mapper) {
            invalid.push(format!("mapper '{}' is not registered", req.mapper));
        }
        if !self.kernels.has_reducer(&req.reducer) {
            invalid.push(format!("reducer '{}' is not registered", req.reducer));
        }
        if !Path::new(&req.data_path).is_file() {
            invalid.push(format!("data file '{}' does not exist", req.data_path));
        }

        if invalid.is_empty() {
            debug!("submission válida");
            Ok(())
        } else {
            Err(SubmissionError::InvalidFields(invalid))
        }
    }
}
