use std::{sync::Arc, time::Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use common::{
    FrameWriter, JobPhase, KernelRegistry, Message, SchedulerError, StatusSnapshot, Storage,
    StorageError, TaskGraph, WorkerId,
};

use crate::config::CoordinatorConfig;
use crate::monitor::UtilizationMonitor;
use crate::state::{Job, WorkerRegistry};

/// Errores internos del scheduling. Hacia afuera sólo sale `Scheduler`
/// (termina el coordinador); una falla de storage abandona el job.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("storage failure while scheduling: {0}")]
    Storage(#[from] StorageError),
}

pub type CoordResult<T = ()> = Result<T, CoordinatorError>;

/// Dueño único de todo el estado de scheduling. No hace I/O de red:
/// recibe mensajes ya decodificados y deja lo que hay que enviar en el
/// buffer de salida de cada conexión.
pub struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) kernels: KernelRegistry,
    pub(crate) workers: WorkerRegistry,
    pub(crate) graph: TaskGraph,
    pub(crate) job: Option<Job>,
    pub(crate) monitor: UtilizationMonitor,
    /// Conexiones sacadas del registro cuyo socket hay que cerrar.
    pub(crate) evicted: Vec<WorkerId>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        storage: Arc<dyn Storage>,
        kernels: KernelRegistry,
    ) -> Self {
        Self {
            config,
            storage,
            kernels,
            workers: WorkerRegistry::new(),
            graph: TaskGraph::new(),
            job: None,
            monitor: UtilizationMonitor::new(),
            evicted: Vec::new(),
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.job.as_ref().map_or(JobPhase::NotStarted, |j| j.phase)
    }

    /// Nueva conexión aceptada. Devuelve el id con que se la conoce.
    pub fn connect(&mut self, peer: impl Into<String>, now: Instant) -> WorkerId {
        let peer = peer.into();
        let id = self.workers.insert(peer.clone(), now);
        info!(worker = id, %peer, "nueva conexión");
        id
    }

    /// El socket se cerró (o dio error) del otro lado.
    pub fn disconnect(&mut self, id: WorkerId, reason: &str) -> CoordResult {
        if self.workers.contains(id) {
            self.evict(id, reason)?;
        }
        Ok(())
    }

    pub fn writer_mut(&mut self, id: WorkerId) -> Option<&mut FrameWriter> {
        self.workers.get_mut(id).map(|w| &mut w.writer)
    }

    /// Ids cuyos sockets hay que cerrar desde la última llamada.
    pub fn take_evicted(&mut self) -> Vec<WorkerId> {
        std::mem::take(&mut self.evicted)
    }

    /// Tick periódico: tolerancia a fallos, monitor y reparto, aunque no
    /// haya llegado ningún mensaje.
    pub fn tick(&mut self, now: Instant) -> CoordResult {
        let result = self.run_checks(now);
        self.contain(result, now)
    }

    fn run_checks(&mut self, now: Instant) -> CoordResult {
        self.check_ack_timeouts(now)?;
        self.check_heartbeats(now)?;
        self.check_stragglers(now)?;

        if self.phase().is_active() {
            self.monitor
                .sample(now, self.workers.busy_count(), self.workers.subscribed_count());
        }

        self.distribute(now)
    }

    /// Sólo una violación de invariantes sigue hacia arriba.
    pub(crate) fn contain(&mut self, result: CoordResult, now: Instant) -> CoordResult {
        match result {
            Err(CoordinatorError::Storage(cause)) => {
                self.abandon_job(&cause, now);
                Ok(())
            }
            other => other,
        }
    }

    /// El job no puede terminar: se descarta, los workers quedan libres y
    /// el cliente recibe SUBMIT_JOB_DENIED con la causa.
    pub(crate) fn abandon_job(&mut self, cause: &StorageError, now: Instant) {
        let Some(job) = self.job.as_ref() else {
            warn!("falla de storage sin job activo: {cause}");
            return;
        };
        error!(
            phase = ?job.phase,
            mapper = %job.mapper,
            data = %job.data_path.display(),
            "job abandonado: {cause}"
        );
        let submitter = job.submitter;

        for conn in self.workers.iter_mut() {
            if conn.task.is_some() {
                conn.reset_to_idle();
                conn.pending_acks.clear();
            }
        }
        if let Some(conn) = submitter.and_then(|id| self.workers.get_mut(id)) {
            conn.send(&Message::submit_job_denied(format!("job abandoned: {cause}")));
        }
        self.monitor.finish(now);
        self.reset_job();
    }

    /// Saca una conexión del registro. Su tarea vuelve a Ready (una sola
    /// vez: después de esto el worker ya no existe).
    pub(crate) fn evict(&mut self, id: WorkerId, reason: &str) -> CoordResult {
        let Some(conn) = self.workers.remove(id) else {
            return Ok(());
        };
        warn!(worker = id, peer = %conn.peer, task = ?conn.task, "worker removido: {reason}");
        self.evicted.push(id);

        if let Some(task_id) = conn.task {
            if self.graph.requeue(task_id)? {
                info!(worker = id, task = task_id, "tarea devuelta a Ready");
            }
        }

        let was_submitter = self.job.as_ref().and_then(|j| j.submitter) == Some(id);
        if was_submitter {
            if let Some(job) = self.job.as_mut() {
                job.submitter = None;
            }
            if self.phase() == JobPhase::Done {
                debug!("el cliente se fue con el job terminado");
                self.reset_job();
            } else {
                warn!("el cliente que envió el job se desconectó; el job sigue");
            }
        }
        Ok(())
    }

    /// Descarta el job y sus tareas: se puede aceptar otro.
    pub(crate) fn reset_job(&mut self) {
        if let Some(job) = self.job.take() {
            info!(
                mapper = %job.mapper,
                reducer = %job.reducer,
                result = ?job.result,
                "job cerrado"
            );
        }
        self.graph.clear();
        self.workers.reset_performance();
    }

    pub fn snapshot(&self, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.phase(),
            job: self.job.as_ref().map(Job::summary),
            tasks: self.graph.counts(),
            workers: self.workers.iter().map(|w| w.status(now)).collect(),
            utilization: self.monitor.average(),
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Arnés para manejar el coordinador a mano en los tests.

    use super::*;
    use common::{LocalStorage, MessageType};
    use std::{env, fs, path::PathBuf, time::Duration};

    pub fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("coordinator_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    pub struct Harness {
        pub coord: Coordinator,
        pub now: Instant,
        pub dir: PathBuf,
    }

    impl Harness {
        pub fn new(sub: &str) -> Self {
            Self::with_config(sub, CoordinatorConfig::default())
        }

        pub fn with_config(sub: &str, mut config: CoordinatorConfig) -> Self {
            let dir = temp_dir(sub);
            config.storage_dir = dir.join("fs");
            let storage = LocalStorage::new(&config.storage_dir).unwrap();
            let coord = Coordinator::new(config, Arc::new(storage), KernelRegistry::builtin());
            Self {
                coord,
                now: Instant::now(),
                dir,
            }
        }

        pub fn advance(&mut self, d: Duration) {
            self.now += d;
        }

        pub fn connect(&mut self) -> WorkerId {
            self.coord.connect("test", self.now)
        }

        pub fn send(&mut self, id: WorkerId, msg: Message) {
            self.coord.handle_message(id, msg, self.now).unwrap();
        }

        pub fn tick(&mut self) {
            self.coord.tick(self.now).unwrap();
        }

        /// Decodifica todo lo que el coordinador dejó para `id`.
        pub fn outbox(&mut self, id: WorkerId) -> Vec<Message> {
            let Some(writer) = self.coord.writer_mut(id) else {
                return Vec::new();
            };
            let bytes = writer.take_pending();
            let mut reader = common::FrameReader::new();
            let mut out = Vec::new();
            let mut rest: &[u8] = &bytes;
            while !rest.is_empty() {
                let (used, msg) = reader.push(rest).unwrap();
                rest = &rest[used..];
                if let Some(m) = msg {
                    out.push(m);
                }
            }
            out
        }

        pub fn kinds(&mut self, id: WorkerId) -> Vec<MessageType> {
            self.outbox(id).into_iter().map(|m| m.kind).collect()
        }

        /// Conecta y suscribe un worker; descarta el SUBSCRIBE_ACK.
        pub fn subscribed_worker(&mut self) -> WorkerId {
            let id = self.connect();
            self.send(id, Message::subscribe());
            assert_eq!(self.kinds(id), vec![MessageType::SubscribeAck]);
            id
        }

        pub fn write_data(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.join(name);
            fs::write(&path, content).unwrap();
            path
        }
    }
}
