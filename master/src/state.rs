// master/src/state.rs

use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use common::{
    FrameWriter, JobPhase, JobSummary, Message, MessageType, TaskId, WorkerId, WorkerState,
    WorkerStatus,
};

/// Un pedido que espera una respuesta de un tipo concreto.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub expected: MessageType,
    pub deadline: Instant,
    pub retries: u32,
    /// Se reenvía tal cual si vence el plazo.
    pub message: Message,
}

/// Una conexión viva (worker o cliente que envía jobs).
#[derive(Debug)]
pub struct WorkerConn {
    pub id: WorkerId,
    pub peer: String,
    pub writer: FrameWriter,
    pub state: WorkerState,
    pub subscribed: bool,
    pub task: Option<TaskId>,
    pub instructions_acked: bool,
    pub data_acked: bool,

    // Métricas de la tarea / fase actual
    pub progress: u64,
    pub rate: Option<f64>,
    pub chunk_size: u64,

    pub last_heartbeat: Instant,
    pub pending_acks: Vec<PendingAck>,
}

impl WorkerConn {
    pub fn new(id: WorkerId, peer: impl Into<String>, now: Instant) -> Self {
        Self {
            id,
            peer: peer.into(),
            writer: FrameWriter::new(),
            state: WorkerState::Connected,
            subscribed: false,
            task: None,
            instructions_acked: false,
            data_acked: false,
            progress: 0,
            rate: None,
            chunk_size: 0,
            last_heartbeat: now,
            pending_acks: Vec::new(),
        }
    }

    pub fn send(&mut self, message: &Message) {
        self.writer.send(message);
    }

    /// Envía y registra la respuesta esperada con su plazo.
    pub fn send_expecting(
        &mut self,
        message: Message,
        expected: MessageType,
        now: Instant,
        timeout: Duration,
    ) {
        self.writer.send(&message);
        self.pending_acks.push(PendingAck {
            expected,
            deadline: now + timeout,
            retries: 0,
            message,
        });
    }

    /// Saca la primera espera que coincide con el tipo recibido.
    pub fn acknowledge(&mut self, kind: MessageType) -> bool {
        match self.pending_acks.iter().position(|p| p.expected == kind) {
            Some(pos) => {
                self.pending_acks.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Suscrito y sin tarea: se le puede despachar.
    pub fn is_idle(&self) -> bool {
        self.subscribed && self.task.is_none() && self.state == WorkerState::Idle
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running && self.task.is_some()
    }

    /// Vuelve a Idle después de terminar (o perder) su tarea.
    pub fn reset_to_idle(&mut self) {
        self.task = None;
        self.instructions_acked = false;
        self.data_acked = false;
        self.progress = 0;
        self.chunk_size = 0;
        self.state = if self.subscribed {
            WorkerState::Idle
        } else {
            WorkerState::Connected
        };
    }

    /// Segundos estimados para terminar `multiplier * chunk_size` bytes a su
    /// ritmo observado, habiendo hecho ya `progress`. None sin ritmo conocido.
    pub fn estimated_completion(&self, total: f64, progress: u64) -> Option<f64> {
        match self.rate {
            Some(rate) if rate > 0.0 => Some((total - progress as f64).max(0.0) / rate),
            _ => None,
        }
    }

    pub fn status(&self, now: Instant) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.id,
            peer: self.peer.clone(),
            state: self.state,
            task: self.task,
            progress: self.progress,
            rate: self.rate,
            chunk_size: self.chunk_size,
            pending_acks: self.pending_acks.len(),
            last_heartbeat_secs_ago: now.saturating_duration_since(self.last_heartbeat).as_secs(),
        }
    }
}

/// Todas las conexiones, por id. Los ids no se reutilizan.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    conns: BTreeMap<WorkerId, WorkerConn>,
    next_id: WorkerId,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: impl Into<String>, now: Instant) -> WorkerId {
        self.next_id += 1;
        let id = self.next_id;
        self.conns.insert(id, WorkerConn::new(id, peer, now));
        id
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerConn> {
        self.conns.remove(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerConn> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerConn> {
        self.conns.get_mut(&id)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerConn> {
        self.conns.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerConn> {
        self.conns.values_mut()
    }

    pub fn subscribed_count(&self) -> usize {
        self.conns.values().filter(|w| w.subscribed).count()
    }

    pub fn busy_count(&self) -> usize {
        self.conns
            .values()
            .filter(|w| w.subscribed && w.task.is_some())
            .count()
    }

    /// Workers libres, primero los de mejor ritmo conocido; los que
    /// todavía no tienen ritmo van al final en orden de id.
    pub fn idle_by_rate(&self) -> Vec<WorkerId> {
        let mut idle: Vec<&WorkerConn> = self.conns.values().filter(|w| w.is_idle()).collect();
        idle.sort_by(|a, b| {
            let ra = a.rate.unwrap_or(f64::NEG_INFINITY);
            let rb = b.rate.unwrap_or(f64::NEG_INFINITY);
            rb.total_cmp(&ra).then(a.id.cmp(&b.id))
        });
        idle.into_iter().map(|w| w.id).collect()
    }

    /// Las métricas de ritmo solo son comparables dentro de una fase.
    pub fn reset_performance(&mut self) {
        for w in self.conns.values_mut() {
            w.rate = None;
            w.progress = 0;
        }
    }
}

/// El único job activo.
#[derive(Debug, Clone)]
pub struct Job {
    pub phase: JobPhase,
    pub mapper: String,
    pub reducer: String,
    pub data_path: PathBuf,
    pub partitions: u32,
    pub submitter: Option<WorkerId>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<PathBuf>,
}

impl Job {
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            mapper: self.mapper.clone(),
            reducer: self.reducer.clone(),
            data_path: self.data_path.display().to_string(),
            partitions: self.partitions,
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
            result: self.result.as_ref().map(|p| p.display().to_string()),
        }
    }
}
