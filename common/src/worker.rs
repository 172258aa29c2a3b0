use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Id que el coordinador asigna a cada conexión.
pub type WorkerId = u64;

/// Estado de protocolo de un worker visto desde el coordinador.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Conectado, todavía sin SUBSCRIBE (o un cliente que envía jobs).
    Connected,
    /// Suscrito y sin tarea.
    Idle,
    /// JOB_READY enviado, esperando JOB_READY_TO_RECEIVE.
    Assigned,
    AwaitingInstrAck,
    AwaitingDataAck,
    /// Ambos acks recibidos, JOB_START enviado.
    Starting,
    Running,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub peer: String,
    pub state: WorkerState,
    pub task: Option<TaskId>,
    pub progress: u64,
    /// Bytes por segundo reportados en el último heartbeat de la fase
    pub rate: Option<f64>,
    pub chunk_size: u64,
    pub pending_acks: usize,
    pub last_heartbeat_secs_ago: u64,
}
