use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::TaskCounts;
use crate::worker::WorkerStatus;

/// Etapa del único job activo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    #[default]
    NotStarted,
    Mapping,
    Reducing,
    Done,
}

impl JobPhase {
    /// Hay un job en curso (o terminado y sin ack del submitter).
    pub fn is_active(self) -> bool {
        self != JobPhase::NotStarted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub mapper: String,
    pub reducer: String,
    pub data_path: String,

    /// Cantidad de particiones de reduce (workers suscritos al enviar el job)
    pub partitions: u32,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
}

/// Foto del coordinador que publica cada tick (la lee el endpoint de status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub phase: JobPhase,
    pub job: Option<JobSummary>,
    pub tasks: TaskCounts,
    pub workers: Vec<WorkerStatus>,
    /// Utilización promedio del job en curso (0..1)
    pub utilization: Option<f64>,
    pub generated_at: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            phase: JobPhase::NotStarted,
            job: None,
            tasks: TaskCounts::default(),
            workers: Vec::new(),
            utilization: None,
            generated_at: Utc::now(),
        }
    }
}
