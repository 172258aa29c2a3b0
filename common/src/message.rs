use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskKind;

/// 1 byte de tipo + 4 bytes de largo (big-endian).
pub const HEADER_LEN: usize = 5;

/// Frames más grandes que esto se consideran corruptos (no se bufferean).
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Subscribe = 1,
    SubscribeAck = 2,
    JobReady = 3,
    JobReadyToReceive = 4,
    JobInstructionsFile = 5,
    JobInstructionsFileAck = 6,
    Datafile = 7,
    DatafileAck = 8,
    JobStart = 9,
    JobStartAck = 10,
    JobDone = 11,
    JobDoneAck = 12,
    SubmitJob = 13,
    SubmitJobAck = 14,
    SubmitJobDenied = 15,
    JobHeartbeat = 16,
    SubmittedJobFinished = 17,
    SubmittedJobFinishedAck = 18,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        use MessageType::*;
        let t = match b {
            1 => Subscribe,
            2 => SubscribeAck,
            3 => JobReady,
            4 => JobReadyToReceive,
            5 => JobInstructionsFile,
            6 => JobInstructionsFileAck,
            7 => Datafile,
            8 => DatafileAck,
            9 => JobStart,
            10 => JobStartAck,
            11 => JobDone,
            12 => JobDoneAck,
            13 => SubmitJob,
            14 => SubmitJobAck,
            15 => SubmitJobDenied,
            16 => JobHeartbeat,
            17 => SubmittedJobFinished,
            18 => SubmittedJobFinishedAck,
            _ => return None,
        };
        Some(t)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("expected a {expected:?} message, got {actual:?}")]
    WrongType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("message body is not valid UTF-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    #[error("malformed message body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("malformed number in message body: {0}")]
    Number(String),
}

/// Un mensaje del protocolo: tipo + cuerpo opaco.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub body: Vec<u8>,
}

impl Message {
    pub fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            body: Vec::new(),
        }
    }

    pub fn with_text(kind: MessageType, text: impl Into<String>) -> Self {
        Self {
            kind,
            body: text.into().into_bytes(),
        }
    }

    fn with_json<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, MessageError> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self { kind, body })
    }

    pub fn is(&self, kind: MessageType) -> bool {
        self.kind == kind
    }

    /// Header + body, listo para escribir en el socket.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.push(self.kind.as_byte());
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn text(&self) -> Result<String, MessageError> {
        Ok(String::from_utf8(self.body.clone())?)
    }

    fn expect(&self, expected: MessageType) -> Result<(), MessageError> {
        if self.kind != expected {
            return Err(MessageError::WrongType {
                expected,
                actual: self.kind,
            });
        }
        Ok(())
    }

    fn json<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, MessageError> {
        self.expect(expected)?;
        Ok(serde_json::from_slice(&self.body)?)
    }

    /* --------- constructores por tipo --------- */

    pub fn subscribe() -> Self {
        Self::empty(MessageType::Subscribe)
    }

    pub fn submit_job(req: &SubmitJob) -> Result<Self, MessageError> {
        Self::with_json(MessageType::SubmitJob, req)
    }

    pub fn submit_job_denied(reason: impl Into<String>) -> Self {
        Self::with_text(MessageType::SubmitJobDenied, reason)
    }

    pub fn job_ready(task_id: u64) -> Self {
        Self::with_text(MessageType::JobReady, task_id.to_string())
    }

    pub fn job_instructions(instr: &JobInstructions) -> Result<Self, MessageError> {
        Self::with_json(MessageType::JobInstructionsFile, instr)
    }

    pub fn datafile(path: impl Into<String>) -> Self {
        Self::with_text(MessageType::Datafile, path)
    }

    pub fn job_done(result_locator: impl Into<String>) -> Self {
        Self::with_text(MessageType::JobDone, result_locator)
    }

    pub fn heartbeat(progress: u64, rate: f64) -> Result<Self, MessageError> {
        Self::with_json(
            MessageType::JobHeartbeat,
            &Heartbeat {
                progress: progress.to_string(),
                rate: format!("{rate:.3}"),
            },
        )
    }

    pub fn submitted_job_finished(result_locator: impl Into<String>) -> Self {
        Self::with_text(MessageType::SubmittedJobFinished, result_locator)
    }

    /* --------- lectores por tipo --------- */

    pub fn as_submit_job(&self) -> Result<SubmitJob, MessageError> {
        self.json(MessageType::SubmitJob)
    }

    pub fn as_job_instructions(&self) -> Result<JobInstructions, MessageError> {
        self.json(MessageType::JobInstructionsFile)
    }

    pub fn as_task_id(&self) -> Result<u64, MessageError> {
        self.expect(MessageType::JobReady)?;
        let text = self.text()?;
        text.trim()
            .parse::<u64>()
            .map_err(|_| MessageError::Number(text))
    }

    /// (progress, rate) a partir del body de un JOB_HEARTBEAT.
    pub fn as_heartbeat(&self) -> Result<(u64, f64), MessageError> {
        let hb: Heartbeat = self.json(MessageType::JobHeartbeat)?;
        let progress = hb
            .progress
            .trim()
            .parse::<u64>()
            .map_err(|_| MessageError::Number(hb.progress.clone()))?;
        let rate = hb
            .rate
            .trim()
            .parse::<f64>()
            .map_err(|_| MessageError::Number(hb.rate.clone()))?;
        Ok((progress, rate))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitJob {
    pub mapper: String,
    pub reducer: String,
    pub data_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstructions {
    /// Nombre del kernel registrado (mapper o reducer).
    pub kernel: String,
    pub kind: TaskKind,
    pub worker_count: u32,
    pub partition_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heartbeat {
    progress: String,
    rate: String,
}
