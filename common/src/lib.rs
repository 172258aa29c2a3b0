pub mod connection;
pub mod dag;
pub mod executor;
pub mod job;
pub mod kernel;
pub mod message;
pub mod partition;
pub mod storage;
pub mod task;
pub mod worker;

pub use connection::{ConnectionError, FrameReader, FrameWriter, TryWrite};
pub use dag::{Completion, SchedulerError, TaskCounts, TaskGraph};
pub use executor::{execute, ExecError, PeriodicCallback, Progress};
pub use job::{JobPhase, JobSummary, StatusSnapshot};
pub use kernel::{KernelError, KernelRegistry, Mapper, Reducer};
pub use message::{JobInstructions, Message, MessageError, MessageType, SubmitJob};
pub use partition::{hashcode, shard_for, PartitionPolicy};
pub use storage::{LocalStorage, Storage, StorageError};
pub use task::{Hook, Task, TaskId, TaskKind, TaskStatus};
pub use worker::{WorkerId, WorkerState, WorkerStatus};

/// Puerto por defecto del coordinador.
pub const DEFAULT_PORT: u16 = 8888;
