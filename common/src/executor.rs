use std::{
    collections::HashMap,
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::kernel::{KernelError, KernelRegistry, Output};
use crate::message::JobInstructions;
use crate::partition::{shard_for, shard_sort_key};
use crate::storage::{io_err, shard_file, Storage, StorageError};
use crate::task::TaskKind;

/// Pausa por línea en modo lento (para provocar stragglers).
pub const SLOW_LINE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unknown {kind:?} kernel {name:?}")]
    UnknownKernel { kind: TaskKind, name: String },

    #[error("malformed intermediate record {0:?}")]
    MalformedRecord(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Bytes procesados por la tarea en curso. El hilo de cómputo suma y el
/// heartbeat lee, así que el contador es atómico.
#[derive(Debug, Clone)]
pub struct Progress {
    processed: Arc<AtomicU64>,
    started: Instant,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.processed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Bytes por segundo desde que empezó la tarea.
    pub fn rate(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.get() as f64 / secs
    }
}

/// Llama a `f` cada `every` en una tarea de tokio hasta que se suelta.
#[derive(Debug)]
pub struct PeriodicCallback {
    handle: JoinHandle<()>,
}

impl PeriodicCallback {
    pub fn start<F>(every: Duration, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                f();
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PeriodicCallback {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Corre una tarea completa según sus instrucciones. Bloqueante: el worker
/// lo llama desde `spawn_blocking`. Devuelve el localizador del resultado.
pub fn execute(
    registry: &KernelRegistry,
    storage: &dyn Storage,
    instructions: &JobInstructions,
    data: &Path,
    progress: &Progress,
    slow: bool,
) -> Result<PathBuf, ExecError> {
    let started = Instant::now();
    let result = match instructions.kind {
        TaskKind::Map => run_map(registry, storage, instructions, data, progress, slow)?,
        TaskKind::Reduce => run_reduce(registry, storage, instructions, data, progress)?,
    };
    info!(
        "{:?} '{}' (partición {}) terminado en {:?}: {} bytes -> {}",
        instructions.kind,
        instructions.kernel,
        instructions.partition_index,
        started.elapsed(),
        progress.get(),
        result.display()
    );
    Ok(result)
}

/// Map: aplica el kernel línea a línea y vuelca los pares ordenados por
/// `(hash(key) mod W, key)` en un shard por partición de reduce. Siempre
/// escribe los W shards, aunque queden vacíos.
pub fn run_map(
    registry: &KernelRegistry,
    storage: &dyn Storage,
    instructions: &JobInstructions,
    data: &Path,
    progress: &Progress,
    slow: bool,
) -> Result<PathBuf, ExecError> {
    let mapper = registry
        .mapper(&instructions.kernel)
        .ok_or_else(|| ExecError::UnknownKernel {
            kind: TaskKind::Map,
            name: instructions.kernel.clone(),
        })?;
    let workers = instructions.worker_count.max(1);
    let key = data
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut output = Output::new();
    let mut reader = storage.open_read(data)?;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(io_err(data))?;
        if n == 0 {
            break;
        }
        if slow {
            thread::sleep(SLOW_LINE_DELAY);
        }
        mapper.map(&key, line.trim_end_matches(['\n', '\r']), &mut output)?;
        progress.add(n as u64);
    }

    output.sort_by(|a, b| shard_sort_key(&a.0, workers).cmp(&shard_sort_key(&b.0, workers)));

    let dir = storage.allocate_dir()?;
    let mut shards = Vec::with_capacity(workers as usize);
    for i in 0..workers {
        let path = shard_file(&dir, i);
        let out = storage.create(&path)?;
        shards.push((path, out));
    }
    for (k, v) in &output {
        let (path, out) = &mut shards[shard_for(k, workers) as usize];
        writeln!(out, "{k}\t{v}").map_err(io_err(path))?;
    }
    for (path, mut out) in shards {
        out.flush().map_err(io_err(&path))?;
    }

    debug!("map: {} pares en {} shards", output.len(), workers);
    Ok(dir)
}

/// Reduce: agrupa los valores por key y llama al kernel en orden
/// `(hash(key) mod W, key)`. El progreso cuenta cada byte dos veces (al
/// leer y al reducir su grupo).
pub fn run_reduce(
    registry: &KernelRegistry,
    storage: &dyn Storage,
    instructions: &JobInstructions,
    data: &Path,
    progress: &Progress,
) -> Result<PathBuf, ExecError> {
    let reducer = registry
        .reducer(&instructions.kernel)
        .ok_or_else(|| ExecError::UnknownKernel {
            kind: TaskKind::Reduce,
            name: instructions.kernel.clone(),
        })?;
    let workers = instructions.worker_count.max(1);

    let mut groups: HashMap<String, (Vec<String>, u64)> = HashMap::new();
    let mut reader = storage.open_read(data)?;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(io_err(data))?;
        if n == 0 {
            break;
        }
        progress.add(n as u64);

        let record = line.trim_end_matches(['\n', '\r']);
        if record.is_empty() {
            continue;
        }
        let (k, v) = record
            .split_once('\t')
            .ok_or_else(|| ExecError::MalformedRecord(record.to_string()))?;
        let entry = groups.entry(k.to_string()).or_default();
        entry.0.push(v.to_string());
        entry.1 += n as u64;
    }

    let mut keys: Vec<&String> = groups.keys().collect();
    keys.sort_by(|a, b| shard_sort_key(a, workers).cmp(&shard_sort_key(b, workers)));

    let mut output = Output::new();
    for k in keys {
        let (values, bytes) = &groups[k];
        reducer.reduce(k, values, &mut output)?;
        progress.add(*bytes);
    }

    let dest = storage.allocate_path();
    let mut out = storage.create(&dest)?;
    for (k, v) in &output {
        writeln!(out, "{k}\t{v}").map_err(io_err(&dest))?;
    }
    out.flush().map_err(io_err(&dest))?;

    debug!("reduce: {} keys -> {}", output.len(), dest.display());
    Ok(dest)
}
