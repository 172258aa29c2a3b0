use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use tokio::{
    net::{tcp::OwnedReadHalf, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use common::{
    execute, ConnectionError, FrameReader, FrameWriter, JobInstructions, KernelRegistry,
    LocalStorage, Message, MessageType, PeriodicCallback, Progress, Storage,
};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    /// Duerme 100 ms por línea al mapear (para probar stragglers).
    pub slow: bool,
    pub heartbeat: Duration,
}

/// Lo asignado por el coordinador para la tarea en curso.
#[derive(Debug, Default)]
struct Assignment {
    task_id: Option<u64>,
    instructions: Option<JobInstructions>,
    data: Option<PathBuf>,
    running: Option<JoinHandle<()>>,
}

impl Assignment {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Lector de frames en su propia tarea, así el loop principal puede
/// esperar mensajes sin perder bytes a medio leer.
async fn read_loop(mut read: OwnedReadHalf, inbound: mpsc::UnboundedSender<Message>) -> ConnectionError {
    let mut frames = FrameReader::new();
    loop {
        match frames.next_message(&mut read).await {
            Ok(msg) => {
                if inbound.send(msg).is_err() {
                    return ConnectionError::PeerDisconnected;
                }
            }
            Err(e) => return e,
        }
    }
}

/// Loop principal del worker:
/// - Se suscribe al coordinador.
/// - Responde el handshake de cada tarea (ready, instrucciones, datos, start).
/// - Ejecuta la tarea en un hilo de bloqueo mientras un heartbeat periódico
///   reporta el progreso.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(
        LocalStorage::new(&config.storage_dir)
            .with_context(|| format!("no se pudo abrir {}", config.storage_dir.display()))?,
    );
    let kernels = Arc::new(KernelRegistry::builtin());

    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("conectando a {}:{}", config.host, config.port))?;
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();

    // todo lo que se envía (handshake, heartbeats, JOB_DONE) pasa por acá
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        let mut frames = FrameWriter::new();
        while let Some(msg) = out_rx.recv().await {
            frames.send(&msg);
            if let Err(e) = frames.flush_all(&mut write).await {
                warn!("error escribiendo al coordinador: {e}");
                return;
            }
        }
    });

    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Message>();
    let reader = tokio::spawn(read_loop(read, in_tx));

    out_tx.send(Message::subscribe())?;
    let mut assignment = Assignment::default();

    while let Some(msg) = in_rx.recv().await {
        match msg.kind {
            MessageType::SubscribeAck => info!("suscrito al coordinador"),

            MessageType::JobReady => {
                let task_id = msg.as_task_id()?;
                // tarea de un job abandonado: su JOB_DONE_ACK no va a llegar
                if assignment.running.as_ref().is_some_and(|h| h.is_finished()) {
                    assignment.clear();
                }
                if assignment.running.is_some() && assignment.task_id != Some(task_id) {
                    warn!(task = task_id, "JOB_READY con otra tarea corriendo, se ignora");
                    continue;
                }
                if assignment.task_id != Some(task_id) {
                    assignment.clear();
                    assignment.task_id = Some(task_id);
                    info!(task = task_id, "tarea asignada");
                }
                out_tx.send(Message::empty(MessageType::JobReadyToReceive))?;
            }

            MessageType::JobInstructionsFile => {
                let instructions = msg.as_job_instructions()?;
                debug!(?instructions, "instrucciones recibidas");
                assignment.instructions = Some(instructions);
                out_tx.send(Message::empty(MessageType::JobInstructionsFileAck))?;
            }

            MessageType::Datafile => {
                let data = PathBuf::from(msg.text()?);
                debug!(data = %data.display(), "datafile recibido");
                assignment.data = Some(data);
                out_tx.send(Message::empty(MessageType::DatafileAck))?;
            }

            MessageType::JobStart => {
                out_tx.send(Message::empty(MessageType::JobStartAck))?;
                // un JOB_START reenviado no vuelve a lanzar la tarea
                if assignment.running.is_some() {
                    continue;
                }
                let (Some(instructions), Some(data)) =
                    (assignment.instructions.clone(), assignment.data.clone())
                else {
                    warn!("JOB_START sin instrucciones o datos");
                    continue;
                };
                assignment.running = Some(spawn_task(
                    &config,
                    kernels.clone(),
                    storage.clone(),
                    instructions,
                    data,
                    out_tx.clone(),
                ));
            }

            MessageType::JobDoneAck => {
                debug!(task = ?assignment.task_id, "JOB_DONE confirmado");
                assignment.clear();
            }

            other => warn!(kind = ?other, "mensaje inesperado, se ignora"),
        }
    }

    writer.abort();
    match reader.await {
        Ok(ConnectionError::PeerDisconnected) => {
            info!("el coordinador cerró la conexión");
            Ok(())
        }
        Ok(e) => bail!("conexión con el coordinador perdida: {e}"),
        Err(e) => bail!("lector terminó de forma inesperada: {e}"),
    }
}

fn beat(out: &mpsc::UnboundedSender<Message>, progress: &Progress) {
    match Message::heartbeat(progress.get(), progress.rate()) {
        Ok(msg) => {
            let _ = out.send(msg);
        }
        Err(e) => warn!("no se pudo armar el heartbeat: {e}"),
    }
}

/// Corre la tarea en `spawn_blocking` con un heartbeat periódico y manda
/// JOB_DONE al terminar. Si falla no se manda nada: los heartbeats se
/// cortan y el coordinador la reasigna por timeout.
fn spawn_task(
    config: &WorkerConfig,
    kernels: Arc<KernelRegistry>,
    storage: Arc<dyn Storage>,
    instructions: JobInstructions,
    data: PathBuf,
    out: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    let slow = config.slow;
    let every = config.heartbeat;

    tokio::spawn(async move {
        let progress = Progress::new();
        let beat_progress = progress.clone();
        let beat_out = out.clone();
        let heartbeat = PeriodicCallback::start(every, move || beat(&beat_out, &beat_progress));

        let worker_progress = progress.clone();
        let kind = instructions.kind;
        let handle = tokio::task::spawn_blocking(move || {
            execute(
                kernels.as_ref(),
                storage.as_ref(),
                &instructions,
                &data,
                &worker_progress,
                slow,
            )
        });

        let outcome = handle.await;
        heartbeat.stop();

        match outcome {
            Ok(Ok(result)) => {
                // un último latido con el total antes de avisar
                beat(&out, &progress);
                let _ = out.send(Message::job_done(result.display().to_string()));
            }
            Ok(Err(e)) => error!(?kind, "error procesando la tarea: {e}"),
            Err(e) => error!(?kind, "panic o join error en la tarea: {e}"),
        }
    })
}
