use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{FrameReader, FrameWriter, Message, MessageType, StatusSnapshot, SubmitJob};
use reqwest::Client;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el coordinador")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un job y espera el resultado
    Submit {
        /// Kernel map registrado (ej: word_count)
        #[arg(long)]
        mapper: String,

        /// Kernel reduce registrado (ej: word_count)
        #[arg(long)]
        reducer: String,

        /// Archivo de entrada
        #[arg(long, value_name = "PATH")]
        data: PathBuf,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value_t = common::DEFAULT_PORT)]
        port: u16,

        /// Imprime el contenido del resultado además de su ruta
        #[arg(long)]
        show: bool,
    },
    /// Consulta el endpoint de status del coordinador
    Status {
        /// Base del servidor de status (--status-addr del coordinador)
        #[arg(long, env = "MASTER_URL", default_value = "http://localhost:8080")]
        url: String,
    },
}

/// Cómo terminó un SUBMIT_JOB.
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Finished(PathBuf),
    Denied(String),
}

/// El coordinador puede correr en otro directorio: mandamos rutas absolutas.
fn absolute(data: &Path) -> PathBuf {
    std::fs::canonicalize(data).unwrap_or_else(|_| data.to_path_buf())
}

/// Envía el job y espera el aviso de fin (o el rechazo). El aviso se
/// confirma con SUBMITTED_JOB_FINISHED_ACK.
pub async fn submit_job<R, W>(read: &mut R, write: &mut W, req: &SubmitJob) -> Result<SubmitOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut out = FrameWriter::new();
    let mut frames = FrameReader::new();

    out.send(&Message::submit_job(req)?);
    out.flush_all(write).await?;

    loop {
        let msg = frames
            .next_message(read)
            .await
            .context("esperando respuesta del coordinador")?;
        match msg.kind {
            MessageType::SubmitJobAck => info!("job aceptado, esperando resultado..."),
            MessageType::SubmitJobDenied => return Ok(SubmitOutcome::Denied(msg.text()?)),
            MessageType::SubmittedJobFinished => {
                let result = PathBuf::from(msg.text()?);
                out.send(&Message::empty(MessageType::SubmittedJobFinishedAck));
                out.flush_all(write).await?;
                return Ok(SubmitOutcome::Finished(result));
            }
            other => debug!(kind = ?other, "mensaje ignorado"),
        }
    }
}

fn print_status(snap: &StatusSnapshot) {
    println!("Coordinador:");
    println!("  fase: {:?}", snap.phase);
    if let Some(job) = &snap.job {
        println!("  job: mapper={} reducer={}", job.mapper, job.reducer);
        println!("  datos: {}", job.data_path);
        println!("  particiones: {}", job.partitions);
        println!("  enviado: {}", job.submitted_at);
        if let Some(done) = &job.finished_at {
            println!("  finalizado: {}", done);
        }
        if let Some(result) = &job.result {
            println!("  resultado: {}", result);
        }
    }
    let t = &snap.tasks;
    println!(
        "  tareas: blocked={}, ready={}, assigned={}, running={}, done={}",
        t.blocked, t.ready, t.assigned, t.running, t.done
    );
    match snap.utilization {
        Some(u) => println!("  utilización: {:.1}%", u * 100.0),
        None => println!("  utilización: (sin job)"),
    }

    if snap.workers.is_empty() {
        println!("No hay conexiones.");
    }
    for w in &snap.workers {
        println!("Worker {} ({})", w.worker_id, w.peer);
        println!("  estado         : {:?}", w.state);
        match w.task {
            Some(task) => println!("  tarea          : {}", task),
            None => println!("  tarea          : (ninguna)"),
        }
        println!("  progreso       : {} / {} bytes", w.progress, w.chunk_size);
        match w.rate {
            Some(rate) => println!("  ritmo          : {:.1} B/s", rate),
            None => println!("  ritmo          : (sin datos)"),
        }
        println!("  acks pendientes: {}", w.pending_acks);
        println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Submit {
            mapper,
            reducer,
            data,
            host,
            port,
            show,
        } => {
            let req = SubmitJob {
                mapper,
                reducer,
                data_path: absolute(&data).display().to_string(),
            };
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .with_context(|| format!("conectando a {host}:{port}"))?;
            let (mut read, mut write) = stream.into_split();

            match submit_job(&mut read, &mut write, &req).await? {
                SubmitOutcome::Finished(result) => {
                    println!("Job terminado. Resultado: {}", result.display());
                    if show {
                        let content = std::fs::read_to_string(&result)
                            .with_context(|| format!("leyendo {}", result.display()))?;
                        print!("{content}");
                    }
                }
                SubmitOutcome::Denied(reason) => bail!("job rechazado: {reason}"),
            }
        }

        Commands::Status { url } => {
            let url = format!("{}/api/v1/status", url.trim_end_matches('/'));
            let resp = Client::new().get(&url).send().await?;
            if resp.status().is_success() {
                let snap: StatusSnapshot = resp.json().await?;
                print_status(&snap);
            } else {
                println!("Error consultando {} (status {})", url, resp.status());
            }
        }
    }

    Ok(())
}
