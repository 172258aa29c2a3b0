mod worker;

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::worker::WorkerConfig;

#[derive(Parser, Debug)]
#[command(name = "worker", about = "Worker MapReduce: ejecuta tareas map/reduce del coordinador")]
struct Args {
    /// Host del coordinador
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = common::DEFAULT_PORT)]
    port: u16,

    /// Directorio donde se escriben las salidas de las tareas
    #[arg(long, default_value = "temp")]
    storage_dir: PathBuf,

    /// Procesa lento (100 ms por línea) para provocar stragglers
    #[arg(long)]
    slow: bool,

    /// Intervalo entre heartbeats mientras corre una tarea
    #[arg(long, default_value_t = worker::DEFAULT_HEARTBEAT.as_millis() as u64)]
    heartbeat_millis: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=info,common=info")),
        )
        .init();

    let args = Args::parse();
    worker::run(WorkerConfig {
        host: args.host,
        port: args.port,
        storage_dir: args.storage_dir,
        slow: args.slow,
        heartbeat: Duration::from_millis(args.heartbeat_millis.max(1)),
    })
    .await
}
