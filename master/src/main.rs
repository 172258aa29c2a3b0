mod config;
mod coordinator;
mod failover;
mod handlers;
mod monitor;
mod protocol;
mod scheduler;
mod server;
mod state;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::{net::TcpListener, sync::watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::{
    partition::DEFAULT_LINES_PER_PARTITION, KernelRegistry, LocalStorage, PartitionPolicy,
    StatusSnapshot, Storage,
};

use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Partitioning {
    /// ceil(tamaño / workers) bytes por partición
    Balanced,
    /// N líneas por partición
    Lines,
}

#[derive(Parser, Debug)]
#[command(name = "master", about = "Coordinador MapReduce")]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = common::DEFAULT_PORT)]
    port: u16,

    /// Directorio para archivos intermedios (se vacía al iniciar cada job)
    #[arg(long, default_value = "temp")]
    storage_dir: PathBuf,

    #[arg(long, default_value_t = 3)]
    ack_timeout_secs: u64,

    #[arg(long, default_value_t = config::MAX_ACK_RETRIES)]
    max_ack_retries: u32,

    #[arg(long, default_value_t = 5)]
    heartbeat_timeout_secs: u64,

    /// Margen mínimo (s) para reasignar la tarea de un straggler
    #[arg(long, default_value_t = 5)]
    straggler_slack_secs: u64,

    #[arg(long, default_value_t = 1000)]
    tick_millis: u64,

    #[arg(long, value_enum, default_value_t = Partitioning::Balanced)]
    partitioning: Partitioning,

    #[arg(long, default_value_t = DEFAULT_LINES_PER_PARTITION)]
    lines_per_partition: usize,

    /// Habilita GET /health y /api/v1/status en esta dirección
    #[arg(long)]
    status_addr: Option<SocketAddr>,

    /// Duerme en cada vuelta del loop (debug)
    #[arg(long)]
    slow: bool,
}

impl From<Args> for CoordinatorConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            storage_dir: args.storage_dir,
            ack_timeout: Duration::from_secs(args.ack_timeout_secs),
            max_ack_retries: args.max_ack_retries,
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
            straggler_slack: Duration::from_secs(args.straggler_slack_secs),
            tick: Duration::from_millis(args.tick_millis.max(1)),
            partitioning: match args.partitioning {
                Partitioning::Balanced => PartitionPolicy::Balanced,
                Partitioning::Lines => PartitionPolicy::FixedLines(args.lines_per_partition),
            },
            status_addr: args.status_addr,
            slow: args.slow,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=info,tower_http=info")),
        )
        .init();

    let config = CoordinatorConfig::from(Args::parse());
    let storage = LocalStorage::new(&config.storage_dir)
        .with_context(|| format!("no se pudo abrir {}", config.storage_dir.display()))?;

    let status_tx = match config.status_addr {
        Some(addr) => {
            let (tx, rx) = watch::channel(StatusSnapshot::default());
            let app = handlers::build_router(rx);
            let http = TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind status {addr}"))?;
            info!("status HTTP en {}", http.local_addr()?);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(http, app).await {
                    tracing::error!("servidor de status terminó: {e}");
                }
            });
            Some(tx)
        }
        None => None,
    };

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("bind {}:{}", config.host, config.port))?;

    info!(
        storage = %storage.root().display(),
        partitioning = ?config.partitioning,
        "coordinador iniciado"
    );
    let coordinator = Coordinator::new(config, Arc::new(storage), KernelRegistry::builtin());
    server::run(listener, coordinator, status_tx).await
}
