use std::{net::SocketAddr, path::PathBuf, time::Duration};

use common::partition::PartitionPolicy;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);
pub const MAX_ACK_RETRIES: u32 = 3;
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
pub const STRAGGLER_SLACK: Duration = Duration::from_secs(5);
pub const TICK: Duration = Duration::from_millis(1000);
pub const SLOW_LOOP_DELAY: Duration = Duration::from_millis(500);

/// Parámetros del coordinador. Cada timeout es independiente.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,

    pub ack_timeout: Duration,
    pub max_ack_retries: u32,
    pub heartbeat_timeout: Duration,
    pub straggler_slack: Duration,
    pub tick: Duration,

    pub partitioning: PartitionPolicy,
    pub status_addr: Option<SocketAddr>,
    /// Duerme SLOW_LOOP_DELAY por iteración del loop (debug).
    pub slow: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: common::DEFAULT_PORT,
            storage_dir: PathBuf::from("temp"),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_ack_retries: MAX_ACK_RETRIES,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            straggler_slack: STRAGGLER_SLACK,
            tick: TICK,
            partitioning: PartitionPolicy::default(),
            status_addr: None,
            slow: false,
        }
    }
}
