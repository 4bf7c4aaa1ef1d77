use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI движка PM: прогон свипов, просмотр истории, приём DBSync
#[derive(Parser, Debug)]
#[command(name = "pmsweep", version, about = "Fabric performance-manager sweep engine")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Run the sweep engine against a topology JSON file
    Run {
        /// PmConfig JSON; PM_* environment variables when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// FabricTopology JSON (re-read before every sweep)
        #[arg(long)]
        topology: PathBuf,
        /// Stop after this many completed sweeps
        #[arg(long)]
        sweeps: Option<u64>,
        /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9899)
        #[arg(long)]
        metrics_addr: Option<String>,
    },
    /// List stored history files (catalog order, oldest first)
    HistoryLs {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Decode one history file and print its summary
    HistoryShow {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        file: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Receive DBSync pushes into a history directory
    Standby {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "0.0.0.0:9870")]
        listen: String,
        /// Ring depth of the receiving store
        #[arg(long, default_value_t = 144)]
        ring_depth: usize,
        #[arg(long, default_value_t = 1024)]
        max_disk_mb: u64,
    },
}
