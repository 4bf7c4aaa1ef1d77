use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod cmd_history;
mod cmd_run;
mod cmd_standby;

fn init_logger() {
    // RUST_LOG, иначе info
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();
    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Run { config, topology, sweeps, metrics_addr } =>
            cmd_run::exec(config, topology, sweeps, metrics_addr),

        cli::Cmd::HistoryLs { dir, json } =>
            cmd_history::exec_ls(dir, json),

        cli::Cmd::HistoryShow { dir, file, json } =>
            cmd_history::exec_show(dir, file, json),

        cli::Cmd::Standby { dir, listen, ring_depth, max_disk_mb } =>
            cmd_standby::exec(dir, listen, ring_depth, max_disk_mb),
    }
}
