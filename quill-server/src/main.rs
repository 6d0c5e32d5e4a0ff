//! quill-server — shared plain-text editor.
//!
//! Roles:
//! - `serve` (default): hub in-process plus a supervisor keeping one worker
//!   per CPU alive; `--standalone` runs a single in-memory worker instead
//! - `worker`: one client-facing server talking to the hub
//! - `hub`: the shared store and bus on its own
//!
//! # Environment Variables
//!
//! - `QUILL_PORT`, `QUILL_HOST`: client-facing address (default `0.0.0.0:5000`)
//! - `QUILL_WORKERS`: worker count
//! - `QUILL_HUB_HOST`, `QUILL_HUB_PORT`: hub address (default `127.0.0.1:6380`)
//! - `QUILL_DATA_DIR`: hub database directory
//! - `RUST_LOG`: log filter (default `info`)

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use quill_sync::{
    HubConfig, HubEndpoint, HubServer, LocalBus, MemoryStore, ProcessLauncher, RemoteBus,
    RemoteStore, StoreConfig, Supervisor, SupervisorConfig, WorkerConfig, WorkerServer,
    DEFAULT_HUB_PORT, DEFAULT_PORT, SLOT_ENV,
};

#[derive(Parser, Debug)]
#[command(name = "quill-server")]
#[command(version, about = "Real-time shared plain-text editor", long_about = None)]
struct Cli {
    #[command(flatten)]
    net: NetArgs,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct NetArgs {
    /// Client-facing port
    #[arg(long, env = "QUILL_PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Client-facing bind host
    #[arg(long, env = "QUILL_HOST", default_value = "0.0.0.0", global = true)]
    bind_host: String,

    /// Hub host
    #[arg(long, env = "QUILL_HUB_HOST", default_value = "127.0.0.1", global = true)]
    hub_host: String,

    /// Hub port
    #[arg(long, env = "QUILL_HUB_PORT", default_value_t = DEFAULT_HUB_PORT, global = true)]
    hub_port: u16,
}

impl NetArgs {
    fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    fn hub(&self) -> HubEndpoint {
        HubEndpoint::new(self.hub_host.clone(), self.hub_port)
    }

    /// Arguments that reproduce these settings in a child worker.
    fn worker_args(&self) -> Vec<String> {
        vec![
            "worker".into(),
            "--port".into(),
            self.port.to_string(),
            "--bind-host".into(),
            self.bind_host.clone(),
            "--hub-host".into(),
            self.hub_host.clone(),
            "--hub-port".into(),
            self.hub_port.to_string(),
        ]
    }
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Number of worker processes
    #[arg(long, env = "QUILL_WORKERS", global = true)]
    workers: Option<usize>,

    /// Hub database directory
    #[arg(long, env = "QUILL_DATA_DIR", default_value = "quill_data", global = true)]
    data_dir: PathBuf,

    /// Single process with an in-memory store and bus
    #[arg(long, global = true)]
    standalone: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the hub and a supervised pool of workers (default)
    Serve,
    /// Run one worker against an existing hub
    Worker,
    /// Run only the hub
    Hub,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve if cli.run.standalone => run_standalone(&cli.net).await,
        Command::Serve => run_serve(&cli.net, &cli.run).await,
        Command::Worker => run_worker(&cli.net).await,
        Command::Hub => run_hub(&cli.net, cli.run.data_dir.clone()).await,
    }
}

fn hub_config(net: &NetArgs, data_dir: PathBuf) -> HubConfig {
    HubConfig {
        bind_addr: format!("{}:{}", net.hub_host, net.hub_port),
        store: StoreConfig {
            path: data_dir,
            ..StoreConfig::default()
        },
        ..HubConfig::default()
    }
}

async fn run_serve(net: &NetArgs, args: &RunArgs) -> Result<()> {
    let hub = HubServer::open(hub_config(net, args.data_dir.clone()))
        .context("failed to open hub store")?;
    let hub_task = tokio::spawn(async move { hub.run().await });

    let mut config = SupervisorConfig::default();
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    let launcher = ProcessLauncher::current_exe(net.worker_args())
        .context("failed to locate the server binary")?;
    let supervisor = Supervisor::new(config, Arc::new(launcher));

    log::info!(
        "Serving on {} with hub at {}",
        net.bind_addr(),
        net.hub().url()
    );

    tokio::select! {
        _ = supervisor.run(shutdown_signal()) => Ok(()),
        res = hub_task => {
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("hub stopped"),
                Err(e) => Err(e).context("hub task failed"),
            }
        }
    }
}

async fn run_worker(net: &NetArgs) -> Result<()> {
    let slot = std::env::var(SLOT_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let url = net.hub().url();

    let config = WorkerConfig {
        bind_addr: net.bind_addr(),
        worker_index: slot,
        ..WorkerConfig::default()
    };
    let server = WorkerServer::new(
        config,
        Arc::new(RemoteStore::new(url.clone())),
        Arc::new(RemoteBus::new(url)),
    );
    log::info!("Worker {slot} (pid {}) starting", std::process::id());

    tokio::select! {
        res = server.run() => res.context("worker stopped"),
        _ = shutdown_signal() => Ok(()),
    }
}

async fn run_hub(net: &NetArgs, data_dir: PathBuf) -> Result<()> {
    let hub = HubServer::open(hub_config(net, data_dir)).context("failed to open hub store")?;
    tokio::select! {
        res = hub.run() => res.context("hub stopped"),
        _ = shutdown_signal() => Ok(()),
    }
}

async fn run_standalone(net: &NetArgs) -> Result<()> {
    let config = WorkerConfig {
        bind_addr: net.bind_addr(),
        ..WorkerConfig::default()
    };
    let server = WorkerServer::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(LocalBus::default()),
    );
    log::info!("Standalone worker on {}", net.bind_addr());

    tokio::select! {
        res = server.run() => res.context("server stopped"),
        _ = shutdown_signal() => Ok(()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested");
}
