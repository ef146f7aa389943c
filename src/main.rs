use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use codeimport_worker::config::{LogStoreConfig, SupervisorConfig, WorkerConfig};
use codeimport_worker::grpc::machine_service::offline_reason_to_proto;
use codeimport_worker::grpc::GrpcJobStore;
use codeimport_worker::machine::OfflineReason;
use codeimport_worker::node::WorkerNode;
use codeimport_worker::proto::machine_service_client::MachineServiceClient;
use codeimport_worker::proto::{
    GetMachineStatusRequest, MachineState, MachineStatusResponse, SetOfflineRequest,
    SetOnlineRequest, SetQuiescingRequest, ShouldAcceptNewJobRequest,
};
use codeimport_worker::shutdown::install_shutdown_handler;
use codeimport_worker::store::FsBlobStore;
use codeimport_worker::sync::{InMemoryRepository, JobSynchronizer, SyncSnapshot};
use codeimport_worker::worker::{RunOutcome, WorkerMonitor};

#[derive(Parser, Debug)]
#[command(name = "codeimport-worker")]
#[command(version)]
#[command(about = "Dispatches and supervises source-control import jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the worker machine: claim jobs and supervise imports
    Worker(WorkerArgs),

    /// Run a single import job and exit
    RunJob(RunJobArgs),

    /// Machine availability commands
    Machine {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: MachineCommands,
    },

    /// Reconcile import jobs with series status in a JSON snapshot
    Sync(SyncArgs),
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SupervisorArgs {
    /// Import worker executable
    #[arg(long, default_value = "/usr/bin/codeimport-vcs-worker")]
    worker_executable: PathBuf,

    /// Fixed argument passed to the worker before the job arguments (repeatable)
    #[arg(long = "worker-arg")]
    worker_args: Vec<String>,

    /// Kill a worker that produces no output for this long
    #[arg(long, default_value = "1200000")]
    inactivity_timeout_ms: u64,

    /// Interval between heartbeats to the job store
    #[arg(long, default_value = "30000")]
    heartbeat_interval_ms: u64,
}

impl SupervisorArgs {
    fn into_config(self) -> SupervisorConfig {
        SupervisorConfig {
            worker_executable: self.worker_executable,
            worker_args: self.worker_args,
            inactivity_timeout_ms: self.inactivity_timeout_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
        }
    }
}

#[derive(Parser, Debug)]
struct LogArgs {
    /// Directory completed run logs are written to
    #[arg(long, default_value = "/var/lib/codeimport/logs")]
    log_dir: PathBuf,

    /// URL prefix under which the log directory is served
    #[arg(long, default_value = "file:///var/lib/codeimport/logs")]
    log_base_url: String,
}

impl LogArgs {
    fn into_config(self) -> LogStoreConfig {
        LogStoreConfig {
            log_dir: self.log_dir,
            log_base_url: self.log_base_url,
        }
    }
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Hostname this machine registers as
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    hostname: String,

    /// Port for the machine admin gRPC service
    #[arg(long, default_value = "50071")]
    port: u16,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Job store address
    #[arg(long, default_value = "http://127.0.0.1:50060")]
    job_store: String,

    /// Maximum concurrent imports on this machine
    #[arg(long, default_value = "10")]
    max_jobs: usize,

    /// How often to ask the job store for work
    #[arg(long, default_value = "10000")]
    poll_interval_ms: u64,

    /// Take the machine offline if the dispatcher stalls this long
    #[arg(long, default_value = "300000")]
    watchdog_timeout_ms: u64,

    /// Start ONLINE instead of waiting for an operator
    #[arg(long)]
    online: bool,

    #[command(flatten)]
    supervisor: SupervisorArgs,

    #[command(flatten)]
    logs: LogArgs,
}

#[derive(Parser, Debug)]
struct RunJobArgs {
    /// The job ID (UUID)
    #[arg(long)]
    job_id: String,

    /// Job store address
    #[arg(long, default_value = "http://127.0.0.1:50060")]
    job_store: String,

    #[command(flatten)]
    supervisor: SupervisorArgs,

    #[command(flatten)]
    logs: LogArgs,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Machine admin address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50071")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum ReasonArg {
    Stopped,
    Quiesced,
    Watchdog,
}

impl From<ReasonArg> for OfflineReason {
    fn from(reason: ReasonArg) -> Self {
        match reason {
            ReasonArg::Stopped => OfflineReason::Stopped,
            ReasonArg::Quiesced => OfflineReason::Quiesced,
            ReasonArg::Watchdog => OfflineReason::Watchdog,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum MachineCommands {
    /// Show machine state
    Status,
    /// Allow the machine to take new jobs
    Online,
    /// Take the machine offline
    Offline {
        #[arg(long, default_value = "stopped")]
        reason: ReasonArg,
    },
    /// Stop taking new jobs and go offline once running jobs finish
    Quiesce {
        /// Who asked for the drain
        #[arg(long)]
        requested_by: String,

        #[arg(long, default_value = "")]
        message: String,
    },
    /// Ask whether the machine would take a new job now
    Accepting,
}

#[derive(Parser, Debug)]
struct SyncArgs {
    /// JSON snapshot with "series" and "jobs"; updated in place
    #[arg(long)]
    state: PathBuf,

    /// Report what would change without writing the snapshot back
    #[arg(long)]
    dry_run: bool,

    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct MachineStatusOutput {
    hostname: String,
    state: String,
    running_jobs: u32,
    capacity: u32,
    heartbeat_ms: Option<i64>,
    created_at_ms: i64,
}

#[derive(Serialize)]
struct AcceptingOutput {
    accept: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn machine_state_to_string(state: i32) -> String {
    match MachineState::try_from(state) {
        Ok(MachineState::Offline) => "OFFLINE".to_string(),
        Ok(MachineState::Online) => "ONLINE".to_string(),
        Ok(MachineState::Quiescing) => "QUIESCING".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn print_machine_status(
    resp: MachineStatusResponse,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            let output = MachineStatusOutput {
                hostname: resp.hostname,
                state: machine_state_to_string(resp.state),
                running_jobs: resp.running_jobs,
                capacity: resp.capacity,
                heartbeat_ms: (resp.heartbeat_ms > 0).then_some(resp.heartbeat_ms),
                created_at_ms: resp.created_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Hostname:     {}", resp.hostname);
            println!("State:        {}", machine_state_to_string(resp.state));
            println!("Running Jobs: {}/{}", resp.running_jobs, resp.capacity);
            if let Some(heartbeat) = chrono::DateTime::from_timestamp_millis(resp.heartbeat_ms)
                .filter(|_| resp.heartbeat_ms > 0)
            {
                println!("Heartbeat:    {}", heartbeat.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let config = WorkerConfig {
        hostname: args.hostname,
        listen_addr,
        job_store_addr: args.job_store,
        dashboard_addr,
        max_jobs: args.max_jobs,
        poll_interval_ms: args.poll_interval_ms,
        watchdog_timeout_ms: args.watchdog_timeout_ms,
        start_online: args.online,
        supervisor: args.supervisor.into_config(),
        logs: args.logs.into_config(),
    };
    config.validate()?;

    tracing::info!(
        hostname = %config.hostname,
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        job_store = %config.job_store_addr,
        max_jobs = config.max_jobs,
        executable = %config.supervisor.worker_executable.display(),
        "Starting codeimport worker"
    );

    let job_store = Arc::new(GrpcJobStore::connect(&config.job_store_addr).await?);
    let blob_store = Arc::new(FsBlobStore::from_config(&config.logs));
    let shutdown = install_shutdown_handler()?;

    let node = WorkerNode::new(config, job_store, blob_store);
    node.run(shutdown).await?;
    Ok(())
}

async fn run_single_job(args: RunJobArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let job_id = Uuid::parse_str(&args.job_id)?;
    let job_store = Arc::new(GrpcJobStore::connect(&args.job_store).await?);
    let blob_store = Arc::new(FsBlobStore::from_config(&args.logs.into_config()));

    let monitor = WorkerMonitor::new(
        job_id,
        args.supervisor.into_config(),
        job_store,
        blob_store,
    );
    match monitor.run().await? {
        RunOutcome::Finished(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        RunOutcome::Vanished => {
            eprintln!("Job {} vanished; nothing reported", job_id);
        }
    }
    Ok(())
}

async fn handle_machine_command(
    client: &mut MachineServiceClient<Channel>,
    command: MachineCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match command {
        MachineCommands::Status => client.get_machine_status(GetMachineStatusRequest {}).await,
        MachineCommands::Online => client.set_online(SetOnlineRequest {}).await,
        MachineCommands::Offline { reason } => {
            let reason = offline_reason_to_proto(reason.into());
            client
                .set_offline(SetOfflineRequest {
                    reason: reason as i32,
                })
                .await
        }
        MachineCommands::Quiesce {
            requested_by,
            message,
        } => {
            client
                .set_quiescing(SetQuiescingRequest {
                    requested_by,
                    message,
                })
                .await
        }
        MachineCommands::Accepting => {
            let accept = client
                .should_accept_new_job(ShouldAcceptNewJobRequest {})
                .await?
                .into_inner()
                .accept;
            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&AcceptingOutput { accept })?)
                }
                OutputFormat::Table => println!("Accepting new jobs: {}", accept),
            }
            return Ok(());
        }
    };

    match response {
        Ok(resp) => print_machine_status(resp.into_inner(), output_format),
        Err(status) => {
            eprintln!("Error: {}", status.message());
            std::process::exit(1);
        }
    }
}

async fn run_sync(args: SyncArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let snapshot = SyncSnapshot::load(&args.state).await?;
    let synchronizer = JobSynchronizer::new(InMemoryRepository::from_snapshot(snapshot));
    let report = synchronizer.sync().await?;

    if !args.dry_run {
        synchronizer.repository().snapshot().await.save(&args.state).await?;
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => {
            println!("Created:   {}", report.created);
            println!("Updated:   {}", report.updated);
            println!("Deleted:   {}", report.deleted);
            println!("Unchanged: {}", report.unchanged);
            for destination in &report.orphaned_destinations {
                println!("Orphaned destination (clean up manually): {}", destination);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await,
        Commands::RunJob(run_job_args) => run_single_job(run_job_args).await,
        Commands::Machine { client, command } => {
            let channel = Channel::from_shared(client.addr.clone())?.connect().await?;
            let mut machine_client = MachineServiceClient::new(channel);
            handle_machine_command(&mut machine_client, command, &client.output).await
        }
        Commands::Sync(sync_args) => run_sync(sync_args).await,
    }
}
