//! Command-line entry points: foreground server, daemon management, and a
//! status query against a running control plane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use valet_runtime::{Runtime, RuntimeConfig};
use valet_supervisor::{
    Evaluator, ModelEvaluator, PathPolicy, RuleEvaluator, Supervisor, SupervisorConfig,
};
use valet_transcript::TranscriptStore;

use crate::daemon;
use crate::gateway::{build_router, spawn_event_fanout, spawn_heartbeat, AppState, HEARTBEAT_INTERVAL};
use crate::service::SessionService;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4780;
const DEFAULT_EVALUATOR_MODEL: &str = "claude-3-5-haiku-latest";

#[derive(Parser, Debug)]
#[command(name = "valet", bin_name = "valet")]
#[command(about = "Loopback control plane for supervised AI agent executions")]
#[command(arg_required_else_help = true)]
pub struct ValetCli {
    #[command(subcommand)]
    command: Command,

    /// Shared secret clients must present; unset means local-trust mode.
    /// Falls back to `VALET_SECRET`.
    #[arg(long, short = 's', global = true)]
    secret: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the control-plane server in the foreground.
    Server(ServerArgs),
    /// Manage the background daemon.
    Daemon(DaemonArgs),
    /// Query a running control plane's status.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Working root agent executions run under.
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Allow-listed subdirectories of the working root for file tools.
    /// Repeatable; empty means the whole working root.
    #[arg(long = "allow", short = 'a')]
    allow: Vec<String>,

    /// Directory for transcripts and other state. Falls back to
    /// `VALET_STATE_DIR`, then the platform data directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Seconds between supervisor evaluations.
    #[arg(long, default_value_t = 30)]
    eval_interval_secs: u64,

    /// Evaluation cycles before an execution is forcibly ended.
    #[arg(long, default_value_t = 50)]
    max_turns: u64,

    /// Wall-clock bound on one execution, in seconds.
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    #[command(subcommand)]
    command: DaemonCommand,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Start the daemon in the background.
    Start(DaemonEndpointArgs),
    /// Stop a running daemon.
    Stop(DaemonEndpointArgs),
    /// Show daemon status.
    Status(DaemonEndpointArgs),
}

#[derive(Args, Debug)]
pub struct DaemonEndpointArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Server(String),
}

pub fn run_valet() -> Result<(), CliError> {
    let cli = ValetCli::parse();
    init_logging();
    let secret = cli
        .secret
        .or_else(|| std::env::var("VALET_SECRET").ok().filter(|s| !s.is_empty()));
    run_command(&cli.command, secret.as_deref())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_command(command: &Command, secret: Option<&str>) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(secret, args),
        Command::Daemon(args) => run_daemon(&args.command, secret),
        Command::Status(args) => run_status(args),
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("valet"))
        .unwrap_or_else(|| PathBuf::from(".").join(".valet"))
}

fn run_server(secret: Option<&str>, args: &ServerArgs) -> Result<(), CliError> {
    let workdir = match &args.workdir {
        Some(workdir) => workdir.clone(),
        None => std::env::current_dir()?,
    };
    let state_dir = args
        .state_dir
        .clone()
        .or_else(|| std::env::var("VALET_STATE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_state_dir);

    let store = TranscriptStore::new(state_dir.join("transcripts"))
        .map_err(|err| CliError::Server(err.to_string()))?;
    let runtime_config = RuntimeConfig::from_env(workdir.clone());

    let evaluator: Arc<dyn Evaluator> = match &runtime_config.api_key {
        Some(key) => {
            let model = std::env::var("VALET_EVALUATOR_MODEL")
                .unwrap_or_else(|_| DEFAULT_EVALUATOR_MODEL.to_string());
            Arc::new(ModelEvaluator::new(
                runtime_config.api_base.clone(),
                key.clone(),
                model,
            ))
        }
        None => {
            tracing::info!("no API key configured; using rule-based evaluator");
            Arc::new(RuleEvaluator)
        }
    };

    let allow: Vec<&str> = args.allow.iter().map(String::as_str).collect();
    let policy = PathPolicy::new(&workdir, &allow);
    let supervisor = Supervisor::new(
        Runtime::new(runtime_config),
        evaluator,
        policy,
        SupervisorConfig {
            eval_interval: Duration::from_secs(args.eval_interval_secs),
            max_turns: args.max_turns,
            timeout: Duration::from_secs(args.timeout_secs),
            ..SupervisorConfig::default()
        },
    );

    let service = SessionService::new(store, supervisor);
    let state = AppState::new(
        service,
        secret.map(|secret| secret.to_string()),
        args.host.clone(),
        args.port,
    );
    let router = build_router(state.clone());

    let addr = format!("{}:{}", args.host, args.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        spawn_event_fanout(state.clone());
        spawn_heartbeat(state.clone(), HEARTBEAT_INTERVAL);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, workdir = %workdir.display(), "control plane listening");

        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down; cancelling active executions");
                shutdown_state.service.cancel_all().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_daemon(command: &DaemonCommand, secret: Option<&str>) -> Result<(), CliError> {
    match command {
        DaemonCommand::Start(args) => daemon::start(&args.host, args.port, secret),
        DaemonCommand::Stop(args) => daemon::stop(&args.host, args.port),
        DaemonCommand::Status(args) => {
            let status = daemon::status(&args.host, args.port)?;
            println!("{status}");
            Ok(())
        }
    }
}

fn run_status(args: &StatusArgs) -> Result<(), CliError> {
    let url = format!("http://{}:{}/health", args.host, args.port);
    let client = HttpClient::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(CliError::Server(format!(
            "status request failed with {}",
            response.status()
        )));
    }
    let value: serde_json::Value = response.json()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
    );
    Ok(())
}
