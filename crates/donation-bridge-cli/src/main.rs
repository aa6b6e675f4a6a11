//! donation-bridge: run a data-donation session from the command line.

mod console;
mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use donation_bridge::{
    BRIDGE_VERSION, BridgeConfig, ChannelPresenter, DirectorySink, FileStore, FlowState,
    MemoryStore, ProcessSpawner, ResumePolicy, ScriptPackage, SessionId, SessionRegistry,
    SessionStore, StaticResolver, VersionInfo, WorkerConfig, run_stdio_worker,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "donation-bridge",
    version,
    about = "Run a data-donation flow against an isolated script worker",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one session. Directives are printed to stdout as JSON lines;
    /// answers are read from stdin.
    Run(RunArgs),
    /// Act as a worker running the built-in demo script on stdin/stdout.
    DemoWorker,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Study identifier sent to the worker.
    #[arg(long, default_value = "demo")]
    study: String,

    /// Locale handed to the script (overrides BRIDGE_LOCALE).
    #[arg(long)]
    locale: Option<String>,

    /// Directory the finished donation is written to.
    #[arg(long, value_name = "DIR", default_value = "donations")]
    output_dir: PathBuf,

    /// Keep the session log on disk so an interrupted session can be resumed.
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Resume this session id from --store-dir.
    #[arg(long, value_name = "UUID", requires = "store_dir")]
    resume: Option<String>,

    /// Worker restarts allowed before the session fails.
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Seconds the participant has to answer each page.
    #[arg(long, value_name = "SECONDS", value_parser = parse_seconds)]
    user_response_timeout: Option<Duration>,

    /// full, last-fragment or none.
    #[arg(long)]
    resume_policy: Option<ResumePolicy>,

    /// Worker program and its arguments. Defaults to this binary's demo worker.
    #[arg(last = true, value_name = "PROGRAM")]
    program: Vec<String>,
}

/// Initialize tracing with BRIDGE_LOG and LOG_FORMAT support.
///
/// Everything goes to stderr: stdout carries directives (or, for a worker,
/// protocol frames).
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("BRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "donation_bridge={level},donation_bridge_cli={level},donation_bridge::script={level}"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw.trim().parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn build_config(args: &RunArgs) -> BridgeConfig {
    let mut config = BridgeConfig::from_env();
    if let Some(locale) = &args.locale {
        config = config.with_locale(locale.clone());
    }
    if let Some(n) = args.max_restarts {
        config = config.with_max_restarts(n);
    }
    if let Some(timeout) = args.user_response_timeout {
        config = config.with_user_response_timeout(timeout);
    }
    if let Some(policy) = args.resume_policy {
        config = config.with_resume_policy(policy);
    }
    config
}

fn script_package(args: &RunArgs) -> anyhow::Result<ScriptPackage> {
    let package = match args.program.split_first() {
        Some((program, rest)) => ScriptPackage::new(&args.study, program).with_args(rest.iter().cloned()),
        None => {
            let exe = std::env::current_exe().context("cannot locate own executable")?;
            ScriptPackage::new(&args.study, exe).with_args(["demo-worker"])
        }
    };
    Ok(match &args.locale {
        Some(locale) => package.with_locale(locale.clone()),
        None => package,
    })
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args);
    let package = script_package(&args)?;
    info!(
        version = ?VersionInfo::new(),
        study_id = %args.study,
        program = %package.program.display(),
        "Starting donation session"
    );

    let store: Arc<dyn SessionStore> = match &args.store_dir {
        Some(dir) => Arc::new(FileStore::new(dir)),
        None => Arc::new(MemoryStore::new()),
    };
    let (presenter, events) = ChannelPresenter::new();

    let registry = SessionRegistry::new(
        Arc::new(config),
        Arc::new(StaticResolver::new(package)),
        Arc::new(ProcessSpawner),
        store,
        Arc::new(presenter),
        Arc::new(DirectorySink::new(&args.output_dir)),
    );

    let handle = match &args.resume {
        Some(id) => {
            let id = SessionId::parse(id).with_context(|| format!("invalid session id '{id}'"))?;
            registry.resume(&args.study, id).await?
        }
        None => registry.start(&args.study).await?,
    };
    info!(session_id = %handle.id(), "Session started");

    let cancel = handle.link().cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling session");
            cancel.cancel();
        }
    });

    let console = tokio::spawn(console::run(events, handle.link().clone()));
    let outcome = handle.wait().await.context("session task failed")?;
    match console.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "Console stopped with an error"),
        Err(e) => tracing::warn!(error = %e, "Console task failed"),
        Ok(Ok(())) => {}
    }

    match outcome.state {
        FlowState::Completed => {
            info!(
                session_id = %outcome.session_id,
                fragments = outcome.fragments,
                output_dir = %args.output_dir.display(),
                "Donation complete"
            );
            Ok(())
        }
        state => match outcome.error {
            Some(err) => bail!("session {} ended {state}: {err}", outcome.session_id),
            None => bail!("session {} ended {state}", outcome.session_id),
        },
    }
}

async fn demo_worker() -> anyhow::Result<()> {
    info!(version = BRIDGE_VERSION, "Demo worker starting");
    run_stdio_worker(&mut demo::DemoScript, WorkerConfig::from_env()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::DemoWorker => demo_worker().await,
    }
}
