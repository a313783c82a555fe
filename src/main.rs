//! troupe: run a team of agents from the terminal
//!
//! Usage:
//!   troupe run "fix the failing test"        → run the root agent, events as JSON lines
//!   troupe run --agent reviewer --yolo "..."  → start at another agent, no approval prompts
//!   troupe config                             → print the effective config as TOML
//!   troupe version                            → show version

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use troupe::{parse_answer, TroupeConfig};
use troupe_agent::{Runtime, Session};
use troupe_core::{Event, ResumeElicitationRequest};

#[derive(Parser)]
#[command(
    name = "troupe",
    about = "Multi-agent runtime with shell tools, handoff and tool approval",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one prompt through the agent team
    Run {
        /// Path to the config file (default: troupe.toml in the workspace)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Agent to start with (default: the first configured agent)
        #[arg(short, long)]
        agent: Option<String>,
        /// Workspace directory (default: current directory)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Approve every tool call without asking
        #[arg(long, default_value_t = false)]
        yolo: bool,
        /// Write logs to a file (in addition to stderr)
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// The user message
        prompt: String,
    },
    /// Print the effective config as TOML
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            agent,
            workspace,
            yolo,
            log_file,
            prompt,
        } => {
            let _guard = init_tracing(log_file.as_deref())?;
            let workspace = match workspace {
                Some(w) => w,
                None => std::env::current_dir()?,
            };
            let config_path = config.unwrap_or_else(|| workspace.join("troupe.toml"));
            let config = TroupeConfig::load(&config_path);
            run(config, workspace, agent, yolo, prompt).await?;
        }
        Commands::Config { config } => {
            let path = config.unwrap_or_else(|| PathBuf::from("troupe.toml"));
            print!("{}", TroupeConfig::load(&path).to_toml());
        }
        Commands::Version => {
            println!("troupe v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("invalid log file path: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "troupe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn run(
    config: TroupeConfig,
    workspace: PathBuf,
    agent: Option<String>,
    yolo: bool,
    prompt: String,
) -> anyhow::Result<()> {
    let model = config.provider()?;
    let mut graph = config.build_graph(model, &workspace)?;
    if let Some(agent) = agent {
        graph = graph.with_root(&agent)?;
    }
    let runtime = Runtime::new(Arc::new(graph), config.runtime_config());
    runtime.start().await?;
    tracing::info!("Workspace: {}", workspace.display());

    let mut session = Session::new()
        .with_working_dir(&workspace)
        .with_tools_approved(yolo)
        .with_permissions(config.permissions.clone());
    session.add_user_message(prompt);
    let session = session.into_shared();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stream = runtime.run_stream(session.clone(), cancel.clone()).await?;
    let failed = loop {
        let mut last = None;
        while let Some(event) = stream.next().await {
            println!("{}", serde_json::to_string(&event)?);
            last = Some(event);
        }

        let request = match last {
            Some(Event::ElicitationRequest { message, .. }) => ask(&mut stdin, &message).await?,
            Some(Event::Error { .. }) => break true,
            _ => break false,
        };
        stream = runtime.resume_stream(session.clone(), request, cancel.clone()).await?;
    };

    runtime.shutdown().await;
    if failed {
        anyhow::bail!("run failed");
    }
    Ok(())
}

async fn ask<R>(stdin: &mut tokio::io::Lines<R>, message: &str) -> anyhow::Result<ResumeElicitationRequest>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        eprint!("{} [Y]es / [a]lways / [n]o / [c]ancel: ", message);
        std::io::stderr().flush()?;
        let Some(line) = stdin.next_line().await? else {
            return Ok(ResumeElicitationRequest::cancel());
        };
        if let Some(request) = parse_answer(&line) {
            return Ok(request);
        }
    }
}
