use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nodeflow_client::{HttpBuildService, HttpMutationService};
use nodeflow_core::config::AppConfig;
use nodeflow_core::error::NodeflowError;
use nodeflow_core::template::NodeTemplate;
use nodeflow_core::traits::BuildService;
use nodeflow_core::types::{BuildRequest, BuildStatus, NodeEvent, NodeId};
use nodeflow_runtime::{
    Collaborators, ConnectOutcome, NodeCoordinator, NodeRecord, NodeView, RunOutcome,
    SystemUrlOpener, TracingAnalyticsSink, TracingErrorSink,
};

#[derive(Parser)]
#[command(name = "nodeflow", version, about = "Node build and authorization runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "nodeflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Node id
    #[arg(long)]
    node: String,
    /// Node template as JSON
    #[arg(long)]
    template: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Show effective configuration
    Config,
    /// Build the flow up to a node and wait for its result
    Run {
        #[command(flatten)]
        target: NodeArgs,
    },
    /// Start the authorization handshake for a node's auth field
    Connect {
        #[command(flatten)]
        target: NodeArgs,
        /// Auth field key (defaults to auth.default_field)
        #[arg(long)]
        field: Option<String>,
    },
    /// Drop a node's external connection
    Disconnect {
        #[command(flatten)]
        target: NodeArgs,
        /// Auth field key (defaults to auth.default_field)
        #[arg(long)]
        field: Option<String>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nodeflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "nodeflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: {} not found, using defaults",
            cli.config.display()
        );
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run { target } => {
            let (coord, id, _cancel) = setup(config, &target).await?;
            run_node(&coord, &id).await?;
        }
        Commands::Connect { target, field } => {
            let (coord, id, _cancel) = setup(config, &target).await?;
            connect_node(&coord, &id, field.as_deref()).await?;
        }
        Commands::Disconnect { target, field } => {
            let (coord, id, _cancel) = setup(config, &target).await?;
            coord
                .connection()
                .request_disconnect(&id, field.as_deref())
                .await?;
            print_view(&coord.view(&id, false).await?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_template(path: &Path) -> anyhow::Result<NodeTemplate> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading template {}", path.display()))?;
    let template = serde_json::from_str(&content)
        .with_context(|| format!("parsing template {}", path.display()))?;
    Ok(template)
}

/// Wire the HTTP collaborators into a coordinator holding the one node.
async fn setup(
    config: AppConfig,
    target: &NodeArgs,
) -> anyhow::Result<(Arc<NodeCoordinator>, NodeId, CancellationToken)> {
    let template = load_template(&target.template)?;
    let (build_tx, build_rx) = mpsc::channel(64);

    let build: Arc<dyn BuildService> =
        match HttpBuildService::new(&config.backend, build_tx) {
            Ok(svc) => Arc::new(svc),
            Err(e) => {
                warn!(error = %e, "Build service unavailable");
                Arc::new(UnavailableBuild(e.to_string()))
            }
        };

    let collaborators = Collaborators {
        mutation: Arc::new(HttpMutationService::new(&config.backend)?),
        build,
        errors: Arc::new(TracingErrorSink),
        analytics: Arc::new(TracingAnalyticsSink),
        opener: Arc::new(SystemUrlOpener),
    };
    let coord = Arc::new(NodeCoordinator::new(config, collaborators));

    let id = NodeId::from_str(&target.node);
    coord.add_node(NodeRecord::new(id.clone(), template)).await;

    let cancel = CancellationToken::new();
    coord.spawn_build_listener(build_rx, cancel.clone());
    coord.spawn_authorization_watcher(cancel.clone());
    Ok((coord, id, cancel))
}

async fn run_node(coord: &Arc<NodeCoordinator>, id: &NodeId) -> anyhow::Result<()> {
    let mut events = coord.event_bus().subscribe();

    match coord.request_run(id, false).await? {
        RunOutcome::BuildIssued => info!(node = %id, "Waiting for build result"),
        other => anyhow::bail!("build not issued: {:?}", other),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(NodeEvent::StatusChanged { node_id, status }) if &node_id == id => {
                    if matches!(status, BuildStatus::Built | BuildStatus::Error | BuildStatus::Idle) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping build...");
                coord.request_run(id, true).await?;
            }
        }
    }

    print_view(&coord.view(id, false).await?);
    Ok(())
}

async fn connect_node(
    coord: &Arc<NodeCoordinator>,
    id: &NodeId,
    field: Option<&str>,
) -> anyhow::Result<()> {
    let mut events = coord.event_bus().subscribe();

    match coord.connection().request_connect(id, field).await? {
        ConnectOutcome::PollingStarted => {
            println!("Complete the authorization in your browser...");
        }
        ConnectOutcome::Disconnected => {
            println!("Node was connected; disconnected instead.");
            print_view(&coord.view(id, false).await?);
            return Ok(());
        }
        ConnectOutcome::Ignored => anyhow::bail!("auth link is in the error state"),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(NodeEvent::PollingStopped { node_id, reason, .. }) if &node_id == id => {
                    info!(node = %id, reason = ?reason, "Authorization polling ended");
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                coord.shutdown().await;
                break;
            }
        }
    }

    println!("Connection: {:?}", coord.connection_state(id).await);
    Ok(())
}

fn print_view(view: &NodeView) {
    println!("{} ({})", view.display_name, view.id);
    println!("  status: {}", view.status);
    for line in view.summary.lines() {
        println!("  {}", line);
    }
    if let Some(connect) = &view.connect {
        println!("  connection: {:?}", connect.state);
    }
    if view.show_update_warning {
        println!("  warning: component update available with breaking changes");
    }
}

/// Stands in when no flow is configured; every build is rejected.
struct UnavailableBuild(String);

impl BuildService for UnavailableBuild {
    fn build(&self, _request: BuildRequest) -> BoxFuture<'_, nodeflow_core::Result<()>> {
        let message = self.0.clone();
        Box::pin(async move { Err(NodeflowError::Build(message)) })
    }

    fn stop(&self) -> BoxFuture<'_, nodeflow_core::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
