use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flowrun_core::config::AppConfig;
use flowrun_core::event::{Event, EventKind};
use flowrun_core::graph::{validate, Flow, GraphIndex};
use flowrun_core::traits::{ExecutionStore, FlowSource};
use flowrun_core::types::{ExecutionStatus, Variables};
use flowrun_engine::{FlowCatalog, FlowEngine};
use flowrun_gateway::{EventStreamClient, GatewayServer};
use flowrun_llm::AgentRouter;
use flowrun_mcp::{McpConnector, ToolSessionManager};
use flowrun_store::{MemoryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "flowrun", version, about = "Graph-based workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowrun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway over the flows directory
    Serve,
    /// Execute a flow file and stream its events
    Run {
        /// Flow definition (.json or .toml)
        file: PathBuf,
        /// Variable override (KEY=VALUE, VALUE parsed as JSON when possible)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Approve every approval step without prompting
        #[arg(long)]
        auto_approve: bool,
    },
    /// Check a flow file without running it
    Validate {
        file: PathBuf,
    },
    /// List flows in the configured flows directory
    Flows,
    /// Follow the events of an execution on a running gateway
    Watch {
        /// Execution ID
        id: String,
        /// Gateway base URL
        #[arg(long, default_value = "http://127.0.0.1:18790")]
        url: String,
        /// API key or gateway token
        #[arg(long, env = "FLOWRUN_TOKEN")]
        token: Option<String>,
        /// Resume after this sequence number
        #[arg(long, default_value = "0")]
        from_seq: u64,
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
    // Initialize tracing
    let filter = EnvFilter::try_from_env("FLOWRUN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("flowrun=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "flowrun", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate_file(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run {
            file,
            vars,
            auto_approve,
        } => run_file(config, &file, &vars, auto_approve).await,
        Commands::Flows => {
            let catalog = FlowCatalog::load_dir(&config.engine.flows_dir());
            let flows = catalog.list_flows().await?;
            if flows.is_empty() {
                println!("No flows in {}", config.engine.flows_dir().display());
            }
            for flow in flows {
                println!(
                    "{:<24} v{:<8} {:>3} steps  {}",
                    flow.id, flow.version, flow.steps, flow.name
                );
            }
            Ok(())
        }
        Commands::Watch {
            id,
            url,
            token,
            from_seq,
        } => {
            let token = token.or_else(|| config.gateway.as_ref().and_then(|g| g.token.clone()));
            let client = EventStreamClient::new(&url, token, config.client.clone());
            let terminal = client.follow(&id, from_seq, print_event).await?;
            if matches!(terminal.kind, EventKind::ExecutionCompleted { .. }) {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } | Commands::Validate { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    // Check for config in the home directory
    let home_config = AppConfig::default_path();
    if home_config.exists() {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

/// Engine plus the background pieces that must be stopped with it.
struct Runtime {
    engine: Arc<FlowEngine>,
    sessions: Arc<ToolSessionManager>,
    background: CancellationToken,
}

impl Runtime {
    fn build(config: &AppConfig, flows: Arc<dyn FlowSource>) -> anyhow::Result<Self> {
        let store: Arc<dyn ExecutionStore> = if config.store.in_memory {
            Arc::new(MemoryStore::new())
        } else {
            let db_path = config.store.path();
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            Arc::new(SqliteStore::open(&db_path)?)
        };

        let connector = Arc::new(McpConnector::new());
        let notifications = connector.subscribe_events();
        let sessions = Arc::new(ToolSessionManager::new(connector, config.sessions.clone()));
        let background = CancellationToken::new();
        sessions.spawn_sweeper(background.clone());
        sessions.spawn_notification_listener(notifications, background.clone());

        let agents = Arc::new(AgentRouter::new(&config.agents));
        let engine = FlowEngine::from_config(config, flows, agents, sessions.clone()).with_store(store);

        Ok(Self {
            engine: Arc::new(engine),
            sessions,
            background,
        })
    }

    async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.background.cancel();
        self.sessions.shutdown().await;
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let catalog = FlowCatalog::load_dir(&config.engine.flows_dir());
    let runtime = Runtime::build(&config, Arc::new(catalog))?;

    let gateway_config = config.gateway.clone().unwrap_or_default();
    info!(bind = %gateway_config.bind, "Starting flow gateway");
    let server = GatewayServer::new(gateway_config, runtime.engine.clone());

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down gateway...");
        cancel_clone.cancel();
    });

    let result = server.run(cancel).await;
    runtime.shutdown().await;
    result
}

fn validate_file(file: &Path) -> anyhow::Result<()> {
    let flow = Flow::load(file)?;
    if let Err(e) = validate(&flow) {
        eprintln!("{}: {}", file.display(), e);
        std::process::exit(1);
    }
    let index = GraphIndex::build(&flow);
    println!(
        "{}: flow '{}' is valid ({} steps, start '{}')",
        file.display(),
        flow.id,
        flow.steps.len(),
        flow.start
    );
    for id in index.order() {
        if let Some(step) = flow.step(id) {
            println!("  {:<20} {:<10} -> {}", step.id, step.kind, step.next_steps.join(", "));
        }
    }
    Ok(())
}

/// Parse `KEY=VALUE` pairs; values that are valid JSON keep their type.
fn parse_vars(pairs: &[String]) -> anyhow::Result<Variables> {
    let mut vars = Variables::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid --var '{}', expected KEY=VALUE", pair))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        vars.insert(key.trim().to_string(), value);
    }
    Ok(vars)
}

async fn run_file(
    config: AppConfig,
    file: &Path,
    vars: &[String],
    auto_approve: bool,
) -> anyhow::Result<()> {
    let flow = Flow::load(file)?;
    let overrides = parse_vars(vars)?;
    let runtime = Runtime::build(&config, Arc::new(FlowCatalog::from_flows([flow.clone()])))?;
    let engine = runtime.engine.clone();

    let summary = engine.submit_flow(flow, overrides).await?;
    eprintln!("[execution {}]", summary.id);

    let mut events = engine.subscribe(&summary.id, 0).await?;
    while let Some(event) = events.next().await {
        print_event(&event);
        if let EventKind::ApprovalRequested { step_id, .. } = &event.kind {
            let approved = if auto_approve {
                true
            } else {
                tokio::task::spawn_blocking(|| {
                    dialoguer::Confirm::new()
                        .with_prompt("Approve?")
                        .default(false)
                        .interact()
                        .unwrap_or(false)
                })
                .await
                .unwrap_or(false)
            };
            let reason = (!approved).then(|| "rejected from the command line".to_string());
            if let Err(e) = engine
                .submit_approval(&summary.id, approved, reason, Some(step_id.as_str()))
                .await
            {
                error!(error = %e, "Failed to deliver approval decision");
            }
        }
    }

    let done = engine.wait(&summary.id).await?;
    runtime.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&done.variables)?);

    if done.status != ExecutionStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &Event) {
    let detail = match &event.kind {
        EventKind::ExecutionStarted { flow_id, .. } => format!("flow '{}'", flow_id),
        EventKind::StepStarted { step_id, attempt } => format!("{} (attempt {})", step_id, attempt),
        EventKind::StepRetrying {
            step_id,
            delay_ms,
            reason,
            ..
        } => format!("{} in {}ms: {}", step_id, delay_ms, reason),
        EventKind::StepCompleted { step_id, activated, .. } => {
            format!("{} -> [{}]", step_id, activated.join(", "))
        }
        EventKind::StepFailed { step_id, reason, .. } => format!("{}: {}", step_id, reason),
        EventKind::StepSkipped { step_id } => step_id.clone(),
        EventKind::VariablesUpdated { unresolved, .. } => {
            format!("unresolved: {}", unresolved.join(", "))
        }
        EventKind::ApprovalRequested { step_id, message } => format!("{}: \"{}\"", step_id, message),
        EventKind::ApprovalResolved { step_id, approved, .. } => {
            format!("{}: {}", step_id, if *approved { "approved" } else { "rejected" })
        }
        EventKind::FeedbackLooped {
            step_id,
            target,
            iteration,
            ..
        } => format!("{} -> {} (iteration {})", step_id, target, iteration),
        EventKind::ReentryRejected { from, step_id } => format!("{} -> {}", from, step_id),
        EventKind::ExecutionCompleted { .. } => String::new(),
        EventKind::ExecutionFailed { reason, .. } | EventKind::ExecutionCancelled { reason } => {
            reason.clone()
        }
    };
    eprintln!("{:>4} {:<20} {}", event.seq, event.kind.name(), detail);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_vars() {
        let vars = parse_vars(&[
            "name=world".to_string(),
            "count=3".to_string(),
            "tags=[\"a\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(vars["name"], json!("world"));
        assert_eq!(vars["count"], json!(3));
        assert_eq!(vars["tags"], json!(["a"]));
        assert!(parse_vars(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["flowrun", "run", "f.json", "--var", "a=1", "--auto-approve"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { auto_approve: true, .. }));
        Cli::command().debug_assert();
    }
}
