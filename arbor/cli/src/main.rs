//! Arbor - Branching Conversations from the Terminal
//!
//! A thin surface over `arbor-core`: every command loads the stored
//! sessions, runs one coordinator operation and exits.
//!
//! # Usage
//!
//! ```bash
//! # Ask something in the most recent session
//! arbor send "What is a B-tree?"
//!
//! # Fork from an earlier node and ask again with another model
//! arbor branch node_1a2b...
//! arbor send --model claude "Explain it differently"
//!
//! # Inspect
//! arbor tree
//! arbor sessions
//!
//! # Verbose logging
//! RUST_LOG=arbor_core=debug arbor send "hi"
//! ```
//!
//! Ctrl-C while a reply is streaming stops the generation and keeps what
//! arrived so far.

mod render;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use arbor_core::config::{default_config_path, load_config_from_path};
use arbor_core::{
    ArborConfig, ChunkKind, ConfigOverrides, CoordinatorEvent, CoordinatorSettings,
    GenerationBackend, GenerationPhase, HttpBackend, JsonFileRepository, MessageRole, NodeId,
    NodeKind, NotifyLevel, QuotedContext, SessionCoordinator, SessionId,
};

type Coordinator = SessionCoordinator<JsonFileRepository, HttpBackend>;

/// Arbor - branching conversations with language models
#[derive(Parser, Debug)]
#[command(name = "arbor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ARBOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Session directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Default model id
    #[arg(long, value_name = "ID")]
    default_model: Option<String>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "ARBOR_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sessions, most recent first
    Sessions,

    /// Create a session and make it current
    New {
        /// Title
        title: Option<String>,
    },

    /// Rename a session
    Rename {
        /// Session id
        session: String,
        /// New title
        title: String,
    },

    /// Delete a session
    Delete {
        /// Session id
        session: String,
    },

    /// Print a session's tree
    Tree {
        /// Session id (defaults to the most recent)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Send a message and stream the reply
    Send {
        /// Message text
        text: String,
        /// Session id (defaults to the most recent)
        #[arg(short, long)]
        session: Option<String>,
        /// Pending-input node to send from (defaults to the newest one)
        #[arg(short, long)]
        node: Option<String>,
        /// Model id (defaults to the session's, then the configured default)
        #[arg(short, long)]
        model: Option<String>,
        /// Node whose reply to quote
        #[arg(long, requires = "quote")]
        quote_from: Option<String>,
        /// Excerpt to quote
        #[arg(long, requires = "quote_from")]
        quote: Option<String>,
    },

    /// Add an empty input beneath a node
    Branch {
        /// Node id
        node: String,
        /// Session id (defaults to the most recent)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Delete a node and everything below it
    Prune {
        /// Node id
        node: String,
        /// Session id (defaults to the most recent)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Recompute node positions
    Rearrange {
        /// Session id (defaults to the most recent)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Set a session's default model
    UseModel {
        /// Model id, or nothing to clear
        model: Option<String>,
        /// Session id (defaults to the most recent)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// List configured models
    Models {
        /// Check each endpoint is reachable
        #[arg(long)]
        check: bool,
    },
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("arbor={level},arbor_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load(args: &Args) -> Result<ArborConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(dir) = &args.data_dir {
        overrides = overrides.with_data_dir(dir.clone());
    }
    if let Some(model) = &args.default_model {
        overrides = overrides.with_default_model(model.clone());
    }
    if let Some(secs) = args.timeout {
        overrides = overrides.with_request_timeout_secs(secs);
    }
    overrides.apply(&mut config)?;

    info!(source = %config.source(), data_dir = ?config.data_dir, "Configuration loaded");
    Ok(config)
}

/// Print events a terminal cares about until the coordinator is dropped
async fn print_events(mut rx: mpsc::UnboundedReceiver<CoordinatorEvent>) {
    let mut in_reasoning = false;
    while let Some(event) = rx.recv().await {
        match event {
            CoordinatorEvent::Chunk { kind, text, .. } => match kind {
                ChunkKind::Reasoning => {
                    in_reasoning = true;
                    eprint!("{text}");
                }
                ChunkKind::Content => {
                    if in_reasoning {
                        in_reasoning = false;
                        eprintln!();
                    }
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
            },
            CoordinatorEvent::GenerationFinished { phase, .. } => {
                println!();
                if phase == GenerationPhase::Cancelled {
                    eprintln!("(stopped)");
                }
            }
            CoordinatorEvent::GenerationFailed { error, .. } => {
                eprintln!("\ngeneration failed: {error}");
            }
            CoordinatorEvent::Notify { level, message } => match level {
                NotifyLevel::Info => eprintln!("{message}"),
                NotifyLevel::Warning => eprintln!("warning: {message}"),
                NotifyLevel::Error => eprintln!("error: {message}"),
            },
            other => debug!(event = ?other, "Event"),
        }
    }
}

async fn focus(coordinator: &mut Coordinator, session: Option<&str>) -> Result<SessionId> {
    if let Some(id) = session {
        let id = SessionId::from(id);
        coordinator.switch_session(&id).await?;
    }
    coordinator
        .active_session_id()
        .cloned()
        .context("no active session")
}

fn quote_from(coordinator: &Coordinator, node: &str, text: String) -> Result<QuotedContext> {
    let node_id = NodeId::from(node);
    let node = coordinator
        .active_session()
        .and_then(|s| s.node(&node_id))
        .with_context(|| format!("node {node_id} not found"))?;
    let (role, source_text) = match &node.kind {
        NodeKind::Composite {
            assistant_message: Some(reply),
            ..
        } => (MessageRole::Assistant, reply.clone()),
        NodeKind::Assistant { content } => (MessageRole::Assistant, content.clone()),
        _ => (MessageRole::User, node.display_text()),
    };
    Ok(QuotedContext {
        text,
        source_node: node_id,
        source_role: role,
        source_text,
    })
}

async fn send(
    coordinator: &mut Coordinator,
    text: &str,
    node: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let target = match node {
        Some(id) => NodeId::from(id.as_str()),
        None => coordinator
            .selected_node()
            .cloned()
            .context("no node selected")?,
    };

    // Listen before sending so an early Ctrl-C stops the generation
    // instead of killing the process
    let (interrupt_tx, mut interrupted) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupt_tx.send(());
        }
    });

    coordinator
        .send_message(&target, text, model.as_deref())
        .await?;

    // Ctrl-C only races the receive; applying an event (and the persist
    // that ends a generation) always runs to completion
    let outcome = loop {
        let event = tokio::select! {
            biased;
            Ok(()) = &mut interrupted => None,
            event = coordinator.next_generation_event(&target) => Some(event?),
        };
        let Some(event) = event else {
            break coordinator.cancel_generation(&target).await?;
        };
        if let Some(outcome) = coordinator.apply_generation_event(event).await {
            break outcome;
        }
    };

    if let Some(child) = outcome.child_id {
        eprintln!("next input: {child}");
    }
    Ok(())
}

async fn run(args: Args, config: &ArborConfig, coordinator: &mut Coordinator) -> Result<()> {
    match args.command {
        Command::Sessions => {
            let active = coordinator.active_session_id();
            print!(
                "{}",
                render::session_list(&coordinator.sessions(), active)
            );
        }
        Command::New { title } => {
            let id = coordinator
                .create_session(title.unwrap_or_default())
                .await?;
            println!("{id}");
        }
        Command::Rename { session, title } => {
            coordinator
                .rename_session(&SessionId::from(session.as_str()), title)
                .await?;
        }
        Command::Delete { session } => {
            coordinator
                .delete_session(&SessionId::from(session.as_str()))
                .await?;
        }
        Command::Tree { session } => {
            let id = focus(coordinator, session.as_deref()).await?;
            if let Some(session) = coordinator.session(&id) {
                println!("{}  ({})", session.title, session.id);
                print!("{}", render::tree(session, coordinator.selected_node()));
            }
        }
        Command::Send {
            text,
            session,
            node,
            model,
            quote_from: source,
            quote,
        } => {
            focus(coordinator, session.as_deref()).await?;
            if let (Some(source), Some(quote)) = (source, quote) {
                let context = quote_from(coordinator, &source, quote)?;
                coordinator.set_quote(context)?;
            }
            send(coordinator, &text, node, model).await?;
        }
        Command::Branch { node, session } => {
            focus(coordinator, session.as_deref()).await?;
            let child = coordinator.branch_from(&NodeId::from(node.as_str())).await?;
            println!("{child}");
        }
        Command::Prune { node, session } => {
            focus(coordinator, session.as_deref()).await?;
            let removed = coordinator.delete_node(&NodeId::from(node.as_str())).await?;
            eprintln!("removed {} node(s)", removed.len());
        }
        Command::Rearrange { session } => {
            focus(coordinator, session.as_deref()).await?;
            coordinator.rearrange().await?;
        }
        Command::UseModel { model, session } => {
            let id = focus(coordinator, session.as_deref()).await?;
            coordinator.set_session_model(&id, model).await?;
        }
        Command::Models { check } => {
            let models = coordinator.models().list();
            if models.is_empty() {
                let path = config
                    .config_file_path
                    .clone()
                    .or_else(default_config_path)
                    .map_or_else(|| "the config file".to_string(), |p| p.display().to_string());
                eprintln!("no models configured; add [[models]] entries to {path}");
            }
            print!("{}", render::model_list(&models));
            if check {
                for model in &models {
                    let healthy = coordinator.backend().health_check(model).await;
                    println!("{}: {}", model.id, if healthy { "ok" } else { "unreachable" });
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load(&args)?;
    let repository = JsonFileRepository::open(&config.data_dir).await?;
    let backend = HttpBackend::new(config.request_timeout)?;
    let models = Arc::new(config.model_registry()?);

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));

    let mut coordinator = SessionCoordinator::new(
        repository,
        backend,
        models,
        CoordinatorSettings::from(&config),
        tx,
    );
    coordinator.start().await?;

    let result = run(args, &config, &mut coordinator).await;

    drop(coordinator);
    let _ = printer.await;
    result
}
