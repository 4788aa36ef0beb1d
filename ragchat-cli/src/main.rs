//! CLI entry point for ragchat

mod chat;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::Confirm;
use ragchat_client::{Backend, ChatEngine, IngestionMonitor, SessionManager, Transport};
use ragchat_core::config::{Config, ConfigLoader};
use ragchat_core::logging::init_logging;
use ragchat_core::session::{ChatMessage, FileSessionStore, SessionStore};
use ragchat_core::utils::short_id;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ragchat")]
#[command(about = "Chat with a retrieval-augmented news assistant")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Backend API base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Event connection URL
    #[arg(long, global = true)]
    socket_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat
    Chat,
    /// Ask one question and print the streamed answer
    Ask {
        /// Question to send
        #[arg(short, long)]
        message: String,
    },
    /// Print the conversation history of the current session
    History {
        /// Maximum number of messages
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Clear the conversation history of the current session
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Abandon the current session and start a new one
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Show backend, session and news ingestion status
    Status,
    /// Trigger a news ingestion run
    Update,
}

/// Everything a command needs, built once from configuration
struct App {
    loader: ConfigLoader,
    config: Config,
    transport: Transport,
    store: Arc<FileSessionStore>,
}

impl App {
    fn new(loader: ConfigLoader, config: Config) -> Result<Self> {
        let transport = Transport::from_config(&config)?;
        let store = Arc::new(FileSessionStore::new(loader.config_dir()));
        Ok(Self {
            loader,
            config,
            transport,
            store,
        })
    }

    fn engine(&self) -> ChatEngine {
        ChatEngine::new(
            self.transport.http.clone(),
            self.transport.events.clone(),
            self.store.clone(),
            self.config.chat.clone(),
        )
    }

    fn sessions(&self) -> SessionManager {
        SessionManager::new(self.transport.http.clone(), self.store.clone())
    }

    fn monitor(&self) -> IngestionMonitor {
        IngestionMonitor::new(self.transport.http.clone(), &self.config.ingestion)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = if let Some(dir) = cli.config_dir {
        ConfigLoader::with_dir(dir)
    } else {
        ConfigLoader::new()
    };

    let mut config = loader.load()?;
    if let Some(url) = cli.api_url {
        config.backend.api_base_url = url;
    }
    if let Some(url) = cli.socket_url {
        config.backend.socket_url = url;
    }

    let mut logging = config.logging.clone();
    logging.dir = loader.resolve(&logging.dir).display().to_string();
    let _guard = init_logging(&logging);

    let app = App::new(loader, config)?;

    match cli.command {
        Commands::Chat => {
            info!("Starting interactive chat");
            run_chat(&app).await?;
        }
        Commands::Ask { message } => {
            info!("Asking a single question");
            run_ask(&app, &message).await?;
        }
        Commands::History { limit } => run_history(&app, limit).await?,
        Commands::Clear { yes } => run_clear(&app, yes).await?,
        Commands::Reset { yes } => run_reset(&app, yes).await?,
        Commands::Status => run_status(&app).await?,
        Commands::Update => run_update(&app).await?,
    }

    Ok(())
}

async fn run_chat(app: &App) -> Result<()> {
    let engine = app.engine();
    let monitor = app.config.ingestion.enabled.then(|| app.monitor());
    if let Some(monitor) = &monitor {
        monitor.start().await;
    }

    let result = chat::run_interactive(&engine, monitor.as_ref()).await;

    engine.shutdown();
    app.transport.events.shutdown().await;
    if let Some(monitor) = &monitor {
        monitor.stop().await;
    }
    println!("{}", style("Bye.").dim());
    result
}

async fn run_ask(app: &App, message: &str) -> Result<()> {
    let engine = app.engine();
    let mut updates = engine.subscribe();

    if let Err(e) = engine.start().await {
        error!("Could not start a chat session: {}", e);
        app.transport.events.shutdown().await;
        anyhow::bail!("{}", e.user_message());
    }

    let result = chat::ask(&engine, &mut updates, message).await;
    let sources = engine.snapshot().sources;
    if !sources.is_empty() {
        println!();
        chat::print_sources(&sources);
    }

    engine.shutdown();
    app.transport.events.shutdown().await;
    result
}

async fn run_history(app: &App, limit: Option<u32>) -> Result<()> {
    let session = app.sessions().resume().await?;
    let limit = limit.unwrap_or(app.config.chat.history_limit);
    let history = app.transport.http.get_history(&session.id, limit).await?;

    println!(
        "{} {} ({} messages)",
        style("Session").bold(),
        style(short_id(&session.id)).cyan(),
        history.count
    );
    if history.messages.is_empty() {
        println!("{}", style("No messages yet.").dim());
    }
    for message in history.messages.into_iter().map(ChatMessage::settled) {
        chat::print_message(&message);
    }
    Ok(())
}

fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

async fn run_clear(app: &App, yes: bool) -> Result<()> {
    if !confirm("Clear the conversation history of this session?", yes)? {
        println!("Clear cancelled.");
        return Ok(());
    }

    let session = app.sessions().resume().await?;
    app.transport.http.clear_session(&session.id).await?;
    println!(
        "{} Cleared session {}",
        style("✓").green().bold(),
        short_id(&session.id)
    );
    Ok(())
}

async fn run_reset(app: &App, yes: bool) -> Result<()> {
    if !confirm("Start a new session? The current conversation will be left behind.", yes)? {
        println!("Reset cancelled.");
        return Ok(());
    }

    let sessions = app.sessions();
    let previous = app.store.load().ok().flatten();
    let session = sessions.reset(app.transport.events.as_ref()).await?;
    match previous {
        Some(previous) => println!(
            "{} Replaced session {} with {}",
            style("✓").green().bold(),
            short_id(&previous),
            style(short_id(&session.id)).cyan()
        ),
        None => println!(
            "{} Started session {}",
            style("✓").green().bold(),
            style(short_id(&session.id)).cyan()
        ),
    }
    Ok(())
}

async fn run_status(app: &App) -> Result<()> {
    println!("{}", style("ragchat status").bold().cyan());
    println!("Version: {}\n", env!("CARGO_PKG_VERSION"));

    println!("{}", style("Configuration:").bold());
    println!("  Config directory: {}", app.loader.config_dir().display());
    println!("  API: {}", app.config.backend.api_base_url);
    println!("  Events: {}", app.config.backend.socket_url);
    println!();

    println!("{}", style("Backend:").bold());
    match app.transport.http.health().await {
        Ok(health) => {
            let detail = health
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("ok")
                .to_string();
            println!("  {} ({})", style("reachable").green(), detail);
        }
        Err(e) => println!("  {} {}", style("unreachable:").red(), e.user_message()),
    }
    println!();

    println!("{}", style("Session:").bold());
    match app.store.load() {
        Ok(Some(id)) => {
            let validity = match app.transport.http.validate_session(&id).await {
                Ok(true) => style("valid").green(),
                Ok(false) => style("expired").yellow(),
                Err(_) => style("unknown").dim(),
            };
            println!("  {} {}", short_id(&id), validity);
        }
        Ok(None) => println!("  {}", style("none").dim()),
        Err(e) => println!("  {} {}", style("unreadable:").red(), e),
    }
    println!();

    println!("{}", style("News ingestion:").bold());
    match app.monitor().refresh().await {
        Ok(status) => {
            println!("  {} articles, {}", status.document_count, status.summary(Utc::now()));
            println!("  Last update: {}", status.last_update_display());
            if status.cron_enabled {
                println!(
                    "  Schedule: every {} (next {})",
                    status.cron_interval_formatted, status.next_update_formatted
                );
            } else {
                println!("  Schedule: {}", style("disabled").dim());
            }
            println!(
                "  Runs: {} total, {} ok, {} failed",
                status.stats.total_runs, status.stats.successful_runs, status.stats.failed_runs
            );
        }
        Err(e) => println!("  {} {}", style("unavailable:").red(), e.user_message()),
    }

    Ok(())
}

async fn run_update(app: &App) -> Result<()> {
    println!("{}", style("Triggering news ingestion...").cyan());
    let status = app.monitor().trigger_update().await?;
    println!(
        "{} Ingestion {} ({} articles)",
        style("✓").green().bold(),
        if status.stats.is_running { "running" } else { "finished" },
        status.document_count
    );
    Ok(())
}
