use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chorus_core::{ChatRequest, ChatService, EmitSink, EventBus, HistoryStore, Orchestrator};
use chorus_providers::{build_providers, HttpTransport, Transport};

mod config;
mod history;
mod output;

use config::{Config, ProviderStatus};
use history::JsonlHistory;
use output::{spawn_printer, OutputMode};

/// Longest the CLI waits for the history write after printing the answer.
const HISTORY_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: every parsed frame
    Trace,
    /// Verbose: request lifecycle per provider
    Debug,
    /// Standard: query completion and timings
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "chorus")]
#[command(author, version, about = "Chorus: ask several AI providers at once", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ~/.config/chorus/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn", global = true)]
    pub log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Write logs to file (JSON-lines format)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a prompt to every configured provider and print one answer
    Ask {
        /// The question to ask
        prompt: String,

        /// Only query these providers (repeatable)
        #[arg(short, long = "provider")]
        providers: Vec<String>,

        /// System context sent alongside the prompt
        #[arg(short, long)]
        system: Option<String>,

        /// Display name attached to every event
        #[arg(short, long, default_value = "")]
        nickname: String,

        /// User id the answer is recorded under
        #[arg(short, long, default_value = "local", env = "CHORUS_USER")]
        user: String,

        /// Per-query timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print events as JSON lines on stdout instead of live text
        #[arg(long, conflicts_with = "quiet")]
        json: bool,

        /// Do not show live provider output
        #[arg(short, long)]
        quiet: bool,

        /// Do not record the answer in history
        #[arg(long)]
        no_history: bool,
    },
    /// List configured providers and whether they are usable
    Providers,
    /// Show recent questions and answers
    History {
        #[arg(short, long, default_value = "local", env = "CHORUS_USER")]
        user: String,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show the effective configuration (API keys removed)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Resolve log level: --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_filter()));

    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask {
            prompt,
            providers,
            system,
            nickname,
            user,
            timeout_ms,
            json,
            quiet,
            no_history,
        } => {
            let mode = if quiet {
                OutputMode::Quiet
            } else if json {
                OutputMode::Json
            } else {
                OutputMode::Text
            };
            let mut request = ChatRequest::new(user, prompt)
                .with_nickname(nickname)
                .with_providers(providers);
            if let Some(system) = system {
                request = request.with_system_context(system);
            }
            let timeout = timeout_ms.map(Duration::from_millis);
            ask(&config, request, timeout, mode, !no_history).await
        }
        Commands::Providers => list_providers(&config),
        Commands::History { user, limit } => show_history(&config, &user, limit).await,
        Commands::Config => show_config(&config, cli.config.as_deref()),
    }
}

fn build_service(config: &Config, timeout: Option<Duration>) -> Result<ChatService> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new());
    let providers = build_providers(config.enabled_providers(), transport);

    let mut orchestrator = Orchestrator::new(providers)
        .context("No usable providers. Add [[providers]] entries with an API key.")?
        .with_timeout(timeout.unwrap_or_else(|| config.timeout()));
    if let Some(master) = &config.preferred_master {
        if orchestrator.provider(master).is_none() {
            tracing::warn!(provider = %master, "Preferred master is not an enabled provider");
        }
        orchestrator = orchestrator.with_preferred_master(master);
    }

    Ok(ChatService::new(Arc::new(orchestrator)).with_fallback_message(config.fallback_message()))
}

async fn ask(
    config: &Config,
    request: ChatRequest,
    timeout: Option<Duration>,
    mode: OutputMode,
    record: bool,
) -> Result<()> {
    let mut service = build_service(config, timeout)?;
    if record {
        let history = JsonlHistory::new(config.history_path()?, config.history_limit);
        service = service.with_history(Arc::new(history));
    }

    let bus = Arc::new(EventBus::new(1024));
    let printer = spawn_printer(bus.subscribe(), None, mode);

    // Ctrl-C cancels every in-flight branch instead of killing the process.
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted; cancelling providers");
                cancel.cancel();
            }
        })
    };

    let sink: Arc<dyn EmitSink> = bus.clone();
    let mut response = service
        .handle_prompt_with_cancel(request, sink, cancel)
        .await;
    ctrl_c.abort();
    let _ = printer.await;

    if mode != OutputMode::Json {
        println!("{}", response.text);
    }

    if let Some(write) = response.history_write.take() {
        flush_history(write, HISTORY_FLUSH_TIMEOUT).await;
    }

    if response.answer.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

/// Wait for the background history write, giving up after `timeout`.
async fn flush_history(write: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "History write task failed"),
        Err(_) => tracing::warn!(
            timeout_ms = timeout.as_millis() as u64,
            "History write did not finish; answer may not be recorded"
        ),
    }
}

fn list_providers(config: &Config) -> Result<()> {
    if config.providers.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }

    println!("Configured providers (fan-out order):\n");
    for entry in &config.providers {
        let is_master = config.preferred_master.as_deref() == Some(entry.id.as_str());
        let marker = if is_master { " (preferred master)" } else { "" };
        println!("  {}{}", entry.id, marker);
        println!("    Protocol: {}", entry.protocol);
        println!("    Model: {}", entry.model);

        match entry.resolve() {
            ProviderStatus::Enabled(resolved) => {
                println!("    Endpoint: {}", resolved.endpoint_url);
                println!("    Status: enabled");
            }
            ProviderStatus::Disabled { reason } => {
                println!("    Status: disabled ({})", reason);
            }
        }
        println!();
    }
    Ok(())
}

async fn show_history(config: &Config, user: &str, limit: usize) -> Result<()> {
    let history = JsonlHistory::new(config.history_path()?, config.history_limit);
    let entries = history
        .recent(user, limit)
        .await
        .with_context(|| format!("Failed to read history from {}", history.path().display()))?;

    if entries.is_empty() {
        println!("No history for {}.", user);
        return Ok(());
    }

    for entry in entries {
        println!(
            "[{}] Q: {}",
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.question
        );
        println!("A: {}\n", entry.answer);
    }
    Ok(())
}

fn show_config(config: &Config, path: Option<&std::path::Path>) -> Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => Config::config_path()?,
    };
    println!("Configuration ({}):\n", path.display());
    print!("{}", config.to_redacted_toml()?);
    Ok(())
}
