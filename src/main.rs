//! replybot - keyword-driven Reddit reply bot
//!
//! Polls users or subreddits for new comments, generates replies through an
//! LLM provider and posts them from a rotating pool of accounts.

use anyhow::Context;
use background_service::{BackgroundService, ServiceDeps, TargetReport};
use clap::Parser;
use database::Database;
use llm_interface::GenerationAdapter;
use reddit_client::RedditApiClient;
use replybot_core::{BotConfig, ConfigError, ErrorReporter, MonitorMode, SystemClock};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_FILE: &str = "replybot.toml";

#[derive(Parser, Debug)]
#[command(name = "replybot")]
#[command(version)]
#[command(about = "Reply to Reddit comments matching keywords with LLM-generated text")]
#[command(long_about = "\
replybot - keyword-driven Reddit reply bot

USAGE:
    # Reply to new comments of a user that mention python
    replybot --mode user --target spez --keywords python

    # Watch two subreddits continuously
    replybot --mode subreddit --target rust --target golang --loop --interval 60

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current reply)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "REPLYBOT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Monitor a user's comments or a subreddit's comments
    #[arg(long, value_name = "user|subreddit")]
    mode: Option<MonitorMode>,

    /// User or subreddit to monitor (repeatable)
    #[arg(short, long = "target", value_name = "NAME")]
    targets: Vec<String>,

    /// Comma-separated keywords; empty matches every comment
    #[arg(short, long, value_delimiter = ',')]
    keywords: Vec<String>,

    /// LLM provider: openai, anthropic or ollama
    #[arg(long, value_name = "PROVIDER")]
    llm: Option<String>,

    /// Seconds between polls in loop mode
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,

    /// Seconds between replies
    #[arg(long, value_name = "SECONDS")]
    delay: Option<u64>,

    /// Maximum replies per run
    #[arg(long, value_name = "COUNT")]
    max: Option<u32>,

    /// Keep polling until stopped
    #[arg(long = "loop")]
    loop_enabled: bool,

    /// System prompt file
    #[arg(long, value_name = "FILE")]
    prompt: Option<PathBuf>,

    /// SQLite state database
    #[arg(long, value_name = "PATH")]
    database: Option<String>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    let deps = match build_deps(&config).await {
        Ok(deps) => deps,
        Err(Startup::Config(e)) => {
            error!("Configuration error: {:#}", e);
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
        Err(Startup::Runtime(e)) => {
            error!("Startup failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    match run(&config, deps).await {
        Ok(reports) => {
            print_summary(&reports);
            if reports.iter().any(|r| r.halted.is_some()) {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("Runtime error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose {
        "replybot=debug,background_service=debug,reddit_client=debug,llm_interface=debug,database=debug,replybot_core=debug"
    } else {
        "replybot=info,background_service=info,reddit_client=info,llm_interface=info,database=info,replybot_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// File, then environment, then command line.
fn load_config(cli: &Cli) -> Result<BotConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => BotConfig::load_from_path(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            BotConfig::load_from_path(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => BotConfig::default(),
    };
    config.apply_env_overrides()?;
    apply_cli_overrides(&mut config, cli);
    config.validate()?;
    Ok(config)
}

fn apply_cli_overrides(config: &mut BotConfig, cli: &Cli) {
    if let Some(mode) = cli.mode {
        config.monitor.mode = mode;
    }
    if !cli.targets.is_empty() {
        config.monitor.targets = cli.targets.clone();
    }
    if !cli.keywords.is_empty() {
        config.monitor.keywords = cli.keywords.clone();
    }
    if let Some(provider) = &cli.llm {
        config.llm.provider = provider.to_lowercase();
    }
    if let Some(interval) = cli.interval {
        config.behavior.poll_interval_secs = interval;
    }
    if let Some(delay) = cli.delay {
        config.behavior.reply_delay_secs = delay;
    }
    if let Some(max) = cli.max {
        config.behavior.max_replies_per_run = max;
    }
    if cli.loop_enabled {
        config.behavior.loop_enabled = true;
    }
    if let Some(prompt) = &cli.prompt {
        config.llm.prompt_file = prompt.display().to_string();
    }
    if let Some(database) = &cli.database {
        config.storage.database_path = database.clone();
    }
}

enum Startup {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

async fn build_deps(config: &BotConfig) -> Result<ServiceDeps, Startup> {
    let generator = llm_interface::from_config(&config.llm)
        .context("Failed to set up LLM provider")
        .map_err(Startup::Config)?;
    let prompt = llm_interface::load_system_prompt(Path::new(&config.llm.prompt_file));
    let generator = GenerationAdapter::new(generator, prompt)
        .with_timeout(Duration::from_secs(config.timeouts.generate_secs));
    info!("Using {} for reply generation", generator.generator_name());

    let platform = RedditApiClient::new(
        config.accounts.pool.clone(),
        Duration::from_secs(config.timeouts.post_secs),
    )
    .context("Failed to set up Reddit client")
    .map_err(Startup::Config)?;

    let mut db = Database::new(config.storage.database_path.clone());
    db.connect()
        .await
        .context("Failed to open state database")
        .map_err(Startup::Runtime)?;
    db.run_migrations()
        .await
        .context("Failed to migrate state database")
        .map_err(Startup::Runtime)?;

    Ok(ServiceDeps {
        platform: Arc::new(platform),
        generator,
        store: Arc::new(db),
        clock: Arc::new(SystemClock),
    })
}

async fn run(config: &BotConfig, deps: ServiceDeps) -> anyhow::Result<Vec<TargetReport>> {
    info!(
        "replybot starting: mode={} targets={:?} accounts={} loop={}",
        config.monitor.mode,
        config.monitor.targets,
        config.accounts.pool.len(),
        config.behavior.loop_enabled
    );

    let service = BackgroundService::from_config(config, deps)
        .await
        .context("Failed to restore checkpoint")?;

    let cancel = service.cancellation_token();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    let reports = service.run().await;
    signal_task.abort();

    let reporter = ErrorReporter::new();
    for report in &reports {
        if let Some(e) = &report.halted {
            warn!("{} halted", report.target);
            reporter.report_error(e);
        }
    }
    info!("replybot stopped");
    Ok(reports)
}

fn print_summary(reports: &[TargetReport]) {
    for report in reports {
        println!(
            "{}: runs={} {} last_processed={}",
            report.target, report.runs, report.summary, report.last_processed
        );
        if let Some(e) = &report.halted {
            println!("{}: halted: {}", report.target, e);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, finishing the current reply"),
        () = terminate => info!("Received SIGTERM, finishing the current reply"),
    }
}
