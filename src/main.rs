//! `telemetry-agent` binary: CLI, startup order and exit codes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use telemetry_agent::config::AgentConfig;
use telemetry_agent::error::AgentResult;
use telemetry_agent::logging::init_logging;
use telemetry_agent::{
    Category, ProcfsSource, Publisher, RetryPolicy, Sampler, Scheduler, TcpBroker, AGENT_NAME,
    AGENT_VERSION,
};

// ============================================================================
// CLI
// ============================================================================

/// Host telemetry agent
#[derive(Parser, Debug)]
#[command(
    name = "telemetry-agent",
    author = "AIOps Team",
    version,
    about = "Samples host CPU, memory, disk and network counters and publishes them to a broker"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "telemetry.toml", env = "TELEMETRY_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "TELEMETRY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "TELEMETRY_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sample and publish until interrupted (default)
    Run(RunArgs),

    /// Take one sample and print it as JSON
    Sample {
        /// Only this category (cpu, memory, disk, network)
        #[arg(long)]
        category: Option<Category>,
    },

    /// Validate the configuration file
    Validate {
        /// Print the parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Write the default configuration
    GenerateConfig {
        /// Output path, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Seconds between cycles
    #[arg(long)]
    pub interval: Option<f64>,

    /// Broker address (host:port)
    #[arg(long)]
    pub broker: Option<String>,

    /// Retries after a timed-out send
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// First backoff delay in seconds
    #[arg(long)]
    pub base_delay: Option<f64>,
}

impl RunArgs {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(interval) = self.interval {
            config.agent.interval_secs = interval;
        }
        if let Some(broker) = &self.broker {
            config.broker.address = broker.clone();
        }
        if let Some(max_retries) = self.max_retries {
            config.publish.max_retries = max_retries;
        }
        if let Some(base_delay) = self.base_delay {
            config.publish.base_delay_secs = base_delay;
        }
    }
}

// ============================================================================
// Subcommand handlers
// ============================================================================

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = AgentConfig::load(config_path)
        .with_context(|| format!("Configuration at {} is invalid", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!("  interval:     {}s", config.agent.interval_secs);
    println!("  broker:       {}", config.broker.address);
    println!("  max retries:  {}", config.publish.max_retries);
    println!("  base delay:   {}s", config.publish.base_delay_secs);
    for category in Category::ALL {
        println!("  {:<13} {}", format!("{}:", category), config.channels.channel_for(category));
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = AgentConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", AGENT_NAME, AGENT_VERSION);
    println!("  target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

fn build_sampler(config: &AgentConfig) -> Sampler {
    Sampler::new(Arc::new(ProcfsSource::new(&config.source)))
        .with_hostname(config.agent.hostname.clone())
        .with_cpu_window(config.agent.cpu_window())
}

fn handle_sample(config: &AgentConfig, category: Option<Category>) -> AnyhowResult<()> {
    let sampler = build_sampler(config);

    let categories = match category {
        Some(category) => vec![category],
        None => Category::ALL.to_vec(),
    };
    for category in categories {
        let snapshot = sampler
            .sample(category)
            .with_context(|| format!("Failed to sample {}", category))?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

async fn run_agent(config: AgentConfig) -> AnyhowResult<()> {
    info!(
        target: "telemetry::init",
        version = AGENT_VERSION,
        broker = %config.broker.address,
        interval_secs = config.agent.interval_secs,
        "Starting telemetry agent"
    );

    let broker = match TcpBroker::connect(&config.broker).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(
                target: "telemetry::init",
                category = e.category(),
                error = %e,
                "Broker unreachable at startup"
            );
            return Err(e.into());
        }
    };

    let policy = RetryPolicy::from_config(&config.publish);
    info!(
        target: "telemetry::init",
        max_retries = policy.max_retries,
        worst_case_wait_ms = policy.worst_case_wait().as_millis() as u64,
        "Retry policy"
    );

    let publisher = Publisher::new(Arc::new(broker), policy);
    let mut scheduler = Scheduler::new(
        build_sampler(&config),
        publisher,
        &config.channels,
        config.agent.interval(),
    )
    .with_sample_timeout(config.agent.sample_timeout());

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    scheduler.run(shutdown).await;
    info!(target: "telemetry::init", "Telemetry agent stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(
                target: "telemetry::init",
                error = %e,
                "SIGTERM handler unavailable, only SIGINT stops the agent"
            );
            if signal::ctrl_c().await.is_ok() {
                info!(target: "telemetry::init", "Received SIGINT, stopping");
                shutdown.cancel();
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!(target: "telemetry::init", "Received SIGTERM, stopping"),
        _ = signal::ctrl_c() => info!(target: "telemetry::init", "Received SIGINT, stopping"),
    }
    shutdown.cancel();
}

fn load_config(path: &Path) -> AgentResult<AgentConfig> {
    if path.exists() {
        return Ok(AgentConfig::load(path)?);
    }
    eprintln!("Config file not found at {}, using defaults", path.display());
    Ok(AgentConfig::from_env()?)
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output.as_deref())
        }
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let mut config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(Commands::Sample { category }) = &cli.command {
        return handle_sample(&config, *category);
    }

    if let Some(Commands::Run(args)) = &cli.command {
        args.apply(&mut config);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }
    config.validate().context("Invalid configuration")?;

    let _log_guard = init_logging(&config.logging)?;

    run_agent(config).await
}
