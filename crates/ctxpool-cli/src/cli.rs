//! ctxpool command-line tool
//!
//! Inspect the effective pooling configuration and run simulated workloads
//! against in-memory resources.
//!
//! ## Usage
//!
//! ```bash
//! ctxpool config
//! ctxpool simulate --units 200 --step-secs 5 --service db.default --service cache.default
//! SERVICE_POOL_CONNECTION_LIFETIME=10 ctxpool simulate --format json
//! ```

mod logging;
mod output;
mod simulate;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use ctxpool_core::{PoolingConfig, ServiceId};

use crate::logging::LoggingConfig;
use crate::simulate::SimulationOptions;

#[derive(Parser)]
#[command(name = "ctxpool")]
#[command(about = "Unit-of-work scoped connection pooling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML file with pooling settings (defaults to SERVICE_POOL_* variables)
    #[arg(long, global = true, env = "CTXPOOL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging, including pool internals
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write JSON logs to this directory
    #[arg(long, global = true, env = "CTXPOOL_LOG_DIR", value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

/// Flags that take precedence over file and environment settings
#[derive(clap::Args, Debug, Default)]
struct ConfigOverrides {
    /// Connections per service pool
    #[arg(long, global = true)]
    pool_size: Option<usize>,

    /// Candidates tried per acquisition before giving up
    #[arg(long, global = true)]
    acquire_attempts: Option<u32>,

    /// Connection lifetime in seconds
    #[arg(long, global = true)]
    lifetime_secs: Option<u64>,

    /// Minimum seconds between cleanup sweeps
    #[arg(long, global = true)]
    cleanup_interval_secs: Option<u64>,

    /// Probe database connections with a live ping
    #[arg(long, global = true)]
    check_db: bool,

    /// Probe redis connections with a live ping
    #[arg(long, global = true)]
    check_redis: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective pooling configuration
    Config,

    /// Run units of work against in-memory resources and report pool stats
    Simulate {
        /// Service to acquire in every unit (repeatable)
        #[arg(long = "service", value_name = "SERVICE", default_values_t = vec!["db.default".to_string(), "cache.default".to_string()])]
        services: Vec<String>,

        /// Number of units of work
        #[arg(long, default_value_t = 100)]
        units: usize,

        /// Simulated seconds between units
        #[arg(long, default_value_t = 1)]
        step_secs: u64,

        /// Every nth created resource starts unhealthy (0 disables)
        #[arg(long, default_value_t = 0)]
        unhealthy_every: usize,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::default();
    if cli.verbose {
        logging = logging.verbose();
    }
    if let Some(dir) = cli.log_dir.clone() {
        logging = logging.with_log_dir(dir).with_json_file();
    }
    logging::init(logging)?;

    let config = load_config(cli.config.as_deref(), &cli.overrides)?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate {
            services,
            units,
            step_secs,
            unhealthy_every,
            format,
        } => {
            let options = SimulationOptions {
                services: services.into_iter().map(ServiceId::from).collect(),
                units,
                step: Duration::from_secs(step_secs),
                unhealthy_every,
            };
            let summary = simulate::run(config, options).await?;

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Table => output::print_summary(&summary),
            }

            if let Some(fatal) = &summary.fatal {
                anyhow::bail!("simulation stopped: {fatal}");
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>, overrides: &ConfigOverrides) -> anyhow::Result<PoolingConfig> {
    let mut config = match path {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            PoolingConfig::from_toml_str(&source)?
        }
        None => PoolingConfig::from_env()?,
    };

    if let Some(size) = overrides.pool_size {
        config = config.with_pool_size(size);
    }
    if let Some(attempts) = overrides.acquire_attempts {
        config = config.with_acquire_attempts(attempts);
    }
    if let Some(secs) = overrides.lifetime_secs {
        config = config.with_connection_lifetime_secs(secs);
    }
    if let Some(secs) = overrides.cleanup_interval_secs {
        config = config.with_cleanup_interval_secs(secs);
    }
    if overrides.check_db {
        config = config.with_check_db_connection(true);
    }
    if overrides.check_redis {
        config = config.with_check_redis_connection(true);
    }

    config.validate()?;
    tracing::debug!(?config, "loaded pooling configuration");
    Ok(config)
}
