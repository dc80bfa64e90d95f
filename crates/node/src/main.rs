//! Ratewatch daemon CLI.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ratewatchd::{ConfigOverrides, Node, NodeConfig};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Ratewatch daemon
#[derive(Parser)]
#[command(name = "ratewatchd")]
#[command(version)]
#[command(about = "Scrapes apiserver request counters and serves per-pod request rates", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// The logging level (trace|debug|info|warn|error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// The logging format (json|plain)
    #[arg(long, global = true, default_value = "plain")]
    log_format: String,

    /// Disable colored logs
    #[arg(long, global = true, default_value = "false")]
    log_no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Path of the configuration file to create
        #[arg(long, default_value = "ratewatchd.json")]
        path: PathBuf,

        /// Overwrite an existing configuration
        #[arg(long, default_value = "false")]
        overwrite: bool,
    },

    /// Run the daemon
    Start {
        /// Path to a configuration file; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// How often the same pod is scraped, in seconds (default: 60)
        #[arg(long)]
        scrape_period_secs: Option<u64>,

        /// How often the level of scraping parallelism is adjusted, in
        /// milliseconds (default: 200)
        #[arg(long)]
        flow_control_period_ms: Option<u64>,

        /// If the last two samples are closer in time than this, don't use
        /// them to calculate a rate, in seconds (default: 10)
        #[arg(long)]
        min_sample_gap_secs: Option<u64>,

        /// Samples older than this are not served, in seconds (default: 90)
        #[arg(long)]
        max_sample_age_secs: Option<u64>,

        /// Sample pairs further apart than this are not served, in seconds
        /// (default: 600)
        #[arg(long)]
        max_sample_gap_secs: Option<u64>,

        /// Namespace holding the steering endpoint record
        #[arg(long)]
        namespace: Option<String>,

        /// IP address advertised to metric consumers via endpoint steering
        #[arg(long)]
        serving_ip: Option<String>,

        /// Port advertised to metric consumers via endpoint steering
        #[arg(long)]
        serving_port: Option<u16>,

        /// Listen address of the rate query endpoint
        #[arg(long)]
        serving_listen: Option<SocketAddr>,

        /// Listen address of the Prometheus /metrics endpoint
        #[arg(long)]
        metrics_listen: Option<SocketAddr>,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, &cli.log_format, cli.log_no_color);

    let result = match cli.command {
        Commands::Init { path, overwrite } => cmd_init(&path, overwrite),

        Commands::Start {
            config,
            scrape_period_secs,
            flow_control_period_ms,
            min_sample_gap_secs,
            max_sample_age_secs,
            max_sample_gap_secs,
            namespace,
            serving_ip,
            serving_port,
            serving_listen,
            metrics_listen,
        } => {
            let overrides = ConfigOverrides {
                scrape_period_secs,
                flow_control_period_ms,
                min_sample_gap_secs,
                max_sample_age_secs,
                max_sample_gap_secs,
                namespace,
                serving_ip,
                serving_port,
                serving_listen,
                metrics_listen,
            };
            cmd_start(config, overrides).await
        }

        Commands::Version => cmd_version(),
    };

    if let Err(e) = &result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_level: &str, log_format: &str, no_color: bool) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(!no_color);

    match log_format {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

fn cmd_init(path: &std::path::Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "Configuration already exists at {}. Use --overwrite to replace.",
            path.display()
        );
    }

    let config = NodeConfig::default();
    config.save(path)?;

    println!("Wrote default configuration to {}", path.display());
    println!();
    println!("To start the daemon:");
    println!("  ratewatchd start --config {}", path.display());

    Ok(())
}

async fn cmd_start(config_path: Option<PathBuf>, overrides: ConfigOverrides) -> Result<()> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            NodeConfig::load(&path)?
        }
        None => NodeConfig::default(),
    };
    overrides.apply(&mut config);

    let node = Node::new(config);
    node.run().await
}

fn cmd_version() -> Result<()> {
    println!("ratewatchd: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "git commit: {}",
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    );
    Ok(())
}
