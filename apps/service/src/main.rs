use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use netwatch::config::Config;
use netwatch::database::Store;
use netwatch::monitoring::validation::validate_item;
use netwatch::monitoring::{HealthLevel, LogMode, MonitoredItem};
use netwatch::orchestrator::{self, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "netwatch", version)]
#[command(about = "Polls network nodes and tracks the health of each check")]
struct Args {
    /// Path to config.toml (defaults to $XDG_CONFIG_HOME/netwatch/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the polling engine until Ctrl-C
    Run {
        /// Keep everything in memory instead of the configured database
        #[arg(long)]
        ephemeral: bool,
    },
    /// Add a monitored item
    Add(AddArgs),
    /// List monitored items and their current state
    List,
    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Debug)]
struct AddArgs {
    /// Owning node name, created if unknown
    #[arg(long)]
    node: String,
    #[arg(long)]
    name: String,
    /// Probe type, e.g. http, https or tcp
    #[arg(long = "type")]
    probe_type: String,
    /// URL or host:port
    #[arg(long)]
    target: String,
    #[arg(long, default_value_t = 60)]
    interval: u64,
    #[arg(long, default_value_t = 2)]
    timeout: u64,
    #[arg(long, default_value_t = 1)]
    retry: u32,
    /// Severity when failing: info, warn, low or high
    #[arg(long, default_value = "low")]
    level: HealthLevel,
    /// none, always, onchange or ai
    #[arg(long, default_value = "none")]
    log_mode: LogMode,
    /// Pass/fail expression over the result, e.g. `rtt < 200 && code == "200"`
    #[arg(long)]
    script: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_config(args.config.as_ref()).context("loading configuration")?;
    logger::init_tracing_with_level(&config.logging.level);

    match args.command {
        Command::Run { ephemeral } => Orchestrator::start(config, ephemeral).await,
        Command::Add(add) => add_item(&config, add).await,
        Command::List => list_items(&config).await,
        Command::Config => {
            print!("{config}");
            Ok(())
        }
    }
}

async fn add_item(config: &Config, args: AddArgs) -> Result<()> {
    let database = orchestrator::open_database(config).await?;
    let node_id = database.upsert_node(&args.node).await?;

    let mut item = MonitoredItem::new(node_id, args.name, args.probe_type, args.target);
    item.interval_seconds = args.interval;
    item.timeout_seconds = args.timeout;
    item.retry = args.retry;
    item.level = args.level;
    item.log_mode = args.log_mode;
    item.script = args.script.unwrap_or_default();
    validate_item(&item)?;

    database.save_item(&item).await?;
    info!("Added {} ({}) on node {}", item.name, item.id, args.node);
    println!("{}", item.id);
    Ok(())
}

async fn list_items(config: &Config) -> Result<()> {
    let database = orchestrator::open_database(config).await?;

    let mut items = Vec::new();
    database.for_each_item(&mut |item: &MonitoredItem| items.push(item.clone())).await?;
    items.sort_by(|a, b| a.name.cmp(&b.name));

    for item in items {
        let last_run = item.last_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into());
        println!(
            "{}  {:<20} {:<6} {:<32} {:<8} last {}  {}",
            item.id,
            item.name,
            item.probe_type,
            item.target,
            item.state.to_string(),
            last_run,
            item.result.summary()
        );
    }
    Ok(())
}
