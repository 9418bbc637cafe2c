use anyhow::{anyhow, Result};
use arbor_rpc::{start_server, AppState};
use arbor_settlement::SettlementOutcome;
use arbor_types::{utc_today, SettlementDay};
use chrono::NaiveDate;
use clap::{value_parser, Arg, ArgAction, Command};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod daily;
mod engine;
mod gateway;
mod settings;
mod version;

use engine::Engine;
use settings::NodeConfig;
use version::{git_commit_hash, ARBOR_VERSION};

fn cli() -> Command {
    Command::new("arbor-node")
        .version(ARBOR_VERSION)
        .about("Arbor referral staking rewards node")
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (defaults to config/arbor.toml when present)")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory")
                .global(true),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .value_name("BACKEND")
                .value_parser(["sled", "memory"])
                .help("Storage backend")
                .global(true),
        )
        .arg(
            Arg::new("version_flag")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print detailed version information and exit")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .arg(
            Arg::new("rpc-host")
                .long("rpc-host")
                .value_name("HOST")
                .help("Override RPC bind host")
                .global(true),
        )
        .arg(
            Arg::new("rpc-port")
                .long("rpc-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override RPC port")
                .global(true),
        )
        .arg(
            Arg::new("settlement-hour")
                .long("settlement-hour")
                .value_name("HOUR")
                .value_parser(value_parser!(u32))
                .help("UTC hour of the daily settlement")
                .global(true),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Disable the Prometheus metrics endpoint")
                .global(true),
        )
        .subcommand(Command::new("start").about("Serve the API and run the daily settlement"))
        .subcommand(
            Command::new("settle")
                .about("Settle one day in the foreground and print its report")
                .arg(
                    Arg::new("date")
                        .long("date")
                        .value_name("YYYY-MM-DD")
                        .help("Day to settle (defaults to today, UTC)"),
                ),
        )
        .subcommand(
            Command::new("release")
                .about("Drop the settlement lease of a day so it can be re-run")
                .arg(
                    Arg::new("date")
                        .long("date")
                        .value_name("YYYY-MM-DD")
                        .required(true)
                        .help("Day whose lease to drop"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Check the /health endpoint of a running node")
                .arg(
                    Arg::new("health-path")
                        .long("health-path")
                        .value_name("PATH")
                        .default_value("/health")
                        .help("Health endpoint path to query"),
                ),
        )
        .subcommand(Command::new("config").about("Print the resolved node configuration"))
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<NodeConfig> {
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = NodeConfig::load(config_path)?;
    apply_overrides(matches, &mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut NodeConfig) -> Result<()> {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = PathBuf::from(data_dir);
    }

    if let Some(storage) = matches.get_one::<String>("storage") {
        config.storage_backend = storage.parse()?;
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(rpc_host) = matches.get_one::<String>("rpc-host") {
        config.rpc_host = rpc_host.clone();
    }

    if let Some(rpc_port) = matches.get_one::<u16>("rpc-port") {
        config.rpc_port = *rpc_port;
    }

    if let Some(hour) = matches.get_one::<u32>("settlement-hour") {
        config.settlement_hour = *hour;
    }

    if matches.get_flag("disable-metrics") {
        config.prometheus_enabled = false;
    }
    Ok(())
}

fn parse_day(raw: Option<&String>) -> Result<SettlementDay> {
    match raw {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|err| anyhow!("invalid date {raw:?}: {err}")),
        None => Ok(utc_today()),
    }
}

async fn check_status(config: &NodeConfig, health_path: &str) -> Result<()> {
    let mut path = health_path.to_string();
    if !path.starts_with('/') {
        path = format!("/{path}");
    }
    let url = format!("http://{}{}", config.rpc_addr(), path);
    let response = reqwest::Client::new().get(&url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    println!("GET {url} -> {status}");
    println!("{body}");
    if status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("Health check failed with status {status}")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    if matches.get_flag("version_flag") {
        println!("Arbor {} (commit {})", ARBOR_VERSION, git_commit_hash());
        return Ok(());
    }

    let config = load_config_with_overrides(&matches)?;

    match matches.subcommand() {
        Some(("status", sub)) => {
            let health_path = sub
                .get_one::<String>("health-path")
                .map(String::as_str)
                .unwrap_or("/health");
            check_status(&config, health_path).await
        }
        Some(("config", _)) => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
        Some(("settle", sub)) => {
            init_logging(&config)?;
            let day = parse_day(sub.get_one::<String>("date"))?;
            run_settle(&config, day).await
        }
        Some(("release", sub)) => {
            init_logging(&config)?;
            let day = parse_day(sub.get_one::<String>("date"))?;
            let engine = Engine::open(&config)?;
            match engine.settlement.leases().force_release(day)? {
                Some(lease) => println!(
                    "Released {day} ({:?}, owner {}, {} steps done)",
                    lease.state,
                    lease.owner,
                    lease.completed_steps.len()
                ),
                None => println!("No lease recorded for {day}"),
            }
            engine.flush()
        }
        _ => run_node(config).await,
    }
}

async fn run_settle(config: &NodeConfig, day: SettlementDay) -> Result<()> {
    let engine = Engine::open(config)?;
    let outcome = daily::settle(engine.settlement.clone(), day).await?;
    match outcome {
        SettlementOutcome::Completed(report) | SettlementOutcome::AlreadyCompleted(Some(report)) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SettlementOutcome::AlreadyCompleted(None) => println!("{day} is already settled"),
        SettlementOutcome::InProgress {
            owner,
            heartbeat_at,
        } => println!("{day} is being settled by {owner} (last heartbeat {heartbeat_at})"),
    }
    engine.flush()
}

async fn run_node(config: NodeConfig) -> Result<()> {
    init_logging(&config)?;
    let metrics = init_metrics(&config);
    info!(
        version = ARBOR_VERSION,
        commit = git_commit_hash(),
        node_id = %config.node_id,
        config = ?config.config_file(),
        "Starting Arbor node"
    );

    let engine = Engine::open(&config)?;
    let mut state = AppState::new(
        engine.processor.clone(),
        engine.levels.clone(),
        engine.settlement.clone(),
        config.node_id.clone(),
    );
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    let scheduler = tokio::spawn(daily::run_daily(
        engine.settlement.clone(),
        config.settlement_hour,
    ));

    let addr = config.rpc_addr();
    tokio::select! {
        result = start_server(state, &addr) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    scheduler.abort();
    engine.flush()?;
    info!("Arbor node stopped");
    Ok(())
}

fn init_metrics(config: &NodeConfig) -> Option<PrometheusHandle> {
    if !config.prometheus_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics exporter registered");
            describe_counter!(
                "arbor_rewards_written_total",
                "Reward flows written by the settlement calculators"
            );
            describe_counter!(
                "arbor_cap_partial_fills_total",
                "Reward draws truncated to the remaining cap"
            );
            describe_counter!(
                "arbor_performance_recomputations_total",
                "Subtree performance recomputations"
            );
            describe_histogram!(
                "arbor_settlement_step_seconds",
                "Wall time of each settlement step"
            );
            Some(handle)
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
            None
        }
    }
}

fn init_logging(config: &NodeConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}
