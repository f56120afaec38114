use std::{env, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use squall_core::{
    Clock, WallClock,
    monitoring::{Monitor, MonitorConfig, dispatch::LogDispatcher},
};
use squall_driver::{
    Network,
    checking::CheckerRegistry,
    executor::{self, ExecutorError},
    monitoring::install_default_sources,
    network::{NetworkConfig, ValidatorGroup},
    rules::{ChainRules, RuleVocabulary, diff_rules},
    scenario::Scenario,
};
use squall_runner::{ExternalNetwork, LocalNetwork, ProcessProvisioner};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "squall", version, about = "Load generation and observation harness for Ethereum-compatible networks")]
struct Cli {
    /// Log verbosity, 0 (errors only) to 5 (trace).
    #[arg(long, global = true, default_value_t = 3)]
    verbosity: u8,

    /// Per-module verbosity overrides, e.g. "executor=5,rpc=4".
    #[arg(long, global = true, default_value = "")]
    vmodule: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a scenario against a network.
    Run {
        scenario: PathBuf,
        /// Directory measurement data is written to.
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Run label used in the measurements file; defaults to the
        /// scenario name.
        #[arg(long)]
        label: Option<String>,
        /// RPC endpoint of an externally hosted chain; repeatable. Without
        /// endpoints a local cluster is provisioned.
        #[arg(long)]
        endpoint: Vec<Url>,
        /// Client binary used to provision local nodes.
        #[arg(long)]
        client_binary: Option<PathBuf>,
        /// Private key of a funded account on the target chain.
        #[arg(long)]
        treasury_key: Option<String>,
    },
    /// Parse and validate a scenario without running it.
    Check { scenario: PathBuf },
    /// Remove measurement artifacts from an output directory.
    Purge {
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Print the normalized form of a scenario.
    Render { scenario: PathBuf },
    /// Print the rule differences between two scenarios' genesis settings.
    Diff { first: PathBuf, second: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbosity, &cli.vmodule);

    match dispatch(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if matches!(
                err.downcast_ref::<ExecutorError>(),
                Some(ExecutorError::Cancelled)
            ) {
                warn!("run interrupted by user");
                return ExitCode::from(EXIT_INTERRUPTED);
            }
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbosity: u8, vmodule: &str) {
    let base = match verbosity {
        0 => "error",
        1 => "warn",
        2 | 3 => "info",
        4 => "debug",
        _ => "trace",
    };
    let mut directives = base.to_owned();
    for entry in vmodule.split(',').filter(|entry| !entry.is_empty()) {
        let Some((target, level)) = entry.split_once('=') else {
            eprintln!("ignoring malformed vmodule entry {entry}");
            continue;
        };
        let level = match level {
            "0" => "error",
            "1" => "warn",
            "2" | "3" => "info",
            "4" => "debug",
            _ => "trace",
        };
        directives.push_str(&format!(",{target}={level}"));
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .init();
}

async fn dispatch(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            scenario,
            output_dir,
            label,
            endpoint,
            client_binary,
            treasury_key,
        } => {
            run_scenario(
                &scenario,
                output_dir,
                label,
                endpoint,
                client_binary,
                treasury_key,
            )
            .await
        }
        Command::Check { scenario } => {
            let loaded = load_checked(&scenario)?;
            println!("scenario {} is valid", loaded.name);
            Ok(())
        }
        Command::Purge { output_dir } => purge(&output_dir),
        Command::Render { scenario } => {
            let loaded = load_checked(&scenario)?;
            print!("{}", loaded.to_yaml());
            Ok(())
        }
        Command::Diff { first, second } => diff(&first, &second),
    }
}

fn load_checked(path: &PathBuf) -> anyhow::Result<Scenario> {
    let scenario =
        Scenario::load(path).with_context(|| format!("cannot load {}", path.display()))?;
    scenario.check(&RuleVocabulary::standard())?;
    Ok(scenario)
}

fn genesis_rules_tree(scenario: &Scenario) -> anyhow::Result<ChainRules> {
    let mut rules = ChainRules::default();
    RuleVocabulary::standard().configure_from_map(&mut rules, &scenario.network_rules.genesis)?;
    Ok(rules)
}

fn diff(first: &PathBuf, second: &PathBuf) -> anyhow::Result<()> {
    let a = genesis_rules_tree(&load_checked(first)?)?;
    let b = genesis_rules_tree(&load_checked(second)?)?;
    println!("{}", serde_json::to_string_pretty(&diff_rules(&a, &b))?);
    Ok(())
}

fn purge(output_dir: &PathBuf) -> anyhow::Result<()> {
    for name in ["measurements.csv"] {
        let path = output_dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("cannot remove {}", path.display()))?;
            info!("removed {}", path.display());
        }
    }
    for name in ["cpu_profiles", "nodes"] {
        let path = output_dir.join(name);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("cannot remove {}", path.display()))?;
            info!("removed {}", path.display());
        }
    }
    Ok(())
}

/// Validator groups for a local run; `VALIDATORS_COUNT` sizes the default
/// group when the scenario declares none.
fn validator_groups(scenario: &Scenario) -> anyhow::Result<Vec<ValidatorGroup>> {
    if !scenario.validators.is_empty() {
        return Ok(ValidatorGroup::from_declarations(&scenario.validators));
    }
    let instances = match env::var("VALIDATORS_COUNT") {
        Ok(value) => value
            .parse::<u32>()
            .ok()
            .filter(|count| *count > 0)
            .with_context(|| format!("VALIDATORS_COUNT must be a positive integer, got {value}"))?,
        Err(_) => 1,
    };
    Ok(ValidatorGroup::default_group(instances))
}

async fn run_scenario(
    scenario_path: &PathBuf,
    output_dir: PathBuf,
    label: Option<String>,
    endpoints: Vec<Url>,
    client_binary: Option<PathBuf>,
    treasury_key: Option<String>,
) -> anyhow::Result<()> {
    let scenario = load_checked(scenario_path)?;
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("cannot create {}", output_dir.display()))?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping scenario");
            interrupt.cancel();
        }
    });

    let network: Arc<dyn Network> = if endpoints.is_empty() {
        let binary = client_binary
            .context("a local run needs --client-binary (or pass --endpoint for an external chain)")?;
        let config = NetworkConfig {
            validators: validator_groups(&scenario)?,
            genesis_rules: scenario.network_rules.genesis.clone(),
            output_dir: output_dir.clone(),
        };
        let provisioner = ProcessProvisioner::new(binary, output_dir.join("nodes"));
        LocalNetwork::new(config, Box::new(provisioner)).await?
    } else {
        ExternalNetwork::new(endpoints, treasury_key.as_deref()).await?
    };

    let clock: Arc<dyn Clock> = Arc::new(WallClock::new());
    let monitor = Arc::new(Monitor::new(MonitorConfig {
        run_label: label.unwrap_or_else(|| scenario.name.clone()),
        output_dir,
    }));
    let dispatcher = Arc::new(LogDispatcher::new(Arc::clone(&clock)));
    let observers = install_default_sources(&monitor, &network, &dispatcher, &clock)?;

    let checks = CheckerRegistry::standard().init(Arc::clone(&network), Arc::clone(&monitor));

    let outcome = executor::run(
        clock.as_ref(),
        &network,
        &scenario,
        &checks,
        Some(&monitor),
        &cancel,
    )
    .await;

    observers.shutdown().await;
    dispatcher.shutdown().await;
    if let Err(err) = network.shutdown().await {
        warn!(%err, "network teardown reported failures");
    }

    outcome?;
    info!(
        "scenario finished, measurements at {}",
        monitor.measurements_path().display()
    );
    Ok(())
}
