use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use stratequeue_broker::{
    broker_factory, data_provider_factory, register_broker_factory,
    register_data_provider_factory, BrokerAdapter, DataProviderAdapter,
};
use stratequeue_config::{load_config, AdapterConfig, AppConfig, CredentialStore};
use stratequeue_core::{Granularity, TradingMode};
use stratequeue_data::DataManager;
use stratequeue_demo::DemoFactory;
use stratequeue_engine::{register_builtin_evaluators, registered_engines};
use stratequeue_paper::PaperFactory;
use stratequeue_rpc::{spawn_control_plane, AppState};
use stratequeue_runtime::{
    DeploySpec, RunnerConfig, ShutdownSignal, Supervisor, SupervisorConfig, SupervisorDeps,
    SupervisorError, SystemClock,
};
use stratequeue_stats::StatisticsManager;
use tracing::{error, info};

mod telemetry;

#[derive(Parser)]
#[command(author, version, about = "StrateQueue CLI")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live trading daemon and its control plane
    Daemon,
    /// Deploy a strategy and run the daemon alongside it
    Deploy(DeployArgs),
    /// List the registered signal engines
    Engines,
    /// Store provider or broker credentials
    Config(ConfigArgs),
}

#[derive(Args)]
struct DeployArgs {
    /// Path to the user strategy file
    #[arg(long)]
    strategy: String,
    /// Human-readable strategy identifier
    #[arg(long)]
    strategy_id: Option<String>,
    /// Engine name; auto-detected from the strategy file when omitted
    #[arg(long)]
    engine: Option<String>,
    /// Comma-separated list of symbols
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    /// Bar granularity (1m, 5m, 1h, 1d, ...)
    #[arg(long, default_value = "1m")]
    granularity: Granularity,
    /// Bars of history the strategy needs per evaluation
    #[arg(long, default_value_t = 50)]
    lookback: usize,
    /// Stop automatically after this many minutes
    #[arg(long)]
    duration: Option<i64>,
    /// Fraction in (0, 1] or absolute currency amount
    #[arg(long, default_value = "0.1")]
    allocation: Decimal,
    /// Data provider name
    #[arg(long, default_value = "demo")]
    data_source: String,
    /// Broker name
    #[arg(long, default_value = "paper")]
    broker: String,
    /// Execution mode: signals, paper, or live
    #[arg(long, default_value = "signals")]
    mode: TradingMode,
    /// Engine-specific parameters as a JSON object
    #[arg(long, default_value = "{}")]
    params: String,
}

#[derive(Args)]
struct ConfigArgs {
    /// key=value pairs to store
    #[arg(required = true)]
    values: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "unrecoverable runtime error");
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match load_config(&cli.env) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return Ok(ExitCode::from(1));
        }
    };
    let filter = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    telemetry::init_tracing(&filter, config.log_path.as_deref())?;
    register_adapters();

    match cli.command {
        Commands::Daemon => run_daemon(config, None).await,
        Commands::Deploy(args) => {
            let spec = deploy_spec_from_args(args)?;
            run_daemon(config, Some(spec)).await
        }
        Commands::Engines => {
            for engine in registered_engines() {
                println!("{engine}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(args) => {
            let store = CredentialStore::open(&config.credentials_path);
            let mut values = HashMap::new();
            for pair in &args.values {
                let Some((key, value)) = pair.split_once('=') else {
                    eprintln!("expected key=value, got '{pair}'");
                    return Ok(ExitCode::from(1));
                };
                values.insert(key.to_string(), value.to_string());
            }
            store.set_many(&values)?;
            println!("{} credentials stored", values.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn register_adapters() {
    register_builtin_evaluators();
    register_broker_factory(Arc::new(PaperFactory));
    register_data_provider_factory(Arc::new(DemoFactory));
}

fn deploy_spec_from_args(args: DeployArgs) -> Result<DeploySpec> {
    if args.symbols.is_empty() {
        bail!("--symbols requires at least one symbol");
    }
    let params: serde_json::Value = serde_json::from_str(&args.params)
        .with_context(|| format!("--params is not valid JSON: {}", args.params))?;
    Ok(DeploySpec {
        strategy: args.strategy,
        strategy_id: args.strategy_id,
        engine: args.engine,
        symbols: args.symbols,
        granularity: args.granularity,
        lookback: args.lookback,
        duration_minutes: args.duration,
        allocation: args.allocation,
        data_source: args.data_source,
        broker: args.broker,
        mode: args.mode,
        params,
    })
}

async fn build_providers(
    config: &AppConfig,
) -> Result<HashMap<String, Arc<dyn DataProviderAdapter>>> {
    let mut entries: HashMap<String, AdapterConfig> = config.data_source.clone();
    entries.entry("demo".to_string()).or_insert(AdapterConfig {
        driver: "demo".to_string(),
        params: serde_json::json!({}),
    });
    let mut providers = HashMap::new();
    for (name, adapter) in entries {
        let factory = data_provider_factory(&adapter.driver)
            .ok_or_else(|| anyhow!("data provider driver '{}' is not registered", adapter.driver))?;
        let provider = factory
            .create(&adapter.params)
            .await
            .with_context(|| format!("failed to create data provider '{name}'"))?;
        providers.insert(name, provider);
    }
    Ok(providers)
}

async fn build_brokers(config: &AppConfig) -> Result<HashMap<String, Arc<dyn BrokerAdapter>>> {
    let mut entries: HashMap<String, AdapterConfig> = config.broker.clone();
    entries.entry("paper".to_string()).or_insert(AdapterConfig {
        driver: "paper".to_string(),
        params: serde_json::json!({}),
    });
    let mut brokers = HashMap::new();
    for (name, adapter) in entries {
        let factory = broker_factory(&adapter.driver)
            .ok_or_else(|| anyhow!("broker driver '{}' is not registered", adapter.driver))?;
        let broker = factory
            .create(&adapter.params)
            .await
            .with_context(|| format!("failed to create broker '{name}'"))?;
        brokers.insert(name, broker);
    }
    Ok(brokers)
}

async fn run_daemon(config: AppConfig, deploy: Option<DeploySpec>) -> Result<ExitCode> {
    let control_addr: SocketAddr = config
        .control_addr
        .parse()
        .with_context(|| format!("invalid control_addr '{}'", config.control_addr))?;

    let providers = build_providers(&config).await?;
    let provider_names: Vec<String> = providers.keys().cloned().collect();
    let brokers = build_brokers(&config).await?;
    let (data, _data_task) = DataManager::spawn(providers);

    let shutdown = ShutdownSignal::hooked_to_ctrl_c();
    let runtime_cfg = &config.runtime;
    let supervisor_config = SupervisorConfig {
        runner: RunnerConfig {
            evaluator_timeout: std::time::Duration::from_secs(runtime_cfg.evaluator_timeout_secs),
            warmup_timeout: std::time::Duration::from_secs(runtime_cfg.warmup_timeout_secs),
            settle_delay: std::time::Duration::from_secs(runtime_cfg.settle_delay_secs),
            max_consecutive_errors: runtime_cfg.max_consecutive_errors,
            stop_drain_timeout: std::time::Duration::from_secs(
                runtime_cfg.broker_rpc_timeout_secs * 3,
            ),
        },
        gateway: stratequeue_gateway_config(runtime_cfg),
        default_account_equity: runtime_cfg.default_account_equity,
        short_selling: runtime_cfg.short_selling,
    };
    let stats = Arc::new(StatisticsManager::new());
    let (supervisor, supervisor_task) = Supervisor::spawn(SupervisorDeps {
        data,
        providers: provider_names,
        brokers,
        stats,
        clock: Arc::new(SystemClock),
        config: supervisor_config,
        shutdown: shutdown.clone(),
    });

    let control_task = spawn_control_plane(
        control_addr,
        AppState {
            supervisor: supervisor.clone(),
            credentials: CredentialStore::open(&config.credentials_path),
            upload_dir: config.upload_dir.clone(),
        },
        shutdown.clone(),
    );

    if let Some(spec) = deploy {
        match supervisor.deploy(spec).await {
            Ok(id) => info!(strategy = %id, "strategy deployed from command line"),
            Err(SupervisorError::Validation(errors)) => {
                for error in &errors {
                    eprintln!("validation error: {error}");
                }
                shutdown.trigger();
                let _ = supervisor_task.await;
                let _ = control_task.await;
                return Ok(ExitCode::from(1));
            }
            Err(err) => return Err(err.into()),
        }
    }

    info!(control_addr = %control_addr, "daemon running; press Ctrl-C to stop");
    shutdown.wait().await;
    info!("shutting down");
    let _ = supervisor_task.await;
    let _ = control_task.await;

    if supervisor.fatal() {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn stratequeue_gateway_config(
    runtime: &stratequeue_config::RuntimeConfigSection,
) -> stratequeue_gateway::GatewayConfig {
    stratequeue_gateway::GatewayConfig {
        submit_timeout: std::time::Duration::from_secs(runtime.broker_rpc_timeout_secs),
        poll_interval: std::time::Duration::from_secs(runtime.order_poll_interval_secs),
        reconcile_interval: std::time::Duration::from_secs(30),
    }
}
