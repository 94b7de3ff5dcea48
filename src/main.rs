use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use stack_operator::controller::{self, OperatorConfig};
use stack_operator::convert::{self, StrategyKind};
use stack_operator::crd::Stack;
use stack_operator::Error;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Print the objects a Stack manifest would produce
    Convert(ConvertArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Watch a single namespace (all namespaces when empty)
    #[arg(long, env = "STACK_NAMESPACE", default_value = "")]
    namespace: String,

    /// How published ports are exposed: load-balancer or node-port
    #[arg(
        long,
        env = "SERVICE_STRATEGY",
        default_value = "load-balancer",
        alias = "default-service-type"
    )]
    service_strategy: StrategyKind,

    /// Address of the health and metrics endpoint
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Delay before retrying a stack after a write conflict
    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = 1000)]
    retry_delay_ms: u64,
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Stack manifest (YAML)
    #[arg(long, short)]
    file: PathBuf,

    #[arg(
        long,
        default_value = "load-balancer",
        alias = "default-service-type"
    )]
    service_strategy: StrategyKind,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("stack-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Convert(convert_args) => {
            init_tracing(args.log_json);
            run_convert(convert_args)
        }
        Commands::Run(run_args) => {
            init_tracing(args.log_json);
            run_operator(run_args).await
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

fn run_convert(args: ConvertArgs) -> Result<(), Error> {
    let manifest = std::fs::read_to_string(&args.file).map_err(|e| {
        Error::ConfigError(format!("Failed to read {}: {}", args.file.display(), e))
    })?;
    let stack: Stack = serde_yaml::from_str(&manifest)?;
    let strategy = args.service_strategy.build();

    match convert::dry_run(&stack, strategy.as_ref()) {
        Ok(rendered) => {
            print!("{rendered}");
            Ok(())
        }
        Err(e) => {
            error!("Stack cannot be converted: {}", e);
            Err(e)
        }
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    info!("Starting stack-operator v{}", env!("CARGO_PKG_VERSION"));

    let kube_config = kube::Config::infer()
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to load kube config: {}", e)))?;
    let client = kube::Client::try_from(kube_config.clone()).map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {:?}", e),
        }
        let _ = stop_tx.send(true);
    });
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    #[cfg(feature = "rest-api")]
    {
        let addr = args.metrics_addr;
        let shutdown = stopped(stop_rx.clone());
        tokio::spawn(async move {
            if let Err(e) = stack_operator::rest_api::run_server(addr, shutdown).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    let _ = args.metrics_addr;

    let config = OperatorConfig {
        namespace: Some(args.namespace).filter(|ns| !ns.is_empty()),
        strategy: args.service_strategy,
        retry_delay: Duration::from_millis(args.retry_delay_ms),
    };

    // IdentityUnavailable surfaces here; exiting non-zero lets the
    // supervisor restart the operator with empty caches
    controller::run_controller(client, kube_config, config, stopped(stop_rx)).await
}
