//! dpf-selector - inspect and exercise a data-plane selector configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dpf_core_selector::{TransferRequest, TransferState};
use dpf_selector::error::{DpfError, EXIT_FATAL, EXIT_PARTIAL, EXIT_SUCCESS};
use dpf_selector::logging::init_logging;
use dpf_selector::orchestrator::SimulatedExecutor;
use dpf_selector::output::{instances_table, records_table, stats_table};
use dpf_selector::{SelectorConfig, SelectorRuntime, TransferOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Data-plane selector: choose which data plane runs a transfer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "dpf-selector.toml", env = "DPF_SELECTOR_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print Prometheus metrics after the command
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the configuration file and print a summary
    Validate,

    /// List configured data-plane instances and their liveness
    Instances,

    /// Run selections for a request and print the chosen instances
    Select {
        /// Source type, e.g. HttpData
        source_type: String,

        /// Destination type, e.g. AmazonS3
        destination_type: String,

        /// Transfer type, e.g. push
        #[arg(default_value = "push")]
        transfer_type: String,

        /// Pin the selection to an instance
        #[arg(long)]
        hint: Option<String>,

        /// Strategy to use instead of the configured default
        #[arg(long)]
        strategy: Option<String>,

        /// Number of selections to run
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Run the configured transfers against a simulated executor
    Simulate {
        /// Probability that an attempt fails (0.0 - 1.0)
        #[arg(long, default_value_t = 0.2, value_parser = parse_probability)]
        failure_rate: f64,

        /// Mean attempt latency in milliseconds
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,

        /// Seed for the simulated failures
        #[arg(long)]
        seed: Option<u64>,

        /// Run the configured transfers this many times
        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },
}

fn parse_probability(value: &str) -> std::result::Result<f64, String> {
    let rate: f64 = value.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{} is not between 0.0 and 1.0", value))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            err.downcast_ref::<DpfError>()
                .map(DpfError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = SelectorConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.verbose |= cli.verbose;
    init_logging(&config)?;

    info!(config = %cli.config.display(), "dpf-selector v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::Validate = cli.command {
        println!(
            "{}",
            stats_table(&[
                ("Configuration", cli.config.display().to_string()),
                ("Instances", config.instances.len().to_string()),
                ("Secrets", config.secrets.len().to_string()),
                ("Transfers", config.transfers.len().to_string()),
                ("Default strategy", config.default_strategy.clone()),
                ("Liveness window", format!("{}s", config.liveness_window_secs)),
                ("Retry limit", config.retry_limit.to_string()),
            ])
        );
        println!("Configuration is valid");
        return Ok(EXIT_SUCCESS);
    }

    let runtime = SelectorRuntime::build(config)?;

    let code = match cli.command {
        Commands::Validate => EXIT_SUCCESS,
        Commands::Instances => list_instances(&runtime),
        Commands::Select {
            source_type,
            destination_type,
            transfer_type,
            hint,
            strategy,
            count,
        } => {
            let mut request = TransferRequest::new(source_type, destination_type, transfer_type);
            if let Some(hint) = hint {
                request = request.with_hint(hint);
            }
            if let Some(strategy) = strategy {
                request = request.with_strategy(strategy);
            }
            select(&runtime, &request, count)?
        }
        Commands::Simulate {
            failure_rate,
            latency_ms,
            seed,
            repeat,
        } => {
            let executor = Arc::new(SimulatedExecutor::new(
                failure_rate,
                Duration::from_millis(latency_ms),
                seed,
            )?);
            simulate(&runtime, executor, repeat).await?
        }
    };

    if cli.metrics {
        println!("{}", runtime.render_metrics()?);
    }

    Ok(code)
}

fn list_instances(runtime: &SelectorRuntime) -> i32 {
    let registry = runtime.service().registry();
    let rows: Vec<_> = registry
        .list_all()
        .into_iter()
        .map(|instance| {
            let live = registry.is_live(&instance.id);
            (instance, live)
        })
        .collect();
    println!("{}", instances_table(&rows, registry.now()));
    EXIT_SUCCESS
}

fn select(runtime: &SelectorRuntime, request: &TransferRequest, count: usize) -> Result<i32> {
    let service = runtime.service();
    let mut picks = Vec::with_capacity(count);
    for _ in 0..count {
        let instance = service.select(request)?;
        picks.push(instance.id);
    }

    let rows: Vec<(String, String)> = picks
        .iter()
        .enumerate()
        .map(|(n, id)| (format!("#{}", n + 1), id.to_string()))
        .collect();
    let items: Vec<(&str, String)> = rows
        .iter()
        .map(|(label, id)| (label.as_str(), id.clone()))
        .collect();
    println!("Route {}", request.key());
    println!("{}", stats_table(&items));
    Ok(EXIT_SUCCESS)
}

async fn simulate(
    runtime: &SelectorRuntime,
    executor: Arc<SimulatedExecutor>,
    repeat: usize,
) -> Result<i32> {
    let requests: Vec<TransferRequest> = runtime
        .config()
        .transfers
        .iter()
        .map(|transfer| transfer.to_request())
        .collect();
    if requests.is_empty() {
        anyhow::bail!(DpfError::Config(
            "No [[transfers]] configured to simulate".to_string()
        ));
    }

    let orchestrator = Arc::new(TransferOrchestrator::new(
        runtime.service().clone(),
        runtime.secrets().clone(),
        executor,
    ));

    let batch: Vec<TransferRequest> = std::iter::repeat(requests)
        .take(repeat.max(1))
        .flatten()
        .collect();
    let results = orchestrator.run_all(batch).await;

    for result in &results {
        if let Err(err) = result {
            if err.as_selector().is_some() {
                eprintln!("Selection failed: {}", err);
            }
        }
    }

    let records = runtime.service().tracker().list();
    println!("{}", records_table(&records));

    let count = |state: TransferState| records.iter().filter(|r| r.state == state).count();
    let completed = count(TransferState::Completed);
    let failed = count(TransferState::Failed);
    let cancelled = count(TransferState::Cancelled);
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.as_selector().is_some()))
        .count();

    println!(
        "{}",
        stats_table(&[
            ("Requested", results.len().to_string()),
            ("Completed", completed.to_string()),
            ("Failed", failed.to_string()),
            ("Cancelled", cancelled.to_string()),
            ("Not selected", rejected.to_string()),
        ])
    );

    if completed == results.len() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_PARTIAL)
    }
}
