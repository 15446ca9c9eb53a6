use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotagate::config::{LoggingConfig, QuotagateConfig};
use quotagate::gate::{GateRegistry, GateRules, QuotaGate, QuotaKey};
use quotagate::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

/// Drive and inspect shared-quota admission gates.
#[derive(Parser, Debug)]
#[command(name = "quotagate", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the counter store URL
    #[arg(long, global = true)]
    store_url: Option<String>,

    /// Use an in-process counter store
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue calls through a gate and report how many were admitted
    Probe {
        #[arg(long)]
        service: String,

        #[arg(long, default_value = "")]
        method: String,

        /// Limit per window; looked up in the rules file when omitted
        #[arg(long)]
        limit: Option<i64>,

        #[arg(long, default_value_t = 1000)]
        calls: usize,

        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a rules file and list its limits
    Rules { path: String },
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    key: String,
    limit_per_window: i64,
    admitted: usize,
    denied: usize,
    elapsed_ms: u128,
    local_tokens: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = QuotagateConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(url) = cli.store_url.clone() {
        config.store.url = url;
    }
    if cli.memory {
        config.store.memory = true;
    }

    init_tracing(&config.logging);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Probe {
            service,
            method,
            limit,
            calls,
            concurrency,
            json,
        } => {
            let store = connect_store(&config).await?;
            let gate = match limit {
                Some(limit) => Arc::new(
                    QuotaGate::new(
                        QuotaKey::new(&service, &method),
                        store,
                        limit,
                        config.sync.clone(),
                    )
                    .await?,
                ),
                None => {
                    let rules = load_rules(&config)?;
                    let registry = GateRegistry::new(store, rules, config.sync.clone());
                    match registry.gate(&service, &method).await? {
                        Some(gate) => gate,
                        None => bail!("No rule covers {}/{}; pass --limit", service, method),
                    }
                }
            };

            let report = probe(gate, calls, concurrency.max(1)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{}: admitted {} denied {} in {} ms (limit {} per window)",
                    report.key, report.admitted, report.denied, report.elapsed_ms, report.limit_per_window
                );
            }
        }
        Command::Rules { path } => {
            let rules = GateRules::from_file(&path)?;
            let mut services: Vec<_> = rules.services.values().collect();
            services.sort_by(|a, b| a.service.cmp(&b.service));

            for service in services {
                match service.limit_per_window {
                    Some(limit) => println!("{} (default {})", service.service, limit),
                    None => println!("{}", service.service),
                }
                for method in &service.methods {
                    println!("  {} {}", method.name, method.limit_per_window);
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

async fn connect_store(config: &QuotagateConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    if config.store.memory {
        info!("Using in-process counter store");
        return Ok(Arc::new(MemoryCounterStore::new()));
    }

    let store = RedisCounterStore::connect(&config.store.url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.store.url))?;
    info!(url = %store.url(), "Connected to counter store");
    Ok(Arc::new(store))
}

fn load_rules(config: &QuotagateConfig) -> anyhow::Result<GateRules> {
    match &config.rules_path {
        Some(path) => Ok(GateRules::from_file(path)?),
        None => Ok(GateRules::new()),
    }
}

async fn probe(
    gate: Arc<QuotaGate<dyn CounterStore>>,
    calls: usize,
    concurrency: usize,
) -> anyhow::Result<ProbeReport> {
    let started = Instant::now();
    let per_task = calls / concurrency;
    let remainder = calls % concurrency;

    let tasks = (0..concurrency).map(|i| {
        let gate = gate.clone();
        let n = per_task + usize::from(i < remainder);
        tokio::spawn(async move {
            let mut admitted: usize = 0;
            for _ in 0..n {
                if gate.can_pass().await {
                    admitted += 1;
                }
            }
            admitted
        })
    });

    let mut admitted = 0;
    for result in futures::future::join_all(tasks).await {
        admitted += result?;
    }

    Ok(ProbeReport {
        key: gate.key().to_string(),
        limit_per_window: gate.limit_per_window(),
        admitted,
        denied: calls - admitted,
        elapsed_ms: started.elapsed().as_millis(),
        local_tokens: gate.local_tokens(),
    })
}
