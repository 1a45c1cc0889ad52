use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crust_core::{Money, ObjectKey, OrderStatus, PizzaOrder};
use crust_fulfill::sim::SimProvider;
use crust_fulfill::{assemble_order, FulfillmentClient};
use crust_kubehub::{get_kube_client, start_feed, KubeStore, TypeRegistry};
use crust_reconcile::controller::Controller;
use crust_reconcile::{classify, ReconcileConfig, Reconciler, Requeue};
use crust_store::{MemStore, OrderStore, SecretData};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod manifest;

#[derive(Parser, Debug)]
#[command(name = "crustctl", version, about = "PizzaOrder controller and tools")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace (watch scope for `run`, lookup namespace for `status`, override for manifests)
    #[arg(long = "ns", global = true, env = "CRUST_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Provider {
    /// In-process simulated pizza chain
    Sim,
}

/// Overrides applied on top of the `CRUST_*` environment.
#[derive(Args, Debug, Default)]
struct Tuning {
    /// Seconds between tracking polls
    #[arg(long = "poll-secs")]
    poll_secs: Option<u64>,
    /// Seconds before retrying a failed placement
    #[arg(long = "retry-secs")]
    retry_secs: Option<u64>,
    /// Gratuity added to every payment, e.g. 5.00
    #[arg(long = "tip")]
    tip: Option<Money>,
    /// Per-call timeout in seconds (0 disables)
    #[arg(long = "call-timeout-secs")]
    call_timeout_secs: Option<u64>,
    /// Orders reconciled in parallel
    #[arg(long = "concurrency")]
    concurrency: Option<usize>,
}

impl Tuning {
    fn apply(&self, mut cfg: ReconcileConfig) -> ReconcileConfig {
        if let Some(s) = self.poll_secs { cfg.poll_interval = Duration::from_secs(s.max(1)); }
        if let Some(s) = self.retry_secs { cfg.retry_interval = Duration::from_secs(s.max(1)); }
        if let Some(t) = self.tip { cfg.gratuity = t; }
        if let Some(s) = self.call_timeout_secs { cfg.call_timeout = (s > 0).then(|| Duration::from_secs(s)); }
        if let Some(n) = self.concurrency { cfg.concurrency = n.max(1); }
        cfg
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the cluster
    Run {
        /// Fulfillment backend
        #[arg(long = "provider", value_enum, default_value_t = Provider::Sim)]
        provider: Provider,
        /// Resource GVK key (default pizza.bilalashraf.xyz/v1/PizzaOrder)
        #[arg(long = "gvk")]
        gvk: Option<String>,
        /// Plural resource name when --gvk is set
        #[arg(long = "plural")]
        plural: Option<String>,
        /// Change-feed buffer size
        #[arg(long = "queue-cap", default_value_t = 1024)]
        queue_cap: usize,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Drive an order manifest to delivery in memory, one pass after another (no waiting between passes)
    Simulate {
        file: PathBuf,
        /// Secret manifest for the payment card; a test card is used when omitted
        #[arg(long = "secret")]
        secret: Option<PathBuf>,
        /// Stop after this many passes
        #[arg(long = "max-passes", default_value_t = 10)]
        max_passes: u32,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Print which action an order manifest calls for
    Classify { file: PathBuf },
    /// Print the external order an order manifest translates to
    Assemble {
        file: PathBuf,
        #[arg(long = "store-id", default_value = "")]
        store_id: String,
    },
    /// Print the status of a live order
    Status {
        name: String,
        #[arg(long = "gvk")]
        gvk: Option<String>,
        #[arg(long = "plural")]
        plural: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("CRUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CRUST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CRUST_METRICS_ADDR; expected host:port");
        }
    }
}

fn type_registry(gvk: Option<&str>, plural: Option<&str>) -> Result<TypeRegistry> {
    match gvk {
        Some(k) => TypeRegistry::from_gvk_key(k, plural),
        None => Ok(TypeRegistry::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Run { provider, gvk, plural, queue_cap, tuning } => {
            let cfg = tuning.apply(ReconcileConfig::from_env());
            let registry = type_registry(gvk.as_deref(), plural.as_deref())?;
            let client = get_kube_client().await?;
            let store = Arc::new(KubeStore::new(client.clone(), registry.clone()));
            let fulfill: Arc<dyn FulfillmentClient> = match provider {
                Provider::Sim => Arc::new(SimProvider::default()),
            };
            info!(gvk = %registry.gvk_key(), ns = ?ns, ?provider, poll = ?cfg.poll_interval, retry = ?cfg.retry_interval, "run invoked");
            let reconciler = Arc::new(Reconciler::new(store.clone(), store, fulfill, cfg.clone()));

            let (tx, rx) = mpsc::channel(queue_cap.max(1));
            let feed_handle = tokio::spawn({
                let ns = ns.map(|s| s.to_string());
                async move {
                    if let Err(e) = start_feed(client, &registry, ns.as_deref(), tx).await {
                        error!(error = ?e, "order feed failed");
                    }
                }
            });

            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    match signal::ctrl_c().await {
                        Ok(()) => {
                            info!("Ctrl-C received; shutting down controller");
                            shutdown.cancel();
                        }
                        Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
                    }
                }
            });

            let stats = Controller::new(reconciler, &cfg).run(rx, shutdown).await;
            feed_handle.abort();
            match cli.output {
                Output::Human => println!("reconciled {} • failed {}", stats.reconciled, stats.failed),
                Output::Json => println!("{}", serde_json::json!({ "reconciled": stats.reconciled, "failed": stats.failed })),
            }
        }
        Commands::Simulate { file, secret, max_passes, tuning } => {
            let order = manifest::order_from_manifest(&manifest::read_yaml(&file)?, ns)?;
            let key = order.key.clone();
            let store = Arc::new(MemStore::new());
            let secret_name = order.spec.payment_secret.name.clone();
            match secret {
                Some(path) => {
                    let (name, data) = manifest::secret_from_manifest(&manifest::read_yaml(&path)?)?;
                    store.put_secret(&key.namespace, &name, data);
                }
                None if !secret_name.is_empty() => store.put_secret(&key.namespace, &secret_name, test_card()),
                None => {}
            }
            store.apply(order).await;

            let cfg = tuning.apply(ReconcileConfig::from_env());
            let rec = Reconciler::new(store.clone(), store.clone(), Arc::new(SimProvider::default()), cfg);
            let cancel = CancellationToken::new();
            let mut passes = Vec::new();
            for pass in 1..=max_passes.max(1) {
                let out = rec.reconcile(&key, &cancel).await?;
                let verdict = out.verdict.map(|v| v.as_str()).unwrap_or("gone");
                let requeue = match out.requeue {
                    Requeue::After(d) => Some(d.as_secs()),
                    Requeue::None => None,
                };
                if cli.output == Output::Human {
                    match requeue {
                        Some(s) => println!("pass {pass}: {verdict} • requeue in {s}s"),
                        None => println!("pass {pass}: {verdict} • done"),
                    }
                }
                passes.push(serde_json::json!({ "pass": pass, "verdict": verdict, "requeueSecs": requeue }));
                if requeue.is_none() {
                    break;
                }
            }
            let Some(last) = store.peek(&key) else { bail!("{key} disappeared during simulation") };
            match cli.output {
                Output::Human => print_status(&last),
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "passes": passes, "status": last.status }))?),
            }
        }
        Commands::Classify { file } => {
            let order = manifest::order_from_manifest(&manifest::read_yaml(&file)?, ns)?;
            let verdict = classify(&order.spec, &order.status);
            match cli.output {
                Output::Human => println!("{} • {}", order.key, verdict),
                Output::Json => println!("{}", serde_json::json!({ "key": order.key.to_string(), "verdict": verdict.as_str() })),
            }
        }
        Commands::Assemble { file, store_id } => {
            let order = manifest::order_from_manifest(&manifest::read_yaml(&file)?, ns)?;
            let external = assemble_order(&order, &store_id);
            match cli.output {
                Output::Human => {
                    println!("store: {}", if external.store_id.is_empty() { "-" } else { &external.store_id });
                    println!("CODE       QTY  OPTIONS");
                    for p in &external.products {
                        let opts: Vec<_> = p.options.keys().map(|k| k.as_str()).collect();
                        println!("{:<10} {:<4} {}", p.code, p.qty, opts.join(","));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&external)?),
            }
        }
        Commands::Status { name, gvk, plural } => {
            let key = ObjectKey::new(ns.unwrap_or(manifest::DEFAULT_NAMESPACE), name);
            let store = KubeStore::new(get_kube_client().await?, type_registry(gvk.as_deref(), plural.as_deref())?);
            let Some(found) = store.get(&key).await? else { bail!("order {key} not found") };
            match cli.output {
                Output::Human => print_status(&found.value),
                Output::Json => println!("{}", serde_json::to_string_pretty(&found.value.status)?),
            }
        }
    }

    Ok(())
}

fn test_card() -> SecretData {
    SecretData::from_pairs([("Number", "4111111111111111"), ("Expiration", "01/30"), ("SecurityCode", "123"), ("PostalCode", "00000")])
}

fn dash(s: &str) -> &str { if s.is_empty() { "-" } else { s } }

fn print_status(order: &PizzaOrder) {
    let OrderStatus { order_id, price, placed, delivered, store, tracker } = &order.status;
    println!("order:     {}", order.key);
    println!("orderID:   {}", dash(order_id));
    println!("price:     {}", dash(price));
    println!("placed:    {placed}");
    println!("delivered: {delivered}");
    if let Some(s) = store {
        println!("store:     {} ({})", dash(&s.id), dash(&s.address));
    }
    if let Some(t) = tracker {
        for (stage, at) in [
            ("prep", &t.prep),
            ("bake", &t.bake),
            ("qualityCheck", &t.quality_check),
            ("outForDelivery", &t.out_for_delivery),
            ("delivered", &t.delivered),
        ] {
            println!("  {:<15} {}", stage, at.as_deref().unwrap_or("-"));
        }
    }
}
