//! Keel: SampleResource controller process.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use keel_controller::{Controller, ControllerConfig};
use keel_core::SampleResource;
use keel_kubehub::{KubeEventRecorder, KubeStatusClient};
use keel_store::{spawn_ingest, Cache};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "SampleResource controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until Ctrl-C
    Run(Overrides),
    /// Print the effective configuration and exit
    Config(Overrides),
}

/// Flag overrides applied on top of defaults and `KEEL_*` variables.
#[derive(Args, Debug)]
struct Overrides {
    /// Number of concurrent workers
    #[arg(long, env = "KEEL_WORKERS")]
    workers: Option<usize>,
    /// Watch a single namespace (default: all namespaces)
    #[arg(long = "ns", env = "KEEL_NAMESPACE")]
    namespace: Option<String>,
    /// Periodic resync interval in seconds; 0 disables
    #[arg(long, env = "KEEL_RESYNC_SECS")]
    resync_secs: Option<u64>,
    /// Give up if the cache has not synced within this many seconds
    #[arg(long, env = "KEEL_CACHE_SYNC_TIMEOUT_SECS")]
    cache_sync_timeout_secs: Option<u64>,
}

impl Overrides {
    fn apply(self, mut cfg: ControllerConfig) -> ControllerConfig {
        if let Some(v) = self.workers { cfg.workers = v; }
        if let Some(ns) = self.namespace {
            cfg.namespace = if ns.is_empty() { None } else { Some(ns) };
        }
        if let Some(v) = self.resync_secs { cfg.resync_secs = v; }
        if let Some(v) = self.cache_sync_timeout_secs { cfg.cache_sync_timeout_secs = v; }
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_config(cfg: &ControllerConfig, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("controller_name          {}", cfg.controller_name);
            println!("workers                  {}", cfg.workers);
            println!("namespace                {}", cfg.namespace.as_deref().unwrap_or("<all>"));
            println!("resync_secs              {}", cfg.resync_secs);
            println!("cache_sync_timeout_secs  {}", cfg.cache_sync_timeout_secs);
            println!("backoff                  {}ms .. {}s", cfg.backoff_base_ms, cfg.backoff_max_secs);
            println!("rate                     {} qps, burst {}", cfg.qps, cfg.burst);
            println!("ingest_cap               {}", cfg.ingest_cap);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(cfg)?),
    }
    Ok(())
}

async fn run(cfg: ControllerConfig) -> Result<()> {
    cfg.validate().context("invalid configuration")?;
    let client = keel_kubehub::get_kube_client().await?;
    let token = CancellationToken::new();

    let cache: Arc<Cache<SampleResource>> = Arc::new(Cache::new());
    let (tx, ingest) = spawn_ingest(Arc::clone(&cache), cfg.ingest_cap, cfg.resync());
    let api = keel_kubehub::sample_api(client.clone(), cfg.namespace.as_deref());
    let informer = tokio::spawn(keel_kubehub::start_informer(api, tx, token.clone()));

    let controller = Controller::new(
        cfg.clone(),
        cache,
        Arc::new(KubeStatusClient::new(client.clone())),
        Arc::new(KubeEventRecorder::new(client, &cfg.controller_name)),
    );

    let shutdown = token.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received; shutting down");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
        }
    });

    let result = controller.run(token.clone()).await;
    token.cancel();
    match informer.await {
        Ok(Err(e)) => warn!(error = ?e, "informer stopped with error"),
        Err(e) => warn!(error = %e, "informer task failed"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = ingest.await {
        warn!(error = %e, "ingest task failed");
    }
    result.context("controller exited")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(overrides) => {
            let cfg = overrides.apply(ControllerConfig::from_env());
            info!(workers = cfg.workers, namespace = ?cfg.namespace, "keel starting");
            run(cfg).await
        }
        Commands::Config(overrides) => {
            let cfg = overrides.apply(ControllerConfig::from_env());
            print_config(&cfg, cli.output)?;
            if let Err(e) = cfg.validate() {
                eprintln!("warning: {}", e);
            }
            Ok(())
        }
    }
}
