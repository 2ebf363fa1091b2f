mod catalog;
mod collector;
mod config;
mod http;
mod metrics;
mod model;
mod prober;
mod session;
mod state;
mod store;
mod templates;
mod upload;
mod wire;

#[cfg(test)]
mod testing;

use axum::serve;
use catalog::CatalogError;
use clap::Parser;
use collector::Collector;
use config::Config;
use metrics::Metrics;
use model::Snapshot;
use prober::Prober;
use session::ssh::SshSessionFactory;
use state::{now_unix, Delivery, HealthEventKind, State, DOWN_THRESHOLD};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use templates::{TemplateError, TemplateLibrary, TemplateRegistry};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use upload::{UploadError, Uploader};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "netsnap")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "collector_off")]
    collector_on: bool,
    #[arg(long, conflicts_with = "collector_on")]
    collector_off: bool,
    /// Collect one snapshot, print it as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Templates(#[from] TemplateError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("collector.targets_file is not set")]
    NoTargets,
    #[error("collector has neither a database nor an upload_url")]
    NoDestination,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Wire(#[from] wire::WireError),
}

/// Where a collected snapshot goes.
enum Sink {
    Local(Store),
    Remote(Uploader),
}

impl Sink {
    async fn deliver(&self, snapshot: &Snapshot, metrics: &Metrics) -> Delivery {
        match self {
            Sink::Local(store) => match store.store(snapshot).await {
                Ok(id) => {
                    metrics.inc_snapshot_stored();
                    info!(id, devices = snapshot.devices.len(), "snapshot stored");
                    Delivery::Stored { id }
                }
                Err(err) => {
                    metrics.inc_store_error("store");
                    error!(error = %err, "failed to store snapshot");
                    Delivery::Failed {
                        error: err.to_string(),
                    }
                }
            },
            Sink::Remote(uploader) => match uploader.upload(snapshot).await {
                Ok(id) => {
                    metrics.inc_snapshot_uploaded();
                    info!(id, url = %uploader.endpoint(), "snapshot uploaded");
                    Delivery::Uploaded { id }
                }
                Err(err) => {
                    metrics.inc_upload_error();
                    error!(error = %err, "failed to upload snapshot");
                    Delivery::Failed {
                        error: err.to_string(),
                    }
                }
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing("info");
            error!(error = %err, config = %cli.config, "failed to load config");
            std::process::exit(1);
        }
    };
    if cli.collector_on {
        cfg.collector.enabled = true;
    } else if cli.collector_off {
        cfg.collector.enabled = false;
    }
    init_tracing(&cfg.log_level);

    if cli.once {
        if let Err(err) = run_once(&cfg).await {
            error!(error = %err, "one-shot collection failed");
            std::process::exit(1);
        }
        return;
    }

    info!(
        listen = %cfg.listen,
        collector = cfg.collector.enabled,
        interval = %humantime::format_duration(cfg.collector.interval),
        "starting netsnap"
    );

    let store = match &cfg.database {
        Some(path) => match Store::open(path).await {
            Ok(store) => Some(store),
            Err(err) => {
                error!(error = %err, path = %path.display(), "failed to open database");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let collector = if cfg.collector.enabled {
        let setup = build_collector(&cfg)
            .and_then(|collector| build_sink(&cfg, store.clone()).map(|sink| (collector, sink)));
        match setup {
            Ok(parts) => Some(parts),
            Err(err) => {
                error!(error = %err, "failed to set up collector");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to create metrics registry");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let store = store.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state, store);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP listener");
                    return;
                }
            };
            info!(%addr, "HTTP API listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server failed");
            }
        })
    };

    let collector_task = collector.map(|(collector, sink)| {
        let interval = cfg.collector.interval;
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("collector stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let outcome = collector.collect().await;
                        metrics.inc_collection();
                        for failure in &outcome.failures {
                            metrics.inc_probe_failure(failure.kind);
                        }

                        let delivery = sink.deliver(&outcome.snapshot, &metrics).await;

                        let (snapshot, events) = {
                            let mut guard = shared_state.write().await;
                            let events = guard.record_collection(&outcome, delivery, now_unix());
                            (guard.clone(), events)
                        };
                        metrics.update_from_state(&snapshot);

                        for event in events {
                            match event.kind {
                                HealthEventKind::Down => warn!(
                                    host = %event.hostname,
                                    failures = DOWN_THRESHOLD,
                                    "target is down"
                                ),
                                HealthEventKind::Recovered => {
                                    info!(host = %event.hostname, "target recovered")
                                }
                            }
                        }
                    }
                }
            }
        })
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    if let Some(task) = collector_task {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_collector(cfg: &Config) -> Result<Collector, StartupError> {
    let registry = TemplateRegistry::builtin();
    let library = TemplateLibrary::load(cfg.templates_dir.as_deref())?;
    library.check(&registry)?;

    let targets_file = cfg
        .collector
        .targets_file
        .as_ref()
        .ok_or(StartupError::NoTargets)?;
    let targets = catalog::load_catalog(targets_file, &registry)?;
    info!(
        targets = targets.len(),
        path = %targets_file.display(),
        "loaded target catalog"
    );

    let sessions = SshSessionFactory::new(cfg.collector.connect_timeout);
    let prober = Prober::new(Arc::new(sessions), Arc::new(library));

    Ok(Collector::new(
        prober,
        targets,
        cfg.collector.max_concurrency,
        cfg.collector.deadline,
    ))
}

/// A configured upload URL wins over the local database.
fn build_sink(cfg: &Config, store: Option<Store>) -> Result<Sink, StartupError> {
    if let Some(url) = &cfg.collector.upload_url {
        return Ok(Sink::Remote(Uploader::new(url, UPLOAD_TIMEOUT)?));
    }
    store.map(Sink::Local).ok_or(StartupError::NoDestination)
}

async fn run_once(cfg: &Config) -> Result<(), StartupError> {
    let collector = build_collector(cfg)?;
    let outcome = collector.collect().await;
    println!("{}", wire::to_json(&outcome.snapshot)?);
    Ok(())
}
