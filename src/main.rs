//! Replistor
//!
//! Replicated block storage orchestrator. The `controller` subcommand runs
//! the controller together with the satellites configured for it; the
//! `satellite` subcommand runs a standalone satellite.

use clap::{Args, Parser, Subcommand, ValueEnum};
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

use replistor::domain::{
    ApiCallRc, ConnectionStatus, DatabaseType, Node, NodeName, PermissiveAccessControl, Resource,
    StorPool,
};
use replistor::{
    create_engine, CapacityAutoplacer, ControllerConfig, CoreObjects, CtrlResourceCreator,
    DatabaseLoader, DeviceDispatcher, DispatchMetrics, DrbdLayer, Error, LayerRegistry, LuksLayer,
    PeerSatelliteUpdater, ReconcileMetrics, ReconcileScheduler, ReplicaReconciler, Result,
    SatelliteConfig, SatelliteService, StackExpander, StorageLayer, TopologyEvent,
};

/// Buffered messages per satellite channel
const SATELLITE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Replistor - Replicated Block Storage Orchestrator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Health server bind address
    #[arg(long, global = true, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, global = true, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller and its configured satellites
    Controller(ControllerArgs),
    /// Run a standalone satellite
    Satellite(SatelliteArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// YAML configuration file
    #[arg(long, env = "REPLISTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between reconcile cycles
    #[arg(long, env = "RECONCILE_INTERVAL")]
    reconcile_interval_secs: Option<u64>,

    /// Database engine
    #[arg(long, env = "DATABASE", value_enum)]
    database: Option<DatabaseArg>,

    /// Seconds to wait for satellite acknowledgements
    #[arg(long, env = "SATELLITE_TIMEOUT")]
    satellite_timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct SatelliteArgs {
    /// YAML configuration file
    #[arg(long, env = "REPLISTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Name of this node
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// JSON file with resources applied as a full sync on startup
    #[arg(long)]
    resources: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DatabaseArg {
    Memory,
    Kv,
}

impl From<DatabaseArg> for DatabaseType {
    fn from(arg: DatabaseArg) -> Self {
        match arg {
            DatabaseArg::Memory => DatabaseType::Memory,
            DatabaseArg::Kv => DatabaseType::Kv,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.common)?;

    info!("Starting Replistor");
    info!("  Version: {}", replistor::VERSION);
    info!("  Health: {}", cli.common.health_addr);
    info!("  Metrics: {}", cli.common.metrics_addr);

    let ready = Arc::new(AtomicBool::new(false));
    let reconcile_metrics = Arc::new(ReconcileMetrics::new());
    let dispatch_metrics = Arc::new(DispatchMetrics::new());
    let exporter = Arc::new(MetricsExporter::new(
        reconcile_metrics.clone(),
        dispatch_metrics.clone(),
    )?);

    let health_addr = cli.common.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = cli.common.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    match cli.command {
        Command::Controller(args) => {
            run_controller(args, reconcile_metrics, dispatch_metrics, ready, cancel).await?
        }
        Command::Satellite(args) => run_satellite(args, dispatch_metrics, ready, cancel).await?,
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Controller
// =============================================================================

async fn run_controller(
    args: ControllerArgs,
    reconcile_metrics: Arc<ReconcileMetrics>,
    dispatch_metrics: Arc<DispatchMetrics>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(secs) = args.reconcile_interval_secs {
        config.reconcile_interval_secs = secs;
    }
    if let Some(database) = args.database {
        config.database = database.into();
    }
    if let Some(secs) = args.satellite_timeout_secs {
        config.satellite_timeout_secs = secs;
    }
    config.validate()?;

    info!("  Database: {}", config.database);
    info!("  Reconcile interval: {:?}", config.reconcile_interval());
    info!("  Satellites: {}", config.satellites.len());

    let engine = create_engine(config.database);
    let core = Arc::new(CoreObjects::new(engine.clone()));
    let summary = DatabaseLoader::new(engine).load_all(&core).await?;
    info!(
        nodes = summary.nodes,
        resource_definitions = summary.resource_definitions,
        resources = summary.resources,
        "Database loaded"
    );

    let updater = Arc::new(PeerSatelliteUpdater::new(core.clone(), config.satellite_timeout()));
    let autoplacer = Arc::new(CapacityAutoplacer::new(core.clone()));
    let creator = Arc::new(CtrlResourceCreator::new(core.clone(), updater.clone()));
    let reconciler = Arc::new(ReplicaReconciler::new(
        core.clone(),
        Arc::new(PermissiveAccessControl),
        autoplacer,
        creator,
        updater.clone(),
        reconcile_metrics.clone(),
    ));
    let scheduler = Arc::new(ReconcileScheduler::new(
        core.clone(),
        reconciler,
        config.reconcile_interval(),
        config.event_capacity,
        reconcile_metrics,
    ));

    let mut satellites = Vec::with_capacity(config.satellites.len());
    for satellite in &config.satellites {
        satellites.push(
            attach_satellite(&core, &updater, satellite, dispatch_metrics.clone(), &cancel).await?,
        );
    }

    // Replicas on nodes evicted before the restart still need replacing
    let evicted: Vec<NodeName> = core
        .node_map
        .read()
        .await
        .values()
        .filter(|node| node.is_evicted())
        .map(|node| node.name.clone())
        .collect();
    for node in evicted {
        let marked = scheduler.handle_event(&TopologyEvent::NodeEvicted { node: node.clone() }).await;
        info!(node = %node, marked, "Requeued resources of evicted node");
    }

    ready.store(true, Ordering::Release);
    info!("Controller ready");
    scheduler.run(cancel).await;

    let mut result = Ok(());
    for handle in satellites {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Satellite aborted: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
            Err(e) => warn!("Satellite task failed: {}", e),
        }
    }
    result
}

/// Register a configured satellite with the controller and complete its
/// full sync
async fn attach_satellite(
    core: &Arc<CoreObjects>,
    updater: &PeerSatelliteUpdater,
    config: &SatelliteConfig,
    metrics: Arc<DispatchMetrics>,
    cancel: &CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let service = Arc::new(build_satellite(config, metrics)?);
    let node_name = service.node_name().clone();

    let known = core.node_map.read().await.contains_key(&node_name);
    if !known {
        core.create_node(Node::new(node_name.clone())).await?;
    }
    for (pool_name, provider, capacity) in config.storage_pools()? {
        let key = (node_name.clone(), pool_name.clone());
        let known = core.stor_pool_map.read().await.contains_key(&key);
        if !known {
            core.create_stor_pool(StorPool::new(pool_name, node_name.clone(), provider, capacity))
                .await?;
        }
    }

    let (sender, receiver) = mpsc::channel(SATELLITE_CHANNEL_CAPACITY);
    updater.register_peer(node_name.clone(), sender);
    // a satellite defect takes the whole process down
    let shutdown = cancel.clone();
    let handle = tokio::spawn(async move {
        let result = service.run(receiver, shutdown.clone()).await;
        if result.is_err() {
            shutdown.cancel();
        }
        result
    });
    core.set_connection_status(&node_name, ConnectionStatus::Connected).await?;

    let responses = updater.full_sync(&node_name).await?;
    log_responses(&node_name, &responses);
    info!(node = %node_name, "Satellite attached");
    Ok(handle)
}

// =============================================================================
// Satellite
// =============================================================================

async fn run_satellite(
    args: SatelliteArgs,
    metrics: Arc<DispatchMetrics>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SatelliteConfig::load(path)?,
        None => SatelliteConfig::default(),
    };
    if let Some(node_name) = args.node_name {
        config.node_name = node_name;
    }
    config.validate()?;

    info!("  Node: {}", config.node_name);
    info!("  Default layer stack: {:?}", config.default_layer_stack);

    let service = build_satellite(&config, metrics)?;
    if let Some(path) = &args.resources {
        let content = std::fs::read_to_string(path)?;
        let resources: Vec<Resource> = serde_json::from_str(&content)?;
        info!(resources = resources.len(), "Applying startup resources");
        let responses = service.apply(&resources, &[], true).await?;
        log_responses(service.node_name(), &responses);
    }

    ready.store(true, Ordering::Release);
    info!("Satellite ready");
    cancel.cancelled().await;
    Ok(())
}

fn build_satellite(config: &SatelliteConfig, metrics: Arc<DispatchMetrics>) -> Result<SatelliteService> {
    let pools = config
        .storage_pools()?
        .into_iter()
        .map(|(name, _, capacity)| (name, capacity));
    let registry = LayerRegistry::new()
        .with(Arc::new(DrbdLayer::new()))
        .with(Arc::new(LuksLayer::new()))
        .with(Arc::new(StorageLayer::new(pools)));
    let expander = StackExpander::new().with_legacy_stack(config.default_layer_stack.clone());
    let dispatcher = DeviceDispatcher::new(Arc::new(registry), Arc::new(expander), metrics);
    Ok(SatelliteService::new(config.node_name()?, Arc::new(dispatcher)))
}

fn log_responses(node: &NodeName, responses: &ApiCallRc) {
    for entry in responses.iter() {
        if entry.is_error() {
            warn!(node = %node, code = entry.return_code, cause = ?entry.cause, "{}", entry.message);
        } else {
            info!(node = %node, "{}", entry.message);
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &CommonArgs) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let hyper_directive = "hyper=warn"
        .parse::<Directive>()
        .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(hyper_directive);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Acquire);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse()?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Publishes the core counters as prometheus gauges
struct MetricsExporter {
    registry: Registry,
    reconcile: Arc<ReconcileMetrics>,
    dispatch: Arc<DispatchMetrics>,
    reconcile_gauges: IntGaugeVec,
    dispatch_gauges: IntGaugeVec,
}

impl MetricsExporter {
    fn new(reconcile: Arc<ReconcileMetrics>, dispatch: Arc<DispatchMetrics>) -> Result<Self> {
        let metrics_error = |e: prometheus::Error| Error::Internal(format!("Metrics setup failed: {}", e));

        let registry = Registry::new();
        let reconcile_gauges = IntGaugeVec::new(
            Opts::new("replistor_reconcile_events", "Replica reconciler counters"),
            &["event"],
        )
        .map_err(metrics_error)?;
        let dispatch_gauges = IntGaugeVec::new(
            Opts::new("replistor_dispatch_events", "Device layer dispatcher counters"),
            &["event"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(reconcile_gauges.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(dispatch_gauges.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            reconcile,
            dispatch,
            reconcile_gauges,
            dispatch_gauges,
        })
    }

    fn render(&self) -> Result<Vec<u8>> {
        let reconcile = self.reconcile.snapshot();
        for (event, value) in [
            ("manage_calls", reconcile.manage_calls),
            ("converged", reconcile.converged),
            ("scheduled", reconcile.scheduled),
            ("retry_later", reconcile.retry_later),
            ("needs_diskful", reconcile.needs_diskful),
            ("placement_failures", reconcile.placement_failures),
        ] {
            self.reconcile_gauges.with_label_values(&[event]).set(value as i64);
        }

        let dispatch = self.dispatch.snapshot();
        for (event, value) in [
            ("batches", dispatch.batches),
            ("resources_processed", dispatch.resources_processed),
            ("resource_failures", dispatch.resource_failures),
            ("prepare_failures", dispatch.prepare_failures),
            ("cleanup_failures", dispatch.cleanup_failures),
            ("fatal_errors", dispatch.fatal_errors),
        ] {
            self.dispatch_gauges.with_label_values(&[event]).set(value as i64);
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Metrics encoding failed: {}", e)))?;
        Ok(buffer)
    }
}

async fn run_metrics_server(addr: &str, exporter: Arc<MetricsExporter>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let exporter = exporter.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let exporter = exporter.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match exporter.render() {
                            Ok(buffer) => {
                                let mut response = Response::new(Body::from(buffer));
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static(prometheus::TEXT_FORMAT),
                                );
                                response
                            }
                            Err(e) => {
                                error!("{}", e);
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse()?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
