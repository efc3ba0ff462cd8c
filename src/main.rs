//! Console Orchestrator
//!
//! Serves snapshot orchestration and node maintenance for an application
//! console running inside a Kubernetes cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         REST API (axum)                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                           Orchestrator                               │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌───────────────────┐  │
//! │  │    Snapshot      │  │   Backup Spec    │  │   Node Drain /    │  │
//! │  │   Reconciler     │  │    Renderer      │  │      Purge        │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └─────────┬─────────┘  │
//! │           └─────────────────────┼──────────────────────┘            │
//! │                   ┌─────────────┴─────────────┐                     │
//! │                   │  Backup controller client │                     │
//! │                   │  + download-request loop  │                     │
//! │                   └───────────────────────────┘                     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │             Cluster API (kube)  │  Signed URLs (reqwest)            │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use console_orchestrator::cluster::{
    FileAppStore, HttpBlobFetcher, IdentityRenderer, KubeCluster, TokioSleeper,
};
use console_orchestrator::{
    Adapters, ApiServer, ApiServerConfig, Error, Metrics, Orchestrator, OrchestratorConfig,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Console Orchestrator - snapshots and node maintenance for the application console
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Namespace the backup controller runs in
    #[arg(long, env = "VELERO_NAMESPACE", default_value = "velero")]
    velero_namespace: String,

    /// Namespace the console itself runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    own_namespace: String,

    /// Backup storage locations to use, most preferred first
    #[arg(
        long,
        env = "STORAGE_LOCATIONS",
        value_delimiter = ',',
        default_value = "default,local-ceph-rgw"
    )]
    storage_locations: Vec<String>,

    /// REST API URL scheduled snapshot jobs call, as seen from inside the cluster
    #[arg(long, env = "SCHEDULE_API_URL", default_value = "http://console-orchestrator:8090")]
    schedule_api_url: String,

    /// Deployment (and container) whose image scheduled snapshot jobs run
    #[arg(long, env = "OWN_DEPLOYMENT", default_value = "console-orchestrator")]
    own_deployment: String,

    /// YAML file listing the installed applications
    #[arg(long, env = "APPS_FILE", default_value = "/etc/console/apps.yaml")]
    apps_file: String,

    /// Timeout for a single cluster call, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "30")]
    request_timeout_secs: u64,

    /// Interval between download-request polls, in milliseconds
    #[arg(long, env = "DOWNLOAD_POLL_INTERVAL_MS", default_value = "1000")]
    download_poll_interval_ms: u64,

    /// Download-request polls before giving up
    #[arg(long, env = "DOWNLOAD_MAX_ATTEMPTS", default_value = "30")]
    download_max_attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Console Orchestrator");
    info!("  Version: {}", console_orchestrator::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Backup controller namespace: {}", args.velero_namespace);
    info!("  Storage locations: {}", args.storage_locations.join(","));

    let timeout = Duration::from_secs(args.request_timeout_secs);

    // Cluster credentials are loaded once and injected everywhere
    let client = kube::Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(client).with_timeout(timeout));

    let apps = FileAppStore::load(&args.apps_file).await?;
    let adapters = Adapters {
        cluster,
        fetcher: Arc::new(HttpBlobFetcher::new(timeout)?),
        sleeper: Arc::new(TokioSleeper),
        apps: Arc::new(apps),
        templates: Arc::new(IdentityRenderer),
    };

    let mut config = OrchestratorConfig {
        velero_namespace: args.velero_namespace.clone(),
        ..Default::default()
    };
    config.renderer.own_namespace = args.own_namespace.clone();
    config.renderer.storage_preferences = args.storage_locations.clone();
    config.schedule.own_namespace = args.own_namespace.clone();
    config.schedule.api_url = args.schedule_api_url.clone();
    config.schedule.image_deployment = args.own_deployment.clone();
    config.schedule.image_container = args.own_deployment.clone();
    config.download.poll_interval = Duration::from_millis(args.download_poll_interval_ms);
    config.download.max_attempts = args.download_max_attempts;

    let metrics = Metrics::new()?;
    let orchestrator = Orchestrator::new(config, adapters, metrics.clone());
    info!("Orchestrator initialized");

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid REST API address: {}", e))
        })?,
    };
    let api_server = Arc::new(ApiServer::new(api_config, orchestrator));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_server.shutdown(),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });

    api_server.run().await?;

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

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
}

// =============================================================================
// Health Server
// =============================================================================

fn plain(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => plain(StatusCode::OK, "ok"),
                _ => plain(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

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

async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.render() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = content_type.parse() {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to render metrics: {}", e);
                                plain(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                            }
                        },
                        _ => plain(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
