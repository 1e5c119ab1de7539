//! Catalog Cache
//!
//! Runs the lookup and slot allocation cache against a SQLite catalog and
//! exposes health, readiness and cache counters over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Catalog Cache                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Admin     │───▶│ CacheServer  │───▶│    SQLite    │       │
//! │  │    HTTP      │    │  (Arc, once) │    │   Executor   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use catalog_cache::adapters::SqliteExecutor;
use catalog_cache::cache::queries;
use catalog_cache::domain::QueryExecutor;
use catalog_cache::{CacheConfig, CacheServer, Error, ResortMode, Result, ServerCell};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Catalog Cache - lookup and slot allocation cache for the catalog database
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite database file
    #[arg(long, env = "CACHE_DATABASE", default_value = "catalog.db")]
    database: PathBuf,

    /// Database busy and startup ping timeout in seconds
    #[arg(long, env = "DB_TIMEOUT", default_value = "5")]
    db_timeout_secs: u64,

    /// Runtime worker threads (defaults to the number of cores)
    #[arg(long, env = "WORKER_THREADS")]
    worker_threads: Option<usize>,

    /// Verification request channel capacity
    #[arg(long, env = "REQUEST_BUFFER", default_value = "1")]
    request_buffer: usize,

    /// Rebuild the ordered product view on a background task
    #[arg(long, env = "BACKGROUND_RESORT")]
    background_resort: bool,

    /// Do not seed slot scopes at startup
    #[arg(long, env = "SKIP_WARM_UP")]
    skip_warm_up: bool,

    /// Create the catalog tables if they do not exist
    #[arg(long, env = "CREATE_SCHEMA")]
    create_schema: bool,

    /// Admin server bind address
    #[arg(long, env = "ADMIN_ADDR", default_value = "0.0.0.0:8081")]
    admin_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            request_buffer: self.request_buffer,
            resort_mode: if self.background_resort {
                ResortMode::Background
            } else {
                ResortMode::Synchronous
            },
            warm_up: !self.skip_warm_up,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = args.worker_threads {
        runtime.worker_threads(threads.max(1));
    }
    runtime.build()?.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    info!("Starting Catalog Cache");
    info!("  Database: {}", args.database.display());
    info!("  DB timeout: {} seconds", args.db_timeout_secs);
    info!("  Request buffer: {}", args.request_buffer);
    info!("  Background resort: {}", args.background_resort);
    info!("  Warm-up: {}", !args.skip_warm_up);

    let timeout = Duration::from_secs(args.db_timeout_secs);
    let executor = SqliteExecutor::open(&args.database, timeout).map_err(|e| {
        error!("Failed to open database: {}", e);
        e
    })?;

    match tokio::time::timeout(timeout, executor.ping()).await {
        Ok(Ok(())) => info!("Database connection healthy"),
        Ok(Err(e)) => {
            error!("Database ping failed: {}", e);
            error!("Continuing anyway - slot scopes will initialize on first access");
        }
        Err(_) => {
            error!("Database ping timed out after {:?}", timeout);
            error!("Continuing anyway - slot scopes will initialize on first access");
        }
    }

    if args.create_schema {
        for statement in queries::SCHEMA {
            executor.execute(statement, &[]).await?;
        }
        info!("Catalog schema ensured");
    }

    let cell = ServerCell::new();
    let server = cell.get_or_start(args.cache_config(), move || {
        Arc::new(executor) as Arc<dyn QueryExecutor>
    });

    // Start admin server
    let admin_addr = args.admin_addr.clone();
    let admin_server = server.clone();
    let admin = tokio::spawn(async move {
        if let Err(e) = run_admin_server(&admin_addr, admin_server).await {
            error!("Admin server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    admin.abort();
    server.shutdown().await;

    info!("Catalog cache shutdown complete");
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
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
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
// Admin Server
// =============================================================================

struct AdminState {
    server: Arc<CacheServer>,
    registry: prometheus::Registry,
    events: prometheus::IntGaugeVec,
    hit_ratio: prometheus::Gauge,
}

async fn run_admin_server(addr: &str, server: Arc<CacheServer>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use prometheus::{Gauge, IntGaugeVec, Opts, Registry};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let registry = Registry::new();
    let events = IntGaugeVec::new(
        Opts::new("catalog_cache_events", "Cache events since start"),
        &["event"],
    )
    .map_err(|e| Error::Internal(format!("Failed to create metric: {}", e)))?;
    let hit_ratio = Gauge::new("catalog_cache_hit_ratio", "Verification cache hit ratio")
        .map_err(|e| Error::Internal(format!("Failed to create metric: {}", e)))?;
    registry
        .register(Box::new(events.clone()))
        .and_then(|_| registry.register(Box::new(hit_ratio.clone())))
        .map_err(|e| Error::Internal(format!("Failed to register metric: {}", e)))?;

    let state = Arc::new(AdminState {
        server,
        registry,
        events,
        hit_ratio,
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid admin server address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;

    info!("Admin server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| admin_handler(state.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Admin server connection error: {}", e);
            }
        });
    }
}

async fn admin_handler(
    state: Arc<AdminState>,
    req: hyper::Request<hyper::body::Incoming>,
) -> std::result::Result<hyper::Response<http_body_util::Full<hyper::body::Bytes>>, std::convert::Infallible>
{
    use hyper::StatusCode;
    use prometheus::{Encoder, TextEncoder};

    let response = match req.uri().path() {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" => {
            if state.server.is_ready().await {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        "/metrics" => {
            let stats = state.server.stats();
            for (event, count) in stats.counters() {
                state
                    .events
                    .with_label_values(&[event])
                    .set(i64::try_from(count).unwrap_or(i64::MAX));
            }
            state.hit_ratio.set(stats.hit_ratio);

            let mut buffer = Vec::new();
            match TextEncoder::new().encode(&state.registry.gather(), &mut buffer) {
                Ok(()) => body(StatusCode::OK, prometheus::TEXT_FORMAT, buffer),
                Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        "/stats" => match serde_json::to_vec(&state.server.stats()) {
            Ok(json) => body(StatusCode::OK, "application/json", json),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn text(
    status: hyper::StatusCode,
    message: &str,
) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    body(status, "text/plain", message.as_bytes().to_vec())
}

fn body(
    status: hyper::StatusCode,
    content_type: &'static str,
    bytes: Vec<u8>,
) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};

    let mut response = hyper::Response::new(http_body_util::Full::new(hyper::body::Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
