mod client_log;
mod config;
mod handlers;
mod models;
mod store;
mod trace;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post, routing::put};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use client_log::ClientLog;
use config::{Cli, EngineConfig};
use store::DataStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DataStore>,
    pub engine: Arc<EngineConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "traverse_api={},tower_http=info",
                cli.log_level
            ))
        }))
        .init();

    let engine = Arc::new(EngineConfig::load(&cli.config)?);
    let store = Arc::new(DataStore::new(&cli.db_dir, cli.debug)?);
    store.load(&ClientLog::console()).await?;
    tracing::info!("data store opened at {}", cli.db_dir.display());

    let state = AppState {
        store,
        engine,
    };

    let app = Router::new()
        // Dataset lifecycle
        .route(
            "/datasets",
            get(handlers::datasets::list_datasets).post(handlers::datasets::create_dataset),
        )
        .route(
            "/datasets/{datasetId}",
            get(handlers::datasets::get_dataset).delete(handlers::datasets::delete_dataset),
        )
        .route(
            "/datasets/{datasetId}/info",
            put(handlers::datasets::update_info),
        )
        .route("/tags/{tag}", post(handlers::datasets::add_tag_to_all))
        // Source uploads
        .route(
            "/datasets/{datasetId}/otf2",
            post(handlers::sources::add_otf2_trace),
        )
        .route(
            "/datasets/{datasetId}/newick",
            post(handlers::sources::add_newick_tree),
        )
        .route(
            "/datasets/{datasetId}/csv",
            post(handlers::sources::add_performance_csv),
        )
        .route(
            "/datasets/{datasetId}/dot",
            post(handlers::sources::add_dot_graph),
        )
        .route(
            "/datasets/{datasetId}/log",
            post(handlers::sources::add_full_log),
        )
        .route(
            "/datasets/{datasetId}/tree",
            get(handlers::datasets::get_tree).post(handlers::sources::add_newick_tree),
        )
        .route(
            "/datasets/{datasetId}/physl",
            get(handlers::datasets::get_physl).post(handlers::sources::add_physl),
        )
        .route(
            "/datasets/{datasetId}/python",
            get(handlers::datasets::get_python).post(handlers::sources::add_python),
        )
        .route(
            "/datasets/{datasetId}/cpp",
            get(handlers::datasets::get_cpp).post(handlers::sources::add_cpp),
        )
        // Primitives
        .route(
            "/datasets/{datasetId}/primitives",
            get(handlers::primitives::get_primitives),
        )
        .route(
            "/datasets/{datasetId}/primitives/primitiveTraceForward",
            get(handlers::intervals::primitive_trace_forward),
        )
        .route(
            "/datasets/{datasetId}/primitives/{primitive}",
            get(handlers::primitives::get_primitive),
        )
        .route(
            "/datasets/{datasetId}/primitives/{primitive}/utilization",
            get(handlers::primitives::primitive_utilization),
        )
        .route(
            "/datasets/{datasetId}/primitives/{primitive}/intervalHistogram",
            get(handlers::primitives::interval_histogram),
        )
        // Intervals
        .route(
            "/datasets/{datasetId}/intervals",
            get(handlers::intervals::get_intervals),
        )
        .route(
            "/datasets/{datasetId}/intervals/{intervalId}",
            get(handlers::intervals::get_interval),
        )
        .route(
            "/datasets/{datasetId}/intervals/{intervalId}/trace",
            get(handlers::intervals::interval_trace),
        )
        .route(
            "/datasets/{datasetId}/getDependencyTree",
            get(handlers::intervals::get_dependency_tree),
        )
        // Metrics
        .route(
            "/datasets/{datasetId}/metrics",
            get(handlers::metrics::get_metric_list),
        )
        .route(
            "/datasets/{datasetId}/metrics/{metric}",
            get(handlers::metrics::get_metric_values),
        )
        .route(
            "/datasets/{datasetId}/metrics/{metric}/summary",
            get(handlers::metrics::metric_summary),
        )
        .route(
            "/datasets/{datasetId}/utilizationHistogram",
            get(handlers::metrics::utilization_histogram),
        )
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.resolved_port()));
    tracing::info!("traverse-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
