// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod error;
mod infrastructure;
mod presentation;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::application::formula_service::FormulaService;
use crate::application::series_service::SeriesService;
use crate::infrastructure::config::load_settings;
use crate::infrastructure::expression::SandboxEvaluator;
use crate::infrastructure::postgres_repository::PostgresRepository;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    compute_formula, get_computed_series, get_formula_chain, get_series, health_check,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration
    let settings = load_settings()?;

    // Create repository and evaluator (infrastructure layer)
    let repository = Arc::new(PostgresRepository::connect_lazy(
        &settings.database.url,
        settings.database.max_connections,
    )?);
    let evaluator = Arc::new(SandboxEvaluator::new(settings.evaluator.step_budget_ms));

    // Create services (application layer)
    let series_service = SeriesService::new(repository.clone(), settings.planner.clone());
    let formula_service = FormulaService::new(
        repository,
        evaluator,
        settings.planner.compute_batch_width,
    );

    // Create application state
    let state = Arc::new(AppState {
        series_service,
        formula_service,
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/series", get(get_series))
        .route("/series/computed", get(get_computed_series))
        .route("/formulas/chain", get(get_formula_chain))
        .route("/formulas/compute", post(compute_formula))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = settings.server.bind.parse()?;
    tracing::info!("starting farm-telemetry service on {addr}");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router).await?;

    Ok(())
}
