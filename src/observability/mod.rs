//! Observability module for Karst.
//!
//! Provides logging initialization, metric registration, and the
//! Prometheus metrics endpoint.

use crate::config::ObservabilityConfig;
use crate::error::{KarstError, Result};
use crate::raft::RaftNodeState;
use crate::types::Term;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| KarstError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| KarstError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| KarstError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| KarstError::Internal(e.to_string()))?;

    Ok(())
}

/// Register standard metrics.
fn register_metrics() {
    // Election metrics
    gauge!("karst_raft_term").set(0.0);
    gauge!("karst_raft_is_leader").set(0.0);
    counter!("karst_raft_broadcasts_total").absolute(0);
    counter!("karst_election_fencing_total").absolute(0);

    // Replication metrics
    gauge!("karst_replication_registered_replicas").set(0.0);
    gauge!("karst_replication_healthy_replicas").set(0.0);

    // Journal metrics
    counter!("karst_journal_rows_total").absolute(0);
}

/// Update election metrics after a Raft state change.
pub fn update_election_metrics(term: Term, state: RaftNodeState) {
    gauge!("karst_raft_term").set(term as f64);
    gauge!("karst_raft_is_leader").set(if state.is_leader() { 1.0 } else { 0.0 });
}

/// Record an outbound Raft broadcast.
pub fn record_raft_broadcast() {
    counter!("karst_raft_broadcasts_total").increment(1);
}

/// Record a leader fencing event.
pub fn record_fencing() {
    counter!("karst_election_fencing_total").increment(1);
}

/// Update replica-set metrics.
pub fn update_replication_metrics(registered: usize, healthy: usize) {
    gauge!("karst_replication_registered_replicas").set(registered as f64);
    gauge!("karst_replication_healthy_replicas").set(healthy as f64);
}
