use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::engine::{EngineSettings, QuotaEngine};
use crate::exceptions::ExceptionStore;
use crate::handlers::{
    check_request, create_exception, current_overage, dashboard, get_exception, health_check,
    list_exceptions, release_slot, revoke_exception, run_expiry_sweep, run_retention_sweep,
    subject_status, top_consumers, update_subscription, AppState, SharedState,
};
use crate::maintenance::MaintenanceSweeps;
use crate::overage::OverageCalculator;
use crate::resolver::QuotaLimitResolver;
use crate::status::StatusReporter;
use crate::tiers::SubscriptionStore;
use crate::usage::UsageTracker;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Wires the stores, resolver, and engine together from a config.
pub fn build_state(config: Config) -> SharedState {
    build_state_with_clock(config, Arc::new(SystemClock))
}

pub fn build_state_with_clock(config: Config, clock: SharedClock) -> SharedState {
    let subscriptions = Arc::new(SubscriptionStore::new(Arc::clone(&clock)));
    let exceptions = Arc::new(ExceptionStore::new(Arc::clone(&clock)));
    let usage = Arc::new(UsageTracker::new(
        Arc::clone(&clock),
        config.max_request_duration_secs,
    ));
    let resolver = Arc::new(QuotaLimitResolver::new(
        Arc::clone(&clock),
        Arc::clone(&subscriptions),
        Arc::clone(&exceptions),
        Arc::clone(&usage),
        config.limits_cache_ttl_secs,
    ));

    let engine = QuotaEngine::new(
        Arc::clone(&subscriptions),
        Arc::clone(&exceptions),
        Arc::clone(&usage),
        Arc::clone(&resolver),
        EngineSettings {
            overage_billing_enabled: config.overage_billing_enabled,
        },
    );
    let reporter = StatusReporter::new(
        Arc::clone(&subscriptions),
        Arc::clone(&resolver),
        Arc::clone(&usage),
    );
    let overage = OverageCalculator::new(subscriptions, Arc::clone(&resolver), Arc::clone(&usage));
    let sweeps = MaintenanceSweeps::new(usage, exceptions, resolver);

    Arc::new(AppState {
        engine,
        reporter,
        overage,
        sweeps,
        config,
    })
}

/// Builds the router over a shared state. Split out so tests can drive the
/// app without binding a socket.
pub fn create_app(state: SharedState) -> Router {
    Router::new()
        // Request path
        .route("/subjects/:subject_id/check", post(check_request))
        .route("/subjects/:subject_id/release", post(release_slot))
        .route("/subjects/:subject_id/status", get(subject_status))
        .route("/subjects/:subject_id/overage", get(current_overage))
        .route("/subjects/:subject_id/subscription", put(update_subscription))
        // Admin: exceptions
        .route("/exceptions", post(create_exception).get(list_exceptions))
        .route("/exceptions/:id", get(get_exception))
        .route("/exceptions/:id/revoke", post(revoke_exception))
        // Reporting
        .route("/stats/top-consumers", get(top_consumers))
        .route("/stats/dashboard", get(dashboard))
        // Maintenance triggers
        .route("/maintenance/retention", post(run_retention_sweep))
        .route("/maintenance/expiry", post(run_expiry_sweep))
        // Health
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

pub struct Server {
    state: SharedState,
    app: Router,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let state = build_state(config);
        let app = create_app(Arc::clone(&state));
        Self { state, app }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let bind_addr = self.state.config.bind_addr;
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;

        spawn_sweep_tasks(Arc::clone(&self.state));

        tracing::info!("quotaguard server starting on {}", bind_addr);
        tracing::info!("Health check available at /health");

        // Run server with graceful shutdown
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

/// Background maintenance: periodic usage retention and exception expiry.
fn spawn_sweep_tasks(state: SharedState) {
    let retention_state = Arc::clone(&state);
    let retention_interval = state.config.retention_sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(retention_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            let retention_days = retention_state.config.usage_retention_days;
            retention_state.sweeps.run_retention(retention_days, false);
        }
    });

    let expiry_state = state;
    let expiry_interval = expiry_state.config.expiry_sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(expiry_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            expiry_state.sweeps.run_expiry(false, false);
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
