//! HTTP server setup and request routing.
//!
//! Axum router with timeout and trace layers plus graceful shutdown on
//! SIGINT/SIGTERM. Routes are project-scoped; the delivery surface is:
//!
//! ```text
//! POST /projects/{project_id}/events
//! POST /projects/{project_id}/events/fanout
//! GET  /projects/{project_id}/events
//! GET  /projects/{project_id}/events/count
//! GET  /projects/{project_id}/events/{event_id}
//! POST /projects/{project_id}/events/{event_id}/replay
//! POST /projects/{project_id}/events/batchreplay
//! GET  /projects/{project_id}/eventdeliveries
//! GET  /projects/{project_id}/eventdeliveries/count
//! GET  /projects/{project_id}/eventdeliveries/{delivery_id}
//! POST /projects/{project_id}/eventdeliveries/{delivery_id}/resend
//! GET  /projects/{project_id}/eventdeliveries/{delivery_id}/deliveryattempts
//! POST /projects/{project_id}/eventdeliveries/forceresend
//! POST /projects/{project_id}/eventdeliveries/batchretry
//! ```

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{config::Config, handlers, AppState};

/// Creates the router with all routes and middleware.
pub fn create_router(state: AppState, config: &Config) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .with_state(state.clone());

    let event_routes = Router::new()
        .route(
            "/projects/{project_id}/events",
            post(handlers::create_event).get(handlers::list_events),
        )
        .route("/projects/{project_id}/events/fanout", post(handlers::create_fanout_event))
        .route("/projects/{project_id}/events/count", get(handlers::count_events))
        .route("/projects/{project_id}/events/batchreplay", post(handlers::batch_replay_events))
        .route("/projects/{project_id}/events/{event_id}", get(handlers::get_event))
        .route("/projects/{project_id}/events/{event_id}/replay", post(handlers::replay_event))
        .with_state(state.clone());

    let delivery_routes = Router::new()
        .route("/projects/{project_id}/eventdeliveries", get(handlers::list_deliveries))
        .route("/projects/{project_id}/eventdeliveries/count", get(handlers::count_deliveries))
        .route(
            "/projects/{project_id}/eventdeliveries/forceresend",
            post(handlers::force_resend_deliveries),
        )
        .route(
            "/projects/{project_id}/eventdeliveries/batchretry",
            post(handlers::batch_retry_deliveries),
        )
        .route(
            "/projects/{project_id}/eventdeliveries/{delivery_id}",
            get(handlers::get_delivery),
        )
        .route(
            "/projects/{project_id}/eventdeliveries/{delivery_id}/resend",
            post(handlers::resend_delivery),
        )
        .route(
            "/projects/{project_id}/eventdeliveries/{delivery_id}/deliveryattempts",
            get(handlers::list_delivery_attempts),
        )
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .merge(event_routes)
        .merge(delivery_routes)
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout)))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
}

/// Adds an `X-Request-Id` header for cross-service tracing.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }
    response
}

/// Starts the HTTP server with graceful shutdown support.
///
/// # Errors
///
/// Returns an error when the port cannot be bound or the server fails.
pub async fn start_server(
    state: AppState,
    config: &Config,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state, config);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => tracing::error!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
        () = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}
