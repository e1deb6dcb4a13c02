//! HTTP server setup and handlers.
//!
//! # Routes
//! - `GET /health`: liveness plus the active config generation
//! - `GET /health/breakers`: local circuit breaker states
//! - `GET /health/cluster`: breaker health reported by every live instance
//! - `GET /accounts/{account_id}`: one account from the local store
//!
//! Every matched request is timed, counted in metrics and exported as a span.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::{
    body::Body,
    extract::{MatchedPath, Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ConfigHolder;
use crate::observability::{metrics, SpanExporter};
use crate::resilience::{BreakerHealthHandler, CircuitBreakerRegistry};
use crate::storage::{StorageClient, StorageError};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigHolder,
    pub storage: Arc<StorageClient>,
    pub registry: Arc<CircuitBreakerRegistry>,
    pub peers: Arc<BreakerHealthHandler>,
    pub tracer: SpanExporter,
}

pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState, request_timeout: Duration) -> Self {
        Self {
            router: Self::build_router(state, request_timeout),
        }
    }

    fn build_router(state: AppState, request_timeout: Duration) -> Router {
        let routes = Router::new()
            .route("/health", get(health))
            .route("/health/breakers", get(breakers))
            .route("/health/cluster", get(cluster))
            .route("/accounts/{account_id}", get(get_account))
            .route_layer(middleware::from_fn_with_state(state.clone(), record_span))
            .with_state(state);
        with_outer_layers(routes, request_timeout)
    }

    /// The router, for in-process requests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until the stop broadcast fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Request tracing plus a deadline answered with 408.
fn with_outer_layers(router: Router, request_timeout: Duration) -> Router {
    router
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
}

async fn record_span(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let started_at = SystemTime::now();
    let start = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    let status = response.status().as_u16();

    metrics::record_request(&method, &route, status, start);

    let mut tags = BTreeMap::new();
    tags.insert("http.method".to_string(), method.clone());
    tags.insert("http.path".to_string(), path);
    tags.insert("http.status_code".to_string(), status.to_string());
    state
        .tracer
        .record(&format!("{method} {route}"), started_at, start.elapsed(), tags);

    response
}

async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state.config.current();
    let (code, status) = if state.storage.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "DOWN")
    } else {
        (StatusCode::OK, "UP")
    };
    let body = json!({
        "status": status,
        "service": snapshot.identity().app_name,
        "profile": snapshot.identity().profile,
        "config_version": snapshot.version(),
        "config_generation": snapshot.generation(),
    });
    (code, Json(body)).into_response()
}

async fn breakers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.health())
}

async fn cluster(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.peers.peers())
}

async fn get_account(State(state): State<AppState>, Path(account_id): Path<String>) -> Response {
    match state.storage.query_account(&account_id) {
        Ok(account) => Json(account).into_response(),
        Err(StorageError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "account not found" }))).into_response()
        }
        Err(e) => {
            tracing::warn!(account_id = %account_id, error = %e, "Account lookup failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
