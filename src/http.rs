use crate::{
    config::Config,
    dispatch::Dispatcher,
    metrics::{
        METRICS_HANDLE,
        http::{http_request_timer, record_http_request},
    },
    schema,
};
use anyhow::Context;
use axum::{
    Router,
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    response::IntoResponse,
    routing::{get, post},
};
use hyper::StatusCode;
use std::{net::SocketAddr, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }
}

/// Creates an Axum Web Server and serves until a shutdown signal arrives
pub async fn create_server(config: Config, state: AppState) -> anyhow::Result<()> {
    tracing::info!("Starting the web server");

    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .context("Unable to parse address")?;

    let handle = axum_server::Handle::new();
    crate::signal_handler(handle.clone());

    tracing::info!("Listening on {}", addr);

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

/// Create the router for the application
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/alive", get(alive))
        .route("/metrics", get(metrics))
        .route("/ntfy_alert", post(ntfy_alert))
        .with_state(state)
}

/// This is the handler for the /alive path
async fn alive() -> StatusCode {
    let _timer = http_request_timer("/alive");
    record_http_request("/alive", StatusCode::OK.as_u16());

    StatusCode::OK
}

/// This is the handler for the /metrics path
#[tracing::instrument]
async fn metrics() -> impl IntoResponse {
    let _timer = http_request_timer("/metrics");

    let response = match METRICS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get the metrics handle".to_string(),
        ),
    };

    record_http_request("/metrics", response.0.as_u16());
    response
}

/// This is the handler for the /ntfy_alert path.
///
/// The query string carries the extraction mapping, the body an Alertmanager webhook
/// batch. Only request-level problems change the status; alerts that fail on their
/// own are logged and counted, the caller still gets a 200.
#[tracing::instrument(skip_all)]
async fn ntfy_alert(
    State(state): State<AppState>,
    params: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: Bytes,
) -> (StatusCode, String) {
    let _timer = http_request_timer("/ntfy_alert");

    let accepted = match params {
        Ok(Query(params)) => accept_batch(&state, params, &body).await,
        Err(rejection) => Err(format!("invalid query string: {}", rejection.body_text())),
    };

    let response = match accepted {
        Ok(count) => (StatusCode::OK, format!("OK, received {count} alerts")),
        Err(message) => {
            tracing::warn!("Rejected alert batch: {}", message);
            (StatusCode::BAD_REQUEST, message)
        }
    };

    record_http_request("/ntfy_alert", response.0.as_u16());
    response
}

async fn accept_batch(
    state: &AppState,
    params: Vec<(String, String)>,
    body: &[u8],
) -> Result<usize, String> {
    let mapping = schema::validate_mapping(params).map_err(|e| e.to_string())?;

    let raw: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))?;
    let batch = schema::validate_batch(raw).map_err(|e| e.to_string())?;
    let count = batch.len();

    let outcome = state.dispatcher.process_batch(&mapping, batch).await;
    if outcome.has_failures() {
        tracing::warn!(
            "{} of {} alerts could not be delivered",
            outcome.failed.len(),
            outcome.total()
        );
    }

    Ok(count)
}
