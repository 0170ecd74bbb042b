//! Axum HTTP surface for Rate Guardian: cron/manual triggers, the pending-alert
//! relay, the signed webhook receiver and a health check.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rg_engine::{
    maybe_build_scheduler, Capability, ConfigError, EngineConfig, EngineError,
    RateGuardianEngine, RunOutcome, RunRequest,
};
use rg_storage::{secrets_match, verify_signature, SignatureError, SIGNATURE_HEADER};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "rg-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Capability<Arc<RateGuardianEngine>>,
    pub cron_secret: Option<String>,
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        engine: Capability<Arc<RateGuardianEngine>>,
        cron_secret: Option<String>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            engine,
            cron_secret,
            webhook_secret,
        }
    }

    /// A missing store leaves the engine unavailable; the routes report why.
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let engine = match config.store.require() {
            Ok(_) => Capability::Available(Arc::new(RateGuardianEngine::from_config(config)?)),
            Err(err) => Capability::Unavailable(err),
        };
        Ok(Self::new(
            engine,
            config.cron_secret.clone(),
            config.webhook_secret.clone(),
        ))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/engine", post(engine_handler))
        .route("/api/fetch-alerts", post(fetch_alerts_handler))
        .route("/api/rosie-alert", post(rosie_alert_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    let state = AppState::from_config(&config)?;

    let scheduler = match &state.engine {
        Capability::Available(engine) => maybe_build_scheduler(engine.clone(), &config).await?,
        Capability::Unavailable(_) => None,
    };
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(stage = "scheduler:start", cron = %config.engine_cron, "in-process scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(stage = "web:listen", port = config.web_port, "rate guardian listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "engine": state.engine.is_available(),
    }))
    .into_response()
}

async fn engine_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(request): Query<RunRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let engine = match state.engine.require() {
        Ok(engine) => engine,
        Err(err) => return config_error(err),
    };

    match engine.trigger(request).await {
        Ok(RunOutcome::Completed(result)) => Json(result).into_response(),
        Ok(RunOutcome::Skipped { bucket }) => {
            Json(json!({ "status": "skipped", "bucket": bucket })).into_response()
        }
        Err(err) => engine_error(err),
    }
}

async fn fetch_alerts_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let engine = match state.engine.require() {
        Ok(engine) => engine,
        Err(err) => return config_error(err),
    };

    match engine.relay_pending_alerts().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn rosie_alert_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match verify_signature(state.webhook_secret.as_deref(), &body, signature) {
        Ok(()) => {}
        Err(SignatureError::MissingSecret) => {
            error!(stage = "receiver:misconfigured", "webhook secret not configured");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "webhook secret is not configured",
            );
        }
        Err(err) => {
            warn!(stage = "receiver:rejected", error = %err, "webhook signature rejected");
            return json_error(StatusCode::UNAUTHORIZED, "invalid signature");
        }
    }

    let data: Value = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {err}")),
    };
    info!(
        stage = "receiver:accepted",
        alert_id = data.get("id").and_then(serde_json::Value::as_str).unwrap_or_default(),
        "webhook received"
    );
    Json(json!({ "status": "received", "data": data })).into_response()
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(secret) = state.cron_secret.as_deref() else {
        return Err(config_error(ConfigError::Missing("CRON_SECRET")));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented.is_some_and(|p| secrets_match(secret, p)) {
        Ok(())
    } else {
        Err(json_error(StatusCode::UNAUTHORIZED, "unauthorized"))
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn config_error(err: ConfigError) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

fn engine_error(err: EngineError) -> Response {
    error!(stage = "web:engine:error", error = %err, "engine request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}
