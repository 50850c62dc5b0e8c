use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::engine::dep::DepAction;
use crate::engine::policy::PolicyField;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;

/// Plain-text control surface over the engine: dump endpoints mirror the
/// engine's text dumps, write endpoints accept the same whitespace-separated
/// tuples the dumps show.
pub struct ControlServer {
    engine: Arc<Engine>,
    metrics: Arc<EngineMetrics>,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
struct CtlState {
    engine: Arc<Engine>,
    metrics: Arc<EngineMetrics>,
}

impl ControlServer {
    pub fn new(engine: Arc<Engine>, metrics: Arc<EngineMetrics>, addr: &str) -> Self {
        Self {
            engine,
            metrics,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the HTTP server serving the dump, write, and metrics routes.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":8877"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let state = CtlState {
            engine: Arc::clone(&self.engine),
            metrics: Arc::clone(&self.metrics),
        };

        let app = Router::new()
            .route("/healthz", get(healthz_handler))
            .route("/metrics", get(metrics_handler))
            .route("/policy", get(policy_dump_handler))
            .route("/policy/ema2", post(policy_ema2_handler))
            .route("/policy/filter", post(policy_filter_handler))
            .route("/spid", get(spid_dump_handler).post(spid_write_handler))
            .route("/deps", get(deps_dump_handler))
            .route("/runtime", get(runtime_dump_handler))
            .route("/tunables", post(tunables_write_handler))
            .with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "control server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "control server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the control server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<CtlState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /policy - per-process override table.
async fn policy_dump_handler(State(state): State<CtlState>) -> String {
    state.engine.dump_policy()
}

/// POST /policy/ema2 - "<pid> <value> [persist]"; values other than 0/1
/// revert to the global default.
async fn policy_ema2_handler(State(state): State<CtlState>, body: String) -> impl IntoResponse {
    policy_write(&state, PolicyField::Ema2, &body)
}

/// POST /policy/filter - "<pid> <value> [persist]", same grammar as
/// /policy/ema2.
async fn policy_filter_handler(State(state): State<CtlState>, body: String) -> impl IntoResponse {
    policy_write(&state, PolicyField::FilterDepTasks, &body)
}

fn policy_write(state: &CtlState, field: PolicyField, body: &str) -> (StatusCode, String) {
    let mut parts = body.split_whitespace();
    let (Some(pid), Some(value)) = (parts.next(), parts.next()) else {
        return (
            StatusCode::BAD_REQUEST,
            "expected: <pid> <value> [persist]\n".into(),
        );
    };
    let Ok(pid) = pid.parse::<i32>() else {
        return (StatusCode::BAD_REQUEST, "bad pid\n".into());
    };
    let Ok(value) = value.parse::<i64>() else {
        return (StatusCode::BAD_REQUEST, "bad value\n".into());
    };
    let persist = match parts.next() {
        None => false,
        Some("0") => false,
        Some("1") => true,
        Some(_) => return (StatusCode::BAD_REQUEST, "bad persist flag\n".into()),
    };
    if parts.next().is_some() {
        return (
            StatusCode::BAD_REQUEST,
            "expected: <pid> <value> [persist]\n".into(),
        );
    }

    let override_value = match value {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    };

    match state
        .engine
        .set_policy_override(pid, field, override_value, persist)
    {
        Ok(()) => (StatusCode::OK, "ok\n".into()),
        Err(e) => engine_error_response(e),
    }
}

/// GET /spid - pattern table and expanded entries.
async fn spid_dump_handler(State(state): State<CtlState>) -> String {
    state.engine.dump_spid()
}

/// POST /spid - "<process> <thread> <action>", whitespace or comma separated.
/// "0 0 <action>" resets the pattern table.
async fn spid_write_handler(State(state): State<CtlState>, body: String) -> impl IntoResponse {
    let mut parts = body.split(|c: char| c.is_whitespace() || c == ',').filter(|s| !s.is_empty());
    let (Some(process), Some(thread), Some(action), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return (
            StatusCode::BAD_REQUEST,
            "expected: <process> <thread> <action>\n".to_string(),
        );
    };
    let Some(action) = action.parse::<i32>().ok().and_then(DepAction::from_i32) else {
        return (StatusCode::BAD_REQUEST, "bad action\n".to_string());
    };

    match state.engine.register_pattern(process, thread, action) {
        Ok(()) => (StatusCode::OK, "ok\n".to_string()),
        Err(e) => engine_error_response(e),
    }
}

/// GET /deps - folded dependency lists of all renders.
async fn deps_dump_handler(State(state): State<CtlState>) -> String {
    state.engine.dump_deps()
}

/// GET /runtime - attributed CPU time per render.
async fn runtime_dump_handler(State(state): State<CtlState>) -> String {
    state.engine.dump_runtime()
}

/// POST /tunables - "<name> <value>".
async fn tunables_write_handler(State(state): State<CtlState>, body: String) -> impl IntoResponse {
    let mut parts = body.split_whitespace();
    let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
        return (StatusCode::BAD_REQUEST, "expected: <name> <value>\n".to_string());
    };
    let Ok(value) = value.parse::<i64>() else {
        return (StatusCode::BAD_REQUEST, "bad value\n".to_string());
    };

    match state.engine.apply_tunable(name, value) {
        Ok(()) => (StatusCode::OK, "ok\n".to_string()),
        Err(e) => engine_error_response(e),
    }
}

fn engine_error_response(e: EngineError) -> (StatusCode, String) {
    let status = match e {
        EngineError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
        EngineError::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
        EngineError::NotFound => StatusCode::NOT_FOUND,
        EngineError::EstimatorUnavailable | EngineError::Disabled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, format!("{e}\n"))
}
