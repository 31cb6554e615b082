use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{info, warn};

use safehome_common::{SwitchAction, SwitchConfig, SwitchEngine};

use crate::page;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<SwitchEngine>>,
    /// Simulated PIR output level.
    pir: Arc<AtomicBool>,
}

impl AppState {
    fn new(config: SwitchConfig) -> Self {
        Self {
            engine: Arc::new(Mutex::new(SwitchEngine::new(config))),
            pir: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SwitchConfig::default();
    info!(
        "simulated access point `{}` at {}",
        config.ap_ssid,
        Ipv4Addr::from(config.ap_ip)
    );

    let app_state = AppState::new(config);
    spawn_control_loop(app_state.clone());

    let port = std::env::var("SAFEHOME_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8081);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind switch server at {addr}"))?;

    info!("switch listening on http://{addr}");
    axum::serve(listener, router(app_state)).await?;
    Ok(())
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/toggle", get(handle_toggle))
        .route("/setmode", get(handle_set_mode))
        .route("/status", get(handle_status))
        .route("/api/sim/pir", post(handle_sim_pir))
        .fallback(handle_not_found)
        .with_state(app_state)
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = {
            let engine = app_state.engine.lock().await;
            Duration::from_millis(engine.config.loop_interval_ms)
        };
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            control_step(&app_state, monotonic_ms()).await;
        }
    });
}

async fn control_step(app_state: &AppState, now_ms: u64) {
    let motion = app_state.pir.load(Ordering::Relaxed);
    let actions = {
        let mut engine = app_state.engine.lock().await;
        engine.tick(motion, now_ms)
    };
    execute_switch_actions(actions);
}

fn execute_switch_actions(actions: Vec<SwitchAction>) {
    for action in actions {
        match action {
            SwitchAction::RelayOn => info!("relay on"),
            SwitchAction::RelayOff => info!("relay off"),
        }
    }
}

async fn handle_root(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.lock().await.status();
    Html(page::index(status))
}

async fn handle_toggle(State(state): State<AppState>) -> impl IntoResponse {
    let actions = state.engine.lock().await.toggle();
    if actions.is_empty() {
        info!("toggle ignored in auto mode");
    }
    execute_switch_actions(actions);
    redirect_home()
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let enabled = match params.get("auto").map(String::as_str) {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ => None,
    };

    if let Some(enabled) = enabled {
        let actions = state.engine.lock().await.set_auto_mode(enabled);
        info!("auto mode {}", if enabled { "on" } else { "off" });
        execute_switch_actions(actions);
    }

    redirect_home()
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.lock().await.status())
}

async fn handle_sim_pir(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let level = match params.get("level").map(String::as_str) {
        Some("high") => true,
        Some("low") => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "level must be 'high' or 'low'"),
    };

    state.pir.store(level, Ordering::Relaxed);
    Json(json!({ "pir": level })).into_response()
}

async fn handle_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain")],
        "Not found",
    )
}

fn redirect_home() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    warn!("rejecting request: {message}");
    (status, Json(json!({ "error": message }))).into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
