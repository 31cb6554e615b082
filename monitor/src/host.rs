use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::json;
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};
use tracing::{debug, info, warn};

use safehome_common::{
    device_id_from_mac, parse_command, record, Button, ButtonSamples, ControlAck, ControlForm,
    Effect, LinkEvent, MonitorConfig, MonitorController, PersistedSettings, SensorReading,
};

use crate::page;

/// How long a simulated button stays pressed.
const SIM_PRESS_MS: u64 = 100;
const SIM_MAC: [u8; 6] = [0x02, 0x5A, 0xFE, 0x00, 0x10, 0x01];
const SIM_IP: &str = "127.0.0.1";
const UPDATE_CHANNEL_CAPACITY: usize = 32;
const DEFAULT_WS_PORT: u16 = 81;

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<MonitorController>>,
    updates: broadcast::Sender<String>,
    store: AppStore,
    sim: Arc<SimInputs>,
    ip: Arc<str>,
}

#[derive(Clone)]
struct AppStore {
    settings_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Stand-ins for the panel buttons, the sensors and the station radio.
struct SimInputs {
    pending: [AtomicBool; 3],
    pressed_until_ms: [AtomicU64; 3],
    cycle: AtomicU64,
    associate: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("SAFEHOME_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.safehome"));
    let store = AppStore::new(data_dir);

    let mut settings = store.load_settings().await;
    seed_station_credentials(&mut settings);

    let associate = std::env::var("SAFEHOME_SIM_ASSOCIATE")
        .map(|value| matches!(value.as_str(), "1" | "true" | "on"))
        .unwrap_or(false);

    let device_id = device_id_from_mac(SIM_MAC);
    info!("monitor device id {device_id}");

    let app_state = AppState::new(MonitorConfig::default(), settings, device_id, store, associate);

    let startup = app_state.controller.lock().await.start(monotonic_ms());
    execute_effects(&app_state, startup).await;
    spawn_control_loop(app_state.clone());

    let port = std::env::var("SAFEHOME_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind monitor server at {addr}"))?;

    let ws_port = std::env::var("SAFEHOME_WS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_WS_PORT);
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], ws_port));
    match TcpListener::bind(ws_addr).await {
        Ok(ws_listener) => {
            info!("websocket channel on ws://{ws_addr}/");
            let ws_app = ws_router(app_state.clone());
            tokio::spawn(async move {
                if let Err(err) = axum::serve(ws_listener, ws_app).await {
                    warn!("websocket server stopped: {err}");
                }
            });
        }
        Err(err) => warn!("failed to bind websocket server at {ws_addr}, only /ws is served: {err}"),
    }

    info!("monitor listening on http://{addr}");
    axum::serve(listener, router(app_state)).await?;
    Ok(())
}

impl AppState {
    fn new(
        config: MonitorConfig,
        settings: PersistedSettings,
        device_id: String,
        store: AppStore,
        associate: bool,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            controller: Arc::new(Mutex::new(MonitorController::new(
                config, settings, device_id,
            ))),
            updates,
            store,
            sim: Arc::new(SimInputs::new(associate)),
            ip: Arc::from(SIM_IP),
        }
    }
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/status", get(handle_get_status))
        .route("/api/status", get(handle_get_status))
        .route("/api/control", post(handle_control))
        .route("/ws", get(handle_ws))
        .route("/api/sim/button/{button}", post(handle_sim_button))
        .with_state(app_state)
}

/// Dedicated WebSocket listener: upgrades on any path.
fn ws_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_ws))
        .route("/{*path}", get(handle_ws))
        .with_state(app_state)
}

fn seed_station_credentials(settings: &mut PersistedSettings) {
    if settings.has_station_credentials() {
        return;
    }
    if let Ok(ssid) = std::env::var("SAFEHOME_STATION_SSID") {
        settings.station_ssid = ssid;
        settings.station_password = std::env::var("SAFEHOME_STATION_PASS").unwrap_or_default();
        settings.sanitize();
    }
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = {
            let controller = app_state.controller.lock().await;
            Duration::from_millis(controller.config().loop_interval_ms)
        };
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            control_step(&app_state, monotonic_ms()).await;
        }
    });
}

async fn control_step(app_state: &AppState, now_ms: u64) {
    let samples = app_state.sim.buttons(now_ms);

    let (link_event, effects) = {
        let mut controller = app_state.controller.lock().await;
        let mut effects = controller.service_buttons(now_ms, samples);

        if controller.sample_due(now_ms) {
            let reading = app_state.sim.next_reading();
            effects.extend(controller.apply_reading(now_ms, reading));
        }

        let (link_event, link_effects) = controller.poll_link(now_ms, app_state.sim.associate);
        effects.extend(link_effects);

        if controller.take_due_save(now_ms) {
            effects.push(Effect::SaveSettings);
        }
        (link_event, effects)
    };

    match link_event {
        Some(LinkEvent::Connected) => info!("station link up"),
        Some(LinkEvent::FellBack) => warn!("station connect timed out; staying in access point mode"),
        Some(LinkEvent::Lost) => warn!("station link lost; falling back to access point mode"),
        None => {}
    }

    execute_effects(app_state, effects).await;
}

async fn execute_effects(app_state: &AppState, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Relay(on) => info!("relay {}", if on { "on" } else { "off" }),
            Effect::Alarm(true) => warn!("alarm latched"),
            Effect::Alarm(false) => info!("alarm output off"),
            Effect::Redraw => {
                let screen = app_state.controller.lock().await.screen(&app_state.ip);
                debug!("lcd\n{}", screen.join("\n"));
            }
            Effect::Broadcast => broadcast_status(app_state).await,
            Effect::SaveSettings => {
                let settings = app_state.controller.lock().await.settings().clone();
                if let Err(err) = app_state.store.save_settings(&settings).await {
                    warn!("failed to persist settings: {err:#}");
                }
            }
            Effect::StartAccessPoint => {
                let controller = app_state.controller.lock().await;
                info!("access point `{}` up", controller.config().ap_ssid);
            }
            Effect::BeginStation => {
                let controller = app_state.controller.lock().await;
                info!("joining `{}`", controller.settings().station_ssid);
            }
        }
    }
}

async fn status_json(app_state: &AppState) -> Option<String> {
    let status = app_state.controller.lock().await.status();
    match serde_json::to_string(&status) {
        Ok(body) => Some(body),
        Err(err) => {
            warn!("status serialization failed: {err}");
            None
        }
    }
}

async fn broadcast_status(app_state: &AppState) {
    if let Some(body) = status_json(app_state).await {
        // No subscribers is not an error.
        let _ = app_state.updates.send(body);
    }
}

async fn handle_root(State(state): State<AppState>) -> impl IntoResponse {
    let device_id = state.controller.lock().await.device_id().to_string();
    Html(page::index(&device_id, &state.ip))
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.lock().await.status())
}

async fn handle_control(
    State(state): State<AppState>,
    Form(form): Form<ControlForm>,
) -> impl IntoResponse {
    let effects = state.controller.lock().await.apply_control(&form);
    execute_effects(&state, effects).await;
    Json(ControlAck::ok())
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_session(socket, state))
}

async fn ws_session(mut socket: WebSocket, app_state: AppState) {
    info!("websocket client connected");
    let mut updates = app_state.updates.subscribe();

    if let Some(snapshot) = status_json(&app_state).await {
        if socket.send(Message::Text(snapshot.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => handle_ws_text(&app_state, text.as_str()).await,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            update = updates.recv() => match update {
                Ok(body) => {
                    if socket.send(Message::Text(body.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("websocket client skipped {skipped} updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("websocket client disconnected");
}

async fn handle_ws_text(app_state: &AppState, text: &str) {
    let Some(command) = parse_command(text) else {
        debug!("dropping websocket frame: {text}");
        return;
    };

    let effects = app_state.controller.lock().await.apply_command(command);
    execute_effects(app_state, effects).await;
}

async fn handle_sim_button(
    State(state): State<AppState>,
    Path(button): Path<String>,
) -> Response {
    let Some(button) = Button::parse(&button) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown button");
    };

    state.sim.press(button);
    Json(json!({ "pressed": button.as_str() })).into_response()
}

impl AppStore {
    fn new(data_dir: PathBuf) -> Self {
        Self {
            settings_path: Arc::new(data_dir.join("settings.bin")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Missing, unreadable and corrupt records all fall back to defaults.
    async fn load_settings(&self) -> PersistedSettings {
        let raw = match self.read_record().await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to read settings record: {err:#}");
                None
            }
        };

        let (settings, error) = record::load_or_default(raw.as_deref());
        if let Some(err) = error {
            warn!("stored settings rejected, using defaults: {err}");
        }
        settings
    }

    async fn read_record(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.settings_path.as_ref()).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_settings(&self, settings: &PersistedSettings) -> anyhow::Result<()> {
        let payload = record::encode(settings)?;

        let _guard = self.lock.lock().await;
        let path = self.settings_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("bin.tmp");
        tokio::fs::write(&staging, payload)
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl SimInputs {
    fn new(associate: bool) -> Self {
        Self {
            pending: Default::default(),
            pressed_until_ms: Default::default(),
            cycle: AtomicU64::new(0),
            associate,
        }
    }

    fn press(&self, button: Button) {
        self.pending[slot(button)].store(true, Ordering::Relaxed);
    }

    /// A queued press starts on the first loop sample that sees it.
    fn buttons(&self, now_ms: u64) -> ButtonSamples {
        let mut held = [false; 3];
        for button in Button::ALL {
            let index = slot(button);
            if self.pending[index].swap(false, Ordering::Relaxed) {
                self.pressed_until_ms[index].store(now_ms + SIM_PRESS_MS, Ordering::Relaxed);
            }
            held[index] = now_ms < self.pressed_until_ms[index].load(Ordering::Relaxed);
        }

        ButtonSamples {
            mode: held[slot(Button::Mode)],
            up: held[slot(Button::Up)],
            down: held[slot(Button::Down)],
        }
    }

    fn next_reading(&self) -> SensorReading {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed);
        SensorReading {
            temperature: Some(24.0 + (cycle % 8) as f32 * 0.2),
            humidity: Some(42.0 + (cycle % 6) as f32 * 0.5),
            gas_level: 180.0 + (cycle % 10) as f32 * 12.0,
        }
    }
}

fn slot(button: Button) -> usize {
    match button {
        Button::Mode => 0,
        Button::Up => 1,
        Button::Down => 2,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use futures_util::{SinkExt, StreamExt};
    use reqwest::Client;
    use safehome_common::{MenuState, MonitorStatus, MAX_COMMAND_BYTES};
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn scratch_dir(name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "safehome-monitor-{name}-{}-{unique}",
            std::process::id()
        ))
    }

    fn app_state(data_dir: PathBuf) -> AppState {
        AppState::new(
            MonitorConfig::default(),
            PersistedSettings::default(),
            "25AFE0101".to_string(),
            AppStore::new(data_dir),
            false,
        )
    }

    async fn spawn_app(app_state: AppState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(app_state);
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    async fn spawn_ws_channel(app_state: AppState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = ws_router(app_state);
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("ws://{addr}")
    }

    async fn connect(url: &str) -> WsClient {
        let (socket, _) = connect_async(url).await.unwrap();
        socket
    }

    async fn next_status(socket: &mut WsClient) -> MonitorStatus {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("no websocket frame within 2s")
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn stays_quiet(socket: &mut WsClient) -> bool {
        tokio::time::timeout(Duration::from_millis(200), socket.next())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn status_routes_serve_the_same_payload() {
        let base = spawn_app(app_state(scratch_dir("status"))).await;
        let client = Client::new();

        let api: serde_json::Value = client
            .get(format!("{base}/api/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let plain: serde_json::Value = client
            .get(format!("{base}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(api, plain);
        assert_eq!(api["deviceID"], "25AFE0101");
        assert_eq!(api["gasThreshold"], 500.0);
        assert_eq!(api["tempThreshold"], 35.0);
        assert_eq!(api["autoMode"], true);
        assert_eq!(api["alarmActive"], false);
    }

    #[tokio::test]
    async fn control_form_updates_state_and_persists_record() {
        let data_dir = scratch_dir("control");
        let base = spawn_app(app_state(data_dir.clone())).await;
        let client = Client::new();

        let ack: serde_json::Value = client
            .post(format!("{base}/api/control"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body("relay=on&auto=0&gasThreshold=720&tempThreshold=hot")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ack, json!({ "status": "ok" }));

        let status: MonitorStatus = client
            .get(format!("{base}/api/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(status.relay_state);
        assert!(!status.auto_mode);
        assert_eq!(status.gas_threshold, 720.0);
        assert_eq!(status.temp_threshold, 35.0);

        let raw = std::fs::read(data_dir.join("settings.bin")).unwrap();
        let stored = record::decode(&raw).unwrap();
        assert_eq!(stored.gas_threshold, 720.0);
        assert!(!stored.auto_mode);

        let reloaded = AppStore::new(data_dir.clone()).load_settings().await;
        assert_eq!(reloaded, stored);
        let _ = std::fs::remove_dir_all(data_dir);
    }

    #[tokio::test]
    async fn corrupt_record_loads_defaults() {
        let data_dir = scratch_dir("corrupt");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("settings.bin"), b"SHS\x01garbage").unwrap();

        let settings = AppStore::new(data_dir.clone()).load_settings().await;

        assert_eq!(settings, PersistedSettings::default());
        let _ = std::fs::remove_dir_all(data_dir);
    }

    #[tokio::test]
    async fn websocket_commands_broadcast_full_state() {
        let state = app_state(scratch_dir("ws"));
        let mut updates = state.updates.subscribe();

        handle_ws_text(&state, r#"{"command":"setRelay","state":true}"#).await;
        let update: MonitorStatus = serde_json::from_str(&updates.recv().await.unwrap()).unwrap();
        assert!(update.relay_state);

        handle_ws_text(&state, r#"{"command":"setThresholds","gas":640,"temp":41}"#).await;
        let update: MonitorStatus = serde_json::from_str(&updates.recv().await.unwrap()).unwrap();
        assert_eq!(update.gas_threshold, 640.0);
        assert_eq!(update.temp_threshold, 41.0);
    }

    #[tokio::test]
    async fn malformed_websocket_frames_are_dropped() {
        let state = app_state(scratch_dir("ws-drop"));
        let mut updates = state.updates.subscribe();

        handle_ws_text(&state, "not json").await;
        handle_ws_text(&state, r#"{"command":"setRelay"}"#).await;
        handle_ws_text(&state, r#"{"command":"launch"}"#).await;
        handle_ws_text(&state, r#"{"command":"reset","alarm":false}"#).await;

        assert!(matches!(
            updates.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(!state.controller.lock().await.status().relay_state);
    }

    #[tokio::test]
    async fn simulated_button_press_opens_menu() {
        let state = app_state(scratch_dir("buttons"));
        let base = spawn_app(state.clone()).await;

        let response = Client::new()
            .post(format!("{base}/api/sim/button/mode"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        for tick in 0..20 {
            control_step(&state, 10_000 + tick * 10).await;
        }

        assert_eq!(state.controller.lock().await.menu_state(), MenuState::MenuMain);
    }

    #[tokio::test]
    async fn unknown_sim_button_is_rejected() {
        let base = spawn_app(app_state(scratch_dir("bad-button"))).await;

        let response = Client::new()
            .post(format!("{base}/api/sim/button/reset"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn websocket_clients_get_snapshot_and_every_broadcast() {
        let base = spawn_ws_channel(app_state(scratch_dir("ws-clients"))).await;
        let mut first = connect(&format!("{base}/")).await;
        let mut second = connect(&format!("{base}/any/path")).await;

        assert_eq!(next_status(&mut first).await.device_id, "25AFE0101");
        assert!(!next_status(&mut second).await.relay_state);

        first
            .send(WsMessage::text(r#"{"command":"setRelay","state":true}"#))
            .await
            .unwrap();
        assert!(next_status(&mut first).await.relay_state);
        assert!(next_status(&mut second).await.relay_state);

        first.send(WsMessage::text("garbage")).await.unwrap();
        assert!(stays_quiet(&mut second).await);
    }

    #[tokio::test]
    async fn websocket_alias_on_http_port_shares_the_channel() {
        let state = app_state(scratch_dir("ws-alias"));
        let http_base = spawn_app(state.clone()).await;
        let ws_base = spawn_ws_channel(state).await;

        let alias_url = format!("{}/ws", http_base.replacen("http://", "ws://", 1));
        let mut on_alias = connect(&alias_url).await;
        let mut on_channel = connect(&format!("{ws_base}/")).await;
        next_status(&mut on_alias).await;
        next_status(&mut on_channel).await;

        on_alias
            .send(WsMessage::text(
                r#"{"command":"setThresholds","gas":610,"temp":38}"#,
            ))
            .await
            .unwrap();

        let update = next_status(&mut on_channel).await;
        assert_eq!(update.gas_threshold, 610.0);
        assert_eq!(update.temp_threshold, 38.0);
    }

    #[tokio::test]
    async fn oversized_websocket_frame_is_dropped_and_session_survives() {
        let base = spawn_ws_channel(app_state(scratch_dir("ws-oversized"))).await;
        let mut sender = connect(&format!("{base}/")).await;
        let mut watcher = connect(&format!("{base}/")).await;
        next_status(&mut sender).await;
        next_status(&mut watcher).await;

        let padding = " ".repeat(MAX_COMMAND_BYTES);
        sender
            .send(WsMessage::text(format!(
                r#"{{"command":"setRelay","state":true}}{padding}"#
            )))
            .await
            .unwrap();
        assert!(stays_quiet(&mut watcher).await);

        sender
            .send(WsMessage::text(r#"{"command":"setAutoMode","state":false}"#))
            .await
            .unwrap();
        let update = next_status(&mut watcher).await;
        assert!(!update.auto_mode);
        assert!(!update.relay_state);
    }

    #[tokio::test]
    async fn closed_websocket_client_does_not_stall_others() {
        let base = spawn_ws_channel(app_state(scratch_dir("ws-close"))).await;
        let mut leaving = connect(&format!("{base}/")).await;
        let mut staying = connect(&format!("{base}/")).await;
        next_status(&mut leaving).await;
        next_status(&mut staying).await;

        leaving.close(None).await.unwrap();
        drop(leaving);

        staying
            .send(WsMessage::text(r#"{"command":"getStatus"}"#))
            .await
            .unwrap();
        assert_eq!(next_status(&mut staying).await.device_id, "25AFE0101");
    }
}
