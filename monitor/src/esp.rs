use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{
        AnyIOPin, AnyInputPin, AnyOutputPin, Gpio33, Input, InputOutput, Output, PinDriver, Pull,
    },
    i2c::{I2cConfig, I2cDriver},
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{
        ws::{EspHttpWsConnection, EspHttpWsDetachedSender},
        Configuration as HttpConfiguration, EspHttpServer,
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::EspWifi,
};
use log::{debug, info, warn};
use serde::Serialize;

use safehome_common::{
    device_id_from_mac, parse_command, record, ButtonSamples, ControlForm, Effect, LinkEvent,
    MonitorConfig, MonitorController, NetworkMode, PersistedSettings, SensorReading,
    MAX_COMMAND_BYTES,
};

use crate::{lcd::Lcd, page};

const NVS_NAMESPACE: &str = "safehome";
const NVS_SETTINGS_KEY: &str = "settings";
const MAX_RECORD_BYTES: usize = 1024;
const MAX_HTTP_BODY: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WS_PORT: u16 = 81;
// The main server keeps the esp-idf default control port.
const WS_CTRL_PORT: u16 = 32769;

type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

#[derive(Clone)]
struct SharedState {
    controller: Arc<Mutex<MonitorController>>,
    outputs: Arc<Mutex<Outputs>>,
    lcd: Arc<Mutex<Option<Lcd>>>,
    wifi: Arc<Mutex<EspWifi<'static>>>,
    sockets: Arc<Mutex<Vec<EspHttpWsDetachedSender>>>,
    nvs_store: NvsStore,
}

struct Outputs {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    alarm: PinDriver<'static, AnyOutputPin, Output>,
}

struct Buttons {
    mode: PinDriver<'static, AnyInputPin, Input>,
    up: PinDriver<'static, AnyInputPin, Input>,
    down: PinDriver<'static, AnyInputPin, Input>,
}

struct Sensors {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    gas: AdcChannelDriver<'static, Gpio33, AdcDriver<'static, ADC1>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = MonitorConfig::default();
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };
    let peripherals = Peripherals::take()?;

    let mut settings = nvs_store.load_settings();
    ensure_wifi_defaults(&mut settings);

    let pins = &config.pins;
    let mut relay = unsafe { PinDriver::output(AnyOutputPin::new(pins.relay)) }
        .with_context(|| format!("relay GPIO{} unavailable", pins.relay))?;
    relay.set_low()?;
    let mut alarm = unsafe { PinDriver::output(AnyOutputPin::new(pins.alarm)) }
        .with_context(|| format!("alarm GPIO{} unavailable", pins.alarm))?;
    alarm.set_low()?;

    let buttons = Buttons {
        mode: button_input(pins.mode_button)?,
        up: button_input(pins.up_button)?,
        down: button_input(pins.down_button)?,
    };

    let mut dht_pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(pins.dht) })
        .with_context(|| format!("DHT11 GPIO{} unavailable", pins.dht))?;
    dht_pin.set_pull(Pull::Up)?;
    dht_pin.set_high()?;
    let gas = AdcChannelDriver::new(
        AdcDriver::new(peripherals.adc1)?,
        peripherals.pins.gpio33,
        &AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        },
    )
    .with_context(|| format!("gas sensor ADC on GPIO{} unavailable", pins.gas_sensor))?;
    let sensors = Sensors {
        dht_pin,
        delay: Ets,
        gas,
    };

    let lcd = match init_lcd(peripherals.i2c0, &config) {
        Ok(lcd) => Some(lcd),
        Err(err) => {
            warn!("LCD unavailable, continuing headless: {err:#}");
            None
        }
    };

    let wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?;
    let mac = wifi.sta_netif().get_mac()?;
    let device_id = device_id_from_mac(mac);
    info!("monitor device id {device_id}");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let state = SharedState {
        controller: Arc::new(Mutex::new(MonitorController::new(
            config, settings, device_id,
        ))),
        outputs: Arc::new(Mutex::new(Outputs { relay, alarm })),
        lcd: Arc::new(Mutex::new(lcd)),
        wifi: Arc::new(Mutex::new(wifi)),
        sockets: Arc::new(Mutex::new(Vec::new())),
        nvs_store,
    };

    let startup = state.controller.lock().unwrap().start(monotonic_ms());
    execute_effects(&state, startup);

    let server = create_http_server(state.clone())?;
    let ws_server = create_ws_server(state.clone())?;
    spawn_control_loop(state, buttons, sensors);

    let _server = server;
    let _ws_server = ws_server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(settings: &mut PersistedSettings) {
    if settings.station_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            settings.station_ssid = ssid.to_string();
        }
    }

    if settings.station_password.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            settings.station_password = pass.to_string();
        }
    }
    settings.sanitize();
}

fn button_input(pin: i32) -> anyhow::Result<PinDriver<'static, AnyInputPin, Input>> {
    let mut driver = unsafe { PinDriver::input(AnyInputPin::new(pin)) }
        .with_context(|| format!("button GPIO{pin} unavailable"))?;
    driver.set_pull(Pull::Up)?;
    Ok(driver)
}

fn init_lcd(i2c: esp_idf_hal::i2c::I2C0, config: &MonitorConfig) -> anyhow::Result<Lcd> {
    let pins = &config.pins;
    let i2c_cfg = I2cConfig::new().baudrate(100.kHz().into());
    let i2c = I2cDriver::new(
        i2c,
        unsafe { AnyIOPin::new(pins.lcd_sda) },
        unsafe { AnyIOPin::new(pins.lcd_scl) },
        &i2c_cfg,
    )?;
    Lcd::new(i2c, pins.lcd_address)
}

impl Buttons {
    /// Buttons pull the line low when pressed.
    fn sample(&self) -> ButtonSamples {
        ButtonSamples {
            mode: self.mode.is_low(),
            up: self.up.is_low(),
            down: self.down.is_low(),
        }
    }
}

impl Sensors {
    fn read(&mut self) -> SensorReading {
        let gas_level = match self.gas.read_raw() {
            Ok(raw) => raw as f32,
            Err(err) => {
                warn!("gas sensor read failed: {err}");
                0.0
            }
        };

        let (temperature, humidity) = match self.read_dht() {
            Some((temperature, humidity)) => (Some(temperature), Some(humidity)),
            None => (None, None),
        };

        SensorReading {
            temperature,
            humidity,
            gas_level,
        }
    }

    fn read_dht(&mut self) -> Option<(f32, f32)> {
        if let Err(err) = self.dht_pin.set_high() {
            debug!("failed to release DHT11 line before read: {err:?}");
            return None;
        }

        match dht11::blocking::read(&mut self.delay, &mut self.dht_pin) {
            Ok(reading) => Some((
                reading.temperature as f32,
                reading.relative_humidity as f32,
            )),
            Err(err) => {
                debug!("DHT11 read failed: {err:?}");
                None
            }
        }
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let device_id = state.controller.lock().unwrap().device_id().to_string();
            let ip = current_ip(&state);
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
                .write_all(page::index(&device_id, &ip).as_bytes())?;
            Ok(())
        })?;
    }

    for uri in ["/status", "/api/status"] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>(uri, Method::Get, move |req| {
            let status = state.controller.lock().unwrap().status();
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/control", Method::Post, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 413, &err.to_string()),
            };
            let form = parse_control_form(&String::from_utf8_lossy(&body));

            let effects = state.controller.lock().unwrap().apply_control(&form);
            execute_effects(&state, effects);
            write_json(req, &serde_json::json!({ "status": "ok" }))
        })?;
    }

    {
        let state = state.clone();
        server.ws_handler("/ws", move |ws: &mut EspHttpWsConnection| -> anyhow::Result<()> {
            handle_ws_frame(&state, ws)
        })?;
    }

    Ok(server)
}

/// WebSocket channel on its own port, answering on any path.
fn create_ws_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: WS_PORT,
        ctrl_port: WS_CTRL_PORT,
        stack_size: 8 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    server.ws_handler("/*", move |ws: &mut EspHttpWsConnection| -> anyhow::Result<()> {
        handle_ws_frame(&state, ws)
    })?;

    info!("websocket server listening on port {WS_PORT}");
    Ok(server)
}

fn handle_ws_frame(state: &SharedState, ws: &mut EspHttpWsConnection) -> anyhow::Result<()> {
    if ws.is_new() {
        info!("websocket client {} connected", ws.session());
        let status = state.controller.lock().unwrap().status();
        ws.send(FrameType::Text(false), &serde_json::to_vec(&status)?)?;
        state
            .sockets
            .lock()
            .unwrap()
            .push(ws.create_detached_sender()?);
        return Ok(());
    }

    if ws.is_closed() {
        info!("websocket client {} disconnected", ws.session());
        return Ok(());
    }

    let (_, len) = ws.recv(&mut [])?;
    if len > MAX_COMMAND_BYTES {
        // Consume the payload so it is not read back as the next frame.
        let mut scratch = vec![0_u8; len];
        ws.recv(&mut scratch)?;
        debug!("dropping oversized websocket frame ({len} bytes)");
        return Ok(());
    }

    let mut buffer = [0_u8; MAX_COMMAND_BYTES];
    ws.recv(&mut buffer[..len])?;
    let Ok(text) = core::str::from_utf8(&buffer[..len]) else {
        return Ok(());
    };
    let Some(command) = parse_command(text.trim_end_matches('\0')) else {
        debug!("dropping websocket frame: {text}");
        return Ok(());
    };

    let effects = state.controller.lock().unwrap().apply_command(command);
    execute_effects(state, effects);
    Ok(())
}

fn spawn_control_loop(state: SharedState, buttons: Buttons, mut sensors: Sensors) {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let period = {
                let controller = state.controller.lock().unwrap();
                Duration::from_millis(controller.config().loop_interval_ms)
            };

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();
                let samples = buttons.sample();
                let associated = station_associated(&state);

                let sample_due = state.controller.lock().unwrap().sample_due(now_ms);
                let reading = sample_due.then(|| sensors.read());

                let (link_event, effects) = {
                    let mut controller = state.controller.lock().unwrap();
                    let mut effects = controller.service_buttons(now_ms, samples);
                    if let Some(reading) = reading {
                        effects.extend(controller.apply_reading(now_ms, reading));
                    }

                    let (link_event, link_effects) = controller.poll_link(now_ms, associated);
                    effects.extend(link_effects);

                    if controller.take_due_save(now_ms) {
                        effects.push(Effect::SaveSettings);
                    }
                    (link_event, effects)
                };

                match link_event {
                    Some(LinkEvent::Connected) => info!("station link up at {}", current_ip(&state)),
                    Some(LinkEvent::FellBack) => {
                        warn!("station connect timed out; staying in access point mode")
                    }
                    Some(LinkEvent::Lost) => {
                        warn!("station link lost; falling back to access point mode")
                    }
                    None => {}
                }

                execute_effects(&state, effects);
                thread::sleep(period);
            }
        })
        .expect("failed to spawn control loop thread");
}

fn execute_effects(state: &SharedState, effects: Vec<Effect>) {
    for effect in effects {
        let result = match effect {
            Effect::Relay(on) => set_output(state, on, |outputs| &mut outputs.relay),
            Effect::Alarm(on) => {
                if on {
                    warn!("alarm latched");
                }
                set_output(state, on, |outputs| &mut outputs.alarm)
            }
            Effect::Redraw => redraw(state),
            Effect::Broadcast => broadcast_status(state),
            Effect::SaveSettings => {
                let settings = state.controller.lock().unwrap().settings().clone();
                state.nvs_store.save_settings(&settings)
            }
            Effect::StartAccessPoint => start_access_point(state),
            Effect::BeginStation => begin_station(state),
        };

        if let Err(err) = result {
            warn!("effect failed [{effect:?}]: {err:#}");
        }
    }
}

fn set_output(
    state: &SharedState,
    on: bool,
    pin: impl FnOnce(&mut Outputs) -> &mut PinDriver<'static, AnyOutputPin, Output>,
) -> anyhow::Result<()> {
    let mut outputs = state.outputs.lock().unwrap();
    let pin = pin(&mut outputs);
    if on {
        pin.set_high()?;
    } else {
        pin.set_low()?;
    }
    Ok(())
}

fn redraw(state: &SharedState) -> anyhow::Result<()> {
    let ip = current_ip(state);
    let screen = state.controller.lock().unwrap().screen(&ip);
    match state.lcd.lock().unwrap().as_mut() {
        Some(lcd) => lcd.show(&screen),
        None => Ok(()),
    }
}

fn broadcast_status(state: &SharedState) -> anyhow::Result<()> {
    let status = state.controller.lock().unwrap().status();
    let body = serde_json::to_vec(&status)?;

    let mut sockets = state.sockets.lock().unwrap();
    sockets.retain_mut(|sender| {
        if sender.is_closed() {
            return false;
        }
        match sender.send(FrameType::Text(false), &body) {
            Ok(()) => true,
            Err(err) => {
                debug!("dropping websocket client: {err}");
                false
            }
        }
    });
    Ok(())
}

fn access_point_configuration(
    controller: &MonitorController,
) -> anyhow::Result<AccessPointConfiguration> {
    Ok(AccessPointConfiguration {
        ssid: controller
            .config()
            .ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point SSID too long"))?,
        password: controller
            .settings()
            .ap_password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    })
}

fn start_access_point(state: &SharedState) -> anyhow::Result<()> {
    let ap = {
        let controller = state.controller.lock().unwrap();
        access_point_configuration(&controller)?
    };
    let ssid = ap.ssid.to_string();

    let mut wifi = state.wifi.lock().unwrap();
    if wifi.is_started()? {
        let _ = wifi.disconnect();
    }
    wifi.set_configuration(&Configuration::AccessPoint(ap))?;
    if !wifi.is_started()? {
        wifi.start()?;
    }
    info!("access point `{ssid}` up");
    Ok(())
}

/// Keeps the access point up while the station associates in the background.
fn begin_station(state: &SharedState) -> anyhow::Result<()> {
    let (client, ap) = {
        let controller = state.controller.lock().unwrap();
        let settings = controller.settings();
        let auth_method = if settings.station_password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let client = ClientConfiguration {
            ssid: settings
                .station_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: settings
                .station_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        };
        (client, access_point_configuration(&controller)?)
    };
    let ssid = client.ssid.to_string();

    let mut wifi = state.wifi.lock().unwrap();
    wifi.set_configuration(&Configuration::Mixed(client, ap))?;
    if !wifi.is_started()? {
        wifi.start()?;
    }
    wifi.connect()?;
    info!("joining `{ssid}`");
    Ok(())
}

fn station_associated(state: &SharedState) -> bool {
    let wifi = state.wifi.lock().unwrap();
    wifi.is_connected().unwrap_or(false) && wifi.is_up().unwrap_or(false)
}

fn current_ip(state: &SharedState) -> String {
    let interface = state.controller.lock().unwrap().link().addressed_interface();
    let wifi = state.wifi.lock().unwrap();
    let netif = match interface {
        NetworkMode::Station => wifi.sta_netif(),
        NetworkMode::AccessPoint => wifi.ap_netif(),
    };
    netif
        .get_ip_info()
        .map(|info| info.ip.to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn parse_control_form(body: &str) -> ControlForm {
    let mut form = ControlForm::default();
    for pair in body.split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = Some(value.replace('+', " "));
        match name {
            "relay" => form.relay = value,
            "auto" => form.auto = value,
            "gasThreshold" => form.gas_threshold = value,
            "tempThreshold" => form.temp_threshold = value,
            _ => {}
        }
    }
    form
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    warn!("rejecting request: {message}");
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl NvsStore {
    /// Missing, unreadable and corrupt records all fall back to defaults.
    fn load_settings(&self) -> PersistedSettings {
        let raw = match self.read_record() {
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

    fn read_record(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; MAX_RECORD_BYTES];

        Ok(nvs
            .get_blob(NVS_SETTINGS_KEY, &mut buffer)?
            .map(|raw| raw.to_vec()))
    }

    fn save_settings(&self, settings: &PersistedSettings) -> anyhow::Result<()> {
        let payload = record::encode(settings)?;
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_blob(NVS_SETTINGS_KEY, &payload)?;
        info!("settings saved ({} bytes)", payload.len());
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
