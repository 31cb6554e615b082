use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method,
    io::Write,
    wifi::{AccessPointConfiguration, AuthMethod, Configuration},
};
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use safehome_common::{SwitchAction, SwitchConfig, SwitchEngine};

use crate::page;

const WATCHDOG_TIMEOUT_SEC: u32 = 30;

type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<SwitchEngine>>,
    relay: Arc<Mutex<PinDriver<'static, AnyOutputPin, Output>>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = SwitchConfig::default();
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let mut relay = unsafe { PinDriver::output(AnyOutputPin::new(config.relay_pin)) }
        .with_context(|| format!("relay GPIO{} unavailable", config.relay_pin))?;
    relay.set_low()?;
    let pir = unsafe { PinDriver::input(AnyInputPin::new(config.pir_pin)) }
        .with_context(|| format!("PIR GPIO{} unavailable", config.pir_pin))?;

    let wifi = start_access_point(modem, sys_loop, nvs_partition, &config)
        .context("access point startup failed")?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let state = SharedState {
        engine: Arc::new(Mutex::new(SwitchEngine::new(config))),
        relay: Arc::new(Mutex::new(relay)),
    };

    spawn_control_loop(state.clone(), pir);
    let server = create_http_server(state)?;

    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn start_access_point(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &SwitchConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    esp_wifi
        .swap_netif_ap(build_ap_netif(config)?)
        .context("failed to apply access point netif configuration")?;

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: config
            .ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point SSID too long"))?,
        password: config
            .ap_password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    drop(wifi);

    info!(
        "access point `{}` started at {}",
        config.ap_ssid,
        Ipv4Addr::from(config.ap_ip)
    );
    Ok(esp_wifi)
}

fn build_ap_netif(config: &SwitchConfig) -> anyhow::Result<EspNetif> {
    let mask_ip = Ipv4Addr::from(config.ap_subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {mask_ip}"))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway: Ipv4Addr::from(config.ap_ip),
                mask,
            },
            dhcp_enabled: true,
            dns: None,
            secondary_dns: None,
        })),
        ..NetifConfiguration::wifi_default_router()
    };

    Ok(EspNetif::new_with_conf(&conf)?)
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 8 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let status = state.engine.lock().unwrap().status();
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
                .write_all(page::index(status).as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/toggle", Method::Get, move |req| {
            let actions = state.engine.lock().unwrap().toggle();
            if actions.is_empty() {
                info!("toggle ignored in auto mode");
            }
            execute_switch_actions(&state, actions);
            redirect_home(req)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/setmode", Method::Get, move |req| {
            let enabled = match query_param(req.uri(), "auto").as_deref() {
                Some("true") => Some(true),
                Some("false") => Some(false),
                _ => None,
            };

            if let Some(enabled) = enabled {
                let actions = state.engine.lock().unwrap().set_auto_mode(enabled);
                info!("auto mode {}", if enabled { "on" } else { "off" });
                execute_switch_actions(&state, actions);
            }
            redirect_home(req)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/status", Method::Get, move |req| {
            let status = state.engine.lock().unwrap().status();
            let body = serde_json::to_vec(&status)?;
            req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?
                .write_all(&body)?;
            Ok(())
        })?;
    }

    for method in [Method::Get, Method::Post] {
        server.fn_handler::<anyhow::Error, _>("/*", method, |req| {
            req.into_response(404, Some("Not Found"), &[("Content-Type", "text/plain")])?
                .write_all(b"Not found")?;
            Ok(())
        })?;
    }

    Ok(server)
}

fn spawn_control_loop(state: SharedState, pir: PinDriver<'static, AnyInputPin, Input>) {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let period = {
                let engine = state.engine.lock().unwrap();
                Duration::from_millis(engine.config.loop_interval_ms)
            };

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();
                let motion = pir.is_high();

                let actions = {
                    let mut engine = state.engine.lock().unwrap();
                    engine.tick(motion, now_ms)
                };
                execute_switch_actions(&state, actions);

                thread::sleep(period);
            }
        })
        .expect("failed to spawn control loop thread");
}

fn execute_switch_actions(state: &SharedState, actions: Vec<SwitchAction>) {
    for action in actions {
        let mut relay = state.relay.lock().unwrap();
        let result = match action {
            SwitchAction::RelayOn => relay.set_high(),
            SwitchAction::RelayOff => relay.set_low(),
        };

        match result {
            Ok(()) => info!("relay action applied [{action:?}]"),
            Err(err) => warn!("relay action failed [{action:?}]: {err}"),
        }
    }
}

fn redirect_home(req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    req.into_response(302, Some("Found"), &[("Location", "/")])?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then(|| value.to_string())
    })
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
