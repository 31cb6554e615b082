//! Monitor device controller: the single owner of all runtime state the
//! gas/temperature monitor firmware loop and its request handlers share.

use crate::{
    command::{Command, ControlForm},
    config::{MonitorConfig, PersistedSettings},
    debounce::{ButtonBank, ButtonSamples},
    display::{self, LinkInfo, Screen},
    menu::{Menu, MenuCommand, MenuState},
    monitor::{MonitorEngine, OutputAction},
    network::{LinkAction, LinkEvent, WifiLink},
    types::{MonitorStatus, NetworkMode, SensorReading},
};

/// Work the firmware carries out after a controller call, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Relay(bool),
    Alarm(bool),
    Redraw,
    Broadcast,
    SaveSettings,
    StartAccessPoint,
    BeginStation,
}

impl From<OutputAction> for Effect {
    fn from(action: OutputAction) -> Self {
        match action {
            OutputAction::RelayOn => Effect::Relay(true),
            OutputAction::RelayOff => Effect::Relay(false),
            OutputAction::AlarmOn => Effect::Alarm(true),
            OutputAction::AlarmOff => Effect::Alarm(false),
        }
    }
}

impl From<LinkAction> for Effect {
    fn from(action: LinkAction) -> Self {
        match action {
            LinkAction::StartAccessPoint => Effect::StartAccessPoint,
            LinkAction::BeginStation => Effect::BeginStation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorController {
    engine: MonitorEngine,
    menu: Menu,
    buttons: ButtonBank,
    link: WifiLink,
    settings: PersistedSettings,
    device_id: String,
    save_due_ms: Option<u64>,
}

impl MonitorController {
    pub fn new(config: MonitorConfig, settings: PersistedSettings, device_id: String) -> Self {
        let engine = MonitorEngine::new(config.clone(), &settings);
        let link = WifiLink::new(
            config.link_connect_budget_ms,
            settings.has_station_credentials(),
        );

        Self {
            menu: Menu::new(config.temp_step, config.gas_step),
            buttons: ButtonBank::new(config.debounce_ms),
            engine,
            link,
            settings,
            device_id,
            save_due_ms: None,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.engine.config
    }

    pub fn engine(&self) -> &MonitorEngine {
        &self.engine
    }

    pub fn settings(&self) -> &PersistedSettings {
        &self.settings
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn menu_state(&self) -> MenuState {
        self.menu.state()
    }

    pub fn menu_cursor(&self) -> usize {
        self.menu.cursor()
    }

    pub fn link(&self) -> &WifiLink {
        &self.link
    }

    /// Outputs driven low, the link brought up, first screen drawn.
    pub fn start(&mut self, now_ms: u64) -> Vec<Effect> {
        let mut effects = vec![Effect::Relay(false), Effect::Alarm(false)];
        effects.extend(self.link.start(now_ms).into_iter().map(Effect::from));
        effects.push(Effect::Redraw);
        effects
    }

    /// Debounces one sample of the panel buttons and routes press edges
    /// through the menu.
    pub fn service_buttons(&mut self, now_ms: u64, samples: ButtonSamples) -> Vec<Effect> {
        let mut effects = Vec::new();

        for button in self.buttons.update(samples, now_ms) {
            for command in self.menu.press(button) {
                match command {
                    MenuCommand::Redraw => push_once(&mut effects, Effect::Redraw),
                    MenuCommand::AdjustTempThreshold(delta) => {
                        self.engine.adjust_temp_threshold(delta);
                        self.schedule_save(now_ms);
                        push_once(&mut effects, Effect::Broadcast);
                    }
                    MenuCommand::AdjustGasThreshold(delta) => {
                        self.engine.adjust_gas_threshold(delta);
                        self.schedule_save(now_ms);
                        push_once(&mut effects, Effect::Broadcast);
                    }
                    MenuCommand::ToggleNetworkMode => {
                        effects.extend(self.link.toggle(now_ms).into_iter().map(Effect::from));
                    }
                }
            }
        }

        effects
    }

    pub fn sample_due(&self, now_ms: u64) -> bool {
        self.engine.sample_due(now_ms)
    }

    pub fn apply_reading(&mut self, now_ms: u64, reading: SensorReading) -> Vec<Effect> {
        let mut effects: Vec<Effect> = self
            .engine
            .apply_reading(reading, now_ms)
            .into_iter()
            .map(Effect::from)
            .collect();

        if self.menu.state() == MenuState::MainScreen {
            effects.push(Effect::Redraw);
        }
        effects.push(Effect::Broadcast);
        effects
    }

    /// `associated` is the radio's current station status.
    pub fn poll_link(&mut self, now_ms: u64, associated: bool) -> (Option<LinkEvent>, Vec<Effect>) {
        let (event, actions) = self.link.poll(now_ms, associated);
        let mut effects: Vec<Effect> = actions.into_iter().map(Effect::from).collect();

        if event.is_some()
            && matches!(
                self.menu.state(),
                MenuState::WifiSettings | MenuState::DeviceInfo
            )
        {
            effects.push(Effect::Redraw);
        }
        (event, effects)
    }

    /// Applies one WebSocket command. An empty result means the command was
    /// not acted upon.
    pub fn apply_command(&mut self, command: Command) -> Vec<Effect> {
        let mut effects = Vec::new();

        match command {
            Command::GetStatus => {}
            Command::SetRelay { state } => {
                effects.extend(self.engine.set_relay(state).into_iter().map(Effect::from));
            }
            Command::SetAutoMode { state } => {
                if self.engine.set_auto_mode(state) {
                    self.save_now(&mut effects);
                }
            }
            Command::SetThresholds { gas, temp } => {
                let mut changed = false;
                if let Some(gas) = gas {
                    changed |= self.engine.set_gas_threshold(gas);
                }
                if let Some(temp) = temp {
                    changed |= self.engine.set_temp_threshold(temp);
                }
                if changed {
                    self.save_now(&mut effects);
                    self.redraw_if_editing(&mut effects);
                }
            }
            Command::Reset { alarm } => {
                if !alarm {
                    return Vec::new();
                }
                effects.extend(self.engine.reset_alarm().into_iter().map(Effect::from));
                if self.menu.state() == MenuState::MainScreen {
                    effects.push(Effect::Redraw);
                }
            }
        }

        effects.push(Effect::Broadcast);
        effects
    }

    /// Applies a `POST /api/control` form.
    pub fn apply_control(&mut self, form: &ControlForm) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut changed = false;

        if let Some(on) = form.relay() {
            effects.extend(self.engine.set_relay(on).into_iter().map(Effect::from));
        }
        if let Some(enabled) = form.auto_mode() {
            changed |= self.engine.set_auto_mode(enabled);
        }
        if let Some(value) = form.gas_threshold() {
            changed |= self.engine.set_gas_threshold(value);
        }
        if let Some(value) = form.temp_threshold() {
            changed |= self.engine.set_temp_threshold(value);
        }

        if changed {
            self.save_now(&mut effects);
            self.redraw_if_editing(&mut effects);
        }
        effects.push(Effect::Broadcast);
        effects
    }

    /// Replaces the station credentials and restarts the link with them.
    pub fn set_station_credentials(
        &mut self,
        now_ms: u64,
        ssid: String,
        password: String,
    ) -> Vec<Effect> {
        self.settings.station_ssid = ssid;
        self.settings.station_password = password;
        self.settings.sanitize();
        self.link
            .set_station_credentials(self.settings.has_station_credentials());

        let mut effects: Vec<Effect> = self
            .link
            .request_station(now_ms)
            .into_iter()
            .map(Effect::from)
            .collect();
        self.save_now(&mut effects);
        effects
    }

    /// True once the trailing save debounce after a menu edit has run out.
    /// The caller persists [`Self::settings`] when this returns true.
    pub fn take_due_save(&mut self, now_ms: u64) -> bool {
        match self.save_due_ms {
            Some(due) if now_ms >= due => {
                self.save_due_ms = None;
                self.engine.store_settings(&mut self.settings);
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> MonitorStatus {
        self.engine.status(&self.device_id)
    }

    pub fn link_info(&self, ip: &str) -> LinkInfo {
        let ssid = match self.link.mode() {
            NetworkMode::AccessPoint => self.engine.config.ap_ssid.clone(),
            NetworkMode::Station => self.settings.station_ssid.clone(),
        };

        LinkInfo {
            mode: self.link.mode(),
            connecting: self.link.is_connecting(),
            ssid,
            ip: ip.to_string(),
        }
    }

    pub fn screen(&self, ip: &str) -> Screen {
        display::render(
            self.menu.state(),
            self.menu.cursor(),
            self.engine.state(),
            &self.link_info(ip),
            &self.device_id,
        )
    }

    fn schedule_save(&mut self, now_ms: u64) {
        self.save_due_ms = Some(now_ms + self.engine.config.settings_save_debounce_ms);
    }

    fn save_now(&mut self, effects: &mut Vec<Effect>) {
        self.save_due_ms = None;
        self.engine.store_settings(&mut self.settings);
        effects.push(Effect::SaveSettings);
    }

    fn redraw_if_editing(&self, effects: &mut Vec<Effect>) {
        if matches!(
            self.menu.state(),
            MenuState::SetTempThreshold | MenuState::SetGasThreshold
        ) {
            effects.push(Effect::Redraw);
        }
    }
}

fn push_once(effects: &mut Vec<Effect>, effect: Effect) {
    if !effects.contains(&effect) {
        effects.push(effect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debounce::Button;
    use pretty_assertions::assert_eq;

    fn controller() -> MonitorController {
        MonitorController::new(
            MonitorConfig::default(),
            PersistedSettings::default(),
            "A1B2C3D4E5F6".to_string(),
        )
    }

    fn pressed(button: Button) -> ButtonSamples {
        let mut samples = ButtonSamples::default();
        match button {
            Button::Mode => samples.mode = true,
            Button::Up => samples.up = true,
            Button::Down => samples.down = true,
        }
        samples
    }

    /// Holds `button` for 100 ms and releases it for 100 ms, sampling every
    /// loop tick. Returns the effects of the whole press.
    fn press(controller: &mut MonitorController, now_ms: &mut u64, button: Button) -> Vec<Effect> {
        let mut effects = Vec::new();
        for _ in 0..10 {
            effects.extend(controller.service_buttons(*now_ms, pressed(button)));
            *now_ms += 10;
        }
        for _ in 0..10 {
            effects.extend(controller.service_buttons(*now_ms, ButtonSamples::default()));
            *now_ms += 10;
        }
        effects
    }

    #[test]
    fn start_drives_outputs_low_and_opens_access_point() {
        let mut controller = controller();
        assert_eq!(
            controller.start(0),
            vec![
                Effect::Relay(false),
                Effect::Alarm(false),
                Effect::StartAccessPoint,
                Effect::Redraw,
            ]
        );
    }

    #[test]
    fn button_presses_navigate_the_menu() {
        let mut controller = controller();
        let mut now_ms = 1_000;

        assert_eq!(
            press(&mut controller, &mut now_ms, Button::Mode),
            vec![Effect::Redraw]
        );
        assert_eq!(controller.menu_state(), MenuState::MenuMain);

        press(&mut controller, &mut now_ms, Button::Up);
        assert_eq!(controller.menu_cursor(), 3);

        press(&mut controller, &mut now_ms, Button::Down);
        assert_eq!(controller.menu_state(), MenuState::DeviceInfo);
    }

    #[test]
    fn menu_edit_is_saved_after_quiet_period() {
        let mut controller = controller();
        let mut now_ms = 0;
        press(&mut controller, &mut now_ms, Button::Mode);
        press(&mut controller, &mut now_ms, Button::Down);

        let effects = press(&mut controller, &mut now_ms, Button::Up);
        assert_eq!(effects, vec![Effect::Broadcast, Effect::Redraw]);
        assert_eq!(controller.status().temp_threshold, 36.0);

        let edited_at = now_ms;
        assert!(!controller.take_due_save(edited_at + 1_000));
        assert_eq!(controller.settings().temp_threshold, 35.0);

        assert!(controller.take_due_save(edited_at + 5_000));
        assert_eq!(controller.settings().temp_threshold, 36.0);
        assert!(!controller.take_due_save(edited_at + 10_000));
    }

    #[test]
    fn wifi_menu_toggle_starts_station_attempt() {
        let mut controller = MonitorController::new(
            MonitorConfig::default(),
            PersistedSettings {
                station_ssid: "HomeNet".to_string(),
                ..PersistedSettings::default()
            },
            "id".to_string(),
        );
        let mut now_ms = 0;
        press(&mut controller, &mut now_ms, Button::Mode);
        press(&mut controller, &mut now_ms, Button::Up);
        press(&mut controller, &mut now_ms, Button::Up);
        press(&mut controller, &mut now_ms, Button::Down);
        assert_eq!(controller.menu_state(), MenuState::WifiSettings);

        let effects = press(&mut controller, &mut now_ms, Button::Down);

        assert_eq!(
            effects,
            vec![
                Effect::StartAccessPoint,
                Effect::BeginStation,
                Effect::Redraw,
            ]
        );
        assert_eq!(controller.screen("0.0.0.0")[1], "Mode: Connecting...");

        let (event, effects) = controller.poll_link(now_ms + 10_000, false);
        assert_eq!(event, Some(LinkEvent::FellBack));
        assert_eq!(effects, vec![Effect::StartAccessPoint, Effect::Redraw]);
        assert_eq!(controller.link_info("192.168.4.1").ssid, "Smart Gas Monitor");
    }

    #[test]
    fn reading_over_threshold_latches_and_broadcasts() {
        let mut controller = controller();

        let effects = controller.apply_reading(
            2_001,
            SensorReading {
                temperature: Some(24.0),
                humidity: Some(40.0),
                gas_level: 800.0,
            },
        );

        assert_eq!(
            effects,
            vec![
                Effect::Alarm(true),
                Effect::Relay(true),
                Effect::Redraw,
                Effect::Broadcast,
            ]
        );
        assert!(controller.status().alarm_active);
    }

    #[test]
    fn commands_apply_and_broadcast() {
        let mut controller = controller();

        assert_eq!(
            controller.apply_command(Command::GetStatus),
            vec![Effect::Broadcast]
        );
        assert_eq!(
            controller.apply_command(Command::SetRelay { state: true }),
            vec![Effect::Relay(true), Effect::Broadcast]
        );
        assert_eq!(
            controller.apply_command(Command::SetThresholds {
                gas: Some(650.0),
                temp: None,
            }),
            vec![Effect::SaveSettings, Effect::Broadcast]
        );
        assert_eq!(controller.settings().gas_threshold, 650.0);
        assert_eq!(
            controller.apply_command(Command::SetAutoMode { state: true }),
            vec![Effect::Broadcast]
        );
    }

    #[test]
    fn reset_requires_alarm_flag() {
        let mut controller = controller();
        controller.apply_reading(
            2_001,
            SensorReading {
                temperature: Some(50.0),
                humidity: Some(40.0),
                gas_level: 10.0,
            },
        );

        assert!(controller
            .apply_command(Command::Reset { alarm: false })
            .is_empty());
        assert!(controller.status().alarm_active);

        assert_eq!(
            controller.apply_command(Command::Reset { alarm: true }),
            vec![Effect::Alarm(false), Effect::Redraw, Effect::Broadcast]
        );
        assert!(!controller.status().alarm_active);
    }

    #[test]
    fn control_form_saves_changed_fields_once() {
        let mut controller = controller();
        let form = ControlForm {
            relay: Some("1".to_string()),
            auto: Some("false".to_string()),
            gas_threshold: Some("700".to_string()),
            temp_threshold: Some("warm".to_string()),
        };

        let effects = controller.apply_control(&form);

        assert_eq!(
            effects,
            vec![Effect::Relay(true), Effect::SaveSettings, Effect::Broadcast]
        );
        let status = controller.status();
        assert!(status.relay_state);
        assert!(!status.auto_mode);
        assert_eq!(status.gas_threshold, 700.0);
        assert_eq!(status.temp_threshold, 35.0);
        assert!(!controller.settings().auto_mode);
    }
}
