use serde::{Deserialize, Serialize};

pub const DEFAULT_GAS_THRESHOLD: f32 = 500.0;
pub const DEFAULT_TEMP_THRESHOLD: f32 = 35.0;
pub const DEFAULT_AP_PASSWORD: &str = "12345678";

/// Highest raw reading of the 12-bit gas sensor ADC.
pub const GAS_ADC_MAX: f32 = 4095.0;
pub const MAX_VALID_TEMP_THRESHOLD: f32 = 100.0;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub loop_interval_ms: u64,
    pub debounce_ms: u64,
    pub sample_interval_ms: u64,
    pub link_connect_budget_ms: u64,
    pub settings_save_debounce_ms: u64,
    pub temp_step: f32,
    pub gas_step: f32,
    pub ap_ssid: String,
    pub pins: MonitorPins,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 10,
            debounce_ms: 50,
            sample_interval_ms: 2_000,
            link_connect_budget_ms: 10_000,
            settings_save_debounce_ms: 5_000,
            temp_step: 1.0,
            gas_step: 10.0,
            ap_ssid: "Smart Gas Monitor".to_string(),
            pins: MonitorPins::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorPins {
    pub dht: i32,
    pub mode_button: i32,
    pub up_button: i32,
    pub down_button: i32,
    pub alarm: i32,
    pub gas_sensor: i32,
    pub relay: i32,
    pub lcd_sda: i32,
    pub lcd_scl: i32,
    pub lcd_address: u8,
}

impl Default for MonitorPins {
    fn default() -> Self {
        Self {
            dht: 4,
            mode_button: 26,
            up_button: 27,
            down_button: 25,
            alarm: 23,
            gas_sensor: 33,
            relay: 16,
            lcd_sda: 21,
            lcd_scl: 22,
            lcd_address: 0x27,
        }
    }
}

/// ESP32 pins sampled at reset to pick the boot mode.
pub const STRAPPING_PINS: [i32; 5] = [0, 2, 5, 12, 15];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub loop_interval_ms: u64,
    pub auto_off_delay_ms: u64,
    pub ap_ssid: String,
    pub ap_password: String,
    pub ap_ip: [u8; 4],
    pub ap_subnet: [u8; 4],
    pub relay_pin: i32,
    pub pir_pin: i32,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 10,
            auto_off_delay_ms: 60_000,
            ap_ssid: "SmartSwitch".to_string(),
            ap_password: "switch1234".to_string(),
            ap_ip: [192, 168, 4, 1],
            ap_subnet: [255, 255, 255, 0],
            relay_pin: 26,
            pir_pin: 27,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub gas_threshold: f32,
    pub temp_threshold: f32,
    pub auto_mode: bool,
    pub ap_password: String,
    #[serde(default)]
    pub station_ssid: String,
    #[serde(default)]
    pub station_password: String,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            gas_threshold: DEFAULT_GAS_THRESHOLD,
            temp_threshold: DEFAULT_TEMP_THRESHOLD,
            auto_mode: true,
            ap_password: DEFAULT_AP_PASSWORD.to_string(),
            station_ssid: String::new(),
            station_password: String::new(),
        }
    }
}

impl PersistedSettings {
    /// Replaces anything a corrupted or hand-edited record could carry with
    /// the factory value. Thresholds edited at runtime are not clamped.
    pub fn sanitize(&mut self) {
        if !valid_gas_threshold(self.gas_threshold) {
            self.gas_threshold = DEFAULT_GAS_THRESHOLD;
        }
        if !valid_temp_threshold(self.temp_threshold) {
            self.temp_threshold = DEFAULT_TEMP_THRESHOLD;
        }

        if self.ap_password.is_empty() || self.ap_password.len() > MAX_PASSWORD_LEN {
            self.ap_password = DEFAULT_AP_PASSWORD.to_string();
        }
        if self.station_ssid.len() > MAX_SSID_LEN {
            self.station_ssid.clear();
        }
        if self.station_password.len() > MAX_PASSWORD_LEN {
            self.station_password.clear();
        }
    }

    pub fn has_station_credentials(&self) -> bool {
        !self.station_ssid.trim().is_empty()
    }
}

fn valid_gas_threshold(value: f32) -> bool {
    !value.is_nan() && (0.0..=GAS_ADC_MAX).contains(&value)
}

fn valid_temp_threshold(value: f32) -> bool {
    !value.is_nan() && (0.0..=MAX_VALID_TEMP_THRESHOLD).contains(&value)
}
