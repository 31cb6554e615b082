//! Character LCD screen composition.

use crate::{
    menu::{MenuState, MENU_ITEMS, MENU_ITEM_COUNT},
    monitor::DeviceState,
    types::NetworkMode,
};

pub const LCD_COLS: usize = 20;
pub const LCD_ROWS: usize = 4;

/// HD44780 ROM code for the degree sign; rendered as `°` in text form.
pub const DEGREE: char = '°';

pub type Screen = [String; LCD_ROWS];

/// Network facts shown on the WiFi and device info screens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub mode: NetworkMode,
    pub connecting: bool,
    pub ssid: String,
    pub ip: String,
}

pub fn render(
    menu: MenuState,
    cursor: usize,
    state: &DeviceState,
    link: &LinkInfo,
    device_id: &str,
) -> Screen {
    let lines = match menu {
        MenuState::MainScreen => main_screen(state),
        MenuState::MenuMain => menu_screen(cursor),
        MenuState::SetTempThreshold => [
            "Temp. Thresh".to_string(),
            format!("Curr: {:.1}{DEGREE}C", state.temp_threshold),
            "UP: +1  DOWN: -1".to_string(),
            "MODE: Back to Menu".to_string(),
        ],
        MenuState::SetGasThreshold => [
            "Gas Thresh".to_string(),
            format!("Curr: {:.0}", state.gas_threshold),
            "UP: +10  DOWN: -10".to_string(),
            "MODE: Back to Menu".to_string(),
        ],
        MenuState::WifiSettings => [
            "WiFi Settings".to_string(),
            if link.connecting {
                "Mode: Connecting...".to_string()
            } else {
                format!("Mode: {}", link.mode.as_str())
            },
            format!("SSID: {}", link.ssid),
            "MODE: Back to Menu".to_string(),
        ],
        MenuState::DeviceInfo => [
            "Device Information".to_string(),
            format!("ID: {}", device_id.chars().take(10).collect::<String>()),
            format!("IP: {}", link.ip),
            "MODE: Back to Menu".to_string(),
        ],
    };

    lines.map(fit)
}

fn main_screen(state: &DeviceState) -> Screen {
    [
        format!("Temp: {:.1}{DEGREE}C", state.temperature),
        format!("Humidity: {:.1}%", state.humidity),
        format!("Gas Level: {:.0}", state.gas_level),
        if state.alarm_active {
            "ALARM ACTIVE!".to_string()
        } else {
            "Status: Normal".to_string()
        },
    ]
}

fn menu_screen(cursor: usize) -> Screen {
    let visible = LCD_ROWS - 1;
    let first = cursor.saturating_sub(visible - 1).min(MENU_ITEM_COUNT - visible);

    let mut lines: Screen = Default::default();
    lines[0] = "MENU:".to_string();
    for (row, index) in (first..first + visible).enumerate() {
        let marker = if index == cursor { "> " } else { "  " };
        lines[row + 1] = format!("{marker}{}", MENU_ITEMS[index]);
    }
    lines
}

fn fit(line: String) -> String {
    if line.chars().count() <= LCD_COLS {
        line
    } else {
        line.chars().take(LCD_COLS).collect()
    }
}
