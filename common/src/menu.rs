use serde::Serialize;

use crate::debounce::Button;

pub const MENU_ITEM_COUNT: usize = 4;

pub const MENU_ITEMS: [&str; MENU_ITEM_COUNT] =
    ["Temperature", "Gas Level", "WiFi Settings", "Device Info"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MenuState {
    MainScreen,
    MenuMain,
    SetTempThreshold,
    SetGasThreshold,
    WifiSettings,
    DeviceInfo,
}

impl MenuState {
    fn leaf_at(cursor: usize) -> Self {
        match cursor {
            0 => Self::SetTempThreshold,
            1 => Self::SetGasThreshold,
            2 => Self::WifiSettings,
            _ => Self::DeviceInfo,
        }
    }
}

/// What the owner of the menu has to do after a button press.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MenuCommand {
    Redraw,
    AdjustTempThreshold(f32),
    AdjustGasThreshold(f32),
    ToggleNetworkMode,
}

#[derive(Debug, Clone)]
pub struct Menu {
    state: MenuState,
    cursor: usize,
    temp_step: f32,
    gas_step: f32,
}

impl Menu {
    pub fn new(temp_step: f32, gas_step: f32) -> Self {
        Self {
            state: MenuState::MainScreen,
            cursor: 0,
            temp_step,
            gas_step,
        }
    }

    pub fn state(&self) -> MenuState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Handles one debounced press. An empty result means the press had no
    /// meaning in the current state.
    pub fn press(&mut self, button: Button) -> Vec<MenuCommand> {
        match button {
            Button::Mode => self.press_mode(),
            Button::Up => self.press_up(),
            Button::Down => self.press_down(),
        }
    }

    fn press_mode(&mut self) -> Vec<MenuCommand> {
        if self.state == MenuState::MainScreen {
            self.state = MenuState::MenuMain;
            self.cursor = 0;
        } else {
            self.state = MenuState::MainScreen;
        }
        vec![MenuCommand::Redraw]
    }

    fn press_up(&mut self) -> Vec<MenuCommand> {
        match self.state {
            MenuState::MenuMain => {
                self.cursor = (self.cursor + MENU_ITEM_COUNT - 1) % MENU_ITEM_COUNT;
                vec![MenuCommand::Redraw]
            }
            MenuState::SetTempThreshold => vec![
                MenuCommand::AdjustTempThreshold(self.temp_step),
                MenuCommand::Redraw,
            ],
            MenuState::SetGasThreshold => vec![
                MenuCommand::AdjustGasThreshold(self.gas_step),
                MenuCommand::Redraw,
            ],
            MenuState::WifiSettings => {
                vec![MenuCommand::ToggleNetworkMode, MenuCommand::Redraw]
            }
            MenuState::MainScreen | MenuState::DeviceInfo => Vec::new(),
        }
    }

    fn press_down(&mut self) -> Vec<MenuCommand> {
        match self.state {
            MenuState::MenuMain => {
                self.state = MenuState::leaf_at(self.cursor);
                vec![MenuCommand::Redraw]
            }
            MenuState::SetTempThreshold => vec![
                MenuCommand::AdjustTempThreshold(-self.temp_step),
                MenuCommand::Redraw,
            ],
            MenuState::SetGasThreshold => vec![
                MenuCommand::AdjustGasThreshold(-self.gas_step),
                MenuCommand::Redraw,
            ],
            MenuState::WifiSettings => {
                vec![MenuCommand::ToggleNetworkMode, MenuCommand::Redraw]
            }
            MenuState::MainScreen | MenuState::DeviceInfo => Vec::new(),
        }
    }
}
