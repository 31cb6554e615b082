pub mod command;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod display;
pub mod menu;
pub mod monitor;
pub mod network;
pub mod record;
pub mod switch;
pub mod types;

pub use command::{parse_command, Command, ControlForm, MAX_COMMAND_BYTES};
pub use config::{MonitorConfig, PersistedSettings, SwitchConfig};
pub use controller::{Effect, MonitorController};
pub use debounce::{Button, ButtonBank, ButtonSamples, Debouncer};
pub use menu::{Menu, MenuState};
pub use monitor::{DeviceState, MonitorEngine, OutputAction};
pub use network::{LinkAction, LinkEvent, LinkState, WifiLink};
pub use record::RecordError;
pub use switch::{SwitchAction, SwitchEngine};
pub use types::{
    device_id_from_mac, ControlAck, MonitorStatus, NetworkMode, SensorReading, SwitchStatus,
};
