//! Remote commands accepted by the monitor over WebSocket and the control
//! form.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    GetStatus,
    SetRelay {
        state: bool,
    },
    SetAutoMode {
        state: bool,
    },
    SetThresholds {
        #[serde(default)]
        gas: Option<f32>,
        #[serde(default)]
        temp: Option<f32>,
    },
    Reset {
        #[serde(default)]
        alarm: bool,
    },
}

/// Largest WebSocket text frame taken as a command.
pub const MAX_COMMAND_BYTES: usize = 256;

/// Parses one WebSocket text frame. Anything that is not a well-formed,
/// known command, or is longer than [`MAX_COMMAND_BYTES`], yields `None`.
pub fn parse_command(text: &str) -> Option<Command> {
    if text.len() > MAX_COMMAND_BYTES {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// Form body of `POST /api/control`. Every field is optional and kept as
/// text so a bad number only drops that one field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlForm {
    pub relay: Option<String>,
    pub auto: Option<String>,
    #[serde(rename = "gasThreshold")]
    pub gas_threshold: Option<String>,
    #[serde(rename = "tempThreshold")]
    pub temp_threshold: Option<String>,
}

impl ControlForm {
    pub fn relay(&self) -> Option<bool> {
        self.relay.as_deref().map(parse_switch)
    }

    pub fn auto_mode(&self) -> Option<bool> {
        self.auto.as_deref().map(parse_switch)
    }

    pub fn gas_threshold(&self) -> Option<f32> {
        self.gas_threshold.as_deref().and_then(parse_number)
    }

    pub fn temp_threshold(&self) -> Option<f32> {
        self.temp_threshold.as_deref().and_then(parse_number)
    }
}

fn parse_switch(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "on")
}

fn parse_number(value: &str) -> Option<f32> {
    value.trim().parse::<f32>().ok().filter(|number| number.is_finite())
}
