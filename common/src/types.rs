use serde::{Deserialize, Serialize};

/// Full monitor state as served by `/api/status` and broadcast over the
/// WebSocket channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub temperature: f32,
    pub humidity: f32,
    #[serde(rename = "gasLevel")]
    pub gas_level: f32,
    #[serde(rename = "alarmActive")]
    pub alarm_active: bool,
    #[serde(rename = "relayState")]
    pub relay_state: bool,
    #[serde(rename = "autoMode")]
    pub auto_mode: bool,
    #[serde(rename = "gasThreshold")]
    pub gas_threshold: f32,
    #[serde(rename = "tempThreshold")]
    pub temp_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchStatus {
    pub state: bool,
    pub auto: bool,
    pub pir: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlAck {
    pub status: &'static str,
}

impl ControlAck {
    pub fn ok() -> Self {
        Self { status: "ok" }
    }
}

/// One sensing cycle worth of raw readings. `None` marks a failed DHT read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub gas_level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    AccessPoint,
    Station,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessPoint => "AP",
            Self::Station => "Station",
        }
    }
}

/// Device id derived from the station MAC: each octet in upper-case hex
/// without zero padding.
pub fn device_id_from_mac(mac: [u8; 6]) -> String {
    mac.iter().map(|octet| format!("{octet:X}")).collect()
}
