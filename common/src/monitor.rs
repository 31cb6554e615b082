use crate::{
    config::{MonitorConfig, PersistedSettings},
    types::{MonitorStatus, SensorReading},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAction {
    RelayOn,
    RelayOff,
    AlarmOn,
    AlarmOff,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub relay_on: bool,
    pub auto_mode: bool,
    pub alarm_active: bool,
    pub temperature: f32,
    pub humidity: f32,
    pub gas_level: f32,
    pub gas_threshold: f32,
    pub temp_threshold: f32,
}

/// Threshold evaluation and the latched alarm for the gas/temperature
/// monitor.
#[derive(Debug, Clone)]
pub struct MonitorEngine {
    pub config: MonitorConfig,
    state: DeviceState,
    last_sample_ms: Option<u64>,
}

impl MonitorEngine {
    pub fn new(config: MonitorConfig, settings: &PersistedSettings) -> Self {
        Self {
            config,
            state: DeviceState {
                relay_on: false,
                auto_mode: settings.auto_mode,
                alarm_active: false,
                temperature: 0.0,
                humidity: 0.0,
                gas_level: 0.0,
                gas_threshold: settings.gas_threshold,
                temp_threshold: settings.temp_threshold,
            },
            last_sample_ms: None,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn is_relay_on(&self) -> bool {
        self.state.relay_on
    }

    pub fn is_alarm_active(&self) -> bool {
        self.state.alarm_active
    }

    pub fn sample_due(&self, now_ms: u64) -> bool {
        self.last_sample_ms
            .map(|last| now_ms.saturating_sub(last) > self.config.sample_interval_ms)
            .unwrap_or(true)
    }

    /// Stores one sensing cycle and evaluates the thresholds.
    pub fn apply_reading(&mut self, reading: SensorReading, now_ms: u64) -> Vec<OutputAction> {
        self.last_sample_ms = Some(now_ms);

        if let (Some(temperature), Some(humidity)) = (reading.temperature, reading.humidity) {
            if temperature.is_finite() && humidity.is_finite() {
                self.state.temperature = temperature;
                self.state.humidity = humidity;
            }
        }
        self.state.gas_level = reading.gas_level;

        let mut actions = Vec::new();
        self.check_alarms(&mut actions);
        actions
    }

    pub fn set_relay(&mut self, on: bool) -> Vec<OutputAction> {
        self.state.relay_on = on;
        vec![if on {
            OutputAction::RelayOn
        } else {
            OutputAction::RelayOff
        }]
    }

    pub fn set_auto_mode(&mut self, enabled: bool) -> bool {
        if self.state.auto_mode != enabled {
            self.state.auto_mode = enabled;
            true
        } else {
            false
        }
    }

    pub fn set_gas_threshold(&mut self, value: f32) -> bool {
        if (self.state.gas_threshold - value).abs() > f32::EPSILON {
            self.state.gas_threshold = value;
            true
        } else {
            false
        }
    }

    pub fn set_temp_threshold(&mut self, value: f32) -> bool {
        if (self.state.temp_threshold - value).abs() > f32::EPSILON {
            self.state.temp_threshold = value;
            true
        } else {
            false
        }
    }

    // Menu edits are not clamped.
    pub fn adjust_gas_threshold(&mut self, delta: f32) {
        self.state.gas_threshold += delta;
    }

    pub fn adjust_temp_threshold(&mut self, delta: f32) {
        self.state.temp_threshold += delta;
    }

    /// Acknowledges the latched alarm.
    pub fn reset_alarm(&mut self) -> Vec<OutputAction> {
        self.state.alarm_active = false;
        vec![OutputAction::AlarmOff]
    }

    /// Writes the persisted fields of the live state back into `settings`.
    pub fn store_settings(&self, settings: &mut PersistedSettings) {
        settings.gas_threshold = self.state.gas_threshold;
        settings.temp_threshold = self.state.temp_threshold;
        settings.auto_mode = self.state.auto_mode;
    }

    pub fn status(&self, device_id: &str) -> MonitorStatus {
        MonitorStatus {
            device_id: device_id.to_string(),
            temperature: self.state.temperature,
            humidity: self.state.humidity,
            gas_level: self.state.gas_level,
            alarm_active: self.state.alarm_active,
            relay_state: self.state.relay_on,
            auto_mode: self.state.auto_mode,
            gas_threshold: self.state.gas_threshold,
            temp_threshold: self.state.temp_threshold,
        }
    }

    fn check_alarms(&mut self, actions: &mut Vec<OutputAction>) {
        let should_alarm = self.state.gas_level > self.state.gas_threshold
            || self.state.temperature > self.state.temp_threshold;

        // Never cleared here; only `reset_alarm` drops the latch.
        if !should_alarm || self.state.alarm_active {
            return;
        }

        self.state.alarm_active = true;
        actions.push(OutputAction::AlarmOn);

        if self.state.auto_mode {
            self.state.relay_on = true;
            actions.push(OutputAction::RelayOn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn engine(auto_mode: bool) -> MonitorEngine {
        let settings = PersistedSettings {
            auto_mode,
            ..PersistedSettings::default()
        };
        MonitorEngine::new(MonitorConfig::default(), &settings)
    }

    fn reading(temperature: f32, gas_level: f32) -> SensorReading {
        SensorReading {
            temperature: Some(temperature),
            humidity: Some(40.0),
            gas_level,
        }
    }

    #[test]
    fn gas_over_threshold_latches_alarm_and_relay_in_auto() {
        let mut engine = engine(true);

        let actions = engine.apply_reading(reading(22.0, 650.0), 2_001);

        assert_eq!(actions, vec![OutputAction::AlarmOn, OutputAction::RelayOn]);
        assert!(engine.is_alarm_active());
        assert!(engine.is_relay_on());
    }

    #[test]
    fn manual_mode_alarm_leaves_relay_alone() {
        let mut engine = engine(false);

        let actions = engine.apply_reading(reading(36.5, 100.0), 2_001);

        assert_eq!(actions, vec![OutputAction::AlarmOn]);
        assert!(engine.is_alarm_active());
        assert!(!engine.is_relay_on());
    }

    #[test]
    fn alarm_stays_latched_until_reset() {
        let mut engine = engine(true);
        engine.apply_reading(reading(22.0, 900.0), 2_001);

        for cycle in 2..10 {
            let actions = engine.apply_reading(reading(22.0, 120.0), cycle * 2_001);
            assert!(actions.is_empty());
            assert!(engine.is_alarm_active());
        }

        assert_eq!(engine.reset_alarm(), vec![OutputAction::AlarmOff]);
        assert!(!engine.is_alarm_active());

        let actions = engine.apply_reading(reading(22.0, 120.0), 30_000);
        assert!(actions.is_empty());
        assert!(!engine.is_alarm_active());
    }

    #[test]
    fn active_alarm_is_not_retriggered() {
        let mut engine = engine(true);
        engine.apply_reading(reading(22.0, 900.0), 2_001);
        engine.set_relay(false);

        let actions = engine.apply_reading(reading(22.0, 950.0), 4_002);

        assert!(actions.is_empty());
        assert!(!engine.is_relay_on());
    }

    #[test]
    fn invalid_dht_reading_keeps_last_good_values() {
        let mut engine = engine(false);
        engine.apply_reading(reading(24.5, 100.0), 2_001);

        engine.apply_reading(
            SensorReading {
                temperature: None,
                humidity: Some(55.0),
                gas_level: 140.0,
            },
            4_002,
        );
        engine.apply_reading(
            SensorReading {
                temperature: Some(f32::NAN),
                humidity: Some(55.0),
                gas_level: 150.0,
            },
            6_003,
        );

        assert_eq!(engine.state().temperature, 24.5);
        assert_eq!(engine.state().humidity, 40.0);
        assert_eq!(engine.state().gas_level, 150.0);
    }

    #[test]
    fn sample_is_due_after_interval() {
        let mut engine = engine(false);
        assert!(engine.sample_due(0));

        engine.apply_reading(reading(20.0, 10.0), 1_000);
        assert!(!engine.sample_due(2_000));
        assert!(!engine.sample_due(3_000));
        assert!(engine.sample_due(3_001));
    }

    #[test]
    fn threshold_edits_are_not_clamped() {
        let mut engine = engine(false);
        for _ in 0..60 {
            engine.adjust_gas_threshold(-10.0);
        }
        engine.adjust_temp_threshold(-40.0);

        assert_eq!(engine.state().gas_threshold, -100.0);
        assert_eq!(engine.state().temp_threshold, -5.0);
    }

    #[test]
    fn store_settings_copies_persisted_fields() {
        let mut engine = engine(true);
        engine.set_gas_threshold(720.0);
        engine.set_temp_threshold(41.0);
        engine.set_auto_mode(false);

        let mut settings = PersistedSettings::default();
        engine.store_settings(&mut settings);

        assert_eq!(settings.gas_threshold, 720.0);
        assert_eq!(settings.temp_threshold, 41.0);
        assert!(!settings.auto_mode);
    }
}
