use crate::{config::SwitchConfig, types::SwitchStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
    RelayOn,
    RelayOff,
}

/// Relay controller for the PIR smart switch.
#[derive(Debug, Clone)]
pub struct SwitchEngine {
    pub config: SwitchConfig,
    relay_on: bool,
    auto_mode: bool,
    motion_pending: bool,
    last_motion_ms: Option<u64>,
}

impl SwitchEngine {
    pub fn new(config: SwitchConfig) -> Self {
        Self {
            config,
            relay_on: false,
            auto_mode: false,
            motion_pending: false,
            last_motion_ms: None,
        }
    }

    pub fn is_relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn is_auto_mode(&self) -> bool {
        self.auto_mode
    }

    pub fn is_motion_pending(&self) -> bool {
        self.motion_pending
    }

    /// One loop iteration. `motion` is the current PIR level; it is only
    /// consulted in auto mode.
    pub fn tick(&mut self, motion: bool, now_ms: u64) -> Vec<SwitchAction> {
        if !self.auto_mode {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if motion {
            self.motion_pending = true;
            self.last_motion_ms = Some(now_ms);
            if !self.relay_on {
                self.relay_on = true;
                actions.push(SwitchAction::RelayOn);
            }
        } else if self.relay_on && self.motion_pending && self.auto_off_elapsed(now_ms) {
            self.motion_pending = false;
            self.relay_on = false;
            actions.push(SwitchAction::RelayOff);
        }

        actions
    }

    /// Manual toggle; ignored while auto mode is on.
    pub fn toggle(&mut self) -> Vec<SwitchAction> {
        if self.auto_mode {
            return Vec::new();
        }

        self.relay_on = !self.relay_on;
        vec![if self.relay_on {
            SwitchAction::RelayOn
        } else {
            SwitchAction::RelayOff
        }]
    }

    pub fn set_auto_mode(&mut self, enabled: bool) -> Vec<SwitchAction> {
        self.auto_mode = enabled;
        self.motion_pending = false;

        if enabled {
            return Vec::new();
        }

        self.relay_on = false;
        vec![SwitchAction::RelayOff]
    }

    pub fn status(&self) -> SwitchStatus {
        SwitchStatus {
            state: self.relay_on,
            auto: self.auto_mode,
            pir: self.motion_pending,
        }
    }

    fn auto_off_elapsed(&self, now_ms: u64) -> bool {
        self.last_motion_ms
            .map(|last| now_ms.saturating_sub(last) > self.config.auto_off_delay_ms)
            .unwrap_or(false)
    }
}
