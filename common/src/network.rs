//! Non-blocking WiFi mode management.
//!
//! The access point is always up. A station attempt runs in the background
//! and is polled from the control loop, falling back to access-point mode
//! when association does not complete within the budget.

use crate::types::NetworkMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    AccessPoint,
    Connecting { since_ms: u64 },
    Station,
}

/// Radio work the firmware has to carry out for a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    StartAccessPoint,
    BeginStation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    FellBack,
    Lost,
}

#[derive(Debug, Clone)]
pub struct WifiLink {
    state: LinkState,
    budget_ms: u64,
    has_station_credentials: bool,
}

impl WifiLink {
    pub fn new(budget_ms: u64, has_station_credentials: bool) -> Self {
        Self {
            state: LinkState::AccessPoint,
            budget_ms,
            has_station_credentials,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Mode shown to the user. A pending attempt already counts as station.
    pub fn mode(&self) -> NetworkMode {
        match self.state {
            LinkState::AccessPoint => NetworkMode::AccessPoint,
            LinkState::Connecting { .. } | LinkState::Station => NetworkMode::Station,
        }
    }

    /// Interface that currently holds a usable address. The access point
    /// keeps serving until the station is associated.
    pub fn addressed_interface(&self) -> NetworkMode {
        match self.state {
            LinkState::Station => NetworkMode::Station,
            LinkState::AccessPoint | LinkState::Connecting { .. } => NetworkMode::AccessPoint,
        }
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state, LinkState::Connecting { .. })
    }

    pub fn set_station_credentials(&mut self, available: bool) {
        self.has_station_credentials = available;
    }

    /// Startup: try the station when credentials exist, otherwise stay an
    /// access point.
    pub fn start(&mut self, now_ms: u64) -> Vec<LinkAction> {
        if self.has_station_credentials {
            self.request_station(now_ms)
        } else {
            self.request_access_point()
        }
    }

    pub fn request_station(&mut self, now_ms: u64) -> Vec<LinkAction> {
        if !self.has_station_credentials {
            return self.request_access_point();
        }
        self.state = LinkState::Connecting { since_ms: now_ms };
        vec![LinkAction::StartAccessPoint, LinkAction::BeginStation]
    }

    pub fn request_access_point(&mut self) -> Vec<LinkAction> {
        self.state = LinkState::AccessPoint;
        vec![LinkAction::StartAccessPoint]
    }

    pub fn toggle(&mut self, now_ms: u64) -> Vec<LinkAction> {
        match self.mode() {
            NetworkMode::AccessPoint => self.request_station(now_ms),
            NetworkMode::Station => self.request_access_point(),
        }
    }

    /// Advances a pending attempt. `associated` is the station link status
    /// reported by the radio.
    pub fn poll(&mut self, now_ms: u64, associated: bool) -> (Option<LinkEvent>, Vec<LinkAction>) {
        match self.state {
            LinkState::AccessPoint => (None, Vec::new()),
            LinkState::Connecting { since_ms } => {
                if associated {
                    self.state = LinkState::Station;
                    (Some(LinkEvent::Connected), Vec::new())
                } else if now_ms.saturating_sub(since_ms) >= self.budget_ms {
                    (Some(LinkEvent::FellBack), self.request_access_point())
                } else {
                    (None, Vec::new())
                }
            }
            LinkState::Station => {
                if associated {
                    (None, Vec::new())
                } else {
                    (Some(LinkEvent::Lost), self.request_access_point())
                }
            }
        }
    }
}
