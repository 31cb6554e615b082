//! Time-based debounce for polled push buttons.

/// Debounce state for one digital input.
///
/// The raw level must stay unchanged for `quiet_ms` before it is accepted
/// as the new debounced level. Any raw change restarts the quiet window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    quiet_ms: u64,
    raw: bool,
    level: bool,
    last_change_ms: u64,
}

impl Debouncer {
    pub fn new(quiet_ms: u64) -> Self {
        Self {
            quiet_ms,
            raw: false,
            level: false,
            last_change_ms: 0,
        }
    }

    pub fn level(&self) -> bool {
        self.level
    }

    /// Feeds one raw sample. Returns `true` on the sample where the
    /// debounced level goes from released to pressed.
    pub fn update(&mut self, raw: bool, now_ms: u64) -> bool {
        if raw != self.raw {
            self.raw = raw;
            self.last_change_ms = now_ms;
            return false;
        }

        if now_ms.saturating_sub(self.last_change_ms) <= self.quiet_ms {
            return false;
        }

        if self.level == raw {
            return false;
        }

        self.level = raw;
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Mode,
    Up,
    Down,
}

impl Button {
    pub const ALL: [Button; 3] = [Button::Mode, Button::Up, Button::Down];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mode => "mode",
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mode" => Some(Self::Mode),
            "up" => Some(Self::Up),
            "down" | "select" => Some(Self::Down),
            _ => None,
        }
    }
}

/// Raw pressed/released levels for the three panel buttons, already
/// converted from the active-low pins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonSamples {
    pub mode: bool,
    pub up: bool,
    pub down: bool,
}

impl ButtonSamples {
    fn get(&self, button: Button) -> bool {
        match button {
            Button::Mode => self.mode,
            Button::Up => self.up,
            Button::Down => self.down,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ButtonBank {
    mode: Debouncer,
    up: Debouncer,
    down: Debouncer,
}

impl ButtonBank {
    pub fn new(quiet_ms: u64) -> Self {
        Self {
            mode: Debouncer::new(quiet_ms),
            up: Debouncer::new(quiet_ms),
            down: Debouncer::new(quiet_ms),
        }
    }

    /// Updates every button and returns the ones that were pressed on this
    /// sample, in mode/up/down order.
    pub fn update(&mut self, samples: ButtonSamples, now_ms: u64) -> Vec<Button> {
        Button::ALL
            .into_iter()
            .filter(|button| self.debouncer_mut(*button).update(samples.get(*button), now_ms))
            .collect()
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        match button {
            Button::Mode => self.mode.level(),
            Button::Up => self.up.level(),
            Button::Down => self.down.level(),
        }
    }

    fn debouncer_mut(&mut self, button: Button) -> &mut Debouncer {
        match button {
            Button::Mode => &mut self.mode,
            Button::Up => &mut self.up,
            Button::Down => &mut self.down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(debouncer: &mut Debouncer, samples: &[(u64, bool)]) -> Vec<(u64, bool)> {
        let mut changes = Vec::new();
        let mut level = debouncer.level();
        for &(now_ms, raw) in samples {
            debouncer.update(raw, now_ms);
            if debouncer.level() != level {
                level = debouncer.level();
                changes.push((now_ms, level));
            }
        }
        changes
    }

    #[test]
    fn accepts_press_after_quiet_window() {
        let mut debouncer = Debouncer::new(50);
        let samples: Vec<(u64, bool)> = (0..=10).map(|tick| (1_000 + tick * 10, true)).collect();

        let changes = run(&mut debouncer, &samples);

        assert_eq!(changes, vec![(1_060, true)]);
    }

    #[test]
    fn reports_press_edge_once() {
        let mut debouncer = Debouncer::new(50);
        let mut edges = 0;
        for tick in 0..50 {
            if debouncer.update(true, 1_000 + tick * 10) {
                edges += 1;
            }
        }
        assert_eq!(edges, 1);

        for tick in 50..100 {
            assert!(!debouncer.update(false, 1_000 + tick * 10));
        }
        assert!(!debouncer.level());
    }

    #[test]
    fn bouncing_input_never_chatters() {
        let mut debouncer = Debouncer::new(50);
        let mut samples = Vec::new();
        // 200 ms of contact bounce, then a solid press.
        for tick in 0..20 {
            samples.push((1_000 + tick * 10, tick % 2 == 0));
        }
        for tick in 20..40 {
            samples.push((1_000 + tick * 10, true));
        }

        let changes = run(&mut debouncer, &samples);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].1, true);
        assert!(changes[0].0 > 1_190 + 50);
    }

    #[test]
    fn level_changes_are_at_least_one_window_apart() {
        let mut debouncer = Debouncer::new(50);
        let pattern = [
            true, true, false, true, true, true, true, true, true, true, true, false, false,
            false, false, false, false, false, false, true, false, true, true, true, true, true,
            true, true, true, true,
        ];
        let samples: Vec<(u64, bool)> = pattern
            .iter()
            .enumerate()
            .map(|(index, raw)| (500 + index as u64 * 10, *raw))
            .collect();

        let changes = run(&mut debouncer, &samples);

        for pair in changes.windows(2) {
            assert!(pair[1].0 - pair[0].0 > 50);
        }
    }

    #[test]
    fn bank_debounces_buttons_independently() {
        let mut bank = ButtonBank::new(50);
        let mut pressed = Vec::new();

        for tick in 0..10 {
            let samples = ButtonSamples {
                mode: true,
                up: tick % 2 == 0,
                down: false,
            };
            pressed.extend(bank.update(samples, 1_000 + tick * 10));
        }

        assert_eq!(pressed, vec![Button::Mode]);
        assert!(bank.is_pressed(Button::Mode));
        assert!(!bank.is_pressed(Button::Up));
    }

    #[test]
    fn parses_button_names() {
        assert_eq!(Button::parse("MODE"), Some(Button::Mode));
        assert_eq!(Button::parse("select"), Some(Button::Down));
        assert_eq!(Button::parse("left"), None);
    }
}
