//! Status indicator: the coordinator's current decision shown on an RGB LED.

use embedded_hal::digital::OutputPin;

/// How long a rejected attempt keeps the error colour up.
pub const ERROR_HOLD_MS: u64 = 2_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Indicator {
    Offline,
    Online,
    Tampered,
    Open,
    Scanning,
    Error,
}

/// Inputs the indicator is derived from.
#[derive(Clone, Copy, Debug, Default)]
pub struct Signals {
    pub online: bool,
    pub open: bool,
    pub tampered: bool,
    pub scanning: bool,
    pub error: bool,
}

impl Indicator {
    /// Highest-priority state wins:
    /// tampered, error, scanning, open, offline, online.
    pub fn resolve(s: Signals) -> Self {
        if s.tampered {
            Indicator::Tampered
        } else if s.error {
            Indicator::Error
        } else if s.scanning {
            Indicator::Scanning
        } else if s.open {
            Indicator::Open
        } else if !s.online {
            Indicator::Offline
        } else {
            Indicator::Online
        }
    }

    /// (red, green, blue)
    pub fn color(self) -> (bool, bool, bool) {
        match self {
            Indicator::Offline => (true, true, false),
            Indicator::Online => (false, true, false),
            Indicator::Tampered => (true, false, false),
            Indicator::Open => (false, false, true),
            Indicator::Scanning => (false, true, true),
            Indicator::Error => (true, false, true),
        }
    }
}

/// Common-cathode RGB LED on three push-pull outputs.
pub struct RgbLed<R, G, B> {
    red: R,
    green: G,
    blue: B,
    shown: Option<Indicator>,
}

impl<R: OutputPin, G: OutputPin, B: OutputPin> RgbLed<R, G, B> {
    pub fn new(red: R, green: G, blue: B) -> Self {
        Self {
            red,
            green,
            blue,
            shown: None,
        }
    }

    /// Drive the pins only when the state changes.
    pub fn show(&mut self, state: Indicator) {
        if self.shown == Some(state) {
            return;
        }
        let (r, g, b) = state.color();
        let ok = self.red.set_state(r.into()).is_ok()
            & self.green.set_state(g.into()).is_ok()
            & self.blue.set_state(b.into()).is_ok();
        if !ok {
            log::warn!("led: failed to set {:?}", state);
            return;
        }
        log::debug!("led: {:?}", state);
        self.shown = Some(state);
    }
}
