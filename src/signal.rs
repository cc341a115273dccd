//! Optical OTP receiver.
//!
//! Turns photodetector samples into OTP text. Each call to
//! [`SignalDecoder::poll`] consumes at most one sample; nothing here blocks.
//!
//! Pipeline per sample:
//! 1. 3-sample moving average
//! 2. hysteretic threshold (re-baselined from ambient min/max while idle)
//! 3. debounced light/dark transitions
//! 4. pulse/gap classification into [`Symbol`]s
//!
//! A transmission ends after [`MESSAGE_TIMEOUT_MS`] of darkness and is then
//! validated and translated by [`decode_symbols`].

use heapless::{String, Vec};

use crate::morse;
use crate::otp::OtpText;

// Timing constants (one unit is the dot length)
pub const SAMPLE_INTERVAL_MS: u64 = 5;
pub const UNIT_MS: u64 = 70;
pub const DASH_MS: u64 = 175;
pub const LETTER_GAP_MS: u64 = 3 * UNIT_MS;
pub const WORD_GAP_MS: u64 = 7 * UNIT_MS;
pub const DEBOUNCE_MS: u64 = 50;
pub const MESSAGE_TIMEOUT_MS: u64 = 1_000;

/// Maximum symbols buffered for one transmission.
pub const MAX_SYMBOLS: usize = 48;
/// Maximum rendered symbol text accepted for translation.
pub const MAX_SYMBOL_TEXT: usize = 96;

// Threshold tuning for a 12-bit ADC
const INITIAL_THRESHOLD: u16 = 500;
const HYSTERESIS: u16 = 40;
const MIN_THRESHOLD: u16 = 100;
const MAX_THRESHOLD: u16 = 3_900;
const FLAT_RANGE: u16 = 100;
const CALIBRATION_WINDOW_MS: u64 = 5_000;

const SMOOTHING: usize = 3;
const RENDER_CAP: usize = MAX_SYMBOLS * 3;

/// One element of the symbol stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symbol {
    Dot,
    Dash,
    LetterGap,
    WordGap,
}

impl Symbol {
    fn as_str(self) -> &'static str {
        match self {
            Symbol::Dot => ".",
            Symbol::Dash => "-",
            Symbol::LetterGap => " ",
            Symbol::WordGap => " / ",
        }
    }
}

/// Why a finished transmission was not handed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reject {
    Empty,
    DoubleGap,
    TooLong,
    LengthMismatch { decoded: usize },
}

impl core::fmt::Display for Reject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Reject::Empty => write!(f, "empty transmission"),
            Reject::DoubleGap => write!(f, "double letter gap"),
            Reject::TooLong => write!(f, "transmission too long"),
            Reject::LengthMismatch { decoded } => {
                write!(f, "decoded {} characters", decoded)
            }
        }
    }
}

/// Validate and translate a rendered symbol string.
///
/// Letters are separated by single spaces and words by `" / "`; a word break
/// decodes to a space. Malformed input is rejected before any translation.
pub fn decode_symbols(symbols: &str, otp_len: usize) -> Result<OtpText, Reject> {
    decode_symbols_with(symbols, otp_len, morse::translate)
}

/// [`decode_symbols`] with a caller-supplied group translator.
pub fn decode_symbols_with(
    symbols: &str,
    otp_len: usize,
    mut translate: impl FnMut(&str) -> char,
) -> Result<OtpText, Reject> {
    if symbols.trim().is_empty() {
        return Err(Reject::Empty);
    }
    if symbols.len() > MAX_SYMBOL_TEXT {
        return Err(Reject::TooLong);
    }
    if symbols.contains("  ") {
        return Err(Reject::DoubleGap);
    }

    let mut text = OtpText::new();
    let mut decoded = 0;
    for group in symbols.split(' ').filter(|g| !g.is_empty()) {
        let c = if group == "/" { ' ' } else { translate(group) };
        decoded += 1;
        // Keep counting past capacity so the mismatch reports the real length
        let _ = text.push(c);
    }

    if decoded != otp_len {
        return Err(Reject::LengthMismatch { decoded });
    }
    Ok(text)
}

/// Append-only symbol buffer for the current transmission.
#[derive(Default)]
struct SymbolStream {
    symbols: Vec<Symbol, MAX_SYMBOLS>,
    overflow: bool,
}

impl SymbolStream {
    fn push(&mut self, symbol: Symbol) {
        if self.symbols.push(symbol).is_err() {
            self.overflow = true;
        }
    }

    fn render(&self) -> String<RENDER_CAP> {
        let mut out = String::new();
        for symbol in &self.symbols {
            let _ = out.push_str(symbol.as_str());
        }
        out
    }

    fn clear(&mut self) {
        self.symbols.clear();
        self.overflow = false;
    }
}

/// Small moving-average window.
#[derive(Default)]
struct Smoother {
    window: [u16; SMOOTHING],
    len: usize,
    next: usize,
}

impl Smoother {
    fn push(&mut self, sample: u16) -> u16 {
        self.window[self.next] = sample;
        self.next = (self.next + 1) % SMOOTHING;
        self.len = (self.len + 1).min(SMOOTHING);
        let sum: u32 = self.window[..self.len].iter().map(|&v| v as u32).sum();
        (sum / self.len as u32) as u16
    }
}

/// Ambient min/max tracker for threshold re-baselining.
struct Calibration {
    window_start: Option<u64>,
    min: u16,
    max: u16,
    sum: u32,
    count: u32,
}

impl Calibration {
    const fn new() -> Self {
        Self {
            window_start: None,
            min: u16::MAX,
            max: 0,
            sum: 0,
            count: 0,
        }
    }

    /// Feed one smoothed reading. Returns a new threshold when a window closes.
    fn observe(&mut self, now: u64, level: u16) -> Option<u16> {
        let start = *self.window_start.get_or_insert(now);
        self.min = self.min.min(level);
        self.max = self.max.max(level);
        self.sum = self.sum.saturating_add(level as u32);
        self.count += 1;

        if now.saturating_sub(start) < CALIBRATION_WINDOW_MS {
            return None;
        }

        let range = self.max - self.min;
        let threshold = if range < FLAT_RANGE {
            // Flat ambient: sit just above the average
            let avg = self.sum / self.count;
            (avg + avg / 5) as u16
        } else {
            self.min + range / 2
        };
        *self = Self::new();
        Some(threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD))
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Light-pulse decoder state machine.
pub struct SignalDecoder {
    otp_len: usize,
    smoother: Smoother,
    calibration: Calibration,
    threshold: u16,
    light: bool,
    last_change: u64,
    last_sample: Option<u64>,
    active: bool,
    stream: SymbolStream,
}

impl SignalDecoder {
    pub fn new(otp_len: usize) -> Self {
        Self {
            otp_len,
            smoother: Smoother::default(),
            calibration: Calibration::new(),
            threshold: INITIAL_THRESHOLD,
            light: false,
            last_change: 0,
            last_sample: None,
            active: false,
            stream: SymbolStream::default(),
        }
    }

    /// A transmission has started (at least one pulse received).
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    /// Process one scheduler tick.
    ///
    /// `sample` is only invoked when the sampling interval has elapsed, and
    /// may return `None` if the ADC has no conversion ready. Returns the
    /// outcome of a transmission when one completes on this tick.
    pub fn poll(
        &mut self,
        now: u64,
        sample: impl FnOnce() -> Option<u16>,
    ) -> Option<Result<OtpText, Reject>> {
        if let Some(last) = self.last_sample {
            if now.saturating_sub(last) < SAMPLE_INTERVAL_MS {
                return None;
            }
        }
        self.last_sample = Some(now);

        if let Some(raw) = sample() {
            let level = self.smoother.push(raw);

            if !self.active {
                if let Some(threshold) = self.calibration.observe(now, level) {
                    if threshold != self.threshold {
                        log::debug!("signal: threshold {} -> {}", self.threshold, threshold);
                    }
                    self.threshold = threshold;
                }
            }

            let light = self.classify(level);
            if light != self.light {
                let elapsed = now.saturating_sub(self.last_change);
                // Bounces inside the debounce window are ignored outright and
                // do not move last_change.
                if elapsed >= DEBOUNCE_MS {
                    self.transition(light, elapsed, now);
                }
            }
        }

        if self.active
            && !self.light
            && now.saturating_sub(self.last_change) >= MESSAGE_TIMEOUT_MS
        {
            return Some(self.finish());
        }
        None
    }

    fn classify(&self, level: u16) -> bool {
        if self.light {
            level >= self.threshold.saturating_sub(HYSTERESIS)
        } else {
            level > self.threshold.saturating_add(HYSTERESIS)
        }
    }

    fn transition(&mut self, light: bool, elapsed: u64, now: u64) {
        if self.light && !light {
            // Pulse ended. Light held longer than a whole message is an
            // ambient change, not a pulse.
            if elapsed < MESSAGE_TIMEOUT_MS {
                let symbol = if elapsed >= DASH_MS {
                    Symbol::Dash
                } else {
                    Symbol::Dot
                };
                self.stream.push(symbol);
                if !self.active {
                    log::debug!("signal: transmission started");
                    self.calibration.reset();
                }
                self.active = true;
            }
        } else if !self.light && light && self.active {
            if elapsed >= WORD_GAP_MS {
                self.stream.push(Symbol::WordGap);
            } else if elapsed >= LETTER_GAP_MS {
                self.stream.push(Symbol::LetterGap);
            }
        }
        self.light = light;
        self.last_change = now;
    }

    fn finish(&mut self) -> Result<OtpText, Reject> {
        let rendered = self.stream.render();
        let overflow = self.stream.overflow;
        self.stream.clear();
        self.active = false;

        let result = if overflow {
            Err(Reject::TooLong)
        } else {
            decode_symbols(&rendered, self.otp_len)
        };
        match &result {
            Ok(text) => log::info!("signal: received '{}' ({})", text, rendered),
            Err(e) => log::warn!("signal: rejected '{}': {}", rendered, e),
        }
        result
    }
}
