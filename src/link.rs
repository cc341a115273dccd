//! Serial link with the companion lock controller.
//!
//! Inbound frames are newline-terminated:
//!
//! ```text
//! Nano:<CLOSED|OPEN>:<SAFE|UNSAFE>
//! OTP:<code>
//! ```
//!
//! Outbound commands are bare tokens (`UNLOCK`, `OTP_INVALID`), each
//! followed by a newline, a flush and a short settle delay.

use embedded_hal::delay::DelayNs;
use embedded_io::{Read, ReadReady, Write};
use heapless::{String, Vec};

use crate::otp::OtpText;
use crate::schema::{LogEvent, StatusSnapshot};

pub const MAX_FRAME: usize = 64;
pub const BYTE_TIMEOUT_MS: u64 = 500;
pub const SETTLE_MS: u32 = 50;
pub const HEARTBEAT_MS: u64 = 30_000;

const STATUS_TAG: &str = "Nano";
const OTP_PREFIX: &str = "OTP:";
/// Bytes consumed per poll so one chatty peer cannot stall the tick.
const MAX_BYTES_PER_POLL: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Closed,
    Open,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tamper {
    Safe,
    Unsafe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub lock: LockState,
    pub tamper: Tamper,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Status(Frame),
    Otp(OtpText),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    Tag,
    MissingField,
    Lock,
    Tamper,
    Extra,
    Encoding,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::Tag => write!(f, "unknown frame tag"),
            FrameError::MissingField => write!(f, "missing field"),
            FrameError::Lock => write!(f, "bad lock state"),
            FrameError::Tamper => write!(f, "bad tamper state"),
            FrameError::Extra => write!(f, "trailing field"),
            FrameError::Encoding => write!(f, "frame too long"),
        }
    }
}

/// Parse one line (without its terminator).
pub fn parse_frame(line: &str) -> Result<Inbound, FrameError> {
    let line = line.trim();

    if let Some(code) = line.strip_prefix(OTP_PREFIX) {
        let mut otp = OtpText::new();
        otp.push_str(code.trim()).map_err(|_| FrameError::Encoding)?;
        return Ok(Inbound::Otp(otp));
    }

    let mut fields = line.split(':');
    if fields.next() != Some(STATUS_TAG) {
        return Err(FrameError::Tag);
    }
    let lock = match fields.next().ok_or(FrameError::MissingField)? {
        "CLOSED" => LockState::Closed,
        "OPEN" => LockState::Open,
        _ => return Err(FrameError::Lock),
    };
    let tamper = match fields.next().ok_or(FrameError::MissingField)? {
        "SAFE" => Tamper::Safe,
        "UNSAFE" => Tamper::Unsafe,
        _ => return Err(FrameError::Tamper),
    };
    if fields.next().is_some() {
        return Err(FrameError::Extra);
    }
    Ok(Inbound::Status(Frame { lock, tamper }))
}

/// Non-blocking line assembler.
///
/// Only reads bytes the port reports as ready. A partial line that sees no
/// new byte for [`BYTE_TIMEOUT_MS`] is discarded, as is an overlong one.
#[derive(Default)]
pub struct LineReader {
    buf: Vec<u8, MAX_FRAME>,
    last_byte_at: u64,
    overflow: bool,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read what is available and return the next complete line, if any.
    pub fn poll<P: Read + ReadReady>(&mut self, port: &mut P, now: u64) -> Option<String<MAX_FRAME>> {
        if !self.buf.is_empty() && now.saturating_sub(self.last_byte_at) > BYTE_TIMEOUT_MS {
            log::warn!("link: dropping stale partial frame ({} bytes)", self.buf.len());
            self.reset();
        }

        for _ in 0..MAX_BYTES_PER_POLL {
            match port.read_ready() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(_) => {
                    log::error!("link: read_ready failed");
                    return None;
                }
            }
            let mut byte = [0u8; 1];
            match port.read(&mut byte) {
                Ok(1) => {}
                Ok(_) => return None,
                Err(_) => {
                    log::error!("link: read failed");
                    self.reset();
                    return None;
                }
            }
            self.last_byte_at = now;

            match byte[0] {
                b'\n' => {
                    let line = self.take_line();
                    if line.is_some() {
                        return line;
                    }
                }
                b'\r' => {}
                b => {
                    if self.buf.push(b).is_err() {
                        self.overflow = true;
                    }
                }
            }
        }
        None
    }

    fn take_line(&mut self) -> Option<String<MAX_FRAME>> {
        if self.overflow {
            log::warn!("link: dropping overlong frame");
            self.reset();
            return None;
        }
        let line = core::str::from_utf8(&self.buf)
            .ok()
            .and_then(|s| String::try_from(s).ok());
        if line.is_none() {
            log::warn!("link: dropping non-UTF-8 frame");
        }
        self.reset();
        line.filter(|l| !l.is_empty())
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.overflow = false;
    }
}

/// Effects of applying one status frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    pub events: Vec<LogEvent, 2>,
    pub status: Option<StatusSnapshot>,
}

/// Last-known companion state, used for edge detection only.
pub struct LinkState {
    lock: LockState,
    tamper: Tamper,
    last_status_at: Option<u64>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    /// Starts as open and safe until the companion reports otherwise.
    pub const fn new() -> Self {
        Self {
            lock: LockState::Open,
            tamper: Tamper::Safe,
            last_status_at: None,
        }
    }

    pub fn lock(&self) -> LockState {
        self.lock
    }

    pub fn tamper(&self) -> Tamper {
        self.tamper
    }

    pub fn snapshot(&self, online: bool) -> StatusSnapshot {
        StatusSnapshot {
            online,
            locked: self.lock == LockState::Closed,
            secure: self.tamper == Tamper::Safe,
        }
    }

    /// Apply a frame: one log event per edge, and a status snapshot on any
    /// change or when the heartbeat interval has elapsed.
    pub fn apply(&mut self, frame: Frame, now: u64, online: bool) -> Transition {
        let mut t = Transition::default();

        if frame.lock != self.lock {
            let event = match frame.lock {
                LockState::Closed => LogEvent::Locked,
                LockState::Open => LogEvent::Unlocked,
            };
            log::info!("link: lock {:?} -> {:?}", self.lock, frame.lock);
            let _ = t.events.push(event);
        }
        if frame.tamper != self.tamper {
            let event = match frame.tamper {
                Tamper::Safe => LogEvent::Secured,
                Tamper::Unsafe => LogEvent::Compromised,
            };
            log::info!("link: tamper {:?} -> {:?}", self.tamper, frame.tamper);
            let _ = t.events.push(event);
        }

        self.lock = frame.lock;
        self.tamper = frame.tamper;

        let heartbeat_due = match self.last_status_at {
            Some(at) => now.saturating_sub(at) >= HEARTBEAT_MS,
            None => true,
        };
        if !t.events.is_empty() || heartbeat_due {
            self.last_status_at = Some(now);
            t.status = Some(self.snapshot(online));
        }
        t
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Unlock,
    OtpInvalid,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Unlock => "UNLOCK",
            Command::OtpInvalid => "OTP_INVALID",
        }
    }
}

/// Write a command, flush, and wait out the settle delay.
pub fn send<W: Write, D: DelayNs>(port: &mut W, delay: &mut D, command: Command) -> Result<(), W::Error> {
    port.write_all(command.as_str().as_bytes())?;
    port.write_all(b"\n")?;
    port.flush()?;
    delay.delay_ms(SETTLE_MS);
    log::debug!("link: sent {}", command.as_str());
    Ok(())
}
