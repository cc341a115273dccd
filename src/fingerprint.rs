//! Optical fingerprint sensor (R30x / ZFM family) over UART.
//!
//! Packet layout (all multi-byte fields big-endian):
//!
//! ```text
//! [0xEF 0x01] [addr: 4] [pid: 1] [len: 2] [payload: len-2] [checksum: 2]
//! ```
//!
//! `len` counts the payload plus the checksum. The checksum is the 16-bit
//! sum of pid, both length bytes and the payload. Every command is answered
//! by an acknowledge packet whose first payload byte is a confirmation code.

use embedded_hal::delay::DelayNs;
use embedded_io::{Read, ReadReady, Write};
use heapless::Vec;

use crate::schema::{TemplateId, FIRST_TEMPLATE_ID, LAST_TEMPLATE_ID};

const HEADER: [u8; 2] = [0xEF, 0x01];
const DEFAULT_ADDRESS: u32 = 0xFFFF_FFFF;
const DEFAULT_PASSWORD: u32 = 0;

const PID_COMMAND: u8 = 0x01;
const PID_ACK: u8 = 0x07;

const CMD_GEN_IMAGE: u8 = 0x01;
const CMD_IMAGE_TO_TZ: u8 = 0x02;
const CMD_SEARCH: u8 = 0x04;
const CMD_REG_MODEL: u8 = 0x05;
const CMD_STORE: u8 = 0x06;
const CMD_DELETE: u8 = 0x0C;
const CMD_SET_SYS_PARA: u8 = 0x0E;
const CMD_VERIFY_PASSWORD: u8 = 0x13;
const CMD_READ_INDEX: u8 = 0x1F;

const PARAM_SECURITY_LEVEL: u8 = 5;

// Confirmation codes
const OK: u8 = 0x00;
const NO_FINGER: u8 = 0x02;
const IMAGE_FAIL: u8 = 0x03;
const IMAGE_MESSY: u8 = 0x06;
const FEATURE_FAIL: u8 = 0x07;
const NOT_FOUND: u8 = 0x09;
const ENROLL_MISMATCH: u8 = 0x0A;
const BAD_LOCATION: u8 = 0x0B;
const INVALID_IMAGE: u8 = 0x15;

pub const ACK_TIMEOUT_MS: u32 = 1_000;
const MAX_PAYLOAD: usize = 64;
pub const MAX_PACKET: usize = MAX_PAYLOAD + 12;

/// Sensor library search window.
const SEARCH_START: u16 = 0;
const SEARCH_COUNT: u16 = LAST_TEMPLATE_ID + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorError {
    NoFinger,
    NotFound,
    Mismatch,
    BadImage,
    BadLocation,
    Timeout,
    Io,
    Protocol,
    Code(u8),
}

impl core::fmt::Display for SensorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SensorError::NoFinger => write!(f, "no finger"),
            SensorError::NotFound => write!(f, "no match"),
            SensorError::Mismatch => write!(f, "captures do not match"),
            SensorError::BadImage => write!(f, "bad image"),
            SensorError::BadLocation => write!(f, "bad template location"),
            SensorError::Timeout => write!(f, "no reply"),
            SensorError::Io => write!(f, "uart error"),
            SensorError::Protocol => write!(f, "malformed reply"),
            SensorError::Code(c) => write!(f, "sensor code 0x{:02X}", c),
        }
    }
}

fn check(code: u8) -> Result<(), SensorError> {
    match code {
        OK => Ok(()),
        NO_FINGER => Err(SensorError::NoFinger),
        IMAGE_FAIL | IMAGE_MESSY | FEATURE_FAIL | INVALID_IMAGE => Err(SensorError::BadImage),
        NOT_FOUND => Err(SensorError::NotFound),
        ENROLL_MISMATCH => Err(SensorError::Mismatch),
        BAD_LOCATION => Err(SensorError::BadLocation),
        other => Err(SensorError::Code(other)),
    }
}

/// A successful library search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    pub id: TemplateId,
    pub score: u16,
}

/// Occupancy bitmap of the first template page (ids 0..=255).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplateIndex(pub [u8; 32]);

impl TemplateIndex {
    pub fn is_used(&self, id: TemplateId) -> bool {
        let id = id as usize;
        id < 256 && self.0[id / 8] & (1 << (id % 8)) != 0
    }

    /// Linear scan for the first free slot in the usable id range.
    pub fn first_free(&self) -> Option<TemplateId> {
        (FIRST_TEMPLATE_ID..=LAST_TEMPLATE_ID).find(|&id| !self.is_used(id))
    }
}

/// Operations the biometric state machines need from a sensor.
/// Each call is one bounded command/acknowledge exchange.
pub trait FingerprintSensor {
    fn capture(&mut self) -> Result<(), SensorError>;
    fn convert(&mut self, slot: u8) -> Result<(), SensorError>;
    fn search(&mut self) -> Result<Match, SensorError>;
    fn create_model(&mut self) -> Result<(), SensorError>;
    fn store_model(&mut self, id: TemplateId) -> Result<(), SensorError>;
    fn delete(&mut self, id: TemplateId) -> Result<(), SensorError>;
    fn index(&mut self) -> Result<TemplateIndex, SensorError>;
}

/// Encode one command packet into `out`.
pub fn encode_command(
    command: u8,
    params: &[u8],
    out: &mut Vec<u8, MAX_PACKET>,
) -> Result<(), SensorError> {
    out.clear();
    let len = (params.len() + 3) as u16;
    let mut sum: u16 = PID_COMMAND as u16 + (len >> 8) + (len & 0xFF) + command as u16;

    out.extend_from_slice(&HEADER).map_err(|_| SensorError::Protocol)?;
    out.extend_from_slice(&DEFAULT_ADDRESS.to_be_bytes())
        .map_err(|_| SensorError::Protocol)?;
    out.push(PID_COMMAND).map_err(|_| SensorError::Protocol)?;
    out.extend_from_slice(&len.to_be_bytes())
        .map_err(|_| SensorError::Protocol)?;
    out.push(command).map_err(|_| SensorError::Protocol)?;
    for &b in params {
        sum = sum.wrapping_add(b as u16);
    }
    out.extend_from_slice(params).map_err(|_| SensorError::Protocol)?;
    out.extend_from_slice(&sum.to_be_bytes())
        .map_err(|_| SensorError::Protocol)?;
    Ok(())
}

/// UART driver for the sensor.
pub struct R30x<P, D> {
    port: P,
    delay: D,
}

impl<P, D> R30x<P, D>
where
    P: Read + ReadReady + Write,
    D: DelayNs,
{
    pub fn new(port: P, delay: D) -> Self {
        Self { port, delay }
    }

    /// Handshake with the default password and set the matching strictness.
    pub fn init(&mut self, security_level: u8) -> Result<(), SensorError> {
        self.command(CMD_VERIFY_PASSWORD, &DEFAULT_PASSWORD.to_be_bytes())?;
        self.command(CMD_SET_SYS_PARA, &[PARAM_SECURITY_LEVEL, security_level])?;
        Ok(())
    }

    /// Send a command and return the acknowledge payload after the code.
    fn command(&mut self, command: u8, params: &[u8]) -> Result<Vec<u8, MAX_PAYLOAD>, SensorError> {
        let mut packet = Vec::new();
        encode_command(command, params, &mut packet)?;
        self.port.write_all(&packet).map_err(|_| SensorError::Io)?;
        self.port.flush().map_err(|_| SensorError::Io)?;

        let mut payload = self.read_ack()?;
        let code = *payload.first().ok_or(SensorError::Protocol)?;
        check(code)?;
        payload.remove(0);
        Ok(payload)
    }

    fn read_byte(&mut self, waited_ms: &mut u32) -> Result<u8, SensorError> {
        loop {
            if self.port.read_ready().map_err(|_| SensorError::Io)? {
                let mut byte = [0u8; 1];
                if self.port.read(&mut byte).map_err(|_| SensorError::Io)? == 1 {
                    return Ok(byte[0]);
                }
            }
            if *waited_ms >= ACK_TIMEOUT_MS {
                return Err(SensorError::Timeout);
            }
            self.delay.delay_ms(1);
            *waited_ms += 1;
        }
    }

    fn read_ack(&mut self) -> Result<Vec<u8, MAX_PAYLOAD>, SensorError> {
        let mut waited = 0;

        // Resynchronise on the header
        let mut prev = self.read_byte(&mut waited)?;
        loop {
            let b = self.read_byte(&mut waited)?;
            if prev == HEADER[0] && b == HEADER[1] {
                break;
            }
            prev = b;
        }

        let mut head = [0u8; 7];
        for b in head.iter_mut() {
            *b = self.read_byte(&mut waited)?;
        }
        let pid = head[4];
        let len = u16::from_be_bytes([head[5], head[6]]) as usize;
        if pid != PID_ACK || len < 3 || len - 2 > MAX_PAYLOAD {
            return Err(SensorError::Protocol);
        }

        let mut sum: u16 = pid as u16 + head[5] as u16 + head[6] as u16;
        let mut payload = Vec::new();
        for _ in 0..len - 2 {
            let b = self.read_byte(&mut waited)?;
            sum = sum.wrapping_add(b as u16);
            let _ = payload.push(b);
        }
        let hi = self.read_byte(&mut waited)?;
        let lo = self.read_byte(&mut waited)?;
        if u16::from_be_bytes([hi, lo]) != sum {
            log::warn!("bio: checksum mismatch");
            return Err(SensorError::Protocol);
        }
        Ok(payload)
    }
}

impl<P, D> FingerprintSensor for R30x<P, D>
where
    P: Read + ReadReady + Write,
    D: DelayNs,
{
    fn capture(&mut self) -> Result<(), SensorError> {
        self.command(CMD_GEN_IMAGE, &[]).map(|_| ())
    }

    fn convert(&mut self, slot: u8) -> Result<(), SensorError> {
        self.command(CMD_IMAGE_TO_TZ, &[slot]).map(|_| ())
    }

    fn search(&mut self) -> Result<Match, SensorError> {
        let mut params = [0u8; 5];
        params[0] = 1;
        params[1..3].copy_from_slice(&SEARCH_START.to_be_bytes());
        params[3..5].copy_from_slice(&SEARCH_COUNT.to_be_bytes());
        let reply = self.command(CMD_SEARCH, &params)?;
        if reply.len() < 4 {
            return Err(SensorError::Protocol);
        }
        Ok(Match {
            id: u16::from_be_bytes([reply[0], reply[1]]),
            score: u16::from_be_bytes([reply[2], reply[3]]),
        })
    }

    fn create_model(&mut self) -> Result<(), SensorError> {
        self.command(CMD_REG_MODEL, &[]).map(|_| ())
    }

    fn store_model(&mut self, id: TemplateId) -> Result<(), SensorError> {
        let id = id.to_be_bytes();
        self.command(CMD_STORE, &[1, id[0], id[1]]).map(|_| ())
    }

    fn delete(&mut self, id: TemplateId) -> Result<(), SensorError> {
        let id = id.to_be_bytes();
        self.command(CMD_DELETE, &[id[0], id[1], 0, 1]).map(|_| ())
    }

    fn index(&mut self) -> Result<TemplateIndex, SensorError> {
        let reply = self.command(CMD_READ_INDEX, &[0])?;
        let bitmap: [u8; 32] = reply
            .get(..32)
            .and_then(|b| b.try_into().ok())
            .ok_or(SensorError::Protocol)?;
        Ok(TemplateIndex(bitmap))
    }
}
