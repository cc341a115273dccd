//! Device identity and network credentials with flash persistence.
//!
//! Uses A/B double-buffering so a power loss during a write never corrupts
//! the record: the previous valid slot remains intact.
//!
//! Slot layout:
//!   [4 bytes: magic] [4 bytes: sequence] [4 bytes: CRC32] [4 bytes: body_len]
//!   body: five length-prefixed strings
//!         device_id, ssid, password, good_ssid, good_password
//!         each as [1 byte: len] [len bytes: utf-8]
//!
//! On write: overwrite an invalid slot, else the one with the lower sequence.
//! On read: use the slot with the higher sequence number that has a valid CRC.

use embedded_storage::{ReadStorage, Storage as EmbeddedStorage};
use heapless::String;

use crate::config::Credentials;
use crate::schema::DeviceId;

const STORAGE_MAGIC: u32 = 0x5341_4645; // "SAFE"

// Two 4KB sectors in the reserved data region after the app
pub const STORAGE_SLOT_A: u32 = 0x3D_0000;
pub const STORAGE_SLOT_B: u32 = 0x3D_1000;

const HEADER_LEN: usize = 16;
const BODY_CAP: usize = 240;
const RECORD_CAP: usize = HEADER_LEN + BODY_CAP;

/// Compute CRC32 for data validation (same algorithm as Python binascii.crc32).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageError {
    Flash,
    Encode,
}

/// Everything that survives a reboot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Persisted {
    pub device_id: DeviceId,
    pub active: Credentials,
    pub last_good: Credentials,
}

pub struct Storage<F> {
    flash: F,
    sequence: u32,
    state: Persisted,
}

impl<F> Storage<F>
where
    F: ReadStorage + EmbeddedStorage,
{
    /// Open storage and load the newest valid slot, if any.
    pub fn new(flash: F) -> Self {
        let mut s = Self {
            flash,
            sequence: 0,
            state: Persisted::default(),
        };
        s.load();
        s
    }

    pub fn state(&self) -> &Persisted {
        &self.state
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    fn read_slot(&mut self, offset: u32) -> Option<(u32, Persisted)> {
        let mut buf = [0u8; RECORD_CAP];
        if self.flash.read(offset, &mut buf).is_err() {
            return None;
        }

        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        if word(0) != STORAGE_MAGIC {
            return None;
        }
        let sequence = word(4);
        let stored_crc = word(8);
        let body_len = word(12) as usize;
        if body_len > BODY_CAP {
            return None;
        }

        let body = &buf[HEADER_LEN..HEADER_LEN + body_len];
        let computed = crc32(body);
        if computed != stored_crc {
            log::warn!(
                "storage: slot at 0x{:X} CRC mismatch (stored={:08X}, computed={:08X})",
                offset,
                stored_crc,
                computed
            );
            return None;
        }

        let mut fields = Fields { body, pos: 0 };
        let device_id = fields.next::<16>()?;
        let ssid = fields.next::<32>()?;
        let password = fields.next::<64>()?;
        let good_ssid = fields.next::<32>()?;
        let good_password = fields.next::<64>()?;

        Some((
            sequence,
            Persisted {
                device_id,
                active: Credentials { ssid, password },
                last_good: Credentials {
                    ssid: good_ssid,
                    password: good_password,
                },
            },
        ))
    }

    fn read_slot_sequence(&mut self, offset: u32) -> Option<u32> {
        self.read_slot(offset).map(|(sequence, _)| sequence)
    }

    fn load(&mut self) {
        let slot_a = self.read_slot(STORAGE_SLOT_A);
        let slot_b = self.read_slot(STORAGE_SLOT_B);

        let chosen = match (slot_a, slot_b) {
            (Some(a), Some(b)) => {
                if b.0 > a.0 {
                    log::info!("storage: using slot B (seq={})", b.0);
                    Some(b)
                } else {
                    log::info!("storage: using slot A (seq={})", a.0);
                    Some(a)
                }
            }
            (Some(a), None) => {
                log::info!("storage: using slot A (seq={}), slot B invalid", a.0);
                Some(a)
            }
            (None, Some(b)) => {
                log::info!("storage: using slot B (seq={}), slot A invalid", b.0);
                Some(b)
            }
            (None, None) => {
                log::info!("storage: no valid data in flash");
                None
            }
        };

        if let Some((sequence, state)) = chosen {
            self.sequence = sequence;
            self.state = state;
        }
    }

    /// Persist `state` if it differs from what is stored.
    pub fn save(&mut self, state: &Persisted) -> Result<(), StorageError> {
        if *state == self.state && self.sequence != 0 {
            return Ok(());
        }

        let mut buf = [0u8; RECORD_CAP];
        let mut len = 0;
        for field in [
            state.device_id.as_str(),
            state.active.ssid.as_str(),
            state.active.password.as_str(),
            state.last_good.ssid.as_str(),
            state.last_good.password.as_str(),
        ] {
            let bytes = field.as_bytes();
            let start = HEADER_LEN + len;
            if bytes.len() > u8::MAX as usize || len + 1 + bytes.len() > BODY_CAP {
                return Err(StorageError::Encode);
            }
            buf[start] = bytes.len() as u8;
            buf[start + 1..start + 1 + bytes.len()].copy_from_slice(bytes);
            len += 1 + bytes.len();
        }

        let (target, slot_name) = match (
            self.read_slot_sequence(STORAGE_SLOT_A),
            self.read_slot_sequence(STORAGE_SLOT_B),
        ) {
            (Some(a), Some(b)) if b < a => (STORAGE_SLOT_B, "B"),
            (Some(_), None) => (STORAGE_SLOT_B, "B"),
            _ => (STORAGE_SLOT_A, "A"),
        };
        let sequence = self.sequence.saturating_add(1);

        buf[0..4].copy_from_slice(&STORAGE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&sequence.to_le_bytes());
        let crc = crc32(&buf[HEADER_LEN..HEADER_LEN + len]);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf[12..16].copy_from_slice(&(len as u32).to_le_bytes());

        if self.flash.write(target, &buf[..HEADER_LEN + len]).is_err() {
            log::error!("storage: flash write to slot {} failed", slot_name);
            return Err(StorageError::Flash);
        }

        self.sequence = sequence;
        self.state = state.clone();
        log::info!("storage: saved to slot {} (seq={})", slot_name, sequence);
        Ok(())
    }
}

struct Fields<'a> {
    body: &'a [u8],
    pos: usize,
}

impl Fields<'_> {
    fn next<const N: usize>(&mut self) -> Option<String<N>> {
        let len = *self.body.get(self.pos)? as usize;
        let bytes = self.body.get(self.pos + 1..self.pos + 1 + len)?;
        self.pos += 1 + len;
        let mut out = String::new();
        out.push_str(core::str::from_utf8(bytes).ok()?).ok()?;
        Some(out)
    }
}
