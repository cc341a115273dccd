//! In-memory stand-ins for the store, the sensor, serial ports and flash.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::convert::Infallible;
use std::sync::Mutex;

use embedded_hal::delay::DelayNs;
use embedded_storage::{ReadStorage, Storage};

use safe_controller::config::Credentials;
use safe_controller::fingerprint::{FingerprintSensor, Match, SensorError, TemplateIndex};
use safe_controller::otp::{OtpCode, OtpError, OtpText, OtpVerifier, Verified};
use safe_controller::schema::{
    bounded, LogEntry, LogEvent, Mailbox, MailboxCommand, RegisteredUsers, Role, StatusSnapshot,
    TemplateId, TemplateList, UserId,
};
use safe_controller::store::{RemoteStore, StoreError, Transport};

pub fn uid(s: &str) -> UserId {
    bounded(s).expect("user id fits")
}

pub fn otp(s: &str) -> OtpText {
    bounded(s).expect("otp fits")
}

// ============================================================================
// Log capture
// ============================================================================

static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct Capture;

impl log::Log for Capture {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Ok(mut lines) = CAPTURED.lock() {
            lines.push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static LOGGER: Capture = Capture;

/// Route `log` output into memory and return every line captured so far.
/// Lines from tests running in parallel are mixed in.
pub fn captured_logs() -> Vec<String> {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Trace);
    CAPTURED.lock().map(|lines| lines.clone()).unwrap_or_default()
}

// ============================================================================
// Remote store
// ============================================================================

/// Document store held in plain collections. When `reachable` is false every
/// call fails with `Unavailable`.
#[derive(Default)]
pub struct FakeStore {
    pub link: bool,
    pub reachable: bool,
    pub tags: BTreeMap<char, String>,
    pub codes: BTreeMap<String, String>,
    pub registered: BTreeMap<char, String>,
    pub roles: BTreeMap<String, Role>,
    pub statuses: Vec<StatusSnapshot>,
    pub logs: Vec<LogEntry>,
    pub mailbox: BTreeMap<String, String>,
    pub ids: BTreeMap<TemplateId, String>,
    pub templates: BTreeMap<String, Vec<TemplateId>>,
    pub wifi: Option<Credentials>,
    pub reconnects: Vec<Credentials>,
    pub pings: usize,
    pub fail_register: bool,
    pub fail_template_save: bool,
}

impl FakeStore {
    pub fn online() -> Self {
        Self {
            link: true,
            reachable: true,
            ..Self::default()
        }
    }

    pub fn with_user(mut self, tag: char, user: &str, code: &str) -> Self {
        self.tags.insert(tag, user.to_string());
        self.codes.insert(user.to_string(), code.to_string());
        self
    }

    pub fn with_registered(mut self, tag: char, user: &str) -> Self {
        self.registered.insert(tag, user.to_string());
        self
    }

    pub fn log_names(&self) -> Vec<&'static str> {
        self.logs.iter().map(|e| e.event.name()).collect()
    }

    fn up(&self) -> Result<(), StoreError> {
        if self.reachable {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

impl RemoteStore for FakeStore {
    fn link_up(&mut self) -> bool {
        self.link
    }

    fn reconnect(&mut self, network: &Credentials) {
        self.reconnects.push(network.clone());
    }

    fn ping(&mut self) -> Result<(), StoreError> {
        self.pings += 1;
        self.up()
    }

    fn find_user_by_tag(&mut self, tag: char) -> Result<UserId, StoreError> {
        self.up()?;
        self.tags
            .get(&tag)
            .map(|u| uid(u))
            .ok_or(StoreError::NotFound)
    }

    fn otp_code(&mut self, user: &str) -> Result<Option<OtpText>, StoreError> {
        self.up()?;
        Ok(self.codes.get(user).map(|c| otp(c)))
    }

    fn clear_otp_code(&mut self, user: &str) -> Result<(), StoreError> {
        self.up()?;
        self.codes.remove(user);
        Ok(())
    }

    fn registered_users(&mut self) -> Result<RegisteredUsers, StoreError> {
        self.up()?;
        if self.registered.is_empty() {
            return Err(StoreError::NotFound);
        }
        let mut users = RegisteredUsers::new();
        for (tag, user) in &self.registered {
            users.push((*tag, uid(user))).expect("registry fits");
        }
        Ok(users)
    }

    fn register_user(&mut self, tag: char, user: &str) -> Result<(), StoreError> {
        self.up()?;
        if self.fail_register {
            return Err(StoreError::Rejected(401));
        }
        self.registered.insert(tag, user.to_string());
        Ok(())
    }

    fn user_role(&mut self, user: &str) -> Result<Option<Role>, StoreError> {
        self.up()?;
        Ok(self.roles.get(user).copied())
    }

    fn set_user_role(&mut self, user: &str, role: Role) -> Result<(), StoreError> {
        self.up()?;
        self.roles.insert(user.to_string(), role);
        Ok(())
    }

    fn update_status(&mut self, status: &StatusSnapshot) -> Result<(), StoreError> {
        self.up()?;
        self.statuses.push(*status);
        Ok(())
    }

    fn append_log(&mut self, entry: &LogEntry) -> Result<(), StoreError> {
        self.up()?;
        self.logs.push(entry.clone());
        Ok(())
    }

    fn mailbox(&mut self) -> Result<Mailbox, StoreError> {
        self.up()?;
        let mut mailbox = Mailbox::new();
        for (key, value) in &self.mailbox {
            if let (Some(key), Some(command)) = (bounded(key), MailboxCommand::parse(value)) {
                let _ = mailbox.push((key, command));
            }
        }
        Ok(mailbox)
    }

    fn mark_registered(&mut self, key: &str) -> Result<(), StoreError> {
        self.up()?;
        self.mailbox.insert(key.to_string(), "registered".to_string());
        Ok(())
    }

    fn clear_mailbox(&mut self, key: &str) -> Result<(), StoreError> {
        self.up()?;
        match self.mailbox.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    fn map_template(&mut self, id: TemplateId, user: &str) -> Result<(), StoreError> {
        self.up()?;
        self.ids.insert(id, user.to_string());
        Ok(())
    }

    fn unmap_template(&mut self, id: TemplateId) -> Result<(), StoreError> {
        self.up()?;
        self.ids.remove(&id);
        Ok(())
    }

    fn user_templates(&mut self, user: &str) -> Result<TemplateList, StoreError> {
        self.up()?;
        let ids = self.templates.get(user).ok_or(StoreError::NotFound)?;
        Ok(ids.iter().copied().collect())
    }

    fn set_user_templates(&mut self, user: &str, ids: &[TemplateId]) -> Result<(), StoreError> {
        self.up()?;
        if self.fail_template_save {
            return Err(StoreError::Rejected(500));
        }
        if ids.is_empty() {
            self.templates.remove(user);
        } else {
            self.templates.insert(user.to_string(), ids.to_vec());
        }
        Ok(())
    }

    fn network_credentials(&mut self) -> Result<Option<Credentials>, StoreError> {
        self.up()?;
        Ok(self.wifi.clone())
    }
}

/// Drain everything the queue holds into `store`.
pub fn flush_queue(queue: &mut safe_controller::sync_queue::SyncQueue, store: &mut FakeStore) {
    let mut now = 1_000_000;
    while !queue.is_empty() {
        queue.drain_step(now, store, true);
        now += 1_000;
    }
}

/// Step a fresh verifier until it finishes, all at time `now`.
pub fn verify_all(
    store: &mut FakeStore,
    ready: bool,
    code: &OtpCode,
    now: u64,
    log: &mut safe_controller::sync_queue::SyncQueue,
) -> Result<Verified, OtpError> {
    let mut verifier = OtpVerifier::new();
    assert!(verifier.begin(code.clone(), now));
    for _ in 0..16 {
        if let Some(result) = verifier.step(now, store, ready, log) {
            return result;
        }
    }
    panic!("verification did not finish");
}

pub fn events(queue: &safe_controller::sync_queue::SyncQueue) -> Vec<LogEvent> {
    queue.logs().map(|e| e.event.clone()).collect()
}

// ============================================================================
// Fingerprint sensor
// ============================================================================

/// Sensor double. `captures` scripts capture results; once empty, capture
/// follows `finger`.
pub struct FakeSensor {
    pub finger: bool,
    pub captures: VecDeque<Result<(), SensorError>>,
    pub convert: Result<(), SensorError>,
    pub search: Result<Match, SensorError>,
    pub model: Result<(), SensorError>,
    pub index_fails: bool,
    pub used: BTreeSet<TemplateId>,
    pub fail_delete: BTreeSet<TemplateId>,
    pub deleted: Vec<TemplateId>,
}

impl Default for FakeSensor {
    fn default() -> Self {
        Self {
            finger: false,
            captures: VecDeque::new(),
            convert: Ok(()),
            search: Err(SensorError::NotFound),
            model: Ok(()),
            index_fails: false,
            used: BTreeSet::new(),
            fail_delete: BTreeSet::new(),
            deleted: Vec::new(),
        }
    }
}

impl FingerprintSensor for FakeSensor {
    fn capture(&mut self) -> Result<(), SensorError> {
        if let Some(result) = self.captures.pop_front() {
            return result;
        }
        if self.finger {
            Ok(())
        } else {
            Err(SensorError::NoFinger)
        }
    }

    fn convert(&mut self, _slot: u8) -> Result<(), SensorError> {
        self.convert
    }

    fn search(&mut self) -> Result<Match, SensorError> {
        self.search
    }

    fn create_model(&mut self) -> Result<(), SensorError> {
        self.model
    }

    fn store_model(&mut self, id: TemplateId) -> Result<(), SensorError> {
        self.used.insert(id);
        Ok(())
    }

    fn delete(&mut self, id: TemplateId) -> Result<(), SensorError> {
        if self.fail_delete.contains(&id) {
            return Err(SensorError::Code(0x10));
        }
        self.used.remove(&id);
        self.deleted.push(id);
        Ok(())
    }

    fn index(&mut self) -> Result<TemplateIndex, SensorError> {
        if self.index_fails {
            return Err(SensorError::Timeout);
        }
        let mut bitmap = [0u8; 32];
        for &id in &self.used {
            bitmap[id as usize / 8] |= 1 << (id % 8);
        }
        Ok(TemplateIndex(bitmap))
    }
}

// ============================================================================
// Serial port and delay
// ============================================================================

#[derive(Default)]
pub struct FakePort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub flushes: usize,
}

impl FakePort {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn sent(&self) -> &str {
        std::str::from_utf8(&self.tx).expect("utf-8 output")
    }
}

impl embedded_io::ErrorType for FakePort {
    type Error = Infallible;
}

impl embedded_io::Read for FakePort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl embedded_io::ReadReady for FakePort {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.rx.is_empty())
    }
}

impl embedded_io::Write for FakePort {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.flushes += 1;
        Ok(())
    }
}

/// Records requested delays without sleeping.
#[derive(Default)]
pub struct NoDelay {
    pub total_ns: u64,
}

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += ns as u64;
    }
}

// ============================================================================
// Flash
// ============================================================================

#[derive(Debug)]
pub struct FlashFault;

/// Sparse flash that reads erased bytes (0xFF) where nothing was written.
#[derive(Default)]
pub struct FakeFlash {
    pub bytes: BTreeMap<u32, u8>,
    pub fail_writes: bool,
    pub writes: usize,
}

impl FakeFlash {
    pub fn corrupt(&mut self, offset: u32) {
        let b = self.bytes.get(&offset).copied().unwrap_or(0xFF);
        self.bytes.insert(offset, b ^ 0x5A);
    }
}

impl ReadStorage for FakeFlash {
    type Error = FlashFault;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.bytes.get(&(offset + i as u32)).copied().unwrap_or(0xFF);
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        4 * 1024 * 1024
    }
}

impl Storage for FakeFlash {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(FlashFault);
        }
        self.writes += 1;
        for (i, b) in bytes.iter().enumerate() {
            self.bytes.insert(offset + i as u32, *b);
        }
        Ok(())
    }
}

// ============================================================================
// HTTP transport
// ============================================================================

/// Answers each exchange with the next scripted reply and keeps the requests.
#[derive(Default)]
pub struct ScriptedTransport {
    pub up: bool,
    pub replies: VecDeque<Result<String, StoreError>>,
    pub requests: Vec<String>,
}

impl ScriptedTransport {
    pub fn reply(&mut self, status: u16, body: &str) {
        self.replies.push_back(Ok(format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            status,
            body.len(),
            body
        )));
    }

    pub fn request_line(&self, i: usize) -> &str {
        self.requests[i].lines().next().unwrap_or("")
    }

    pub fn request_body(&self, i: usize) -> &str {
        self.requests[i].split("\r\n\r\n").nth(1).unwrap_or("")
    }
}

impl Transport for ScriptedTransport {
    fn link_up(&mut self) -> bool {
        self.up
    }

    fn reconnect(&mut self, _network: &Credentials) {}

    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize, StoreError> {
        self.requests
            .push(String::from_utf8_lossy(request).into_owned());
        let reply = self.replies.pop_front().unwrap_or(Err(StoreError::Unavailable))?;
        let bytes = reply.as_bytes();
        response[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}
