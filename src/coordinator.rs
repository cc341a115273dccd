//! Owns every subsystem and runs them in a fixed order once per tick.
//!
//! ```text
//! reachability -> sync drain -> link rx -> optical rx -> otp -> biometric -> provisioning
//! ```
//!
//! Each stage issues at most one remote call, so a stalled store delays a
//! tick by one bounded exchange at a time.

use embedded_hal::delay::DelayNs;
use embedded_io::{Read, ReadReady, Write};

use crate::biometric::{Biometric, Outcome};
use crate::fingerprint::FingerprintSensor;
use crate::indicator::{Indicator, Signals, ERROR_HOLD_MS};
use crate::link::{self, Command, Inbound, LineReader, LinkState, LockState, Tamper};
use crate::otp::{self, OtpError, OtpVerifier, OTP_LENGTH};
use crate::reconnect::{NetworkProfile, ReachEvent, Reachability};
use crate::schema::{LogEvent, StatusSnapshot};
use crate::signal::SignalDecoder;
use crate::store::{RemoteStore, StoreError};
use crate::sync_queue::{Drain, SyncQueue};

pub const PROVISION_INTERVAL_MS: u64 = 30_000;

pub struct Coordinator<S, F, L, D> {
    store: S,
    sensor: F,
    link: L,
    delay: D,
    decoder: SignalDecoder,
    verifier: OtpVerifier,
    biometric: Biometric,
    queue: SyncQueue,
    reach: Reachability,
    link_state: LinkState,
    reader: LineReader,
    profile: NetworkProfile,
    profile_dirty: bool,
    next_provision_at: u64,
    error_until: u64,
}

impl<S, F, L, D> Coordinator<S, F, L, D>
where
    S: RemoteStore,
    F: FingerprintSensor,
    L: Read + ReadReady + Write,
    D: DelayNs,
{
    pub fn new(store: S, sensor: F, link: L, delay: D, profile: NetworkProfile) -> Self {
        Self {
            store,
            sensor,
            link,
            delay,
            decoder: SignalDecoder::new(OTP_LENGTH),
            verifier: OtpVerifier::new(),
            biometric: Biometric::new(),
            queue: SyncQueue::new(),
            reach: Reachability::new(),
            link_state: LinkState::new(),
            reader: LineReader::new(),
            profile,
            profile_dirty: false,
            next_provision_at: PROVISION_INTERVAL_MS,
            error_until: 0,
        }
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn biometric(&self) -> &Biometric {
        &self.biometric
    }

    pub fn link_state(&self) -> &LinkState {
        &self.link_state
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    /// The network profile, once per change, for persisting.
    pub fn take_profile_update(&mut self) -> Option<&NetworkProfile> {
        if !self.profile_dirty {
            return None;
        }
        self.profile_dirty = false;
        Some(&self.profile)
    }

    /// Run one scheduler pass. `sample` reads the photodiode and is only
    /// called when the decoder is due for a sample.
    pub fn tick(&mut self, now: u64, sample: impl FnOnce() -> Option<u16>) -> Indicator {
        self.maintain_link(now);
        let ready = self.reach.is_ready(now, &mut self.store);

        if let Drain::Failed(StoreError::Unavailable) = self.queue.drain_step(now, &mut self.store, ready) {
            self.reach.report_failure(now);
        }

        self.poll_link(now, ready);
        self.poll_signal(now, sample);
        self.step_otp(now);
        self.step_biometric(now);
        self.provision(now);

        self.indicator(now)
    }

    fn maintain_link(&mut self, now: u64) {
        match self.reach.maintain(now, &mut self.store, &mut self.profile) {
            Some(ReachEvent::Restored) => {
                if self.profile.confirm_active() {
                    self.profile_dirty = true;
                }
                self.queue.push_status(self.link_state.snapshot(true));
            }
            Some(ReachEvent::FellBack) => self.profile_dirty = true,
            Some(ReachEvent::Retrying { .. }) | None => {}
        }
    }

    fn poll_link(&mut self, now: u64, ready: bool) {
        let Some(line) = self.reader.poll(&mut self.link, now) else {
            return;
        };
        match link::parse_frame(&line) {
            Ok(Inbound::Status(frame)) => {
                let t = self.link_state.apply(frame, now, ready);
                for event in t.events {
                    self.queue.push_log(event, now);
                }
                if let Some(status) = t.status {
                    self.queue.push_status(status);
                }
            }
            Ok(Inbound::Otp(text)) => self.candidate(&text, now),
            Err(e) => log::warn!("link: dropping frame '{}': {}", line, e),
        }
    }

    fn poll_signal(&mut self, now: u64, sample: impl FnOnce() -> Option<u16>) {
        match self.decoder.poll(now, sample) {
            Some(Ok(text)) => self.candidate(&text, now),
            Some(Err(reject)) => log::warn!("signal: transmission rejected: {}", reject),
            None => {}
        }
    }

    /// A received OTP candidate from either channel.
    fn candidate(&mut self, text: &str, now: u64) {
        if self.verifier.is_busy() {
            log::warn!("otp: verification in progress, dropping candidate");
            return;
        }
        match otp::validate_format(text) {
            Ok(code) => {
                self.verifier.begin(code, now);
            }
            Err(_) => {
                log::warn!("otp: malformed candidate ({} chars)", text.chars().count());
                self.queue.push_log(LogEvent::OtpFormatInvalid, now);
                self.reject(now);
            }
        }
    }

    fn step_otp(&mut self, now: u64) {
        let ready = self.reach.is_ready(now, &mut self.store);
        match self.verifier.step(now, &mut self.store, ready, &mut self.queue) {
            Some(Ok(_)) => self.unlock(),
            Some(Err(e)) => {
                if ready && e == OtpError::Unavailable {
                    self.reach.report_failure(now);
                }
                self.reject(now);
            }
            None => {}
        }
    }

    fn step_biometric(&mut self, now: u64) {
        let ready = self.reach.is_ready(now, &mut self.store);
        match self.biometric.step(now, &mut self.store, &mut self.sensor, ready, &mut self.queue) {
            Some(Outcome::Authenticated(_)) => self.unlock(),
            Some(Outcome::EnrollFailed(_)) => self.error_until = now + ERROR_HOLD_MS,
            Some(Outcome::Enrolled { .. }) | Some(Outcome::Deleted { .. }) | None => {}
        }
    }

    /// Pick up WiFi credentials pushed to the device node.
    fn provision(&mut self, now: u64) {
        if now < self.next_provision_at || self.verifier.is_busy() || !self.biometric.is_idle() {
            return;
        }
        self.next_provision_at = now + PROVISION_INTERVAL_MS;
        if !self.reach.is_ready(now, &mut self.store) {
            return;
        }
        match self.store.network_credentials() {
            Ok(Some(network)) if !network.is_empty() && network != self.profile.active => {
                log::info!("wifi: switching to network '{}'", network.ssid);
                self.store.reconnect(&network);
                self.profile.active = network;
                self.profile_dirty = true;
            }
            Ok(_) | Err(StoreError::NotFound) => {}
            Err(e) => log::warn!("wifi: read failed: {}", e),
        }
    }

    fn unlock(&mut self) {
        if let Err(e) = link::send(&mut self.link, &mut self.delay, Command::Unlock) {
            log::error!("link: UNLOCK write failed: {:?}", e);
        }
        let status = StatusSnapshot {
            locked: false,
            ..self.link_state.snapshot(true)
        };
        self.queue.push_status(status);
    }

    fn reject(&mut self, now: u64) {
        if let Err(e) = link::send(&mut self.link, &mut self.delay, Command::OtpInvalid) {
            log::error!("link: OTP_INVALID write failed: {:?}", e);
        }
        self.error_until = now + ERROR_HOLD_MS;
    }

    fn indicator(&mut self, now: u64) -> Indicator {
        Indicator::resolve(Signals {
            online: self.reach.is_ready(now, &mut self.store),
            open: self.link_state.lock() == LockState::Open,
            tampered: self.link_state.tamper() == Tamper::Unsafe,
            scanning: self.biometric.is_scanning() || self.decoder.is_active() || self.verifier.is_busy(),
            error: now < self.error_until,
        })
    }
}
