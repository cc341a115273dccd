//! Remote store reachability with exponential-backoff recovery.
//!
//! Readiness is cached and re-checked at most every [`READY_CACHE_MS`].
//! While unreachable, recovery attempts are spaced by a doubling interval
//! (2 s up to 60 s). After [`FAILURES_BEFORE_FALLBACK`] consecutive failed
//! attempts the network profile falls back to the last-known-good credentials
//! (or the factory defaults when already on them, or rejoins the active
//! network when neither differs) and the interval drops to
//! [`FALLBACK_RETRY_MS`].

use crate::config::Credentials;
use crate::store::RemoteStore;

pub const READY_CACHE_MS: u64 = 500;
pub const BACKOFF_BASE_MS: u64 = 2_000;
pub const BACKOFF_MAX_MS: u64 = 60_000;
pub const FAILURES_BEFORE_FALLBACK: u8 = 3;
pub const FALLBACK_RETRY_MS: u64 = 5_000;

/// The credential sets the device can associate with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkProfile {
    pub active: Credentials,
    pub last_good: Credentials,
    pub factory: Credentials,
}

impl NetworkProfile {
    pub fn new(active: Credentials, last_good: Credentials, factory: Credentials) -> Self {
        let active = if active.is_empty() {
            factory.clone()
        } else {
            active
        };
        Self {
            active,
            last_good,
            factory,
        }
    }

    /// Switch to the fallback credentials. Returns them if they differ from
    /// the ones already active.
    pub fn fall_back(&mut self) -> Option<&Credentials> {
        let target = if !self.last_good.is_empty() && self.last_good != self.active {
            self.last_good.clone()
        } else {
            self.factory.clone()
        };
        if target == self.active {
            return None;
        }
        self.active = target;
        Some(&self.active)
    }

    /// Record that the active credentials reached the store.
    /// Returns true if the last-known-good set changed.
    pub fn confirm_active(&mut self) -> bool {
        if self.last_good == self.active {
            return false;
        }
        self.last_good = self.active.clone();
        true
    }
}

/// What a [`Reachability::maintain`] call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReachEvent {
    /// Store answered a ping; readiness restored.
    Restored,
    /// Ping failed; next attempt scheduled.
    Retrying { failures: u8, next_in_ms: u64 },
    /// Too many failures; fell back to other credentials if any.
    FellBack,
}

pub struct Reachability {
    ready: bool,
    checked_at: Option<u64>,
    interval_ms: u64,
    next_attempt_at: u64,
    failures: u8,
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new()
    }
}

impl Reachability {
    pub const fn new() -> Self {
        Self {
            ready: false,
            checked_at: None,
            interval_ms: BACKOFF_BASE_MS,
            next_attempt_at: 0,
            failures: 0,
        }
    }

    /// Cached readiness. Only the link state is re-queried, and at most
    /// every [`READY_CACHE_MS`]; no network I/O happens here.
    pub fn is_ready<S: RemoteStore>(&mut self, now: u64, store: &mut S) -> bool {
        if let Some(at) = self.checked_at {
            if now.saturating_sub(at) < READY_CACHE_MS {
                return self.ready;
            }
        }
        self.checked_at = Some(now);
        if self.ready && !store.link_up() {
            log::warn!("store: link lost");
            self.mark_unreachable(now);
        }
        self.ready
    }

    /// A remote write failed because the store could not be reached.
    pub fn report_failure(&mut self, now: u64) {
        if self.ready {
            log::warn!("store: unreachable, starting recovery");
            self.mark_unreachable(now);
        }
    }

    fn mark_unreachable(&mut self, now: u64) {
        self.ready = false;
        self.interval_ms = BACKOFF_BASE_MS;
        self.next_attempt_at = now;
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }

    /// Run one recovery attempt if unreachable and the backoff has elapsed.
    pub fn maintain<S: RemoteStore>(
        &mut self,
        now: u64,
        store: &mut S,
        profile: &mut NetworkProfile,
    ) -> Option<ReachEvent> {
        if self.is_ready(now, store) || now < self.next_attempt_at {
            return None;
        }

        if store.link_up() && store.ping().is_ok() {
            log::info!("store: reachable");
            self.ready = true;
            self.checked_at = Some(now);
            self.failures = 0;
            self.interval_ms = BACKOFF_BASE_MS;
            return Some(ReachEvent::Restored);
        }

        self.failures = self.failures.saturating_add(1);
        if self.failures >= FAILURES_BEFORE_FALLBACK {
            match profile.fall_back() {
                Some(network) => {
                    log::warn!(
                        "store: {} failed attempts, falling back to network '{}'",
                        self.failures,
                        network.ssid
                    );
                    store.reconnect(network);
                }
                None => {
                    log::warn!(
                        "store: {} failed attempts, rejoining network '{}'",
                        self.failures,
                        profile.active.ssid
                    );
                    store.reconnect(&profile.active);
                }
            }
            self.failures = 0;
            self.interval_ms = FALLBACK_RETRY_MS;
            self.next_attempt_at = now + FALLBACK_RETRY_MS;
            return Some(ReachEvent::FellBack);
        }

        let wait = self.interval_ms;
        log::info!(
            "store: unreachable (attempt {}/{}), retry in {}ms",
            self.failures,
            FAILURES_BEFORE_FALLBACK,
            wait
        );
        self.next_attempt_at = now + wait;
        self.interval_ms = (self.interval_ms * 2).min(BACKOFF_MAX_MS);
        Some(ReachEvent::Retrying {
            failures: self.failures,
            next_in_ms: wait,
        })
    }
}
