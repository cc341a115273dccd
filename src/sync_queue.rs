//! Outbound synchronization queue.
//!
//! Holds one pending status snapshot (latest-wins) and a bounded FIFO of log
//! entries. [`SyncQueue::drain_step`] attempts at most one remote write per
//! call, spaced by [`OP_SPACING_MS`]. Entries are only removed after the
//! store accepts them, so a failed write is retried on a later tick.

use heapless::Deque;

use crate::schema::{LogEntry, LogEvent, StatusSnapshot};
use crate::store::{RemoteStore, StoreError};

pub const LOG_CAPACITY: usize = 10;
pub const OP_SPACING_MS: u64 = 200;
pub const DROP_REPORT_INTERVAL_MS: u64 = 30_000;

/// Result of one drain attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Drain {
    /// Nothing queued, or the store is not ready.
    Idle,
    /// Too soon after the previous write.
    Spaced,
    StatusSent,
    LogSent,
    Failed(StoreError),
}

pub struct SyncQueue {
    status: Option<StatusSnapshot>,
    logs: Deque<LogEntry, LOG_CAPACITY>,
    last_op_at: Option<u64>,
    dropped: u32,
    last_drop_report: Option<u64>,
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncQueue {
    pub const fn new() -> Self {
        Self {
            status: None,
            logs: Deque::new(),
            last_op_at: None,
            dropped: 0,
            last_drop_report: None,
        }
    }

    /// Queue a status snapshot, replacing any pending one.
    pub fn push_status(&mut self, status: StatusSnapshot) {
        if self.status.replace(status).is_some() {
            log::debug!("sync: status superseded");
        }
    }

    /// Queue a log event. When full, the oldest entry is dropped.
    pub fn push_log(&mut self, event: LogEvent, now: u64) {
        if self.logs.is_full() {
            self.logs.pop_front();
            self.dropped = self.dropped.saturating_add(1);
            self.report_drops(now);
        }
        // Cannot fail: a slot was freed above if needed
        let _ = self.logs.push_back(LogEntry { event, at_ms: now });
    }

    fn report_drops(&mut self, now: u64) {
        let due = match self.last_drop_report {
            Some(last) => now.saturating_sub(last) >= DROP_REPORT_INTERVAL_MS,
            None => true,
        };
        if due {
            log::warn!(
                "sync: log queue full, dropped {} oldest entries",
                self.dropped
            );
            self.dropped = 0;
            self.last_drop_report = Some(now);
        }
    }

    pub fn pending_status(&self) -> Option<&StatusSnapshot> {
        self.status.as_ref()
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter()
    }

    pub fn log_len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.logs.is_empty()
    }

    /// Attempt one remote write. Status has priority over logs.
    pub fn drain_step<S: RemoteStore>(&mut self, now: u64, store: &mut S, ready: bool) -> Drain {
        if !ready || self.is_empty() {
            return Drain::Idle;
        }
        if let Some(last) = self.last_op_at {
            if now.saturating_sub(last) < OP_SPACING_MS {
                return Drain::Spaced;
            }
        }
        self.last_op_at = Some(now);

        if let Some(status) = self.status {
            return match store.update_status(&status) {
                Ok(()) => {
                    self.status = None;
                    log::debug!(
                        "sync: status online={} locked={} secure={}",
                        status.online,
                        status.locked,
                        status.secure
                    );
                    Drain::StatusSent
                }
                Err(e) => {
                    log::warn!("sync: status update failed: {}", e);
                    Drain::Failed(e)
                }
            };
        }

        let Some(entry) = self.logs.front() else {
            return Drain::Idle;
        };
        match store.append_log(entry) {
            Ok(()) => {
                log::debug!("sync: log '{}' sent", entry.event.name());
                self.logs.pop_front();
                Drain::LogSent
            }
            Err(e) => {
                log::warn!("sync: log '{}' failed: {}", entry.event.name(), e);
                Drain::Failed(e)
            }
        }
    }
}
