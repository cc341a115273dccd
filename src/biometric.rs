//! Fingerprint authentication, enrollment and remote command handling.
//!
//! Exactly one activity runs at a time:
//!
//! ```text
//! Idle ──scan──> Auth: CaptureImage -> ConvertTemplate -> SearchDatabase
//!      ──poll──> mailbox command
//!                  enroll     -> resolve user -> Enroll session -> Finalize
//!                  delete_*   -> Delete job
//! ```
//!
//! Every state advances on at most one sensor call and one remote call per
//! [`Biometric::step`]. Remote steps wait while the store is unreachable,
//! bounded by a job deadline.

use crate::fingerprint::{FingerprintSensor, Match, SensorError};
use crate::schema::{
    registered_user, EnrollFailure, LogEvent, MailboxCommand, MailboxKey,
    MailboxTarget, TemplateId, TemplateList, UserId,
};
use crate::store::{RemoteStore, StoreError};
use crate::sync_queue::SyncQueue;

pub const POLL_INTERVAL_MS: u64 = 10_000;
pub const ENROLL_TIMEOUT_MS: u64 = 25_000;
pub const STATE_TIMEOUT_MS: u64 = 500;
pub const SCAN_INTERVAL_MS: u64 = 250;
pub const JOB_TIMEOUT_MS: u64 = 30_000;
pub const JOB_RETRY_MS: u64 = 1_000;

/// Character buffer slots on the sensor.
const SLOT_FIRST: u8 = 1;
const SLOT_SECOND: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    CaptureImage,
    ConvertTemplate,
    SearchDatabase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnrollState {
    WaitFirstCapture,
    ConvertFirst,
    WaitRemoval,
    WaitSecondCapture,
    ConvertSecond,
    CreateTemplate,
    StoreTemplate,
    Complete,
    Failed(EnrollFailure),
}

/// Notable results surfaced to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Authenticated(Match),
    Enrolled { user: UserId, template: TemplateId },
    EnrollFailed(EnrollFailure),
    Deleted { user: UserId, total: u8, deleted: u8 },
}

struct Enrollment {
    key: MailboxKey,
    user: UserId,
    id: TemplateId,
    state: EnrollState,
    started_at: u64,
}

#[derive(Clone, Debug)]
enum FinalizeStep {
    MarkRegistered,
    MapTemplate,
    LoadTemplates,
    SaveTemplates(TemplateList),
    Unmap,
    ClearMailbox,
}

struct Finalize {
    key: MailboxKey,
    user: UserId,
    id: TemplateId,
    step: FinalizeStep,
    deadline: u64,
    retry_at: u64,
}

struct EnrollStart {
    key: MailboxKey,
    target: MailboxTarget,
    deadline: u64,
    retry_at: u64,
}

#[derive(Clone, Copy, Debug)]
enum DeleteStep {
    Consume,
    Resolve,
    LoadList,
    Sensor(usize),
    Unmap(usize),
    Rewrite,
}

struct DeleteJob {
    key: MailboxKey,
    target: MailboxTarget,
    user: Option<UserId>,
    all: bool,
    requested: TemplateList,
    total: u8,
    owned: TemplateList,
    deleted: TemplateList,
    step: DeleteStep,
    deadline: u64,
    retry_at: u64,
}

enum Mode {
    Idle,
    Auth { state: AuthState, since: u64 },
    EnrollStart(EnrollStart),
    Enroll(Enrollment),
    Finalize(Finalize),
    Delete(DeleteJob),
}

pub struct Biometric {
    mode: Mode,
    next_poll_at: u64,
    next_scan_at: u64,
}

impl Default for Biometric {
    fn default() -> Self {
        Self::new()
    }
}

impl Biometric {
    pub const fn new() -> Self {
        Self {
            mode: Mode::Idle,
            next_poll_at: 0,
            next_scan_at: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.mode, Mode::Idle)
    }

    pub fn auth_state(&self) -> AuthState {
        match self.mode {
            Mode::Auth { state, .. } => state,
            _ => AuthState::Idle,
        }
    }

    pub fn enroll_state(&self) -> Option<EnrollState> {
        match &self.mode {
            Mode::Enroll(e) => Some(e.state),
            _ => None,
        }
    }

    /// True while a finger is being read for an enrollment or a match.
    pub fn is_scanning(&self) -> bool {
        match &self.mode {
            Mode::Enroll(_) => true,
            Mode::Auth { state, .. } => *state != AuthState::CaptureImage,
            _ => false,
        }
    }

    /// Advance the active activity by one step.
    pub fn step<S: RemoteStore, F: FingerprintSensor>(
        &mut self,
        now: u64,
        store: &mut S,
        sensor: &mut F,
        ready: bool,
        log: &mut SyncQueue,
    ) -> Option<Outcome> {
        match core::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Idle => self.idle(now, store, ready),
            Mode::Auth { state, since } => self.auth(state, since, now, sensor, log),
            Mode::EnrollStart(job) => self.enroll_start(job, now, store, sensor, ready, log),
            Mode::Enroll(session) => self.enroll(session, now, sensor, log),
            Mode::Finalize(job) => self.finalize(job, now, store, sensor, ready, log),
            Mode::Delete(job) => self.delete(job, now, store, sensor, ready, log),
        }
    }

    fn idle<S: RemoteStore>(&mut self, now: u64, store: &mut S, ready: bool) -> Option<Outcome> {
        if ready && now >= self.next_poll_at {
            self.next_poll_at = now + POLL_INTERVAL_MS;
            self.poll_commands(now, store);
            if !self.is_idle() {
                return None;
            }
        }
        if now >= self.next_scan_at {
            self.next_scan_at = now + SCAN_INTERVAL_MS;
            self.mode = Mode::Auth {
                state: AuthState::CaptureImage,
                since: now,
            };
        }
        None
    }

    fn poll_commands<S: RemoteStore>(&mut self, now: u64, store: &mut S) {
        let mailbox = match store.mailbox() {
            Ok(mailbox) => mailbox,
            Err(e) => {
                log::warn!("bio: mailbox read failed: {}", e);
                return;
            }
        };

        for (key, command) in mailbox {
            let Some(target) = MailboxTarget::from_key(&key) else {
                log::warn!("bio: ignoring mailbox key '{}'", key);
                continue;
            };
            match command {
                MailboxCommand::Registered => continue,
                MailboxCommand::Enroll => {
                    log::info!("bio: enroll requested for '{}'", key);
                    self.mode = Mode::EnrollStart(EnrollStart {
                        key,
                        target,
                        deadline: now + JOB_TIMEOUT_MS,
                        retry_at: now,
                    });
                }
                MailboxCommand::DeleteAll | MailboxCommand::Delete(_) => {
                    let (all, requested) = match command {
                        MailboxCommand::Delete(ids) => (false, ids),
                        _ => (true, TemplateList::new()),
                    };
                    let total = requested.len() as u8;
                    log::info!("bio: delete requested for '{}'", key);
                    self.mode = Mode::Delete(DeleteJob {
                        key,
                        target,
                        user: None,
                        all,
                        requested,
                        total,
                        owned: TemplateList::new(),
                        deleted: TemplateList::new(),
                        step: DeleteStep::Consume,
                        deadline: now + JOB_TIMEOUT_MS,
                        retry_at: now,
                    });
                }
            }
            return;
        }
    }

    // ---- authentication ----

    fn auth<F: FingerprintSensor>(
        &mut self,
        state: AuthState,
        since: u64,
        now: u64,
        sensor: &mut F,
        log: &mut SyncQueue,
    ) -> Option<Outcome> {
        if now.saturating_sub(since) > STATE_TIMEOUT_MS {
            log::warn!("bio: {:?} stalled, back to idle", state);
            return None;
        }

        let next = match state {
            AuthState::Idle => return None,
            AuthState::CaptureImage => match sensor.capture() {
                Ok(()) => AuthState::ConvertTemplate,
                Err(SensorError::NoFinger) => return None,
                Err(SensorError::BadImage) => AuthState::CaptureImage,
                Err(e) => {
                    log::warn!("bio: capture failed: {}", e);
                    return None;
                }
            },
            AuthState::ConvertTemplate => match sensor.convert(SLOT_FIRST) {
                Ok(()) => AuthState::SearchDatabase,
                Err(e) => {
                    log::debug!("bio: convert failed: {}", e);
                    return None;
                }
            },
            AuthState::SearchDatabase => match sensor.search() {
                Ok(found) => {
                    log::info!(
                        "bio: matched template {} (score {})",
                        found.id,
                        found.score
                    );
                    log.push_log(LogEvent::FingerprintAuthenticated { template: found.id }, now);
                    return Some(Outcome::Authenticated(found));
                }
                Err(SensorError::NotFound) => {
                    log::info!("bio: no match");
                    return None;
                }
                Err(e) => {
                    log::warn!("bio: search failed: {}", e);
                    return None;
                }
            },
        };

        let since = if next == state { since } else { now };
        self.mode = Mode::Auth { state: next, since };
        None
    }

    // ---- enrollment ----

    fn enroll_start<S: RemoteStore, F: FingerprintSensor>(
        &mut self,
        mut job: EnrollStart,
        now: u64,
        store: &mut S,
        sensor: &mut F,
        ready: bool,
        log: &mut SyncQueue,
    ) -> Option<Outcome> {
        if now > job.deadline {
            log::warn!("bio: enroll for '{}' could not start", job.key);
            return None;
        }
        if !ready || now < job.retry_at {
            self.mode = Mode::EnrollStart(job);
            return None;
        }

        let resolved = match &job.target {
            MailboxTarget::User(user) => Ok(Some(user.clone())),
            MailboxTarget::Tag(tag) => store
                .registered_users()
                .map(|users| registered_user(&users, *tag).cloned()),
        };
        let user = match resolved {
            Ok(Some(user)) => user,
            Ok(None) => {
                let user = job.key.clone();
                return self.fail_enroll(job.key, user, EnrollFailure::UnknownUser, now, log);
            }
            Err(e) => {
                log::warn!("bio: registry read failed: {}", e);
                job.retry_at = now + JOB_RETRY_MS;
                self.mode = Mode::EnrollStart(job);
                return None;
            }
        };

        let free = match sensor.index() {
            Ok(index) => index.first_free(),
            Err(e) => {
                log::error!("bio: index read failed: {}", e);
                return self.fail_enroll(job.key, user, EnrollFailure::Sensor, now, log);
            }
        };
        let Some(id) = free else {
            return self.fail_enroll(job.key, user, EnrollFailure::NoCapacity, now, log);
        };

        log::info!("bio: enrolling {} into slot {}", user, id);
        self.mode = Mode::Enroll(Enrollment {
            key: job.key,
            user,
            id,
            state: EnrollState::WaitFirstCapture,
            started_at: now,
        });
        None
    }

    fn enroll<F: FingerprintSensor>(
        &mut self,
        mut session: Enrollment,
        now: u64,
        sensor: &mut F,
        log: &mut SyncQueue,
    ) -> Option<Outcome> {
        if now.saturating_sub(session.started_at) > ENROLL_TIMEOUT_MS {
            log::warn!("bio: enrollment timed out in {:?}", session.state);
            session.state = EnrollState::Failed(EnrollFailure::Timeout);
        }

        session.state = match session.state {
            EnrollState::WaitFirstCapture => match sensor.capture() {
                Ok(()) => EnrollState::ConvertFirst,
                Err(SensorError::NoFinger) | Err(SensorError::BadImage) => {
                    EnrollState::WaitFirstCapture
                }
                Err(_) => EnrollState::Failed(EnrollFailure::Sensor),
            },
            EnrollState::ConvertFirst => match sensor.convert(SLOT_FIRST) {
                Ok(()) => {
                    log::info!("bio: first capture ok, remove finger");
                    EnrollState::WaitRemoval
                }
                Err(SensorError::BadImage) => EnrollState::WaitFirstCapture,
                Err(_) => EnrollState::Failed(EnrollFailure::Sensor),
            },
            EnrollState::WaitRemoval => match sensor.capture() {
                Err(SensorError::NoFinger) => EnrollState::WaitSecondCapture,
                Ok(()) | Err(SensorError::BadImage) => EnrollState::WaitRemoval,
                Err(_) => EnrollState::Failed(EnrollFailure::Sensor),
            },
            EnrollState::WaitSecondCapture => match sensor.capture() {
                Ok(()) => EnrollState::ConvertSecond,
                Err(SensorError::NoFinger) | Err(SensorError::BadImage) => {
                    EnrollState::WaitSecondCapture
                }
                Err(_) => EnrollState::Failed(EnrollFailure::Sensor),
            },
            EnrollState::ConvertSecond => match sensor.convert(SLOT_SECOND) {
                Ok(()) => EnrollState::CreateTemplate,
                Err(SensorError::BadImage) => EnrollState::WaitSecondCapture,
                Err(_) => EnrollState::Failed(EnrollFailure::Sensor),
            },
            EnrollState::CreateTemplate => match sensor.create_model() {
                Ok(()) => EnrollState::StoreTemplate,
                Err(SensorError::Mismatch) => EnrollState::Failed(EnrollFailure::Mismatch),
                Err(_) => EnrollState::Failed(EnrollFailure::Sensor),
            },
            EnrollState::StoreTemplate => match sensor.store_model(session.id) {
                Ok(()) => EnrollState::Complete,
                Err(_) => EnrollState::Failed(EnrollFailure::Sensor),
            },
            terminal => terminal,
        };

        match session.state {
            EnrollState::Complete => {
                log::info!("bio: template {} stored for {}", session.id, session.user);
                self.mode = Mode::Finalize(Finalize {
                    key: session.key,
                    user: session.user,
                    id: session.id,
                    step: FinalizeStep::MarkRegistered,
                    deadline: now + JOB_TIMEOUT_MS,
                    retry_at: now,
                });
                None
            }
            EnrollState::Failed(reason) => {
                self.fail_enroll(session.key, session.user, reason, now, log)
            }
            _ => {
                self.mode = Mode::Enroll(session);
                None
            }
        }
    }

    /// Log the failure and clear the mailbox entry.
    fn fail_enroll(
        &mut self,
        key: MailboxKey,
        user: UserId,
        reason: EnrollFailure,
        now: u64,
        log: &mut SyncQueue,
    ) -> Option<Outcome> {
        log::warn!("bio: enrollment for {} failed: {}", user, reason.as_str());
        log.push_log(
            LogEvent::FingerprintEnrollmentFailed {
                user: user.clone(),
                reason,
            },
            now,
        );
        self.mode = Mode::Finalize(Finalize {
            key,
            user,
            id: 0,
            step: FinalizeStep::ClearMailbox,
            deadline: now + JOB_TIMEOUT_MS,
            retry_at: now,
        });
        Some(Outcome::EnrollFailed(reason))
    }

    fn finalize<S: RemoteStore, F: FingerprintSensor>(
        &mut self,
        mut job: Finalize,
        now: u64,
        store: &mut S,
        sensor: &mut F,
        ready: bool,
        log: &mut SyncQueue,
    ) -> Option<Outcome> {
        if now > job.deadline {
            if let FinalizeStep::Unmap | FinalizeStep::ClearMailbox = job.step {
                log::warn!("bio: could not clean up mailbox entry '{}'", job.key);
                return None;
            }
            log::error!("bio: could not record template {}, removing it", job.id);
            if let Err(e) = sensor.delete(job.id) {
                log::error!("bio: delete of template {} failed: {}", job.id, e);
            }
            log.push_log(
                LogEvent::FingerprintEnrollmentFailed {
                    user: job.user.clone(),
                    reason: EnrollFailure::Store,
                },
                now,
            );
            // Undo whatever part of the record already reached the store
            job.step = FinalizeStep::Unmap;
            job.deadline = now + JOB_TIMEOUT_MS;
            job.retry_at = now;
            self.mode = Mode::Finalize(job);
            return Some(Outcome::EnrollFailed(EnrollFailure::Store));
        }
        if !ready || now < job.retry_at {
            self.mode = Mode::Finalize(job);
            return None;
        }

        let result = match &job.step {
            FinalizeStep::MarkRegistered => store
                .mark_registered(&job.key)
                .map(|()| FinalizeStep::MapTemplate),
            FinalizeStep::MapTemplate => store
                .map_template(job.id, &job.user)
                .map(|()| FinalizeStep::LoadTemplates),
            FinalizeStep::LoadTemplates => match store.user_templates(&job.user) {
                Ok(list) => Ok(FinalizeStep::SaveTemplates(list)),
                Err(StoreError::NotFound) => Ok(FinalizeStep::SaveTemplates(TemplateList::new())),
                Err(e) => Err(e),
            },
            FinalizeStep::SaveTemplates(list) => {
                let mut list = list.clone();
                if !list.contains(&job.id) && list.push(job.id).is_err() {
                    log::warn!("bio: template list for {} is full", job.user);
                }
                match store.set_user_templates(&job.user, &list) {
                    Ok(()) => {
                        log::info!("bio: enrolled {} as template {}", job.user, job.id);
                        log.push_log(
                            LogEvent::FingerprintEnrolled {
                                user: job.user.clone(),
                                template: job.id,
                            },
                            now,
                        );
                        return Some(Outcome::Enrolled {
                            user: job.user,
                            template: job.id,
                        });
                    }
                    Err(e) => Err(e),
                }
            }
            FinalizeStep::Unmap => match store.unmap_template(job.id) {
                Ok(()) | Err(StoreError::NotFound) => Ok(FinalizeStep::ClearMailbox),
                Err(e) => Err(e),
            },
            FinalizeStep::ClearMailbox => match store.clear_mailbox(&job.key) {
                Ok(()) | Err(StoreError::NotFound) => return None,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(step) => job.step = step,
            Err(e) => {
                log::warn!("bio: {:?} failed: {}", job.step, e);
                job.retry_at = now + JOB_RETRY_MS;
            }
        }
        self.mode = Mode::Finalize(job);
        None
    }

    // ---- deletion ----

    fn delete<S: RemoteStore, F: FingerprintSensor>(
        &mut self,
        mut job: DeleteJob,
        now: u64,
        store: &mut S,
        sensor: &mut F,
        ready: bool,
        log: &mut SyncQueue,
    ) -> Option<Outcome> {
        if now > job.deadline {
            log::warn!("bio: delete job for '{}' timed out", job.key);
            return Some(finish_delete(job, now, log));
        }

        // Sensor-only step; runs regardless of the store
        if let DeleteStep::Sensor(i) = job.step {
            match job.requested.get(i).copied() {
                Some(id) => {
                    match sensor.delete(id) {
                        Ok(()) => {
                            let _ = job.deleted.push(id);
                        }
                        Err(e) => log::warn!("bio: delete of template {} failed: {}", id, e),
                    }
                    job.step = DeleteStep::Sensor(i + 1);
                }
                None => job.step = DeleteStep::Unmap(0),
            }
            self.mode = Mode::Delete(job);
            return None;
        }

        if !ready || now < job.retry_at {
            self.mode = Mode::Delete(job);
            return None;
        }

        match job.step {
            DeleteStep::Consume => match store.clear_mailbox(&job.key) {
                Ok(()) | Err(StoreError::NotFound) => {
                    job.step = match &job.target {
                        MailboxTarget::Tag(_) => DeleteStep::Resolve,
                        MailboxTarget::User(user) => {
                            job.user = Some(user.clone());
                            DeleteStep::LoadList
                        }
                    };
                }
                Err(e) => job.retry(now, e),
            },
            DeleteStep::Resolve => match store.registered_users() {
                Ok(users) => {
                    let tag = match job.target {
                        MailboxTarget::Tag(tag) => tag,
                        MailboxTarget::User(_) => '\0',
                    };
                    match registered_user(&users, tag) {
                        Some(user) => {
                            job.user = Some(user.clone());
                            job.step = DeleteStep::LoadList;
                        }
                        None => {
                            log::warn!("bio: no user registered under '{}'", job.key);
                            return Some(finish_delete(job, now, log));
                        }
                    }
                }
                Err(e) => job.retry(now, e),
            },
            DeleteStep::LoadList => {
                let user = job.user.clone().unwrap_or_default();
                match store.user_templates(&user) {
                    Ok(list) => {
                        job.owned = list;
                        job.step = DeleteStep::Sensor(0);
                    }
                    Err(StoreError::NotFound) => job.step = DeleteStep::Sensor(0),
                    Err(e) => {
                        job.retry(now, e);
                        self.mode = Mode::Delete(job);
                        return None;
                    }
                }
                if job.all {
                    job.requested = job.owned.clone();
                    job.total = job.owned.len() as u8;
                } else {
                    // Ids the user does not own are never touched and count as failures
                    let owned = &job.owned;
                    for id in job.requested.iter().filter(|id| !owned.contains(id)) {
                        log::warn!("bio: template {} does not belong to '{}'", id, job.key);
                    }
                    job.requested.retain(|id| owned.contains(id));
                }
            }
            DeleteStep::Sensor(_) => {}
            DeleteStep::Unmap(i) => match job.deleted.get(i).copied() {
                Some(id) => {
                    match store.unmap_template(id) {
                        Ok(()) | Err(StoreError::NotFound) => job.step = DeleteStep::Unmap(i + 1),
                        Err(StoreError::Unavailable) => job.retry(now, StoreError::Unavailable),
                        Err(e) => {
                            log::warn!("bio: unmap of template {} failed: {}", id, e);
                            job.step = DeleteStep::Unmap(i + 1);
                        }
                    }
                }
                None => job.step = DeleteStep::Rewrite,
            },
            DeleteStep::Rewrite => {
                let user = job.user.clone().unwrap_or_default();
                let remaining: TemplateList = job
                    .owned
                    .iter()
                    .copied()
                    .filter(|id| !job.deleted.contains(id))
                    .collect();
                match store.set_user_templates(&user, &remaining) {
                    Ok(()) | Err(StoreError::NotFound) => return Some(finish_delete(job, now, log)),
                    Err(StoreError::Unavailable) => job.retry(now, StoreError::Unavailable),
                    Err(e) => {
                        log::warn!("bio: template list rewrite failed: {}", e);
                        return Some(finish_delete(job, now, log));
                    }
                }
            }
        }

        self.mode = Mode::Delete(job);
        None
    }
}

impl DeleteJob {
    fn retry(&mut self, now: u64, e: StoreError) {
        log::warn!("bio: delete step {:?} failed: {}", self.step, e);
        self.retry_at = now + JOB_RETRY_MS;
    }
}

fn finish_delete(job: DeleteJob, now: u64, log: &mut SyncQueue) -> Outcome {
    let user = match job.user {
        Some(user) => user,
        None => job.key.clone(),
    };
    let total = job.total;
    let deleted = job.deleted.len() as u8;
    log::info!(
        "bio: deleted {}/{} templates for {}",
        deleted,
        total,
        user
    );
    log.push_log(
        LogEvent::FingerprintsDeleted {
            user: user.clone(),
            all: job.all,
            total,
            deleted,
        },
        now,
    );
    Outcome::Deleted {
        user,
        total,
        deleted,
    }
}
