//! One-time password verification and first-user registration.
//!
//! An OTP is a user tag character followed by a payload. Verification runs as
//! a small state machine that issues one remote call per tick:
//!
//! ```text
//! LookupUser -> FetchCode -> LoadRegistry -> Consume -> LoadRole -> [AssignRole]
//!                                      \-> Register -> Consume -> AssignRole(admin)
//! ```
//!
//! The stored code is deleted on a match, so a replay finds nothing.

use heapless::String;

use crate::schema::{is_valid_tag, registered_user, LogEvent, Role, UserId};
use crate::store::{RemoteStore, StoreError};
use crate::sync_queue::SyncQueue;

/// Deployment profile: tag character plus a four-character payload.
pub const OTP_LENGTH: usize = 5;
pub const MIN_OTP_LENGTH: usize = 2;
pub const OTP_TEXT_CAP: usize = 16;
pub const VERIFY_TIMEOUT_MS: u64 = 10_000;

pub type OtpText = String<OTP_TEXT_CAP>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtpError {
    Format,
    Unavailable,
    NotFound,
    Mismatch,
    Unregistered,
    Timeout,
    Store(StoreError),
}

impl core::fmt::Display for OtpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            OtpError::Format => write!(f, "bad format"),
            OtpError::Unavailable => write!(f, "store unavailable"),
            OtpError::NotFound => write!(f, "no such code"),
            OtpError::Mismatch => write!(f, "code mismatch"),
            OtpError::Unregistered => write!(f, "user not registered to this device"),
            OtpError::Timeout => write!(f, "verification timed out"),
            OtpError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl From<StoreError> for OtpError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable => OtpError::Unavailable,
            StoreError::NotFound => OtpError::NotFound,
            other => OtpError::Store(other),
        }
    }
}

/// A well-formed OTP split into tag and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtpCode {
    pub tag: char,
    pub payload: OtpText,
}

impl OtpCode {
    /// The stored code may hold the payload alone or the full transmitted text.
    fn matches(&self, stored: &str) -> bool {
        if stored == self.payload.as_str() {
            return true;
        }
        let mut chars = stored.chars();
        chars.next() == Some(self.tag) && chars.as_str() == self.payload.as_str()
    }
}

/// Split and validate received text against the deployment OTP length.
pub fn validate_format(input: &str) -> Result<OtpCode, OtpError> {
    validate_format_len(input, OTP_LENGTH)
}

pub fn validate_format_len(input: &str, expected_len: usize) -> Result<OtpCode, OtpError> {
    let len = input.chars().count();
    if len < MIN_OTP_LENGTH || len != expected_len {
        return Err(OtpError::Format);
    }
    let mut chars = input.chars();
    let tag = chars.next().ok_or(OtpError::Format)?;
    if !is_valid_tag(tag) {
        return Err(OtpError::Format);
    }
    let mut payload = OtpText::new();
    payload
        .push_str(chars.as_str())
        .map_err(|_| OtpError::Format)?;
    Ok(OtpCode { tag, payload })
}

/// Outcome of a successful verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verified {
    pub user: UserId,
    pub role: Role,
    pub first_user: bool,
}

#[derive(Clone, Debug)]
enum Step {
    LookupUser,
    FetchCode { user: UserId },
    LoadRegistry { user: UserId },
    Register { user: UserId },
    Consume { user: UserId, first: bool },
    LoadRole { user: UserId, first: bool },
    AssignRole { user: UserId, role: Role, first: bool },
}

struct Session {
    code: OtpCode,
    step: Step,
    started_at: u64,
}

/// Non-blocking OTP verifier. At most one verification is in flight.
#[derive(Default)]
pub struct OtpVerifier {
    session: Option<Session>,
}

impl OtpVerifier {
    pub fn new() -> Self {
        Self { session: None }
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_some()
    }

    /// Start verifying `code`. Returns false if a verification is in flight.
    pub fn begin(&mut self, code: OtpCode, now: u64) -> bool {
        if self.session.is_some() {
            return false;
        }
        log::info!("otp: verifying tag '{}'", code.tag);
        self.session = Some(Session {
            code,
            step: Step::LookupUser,
            started_at: now,
        });
        true
    }

    /// Advance by one remote call. Returns the result once finished.
    pub fn step<S: RemoteStore>(
        &mut self,
        now: u64,
        store: &mut S,
        ready: bool,
        log: &mut SyncQueue,
    ) -> Option<Result<Verified, OtpError>> {
        let session = self.session.as_mut()?;
        let tag = session.code.tag;

        let result = if !ready {
            Some(Err(OtpError::Unavailable))
        } else if now.saturating_sub(session.started_at) > VERIFY_TIMEOUT_MS {
            Some(Err(OtpError::Timeout))
        } else {
            advance(session, store, log, now)
        };

        let result = result?;
        self.session = None;
        match &result {
            Ok(v) => {
                log::info!("otp: verified user {} as {}", v.user, v.role.as_str());
                log.push_log(
                    LogEvent::OtpVerified {
                        user: v.user.clone(),
                        role: v.role,
                    },
                    now,
                );
            }
            Err(e) => {
                log::warn!("otp: tag '{}' rejected: {}", tag, e);
                if matches!(e, OtpError::Unavailable | OtpError::Timeout | OtpError::Store(_)) {
                    log.push_log(LogEvent::UserVerificationFailed { tag }, now);
                }
            }
        }
        Some(result)
    }
}

fn advance<S: RemoteStore>(
    session: &mut Session,
    store: &mut S,
    log: &mut SyncQueue,
    now: u64,
) -> Option<Result<Verified, OtpError>> {
    let tag = session.code.tag;
    let step = core::mem::replace(&mut session.step, Step::LookupUser);

    let next = match step {
        Step::LookupUser => match store.find_user_by_tag(tag) {
            Ok(user) => Step::FetchCode { user },
            Err(e) => {
                if e == StoreError::NotFound {
                    log.push_log(LogEvent::OtpVerificationFailed { tag }, now);
                }
                return Some(Err(e.into()));
            }
        },

        Step::FetchCode { user } => match store.otp_code(&user) {
            Ok(Some(stored)) if session.code.matches(&stored) => Step::LoadRegistry { user },
            Ok(stored) => {
                log.push_log(LogEvent::OtpVerificationFailed { tag }, now);
                let e = if stored.is_some() {
                    OtpError::Mismatch
                } else {
                    OtpError::NotFound
                };
                return Some(Err(e));
            }
            Err(e) => return Some(Err(e.into())),
        },

        Step::LoadRegistry { user } => {
            let users = match store.registered_users() {
                Ok(users) => users,
                Err(StoreError::NotFound) => Default::default(),
                Err(e) => return Some(Err(e.into())),
            };
            if users.is_empty() {
                log::info!("otp: device has no users, registering {} as admin", user);
                Step::Register { user }
            } else if registered_user(&users, tag) == Some(&user) {
                Step::Consume { user, first: false }
            } else {
                log.push_log(LogEvent::UnauthorizedUserAttempt { tag, user }, now);
                return Some(Err(OtpError::Unregistered));
            }
        }

        Step::Register { user } => match store.register_user(tag, &user) {
            Ok(()) => Step::Consume { user, first: true },
            Err(e) => {
                log.push_log(LogEvent::FirstUserRegistrationFailed { user }, now);
                return Some(Err(e.into()));
            }
        },

        Step::Consume { user, first } => match store.clear_otp_code(&user) {
            // The first user on a device is always its admin, whatever role was left behind.
            Ok(()) if first => Step::AssignRole {
                user,
                role: Role::Admin,
                first,
            },
            Ok(()) => Step::LoadRole { user, first },
            Err(e) => return Some(Err(e.into())),
        },

        // The code is consumed from here on; role bookkeeping cannot fail the unlock.
        Step::LoadRole { user, first } => match store.user_role(&user) {
            Ok(Some(role)) => {
                return Some(Ok(Verified {
                    user,
                    role,
                    first_user: first,
                }))
            }
            Ok(None) | Err(StoreError::NotFound) => {
                let role = if first { Role::Admin } else { Role::User };
                Step::AssignRole { user, role, first }
            }
            Err(e) => {
                log::warn!("otp: role lookup failed: {}", e);
                let role = if first { Role::Admin } else { Role::User };
                return Some(Ok(Verified {
                    user,
                    role,
                    first_user: first,
                }));
            }
        },

        Step::AssignRole { user, role, first } => {
            if let Err(e) = store.set_user_role(&user, role) {
                log::warn!("otp: failed to record role for {}: {}", user, e);
            }
            return Some(Ok(Verified {
                user,
                role,
                first_user: first,
            }));
        }
    };

    session.step = next;
    None
}
