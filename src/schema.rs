//! Typed view of the remote document tree.
//!
//! Domain code works with these types only; JSON paths and encoding live in
//! `store`.
//!
//! ```text
//! devices/<deviceId>/status                       StatusDoc
//! devices/<deviceId>/logs/<push-id>               LogRecord
//! devices/<deviceId>/registeredUsers/<tag>        userId
//! devices/<deviceId>/fingerprint/<userId|tag>     MailboxCommand
//! devices/<deviceId>/fingerprint/ids/<templateId> userId
//! devices/<deviceId>/wifi                         {ssid, password}
//! users/<userId>/otp/code                         payload
//! users/<userId>/tag                              tag
//! users/<userId>/registeredDevices/<deviceId>/role         Role
//! users/<userId>/registeredDevices/<deviceId>/fingerprint  [templateId]
//! ```

use core::fmt::Write as FmtWrite;
use heapless::{String, Vec};
use serde::Serialize;

/// Remote user ids are 28-character push/auth ids; leave headroom.
pub type UserId = String<32>;
pub type DeviceId = String<16>;
/// Mailbox keys are either a user id or a one-character tag.
pub type MailboxKey = String<32>;

/// Biometric sensor template slot.
pub type TemplateId = u16;
pub const FIRST_TEMPLATE_ID: TemplateId = 1;
pub const LAST_TEMPLATE_ID: TemplateId = 127;

pub const MAX_USER_TEMPLATES: usize = 8;
pub type TemplateList = Vec<TemplateId, MAX_USER_TEMPLATES>;

pub const MAX_REGISTERED_USERS: usize = 16;
pub type RegisteredUsers = Vec<(char, UserId), MAX_REGISTERED_USERS>;

pub const MAX_MAILBOX_ENTRIES: usize = 8;
pub type Mailbox = Vec<(MailboxKey, MailboxCommand), MAX_MAILBOX_ENTRIES>;

/// Build a bounded string, failing if it does not fit.
pub fn bounded<const N: usize>(s: &str) -> Option<String<N>> {
    let mut out = String::new();
    out.push_str(s).ok()?;
    Some(out)
}

/// Derive the device id from the station MAC: twelve upper-case hex digits.
pub fn device_id_from_mac(mac: [u8; 6]) -> DeviceId {
    let mut id = DeviceId::new();
    for byte in mac {
        let _ = write!(id, "{:02X}", byte);
    }
    id
}

/// Tags are single printable ASCII alphanumerics.
pub fn is_valid_tag(tag: char) -> bool {
    tag.is_ascii_alphanumeric()
}

/// Look up the user registered under `tag`.
pub fn registered_user<'a>(users: &'a RegisteredUsers, tag: char) -> Option<&'a UserId> {
    users.iter().find(|(t, _)| *t == tag).map(|(_, user)| user)
}

/// Device state reported to the store. Latest-wins in the sync queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub online: bool,
    pub locked: bool,
    pub secure: bool,
}

/// Placeholder the store replaces with its own clock on write.
#[derive(Clone, Copy, Serialize)]
pub struct ServerTimestamp {
    #[serde(rename = ".sv")]
    sv: &'static str,
}

pub const SERVER_TIMESTAMP: ServerTimestamp = ServerTimestamp { sv: "timestamp" };

#[derive(Serialize)]
pub struct StatusDoc {
    pub online: bool,
    pub locked: bool,
    pub secure: bool,
    pub timestamp: ServerTimestamp,
}

/// Patch applied to `devices/<id>`: keeps the device node announced and
/// replaces its status object.
#[derive(Serialize)]
pub struct DeviceDoc<'a> {
    pub id: &'a str,
    #[serde(rename = "lastSeen")]
    pub last_seen: ServerTimestamp,
    pub status: StatusDoc,
}

impl StatusSnapshot {
    pub fn device_doc<'a>(&self, device_id: &'a str) -> DeviceDoc<'a> {
        DeviceDoc {
            id: device_id,
            last_seen: SERVER_TIMESTAMP,
            status: StatusDoc {
                online: self.online,
                locked: self.locked,
                secure: self.secure,
                timestamp: SERVER_TIMESTAMP,
            },
        }
    }
}

/// Per-device user role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            _ => None,
        }
    }
}

/// Value of one fingerprint mailbox entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxCommand {
    Enroll,
    DeleteAll,
    Delete(TemplateList),
    Registered,
}

impl MailboxCommand {
    /// Parse a mailbox value. Unknown or malformed values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enroll" => Some(Self::Enroll),
            "delete_all" => Some(Self::DeleteAll),
            "registered" => Some(Self::Registered),
            _ => {
                let list = value.strip_prefix("delete_")?;
                let mut ids = TemplateList::new();
                for part in list.split(',') {
                    let id: TemplateId = part.trim().parse().ok()?;
                    if !(FIRST_TEMPLATE_ID..=LAST_TEMPLATE_ID).contains(&id) {
                        return None;
                    }
                    if !ids.contains(&id) {
                        ids.push(id).ok()?;
                    }
                }
                if ids.is_empty() {
                    None
                } else {
                    Some(Self::Delete(ids))
                }
            }
        }
    }
}

/// Who a mailbox key refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxTarget {
    Tag(char),
    User(UserId),
}

impl MailboxTarget {
    pub fn from_key(key: &str) -> Option<Self> {
        let mut chars = key.chars();
        match (chars.next(), chars.next()) {
            (Some(tag), None) if is_valid_tag(tag) => Some(Self::Tag(tag)),
            (Some(_), Some(_)) => bounded(key).map(Self::User),
            _ => None,
        }
    }
}

/// Reason attached to a failed enrollment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnrollFailure {
    Timeout,
    NoCapacity,
    Mismatch,
    Sensor,
    Store,
    UnknownUser,
}

impl EnrollFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollFailure::Timeout => "timeout",
            EnrollFailure::NoCapacity => "no_capacity",
            EnrollFailure::Mismatch => "fingerprints_did_not_match",
            EnrollFailure::Sensor => "sensor_error",
            EnrollFailure::Store => "store_failed",
            EnrollFailure::UnknownUser => "unknown_user",
        }
    }
}

impl core::fmt::Display for EnrollFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only device log events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    Locked,
    Unlocked,
    Secured,
    Compromised,
    OtpFormatInvalid,
    OtpVerified { user: UserId, role: Role },
    OtpVerificationFailed { tag: char },
    UnauthorizedUserAttempt { tag: char, user: UserId },
    FirstUserRegistrationFailed { user: UserId },
    UserVerificationFailed { tag: char },
    FingerprintAuthenticated { template: TemplateId },
    FingerprintEnrolled { user: UserId, template: TemplateId },
    FingerprintEnrollmentFailed { user: UserId, reason: EnrollFailure },
    FingerprintsDeleted { user: UserId, all: bool, total: u8, deleted: u8 },
}

impl LogEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LogEvent::Locked | LogEvent::Unlocked => "lock",
            LogEvent::Secured | LogEvent::Compromised => "security",
            LogEvent::OtpFormatInvalid => "otp_format_invalid",
            LogEvent::OtpVerified { .. } => "otp_verified",
            LogEvent::OtpVerificationFailed { .. } => "otp_verification_failed",
            LogEvent::UnauthorizedUserAttempt { .. } => "unauthorized_user_attempt",
            LogEvent::FirstUserRegistrationFailed { .. } => "first_user_registration_failed",
            LogEvent::UserVerificationFailed { .. } => "user_verification_failed",
            LogEvent::FingerprintAuthenticated { .. } => "fingerprint_authentication_success",
            LogEvent::FingerprintEnrolled { .. } => "fingerprint_enrolled",
            LogEvent::FingerprintEnrollmentFailed { .. } => "fingerprint_enrollment_failed",
            LogEvent::FingerprintsDeleted {
                all, total, deleted, ..
            } => {
                if *deleted == 0 {
                    "fingerprint_delete_failed"
                } else if *all {
                    "all_fingerprints_deleted"
                } else if deleted == total {
                    "user_fingerprints_deleted"
                } else {
                    "user_fingerprints_delete_partial"
                }
            }
        }
    }
}

/// A queued log event with its local uptime stamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub event: LogEvent,
    pub at_ms: u64,
}

/// Wire form of a log entry.
#[derive(Serialize, Default)]
pub struct LogRecord<'a> {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<char>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(rename = "fingerprintId", skip_serializing_if = "Option::is_none")]
    pub fingerprint_id: Option<TemplateId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<u8>,
    pub timestamp: Option<ServerTimestamp>,
    pub uptime_ms: u64,
}

impl LogEntry {
    pub fn record(&self) -> LogRecord<'_> {
        let mut r = LogRecord {
            event: self.event.name(),
            timestamp: Some(SERVER_TIMESTAMP),
            uptime_ms: self.at_ms,
            ..LogRecord::default()
        };
        match &self.event {
            LogEvent::Locked => r.locked = Some(true),
            LogEvent::Unlocked => r.locked = Some(false),
            LogEvent::Secured => r.secure = Some(true),
            LogEvent::Compromised => r.secure = Some(false),
            LogEvent::OtpFormatInvalid => {}
            LogEvent::OtpVerified { user, role } => {
                r.user_id = Some(user.as_str());
                r.role = Some(role.as_str());
            }
            LogEvent::OtpVerificationFailed { tag } | LogEvent::UserVerificationFailed { tag } => {
                r.user_tag = Some(*tag);
            }
            LogEvent::UnauthorizedUserAttempt { tag, user } => {
                r.user_tag = Some(*tag);
                r.user_id = Some(user.as_str());
            }
            LogEvent::FirstUserRegistrationFailed { user } => r.user_id = Some(user.as_str()),
            LogEvent::FingerprintAuthenticated { template } => r.fingerprint_id = Some(*template),
            LogEvent::FingerprintEnrolled { user, template } => {
                r.user_id = Some(user.as_str());
                r.fingerprint_id = Some(*template);
            }
            LogEvent::FingerprintEnrollmentFailed { user, reason } => {
                r.user_id = Some(user.as_str());
                r.reason = Some(reason.as_str());
            }
            LogEvent::FingerprintsDeleted {
                user, total, deleted, ..
            } => {
                r.user_id = Some(user.as_str());
                r.total = Some(*total);
                r.success = Some(*deleted);
            }
        }
        r
    }
}
