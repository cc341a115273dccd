//! Remote document store client.
//!
//! [`RemoteStore`] is the typed boundary the domain logic talks to.
//! [`RtdbStore`] implements it over a realtime-database style REST API
//! (`<path>.json?auth=<secret>`), with all socket work delegated to a
//! [`Transport`]. Every method performs at most one HTTP exchange.

use heapless::String;
use serde::{Deserialize, Serialize};

use crate::config::Credentials;
use crate::http::{self, HttpError, Method};
use crate::json;
use crate::otp::OtpText;
use crate::schema::{
    bounded, is_valid_tag, DeviceId, LogEntry, Mailbox, MailboxCommand, MailboxKey, RegisteredUsers, Role,
    StatusSnapshot, TemplateId, TemplateList, UserId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// Network down or the exchange did not complete.
    Unavailable,
    /// The queried record does not exist.
    NotFound,
    /// Reply could not be decoded.
    Format,
    /// Non-success HTTP status.
    Rejected(u16),
    /// Request or reply did not fit the local buffers.
    Overflow,
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::Unavailable => write!(f, "store unavailable"),
            StoreError::NotFound => write!(f, "not found"),
            StoreError::Format => write!(f, "malformed reply"),
            StoreError::Rejected(status) => write!(f, "rejected with status {}", status),
            StoreError::Overflow => write!(f, "buffer overflow"),
        }
    }
}

impl From<HttpError> for StoreError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Overflow => StoreError::Overflow,
            HttpError::Malformed => StoreError::Format,
        }
    }
}

/// Typed operations against the remote store.
pub trait RemoteStore {
    /// Network-level readiness (association and address), no I/O.
    fn link_up(&mut self) -> bool;
    /// Re-associate using `network`.
    fn reconnect(&mut self, network: &Credentials);
    /// Cheap authenticated round trip.
    fn ping(&mut self) -> Result<(), StoreError>;

    fn find_user_by_tag(&mut self, tag: char) -> Result<UserId, StoreError>;
    fn otp_code(&mut self, user: &str) -> Result<Option<OtpText>, StoreError>;
    fn clear_otp_code(&mut self, user: &str) -> Result<(), StoreError>;
    fn registered_users(&mut self) -> Result<RegisteredUsers, StoreError>;
    fn register_user(&mut self, tag: char, user: &str) -> Result<(), StoreError>;
    fn user_role(&mut self, user: &str) -> Result<Option<Role>, StoreError>;
    fn set_user_role(&mut self, user: &str, role: Role) -> Result<(), StoreError>;

    fn update_status(&mut self, status: &StatusSnapshot) -> Result<(), StoreError>;
    fn append_log(&mut self, entry: &LogEntry) -> Result<(), StoreError>;

    fn mailbox(&mut self) -> Result<Mailbox, StoreError>;
    fn mark_registered(&mut self, key: &str) -> Result<(), StoreError>;
    fn clear_mailbox(&mut self, key: &str) -> Result<(), StoreError>;
    fn map_template(&mut self, id: TemplateId, user: &str) -> Result<(), StoreError>;
    fn unmap_template(&mut self, id: TemplateId) -> Result<(), StoreError>;
    fn user_templates(&mut self, user: &str) -> Result<TemplateList, StoreError>;
    /// Replace the user's template list; an empty list removes it.
    fn set_user_templates(&mut self, user: &str, ids: &[TemplateId]) -> Result<(), StoreError>;

    /// Credentials provisioned for this device, if any.
    fn network_credentials(&mut self) -> Result<Option<Credentials>, StoreError>;
}

/// Byte-level request/response exchange with the store host.
pub trait Transport {
    fn link_up(&mut self) -> bool;
    fn reconnect(&mut self, network: &Credentials);
    /// Send `request` and collect the full response into `response`.
    /// Returns the number of bytes received.
    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize, StoreError>;
}

const REQUEST_CAP: usize = 1024;
const RESPONSE_CAP: usize = 2048;
const BODY_CAP: usize = 512;
const TARGET_CAP: usize = 256;

type Target = String<TARGET_CAP>;

#[derive(Deserialize)]
struct WifiDoc<'a> {
    #[serde(borrow)]
    ssid: Option<&'a str>,
    #[serde(borrow)]
    password: Option<&'a str>,
}

/// REST client for the realtime-database layout described in `schema`.
pub struct RtdbStore<T> {
    transport: T,
    host: &'static str,
    auth: &'static str,
    device_id: DeviceId,
    request: [u8; REQUEST_CAP],
    response: [u8; RESPONSE_CAP],
}

impl<T: Transport> RtdbStore<T> {
    pub fn new(transport: T, host: &'static str, auth: &'static str, device_id: DeviceId) -> Self {
        Self {
            transport,
            host,
            auth,
            device_id,
            request: [0; REQUEST_CAP],
            response: [0; RESPONSE_CAP],
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn target(&self, segments: &[&str], query: &str) -> Result<Target, StoreError> {
        let mut t = Target::new();
        if segments.is_empty() {
            t.push('/').map_err(|_| StoreError::Overflow)?;
        }
        for segment in segments {
            t.push('/').map_err(|_| StoreError::Overflow)?;
            http::push_encoded(&mut t, segment)?;
        }
        t.push_str(".json?").map_err(|_| StoreError::Overflow)?;
        if !query.is_empty() {
            t.push_str(query).map_err(|_| StoreError::Overflow)?;
            t.push('&').map_err(|_| StoreError::Overflow)?;
        }
        t.push_str("auth=").map_err(|_| StoreError::Overflow)?;
        http::push_encoded(&mut t, self.auth)?;
        Ok(t)
    }

    /// Perform one exchange and return the reply body.
    fn call(&mut self, method: Method, target: &str, body: &[u8]) -> Result<&str, StoreError> {
        let len = http::write_request(&mut self.request, method, self.host, target, body)?;
        let received = self
            .transport
            .exchange(&self.request[..len], &mut self.response)?;

        let (status, body) = http::parse_response(&self.response[..received])?;
        match status {
            200..=299 => core::str::from_utf8(body).map_err(|_| StoreError::Format),
            404 => Err(StoreError::NotFound),
            _ => {
                log::warn!("store: {} {} -> {}", method.as_str(), strip_auth(target), status);
                Err(StoreError::Rejected(status))
            }
        }
    }

    fn get(&mut self, segments: &[&str], query: &str) -> Result<&str, StoreError> {
        let target = self.target(segments, query)?;
        self.call(Method::Get, &target, &[])
    }

    fn send<V: Serialize>(
        &mut self,
        method: Method,
        segments: &[&str],
        value: &V,
    ) -> Result<(), StoreError> {
        let mut body = [0u8; BODY_CAP];
        let len = serde_json_core::to_slice(value, &mut body).map_err(|_| StoreError::Overflow)?;
        let target = self.target(segments, "")?;
        self.call(method, &target, &body[..len]).map(|_| ())
    }

    fn delete(&mut self, segments: &[&str]) -> Result<(), StoreError> {
        let target = self.target(segments, "")?;
        self.call(Method::Delete, &target, &[]).map(|_| ())
    }
}

fn strip_auth(target: &str) -> &str {
    target.split("auth=").next().unwrap_or(target)
}

fn template_segment(id: TemplateId) -> String<6> {
    use core::fmt::Write as FmtWrite;
    let mut s = String::new();
    let _ = write!(s, "{}", id);
    s
}

impl<T: Transport> RemoteStore for RtdbStore<T> {
    fn link_up(&mut self) -> bool {
        self.transport.link_up()
    }

    fn reconnect(&mut self, network: &Credentials) {
        self.transport.reconnect(network);
    }

    fn ping(&mut self) -> Result<(), StoreError> {
        self.get(&["status", "pingTest"], "").map(|_| ())
    }

    fn find_user_by_tag(&mut self, tag: char) -> Result<UserId, StoreError> {
        let mut query: String<64> = String::new();
        let mut tag_buf = [0u8; 4];
        let _ = query.push_str("orderBy=%22tag%22&equalTo=%22");
        http::push_encoded(&mut query, tag.encode_utf8(&mut tag_buf))?;
        let _ = query.push_str("%22&limitToFirst=1");

        let body = self.get(&["users"], &query)?;
        let first = json::members(body)
            .map_err(|_| StoreError::Format)?
            .next()
            .ok_or(StoreError::NotFound)?
            .map_err(|_| StoreError::Format)?;
        bounded(first.0).ok_or(StoreError::Overflow)
    }

    fn otp_code(&mut self, user: &str) -> Result<Option<OtpText>, StoreError> {
        let body = self.get(&["users", user, "otp", "code"], "")?;
        let (code, _) =
            serde_json_core::from_str::<Option<&str>>(body).map_err(|_| StoreError::Format)?;
        match code {
            Some(code) => bounded(code).map(Some).ok_or(StoreError::Format),
            None => Ok(None),
        }
    }

    fn clear_otp_code(&mut self, user: &str) -> Result<(), StoreError> {
        self.delete(&["users", user, "otp", "code"])
    }

    fn registered_users(&mut self) -> Result<RegisteredUsers, StoreError> {
        let device = self.device_id.clone();
        let body = self.get(&["devices", device.as_str(), "registeredUsers"], "")?;
        let mut users = RegisteredUsers::new();
        for member in json::members(body).map_err(|_| StoreError::Format)? {
            let (key, value) = member.map_err(|_| StoreError::Format)?;
            let mut chars = key.chars();
            let tag = match (chars.next(), chars.next()) {
                (Some(tag), None) if is_valid_tag(tag) => tag,
                _ => {
                    log::warn!("store: ignoring registered user key '{}'", key);
                    continue;
                }
            };
            let Some(user): Option<UserId> = json::str_value(value).and_then(bounded) else {
                continue;
            };
            if users.push((tag, user)).is_err() {
                log::warn!("store: registered users truncated");
                break;
            }
        }
        Ok(users)
    }

    fn register_user(&mut self, tag: char, user: &str) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        let mut tag_buf = [0u8; 4];
        let tag: &str = tag.encode_utf8(&mut tag_buf);
        self.send(Method::Put, &["devices", device.as_str(), "registeredUsers", tag], &user)
    }

    fn user_role(&mut self, user: &str) -> Result<Option<Role>, StoreError> {
        let device = self.device_id.clone();
        let body = self.get(&["users", user, "registeredDevices", device.as_str(), "role"], "")?;
        let (role, _) =
            serde_json_core::from_str::<Option<&str>>(body).map_err(|_| StoreError::Format)?;
        Ok(role.and_then(Role::parse))
    }

    fn set_user_role(&mut self, user: &str, role: Role) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        self.send(
            Method::Put,
            &["users", user, "registeredDevices", device.as_str(), "role"],
            &role.as_str(),
        )
    }

    fn update_status(&mut self, status: &StatusSnapshot) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        self.send(Method::Patch, &["devices", device.as_str()], &status.device_doc(&device))
    }

    fn append_log(&mut self, entry: &LogEntry) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        self.send(Method::Post, &["devices", device.as_str(), "logs"], &entry.record())
    }

    fn mailbox(&mut self) -> Result<Mailbox, StoreError> {
        let device = self.device_id.clone();
        let body = self.get(&["devices", device.as_str(), "fingerprint"], "")?;
        let mut mailbox = Mailbox::new();
        for member in json::members(body).map_err(|_| StoreError::Format)? {
            let (key, value) = member.map_err(|_| StoreError::Format)?;
            // The id->user map shares this node and is not a string
            let Some(value) = json::str_value(value) else {
                continue;
            };
            let parsed: (Option<MailboxKey>, _) = (bounded(key), MailboxCommand::parse(value));
            let (Some(key), Some(command)) = parsed else {
                log::warn!("store: ignoring mailbox entry {}={}", key, value);
                continue;
            };
            if mailbox.push((key, command)).is_err() {
                break;
            }
        }
        Ok(mailbox)
    }

    fn mark_registered(&mut self, key: &str) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        self.send(Method::Put, &["devices", device.as_str(), "fingerprint", key], &"registered")
    }

    fn clear_mailbox(&mut self, key: &str) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        self.delete(&["devices", device.as_str(), "fingerprint", key])
    }

    fn map_template(&mut self, id: TemplateId, user: &str) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        let id = template_segment(id);
        self.send(Method::Put, &["devices", device.as_str(), "fingerprint", "ids", id.as_str()], &user)
    }

    fn unmap_template(&mut self, id: TemplateId) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        let id = template_segment(id);
        self.delete(&["devices", device.as_str(), "fingerprint", "ids", id.as_str()])
    }

    fn user_templates(&mut self, user: &str) -> Result<TemplateList, StoreError> {
        let device = self.device_id.clone();
        let body = self.get(&["users", user, "registeredDevices", device.as_str(), "fingerprint"], "")?;
        let (ids, _) = serde_json_core::from_str::<Option<TemplateList>>(body)
            .map_err(|_| StoreError::Format)?;
        Ok(ids.unwrap_or_default())
    }

    fn set_user_templates(&mut self, user: &str, ids: &[TemplateId]) -> Result<(), StoreError> {
        let device = self.device_id.clone();
        let path = ["users", user, "registeredDevices", device.as_str(), "fingerprint"];
        if ids.is_empty() {
            self.delete(&path)
        } else {
            self.send(Method::Put, &path, &ids)
        }
    }

    fn network_credentials(&mut self) -> Result<Option<Credentials>, StoreError> {
        let device = self.device_id.clone();
        let body = self.get(&["devices", device.as_str(), "wifi"], "")?;
        let (doc, _) = serde_json_core::from_str::<Option<WifiDoc<'_>>>(body)
            .map_err(|_| StoreError::Format)?;
        Ok(doc.and_then(|doc| match (doc.ssid, doc.password) {
            (Some(ssid), Some(password)) if !ssid.is_empty() => {
                Some(Credentials::new(ssid, password))
            }
            _ => None,
        }))
    }
}
