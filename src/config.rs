//! Compile-time configuration and network credentials.
//!
//! Values are embedded at build time via environment variables (see build.rs).
//! The WiFi pair compiled in here is the factory default; credentials pushed
//! from the remote store override it once persisted.

use heapless::String;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;

/// Remote store and factory network configuration, embedded at compile time.
#[derive(Clone)]
pub struct Config {
    pub ssid: &'static str,
    pub password: &'static str,
    pub store_host: &'static str,
    pub store_port: u16,
    pub store_auth: &'static str,
}

impl Config {
    /// Get the compile-time configuration.
    pub fn get() -> Self {
        Self {
            ssid: option_env!("SAFE_WIFI_SSID").unwrap_or("unconfigured"),
            password: option_env!("SAFE_WIFI_PASSWORD").unwrap_or(""),
            store_host: option_env!("SAFE_STORE_HOST").unwrap_or("192.168.1.1"),
            store_port: match option_env!("SAFE_STORE_PORT") {
                Some(s) => parse_port(s),
                None => DEFAULT_STORE_PORT,
            },
            store_auth: option_env!("SAFE_STORE_AUTH").unwrap_or(""),
        }
    }

    /// Factory WiFi credentials, used when nothing better is persisted.
    pub fn default_credentials(&self) -> Credentials {
        Credentials::new(self.ssid, self.password)
    }
}

const DEFAULT_STORE_PORT: u16 = 9000;

/// Parse port at compile time (const fn compatible).
pub const fn parse_port(s: &str) -> u16 {
    let bytes = s.as_bytes();
    let mut result: u16 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit >= b'0' && digit <= b'9' {
            result = result.wrapping_mul(10).wrapping_add((digit - b'0') as u16);
        }
        i += 1;
    }
    if result == 0 {
        DEFAULT_STORE_PORT
    } else {
        result
    }
}

/// A WiFi station credential pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String<MAX_SSID_LEN>,
    pub password: String<MAX_PASSWORD_LEN>,
}

impl Credentials {
    /// Build credentials, truncating anything that does not fit.
    pub fn new(ssid: &str, password: &str) -> Self {
        let mut creds = Self::default();
        push_truncated(&mut creds.ssid, ssid);
        push_truncated(&mut creds.password, password);
        creds
    }

    pub fn is_empty(&self) -> bool {
        self.ssid.is_empty()
    }
}

fn push_truncated<const N: usize>(out: &mut String<N>, s: &str) {
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
}
