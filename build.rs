//! Build script for compile-time configuration injection.
//!
//! Set environment variables before building to configure the firmware:
//!
//!   SAFE_WIFI_SSID=MyWiFi \
//!   SAFE_WIFI_PASSWORD=secret123 \
//!   SAFE_STORE_HOST=192.168.1.40 \
//!   SAFE_STORE_PORT=9000 \
//!   SAFE_STORE_AUTH=database-secret \
//!   cargo build --release
//!
//! The WiFi pair is only the factory default. Credentials provisioned through
//! the remote store are persisted to flash and take precedence.

fn main() {
    println!("cargo::rerun-if-env-changed=SAFE_WIFI_SSID");
    println!("cargo::rerun-if-env-changed=SAFE_WIFI_PASSWORD");
    println!("cargo::rerun-if-env-changed=SAFE_STORE_HOST");
    println!("cargo::rerun-if-env-changed=SAFE_STORE_PORT");
    println!("cargo::rerun-if-env-changed=SAFE_STORE_AUTH");
}
