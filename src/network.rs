//! WiFi station, DHCP and a blocking-with-deadline TCP transport for the store.
//!
//! `poll` runs every main loop iteration to keep the radio associated and the
//! interface serviced. `exchange` opens one connection per request
//! (`Connection: close`), bounded by [`EXCHANGE_TIMEOUT_MS`].

use alloc::string::ToString;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet, SocketStorage};
use smoltcp::socket::dhcpv4::{Event as DhcpEvent, Socket as DhcpSocket};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, Ipv4Address};
use static_cell::StaticCell;

use crate::config::Credentials;
use crate::http;
use crate::store::{StoreError, Transport};

// WiFi connection constants
const WIFI_CONNECT_TIMEOUT_MS: u64 = 10_000;
const WIFI_MAX_RETRIES_BEFORE_RESET: u8 = 3;
const WIFI_RESET_COOLDOWN_MS: u64 = 5_000;

pub const EXCHANGE_TIMEOUT_MS: u64 = 5_000;
const LOCAL_PORT_BASE: u16 = 49152;
const LOCAL_PORT_SPAN: u16 = 16_000;

static SOCKETS: StaticCell<[SocketStorage<'static>; 2]> = StaticCell::new();
static TCP_RX: StaticCell<[u8; 2048]> = StaticCell::new();
static TCP_TX: StaticCell<[u8; 1024]> = StaticCell::new();

fn now_ms() -> u64 {
    esp_hal::time::Instant::now().duration_since_epoch().as_millis()
}

/// WiFi connection state machine.
struct WifiState {
    connected: bool,
    connecting: bool,
    connect_started: u64,
    retry_count: u8,
    cooldown_until: u64,
}

impl WifiState {
    fn new() -> Self {
        Self {
            connected: false,
            connecting: false,
            connect_started: 0,
            retry_count: 0,
            cooldown_until: 0,
        }
    }

    /// Returns false when the association was lost on this call.
    fn maintain(&mut self, controller: &mut WifiController<'static>, network: &Credentials, now: u64) -> bool {
        if !self.connected {
            if now < self.cooldown_until {
                // Radio was just power-cycled
            } else if !self.connecting {
                log::info!("wifi: connecting to {}", network.ssid);

                // Ensure WiFi is stopped before (re)configuring to avoid ESP-IDF errors
                let _ = controller.stop();
                esp_radio_rtos_driver::usleep(10_000);

                let client_config = ClientConfig::default()
                    .with_ssid(network.ssid.as_str().to_string())
                    .with_password(network.password.as_str().to_string());
                if let Err(e) = controller.set_config(&ModeConfig::Client(client_config)) {
                    log::error!("wifi: set_config failed: {:?}", e);
                }
                if let Err(e) = controller.start() {
                    log::error!("wifi: start failed: {:?}", e);
                }
                if let Err(e) = controller.connect() {
                    log::error!("wifi: connect failed: {:?}", e);
                }
                self.connecting = true;
                self.connect_started = now;
            } else if controller.is_connected().unwrap_or(false) {
                log::info!("wifi: connected");
                self.connected = true;
                self.connecting = false;
                self.retry_count = 0;
            } else if now - self.connect_started > WIFI_CONNECT_TIMEOUT_MS {
                self.retry_count = self.retry_count.saturating_add(1);
                log::warn!(
                    "wifi: connection timeout (attempt {}/{})",
                    self.retry_count,
                    WIFI_MAX_RETRIES_BEFORE_RESET
                );
                if self.retry_count >= WIFI_MAX_RETRIES_BEFORE_RESET {
                    log::warn!("wifi: power-cycling radio after {} failures", self.retry_count);
                    self.power_cycle(controller, now);
                    self.retry_count = 0;
                }
                self.connecting = false;
            }
            true
        } else if !controller.is_connected().unwrap_or(false) {
            log::warn!("wifi: disconnected, will power-cycle radio");
            self.connected = false;
            self.connecting = false;
            self.power_cycle(controller, now);
            false
        } else {
            true
        }
    }

    fn power_cycle(&mut self, controller: &mut WifiController<'static>, now: u64) {
        if let Err(e) = controller.disconnect() {
            log::warn!("wifi: disconnect failed: {:?}", e);
        }
        if let Err(e) = controller.stop() {
            log::warn!("wifi: stop failed: {:?}", e);
        }
        crate::feed_watchdog();
        esp_radio_rtos_driver::usleep(100_000);
        self.cooldown_until = now + WIFI_RESET_COOLDOWN_MS;
    }

    /// Drop the association and start over with new credentials.
    fn restart(&mut self, controller: &mut WifiController<'static>, now: u64) {
        self.connected = false;
        self.connecting = false;
        self.retry_count = 0;
        let _ = controller.disconnect();
        let _ = controller.stop();
        self.cooldown_until = now;
    }
}

/// Radio, IP stack and the single store socket.
pub struct NetStack {
    controller: WifiController<'static>,
    device: WifiDevice<'static>,
    iface: Interface,
    sockets: SocketSet<'static>,
    dhcp: SocketHandle,
    tcp: SocketHandle,
    wifi: WifiState,
    network: Credentials,
    ip_configured: bool,
    remote: (IpAddress, u16),
    next_port: u16,
}

impl NetStack {
    /// Set up the interface. Returns `None` if called twice or if `host` is
    /// not a dotted IPv4 address.
    pub fn new(
        controller: WifiController<'static>,
        mut device: WifiDevice<'static>,
        network: Credentials,
        host: &str,
        port: u16,
    ) -> Option<Self> {
        let ip = http::parse_ipv4(host)?;

        let mac = esp_radio::wifi::sta_mac();
        let hw_addr = HardwareAddress::Ethernet(EthernetAddress(mac));
        let iface = Interface::new(IfaceConfig::new(hw_addr), &mut device, SmoltcpInstant::ZERO);

        let storage = SOCKETS.try_init(Default::default())?;
        let mut sockets = SocketSet::new(&mut storage[..]);
        let dhcp = sockets.add(DhcpSocket::new());

        let rx_buf = TCP_RX.try_init([0; 2048])?;
        let tx_buf = TCP_TX.try_init([0; 1024])?;
        let rx = SocketBuffer::new(&mut rx_buf[..]);
        let tx = SocketBuffer::new(&mut tx_buf[..]);
        let tcp = sockets.add(TcpSocket::new(rx, tx));

        Some(Self {
            controller,
            device,
            iface,
            sockets,
            dhcp,
            tcp,
            wifi: WifiState::new(),
            network,
            ip_configured: false,
            remote: (IpAddress::Ipv4(Ipv4Address::from(ip)), port),
            next_port: 0,
        })
    }

    /// Service the radio and the interface. Call once per loop iteration.
    pub fn poll(&mut self, now: u64) {
        if !self.wifi.maintain(&mut self.controller, &self.network, now) {
            self.deconfigure();
        }
        if !self.wifi.connected {
            return;
        }

        self.iface.poll(
            SmoltcpInstant::from_millis(now as i64),
            &mut self.device,
            &mut self.sockets,
        );

        let dhcp = self.sockets.get_mut::<DhcpSocket>(self.dhcp);
        match dhcp.poll() {
            Some(DhcpEvent::Configured(config)) => {
                let addr = config.address;
                self.iface.update_ip_addrs(|addrs| {
                    addrs.clear();
                    addrs.push(IpCidr::Ipv4(addr)).ok();
                });
                if let Some(router) = config.router {
                    self.iface.routes_mut().add_default_ipv4_route(router).ok();
                }
                log::info!("dhcp: IP={}", addr);
                self.ip_configured = true;
            }
            Some(DhcpEvent::Deconfigured) => {
                log::warn!("dhcp: deconfigured");
                self.iface.update_ip_addrs(|addrs| addrs.clear());
                self.ip_configured = false;
            }
            None => {}
        }
    }

    fn deconfigure(&mut self) {
        self.iface.update_ip_addrs(|addrs| addrs.clear());
        self.ip_configured = false;
    }

    fn poll_iface(&mut self) -> u64 {
        let now = now_ms();
        self.iface.poll(
            SmoltcpInstant::from_millis(now as i64),
            &mut self.device,
            &mut self.sockets,
        );
        now
    }

    fn local_port(&mut self) -> u16 {
        self.next_port = (self.next_port + 1) % LOCAL_PORT_SPAN;
        LOCAL_PORT_BASE + self.next_port
    }

    fn close(&mut self) {
        self.sockets.get_mut::<TcpSocket>(self.tcp).abort();
        self.poll_iface();
    }

    fn connect(&mut self, deadline: u64) -> Result<(), StoreError> {
        let port = self.local_port();
        let remote = self.remote;
        let socket = self.sockets.get_mut::<TcpSocket>(self.tcp);
        if socket.state() != TcpState::Closed {
            socket.abort();
        }
        if socket.connect(self.iface.context(), remote, port).is_err() {
            log::error!("store: connect initiation failed");
            return Err(StoreError::Unavailable);
        }

        let mut last_wdt_feed = now_ms();
        loop {
            let now = self.poll_iface();
            let socket = self.sockets.get_mut::<TcpSocket>(self.tcp);
            if socket.may_send() {
                return Ok(());
            }
            if now > deadline || socket.state() == TcpState::Closed {
                log::error!("store: connection timeout");
                return Err(StoreError::Unavailable);
            }
            if now - last_wdt_feed >= 1000 {
                last_wdt_feed = now;
                crate::feed_watchdog();
            }
            esp_radio_rtos_driver::usleep(5_000);
        }
    }

    fn send_all(&mut self, request: &[u8], deadline: u64) -> Result<(), StoreError> {
        let mut sent = 0;
        while sent < request.len() {
            let socket = self.sockets.get_mut::<TcpSocket>(self.tcp);
            match socket.send_slice(&request[sent..]) {
                Ok(n) => sent += n,
                Err(_) => {
                    log::error!("store: send failed");
                    return Err(StoreError::Unavailable);
                }
            }
            let now = self.poll_iface();
            if sent < request.len() {
                if now > deadline {
                    log::error!("store: send timeout");
                    return Err(StoreError::Unavailable);
                }
                esp_radio_rtos_driver::usleep(5_000);
            }
        }
        Ok(())
    }

    fn receive(&mut self, response: &mut [u8], deadline: u64) -> Result<usize, StoreError> {
        let mut len = 0;
        let mut last_wdt_feed = now_ms();
        loop {
            let now = self.poll_iface();
            let socket = self.sockets.get_mut::<TcpSocket>(self.tcp);

            if socket.may_recv() && len < response.len() {
                if let Ok(n) = socket.recv_slice(&mut response[len..]) {
                    len += n;
                }
            }

            if http::is_complete(&response[..len]) {
                return Ok(len);
            }
            let closed = matches!(socket.state(), TcpState::CloseWait | TcpState::Closed);
            if closed && http::find_header_end(&response[..len]).is_some() {
                return Ok(len);
            }
            if len == response.len() {
                log::error!("store: response larger than {} bytes", response.len());
                return Err(StoreError::Overflow);
            }
            if closed {
                log::error!("store: connection closed unexpectedly");
                return Err(StoreError::Unavailable);
            }
            if now > deadline {
                log::error!("store: response timeout");
                return Err(StoreError::Unavailable);
            }
            if now - last_wdt_feed >= 1000 {
                last_wdt_feed = now;
                crate::feed_watchdog();
            }
            esp_radio_rtos_driver::usleep(5_000);
        }
    }
}

impl NetStack {
    fn transact(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize, StoreError> {
        let deadline = now_ms() + EXCHANGE_TIMEOUT_MS;
        self.connect(deadline)?;
        self.send_all(request, deadline)?;
        self.receive(response, deadline)
    }
}

impl Transport for NetStack {
    fn link_up(&mut self) -> bool {
        self.wifi.connected && self.ip_configured
    }

    fn reconnect(&mut self, network: &Credentials) {
        log::info!("wifi: switching to {}", network.ssid);
        self.network = network.clone();
        self.wifi.restart(&mut self.controller, now_ms());
        self.deconfigure();
    }

    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize, StoreError> {
        if !self.link_up() {
            return Err(StoreError::Unavailable);
        }
        let result = self.transact(request, response);
        self.close();
        result
    }
}
