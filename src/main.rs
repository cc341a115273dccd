//! Safe controller - ESP32 firmware for a networked lockbox.
//!
//! Architecture:
//! - A single cooperative loop drives the `coordinator` once per iteration.
//! - Unlocks come from one-time passwords (flashed optically or relayed over
//!   the link) and from fingerprint matches; the lock itself is actuated by
//!   the companion controller on the serial link.
//! - State and events are mirrored to a realtime document store over WiFi.

#![no_std]
#![no_main]

use esp_bootloader_esp_idf::esp_app_desc;
esp_app_desc!();

mod biometric;
mod config;
mod coordinator;
mod fingerprint;
mod http;
mod indicator;
mod json;
mod link;
mod morse;
mod network;
mod otp;
mod reconnect;
mod schema;
mod serial;
mod signal;
mod storage;
mod store;
mod sync_queue;

extern crate alloc;

use core::cell::RefCell;
use core::mem::MaybeUninit;
use critical_section::Mutex;
use esp_alloc as _;
use esp_hal::{
    analog::adc::{Adc, AdcConfig, Attenuation},
    clock::CpuClock,
    delay::Delay,
    gpio::{Level, Output, OutputConfig},
    main,
    time::Duration,
    timer::timg::{TimerGroup, Wdt},
    uart::{Config as UartConfig, Uart},
};
use esp_println::logger::init_logger;
use esp_radio::wifi::Config as WifiConfig;
use esp_storage::FlashStorage;
use static_cell::StaticCell;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::fingerprint::R30x;
use crate::indicator::RgbLed;
use crate::network::NetStack;
use crate::reconnect::NetworkProfile;
use crate::schema::device_id_from_mac;
use crate::serial::SerialPort;
use crate::storage::{Persisted, Storage};
use crate::store::RtdbStore;

const LINK_BAUD: u32 = 9_600;
const SENSOR_BAUD: u32 = 57_600;
const SENSOR_SECURITY_LEVEL: u8 = 1;
const LOOP_SLEEP_US: u32 = 1_000;

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();

// Watchdog timer, fed from the main loop and during long network waits
pub(crate) static WATCHDOG: Mutex<RefCell<Option<Wdt<esp_hal::peripherals::TIMG1<'static>>>>> =
    Mutex::new(RefCell::new(None));

/// Feed the watchdog timer.
pub fn feed_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.feed();
        }
    });
}

/// Disable the watchdog around flash writes, which stall the CPU cache.
/// Must be paired with `enable_watchdog()`.
pub fn disable_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.disable();
        }
    });
}

pub fn enable_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.enable();
        }
    });
}

fn now_ms() -> u64 {
    esp_hal::time::Instant::now().duration_since_epoch().as_millis()
}

/// Unrecoverable init failure: log and let the watchdog reset us.
fn halt(what: &str) -> ! {
    log::error!("fatal: {}", what);
    loop {
        core::hint::spin_loop();
    }
}

#[main]
fn main() -> ! {
    init_logger(log::LevelFilter::Info);
    log::info!("Safe controller starting...");

    // Heap for the WiFi driver and its config strings
    const HEAP_SIZE: usize = 72 * 1024;
    static mut HEAP: MaybeUninit<[u8; HEAP_SIZE]> = MaybeUninit::uninit();
    unsafe {
        esp_alloc::HEAP.add_region(esp_alloc::HeapRegion::new(
            core::ptr::addr_of_mut!(HEAP) as *mut u8,
            HEAP_SIZE,
            esp_alloc::MemoryCapability::Internal.into(),
        ));
    }

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // Start the esp-rtos scheduler (required before esp_radio::init)
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Watchdog on TIMG1 (TIMG0 drives the scheduler)
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.enable();
    wdt.set_timeout(
        esp_hal::timer::timg::MwdtStage::Stage0,
        Duration::from_secs(30),
    );
    critical_section::with(|cs| {
        WATCHDOG.borrow_ref_mut(cs).replace(wdt);
    });

    let Ok(radio) = esp_radio::init() else {
        halt("radio init");
    };
    let radio = RADIO.init(radio);
    let Ok((wifi_controller, interfaces)) =
        esp_radio::wifi::new(radio, peripherals.WIFI, WifiConfig::default())
    else {
        halt("wifi init");
    };

    // Persistent identity and credentials
    let settings = Config::get();
    let mut storage = Storage::new(FlashStorage::new());
    let mut persisted = storage.state().clone();
    if persisted.device_id.is_empty() {
        persisted.device_id = device_id_from_mac(esp_radio::wifi::sta_mac());
    }
    let profile = NetworkProfile::new(
        persisted.active.clone(),
        persisted.last_good.clone(),
        settings.default_credentials(),
    );
    persisted.active = profile.active.clone();
    save(&mut storage, &persisted);
    log::info!(
        "config: device={}, ssid={}, store={}:{}",
        persisted.device_id,
        profile.active.ssid,
        settings.store_host,
        settings.store_port
    );

    let Some(net) = NetStack::new(
        wifi_controller,
        interfaces.sta,
        profile.active.clone(),
        settings.store_host,
        settings.store_port,
    ) else {
        halt("network stack init");
    };
    let store = RtdbStore::new(
        net,
        settings.store_host,
        settings.store_auth,
        persisted.device_id.clone(),
    );

    let delay = Delay::new();

    // Fingerprint sensor on UART1 (GPIO32=RX, GPIO33=TX)
    let Ok(sensor_uart) = Uart::new(
        peripherals.UART1,
        UartConfig::default().with_baudrate(SENSOR_BAUD),
    ) else {
        halt("sensor uart");
    };
    let sensor_uart = sensor_uart
        .with_rx(peripherals.GPIO32)
        .with_tx(peripherals.GPIO33);
    let mut sensor = R30x::new(SerialPort::new(sensor_uart), delay);
    match sensor.init(SENSOR_SECURITY_LEVEL) {
        Ok(()) => log::info!("bio: sensor ready"),
        Err(e) => log::error!("bio: sensor init failed: {}", e),
    }

    // Companion lock controller on UART2 (GPIO16=RX, GPIO17=TX)
    let Ok(link_uart) = Uart::new(
        peripherals.UART2,
        UartConfig::default().with_baudrate(LINK_BAUD),
    ) else {
        halt("link uart");
    };
    let link_uart = link_uart
        .with_rx(peripherals.GPIO16)
        .with_tx(peripherals.GPIO17);

    // Photodiode on GPIO34 (ADC1)
    let mut adc_config = AdcConfig::new();
    let mut photodiode = adc_config.enable_pin(peripherals.GPIO34, Attenuation::_11dB);
    let mut adc = Adc::new(peripherals.ADC1, adc_config);

    // Status LED (GPIO25=R, GPIO26=G, GPIO27=B)
    let mut led = RgbLed::new(
        Output::new(peripherals.GPIO25, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO26, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO27, Level::Low, OutputConfig::default()),
    );

    let mut coordinator = Coordinator::new(
        store,
        sensor,
        SerialPort::new(link_uart),
        delay,
        profile,
    );

    let mut last_log: u64 = 0;
    loop {
        let now = now_ms();

        coordinator.store_mut().transport_mut().poll(now);
        let state = coordinator.tick(now, || adc.read_oneshot(&mut photodiode).ok());
        led.show(state);

        if let Some(profile) = coordinator.take_profile_update() {
            persisted.active = profile.active.clone();
            persisted.last_good = profile.last_good.clone();
            save(&mut storage, &persisted);
        }

        if now - last_log > 30_000 {
            last_log = now;
            log::info!(
                "status: {:?}, {} logs queued, wifi={}",
                state,
                coordinator.queue().log_len(),
                coordinator.profile().active.ssid
            );
        }

        feed_watchdog();

        // Yield so the WiFi driver tasks can run
        esp_radio_rtos_driver::usleep(LOOP_SLEEP_US);
    }
}

fn save(storage: &mut Storage<FlashStorage>, persisted: &Persisted) {
    feed_watchdog();
    disable_watchdog();
    let result = storage.save(persisted);
    enable_watchdog();
    feed_watchdog();
    if let Err(e) = result {
        log::error!("storage: save failed: {:?}", e);
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    critical_section::with(|_| {
        log::error!("PANIC: {}", info);
    });

    // Spin without feeding watchdog. The 30s timeout will trigger a full system reset.
    loop {
        core::hint::spin_loop();
    }
}
