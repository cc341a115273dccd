//! Tests for A/B flash persistence of identity and network credentials.

mod support;

use safe_controller::config::Credentials;
use safe_controller::schema::bounded;
use safe_controller::storage::{crc32, Persisted, Storage, StorageError, STORAGE_SLOT_A, STORAGE_SLOT_B};
use support::FakeFlash;

fn persisted(ssid: &str) -> Persisted {
    Persisted {
        device_id: bounded("A0B1C2D3E4F5").unwrap(),
        active: Credentials::new(ssid, "pw"),
        last_good: Credentials::new("home", "homepw"),
    }
}

// ============================================================================
// Tests for crc32
// ============================================================================

#[test]
fn test_crc32_known_values() {
    assert_eq!(crc32(b""), 0);
    assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
}

// ============================================================================
// Tests for Storage
// ============================================================================

#[test]
fn test_empty_flash_loads_defaults() {
    let storage = Storage::new(FakeFlash::default());
    assert_eq!(storage.state(), &Persisted::default());
    assert_eq!(storage.sequence(), 0);
}

#[test]
fn test_save_and_reload() {
    let mut storage = Storage::new(FakeFlash::default());
    storage.save(&persisted("office")).unwrap();
    assert_eq!(storage.sequence(), 1);

    let flash = std::mem::take(storage.flash_mut());
    let reloaded = Storage::new(flash);
    assert_eq!(reloaded.state(), &persisted("office"));
    assert_eq!(reloaded.sequence(), 1);
}

#[test]
fn test_writes_alternate_slots() {
    let mut storage = Storage::new(FakeFlash::default());
    storage.save(&persisted("one")).unwrap();
    storage.save(&persisted("two")).unwrap();
    storage.save(&persisted("three")).unwrap();
    assert_eq!(storage.sequence(), 3);

    let flash = storage.flash_mut();
    assert_eq!(flash.bytes.get(&STORAGE_SLOT_A).copied(), Some(0x45));
    assert_eq!(flash.bytes.get(&STORAGE_SLOT_B).copied(), Some(0x45));
    // Slot A holds seq 3, slot B seq 2
    assert_eq!(flash.bytes.get(&(STORAGE_SLOT_A + 4)).copied(), Some(3));
    assert_eq!(flash.bytes.get(&(STORAGE_SLOT_B + 4)).copied(), Some(2));

    let reloaded = Storage::new(std::mem::take(flash));
    assert_eq!(reloaded.state().active.ssid.as_str(), "three");
}

#[test]
fn test_unchanged_state_is_not_rewritten() {
    let mut storage = Storage::new(FakeFlash::default());
    storage.save(&persisted("office")).unwrap();
    storage.save(&persisted("office")).unwrap();
    assert_eq!(storage.flash_mut().writes, 1);
}

#[test]
fn test_corrupt_newest_slot_falls_back() {
    let mut storage = Storage::new(FakeFlash::default());
    storage.save(&persisted("old")).unwrap();
    storage.save(&persisted("new")).unwrap();

    // Newest record is in slot B; damage its body
    let mut flash = std::mem::take(storage.flash_mut());
    flash.corrupt(STORAGE_SLOT_B + 20);
    let reloaded = Storage::new(flash);
    assert_eq!(reloaded.state().active.ssid.as_str(), "old");
    assert_eq!(reloaded.sequence(), 1);
}

#[test]
fn test_save_after_fallback_overwrites_corrupt_slot() {
    let mut storage = Storage::new(FakeFlash::default());
    storage.save(&persisted("old")).unwrap();
    storage.save(&persisted("new")).unwrap();
    let mut flash = std::mem::take(storage.flash_mut());
    flash.corrupt(STORAGE_SLOT_B + 20);

    let mut storage = Storage::new(flash);
    storage.save(&persisted("newer")).unwrap();
    let reloaded = Storage::new(std::mem::take(storage.flash_mut()));
    assert_eq!(reloaded.state().active.ssid.as_str(), "newer");
}

#[test]
fn test_flash_write_failure() {
    let mut flash = FakeFlash::default();
    flash.fail_writes = true;
    let mut storage = Storage::new(flash);
    assert_eq!(storage.save(&persisted("x")), Err(StorageError::Flash));
    assert_eq!(storage.sequence(), 0);
    assert_eq!(storage.state(), &Persisted::default());
}
