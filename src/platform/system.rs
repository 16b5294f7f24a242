// ─── Llamadas al sistema: reset, MAC, deep sleep, slot OTA ───

use anyhow::Result;
use esp_idf_svc::ota::EspOta;
use esp_idf_svc::sys;
use log::warn;
use std::time::Duration;

use soil_moisture_node::WakeReason;

/// Lee el registro de reset una sola vez al arrancar.
pub fn wake_reason() -> WakeReason {
    if unsafe { sys::esp_reset_reason() } == sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP {
        WakeReason::DeepSleepWake
    } else {
        WakeReason::Other
    }
}

/// MAC de la interfaz station (base de la identidad del nodo).
pub fn station_mac() -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    sys::esp!(unsafe {
        sys::esp_read_mac(mac.as_mut_ptr(), sys::esp_mac_type_t_ESP_MAC_WIFI_STA)
    })?;
    Ok(mac)
}

/// Nombre y versión del firmware que está corriendo (slot OTA activo).
pub fn firmware_info() -> (String, String) {
    let fallback = || ("factory".to_string(), env!("CARGO_PKG_VERSION").to_string());

    let slot = match EspOta::new().and_then(|ota| ota.get_running_slot()) {
        Ok(slot) => slot,
        Err(e) => {
            warn!("Cannot read running OTA slot: {:?}", e);
            return fallback();
        }
    };

    let version = slot
        .firmware
        .map(|firmware| firmware.version.as_str().to_string())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    (slot.label.as_str().to_string(), version)
}

/// Marca la imagen actual como válida: sin esto el bootloader hace
/// rollback al próximo reinicio.
pub fn confirm_running_image() {
    match EspOta::new() {
        Ok(mut ota) => {
            if let Err(e) = ota.mark_running_slot_valid() {
                warn!("Cannot mark running slot valid: {:?}", e);
            }
        }
        Err(e) => warn!("Cannot open OTA: {:?}", e),
    }
}

#[allow(unreachable_code)]
pub fn restart() -> ! {
    unsafe {
        sys::esp_restart();
    }
    unreachable!()
}

#[allow(unreachable_code)]
pub fn deep_sleep(period: Duration) -> ! {
    let micros = u64::try_from(period.as_micros()).unwrap_or(u64::MAX);
    unsafe {
        sys::esp_deep_sleep(micros);
    }
    unreachable!()
}
