//! USB vendor lookup used to decorate port listings. Cosmetic only.
use std::collections::HashMap;

use once_cell::sync::Lazy;

static VENDORS: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (0x303A, "Espressif Systems"),
        (0x1A86, "WCH (WinChipHead)"),
        (0x10C4, "Silicon Labs"),
        (0x0403, "FTDI"),
    ])
});

/// USB bridges commonly found on ESP boards: (vid, pid, description)
pub const ESP_BRIDGES: &[(u16, u16, &str)] = &[
    (0x303A, 0x1001, "ESP32-S3 USB Serial/JTAG"),
    (0x10C4, 0xEA60, "CP210x UART Bridge"),
    (0x1A86, 0x7523, "CH340 Serial"),
    (0x1A86, 0x55D4, "CH9102 Serial"),
    (0x0403, 0x6001, "FTDI Serial"),
];

pub fn manufacturer_for(vid: u16) -> Option<&'static str> {
    VENDORS.get(&vid).copied()
}

/// Exact bridge match, or any port from a vendor that makes ESP bridges
pub fn is_esp_bridge(vid: u16, pid: u16) -> bool {
    ESP_BRIDGES.iter().any(|&(v, p, _)| v == vid && p == pid) || ESP_BRIDGES.iter().any(|&(v, _, _)| v == vid)
}
