//! WiFi station connection for ESP32.
//!
//! Synchronous station-mode connect using esp-idf-svc; credentials come
//! from the build-time [`FixedConfig`].

use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use std::net::Ipv4Addr;

use crate::fixed::FixedConfig;

/// WiFi connection manager.
///
/// The connection is established during construction and the driver is
/// kept alive for the lifetime of this struct.
pub struct Esp32Wifi<'a> {
    wifi: BlockingWifi<EspWifi<'a>>,
}

impl Esp32Wifi<'_> {
    /// Connect to the configured access point and wait for DHCP.
    pub fn connect(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
        fixed: &FixedConfig,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), nvs)?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;

        let mut ssid: heapless::String<32> = heapless::String::new();
        let _ = ssid.push_str(fixed.wifi_ssid.as_str());
        let mut password: heapless::String<64> = heapless::String::new();
        let _ = password.push_str(fixed.wifi_password.as_str());

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid,
            password,
            ..Default::default()
        }))?;

        log::info!(target: "network", "WiFi starting");
        wifi.start()?;

        log::info!(target: "network", "WiFi connecting to '{}'", fixed.wifi_ssid);
        wifi.connect()?;
        wifi.wait_netif_up()?;

        if let Ok(ip_info) = wifi.wifi().sta_netif().get_ip_info() {
            log::info!(target: "network", "WiFi up, IP {}", ip_info.ip);
        }

        Ok(Self { wifi })
    }

    /// The current IP address, if connected.
    pub fn ip_addr(&self) -> Option<Ipv4Addr> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
    }

    /// True while associated with the access point.
    pub fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }
}
