//! Fixed (build-time) configuration: network endpoints and identity.
//!
//! WiFi credentials, the broker endpoint and the base topic prefix are baked
//! in at build time through `option_env!` and are not runtime-configurable.
//! Uses `heapless::String` storage so the same struct works on device and
//! desktop.
//!
//! # Example
//!
//! ```rust
//! use luxbus::FixedConfig;
//!
//! let fixed = FixedConfig::default()
//!     .with_mqtt_host("broker.local")
//!     .with_topic("house/lights");
//!
//! assert_eq!(fixed.topic("status"), "house/lights/status");
//! assert!(!fixed.is_remote());
//! ```

use heapless::String as HString;

/// Maximum length for fixed config strings.
pub const MAX_FIXED_STRING: usize = 64;

/// Storage for fixed config strings.
pub type FixedString = HString<MAX_FIXED_STRING>;

fn fixed_string(s: &str) -> FixedString {
    let mut hs = FixedString::new();
    let take = s.len().min(MAX_FIXED_STRING);
    let valid_end = s
        .char_indices()
        .take_while(|(i, _)| *i < take)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let _ = hs.push_str(&s[..valid_end]);
    hs
}

/// Build-time configuration.
#[derive(Clone, Debug)]
pub struct FixedConfig {
    /// WiFi hostname.
    pub wifi_hostname: FixedString,
    /// WiFi network SSID.
    pub wifi_ssid: FixedString,
    /// WiFi password.
    pub wifi_password: FixedString,
    /// MQTT broker hostname or IP.
    pub mqtt_host: FixedString,
    /// MQTT broker port.
    pub mqtt_port: u16,
    /// Base topic prefix for all pub/sub.
    pub topic: FixedString,
    /// When non-empty, this controller forwards light commands to the
    /// controller listening on this topic instead of driving a local bus.
    pub remote_topic: FixedString,
    /// Optional chat channel for human-readable reports.
    pub report_channel: FixedString,
}

impl Default for FixedConfig {
    fn default() -> Self {
        Self {
            wifi_hostname: fixed_string(option_env!("LUXBUS_HOSTNAME").unwrap_or("luxbus")),
            wifi_ssid: fixed_string(option_env!("LUXBUS_WIFI_SSID").unwrap_or("")),
            wifi_password: fixed_string(option_env!("LUXBUS_WIFI_PASSWORD").unwrap_or("")),
            mqtt_host: fixed_string(option_env!("LUXBUS_MQTT_HOST").unwrap_or("localhost")),
            mqtt_port: option_env!("LUXBUS_MQTT_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(1883),
            topic: fixed_string(option_env!("LUXBUS_TOPIC").unwrap_or("lights")),
            remote_topic: fixed_string(option_env!("LUXBUS_REMOTE_TOPIC").unwrap_or("")),
            report_channel: fixed_string(option_env!("LUXBUS_REPORT_CHANNEL").unwrap_or("")),
        }
    }
}

impl FixedConfig {
    /// Set the broker host.
    pub fn with_mqtt_host(mut self, host: &str) -> Self {
        self.mqtt_host = fixed_string(host);
        self
    }

    /// Set the broker port.
    pub fn with_mqtt_port(mut self, port: u16) -> Self {
        self.mqtt_port = port;
        self
    }

    /// Set the base topic prefix.
    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = fixed_string(topic);
        self
    }

    /// Set the remote controller topic (selects the remote backend).
    pub fn with_remote_topic(mut self, topic: &str) -> Self {
        self.remote_topic = fixed_string(topic);
        self
    }

    /// Set the report channel.
    pub fn with_report_channel(mut self, channel: &str) -> Self {
        self.report_channel = fixed_string(channel);
        self
    }

    /// Set WiFi credentials.
    pub fn with_wifi(mut self, ssid: &str, password: &str) -> Self {
        self.wifi_ssid = fixed_string(ssid);
        self.wifi_password = fixed_string(password);
        self
    }

    /// Build a topic under the base prefix.
    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.topic.as_str(), suffix)
    }

    /// True when this controller forwards to a remote controller.
    pub fn is_remote(&self) -> bool {
        !self.remote_topic.is_empty()
    }

    /// True when a report channel is configured.
    pub fn has_report_channel(&self) -> bool {
        !self.report_channel.is_empty()
    }

    /// Persistent broker client id derived from the hardware unique id.
    pub fn device_id(&self, unique_id: u64) -> String {
        format!("luxbus_{:x}", unique_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_building() {
        let fixed = FixedConfig::default().with_topic("house/lights");
        assert_eq!(fixed.topic("preset/evening"), "house/lights/preset/evening");
    }

    #[test]
    fn backend_selection() {
        let local = FixedConfig::default();
        assert!(!local.is_remote());

        let remote = FixedConfig::default().with_remote_topic("house/lights2");
        assert!(remote.is_remote());
    }

    #[test]
    fn device_id_format() {
        let fixed = FixedConfig::default();
        assert_eq!(fixed.device_id(0xABCD), "luxbus_abcd");
    }

    #[test]
    fn truncation_keeps_utf8_valid() {
        let long = "x".repeat(100);
        let fixed = FixedConfig::default().with_topic(&long);
        assert!(fixed.topic.len() <= MAX_FIXED_STRING);
    }
}
