use serde::{Deserialize, Serialize};

use crate::types::DeviceType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub device_version: String,
    pub http_port: u16,
    pub udp_port: u16,
    pub multicast_group: [u8; 4],
    pub event_port: u16,
    pub send_retries: u32,
    pub send_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub supported_properties: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device_version: "1.0.0".to_string(),
            http_port: 8898,
            udp_port: 8898,
            multicast_group: [239, 255, 255, 250],
            event_port: 4030,
            send_retries: 3,
            send_timeout_ms: 2_000,
            tick_interval_ms: 10,
            supported_properties: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn sanitize(&mut self) {
        if self.device_version.trim().is_empty() {
            self.device_version = Self::default().device_version;
        }
        if self.http_port == 0 {
            self.http_port = 8898;
        }
        if self.udp_port == 0 {
            self.udp_port = 8898;
        }
        if self.event_port == 0 {
            self.event_port = 4030;
        }
        self.send_retries = self.send_retries.min(10);
        self.send_timeout_ms = self.send_timeout_ms.clamp(250, 60_000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 1_000);
        self.supported_properties.retain(|key| !key.trim().is_empty());
        self.supported_properties.dedup();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Sensor,
    Relay,
    Dimmer,
    Tracker,
    Reporter,
}

impl DeviceKind {
    pub fn device_type(self) -> DeviceType {
        match self {
            Self::Sensor => DeviceType::MppSensor,
            Self::Relay => DeviceType::MppSwitch,
            Self::Dimmer => DeviceType::MppLevel,
            Self::Tracker => DeviceType::MppTracker,
            Self::Reporter => DeviceType::MppReporter,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Relay => "relay",
            Self::Dimmer => "dimmer",
            Self::Tracker => "tracker",
            Self::Reporter => "reporter",
        }
    }

    fn uses_pin(self) -> bool {
        matches!(self, Self::Sensor | Self::Relay | Self::Dimmer)
    }
}

const MAX_GPIO: u8 = 39;
const MAX_PULSE_MS: u64 = 86_400_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub udn: Option<String>,
    pub pin: Option<u8>,
    pub invert: bool,
    pub pullup: bool,
    /// Active level for long press detection on sensors.
    pub long_press: Option<bool>,
    pub follower_pin: Option<u8>,
    pub follower_invert: bool,
    pub pulse_ms: u64,
    pub base_state: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Relay,
            udn: None,
            pin: None,
            invert: false,
            pullup: false,
            long_press: None,
            follower_pin: None,
            follower_invert: false,
            pulse_ms: 0,
            base_state: false,
        }
    }
}

impl DeviceConfig {
    pub fn new(kind: DeviceKind, pin: Option<u8>) -> Self {
        Self {
            kind,
            pin,
            ..Self::default()
        }
    }

    pub fn sanitize(&mut self) {
        self.udn = self
            .udn
            .take()
            .map(|udn| udn.trim().to_string())
            .filter(|udn| !udn.is_empty());

        if !self.kind.uses_pin() {
            self.pin = None;
        }
        self.pin = self.pin.filter(|pin| *pin <= MAX_GPIO);
        self.follower_pin = self
            .follower_pin
            .filter(|pin| *pin <= MAX_GPIO && Some(*pin) != self.pin);

        if self.kind != DeviceKind::Sensor {
            self.long_press = None;
            self.pullup = false;
        }
        if self.kind != DeviceKind::Relay {
            self.pulse_ms = 0;
            self.base_state = false;
        }
        self.pulse_ms = self.pulse_ms.min(MAX_PULSE_MS);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mac: Option<String>,
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mac: None,
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            use_static_ip: false,
            static_ip: None,
            gateway: None,
            subnet: None,
            dns: None,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.mac = self
            .mac
            .take()
            .map(|mac| mac.trim().to_string())
            .filter(|mac| !mac.is_empty());
        if self.use_static_ip && (self.static_ip.is_none() || self.gateway.is_none()) {
            self.use_static_ip = false;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub devices: Vec<DeviceConfig>,
    pub network: NetworkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            devices: vec![
                DeviceConfig {
                    long_press: Some(false),
                    pullup: true,
                    ..DeviceConfig::new(DeviceKind::Sensor, Some(0))
                },
                DeviceConfig {
                    follower_pin: Some(2),
                    ..DeviceConfig::new(DeviceKind::Relay, Some(12))
                },
            ],
            network: NetworkConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.server.sanitize();
        self.network.sanitize();
        for device in &mut self.devices {
            device.sanitize();
        }
    }
}
