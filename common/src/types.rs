use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    MppSensor,
    MppSwitch,
    MppMomentary,
    MppAnalog,
    MppLevel,
    MppTracker,
    MppPower,
    MppSleeper,
    MppAlert,
    MppReporter,
    MppGateway,
    MppColor,
    MppContact,
    MppSetup,
}

impl DeviceType {
    pub const ALL: [DeviceType; 14] = [
        Self::MppSensor,
        Self::MppSwitch,
        Self::MppMomentary,
        Self::MppAnalog,
        Self::MppLevel,
        Self::MppTracker,
        Self::MppPower,
        Self::MppSleeper,
        Self::MppAlert,
        Self::MppReporter,
        Self::MppGateway,
        Self::MppColor,
        Self::MppContact,
        Self::MppSetup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MppSensor => "MppSensor",
            Self::MppSwitch => "MppSwitch",
            Self::MppMomentary => "MppMomentary",
            Self::MppAnalog => "MppAnalog",
            Self::MppLevel => "MppLevel",
            Self::MppTracker => "MppTracker",
            Self::MppPower => "MppPower",
            Self::MppSleeper => "MppSleeper",
            Self::MppAlert => "MppAlert",
            Self::MppReporter => "MppReporter",
            Self::MppGateway => "MppGateway",
            Self::MppColor => "MppColor",
            Self::MppContact => "MppContact",
            Self::MppSetup => "MppSetup",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn is_battery_powered(self) -> bool {
        matches!(
            self,
            Self::MppReporter | Self::MppAlert | Self::MppContact | Self::MppSleeper
        )
    }
}

/// True when the type prefix of `udn` names a battery powered device.
pub fn is_battery_device(udn: &str) -> bool {
    match udn.split_once('_') {
        Some((prefix, _)) if !prefix.is_empty() => {
            DeviceType::from_name(prefix).is_some_and(DeviceType::is_battery_powered)
        }
        _ => false,
    }
}

/// Node identifier derived from a hardware address: lower case, separators removed.
pub fn node_uid(mac: &str) -> String {
    mac.chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn default_udn(device_type: DeviceType, uid: &str) -> String {
    format!("{}_{uid}", device_type.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    On,
    Off,
    Standby,
    Unknown,
}

impl SwitchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Standby => "standby",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "on" => Self::On,
            "off" => Self::Off,
            "standby" => Self::Standby,
            _ => Self::Unknown,
        }
    }
}
