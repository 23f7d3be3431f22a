pub const ATTR_STATE: &str = "state";
pub const ATTR_LONG_PRESS: &str = "lpress";
pub const ATTR_VALUE: &str = "value";
pub const ATTR_FIRMWARE: &str = "firmware";
pub const ATTR_MESSAGE: &str = "message";
pub const ATTR_UDN: &str = "udn";
pub const ATTR_NAME: &str = "name";
pub const ATTR_GROUP: &str = "group";
pub const ATTR_LOCATION: &str = "location";
pub const ATTR_MAC: &str = "mac";

pub const PROP_NICKNAME: &str = "Nickname";
pub const PROP_NETWORK_RESTART: &str = "NetworkRestart";
pub const PROP_NO_MULTICAST: &str = "NoMulticast";
pub const PROP_IP: &str = "ip";
pub const PROP_GATEWAY: &str = "gw";
pub const PROP_NETMASK: &str = "nm";
pub const PROP_SSID: &str = "ssid";
pub const PROP_UID: &str = "uid";
pub const PROP_VERSION: &str = "Version";
pub const PROP_DEVICE_VERSION: &str = "MppVersion";
pub const PROP_PASSWORD: &str = "Password";
pub const PROP_GATEWAY_PASSWORD: &str = "GatewayPassword";
pub const PROP_IP_CHECK: &str = "IpCheck";
pub const PROP_IP_ADDRESS: &str = "IpAddress";
pub const PROP_IP_PORT: &str = "IpPort";
pub const PROP_SERVER_IP: &str = "ServerIp";

/// Keys every node lists under `/defaults`, set or not.
pub const MANAGED_PROPERTIES: &[&str] = &[
    PROP_NICKNAME,
    PROP_NETWORK_RESTART,
    PROP_NO_MULTICAST,
    PROP_IP,
    PROP_GATEWAY,
    PROP_NETMASK,
    PROP_PASSWORD,
];

pub const PASSWORD_MASK: &str = "********";

/// Property key holding the friendly name of the device `udn`.
pub fn device_name_key(udn: &str) -> String {
    format!("Name{udn}")
}
