use std::net::Ipv4Addr;

use serde::Serialize;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_PORT: u16 = 8898;

pub const DISCOVER_TOKEN: &str = "discover";

/// Only this much of an incoming datagram is looked at.
pub const MAX_DISCOVERY_REQUEST: usize = 15;

pub fn is_discovery_request(payload: &[u8]) -> bool {
    let len = payload.len().min(MAX_DISCOVERY_REQUEST);
    payload[..len].starts_with(DISCOVER_TOKEN.as_bytes())
}

/// Joins already serialized device objects into a JSON array.
pub fn discovery_array<I>(states: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut result = String::from("[");
    for state in states {
        if result.len() > 1 {
            result.push(',');
        }
        result.push_str(&state);
    }
    result.push(']');
    result
}

#[derive(Debug, Serialize)]
struct SurveyEntry<'a> {
    ssid: &'a str,
    bssid: &'a str,
    channel: u8,
    rssi: i32,
    auth: u8,
}

/// Network survey of a wired node: one fixed entry naming the interface.
pub fn survey_json(mac: &str) -> String {
    let entry = SurveyEntry {
        ssid: "Ethernet",
        bssid: mac,
        channel: 0,
        rssi: 0,
        auth: 0,
    };
    serde_json::to_string(&[entry]).unwrap_or_else(|_| String::from("[]"))
}

pub fn broadcast_payload(message: &str) -> String {
    format!("OUT: {message}")
}

pub fn event_payload(event: &str) -> String {
    format!("notify {event}")
}
