use std::{
    cell::RefCell,
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
};

use log::{debug, info, warn};

use crate::{
    attributes::AttributeStore,
    behaviors::{Relay, DEFAULT_IP_CHECK_PULSE_MS},
    config::ServerConfig,
    device::Device,
    discovery::{broadcast_payload, discovery_array, event_payload, is_discovery_request, survey_json},
    dispatch::{Request, Response, Route},
    http::{describe_result, HttpClientEngine, HttpClientError, HttpRequest, Method},
    ip_check::{IpCheck, IpCheckOutcome, IpCheckSettings},
    keys::{
        device_name_key, ATTR_FIRMWARE, ATTR_NAME, ATTR_STATE, ATTR_VALUE, PROP_DEVICE_VERSION,
        PROP_GATEWAY, PROP_IP, PROP_IP_ADDRESS, PROP_IP_CHECK, PROP_IP_PORT, PROP_NETMASK,
        PROP_NETWORK_RESTART, PROP_NICKNAME, PROP_NO_MULTICAST, PROP_SERVER_IP, PROP_SSID,
        PROP_UID, PROP_VERSION,
    },
    net::{DatagramSocket, Transport},
    properties::{Properties, PropertiesError, StoreError},
    subscriptions::{SubscriptionRegistry, DEFAULT_NOTIFY_PORT},
    types::{default_udn, node_uid},
};

/// Framework name and version reported next to the device version.
pub const FRAMEWORK: &str = concat!("MppRust ", env!("CARGO_PKG_VERSION"));

/// Added to the timeout of every retried request.
pub const RETRY_BACKOFF_MS: u64 = 250;

const MAX_DATAGRAMS_PER_TICK: usize = 8;
const DATAGRAM_BUFFER: usize = 64;

/// Addresses assigned to the node when its link came up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ip: IpAddr,
    pub gateway: IpAddr,
    pub netmask: IpAddr,
    pub ssid: String,
}

/// How an outbound HTTP report ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Rejected(u16),
    Failed(HttpClientError),
}

impl Delivery {
    pub fn is_delivered(self) -> bool {
        self == Self::Delivered
    }
}

/// One node: its devices, their subscribers and everything the node sends or answers.
///
/// Nothing here blocks. The runtime forwards inbound requests to [`Server::handle_request`]
/// and calls [`Server::tick`] from its loop with the sockets the tick may use.
pub struct Server {
    config: ServerConfig,
    properties: Properties,
    devices: Vec<Device>,
    subscriptions: SubscriptionRegistry,
    http: HttpClientEngine,
    outbound: VecDeque<(SocketAddr, String)>,
    uid: String,
    mac: String,
    network: Option<NetworkInfo>,
    disconnected_since: u64,
    restart_requested: bool,
    ip_check: IpCheck,
    undelivered_events: Rc<RefCell<Vec<(IpAddr, String)>>>,
}

impl Server {
    pub fn new(config: ServerConfig, mac: &str, mut properties: Properties) -> Self {
        let uid = node_uid(mac);
        for key in &config.supported_properties {
            properties.declare(key);
        }
        properties.note(PROP_UID, &uid);
        properties.note(PROP_VERSION, FRAMEWORK);
        properties.note(PROP_DEVICE_VERSION, &config.device_version);
        info!("Node {uid} ({FRAMEWORK} / {})", config.device_version);

        Self {
            config,
            properties,
            devices: Vec::new(),
            subscriptions: SubscriptionRegistry::new(),
            http: HttpClientEngine::new(),
            outbound: VecDeque::new(),
            uid,
            mac: mac.to_string(),
            network: None,
            disconnected_since: 0,
            restart_requested: false,
            ip_check: IpCheck::new(),
            undelivered_events: Rc::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn http_mut(&mut self) -> &mut HttpClientEngine {
        &mut self.http
    }

    /// Registers and starts a device. Without `udn` it becomes `{type}_{uid}`.
    /// Returns the udn the device answers to.
    pub fn manage_device(&mut self, mut device: Device, udn: Option<&str>, now_ms: u64) -> String {
        let udn = match udn.filter(|udn| !udn.is_empty()) {
            Some(udn) => udn.to_string(),
            None => default_udn(device.core().device_type(), &self.uid),
        };
        if self.devices.iter().any(|existing| existing.udn() == udn) {
            warn!("Device {udn} is already managed, the new one will not be reachable");
        }

        let name = self.properties.get(&device_name_key(&udn)).map(str::to_string);
        device.set_location(self.location());
        device.begin(&udn, name.as_deref(), &self.uid, &self.mac, now_ms);
        device.set_attribute(
            ATTR_FIRMWARE,
            &format!("{FRAMEWORK}/{}", self.config.device_version),
        );
        info!("Managing {udn}");
        self.devices.push(device);
        udn
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, udn: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.udn() == udn)
    }

    pub fn device_mut(&mut self, udn: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|device| device.udn() == udn)
    }

    pub fn is_connected(&self) -> bool {
        self.network.is_some()
    }

    pub fn network(&self) -> Option<&NetworkInfo> {
        self.network.as_ref()
    }

    /// The link came up: records the addresses, gives every device its location and announces
    /// the node.
    pub fn network_up(&mut self, info: NetworkInfo) {
        info!("Network up: ip={} gw={} nm={}", info.ip, info.gateway, info.netmask);
        self.properties.note(PROP_IP, &info.ip.to_string());
        self.properties.note(PROP_GATEWAY, &info.gateway.to_string());
        self.properties.note(PROP_NETMASK, &info.netmask.to_string());
        self.properties.note(PROP_SSID, &info.ssid);
        self.network = Some(info);

        let location = self.location();
        for device in &mut self.devices {
            device.set_location(location.clone());
        }
        self.start();
    }

    pub fn network_down(&mut self, now_ms: u64) {
        if self.network.take().is_some() {
            warn!("Network down");
        }
        self.disconnected_since = now_ms;
        for device in &mut self.devices {
            device.set_location(None);
        }
    }

    /// Announces the node on the multicast group.
    pub fn start(&mut self) {
        let ssid = self
            .network
            .as_ref()
            .map_or("Ethernet", |network| network.ssid.as_str());
        let message = format!(
            "{} {}/{FRAMEWORK} on {ssid} rssi=0",
            self.name(),
            self.config.device_version
        );
        self.broadcast_message(&message);
        if !self.properties.is(PROP_NO_MULTICAST) {
            self.broadcast_discovery();
        }
    }

    /// `Nickname(uid)`, or the uid alone.
    pub fn name(&self) -> String {
        match self.properties.get(PROP_NICKNAME) {
            Some(nickname) => format!("{nickname}({})", self.uid),
            None => self.uid.clone(),
        }
    }

    pub fn version(&self) -> String {
        format!("{FRAMEWORK} / {}", self.config.device_version)
    }

    pub fn discovery_json(&mut self) -> String {
        discovery_array(self.devices.iter_mut().map(Device::serialize_state))
    }

    pub fn subscribe(&mut self, address: IpAddr, port: u16, now_ms: u64) {
        self.subscriptions.subscribe(address, port, now_ms);
    }

    pub fn broadcast_message(&mut self, message: &str) {
        let target = self.multicast_target();
        self.outbound.push_back((target, broadcast_payload(message)));
    }

    pub fn broadcast_discovery(&mut self) {
        let target = self.multicast_target();
        let payload = self.discovery_json();
        self.outbound.push_back((target, payload));
    }

    /// Queues `notify {event}` for `ip` on the notify port.
    pub fn send_udp_event(&mut self, ip: IpAddr, event: &str) {
        info!("Notifying {ip} with {event}");
        self.outbound
            .push_back((SocketAddr::new(ip, DEFAULT_NOTIFY_PORT), event_payload(event)));
    }

    /// Sends a request and reports the outcome once. Transport failures are retried up to
    /// `retry` times, each attempt waiting [`RETRY_BACKOFF_MS`] longer than the last.
    pub fn send_http<F>(
        &mut self,
        url: &str,
        method: Method,
        body: &str,
        retry: u32,
        timeout_ms: u64,
        report: F,
    ) where
        F: FnOnce(Delivery) + 'static,
    {
        info!("sendHttp {} {url}", method.as_str());
        if !self.is_connected() {
            warn!("Cannot send to {url}: no network");
            report(Delivery::Failed(HttpClientError::NotConnected));
            return;
        }
        let request = match HttpRequest::from_url(method, url) {
            Ok(request) => request.with_body(body).with_timeout(timeout_ms),
            Err(err) => {
                warn!("Cannot send to '{url}': {err}");
                report(Delivery::Failed(HttpClientError::NoBegin));
                return;
            }
        };
        send_with_retry(&mut self.http, request, retry, Box::new(report));
    }

    /// `PUT http://{ip}:{event_port}/events/{event}` with an empty body.
    pub fn send_http_event<F>(&mut self, ip: IpAddr, event: &str, retry: u32, timeout_ms: u64, report: F)
    where
        F: FnOnce(Delivery) + 'static,
    {
        let url = format!("http://{ip}:{}/events/{event}", self.config.event_port);
        self.send_http(&url, Method::Put, "", retry, timeout_ms, report);
    }

    pub fn request_restart(&mut self) {
        info!("Restart requested");
        self.restart_requested = true;
    }

    /// True once after a restart was requested.
    pub fn take_restart_request(&mut self) -> bool {
        std::mem::take(&mut self.restart_requested)
    }

    pub fn handle_request(&mut self, request: &Request, now_ms: u64) -> Response {
        debug!(
            "Handling {} {} from {:?}",
            request.method.as_str(),
            request.path,
            request.remote
        );
        match Route::resolve(request.method, &request.path) {
            Route::Discovery => Response::json(self.discovery_json()),
            Route::MissingAction => Response::status(400),
            Route::State(udn) => match self.device_mut(udn) {
                Some(device) => Response::json(device.serialize_state()),
                None => Response::status(404),
            },
            Route::Name(udn) => self.rename(udn, request),
            Route::Subscribe => self.handle_subscribe(request, now_ms),
            Route::Restart => {
                self.request_restart();
                Response::status(200)
            }
            Route::Defaults => self.handle_defaults(request),
            Route::Survey => Response::json(survey_json(&self.mac)),
            Route::Version => Response::text(200, self.version()),
            Route::Setup => self.handle_setup(request),
            Route::DeviceAction { action, udn } => match self.device_mut(udn) {
                Some(device) => {
                    let handled = device.handle_action(action, &request.params, now_ms);
                    Response::status(if handled { 200 } else { 400 })
                }
                None => {
                    debug!("No device {udn} for {action}");
                    Response::status(404)
                }
            },
        }
    }

    /// Answers a discovery request from `from`. Other datagrams are ignored.
    pub fn handle_datagram(&mut self, payload: &[u8], from: SocketAddr) {
        if !is_discovery_request(payload) {
            return;
        }
        info!("Responding to discovery request from {from}");
        let reply = self.discovery_json();
        self.outbound.push_back((from, reply));
    }

    /// One pass of the main loop.
    pub fn tick(&mut self, now_ms: u64, transport: &mut Transport<'_>) {
        self.watch_network(now_ms);
        self.receive_datagrams(transport.datagrams);

        let event_target = self.event_target();
        let mut events = Vec::new();
        for device in &mut self.devices {
            device.tick(now_ms);
            let notifications = device.take_notifications();
            if notifications.is_empty() {
                continue;
            }
            if self.network.is_none() {
                debug!(
                    "Dropping {} notification(s) from {} while offline",
                    notifications.len(),
                    device.udn()
                );
                continue;
            }
            for payload in &notifications {
                self.subscriptions.notify(payload, now_ms, transport.datagrams);
            }
            if event_target.is_some() {
                events.extend(state_event(device));
            }
        }
        if let Some(ip) = event_target {
            for event in events {
                self.report_event(ip, event);
            }
        }

        let settings = if self.is_connected() {
            IpCheckSettings::new(
                self.properties.get_unsigned(PROP_IP_CHECK),
                self.properties.get(PROP_IP_ADDRESS),
                u16::try_from(self.properties.get_unsigned(PROP_IP_PORT)).unwrap_or(0),
            )
        } else {
            None
        };
        if settings.is_some() || self.ip_check.is_probing() {
            if let Some(IpCheckOutcome::Unreachable) =
                self.ip_check.poll(now_ms, settings, transport.connector)
            {
                self.power_cycle_relay(now_ms);
            }
        }

        self.http.tick(now_ms, transport.connector);
        let undelivered = std::mem::take(&mut *self.undelivered_events.borrow_mut());
        for (ip, event) in undelivered {
            self.send_udp_event(ip, &event);
        }
        self.flush_outbound(transport.datagrams);
    }

    /// Where state changes are reported, from the `ServerIp` property.
    fn event_target(&self) -> Option<IpAddr> {
        let text = self.properties.get(PROP_SERVER_IP)?;
        match text.trim().parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                debug!("Ignoring unparsable {PROP_SERVER_IP} '{text}'");
                None
            }
        }
    }

    /// Sends `event` over HTTP; a failed delivery goes out as a UDP notify on the next tick.
    fn report_event(&mut self, ip: IpAddr, event: String) {
        let undelivered = Rc::clone(&self.undelivered_events);
        let (retry, timeout_ms) = (self.config.send_retries, self.config.send_timeout_ms);
        let name = event.clone();
        self.send_http_event(ip, &event, retry, timeout_ms, move |delivery| match delivery {
            Delivery::Delivered => {}
            Delivery::Rejected(status) => warn!("Event {name} rejected by {ip} with {status}"),
            Delivery::Failed(err) => {
                warn!("Event {name} to {ip} failed ({err}), falling back to UDP");
                undelivered.borrow_mut().push((ip, name));
            }
        });
    }

    fn watch_network(&mut self, now_ms: u64) {
        if self.network.is_some() || self.restart_requested {
            return;
        }
        let minutes = self.properties.get_unsigned(PROP_NETWORK_RESTART);
        if minutes > 0 && now_ms.saturating_sub(self.disconnected_since) > minutes * 60_000 {
            warn!("No network for {minutes} minute(s), requesting restart");
            self.restart_requested = true;
        }
    }

    fn receive_datagrams(&mut self, socket: &mut dyn DatagramSocket) {
        let mut buf = [0u8; DATAGRAM_BUFFER];
        for _ in 0..MAX_DATAGRAMS_PER_TICK {
            match socket.recv_from(&mut buf) {
                Ok(Some((len, from))) => self.handle_datagram(&buf[..len], from),
                Ok(None) => break,
                Err(err) => {
                    warn!("Datagram receive failed: {err}");
                    break;
                }
            }
        }
    }

    fn flush_outbound(&mut self, socket: &mut dyn DatagramSocket) {
        while let Some((target, payload)) = self.outbound.pop_front() {
            match socket.send_to(payload.as_bytes(), target) {
                Ok(sent) => debug!("Sent {sent} bytes to {target}"),
                Err(err) => warn!("Datagram to {target} failed: {err}"),
            }
        }
    }

    fn power_cycle_relay(&mut self, now_ms: u64) {
        for device in &mut self.devices {
            if let Some((relay, core)) = device.behavior_mut::<Relay>() {
                let pulse = match relay.pulse_ms() {
                    0 => DEFAULT_IP_CHECK_PULSE_MS,
                    pulse => pulse,
                };
                warn!("IP check failed, switching {} off for {pulse}ms", core.udn());
                relay.set_relay(core, false, pulse, now_ms);
                return;
            }
        }
    }

    fn rename(&mut self, udn: &str, request: &Request) -> Response {
        let Some(device) = self.devices.iter_mut().find(|device| device.udn() == udn) else {
            return Response::status(404);
        };
        let from_body = AttributeStore::parse(&request.body).ok();
        let name = request
            .params
            .get("name")
            .or_else(|| from_body.as_ref().and_then(|body| body.get("name")))
            .unwrap_or_default();

        let key = device_name_key(udn);
        let saved = if name.is_empty() {
            device.publish(ATTR_NAME, udn);
            self.properties.remove(&key)
        } else {
            device.publish(ATTR_NAME, name);
            self.properties.put(&key, name)
        };
        match saved {
            Ok(_) => Response::status(200),
            Err(err) => {
                warn!("Name of {udn} not saved: {err}");
                store_failure(&err)
            }
        }
    }

    fn handle_subscribe(&mut self, request: &Request, now_ms: u64) -> Response {
        let body = request.body.trim();
        let target = if body.is_empty() {
            request.remote.map(|ip| (ip, DEFAULT_NOTIFY_PORT))
        } else {
            parse_subscriber(body)
        };
        match target {
            Some((ip, port)) => {
                self.subscriptions.subscribe(ip, port, now_ms);
                Response::status(200)
            }
            None => {
                warn!("Cannot subscribe '{body}'");
                Response::status(400)
            }
        }
    }

    fn handle_defaults(&mut self, request: &Request) -> Response {
        match request.method {
            Method::Get => Response::json(self.properties.masked_json()),
            Method::Put => {
                if !self.properties.authorize(request.authorization.as_deref()) {
                    return Response::unauthorized();
                }
                match self.properties.update_from(&request.body) {
                    Ok(()) => Response::json(self.properties.masked_json()),
                    Err(err) => properties_failure(&err),
                }
            }
            _ => Response::status(501),
        }
    }

    fn handle_setup(&mut self, request: &Request) -> Response {
        if !matches!(request.method, Method::Put | Method::Post) {
            return Response::status(501);
        }
        if !self.properties.authorize(request.authorization.as_deref()) {
            return Response::unauthorized();
        }
        if request.body.trim().is_empty() {
            return Response::status(400);
        }
        match self.properties.replace_from(&request.body) {
            Ok(()) => {
                info!("Properties replaced");
                Response::status(200)
            }
            Err(err) => {
                warn!("Properties not replaced: {err}");
                properties_failure(&err)
            }
        }
    }

    fn location(&self) -> Option<String> {
        self.network
            .as_ref()
            .map(|network| format!("http://{}:{}", network.ip, self.config.http_port))
    }

    fn multicast_target(&self) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::from(self.config.multicast_group)),
            self.config.udp_port,
        )
    }
}

type DeliveryReport = Box<dyn FnOnce(Delivery)>;

/// Each retry is queued from the completion callback and starts on the next tick.
fn send_with_retry(engine: &mut HttpClientEngine, request: HttpRequest, retry: u32, report: DeliveryReport) {
    let again = request.clone();
    engine.send(request, move |engine, done| match done.result {
        Ok(200) => report(Delivery::Delivered),
        Ok(status) => {
            warn!("sendHttp to {} rejected with {status}", again.target.host);
            report(Delivery::Rejected(status));
        }
        Err(err) if err.is_transport() && retry > 0 => {
            warn!(
                "sendHttp to {} failed with {}, retries left {retry}",
                again.target.host,
                describe_result(done.result)
            );
            let timeout = again.timeout_ms + RETRY_BACKOFF_MS;
            send_with_retry(engine, again.with_timeout(timeout), retry - 1, report);
        }
        Err(err) => {
            warn!(
                "sendHttp to {} failed with {}",
                again.target.host,
                describe_result(done.result)
            );
            report(Delivery::Failed(err));
        }
    });
}

/// `ip`, `ip:port` or `[v6]:port`. A missing or zero port means the notify port.
fn parse_subscriber(text: &str) -> Option<(IpAddr, u16)> {
    if let Ok(address) = text.parse::<SocketAddr>() {
        return Some((address.ip(), address.port()));
    }
    if let Ok(ip) = text.parse::<IpAddr>() {
        return Some((ip, DEFAULT_NOTIFY_PORT));
    }
    let (ip, port) = text.split_once(':')?;
    let ip = ip.trim().parse().ok()?;
    Some((ip, port.trim().parse().unwrap_or(0)))
}

/// `{udn}/state/{state}`, or `{udn}/value/{value}` for devices without a state.
fn state_event(device: &Device) -> Option<String> {
    [ATTR_STATE, ATTR_VALUE].into_iter().find_map(|key| {
        device
            .get(key)
            .map(|value| format!("{}/{key}/{value}", device.udn()))
    })
}

fn store_failure(err: &StoreError) -> Response {
    match err {
        StoreError::CapacityExceeded { .. } => Response::status(413),
        StoreError::Backend(_) => Response::status(500),
    }
}

fn properties_failure(err: &PropertiesError) -> Response {
    match err {
        PropertiesError::Parse(parse) => Response::text(400, parse.to_string()),
        PropertiesError::Store(store) => store_failure(store),
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use base64::{engine::general_purpose::STANDARD, Engine as _};

    use super::*;
    use crate::{
        behaviors::Relay,
        keys::{ATTR_STATE, PROP_PASSWORD},
        testing::{MemoryStore, MockConnection, MockConnector, MockSocket, SharedOutput},
        types::DeviceType,
    };
    use pretty_assertions::assert_eq;

    const MAC: &str = "AB:12:CD:34:EF:56";
    const RELAY: &str = "MppSwitch_ab12cd34ef56";
    const MINUTE: u64 = 60_000;

    fn network() -> NetworkInfo {
        NetworkInfo {
            ip: "10.0.0.9".parse().unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            ssid: "Ethernet".to_string(),
        }
    }

    fn server_with(store: &MemoryStore) -> Server {
        let mut properties = Properties::new(Box::new(store.clone()));
        properties.load().unwrap();
        Server::new(ServerConfig::default(), MAC, properties)
    }

    fn relay_server(store: &MemoryStore, pin: &SharedOutput) -> Server {
        let mut server = server_with(store);
        let relay = Device::new(DeviceType::MppSwitch, Relay::new(pin.clone(), 0, false));
        server.manage_device(relay, None, 0);
        server
    }

    fn tick(server: &mut Server, now: u64, socket: &mut MockSocket, connector: &mut MockConnector) {
        let mut transport = Transport {
            datagrams: socket,
            connector,
        };
        server.tick(now, &mut transport);
    }

    fn put(path: &str) -> Request {
        Request::new(Method::Put, path)
    }

    fn get(path: &str) -> Request {
        Request::new(Method::Get, path)
    }

    #[test]
    fn managed_devices_get_identity_and_firmware() {
        let server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        let relay = server.device(RELAY).unwrap();
        assert_eq!(relay.get("group"), Some("ab12cd34ef56"));
        assert_eq!(relay.get("name"), Some(RELAY));
        assert_eq!(
            relay.get(ATTR_FIRMWARE),
            Some(format!("{FRAMEWORK}/1.0.0").as_str())
        );
        assert_eq!(server.properties().get(PROP_UID), Some("ab12cd34ef56"));
    }

    #[test]
    fn stored_name_is_applied_on_manage() {
        let store = MemoryStore::new(Some(&format!(r#"{{"Name{RELAY}":"Pump"}}"#)));
        let server = relay_server(&store, &SharedOutput::new());
        assert_eq!(server.device(RELAY).unwrap().get("name"), Some("Pump"));
    }

    #[test]
    fn state_of_known_and_unknown_devices() {
        let mut server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        let response = server.handle_request(&get(&format!("/state/{RELAY}")), 0);
        assert_eq!(response.status, 200);
        assert!(response.body.starts_with(&format!(r#"{{"udn":"{RELAY}""#)));

        let missing = server.handle_request(&get("/state/Relay_ab12"), 0);
        assert_eq!(missing.status, 404);
    }

    #[test]
    fn device_actions_are_delegated() {
        let pin = SharedOutput::new();
        let mut server = relay_server(&MemoryStore::default(), &pin);
        let on = put(&format!("/state/{RELAY}")).with_query("state=true");
        assert_eq!(server.handle_request(&on, 0).status, 200);
        assert!(pin.level());
        assert_eq!(server.device(RELAY).unwrap().get(ATTR_STATE), Some("on"));

        let unknown = put(&format!("/state/{RELAY}")).with_query("bogus=1");
        assert_eq!(server.handle_request(&unknown, 0).status, 400);
        assert_eq!(server.handle_request(&put("/state/MppSwitch_nope"), 0).status, 404);
        assert_eq!(server.handle_request(&get("//x"), 0).status, 400);
    }

    #[test]
    fn rename_persists_and_resets() {
        let store = MemoryStore::default();
        let mut server = relay_server(&store, &SharedOutput::new());
        let rename = put(&format!("/name/{RELAY}")).with_body(r#"{"name":"Pump"}"#);
        assert_eq!(server.handle_request(&rename, 0).status, 200);
        assert_eq!(server.device(RELAY).unwrap().get("name"), Some("Pump"));
        assert!(store.blob().unwrap().contains("Pump"));

        let reset = put(&format!("/name/{RELAY}")).with_query("name=");
        assert_eq!(server.handle_request(&reset, 0).status, 200);
        assert_eq!(server.device(RELAY).unwrap().get("name"), Some(RELAY));
        assert_eq!(store.blob().as_deref(), Some("{}"));
    }

    #[test]
    fn rename_that_does_not_fit_is_413() {
        let mut server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        let long = "n".repeat(1_100);
        let rename = put(&format!("/name/{RELAY}")).with_query(&format!("name={long}"));
        assert_eq!(server.handle_request(&rename, 0).status, 413);
    }

    #[test]
    fn subscribers_receive_changes_while_online() {
        let mut server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new();
        let remote: IpAddr = "10.0.0.20".parse().unwrap();

        let subscribe = put("/subscribe").from_remote(remote);
        assert_eq!(server.handle_request(&subscribe, 0).status, 200);
        assert_eq!(server.handle_request(&put("/subscribe").with_body("10.0.0.21:9000"), 0).status, 200);
        assert_eq!(server.handle_request(&put("/subscribe").with_body("nonsense"), 0).status, 400);
        assert_eq!(server.handle_request(&put("/subscribe"), 0).status, 400);

        let on = put(&format!("/state/{RELAY}")).with_query("state=true");
        server.handle_request(&on, 0);
        tick(&mut server, 10, &mut socket, &mut connector);
        assert!(socket.take_sent().is_empty());

        server.network_up(network());
        tick(&mut server, 20, &mut socket, &mut connector);
        socket.take_sent();

        let off = put(&format!("/state/{RELAY}")).with_query("state=false");
        server.handle_request(&off, 30);
        tick(&mut server, 40, &mut socket, &mut connector);
        let sent = socket.take_sent();
        let targets: Vec<SocketAddr> = sent.iter().map(|(target, _)| *target).collect();
        assert_eq!(
            targets,
            vec![
                SocketAddr::new(remote, DEFAULT_NOTIFY_PORT),
                "10.0.0.21:9000".parse().unwrap()
            ]
        );
        assert!(sent[0].1.contains(r#""state":"off""#));
        assert!(sent[0].1.contains(r#""location":"http://10.0.0.9:8898""#));
    }

    #[test]
    fn discovery_datagram_is_answered_to_the_sender() {
        let mut server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        server.manage_device(Device::passive(DeviceType::MppReporter), None, 0);
        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new();
        let from: SocketAddr = "10.0.0.30:5555".parse().unwrap();
        socket.receive("discover", from);
        socket.receive("hello", from);

        tick(&mut server, 0, &mut socket, &mut connector);
        let sent = socket.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, from);
        assert!(sent[0].1.starts_with(&format!(r#"[{{"udn":"{RELAY}""#)));
        assert!(sent[0].1.contains(r#"{"udn":"MppReporter_ab12cd34ef56""#));
        assert!(sent[0].1.ends_with("}]"));
        assert_eq!(server.handle_request(&get("/"), 0).body, sent[0].1);
    }

    #[test]
    fn start_announces_unless_multicast_is_off() {
        let mut server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new();
        server.network_up(network());
        tick(&mut server, 0, &mut socket, &mut connector);
        let sent = socket.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "239.255.255.250:8898".parse().unwrap());
        assert_eq!(
            sent[0].1,
            format!("OUT: ab12cd34ef56 1.0.0/{FRAMEWORK} on Ethernet rssi=0")
        );
        assert!(sent[1].1.starts_with('['));

        server.properties_mut().put(PROP_NICKNAME, "Barn").unwrap();
        server.properties_mut().put(PROP_NO_MULTICAST, "true").unwrap();
        server.start();
        tick(&mut server, 10, &mut socket, &mut connector);
        let sent = socket.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("OUT: Barn(ab12cd34ef56) "));
    }

    #[test]
    fn defaults_are_masked_and_writes_need_the_password() {
        let store = MemoryStore::new(Some(r#"{"Password":"secret"}"#));
        let mut server = relay_server(&store, &SharedOutput::new());

        let listing = server.handle_request(&get("/defaults"), 0);
        assert_eq!(listing.status, 200);
        assert!(listing.body.contains(r#""Password":"********""#));
        assert!(listing.body.contains(r#""uid":"ab12cd34ef56""#));

        let update = put("/defaults").with_body(r#"{"Nickname":"Barn"}"#);
        assert_eq!(server.handle_request(&update, 0).status, 401);

        let auth = format!("Basic {}", STANDARD.encode("admin:secret"));
        let update = update.with_authorization(&auth);
        assert_eq!(server.handle_request(&update, 0).status, 200);
        assert_eq!(server.properties().get(PROP_NICKNAME), Some("Barn"));
        assert_eq!(server.properties().get(PROP_PASSWORD), Some("secret"));

        let delete = Request::new(Method::Delete, "/defaults");
        assert_eq!(server.handle_request(&delete, 0).status, 501);
    }

    #[test]
    fn setup_replaces_properties() {
        let store = MemoryStore::default();
        let mut server = relay_server(&store, &SharedOutput::new());
        assert_eq!(server.handle_request(&put("/setup"), 0).status, 400);
        let bad = server.handle_request(&put("/setup").with_body(r#"{"a" "b"}"#), 0);
        assert_eq!(bad.status, 400);
        assert!(!bad.body.is_empty());

        let good = put("/setup").with_body(r#"{"IpCheck":"5"}"#);
        assert_eq!(server.handle_request(&good, 0).status, 200);
        assert_eq!(store.blob().as_deref(), Some(r#"{"IpCheck":"5"}"#));
    }

    #[test]
    fn version_survey_and_restart() {
        let mut server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        let version = server.handle_request(&get("/version"), 0);
        assert_eq!(version.body, format!("{FRAMEWORK} / 1.0.0"));
        assert_eq!(server.handle_request(&get("/check"), 0).body, version.body);

        let survey = server.handle_request(&get("/survey"), 0);
        assert!(survey.body.contains(MAC));

        assert!(!server.take_restart_request());
        assert_eq!(server.handle_request(&get("/restart"), 0).status, 200);
        assert!(server.take_restart_request());
        assert!(!server.take_restart_request());
    }

    #[test]
    fn event_to_unreachable_host_gives_up_after_retries() {
        let mut server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new();
        server.network_up(network());

        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        server.send_http_event("10.0.0.99".parse().unwrap(), "doorbell", 2, 500, move |delivery| {
            sink.borrow_mut().push(delivery);
        });

        let mut now = 0;
        while now < 10_000 {
            tick(&mut server, now, &mut socket, &mut connector);
            now += 10;
        }
        assert_eq!(
            *reports.borrow(),
            vec![Delivery::Failed(HttpClientError::ConnectTimeout)]
        );
        assert_eq!(
            connector.attempts(),
            vec![("10.0.0.99".to_string(), 4030); 3]
        );
    }

    #[test]
    fn event_delivery_and_rejection() {
        let mut server = relay_server(&MemoryStore::default(), &SharedOutput::new());
        let mut socket = MockSocket::new();
        let ok = MockConnection::new().reply(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let sent = ok.sent();
        let mut connector = MockConnector::new()
            .then(ok)
            .then(MockConnection::new().reply(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"));
        server.network_up(network());

        let reports = Rc::new(RefCell::new(Vec::new()));
        for event in ["ring", "missing"] {
            let sink = reports.clone();
            server.send_http_event("10.0.0.99".parse().unwrap(), event, 2, 500, move |delivery| {
                sink.borrow_mut().push(delivery);
            });
        }
        tick(&mut server, 0, &mut socket, &mut connector);
        assert_eq!(
            *reports.borrow(),
            vec![Delivery::Delivered, Delivery::Rejected(404)]
        );
        assert!(String::from_utf8_lossy(&sent.borrow()).starts_with("PUT /events/ring HTTP/1.1\r\n"));
        assert_eq!(connector.attempts().len(), 2);
    }

    #[test]
    fn sending_offline_or_to_a_bad_url_fails_at_once() {
        let mut server = server_with(&MemoryStore::default());
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        server.send_http("http://10.0.0.99/x", Method::Get, "", 2, 500, move |delivery| {
            sink.borrow_mut().push(delivery);
        });
        server.network_up(network());
        let sink = reports.clone();
        server.send_http("ftp://10.0.0.99/x", Method::Get, "", 2, 500, move |delivery| {
            sink.borrow_mut().push(delivery);
        });
        assert_eq!(
            *reports.borrow(),
            vec![
                Delivery::Failed(HttpClientError::NotConnected),
                Delivery::Failed(HttpClientError::NoBegin)
            ]
        );
    }

    #[test]
    fn udp_event_goes_to_the_notify_port() {
        let mut server = server_with(&MemoryStore::default());
        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new();
        server.send_udp_event("10.0.0.40".parse().unwrap(), "motion");
        tick(&mut server, 0, &mut socket, &mut connector);
        assert_eq!(
            socket.sent(),
            &[("10.0.0.40:8898".parse().unwrap(), "notify motion".to_string())]
        );
    }

    #[test]
    fn state_changes_are_reported_to_the_server_ip() {
        let store = MemoryStore::new(Some(r#"{"ServerIp":"10.0.0.50"}"#));
        let mut server = relay_server(&store, &SharedOutput::new());
        server.network_up(network());
        let ok = MockConnection::new().reply(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let sent = ok.sent();
        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new().then(ok);

        let on = put(&format!("/state/{RELAY}")).with_query("state=true");
        assert_eq!(server.handle_request(&on, 0).status, 200);
        tick(&mut server, 0, &mut socket, &mut connector);

        assert_eq!(
            connector.attempts(),
            vec![("10.0.0.50".to_string(), 4030)]
        );
        assert!(String::from_utf8_lossy(&sent.borrow())
            .starts_with(&format!("PUT /events/{RELAY}/state/on HTTP/1.1\r\n")));
    }

    #[test]
    fn undeliverable_state_event_falls_back_to_udp() {
        let store = MemoryStore::new(Some(r#"{"ServerIp":"10.0.0.50"}"#));
        let mut server = relay_server(&store, &SharedOutput::new());
        server.network_up(network());
        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new()
            .refuse()
            .refuse()
            .refuse()
            .refuse();

        let off = put(&format!("/state/{RELAY}")).with_query("state=false");
        server.handle_request(&put(&format!("/state/{RELAY}")).with_query("state=true"), 0);
        let mut now = 0;
        while now < 1_000 {
            tick(&mut server, now, &mut socket, &mut connector);
            now += 10;
        }
        assert_eq!(connector.attempts().len(), 4);
        let expected: (SocketAddr, String) = ("10.0.0.50:8898".parse().unwrap(), format!("notify {RELAY}/state/on"));
        assert!(socket.take_sent().contains(&expected));

        // An unparsable target disables reporting.
        server.properties_mut().put(PROP_SERVER_IP, "hub").unwrap();
        server.handle_request(&off, now);
        tick(&mut server, now, &mut socket, &mut connector);
        assert_eq!(connector.attempts().len(), 4);
    }

    #[test]
    fn long_outage_requests_a_restart() {
        let store = MemoryStore::new(Some(r#"{"NetworkRestart":"2"}"#));
        let mut server = server_with(&store);
        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new();

        tick(&mut server, 2 * MINUTE, &mut socket, &mut connector);
        assert!(!server.take_restart_request());
        tick(&mut server, 2 * MINUTE + 1, &mut socket, &mut connector);
        assert!(server.take_restart_request());

        server.network_up(network());
        tick(&mut server, 10 * MINUTE, &mut socket, &mut connector);
        assert!(!server.take_restart_request());
    }

    #[test]
    fn failed_ip_check_power_cycles_the_relay() {
        let store = MemoryStore::new(Some(r#"{"IpCheck":"1","IpAddress":"10.0.0.1"}"#));
        let pin = SharedOutput::new();
        let mut server = relay_server(&store, &pin);
        let on = put(&format!("/state/{RELAY}")).with_query("state=true");
        server.handle_request(&on, 0);
        server.network_up(network());

        let mut socket = MockSocket::new();
        let mut connector = MockConnector::new().refuse().refuse().refuse();
        let mut now = 0;
        while now <= MINUTE + 100 {
            tick(&mut server, now, &mut socket, &mut connector);
            now += 10;
        }
        assert_eq!(connector.attempts().len(), 3);
        assert!(!pin.level());

        while now <= MINUTE + 100 + DEFAULT_IP_CHECK_PULSE_MS {
            tick(&mut server, now, &mut socket, &mut connector);
            now += 10;
        }
        assert!(pin.level());
    }
}
