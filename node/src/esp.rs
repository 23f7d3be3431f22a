use core::convert::TryInto;
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{mpsc, Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use embedded_svc::{
    http::{Headers, Method as HttpMethod},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{AnyIOPin, AnyOutputPin, Input, InterruptType, Output, PinDriver, Pull},
        ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, LEDC},
        modem::Modem,
        prelude::Peripherals,
        units::FromValueType,
    },
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use mpp_common::{
    config::{NetworkConfig, NodeConfig},
    EdgeCounter, InputPin, Method, NetworkInfo, OutputPin, Properties, PropertyStore, PwmOutput,
    Request, Response, Server, StoreError, Transport,
};

use crate::{
    devices::{build_device, PinBank},
    net::{StdConnector, UdpEndpoint},
};

const NVS_NAMESPACE: &str = "mpp";
const NVS_CONFIG_KEY: &str = "node_json";
const NVS_PROPERTIES_KEY: &str = "props";
const NVS_BUFFER_BYTES: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const REPLY_TIMEOUT_MS: u64 = 5_000;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const DIMMER_FREQUENCY_KHZ: u32 = 5;

struct Inbound {
    request: Request,
    reply: mpsc::SyncSender<Response>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load node config from NVS: {err:#}");
        NodeConfig::default()
    });
    config.sanitize();
    info!(
        "NVS config loaded: ssid=`{}`, static_ip={}, {} device(s)",
        config.network.wifi_ssid,
        config.network.use_static_ip,
        config.devices.len()
    );

    let Peripherals { modem, ledc, .. } = Peripherals::take()?;
    let esp_wifi = connect_wifi(modem, sys_loop, nvs_partition.clone(), &config.network)
        .context("wifi startup failed")?;
    let mac = format_mac(&esp_wifi.sta_netif().get_mac()?);

    let properties_store = NvsPropertyStore {
        nvs: EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?,
    };
    let mut properties = Properties::new(Box::new(properties_store));
    if let Err(err) = properties.load() {
        warn!("failed to load properties, continuing with defaults: {err}");
    }

    let mut server = Server::new(config.server.clone(), &mac, properties);
    let mut pins = EspPins { ledc: Some(ledc) };
    for device_config in &config.devices {
        match build_device(device_config, &mut pins) {
            Ok(device) => {
                server.manage_device(device, device_config.udn.as_deref(), monotonic_ms());
            }
            Err(err) => warn!("skipping {} device: {err:#}", device_config.kind.as_str()),
        }
    }

    let group = Ipv4Addr::from(config.server.multicast_group);
    let mut datagrams = UdpEndpoint::bind(config.server.udp_port, group)?;
    let mut connector = StdConnector::new();

    let (requests, inbound) = mpsc::sync_channel(8);
    let _http = create_http_server(config.server.http_port, requests)?;

    let watchdog = Watchdog::arm(WATCHDOG_TIMEOUT_SEC)?;

    let tick = Duration::from_millis(config.server.tick_interval_ms);
    loop {
        watchdog.feed();
        let now_ms = monotonic_ms();

        match station_network(&esp_wifi, &config.network.wifi_ssid) {
            Some(network) if server.network() != Some(&network) => server.network_up(network),
            None if server.is_connected() => server.network_down(now_ms),
            _ => {}
        }

        while let Ok(Inbound { request, reply }) = inbound.try_recv() {
            let response = server.handle_request(&request, now_ms);
            if reply.send(response).is_err() {
                debug!(
                    "HTTP handler timed out before {} {} was answered",
                    request.method.as_str(),
                    request.path
                );
            }
        }

        let mut transport = Transport {
            datagrams: &mut datagrams,
            connector: &mut connector,
        };
        server.tick(now_ms, &mut transport);

        if server.take_restart_request() {
            warn!("restart requested, rebooting");
            thread::sleep(Duration::from_millis(200));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        thread::sleep(tick);
    }
}

fn create_http_server(
    port: u16,
    requests: mpsc::SyncSender<Inbound>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for (http_method, method) in [
        (HttpMethod::Get, Method::Get),
        (HttpMethod::Put, Method::Put),
        (HttpMethod::Post, Method::Post),
        (HttpMethod::Delete, Method::Delete),
    ] {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>("/*", http_method, move |mut req| {
            let uri = req.uri().to_string();
            let (path, query) = uri.split_once('?').unwrap_or((uri.as_str(), ""));
            let authorization = req.header("Authorization").map(str::to_string);
            let body = read_request_body(&mut req)?;

            let mut request = Request::new(method, path)
                .with_query(query)
                .with_body(String::from_utf8_lossy(&body).into_owned());
            if let Some(authorization) = authorization {
                request = request.with_authorization(&authorization);
            }

            let (reply, response) = mpsc::sync_channel(1);
            if requests.send(Inbound { request, reply }).is_err() {
                req.into_status_response(503)?;
                return Ok(());
            }
            let Ok(response) = response.recv_timeout(Duration::from_millis(REPLY_TIMEOUT_MS))
            else {
                req.into_status_response(503)?;
                return Ok(());
            };

            let mut headers: Vec<(&str, &str)> = Vec::new();
            if let Some(content_type) = response.content_type {
                headers.push(("Content-Type", content_type));
            }
            for (name, value) in &response.headers {
                headers.push((name, value.as_str()));
            }
            req.into_response(response.status, None, &headers)?
                .write_all(response.body.as_bytes())?;
            Ok(())
        })?;
    }
    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<&mut EspHttpConnection<'_>>,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn load_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<NodeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];
    match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<NodeConfig>(value)?),
        None => Ok(NodeConfig::default()),
    }
}

struct NvsPropertyStore {
    nvs: EspNvs<NvsDefault>,
}

impl PropertyStore for NvsPropertyStore {
    fn load(&mut self) -> Result<Option<String>, StoreError> {
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];
        self.nvs
            .get_str(NVS_PROPERTIES_KEY, &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn save(&mut self, blob: &str) -> Result<(), StoreError> {
        self.nvs
            .set_str(NVS_PROPERTIES_KEY, blob)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

/// Sensor input whose any-edge interrupt feeds an [`EdgeCounter`].
struct EspInput {
    driver: PinDriver<'static, AnyIOPin, Input>,
}

impl InputPin for EspInput {
    fn is_high(&mut self) -> bool {
        let level = self.driver.is_high();
        // The driver disarms the interrupt after each notification.
        if let Err(err) = self.driver.enable_interrupt() {
            warn!("failed to re-arm GPIO{} interrupt: {err}", self.driver.pin());
        }
        level
    }
}

struct EspOutput {
    driver: PinDriver<'static, AnyOutputPin, Output>,
    high: bool,
}

impl OutputPin for EspOutput {
    fn set_level(&mut self, high: bool) {
        let result = if high {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
        match result {
            Ok(()) => self.high = high,
            Err(err) => warn!("failed to drive GPIO{}: {err}", self.driver.pin()),
        }
    }

    fn is_set_high(&self) -> bool {
        self.high
    }
}

struct EspPwm {
    driver: LedcDriver<'static>,
}

impl PwmOutput for EspPwm {
    fn set_duty(&mut self, duty: u32) {
        let duty = duty.min(self.driver.get_max_duty());
        if let Err(err) = self.driver.set_duty(duty) {
            warn!("failed to set dimmer duty {duty}: {err}");
        }
    }
}

struct EspPins {
    ledc: Option<LEDC>,
}

impl PinBank for EspPins {
    fn input(
        &mut self,
        pin: u8,
        pullup: bool,
        edges: Arc<EdgeCounter>,
    ) -> anyhow::Result<Box<dyn InputPin>> {
        let mut driver = PinDriver::input(unsafe { AnyIOPin::new(i32::from(pin)) })?;
        driver.set_pull(if pullup { Pull::Up } else { Pull::Floating })?;
        driver.set_interrupt_type(InterruptType::AnyEdge)?;
        unsafe { driver.subscribe(move || edges.record())? };
        driver.enable_interrupt()?;
        Ok(Box::new(EspInput { driver }))
    }

    fn output(&mut self, pin: u8) -> anyhow::Result<Box<dyn OutputPin>> {
        let mut driver = PinDriver::output(unsafe { AnyOutputPin::new(i32::from(pin)) })?;
        driver.set_low()?;
        Ok(Box::new(EspOutput {
            driver,
            high: false,
        }))
    }

    fn pwm(&mut self, pin: u8) -> anyhow::Result<Box<dyn PwmOutput>> {
        let Some(ledc) = self.ledc.take() else {
            bail!("only one dimmer is supported");
        };
        let timer = LedcTimerDriver::new(
            ledc.timer0,
            &TimerConfig::new().frequency(DIMMER_FREQUENCY_KHZ.kHz().into()),
        )?;
        let driver = LedcDriver::new(ledc.channel0, timer, unsafe {
            AnyOutputPin::new(i32::from(pin))
        })?;
        Ok(Box::new(EspPwm { driver }))
    }
}

fn station_network(wifi: &EspWifi<'static>, ssid: &str) -> Option<NetworkInfo> {
    if !is_wifi_station_connected() {
        return None;
    }
    let info = wifi.sta_netif().get_ip_info().ok()?;
    if info.ip.is_unspecified() {
        return None;
    }
    Some(NetworkInfo {
        ip: IpAddr::V4(info.ip),
        gateway: IpAddr::V4(info.subnet.gateway),
        netmask: IpAddr::V4(prefix_to_netmask(info.subnet.mask.0)),
        ssid: ssid.to_string(),
    })
}

fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<Option<EspNetif>> {
    if !network.use_static_ip {
        return Ok(None);
    }

    let static_ip = network
        .static_ip
        .ok_or_else(|| anyhow!("static_ip is required when use_static_ip is true"))?;
    let gateway = network
        .gateway
        .ok_or_else(|| anyhow!("gateway is required when use_static_ip is true"))?;
    let subnet = network.subnet.unwrap_or([255, 255, 255, 0]);

    let mask_ip = ipv4_from_octets(subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {}", mask_ip))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: ipv4_from_octets(static_ip),
                subnet: Subnet {
                    gateway: ipv4_from_octets(gateway),
                    mask,
                },
                dns: network.dns.map(ipv4_from_octets),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(Some(EspNetif::new_with_conf(&conf)?))
}

/// Brings the station up. A node that cannot join keeps running offline; the loop picks the
/// link up whenever the driver reconnects.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    match build_sta_netif(network) {
        Ok(Some(sta_netif)) => {
            esp_wifi
                .swap_netif_sta(sta_netif)
                .context("failed to apply static IP netif configuration")?;
        }
        Ok(None) => {}
        Err(err) => warn!("invalid static IP configuration ({err:#}); using DHCP"),
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    if network.wifi_ssid.trim().is_empty() {
        warn!("wifi credentials missing; running without network");
        return Ok(esp_wifi);
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }
        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; continuing offline");
    Ok(esp_wifi)
}

/// Task watchdog guarding the main loop.
struct Watchdog;

impl Watchdog {
    fn arm(timeout_sec: u32) -> anyhow::Result<Self> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: timeout_sec.saturating_mul(1000),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        wdt_result("init", unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) })?;
        if let Err(err) = wdt_result("add", unsafe {
            esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut())
        }) {
            warn!("main loop runs unwatched: {err:#}");
        }
        Ok(Self)
    }

    fn feed(&self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

// Already initialized or already subscribed is fine.
fn wdt_result(call: &str, rc: esp_idf_svc::sys::esp_err_t) -> anyhow::Result<()> {
    match rc {
        esp_idf_svc::sys::ESP_OK | esp_idf_svc::sys::ESP_ERR_INVALID_STATE => Ok(()),
        rc => bail!("esp_task_wdt_{call} returned {rc}"),
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
