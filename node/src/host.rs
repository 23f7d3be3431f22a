use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path as UrlPath, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::IntoResponse,
    routing::put,
    Router,
};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use mpp_common::{
    config::NodeConfig, EdgeCounter, InputPin, Method, NetworkInfo, OutputPin, Properties,
    PropertyStore, PwmOutput, Request, Response, Server, StoreError, Transport,
};

use crate::{
    devices::{build_device, PinBank},
    net::{StdConnector, UdpEndpoint},
};

const DEFAULT_HOST_MAC: &str = "02:00:00:00:00:01";
const REQUEST_QUEUE: usize = 32;

struct Inbound {
    request: Request,
    reply: oneshot::Sender<Response>,
}

#[derive(Clone)]
struct AppState {
    requests: mpsc::Sender<Inbound>,
    inputs: Arc<HashMap<u8, SimulatedInput>>,
}

#[derive(Debug, Deserialize)]
struct SimulateQuery {
    level: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = NodeStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load node config from store: {err:#}");
        NodeConfig::default()
    });
    apply_env_overrides(&mut config);
    config.sanitize();

    let mac = config
        .network
        .mac
        .clone()
        .unwrap_or_else(|| DEFAULT_HOST_MAC.to_string());
    let mut properties = Properties::new(Box::new(FilePropertyStore::new(
        store.properties_path(),
    )));
    if let Err(err) = properties.load() {
        warn!("failed to load properties, continuing with defaults: {err}");
    }

    let mut server = Server::new(config.server.clone(), &mac, properties);
    let mut pins = SimulatedPins::default();
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

    let (requests, mut inbound) = mpsc::channel(REQUEST_QUEUE);
    let app_state = AppState {
        requests,
        inputs: Arc::new(pins.inputs),
    };
    let app = Router::new()
        .route("/simulate/{pin}", put(handle_simulate))
        .fallback(forward_request)
        .with_state(app_state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind node server at {addr}"))?;
    info!("node listening on http://{addr}");
    tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(err) = axum::serve(listener, service).await {
            warn!("http server stopped: {err:#}");
        }
    });

    server.network_up(local_network());

    let mut interval = tokio::time::interval(Duration::from_millis(config.server.tick_interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        }

        let now_ms = monotonic_ms();
        while let Ok(Inbound { request, reply }) = inbound.try_recv() {
            let response = server.handle_request(&request, now_ms);
            if reply.send(response).is_err() {
                debug!(
                    "Client left before {} {} was answered",
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
            info!("restart requested, exiting so the supervisor can start a fresh node");
            break;
        }
    }
    Ok(())
}

async fn forward_request(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    let Some(method) = Method::parse(method.as_str()) else {
        return StatusCode::NOT_IMPLEMENTED.into_response();
    };
    let mut request = Request::new(method, uri.path())
        .with_query(uri.query().unwrap_or_default())
        .with_body(body)
        .from_remote(remote.ip());
    if let Some(authorization) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        request = request.with_authorization(authorization);
    }

    let (reply, response) = oneshot::channel();
    if state.requests.send(Inbound { request, reply }).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match response.await {
        Ok(response) => into_http(response),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn handle_simulate(
    State(state): State<AppState>,
    UrlPath(pin): UrlPath<u8>,
    Query(query): Query<SimulateQuery>,
) -> impl IntoResponse {
    match state.inputs.get(&pin) {
        Some(input) => {
            input.drive(query.level);
            info!("simulated GPIO{pin} driven {}", level_name(query.level));
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

fn into_http(response: Response) -> axum::response::Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = axum::response::Response::builder().status(status);
    if let Some(content_type) = response.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    for (name, value) in response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn apply_env_overrides(config: &mut NodeConfig) {
    if let Some(port) = env_parse::<u16>("MPP_HTTP_PORT") {
        config.server.http_port = port;
    }
    if let Some(port) = env_parse::<u16>("MPP_UDP_PORT") {
        config.server.udp_port = port;
    }
    if let Ok(mac) = std::env::var("MPP_MAC") {
        config.network.mac = Some(mac);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

/// Address of the interface that routes to the multicast group; loopback when there is none.
fn local_network() -> NetworkInfo {
    let ip = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    NetworkInfo {
        ip,
        gateway: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        netmask: IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)),
        ssid: "Ethernet".to_string(),
    }
}

struct NodeStore {
    data_dir: PathBuf,
}

impl NodeStore {
    fn new() -> Self {
        let data_dir = std::env::var("MPP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.mpp-node"));
        Self { data_dir }
    }

    fn properties_path(&self) -> PathBuf {
        self.data_dir.join("properties.json")
    }

    async fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let path = self.data_dir.join("node.json");
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<NodeConfig>(&raw)
                .with_context(|| format!("invalid node config in {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(NodeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Properties blob in a plain file next to the node config.
struct FilePropertyStore {
    path: PathBuf,
}

impl FilePropertyStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl PropertyStore for FilePropertyStore {
    fn load(&mut self) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(backend_error(&self.path, err)),
        }
    }

    fn save(&mut self, blob: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| backend_error(parent, err))?;
        }
        std::fs::write(&self.path, blob).map_err(|err| backend_error(&self.path, err))
    }
}

fn backend_error(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Backend(format!("{}: {err}", path.display()))
}

/// Input level set over HTTP; every change counts as an edge.
#[derive(Clone)]
struct SimulatedInput {
    level: Arc<AtomicBool>,
    edges: Arc<EdgeCounter>,
}

impl SimulatedInput {
    fn drive(&self, level: bool) {
        if self.level.swap(level, Ordering::AcqRel) != level {
            self.edges.record();
        }
    }
}

impl InputPin for SimulatedInput {
    fn is_high(&mut self) -> bool {
        self.level.load(Ordering::Acquire)
    }
}

struct SimulatedOutput {
    pin: u8,
    high: bool,
}

impl OutputPin for SimulatedOutput {
    fn set_level(&mut self, high: bool) {
        if self.high != high {
            info!("GPIO{} -> {}", self.pin, level_name(high));
        }
        self.high = high;
    }

    fn is_set_high(&self) -> bool {
        self.high
    }
}

struct SimulatedPwm {
    pin: u8,
}

impl PwmOutput for SimulatedPwm {
    fn set_duty(&mut self, duty: u32) {
        info!("GPIO{} duty {duty}", self.pin);
    }
}

#[derive(Default)]
struct SimulatedPins {
    inputs: HashMap<u8, SimulatedInput>,
}

impl PinBank for SimulatedPins {
    fn input(
        &mut self,
        pin: u8,
        pullup: bool,
        edges: Arc<EdgeCounter>,
    ) -> anyhow::Result<Box<dyn InputPin>> {
        let input = SimulatedInput {
            level: Arc::new(AtomicBool::new(pullup)),
            edges,
        };
        self.inputs.insert(pin, input.clone());
        Ok(Box::new(input))
    }

    fn output(&mut self, pin: u8) -> anyhow::Result<Box<dyn OutputPin>> {
        Ok(Box::new(SimulatedOutput { pin, high: false }))
    }

    fn pwm(&mut self, pin: u8) -> anyhow::Result<Box<dyn PwmOutput>> {
        Ok(Box::new(SimulatedPwm { pin }))
    }
}

fn level_name(high: bool) -> &'static str {
    if high {
        "HIGH"
    } else {
        "LOW"
    }
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
