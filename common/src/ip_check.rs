use log::{info, warn};

use crate::net::{Connection, Connector};

pub const IP_CHECK_ATTEMPTS: u32 = 3;
pub const IP_CHECK_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Where and how often to probe, from the `IpCheck`, `IpAddress` and `IpPort` properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpCheckSettings {
    pub interval_ms: u64,
    pub host: String,
    pub port: u16,
}

impl IpCheckSettings {
    /// `None` unless both an interval and a host are configured. Port 0 means 80.
    pub fn new(interval_minutes: u64, host: Option<&str>, port: u16) -> Option<Self> {
        let host = host.map(str::trim).filter(|host| !host.is_empty())?;
        if interval_minutes == 0 {
            return None;
        }
        Some(Self {
            interval_ms: interval_minutes.saturating_mul(60_000),
            host: host.to_string(),
            port: if port == 0 { 80 } else { port },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpCheckOutcome {
    Reachable,
    Unreachable,
}

struct Probe {
    settings: IpCheckSettings,
    attempt: u32,
    connection: Option<Box<dyn Connection>>,
    started_at: u64,
}

/// Periodic TCP reachability probe, advanced one step per tick.
#[derive(Default)]
pub struct IpCheck {
    last_check_at: Option<u64>,
    probe: Option<Probe>,
}

impl IpCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_probing(&self) -> bool {
        self.probe.is_some()
    }

    /// Returns the outcome when a probe finishes on this call.
    pub fn poll(
        &mut self,
        now_ms: u64,
        settings: Option<IpCheckSettings>,
        connector: &mut dyn Connector,
    ) -> Option<IpCheckOutcome> {
        let Some(probe) = self.probe.as_mut() else {
            let settings = settings?;
            let last = *self.last_check_at.get_or_insert(now_ms);
            if now_ms > last.saturating_add(settings.interval_ms) {
                self.probe = Some(Probe {
                    settings,
                    attempt: 0,
                    connection: None,
                    started_at: now_ms,
                });
            }
            return None;
        };

        let settings = &probe.settings;
        let attempt_failed = match probe.connection.as_mut() {
            None => {
                info!(
                    "IP check connecting to {}:{} (attempt {})",
                    settings.host,
                    settings.port,
                    probe.attempt + 1
                );
                match connector.connect(&settings.host, settings.port, IP_CHECK_CONNECT_TIMEOUT_MS) {
                    Ok(connection) => {
                        probe.connection = Some(connection);
                        probe.started_at = now_ms;
                        false
                    }
                    Err(err) => {
                        warn!("IP check connect to {} failed: {err}", settings.host);
                        true
                    }
                }
            }
            Some(connection) => match connection.poll_connect() {
                Ok(true) => {
                    connection.close();
                    info!("IP check reached {}:{}", settings.host, settings.port);
                    return Some(self.finish(now_ms, IpCheckOutcome::Reachable));
                }
                Ok(false) => {
                    now_ms.saturating_sub(probe.started_at) > IP_CHECK_CONNECT_TIMEOUT_MS
                }
                Err(err) => {
                    warn!("IP check connect to {} failed: {err}", settings.host);
                    true
                }
            },
        };

        if attempt_failed {
            if let Some(mut connection) = probe.connection.take() {
                connection.close();
            }
            probe.attempt += 1;
            if probe.attempt >= IP_CHECK_ATTEMPTS {
                warn!(
                    "IP check could not reach {}:{} after {IP_CHECK_ATTEMPTS} attempts",
                    probe.settings.host, probe.settings.port
                );
                return Some(self.finish(now_ms, IpCheckOutcome::Unreachable));
            }
        }
        None
    }

    fn finish(&mut self, now_ms: u64, outcome: IpCheckOutcome) -> IpCheckOutcome {
        self.probe = None;
        self.last_check_at = Some(now_ms);
        outcome
    }
}
