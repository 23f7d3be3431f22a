use std::net::{IpAddr, SocketAddr};

use log::{debug, info, warn};

use crate::net::DatagramSocket;

pub const SUBSCRIPTION_LEASE_MS: u64 = 10 * 60 * 1_000;
pub const DEFAULT_NOTIFY_PORT: u16 = 8898;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub target: SocketAddr,
    pub expires_at: u64,
}

impl Subscription {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at > now_ms
    }
}

/// Notification targets with a renewable lease. Expired entries are skipped, not swept.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or renews `address:port`. Port 0 means the default notify port.
    pub fn subscribe(&mut self, address: IpAddr, port: u16, now_ms: u64) -> &Subscription {
        let port = if port == 0 { DEFAULT_NOTIFY_PORT } else { port };
        let target = SocketAddr::new(address, port);
        let expires_at = now_ms.saturating_add(SUBSCRIPTION_LEASE_MS);

        let index = match self.subscriptions.iter().position(|sub| sub.target == target) {
            Some(index) => {
                self.subscriptions[index].expires_at = expires_at;
                index
            }
            None => {
                info!("Added subscriber {target}");
                self.subscriptions.push(Subscription { target, expires_at });
                self.subscriptions.len() - 1
            }
        };
        debug!("{target} subscribed until {expires_at}");
        &self.subscriptions[index]
    }

    /// Sends `payload` to every live subscriber and returns how many accepted it.
    /// A failed send is logged and does not stop delivery to the rest.
    pub fn notify(&self, payload: &str, now_ms: u64, socket: &mut dyn DatagramSocket) -> usize {
        let mut delivered = 0;
        for sub in self.live(now_ms) {
            match socket.send_to(payload.as_bytes(), sub.target) {
                Ok(sent) => {
                    debug!("Sent notification to {} ({sent} bytes)", sub.target);
                    delivered += 1;
                }
                Err(err) => warn!("Notification to {} failed: {err}", sub.target),
            }
        }
        delivered
    }

    pub fn live(&self, now_ms: u64) -> impl Iterator<Item = &Subscription> {
        self.subscriptions
            .iter()
            .filter(move |sub| sub.is_live(now_ms))
    }

    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|sub| sub.is_live(now_ms));
        before - self.subscriptions.len()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
