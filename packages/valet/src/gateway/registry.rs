//! Connected-client bookkeeping.
//!
//! Each client owns an outbound frame channel feeding its socket task.
//! Delivery is best-effort: a client whose channel is gone is removed on
//! the spot without affecting other subscribers. Liveness is tracked by
//! `last_seen`, refreshed on any inbound frame; the heartbeat sweep evicts
//! clients silent for two ping intervals.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use valet_protocol::{ClientInfo, ServerMessage};

/// What a socket task can be asked to write.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// A control-plane JSON message.
    Message(Value),
    /// A protocol-level ping for the heartbeat.
    Ping,
}

#[derive(Debug)]
struct ClientState {
    channel: Option<String>,
    authenticated: bool,
    connected_at: DateTime<Utc>,
    subscriptions: HashSet<String>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, ClientState>>,
    counter: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, outbound: mpsc::UnboundedSender<OutboundFrame>) -> String {
        let id = format!("client_{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        let mut clients = self.clients.lock().await;
        clients.insert(
            id.clone(),
            ClientState {
                channel: None,
                authenticated: false,
                connected_at: Utc::now(),
                subscriptions: HashSet::new(),
                outbound,
                last_seen: Instant::now(),
            },
        );
        id
    }

    pub async fn remove(&self, client_id: &str) {
        self.clients.lock().await.remove(client_id);
    }

    pub async fn mark_authenticated(&self, client_id: &str, channel: Option<String>) {
        if let Some(client) = self.clients.lock().await.get_mut(client_id) {
            client.authenticated = true;
            client.channel = channel;
        }
    }

    pub async fn is_authenticated(&self, client_id: &str) -> bool {
        self.clients
            .lock()
            .await
            .get(client_id)
            .map(|client| client.authenticated)
            .unwrap_or(false)
    }

    /// Refresh a client's liveness clock. Any inbound frame counts.
    pub async fn touch(&self, client_id: &str) {
        if let Some(client) = self.clients.lock().await.get_mut(client_id) {
            client.last_seen = Instant::now();
        }
    }

    pub async fn subscribe(&self, client_id: &str, session_id: &str) {
        if let Some(client) = self.clients.lock().await.get_mut(client_id) {
            client.subscriptions.insert(session_id.to_string());
        }
    }

    /// Send to a single client, removing it if its channel is closed.
    pub async fn send_to(&self, client_id: &str, message: &ServerMessage) -> bool {
        let wire = message.to_wire();
        let mut clients = self.clients.lock().await;
        match clients.get(client_id) {
            Some(client) => {
                if client.outbound.send(OutboundFrame::Message(wire)).is_ok() {
                    true
                } else {
                    clients.remove(client_id);
                    false
                }
            }
            None => false,
        }
    }

    /// Best-effort fan-out to every subscriber of a session. A dead client
    /// is dropped from the registry; delivery to the rest proceeds.
    pub async fn broadcast(&self, session_id: &str, message: &ServerMessage) {
        let wire = message.to_wire();
        let mut clients = self.clients.lock().await;
        clients.retain(|client_id, client| {
            if !client.subscriptions.contains(session_id) {
                return true;
            }
            if client
                .outbound
                .send(OutboundFrame::Message(wire.clone()))
                .is_err()
            {
                tracing::info!(%client_id, "removing client with closed outbound channel");
                return false;
            }
            true
        });
    }

    /// Heartbeat: ping every client, dropping those already gone.
    pub async fn ping_all(&self) {
        let mut clients = self.clients.lock().await;
        clients.retain(|client_id, client| {
            if client.outbound.send(OutboundFrame::Ping).is_err() {
                tracing::info!(%client_id, "removing client during heartbeat");
                return false;
            }
            true
        });
    }

    /// Evict clients with no liveness signal within `max_idle`.
    pub async fn sweep(&self, max_idle: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut clients = self.clients.lock().await;
        clients.retain(|client_id, client| {
            if client.last_seen.elapsed() > max_idle {
                evicted.push(client_id.clone());
                return false;
            }
            true
        });
        evicted
    }

    pub async fn infos(&self) -> Vec<ClientInfo> {
        let clients = self.clients.lock().await;
        let mut infos: Vec<ClientInfo> = clients
            .iter()
            .map(|(client_id, client)| ClientInfo {
                id: client_id.clone(),
                channel: client.channel.clone(),
                authenticated: client.authenticated,
                connected_at: client.connected_at,
                subscriptions: {
                    let mut subscriptions: Vec<String> =
                        client.subscriptions.iter().cloned().collect();
                    subscriptions.sort();
                    subscriptions
                },
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers() {
        let registry = ClientRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.register(tx_a).await;
        let _b = registry.register(tx_b).await;
        registry.subscribe(&a, "sess_1").await;

        registry
            .broadcast("sess_1", &ServerMessage::Pong)
            .await;

        assert!(matches!(rx_a.try_recv(), Ok(OutboundFrame::Message(_))));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscriber_is_dropped_without_blocking_others() {
        let registry = ClientRegistry::new();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let dead = registry.register(tx_dead).await;
        let live = registry.register(tx_live).await;
        registry.subscribe(&dead, "sess_1").await;
        registry.subscribe(&live, "sess_1").await;
        drop(rx_dead);

        registry.broadcast("sess_1", &ServerMessage::Pong).await;

        assert!(matches!(rx_live.try_recv(), Ok(OutboundFrame::Message(_))));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn sweep_evicts_silent_clients() {
        let registry = ClientRegistry::new();
        let (tx_idle, _rx_idle) = mpsc::unbounded_channel();
        let (tx_live, _rx_live) = mpsc::unbounded_channel();
        let idle = registry.register(tx_idle).await;
        let live = registry.register(tx_live).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.touch(&live).await;

        let evicted = registry.sweep(Duration::from_millis(20)).await;
        assert_eq!(evicted, vec![idle]);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn authentication_state_is_per_client() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register(tx).await;
        assert!(!registry.is_authenticated(&id).await);

        registry
            .mark_authenticated(&id, Some("cli".to_string()))
            .await;
        assert!(registry.is_authenticated(&id).await);

        let infos = registry.infos().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].channel.as_deref(), Some("cli"));
    }
}
