//! Control-plane server: WebSocket endpoint, health route, heartbeat, and
//! the fan-out task that routes session events to subscribed clients.

pub mod registry;
pub mod socket;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use valet_protocol::StatusSnapshot;

use crate::service::SessionService;
use self::registry::ClientRegistry;

/// Interval between server→client heartbeat pings. A client silent for two
/// intervals is evicted.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct AppState {
    pub registry: ClientRegistry,
    pub service: Arc<SessionService>,
    pub secret: Option<String>,
    pub bind: String,
    pub port: u16,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        service: Arc<SessionService>,
        secret: Option<String>,
        bind: String,
        port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: ClientRegistry::new(),
            service,
            secret,
            bind,
            port,
            started_at: Instant::now(),
        })
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: true,
            port: self.port,
            bind: self.bind.clone(),
            uptime: self.started_at.elapsed().as_secs(),
            clients: self.registry.infos().await,
            active_sessions: self.service.active_count().await,
            total_sessions: self.service.list().await.len(),
            pid: std::process::id(),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/ws", get(socket::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.status().await)
}

/// Route session events from the service to subscribed clients.
///
/// Fan-out is best-effort: the registry drops dead clients itself, and a
/// lagged receiver only costs this task the skipped backlog.
pub fn spawn_event_fanout(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let mut events = state.service.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    state
                        .registry
                        .broadcast(&event.session_id, &event.message)
                        .await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event fan-out lagged; dropping backlog");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Ping every client on a fixed cadence and evict the silent ones.
pub fn spawn_heartbeat(state: Arc<AppState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.registry.ping_all().await;
            let evicted = state.registry.sweep(interval * 2).await;
            for client_id in evicted {
                tracing::info!(%client_id, "evicted unresponsive client");
            }
        }
    })
}
