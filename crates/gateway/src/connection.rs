//! Live client connections and event fan-out.
//!
//! The manager owns the registry of attached connections and the
//! [`MessageQueue`] that buffers events while nobody is attached. The
//! registry lock is held for a whole connect or broadcast so those
//! operations never interleave; sinks are expected to hand frames off to a
//! writer task rather than block on the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use slowhands_config::GatewayConfig;
use slowhands_core::error::DeliveryError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{MessageQueue, QueueStats};

/// Outbound half of a transport connection.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, event: &Value) -> Result<(), DeliveryError>;

    /// Send a transport-level keepalive ping.
    async fn ping(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Eight hex characters, the format used for connection ids.
pub fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub reconnect_count: u32,
    opened: Instant,
    last_activity: Instant,
    last_ping_at: Option<Instant>,
    ping_sent_at: Option<Instant>,
    last_ping_latency_ms: Option<f64>,
}

impl ConnectionInfo {
    fn new(connection_id: String) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            connected_at: Utc::now(),
            reconnect_count: 0,
            opened: now,
            last_activity: now,
            last_ping_at: None,
            ping_sent_at: None,
            last_ping_latency_ms: None,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn last_ping_latency_ms(&self) -> Option<f64> {
        self.last_ping_latency_ms
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub last_activity_seconds_ago: f64,
    pub last_ping_seconds_ago: Option<f64>,
    pub last_ping_latency_ms: Option<f64>,
    pub reconnect_count: u32,
}

struct Connection {
    info: ConnectionInfo,
    sink: Arc<dyn ConnectionSink>,
}

fn round1(d: Duration) -> f64 {
    (d.as_secs_f64() * 10.0).round() / 10.0
}

pub struct ConnectionManager {
    connections: Mutex<HashMap<String, Connection>>,
    queue: MessageQueue,
    connection_timeout: Duration,
    sweep_interval: Duration,
    ping_interval: Option<Duration>,
}

impl ConnectionManager {
    pub fn new(queue_max_size: usize, connection_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            queue: MessageQueue::new(queue_max_size),
            connection_timeout,
            sweep_interval: Duration::from_secs(30),
            ping_interval: None,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.message_queue_max_size, config.connection_timeout())
            .with_sweep_interval(config.stale_sweep_interval())
            .with_ping_interval(config.ping_interval())
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Register a connection and flush anything queued while nobody was
    /// attached to it.
    pub async fn connect(&self, connection_id: impl Into<String>, sink: Arc<dyn ConnectionSink>) {
        let connection_id = connection_id.into();
        let mut connections = self.connections.lock().await;
        connections.insert(
            connection_id.clone(),
            Connection {
                info: ConnectionInfo::new(connection_id.clone()),
                sink: sink.clone(),
            },
        );
        info!(connection_id = %connection_id, total = connections.len(), "Connection registered");

        if self.queue.is_empty() {
            return;
        }
        let delivered = self
            .queue
            .process_all(|event| {
                let sink = sink.clone();
                async move { sink.send(&event).await }
            })
            .await;
        if delivered > 0 {
            if let Some(conn) = connections.get_mut(&connection_id) {
                conn.info.last_activity = Instant::now();
            }
            info!(connection_id = %connection_id, delivered, "Replayed queued messages");
        }
    }

    /// Remove a connection. Returns whether it was registered.
    pub async fn disconnect(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.lock().await;
        let removed = connections.remove(connection_id).is_some();
        if removed {
            info!(connection_id, total = connections.len(), "Connection removed");
        }
        removed
    }

    /// Deliver an event to every attached connection.
    ///
    /// With nobody attached the event is queued. Connections whose send
    /// fails are dropped after the pass, and if that leaves nobody attached
    /// the event is queued as well. Returns how many connections got it.
    pub async fn broadcast(&self, event: Value, correlation_id: Option<&str>) -> usize {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string();
        let cid = correlation_id
            .or_else(|| event.get("correlation_id").and_then(Value::as_str))
            .unwrap_or("no-cid")
            .to_string();

        let mut connections = self.connections.lock().await;
        if connections.is_empty() {
            self.queue.enqueue(event);
            info!(
                cid = %cid,
                kind = %kind,
                queued = self.queue.len(),
                "No active connections, event queued"
            );
            return 0;
        }

        debug!(cid = %cid, kind = %kind, connections = connections.len(), "Broadcasting event");
        let mut failed = Vec::new();
        let mut delivered = 0;
        for (id, conn) in connections.iter_mut() {
            match conn.sink.send(&event).await {
                Ok(()) => {
                    conn.info.last_activity = Instant::now();
                    delivered += 1;
                }
                Err(e) => {
                    warn!(cid = %cid, connection_id = %id, error = %e, "Broadcast delivery failed");
                    failed.push(id.clone());
                }
            }
        }
        for id in &failed {
            connections.remove(id);
        }

        if connections.is_empty() {
            self.queue.enqueue(event);
            warn!(
                cid = %cid,
                kind = %kind,
                failed = failed.len(),
                "All connections failed, event queued"
            );
        }
        delivered
    }

    /// Send an event to one connection only. Nothing is queued on failure.
    pub async fn send_to(&self, connection_id: &str, event: &Value) -> Result<(), DeliveryError> {
        let mut connections = self.connections.lock().await;
        let conn = connections
            .get_mut(connection_id)
            .ok_or_else(|| DeliveryError::UnknownConnection(connection_id.to_string()))?;
        conn.sink.send(event).await?;
        conn.info.last_activity = Instant::now();
        Ok(())
    }

    pub async fn update_activity(&self, connection_id: &str) {
        if let Some(conn) = self.connections.lock().await.get_mut(connection_id) {
            conn.info.last_activity = Instant::now();
        }
    }

    pub async fn record_ping_sent(&self, connection_id: &str) {
        if let Some(conn) = self.connections.lock().await.get_mut(connection_id) {
            conn.info.ping_sent_at = Some(Instant::now());
        }
    }

    /// Note a pong. Returns the round-trip latency in milliseconds when a
    /// ping was outstanding.
    pub async fn update_ping(&self, connection_id: &str) -> Option<f64> {
        let mut connections = self.connections.lock().await;
        let info = &mut connections.get_mut(connection_id)?.info;
        let now = Instant::now();
        if let Some(sent) = info.ping_sent_at.take() {
            info.last_ping_latency_ms = Some(now.duration_since(sent).as_secs_f64() * 1000.0);
        }
        info.last_ping_at = Some(now);
        info.last_activity = now;
        info.last_ping_latency_ms
    }

    /// Count a reconnect against a connection that resumed an earlier session.
    pub async fn record_reconnect(&self, connection_id: &str) {
        if let Some(conn) = self.connections.lock().await.get_mut(connection_id) {
            conn.info.reconnect_count += 1;
        }
    }

    /// Disconnect every connection idle for longer than the timeout.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let mut connections = self.connections.lock().await;
        let stale: Vec<String> = connections
            .values()
            .filter(|c| c.info.idle_for() > self.connection_timeout)
            .map(|c| c.info.connection_id.clone())
            .collect();
        for id in &stale {
            if let Some(conn) = connections.remove(id) {
                info!(
                    connection_id = %id,
                    idle_secs = conn.info.idle_for().as_secs(),
                    "Removing stale connection"
                );
            }
        }
        if !stale.is_empty() {
            info!(
                removed = stale.len(),
                remaining = connections.len(),
                "Stale connections cleaned up"
            );
        }
        stale
    }

    /// Send a keepalive ping to every connection.
    pub async fn ping_all(&self) {
        let targets: Vec<(String, Arc<dyn ConnectionSink>)> = self
            .connections
            .lock()
            .await
            .iter()
            .map(|(id, conn)| (id.clone(), conn.sink.clone()))
            .collect();
        for (id, sink) in targets {
            match sink.ping().await {
                Ok(()) => self.record_ping_sent(&id).await,
                Err(e) => debug!(connection_id = %id, error = %e, "Keepalive ping failed"),
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .lock()
            .await
            .get(connection_id)
            .map(|c| c.info.clone())
    }

    pub async fn connection_stats(&self) -> Vec<ConnectionStats> {
        let connections = self.connections.lock().await;
        let mut stats: Vec<ConnectionStats> = connections
            .values()
            .map(|c| ConnectionStats {
                connection_id: c.info.connection_id.clone(),
                connected_at: c.info.connected_at,
                uptime_seconds: round1(c.info.opened.elapsed()),
                last_activity_seconds_ago: round1(c.info.idle_for()),
                last_ping_seconds_ago: c.info.last_ping_at.map(|t| round1(t.elapsed())),
                last_ping_latency_ms: c
                    .info
                    .last_ping_latency_ms
                    .map(|ms| (ms * 100.0).round() / 100.0),
                reconnect_count: c.info.reconnect_count,
            })
            .collect();
        stats.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        stats
    }

    /// Run the stale sweep and keepalive pings until `cancel` fires.
    pub fn spawn_maintenance(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep = delayed_interval(self.sweep_interval);
            let mut ping = self.ping_interval.map(delayed_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        self.sweep_stale().await;
                    }
                    _ = next_tick(&mut ping) => {
                        self.ping_all().await;
                    }
                }
            }
            debug!("Connection maintenance stopped");
        })
    }
}

/// An interval whose first tick is one period away.
fn delayed_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
