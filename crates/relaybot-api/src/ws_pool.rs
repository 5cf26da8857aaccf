//! WebSocket connection pool for the debug channel.
//!
//! Connections are isolated per session: the pool key is
//! `"{pipeline_uuid}:{session_type}"`, so person and group sessions (and
//! different pipelines) never see each other's events, while multiple
//! tabs on the same session all receive broadcasts.
//!
//! Adding a connection is lock-free (one writer per key); removal and
//! stale sweeps serialize on the maintenance mutex. Broadcast fans out
//! concurrently and counts failures without aborting peers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Close code for server-initiated stale-connection closes.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for protocol violations.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Frames pushed from the pool to one socket task.
#[derive(Debug, Clone)]
pub enum WsOutbound {
    /// A JSON event to deliver.
    Event(String),
    /// Close the socket with this code.
    Close(u16),
}

/// One registered connection.
pub struct WsConnection {
    pub connection_id: String,
    pub pipeline_uuid: String,
    pub session_type: String,
    pub created_at: Instant,
    last_ping: RwLock<Instant>,
    sender: mpsc::Sender<WsOutbound>,
}

impl WsConnection {
    pub fn new(
        connection_id: String,
        pipeline_uuid: String,
        session_type: String,
        sender: mpsc::Sender<WsOutbound>,
    ) -> Self {
        Self {
            connection_id,
            pipeline_uuid,
            session_type,
            created_at: Instant::now(),
            last_ping: RwLock::new(Instant::now()),
            sender,
        }
    }

    /// `"{pipeline_uuid}:{session_type}"`.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.pipeline_uuid, self.session_type)
    }

    pub fn touch_ping(&self) {
        *self.last_ping.write() = Instant::now();
    }

    fn ping_age(&self) -> Duration {
        self.last_ping.read().elapsed()
    }

    /// Send one event; an error marks the connection dead to the caller.
    pub async fn send(&self, event_type: &str, data: serde_json::Value) -> Result<(), ()> {
        let frame = serde_json::json!({"type": event_type, "data": data}).to_string();
        self.sender
            .send(WsOutbound::Event(frame))
            .await
            .map_err(|_| ())
    }
}

/// The session-isolated pool.
pub struct WsConnectionPool {
    connections: DashMap<String, DashMap<String, Arc<WsConnection>>>,
    /// Serializes removals and stale sweeps.
    maintenance: tokio::sync::Mutex<()>,
    stale_timeout: Duration,
}

impl WsConnectionPool {
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            maintenance: tokio::sync::Mutex::new(()),
            stale_timeout,
        }
    }

    /// Register a connection. Lock-free: each key has a single writer
    /// (the socket task that just completed its handshake).
    pub fn add_connection(&self, connection: Arc<WsConnection>) {
        let session_key = connection.session_key();
        let total = {
            let entry = self.connections.entry(session_key.clone()).or_default();
            entry.insert(connection.connection_id.clone(), connection.clone());
            entry.len()
        };
        info!(
            connection = %connection.connection_id,
            session = %session_key,
            total,
            "websocket connection added"
        );
    }

    pub async fn remove_connection(&self, connection_id: &str, session_key: &str) {
        let _guard = self.maintenance.lock().await;
        if let Some(entry) = self.connections.get(session_key) {
            entry.remove(connection_id);
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.connections
                    .remove_if(session_key, |_, map| map.is_empty());
            }
            info!(connection = %connection_id, session = %session_key, "websocket connection removed");
        }
    }

    pub fn get_connection(
        &self,
        connection_id: &str,
        session_key: &str,
    ) -> Option<Arc<WsConnection>> {
        self.connections
            .get(session_key)?
            .get(connection_id)
            .map(|c| c.clone())
    }

    pub fn connections_for(&self, pipeline_uuid: &str, session_type: &str) -> Vec<Arc<WsConnection>> {
        let session_key = format!("{pipeline_uuid}:{session_type}");
        self.connections
            .get(&session_key)
            .map(|entry| entry.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Broadcast one event to every connection of a session. Failures are
    /// counted, not fatal: a dead peer never aborts the others.
    pub async fn broadcast(
        &self,
        pipeline_uuid: &str,
        session_type: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> usize {
        let connections = self.connections_for(pipeline_uuid, session_type);
        let sends = connections
            .iter()
            .map(|c| c.send(event_type, data.clone()));
        let failures = join_all(sends)
            .await
            .into_iter()
            .filter(Result::is_err)
            .count();
        if failures > 0 {
            warn!(
                session = %format!("{pipeline_uuid}:{session_type}"),
                failures,
                "broadcast had failed sends"
            );
        }
        connections.len() - failures
    }

    /// Close and remove connections whose last ping is older than the
    /// configured timeout. Returns how many were reaped.
    pub async fn cleanup_stale_connections(&self) -> usize {
        let _guard = self.maintenance.lock().await;
        let mut reaped = 0;
        let mut empty_keys = Vec::new();
        for entry in self.connections.iter() {
            let session_key = entry.key().clone();
            let stale: Vec<Arc<WsConnection>> = entry
                .iter()
                .filter(|c| c.ping_age() > self.stale_timeout)
                .map(|c| c.clone())
                .collect();
            for connection in stale {
                debug!(connection = %connection.connection_id, "closing stale connection");
                let _ = connection.sender.send(WsOutbound::Close(CLOSE_NORMAL)).await;
                entry.remove(&connection.connection_id);
                reaped += 1;
            }
            if entry.is_empty() {
                empty_keys.push(session_key);
            }
        }
        for key in empty_keys {
            self.connections.remove_if(&key, |_, map| map.is_empty());
        }
        reaped
    }

    pub fn total_connections(&self) -> usize {
        self.connections.iter().map(|entry| entry.len()).sum()
    }
}
