//! The plugin RPC connector.
//!
//! Holds one persistent transport to the plugin runtime. Outbound calls
//! are sequence-matched against responses through a pending-call map;
//! inbound requests (plugin -> platform verbs) are dispatched to the
//! [`HostHandler`] the application wires in. A dropped transport fails
//! every in-flight call; the next call reconnects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use relaybot_types::error::{RelayError, Result};

use crate::actions::{Action, ActionFrame};

/// Handler for plugin -> platform verbs.
///
/// The application implements this over its query pool, session manager,
/// and model registry (get/set/list query vars, reply_message,
/// create_new_conversation, get_llm_models, ...).
#[async_trait]
pub trait HostHandler: Send + Sync {
    async fn handle(&self, verb: &str, params: serde_json::Value) -> Result<serde_json::Value>;
}

/// Host handler that rejects every verb; used before wiring completes.
pub struct NullHostHandler;

#[async_trait]
impl HostHandler for NullHostHandler {
    async fn handle(&self, verb: &str, _params: serde_json::Value) -> Result<serde_json::Value> {
        Err(RelayError::Plugin(format!("host verb {verb:?} not available")))
    }
}

enum PendingCall {
    OneShot(oneshot::Sender<Result<serde_json::Value>>),
    Stream(mpsc::Sender<Result<serde_json::Value>>),
}

struct Connection {
    outbound: mpsc::Sender<String>,
}

/// Connector to the plugin runtime.
pub struct PluginConnector {
    ws_url: String,
    seq: AtomicU64,
    pending: Arc<DashMap<u64, PendingCall>>,
    connection: Mutex<Option<Connection>>,
    host: Arc<dyn HostHandler>,
}

impl PluginConnector {
    pub fn new(ws_url: impl Into<String>, host: Arc<dyn HostHandler>) -> Self {
        Self {
            ws_url: ws_url.into(),
            seq: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            connection: Mutex::new(None),
            host,
        }
    }

    /// Attach an already-established frame transport.
    ///
    /// `outbound` carries frames to the runtime; `inbound` delivers frames
    /// from it. Used directly by tests; [`ensure_connected`] wires a real
    /// WebSocket into the same channels.
    pub async fn attach_transport(
        &self,
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<String>,
    ) {
        *self.connection.lock().await = Some(Connection {
            outbound: outbound.clone(),
        });
        let pending = self.pending.clone();
        let host = self.host.clone();
        tokio::spawn(dispatch_inbound(inbound, outbound, pending, host));
    }

    /// Connect to the runtime if not already connected.
    async fn ensure_connected(&self) -> Result<mpsc::Sender<String>> {
        let mut guard = self.connection.lock().await;
        if let Some(ref conn) = *guard {
            if !conn.outbound.is_closed() {
                return Ok(conn.outbound.clone());
            }
            // Transport died; drop it and reconnect below.
            *guard = None;
        }

        info!(url = %self.ws_url, "connecting to plugin runtime");
        let (ws, _) = tokio_tungstenite::connect_async(&self.ws_url)
            .await
            .map_err(|e| RelayError::Plugin(format!("connect {}: {e}", self.ws_url)))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (in_tx, in_rx) = mpsc::channel::<String>(64);

        // Writer task: drain outbound frames into the socket.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    error!(error = %e, "plugin transport write failed");
                    break;
                }
            }
        });

        // Reader task: forward text frames into the inbound channel.
        let pending_for_drop = self.pending.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // Connection gone: fail everything in flight.
            fail_all_pending(&pending_for_drop, "plugin runtime disconnected");
        });

        *guard = Some(Connection {
            outbound: out_tx.clone(),
        });
        drop(guard);

        let pending = self.pending.clone();
        let host = self.host.clone();
        tokio::spawn(dispatch_inbound(in_rx, out_tx.clone(), pending, host));

        Ok(out_tx)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_frame(&self, outbound: &mpsc::Sender<String>, frame: &ActionFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        outbound
            .send(text)
            .await
            .map_err(|_| RelayError::Plugin("plugin transport closed".into()))
    }

    /// One-shot call: send the verb, await its response within the verb's
    /// deadline.
    pub async fn call_action(
        &self,
        action: Action,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let outbound = self.ensure_connected().await?;
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, PendingCall::OneShot(tx));

        let frame = ActionFrame::request(seq, action, params);
        if let Err(e) = self.send_frame(&outbound, &frame).await {
            self.pending.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(action.timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::Plugin("plugin call dropped".into())),
            Err(_) => {
                self.pending.remove(&seq);
                Err(RelayError::Timeout {
                    operation: format!("plugin:{}", action.as_str()),
                })
            }
        }
    }

    /// Streaming call: chunks arrive on the returned channel until the
    /// runtime sends its final frame. The verb deadline applies to the
    /// gap between consecutive chunks, enforced by the receiver wrapper.
    pub async fn call_action_generator(
        &self,
        action: Action,
        params: serde_json::Value,
    ) -> Result<mpsc::Receiver<Result<serde_json::Value>>> {
        let outbound = self.ensure_connected().await?;
        let seq = self.next_seq();
        let (tx, rx) = mpsc::channel(16);
        self.pending.insert(seq, PendingCall::Stream(tx));

        let frame = ActionFrame::request(seq, action, params);
        if let Err(e) = self.send_frame(&outbound, &frame).await {
            self.pending.remove(&seq);
            return Err(e);
        }
        Ok(rx)
    }
}

/// Fail and drain every pending call.
fn fail_all_pending(pending: &DashMap<u64, PendingCall>, reason: &str) {
    let seqs: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for seq in seqs {
        if let Some((_, call)) = pending.remove(&seq) {
            let err = RelayError::Plugin(reason.to_string());
            match call {
                PendingCall::OneShot(tx) => {
                    let _ = tx.send(Err(err));
                }
                PendingCall::Stream(tx) => {
                    let _ = tx.try_send(Err(err));
                }
            }
        }
    }
}

/// Route inbound frames: responses resolve pending calls, requests go to
/// the host handler.
async fn dispatch_inbound(
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
    pending: Arc<DashMap<u64, PendingCall>>,
    host: Arc<dyn HostHandler>,
) {
    while let Some(text) = inbound.recv().await {
        let frame: ActionFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed plugin frame");
                continue;
            }
        };

        // Request from the runtime: plugin -> platform verb.
        if let Some(verb) = frame.action {
            let params = frame.params.unwrap_or(serde_json::Value::Null);
            let seq = frame.seq;
            let host = host.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let reply = match host.handle(&verb, params).await {
                    Ok(data) => ActionFrame::response(seq, data),
                    Err(e) => ActionFrame::error(seq, e.to_string()),
                };
                if let Ok(text) = serde_json::to_string(&reply) {
                    let _ = outbound.send(text).await;
                }
            });
            continue;
        }

        // Stream chunk for an in-flight generator call.
        if let Some(chunk) = frame.chunk {
            if let Some(entry) = pending.get(&frame.seq) {
                if let PendingCall::Stream(tx) = entry.value() {
                    let _ = tx.send(Ok(chunk)).await;
                }
            }
            continue;
        }

        // Terminal frame: response, error, or stream end.
        let Some((_, call)) = pending.remove(&frame.seq) else {
            debug!(seq = frame.seq, "response for unknown or expired call");
            continue;
        };
        let outcome = match frame.error {
            Some(message) => Err(RelayError::Plugin(message)),
            None => Ok(frame.data.unwrap_or(serde_json::Value::Null)),
        };
        match call {
            PendingCall::OneShot(tx) => {
                let _ = tx.send(outcome);
            }
            PendingCall::Stream(tx) => {
                // `done` closes the stream; a final error is forwarded.
                if let Err(e) = outcome {
                    let _ = tx.send(Err(e)).await;
                }
                drop(tx);
            }
        }
        let _ = frame.done;
    }
    fail_all_pending(&pending, "plugin runtime disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake runtime endpoint: receives frames from the connector,
    /// asserts on them, and pushes replies back.
    struct FakeRuntime {
        from_connector: mpsc::Receiver<String>,
        to_connector: mpsc::Sender<String>,
    }

    async fn connected_pair(host: Arc<dyn HostHandler>) -> (PluginConnector, FakeRuntime) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let connector = PluginConnector::new("ws://unused", host);
        connector.attach_transport(out_tx, in_rx).await;
        (
            connector,
            FakeRuntime {
                from_connector: out_rx,
                to_connector: in_tx,
            },
        )
    }

    #[tokio::test]
    async fn call_action_resolves_with_data() {
        let (connector, mut runtime) = connected_pair(Arc::new(NullHostHandler)).await;

        let call = tokio::spawn(async move {
            connector
                .call_action(Action::ListPlugins, serde_json::json!({}))
                .await
        });

        let text = runtime.from_connector.recv().await.unwrap();
        let frame: ActionFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.action.as_deref(), Some("list_plugins"));

        let reply = ActionFrame::response(frame.seq, serde_json::json!({"plugins": []}));
        runtime
            .to_connector
            .send(serde_json::to_string(&reply).unwrap())
            .await
            .unwrap();

        let data = call.await.unwrap().unwrap();
        assert_eq!(data["plugins"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn error_response_becomes_plugin_error() {
        let (connector, mut runtime) = connected_pair(Arc::new(NullHostHandler)).await;

        let call = tokio::spawn(async move {
            connector
                .call_action(Action::CallTool, serde_json::json!({"name": "x"}))
                .await
        });

        let text = runtime.from_connector.recv().await.unwrap();
        let frame: ActionFrame = serde_json::from_str(&text).unwrap();
        runtime
            .to_connector
            .send(serde_json::to_string(&ActionFrame::error(frame.seq, "tool exploded")).unwrap())
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Plugin(m) if m.contains("tool exploded")));
    }

    #[tokio::test]
    async fn generator_call_streams_chunks_until_done() {
        let (connector, mut runtime) = connected_pair(Arc::new(NullHostHandler)).await;

        let mut rx = connector
            .call_action_generator(Action::RagIngestDocument, serde_json::json!({}))
            .await
            .unwrap();

        let text = runtime.from_connector.recv().await.unwrap();
        let frame: ActionFrame = serde_json::from_str(&text).unwrap();
        for progress in ["parsing", "embedding"] {
            let mut chunk = ActionFrame::response(frame.seq, serde_json::Value::Null);
            chunk.data = None;
            chunk.chunk = Some(serde_json::json!({"stage": progress}));
            runtime
                .to_connector
                .send(serde_json::to_string(&chunk).unwrap())
                .await
                .unwrap();
        }
        let mut done = ActionFrame::response(frame.seq, serde_json::Value::Null);
        done.done = Some(true);
        runtime
            .to_connector
            .send(serde_json::to_string(&done).unwrap())
            .await
            .unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first["stage"], "parsing");
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second["stage"], "embedding");
        // Channel closes after the terminal frame.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn inbound_request_dispatches_to_host() {
        struct EchoHost;
        #[async_trait]
        impl HostHandler for EchoHost {
            async fn handle(
                &self,
                verb: &str,
                params: serde_json::Value,
            ) -> Result<serde_json::Value> {
                Ok(serde_json::json!({"verb": verb, "echo": params}))
            }
        }

        let (_connector, mut runtime) = connected_pair(Arc::new(EchoHost)).await;

        let request = ActionFrame {
            seq: 99,
            action: Some("get_query_var".into()),
            params: Some(serde_json::json!({"key": "sender_id"})),
            data: None,
            error: None,
            chunk: None,
            done: None,
        };
        runtime
            .to_connector
            .send(serde_json::to_string(&request).unwrap())
            .await
            .unwrap();

        let text = runtime.from_connector.recv().await.unwrap();
        let reply: ActionFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(reply.seq, 99);
        assert_eq!(reply.data.as_ref().unwrap()["verb"], "get_query_var");
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_calls() {
        let (connector, runtime) = connected_pair(Arc::new(NullHostHandler)).await;

        let call = tokio::spawn(async move {
            connector
                .call_action(Action::ListTools, serde_json::json!({}))
                .await
        });

        // Drop both ends of the fake runtime: either the send fails on the
        // closed transport or the dispatch loop fails the pending call.
        drop(runtime);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Plugin(_)));
    }
}
