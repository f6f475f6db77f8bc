//! `GET /ws`: full-duplex client connection.
//!
//! Each socket is split into a reader loop (this task) and a writer task fed
//! by a channel. The channel end is registered with the
//! [`ConnectionManager`](crate::connection::ConnectionManager), so broadcasts
//! never wait on the network.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use slowhands_core::error::DeliveryError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::SharedState;
use crate::connection::{ConnectionSink, short_id};
use crate::files;
use crate::protocol::{ClientMessage, ServerEvent, parse_client_message};
use crate::service::stop_id;

enum Outbound {
    Event(Value),
    Ping,
}

/// Channel-backed sink; fails once the writer task has gone.
struct WsSink {
    connection_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl ConnectionSink for WsSink {
    async fn send(&self, event: &Value) -> Result<(), DeliveryError> {
        self.tx
            .send(Outbound::Event(event.clone()))
            .map_err(|_| DeliveryError::Closed(self.connection_id.clone()))
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        self.tx
            .send(Outbound::Ping)
            .map_err(|_| DeliveryError::Closed(self.connection_id.clone()))
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: SharedState) {
    let connection_id = short_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let frame = match out {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => WsMessage::Text(json.into()),
                    Err(e) => {
                        warn!(
                            connection_id = %writer_id,
                            error = %e,
                            "Dropping unserializable event"
                        );
                        continue;
                    }
                },
                Outbound::Ping => WsMessage::Ping(Bytes::new()),
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let sink = Arc::new(WsSink {
        connection_id: connection_id.clone(),
        tx,
    });
    state.connections.connect(connection_id.clone(), sink).await;
    info!(connection_id = %connection_id, "WebSocket connection established");

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = receiver.next() => msg,
        };
        match msg {
            Some(Ok(WsMessage::Text(text))) => {
                handle_text(&state, &connection_id, text.as_str()).await
            }
            Some(Ok(WsMessage::Pong(_))) => {
                if let Some(ms) = state.connections.update_ping(&connection_id).await {
                    debug!(connection_id = %connection_id, latency_ms = ms, "Pong received");
                }
            }
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
            // Binary frames and client pings count as activity only.
            Some(Ok(_)) => state.connections.update_activity(&connection_id).await,
        }
    }

    state.connections.disconnect(&connection_id).await;
    state.sessions.unlink_connection(&connection_id);
    writer.abort();
    info!(connection_id = %connection_id, "WebSocket connection closed");
}

async fn reply(state: &SharedState, connection_id: &str, event: ServerEvent) {
    if let Err(e) = state.connections.send_to(connection_id, &event.to_value()).await {
        debug!(connection_id, error = %e, "Reply not delivered");
    }
}

async fn handle_text(state: &SharedState, connection_id: &str, text: &str) {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(e) => {
            state.connections.update_activity(connection_id).await;
            reply(state, connection_id, ServerEvent::error(e.to_string(), None)).await;
            return;
        }
    };

    match message {
        ClientMessage::Chat { content, correlation_id } => {
            state.connections.update_activity(connection_id).await;
            let session_id = state.sessions.session_for_connection(connection_id);
            match state.service.start_stream(content, correlation_id.clone(), session_id) {
                Ok(cid) => info!(cid = %cid, connection_id, "Chat request accepted"),
                Err(e) => {
                    warn!(connection_id, error = %e, "Chat request rejected");
                    let event = ServerEvent::error(e.to_string(), correlation_id);
                    reply(state, connection_id, event).await;
                }
            }
        }
        ClientMessage::Stop { correlation_id } => {
            state.connections.update_activity(connection_id).await;
            let cid = correlation_id.unwrap_or_else(stop_id);
            if let Err(e) = state.service.stop(Some(cid.clone())).await {
                reply(state, connection_id, ServerEvent::error(e.to_string(), Some(cid))).await;
            }
        }
        ClientMessage::Ping { correlation_id } => {
            state.connections.update_activity(connection_id).await;
            reply(state, connection_id, ServerEvent::Pong { correlation_id }).await;
        }
        ClientMessage::Pong { .. } => {
            state.connections.update_ping(connection_id).await;
        }
        ClientMessage::OpenFile { path, correlation_id } => {
            state.connections.update_activity(connection_id).await;
            let workspace = state.workspace.clone();
            let requested = path.clone();
            let read =
                tokio::task::spawn_blocking(move || files::read_file(&workspace, &requested)).await;
            let event = match read {
                Ok(Ok(file)) => ServerEvent::FileContent {
                    path: file.path,
                    content: file.content,
                    size: file.size,
                    lines: file.lines,
                    correlation_id,
                },
                Ok(Err(e)) => ServerEvent::error(e.to_string(), correlation_id),
                Err(e) => ServerEvent::error(format!("Error reading file: {e}"), correlation_id),
            };
            reply(state, connection_id, event).await;
        }
        ClientMessage::ResumeSession {
            session_id,
            last_correlation_id,
            correlation_id,
        } => {
            state.connections.update_activity(connection_id).await;
            let (session, is_new) = state.sessions.get_or_create_session(&session_id);
            state.sessions.link_connection_to_session(&session_id, connection_id);
            if !is_new {
                state.connections.record_reconnect(connection_id).await;
            }
            let pending = state
                .sessions
                .get_pending_messages(&session_id, last_correlation_id.as_deref());
            info!(
                connection_id,
                session_id = %session_id,
                is_new,
                pending = pending.len(),
                "Session resumed"
            );

            reply(
                state,
                connection_id,
                ServerEvent::SessionState {
                    session_id: session.session_id,
                    is_new,
                    agent_running: session.agent_running,
                    last_correlation_id: session.last_correlation_id,
                    pending_messages: pending.len(),
                    correlation_id,
                },
            )
            .await;
            for event in pending {
                if state.connections.send_to(connection_id, &event).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::service::AgentService;
    use crate::session::SessionRegistry;
    use crate::GatewayState;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<Value>>);

    #[async_trait]
    impl ConnectionSink for MemorySink {
        async fn send(&self, event: &Value) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    async fn state_with_client(workspace: &std::path::Path) -> (SharedState, Arc<MemorySink>) {
        let connections = Arc::new(ConnectionManager::new(100, Duration::from_secs(300)));
        let sessions = Arc::new(SessionRegistry::new(100));
        let service = Arc::new(AgentService::new(None, connections.clone(), sessions.clone()));
        let state = Arc::new(GatewayState {
            service,
            connections,
            sessions,
            workspace: workspace.to_path_buf(),
            shutdown: CancellationToken::new(),
        });
        let sink = Arc::new(MemorySink::default());
        state.connections.connect("c1", sink.clone()).await;
        (state, sink)
    }

    fn last(sink: &MemorySink) -> Value {
        sink.0.lock().unwrap().last().cloned().unwrap()
    }

    #[tokio::test]
    async fn bad_frames_get_error_replies() {
        let dir = tempfile::tempdir().unwrap();
        let (state, sink) = state_with_client(dir.path()).await;

        handle_text(&state, "c1", "not json").await;
        assert_eq!(last(&sink)["content"], "Invalid JSON");

        handle_text(&state, "c1", r#"{"type":"dance"}"#).await;
        assert_eq!(last(&sink)["content"], "Unknown message type: dance");
        assert_eq!(last(&sink)["type"], "error");
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let dir = tempfile::tempdir().unwrap();
        let (state, sink) = state_with_client(dir.path()).await;
        handle_text(&state, "c1", r#"{"type":"ping","correlation_id":"p1"}"#).await;
        assert_eq!(last(&sink), json!({"type": "pong", "correlation_id": "p1"}));
    }

    #[tokio::test(start_paused = true)]
    async fn client_ping_leaves_keepalive_timing_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _sink) = state_with_client(dir.path()).await;
        state.connections.record_ping_sent("c1").await;
        tokio::time::advance(Duration::from_millis(30)).await;

        handle_text(&state, "c1", r#"{"type":"ping"}"#).await;
        let stats = state.connections.connection_stats().await;
        assert_eq!(stats[0].last_ping_latency_ms, None);
        assert_eq!(stats[0].last_ping_seconds_ago, None);

        // The server's ping is still outstanding, so the pong is timed against it.
        handle_text(&state, "c1", r#"{"type":"pong"}"#).await;
        let stats = state.connections.connection_stats().await;
        assert_eq!(stats[0].last_ping_latency_ms, Some(30.0));
    }

    #[tokio::test]
    async fn open_file_inside_and_outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.py"), "a = 1\nb = 2\n").unwrap();
        let (state, sink) = state_with_client(dir.path()).await;

        handle_text(&state, "c1", r#"{"type":"open_file","path":"calc.py"}"#).await;
        let reply = last(&sink);
        assert_eq!(reply["type"], "file_content");
        assert_eq!(reply["lines"], 3);

        handle_text(&state, "c1", r#"{"type":"open_file","path":"../../etc/passwd"}"#).await;
        assert_eq!(last(&sink)["content"], "Access denied: path outside workspace");

        handle_text(&state, "c1", r#"{"type":"open_file","path":"missing.py"}"#).await;
        assert_eq!(last(&sink)["content"], "File not found: missing.py");
    }

    #[tokio::test]
    async fn chat_without_agent_is_reported_to_requester() {
        let dir = tempfile::tempdir().unwrap();
        let (state, sink) = state_with_client(dir.path()).await;
        let frame = r#"{"type":"chat","content":"hi","correlation_id":"req_x"}"#;
        handle_text(&state, "c1", frame).await;
        let reply = last(&sink);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["correlation_id"], "req_x");
    }

    #[tokio::test]
    async fn resume_session_replays_missed_events() {
        let dir = tempfile::tempdir().unwrap();
        let (state, sink) = state_with_client(dir.path()).await;
        state.sessions.get_or_create_session("s1");
        for (cid, n) in [("req_a", 1), ("req_b", 1), ("req_b", 2)] {
            let event = json!({"type": "step", "step_number": n, "correlation_id": cid});
            state.sessions.record_message("s1", event);
        }

        handle_text(
            &state,
            "c1",
            r#"{"type":"resume_session","session_id":"s1","last_correlation_id":"req_a"}"#,
        )
        .await;

        let received = sink.0.lock().unwrap().clone();
        assert_eq!(received.len(), 3);
        assert_eq!(received[0]["type"], "session_state");
        assert_eq!(received[0]["is_new"], false);
        assert_eq!(received[0]["pending_messages"], 2);
        assert_eq!(received[1]["step_number"], 1);
        assert_eq!(received[2]["step_number"], 2);

        assert_eq!(state.sessions.session_for_connection("c1").as_deref(), Some("s1"));
        let info = state.connections.connection_info("c1").await.unwrap();
        assert_eq!(info.reconnect_count, 1);
    }
}
