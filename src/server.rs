//! Websocket surface for observers.
//!
//! One TCP listener, one task per client. All outbound traffic for a client
//! flows through its hub channel, so there is exactly one writer per
//! connection. Heartbeats ping every 30 s; a client that misses two
//! consecutive heartbeats is disconnected and must reconnect.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{EventSource, SessionStatus, now_ms};
use crate::hub::{ClientId, EventPipeline};
use crate::legacy;
use crate::orchestrator::OrchestratorControl;
use crate::store::SessionMeta;

/// Interval between server heartbeat pings.
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
/// Consecutive unanswered heartbeats tolerated before disconnect.
const MAX_MISSED_HEARTBEATS: u8 = 2;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Everything a client task needs.
#[derive(Clone)]
pub struct ServerContext {
    pub pipeline: EventPipeline,
    pub control: Arc<dyn OrchestratorControl>,
}

pub struct Server {
    listener: TcpListener,
    pub local_addr: SocketAddr,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept clients until cancelled.
    pub async fn run(self, ctx: ServerContext, cancel: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr, "websocket hub listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accept failed")?;
                    let ctx = ctx.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, ctx, cancel).await {
                            debug!(%peer, error = %e, "client connection ended with error");
                        }
                    });
                }
                () = cancel.cancelled() => {
                    info!("websocket hub shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    ctx: ServerContext,
    cancel: CancellationToken,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let (client_id, mut outbound) = ctx.pipeline.hub.register();

    let connected = json!({
        "type": "connected",
        "server": "ralph",
        "timestamp": now_ms(),
    });
    sink.send(Message::Text(connected.to_string().into()))
        .await?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately
    let mut missed: u8 = 0;

    let result = loop {
        tokio::select! {
            out = outbound.recv() => {
                let Some(message) = out else { break Ok(()) };
                if sink.send(Message::Text(message.to_string().into())).await.is_err() {
                    break Ok(());
                }
            }
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_text(text.as_str(), client_id, &ctx),
                Some(Ok(Message::Pong(_))) => missed = 0,
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
            },
            _ = heartbeat.tick() => {
                if missed >= MAX_MISSED_HEARTBEATS {
                    warn!(client_id, "client missed {missed} heartbeats, disconnecting");
                    break Ok(());
                }
                missed += 1;
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break Ok(());
                }
            }
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
        }
    };

    ctx.pipeline.hub.unregister(client_id);
    result
}

/// Route one inbound text frame. Malformed frames are dropped silently.
fn handle_text(text: &str, client: ClientId, ctx: &ServerContext) {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let Some(kind) = msg.get("type").and_then(Value::as_str) else {
        return;
    };

    let hub = &ctx.pipeline.hub;
    match kind {
        "ping" => {
            let _ = hub.send_to(client, json!({"type": "pong", "timestamp": now_ms()}));
        }
        "subscribe_workspace" => {
            let Some(workspace) = string_field(&msg, &["workspace", "workspaceId"]) else {
                return;
            };
            let _ = hub.subscribe_workspace(client, &workspace);
            let _ = hub.send_to(
                client,
                json!({"type": "subscribed", "workspace": workspace, "timestamp": now_ms()}),
            );
        }
        "agent:reconnect" | "reconnect" | "task-chat:reconnect" => {
            handle_reconnect(&msg, client, ctx);
        }
        "subscribe_orchestrator" => {
            let _ = hub.set_orchestrator_subscription(client, true);
        }
        "unsubscribe_orchestrator" => {
            let _ = hub.set_orchestrator_subscription(client, false);
        }
        "orchestrator_start" => ctx.control.start(),
        "orchestrator_stop" => ctx.control.stop(),
        "orchestrator_stop_after_current" => ctx.control.stop_after_current(),
        "orchestrator_cancel_stop" => ctx.control.cancel_stop_after_current(),
        "worker_pause" => with_worker(&msg, |name| ctx.control.pause_worker(name)),
        "worker_resume" => with_worker(&msg, |name| ctx.control.resume_worker(name)),
        "worker_stop" => with_worker(&msg, |name| ctx.control.stop_worker(name)),
        _ => {
            // Anything carrying an envelope (canonical or legacy) is
            // normalised and routed; the rest is dropped silently.
            if let Some(envelope) = legacy::to_canonical(&msg) {
                ingest_external(ctx, envelope);
            }
        }
    }
}

/// Answer a reconnect with the events recorded after the client's cursor,
/// then let live fan-out resume naturally.
fn handle_reconnect(msg: &Value, client: ClientId, ctx: &ServerContext) {
    let Some(instance) = string_field(msg, &["instanceId", "sessionId"]) else {
        return;
    };
    let source = string_field(msg, &["source"]).unwrap_or_else(|| "ralph".to_string());
    let store = &ctx.pipeline.store;

    let session_id = store
        .resolve_instance(&instance)
        .unwrap_or_else(|| instance.clone());

    let events = if let Some(index) = msg.get("lastEventIndex").and_then(Value::as_u64) {
        store.events_since(&session_id, index)
    } else if let Some(ts) = msg.get("lastEventTimestamp").and_then(Value::as_u64) {
        store.events_since_timestamp(&session_id, ts)
    } else {
        store.events_since(&session_id, 0)
    };
    let events = events.unwrap_or_default();

    let status = store
        .get_session(&session_id)
        .map_or(SessionStatus::Idle, |m| m.status);

    let _ = ctx.pipeline.hub.send_to(
        client,
        json!({
            "type": "agent:pending_events",
            "source": source,
            "instanceId": instance,
            "events": events,
            "totalEvents": events.len(),
            "status": status,
            "timestamp": now_ms(),
        }),
    );
}

/// Persist and fan out an envelope received from a client. A client-supplied
/// session id is accepted only when the server has no record of it yet.
fn ingest_external(ctx: &ServerContext, envelope: crate::event::EventEnvelope) {
    let store = &ctx.pipeline.store;
    let session_id = store
        .resolve_instance(&envelope.instance_id)
        .unwrap_or_else(|| envelope.instance_id.clone());

    if !store.has_session(&session_id) {
        let adapter_kind = match envelope.source {
            EventSource::Ralph => "ralph",
            EventSource::TaskChat => "task-chat",
        };
        let mut meta = SessionMeta::new(&session_id, adapter_kind, "");
        meta.workspace_id = envelope.workspace_id.clone();
        if store.save_session(meta).is_err() {
            return;
        }
    }

    if let Err(e) = ctx.pipeline.ingest(&session_id, envelope) {
        warn!(session = %session_id, error = %e, "failed to ingest client envelope");
    }
}

fn with_worker(msg: &Value, f: impl FnOnce(&str)) {
    if let Some(name) = string_field(msg, &["worker", "workerName", "name"]) {
        f(&name);
    }
}

fn string_field(msg: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| msg.get(*k).and_then(Value::as_str))
        .map(String::from)
}
