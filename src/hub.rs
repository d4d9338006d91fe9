//! Event hub: per-workspace pub/sub over connected observer channels.
//!
//! The hub is an explicit value passed wherever it is needed; its lifecycle
//! is bound to the server process. Subscriber bookkeeping sits behind a
//! short write lock; each client has a single writer task fed by its own
//! channel, so fan-out never blocks on a slow peer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::event::EventEnvelope;
use crate::legacy;
use crate::store::{SessionStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("client {0} is not subscribed")]
    Unsubscribed(u64),
    #[error("client {0} is gone")]
    PeerGone(u64),
}

pub type ClientId = u64;

struct ClientHandle {
    tx: mpsc::UnboundedSender<Value>,
    /// Workspace subscriptions; empty means "everything".
    workspaces: HashSet<String>,
    /// Receives orchestrator lifecycle events.
    orchestrator: bool,
}

#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<RwLock<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    clients: HashMap<ClientId, ClientHandle>,
    next_id: ClientId,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client channel. The receiver feeds the client's single
    /// writer task.
    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.clients.insert(
            id,
            ClientHandle {
                tx,
                workspaces: HashSet::new(),
                orchestrator: false,
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, id: ClientId) {
        self.inner.write().clients.remove(&id);
    }

    /// Add a workspace subscription. Subscriptions are additive.
    pub fn subscribe_workspace(&self, id: ClientId, workspace: &str) -> Result<(), HubError> {
        let mut inner = self.inner.write();
        let client = inner.clients.get_mut(&id).ok_or(HubError::PeerGone(id))?;
        client.workspaces.insert(workspace.to_string());
        Ok(())
    }

    pub fn set_orchestrator_subscription(
        &self,
        id: ClientId,
        subscribed: bool,
    ) -> Result<(), HubError> {
        let mut inner = self.inner.write();
        let client = inner.clients.get_mut(&id).ok_or(HubError::PeerGone(id))?;
        client.orchestrator = subscribed;
        Ok(())
    }

    /// Send a message to one client.
    pub fn send_to(&self, id: ClientId, message: Value) -> Result<(), HubError> {
        let inner = self.inner.read();
        let client = inner.clients.get(&id).ok_or(HubError::PeerGone(id))?;
        client.tx.send(message).map_err(|_| HubError::PeerGone(id))
    }

    /// Fan an envelope out to every matching client, in canonical shape and
    /// (while the compatibility window lasts) its legacy mirror.
    pub fn publish(&self, envelope: &EventEnvelope) {
        let Ok(canonical) = serde_json::to_value(envelope) else {
            return;
        };
        let mirror = legacy::to_legacy(envelope);

        let inner = self.inner.read();
        for client in inner.clients.values() {
            let matches = if client.workspaces.is_empty() {
                true
            } else {
                envelope
                    .workspace_id
                    .as_ref()
                    .is_some_and(|w| client.workspaces.contains(w))
            };
            if !matches {
                continue;
            }
            let _ = client.tx.send(canonical.clone());
            if let Some(ref legacy_msg) = mirror {
                let _ = client.tx.send(legacy_msg.clone());
            }
        }
    }

    /// Deliver an orchestrator lifecycle event to subscribed clients.
    pub fn publish_orchestrator(&self, message: &Value) {
        let inner = self.inner.read();
        for client in inner.clients.values() {
            if client.orchestrator {
                let _ = client.tx.send(message.clone());
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.read().clients.len()
    }
}

/// Persistence-then-fan-out: the store assigns the `eventIndex`, the hub
/// delivers the indexed envelope. Per-session envelope order is the
/// persistence order.
#[derive(Clone)]
pub struct EventPipeline {
    pub store: Arc<SessionStore>,
    pub hub: Hub,
}

impl EventPipeline {
    pub fn new(store: Arc<SessionStore>, hub: Hub) -> Self {
        Self { store, hub }
    }

    /// Append to the session's log, then publish with the assigned index.
    pub fn ingest(
        &self,
        session_id: &str,
        mut envelope: EventEnvelope,
    ) -> Result<u64, StoreError> {
        let index = self.store.append_event(session_id, envelope.clone())?;
        envelope.event_index = Some(index);
        self.hub.publish(&envelope);
        Ok(index)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::{AgentEvent, EventSource, SessionStatus};
    use crate::store::SessionMeta;
    use tempfile::TempDir;

    fn envelope(workspace: Option<&str>) -> EventEnvelope {
        EventEnvelope::new(
            EventSource::Ralph,
            "homer",
            workspace.map(String::from),
            AgentEvent::status(SessionStatus::Running),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(v) = rx.try_recv() {
            out.push(v);
        }
        out
    }

    #[test]
    fn unsubscribed_clients_receive_everything() {
        let hub = Hub::new();
        let (_id, mut rx) = hub.register();

        hub.publish(&envelope(Some("ws-1")));
        hub.publish(&envelope(None));

        // Two envelopes, each mirrored in legacy shape
        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[test]
    fn workspace_subscription_filters_envelopes() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        hub.subscribe_workspace(id, "ws-1").unwrap();

        hub.publish(&envelope(Some("ws-1")));
        hub.publish(&envelope(Some("ws-2")));
        hub.publish(&envelope(None));

        let got = drain(&mut rx);
        assert_eq!(got.len(), 2); // canonical + legacy for ws-1 only
        assert!(got.iter().all(|v| v["instanceId"] == "homer"));
    }

    #[test]
    fn subscriptions_are_additive() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        hub.subscribe_workspace(id, "ws-1").unwrap();
        hub.subscribe_workspace(id, "ws-2").unwrap();

        hub.publish(&envelope(Some("ws-1")));
        hub.publish(&envelope(Some("ws-2")));

        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[test]
    fn publish_emits_canonical_and_legacy_shapes() {
        let hub = Hub::new();
        let (_id, mut rx) = hub.register();

        hub.publish(&envelope(None));

        let got = drain(&mut rx);
        assert_eq!(got[0]["type"], "agent:event");
        assert_eq!(got[1]["type"], "ralph:event");
    }

    #[test]
    fn orchestrator_events_reach_only_subscribers() {
        let hub = Hub::new();
        let (watcher, mut watcher_rx) = hub.register();
        let (_other, mut other_rx) = hub.register();
        hub.set_orchestrator_subscription(watcher, true).unwrap();

        hub.publish_orchestrator(&serde_json::json!({"type": "worker_started"}));

        assert_eq!(drain(&mut watcher_rx).len(), 1);
        assert!(drain(&mut other_rx).is_empty());
    }

    #[test]
    fn unregister_stops_delivery() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        hub.unregister(id);

        hub.publish(&envelope(None));
        assert!(drain(&mut rx).is_empty());
        assert!(matches!(
            hub.send_to(id, Value::Null),
            Err(HubError::PeerGone(_))
        ));
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn pipeline_assigns_the_index_before_fan_out() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::open(tmp.path()).unwrap());
        store
            .save_session(SessionMeta::new("s-1", "claude", "/tmp"))
            .unwrap();
        let hub = Hub::new();
        let (_id, mut rx) = hub.register();
        let pipeline = EventPipeline::new(Arc::clone(&store), hub);

        let first = pipeline.ingest("s-1", envelope(None)).unwrap();
        let second = pipeline.ingest("s-1", envelope(None)).unwrap();
        assert_eq!((first, second), (1, 2));

        let got = drain(&mut rx);
        assert_eq!(got[0]["eventIndex"], 1);
        assert_eq!(got[2]["eventIndex"], 2);
    }
}
