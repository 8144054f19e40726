//! In-memory publish/subscribe broker for real-time subscribers.
//!
//! A single actor task owns the client set and the channel index; everything
//! else talks to it through a cloneable [`HubHandle`].

pub mod bridge;
pub mod ws;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provisioner::protocol::ParsedLog;
use crate::workspace::{logs_channel, status_channel, Workspace, WorkspaceStatus};

pub const STATUS_EVENT: &str = "workspace_status";
pub const LOG_EVENT: &str = "workspace_log";
pub const CREATED_EVENT: &str = "workspace_created";
pub const CHAT_EVENT: &str = "chat";

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// Frame delivered to subscribers and carried on the durable bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event_type: String,
    pub channel: String,
    pub data: Value,
}

impl EventFrame {
    pub fn status(workspace_id: u64, status: WorkspaceStatus, url: Option<&str>) -> Self {
        Self {
            event_type: STATUS_EVENT.to_string(),
            channel: status_channel(workspace_id),
            data: json!({ "status": status, "url": url }),
        }
    }

    pub fn log(workspace_id: u64, log: &ParsedLog) -> Self {
        Self {
            event_type: LOG_EVENT.to_string(),
            channel: logs_channel(workspace_id),
            data: json!({
                "workspace_id": workspace_id,
                "time": log.time,
                "type": log.log_type,
                "text": log.text,
            }),
        }
    }

    pub fn created(workspace: &Workspace) -> Self {
        Self {
            event_type: CREATED_EVENT.to_string(),
            channel: status_channel(workspace.id),
            data: json!({
                "id": workspace.id,
                "fingerprint": workspace.fingerprint,
                "status": workspace.status,
            }),
        }
    }

    pub fn chat(channel: &str, data: Value) -> Self {
        Self {
            event_type: CHAT_EVENT.to_string(),
            channel: channel.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
    Chat,
}

/// Inbound command from a subscriber.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlFrame {
    pub action: ControlAction,
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Hub actor
// ---------------------------------------------------------------------------

pub type ClientId = u64;

/// Serialized frame shared by every recipient of one broadcast.
pub type Outbound = Arc<str>;

enum Command {
    Register {
        id: ClientId,
        tx: mpsc::Sender<Outbound>,
    },
    Unregister(ClientId),
    Subscribe {
        id: ClientId,
        channel: String,
    },
    Unsubscribe {
        id: ClientId,
        channel: String,
    },
    Broadcast(EventFrame),
    Stats(oneshot::Sender<HubStats>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub clients: usize,
    /// Subscriber count per live channel.
    pub channels: BTreeMap<String, usize>,
}

pub struct Hub {
    commands: mpsc::UnboundedReceiver<Command>,
    clients: HashMap<ClientId, mpsc::Sender<Outbound>>,
    channels: HashMap<String, HashSet<ClientId>>,
    memberships: HashMap<ClientId, HashSet<String>>,
}

/// Cloneable entry point to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    send_buffer: usize,
}

impl Hub {
    /// Create the actor and its handle. `send_buffer` bounds each subscriber's
    /// outbound queue.
    pub fn new(send_buffer: usize) -> (Hub, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Hub {
            commands: rx,
            clients: HashMap::new(),
            channels: HashMap::new(),
            memberships: HashMap::new(),
        };
        let handle = HubHandle {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            send_buffer: send_buffer.max(1),
        };
        (hub, handle)
    }

    /// Process commands until cancelled or every handle is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.apply(command);
                }
            }
        }
        debug!(clients = self.clients.len(), "hub stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register { id, tx } => {
                self.clients.insert(id, tx);
                debug!(client = id, "subscriber registered");
            }
            Command::Unregister(id) => {
                if self.remove_client(id) {
                    debug!(client = id, "subscriber unregistered");
                }
            }
            Command::Subscribe { id, channel } => {
                if !self.clients.contains_key(&id) {
                    return;
                }
                self.channels.entry(channel.clone()).or_default().insert(id);
                self.memberships.entry(id).or_default().insert(channel);
            }
            Command::Unsubscribe { id, channel } => {
                self.leave(id, &channel);
                if let Some(joined) = self.memberships.get_mut(&id) {
                    joined.remove(&channel);
                }
            }
            Command::Broadcast(frame) => self.broadcast(frame),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn broadcast(&mut self, frame: EventFrame) {
        let Some(members) = self.channels.get(&frame.channel) else {
            return;
        };
        let payload: Outbound = match serde_json::to_string(&frame) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(channel = %frame.channel, "failed to encode frame: {}", e);
                return;
            }
        };

        let slow: Vec<ClientId> = members
            .iter()
            .filter(|id| {
                self.clients
                    .get(id)
                    .is_none_or(|tx| tx.try_send(payload.clone()).is_err())
            })
            .copied()
            .collect();

        for id in slow {
            warn!(client = id, channel = %frame.channel, "dropping slow subscriber");
            self.remove_client(id);
        }
    }

    /// Forget `id` everywhere. Dropping its sender closes the outbound queue.
    fn remove_client(&mut self, id: ClientId) -> bool {
        let known = self.clients.remove(&id).is_some();
        for channel in self.memberships.remove(&id).unwrap_or_default() {
            self.leave(id, &channel);
        }
        known
    }

    fn leave(&mut self, id: ClientId, channel: &str) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            clients: self.clients.len(),
            channels: self
                .channels
                .iter()
                .map(|(name, members)| (name.clone(), members.len()))
                .collect(),
        }
    }
}

impl HubHandle {
    /// Add a subscriber and return its id and outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.send_buffer);
        self.send(Command::Register { id, tx });
        (id, rx)
    }

    /// Remove a subscriber from every channel.
    pub fn unregister(&self, id: ClientId) {
        self.send(Command::Unregister(id));
    }

    pub fn subscribe(&self, id: ClientId, channel: &str) {
        self.send(Command::Subscribe {
            id,
            channel: channel.to_string(),
        });
    }

    pub fn unsubscribe(&self, id: ClientId, channel: &str) {
        self.send(Command::Unsubscribe {
            id,
            channel: channel.to_string(),
        });
    }

    /// Deliver `frame` to the current subscribers of `frame.channel`.
    pub fn broadcast(&self, frame: EventFrame) {
        self.send(Command::Broadcast(frame));
    }

    /// Relay a subscriber's chat payload to everyone on `channel`.
    pub fn chat(&self, channel: &str, data: Value) {
        self.broadcast(EventFrame::chat(channel, data));
    }

    /// Snapshot of the hub's indices, or `None` once the hub has stopped.
    pub async fn stats(&self) -> Option<HubStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx));
        rx.await.ok()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("hub is not running, command dropped");
        }
    }
}
