//! Host side of the client message protocol.
//!
//! Remote UI clients talk to the host with three JSON messages keyed by a
//! dot-separated state path:
//!
//! ```text
//! {"command": "getState",    "key": "view.tools"}
//! {"command": "updateState", "key": "view.tools", "data": [...]}
//! {"command": "stateUpdate", "key": "view.tools", "data": [...]}
//! ```
//!
//! The transport itself is out of scope: each connected client is handed a
//! bounded channel of outbound [`Message`]s to forward however it likes.

use crate::error::{Result, StoreError};
use crate::store::StateStore;
use crate::subscriptions::SubscriptionId;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Default outbound buffer per client.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// A protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Message {
    /// Client asks for the current value at `key`.
    GetState { key: String },
    /// Client asks the host to set `key` to `data`.
    UpdateState { key: String, data: Value },
    /// Host tells a client the value at `key`.
    StateUpdate { key: String, data: Value },
}

impl Message {
    pub fn key(&self) -> &str {
        match self {
            Message::GetState { key }
            | Message::UpdateState { key, .. }
            | Message::StateUpdate { key, .. } => key,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StoreError::InvalidFormat(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Identifies a connected client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The receiving end handed to a connected client.
///
/// The channel disconnects once the client is dropped by the bridge.
pub struct ClientHandle {
    pub id: ClientId,
    /// Outbound messages for this client.
    pub receiver: Receiver<Message>,
}

impl ClientHandle {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> std::result::Result<Message, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Message, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Message, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Why a client was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DropReason {
    /// Outbound buffer overflowed (slow consumer).
    BufferOverflow,
    /// Receiver went away.
    Disconnected,
}

struct Client {
    sender: Sender<Message>,
    watches: Vec<SubscriptionId>,
}

impl Client {
    /// Try to send a message. `Err` means the client must be dropped.
    fn try_send(&self, message: Message) -> std::result::Result<(), DropReason> {
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DropReason::BufferOverflow),
            Err(TrySendError::Disconnected(_)) => Err(DropReason::Disconnected),
        }
    }
}

type ClientMap = RwLock<HashMap<ClientId, Client>>;

/// Routes protocol messages between clients and a [`StateStore`].
pub struct MessageBridge {
    store: Arc<StateStore>,
    clients: Arc<ClientMap>,
    next_id: AtomicU64,
}

impl MessageBridge {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Register a client with an outbound buffer of `buffer` messages.
    pub fn connect(&self, buffer: usize) -> ClientHandle {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(buffer);
        self.clients.write().insert(
            id,
            Client {
                sender,
                watches: Vec::new(),
            },
        );
        tracing::debug!(client = %id, buffer, "client connected");
        ClientHandle { id, receiver }
    }

    /// Push a `stateUpdate` to `client` whenever the value at `key` changes.
    pub fn watch(&self, client: ClientId, key: &str) -> Result<SubscriptionId> {
        if !self.clients.read().contains_key(&client) {
            return Err(StoreError::ClientNotConnected(client.0));
        }

        let clients = Arc::downgrade(&self.clients);
        let store = Arc::downgrade(&self.store);
        let watched = key.to_string();
        let subscription = self.store.subscribe_value(key, move |value| {
            forward(&clients, &store, client, &watched, value);
        })?;

        match self.clients.write().get_mut(&client) {
            Some(entry) => {
                entry.watches.push(subscription);
                Ok(subscription)
            }
            None => {
                self.store.unsubscribe(subscription);
                Err(StoreError::ClientNotConnected(client.0))
            }
        }
    }

    /// Process one inbound message from `client`.
    pub fn handle(&self, client: ClientId, message: Message) -> Result<()> {
        if !self.clients.read().contains_key(&client) {
            return Err(StoreError::ClientNotConnected(client.0));
        }

        match message {
            Message::GetState { key } => {
                let data = self.store.get(&key).unwrap_or(Value::Null);
                self.send(client, Message::StateUpdate { key, data })
            }
            Message::UpdateState { key, data } => {
                tracing::trace!(client = %client, key = %key, "client update");
                self.store.set_path(&key, data)?;
                Ok(())
            }
            Message::StateUpdate { key, .. } => Err(StoreError::InvalidFormat(format!(
                "stateUpdate for {:?} is host-to-client only",
                key
            ))),
        }
    }

    /// Parse and process one inbound JSON message.
    pub fn handle_json(&self, client: ClientId, text: &str) -> Result<()> {
        self.handle(client, Message::from_json(text)?)
    }

    /// Remove a client and its watches. Returns whether it was connected.
    pub fn disconnect(&self, client: ClientId) -> bool {
        let removed = self.clients.write().remove(&client);
        match removed {
            Some(entry) => {
                for subscription in entry.watches {
                    self.store.unsubscribe(subscription);
                }
                tracing::debug!(client = %client, "client disconnected");
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn send(&self, client: ClientId, message: Message) -> Result<()> {
        let outcome = match self.clients.read().get(&client) {
            Some(entry) => entry.try_send(message),
            None => return Err(StoreError::ClientNotConnected(client.0)),
        };
        if let Err(reason) = outcome {
            drop_client(&self.clients, &self.store, client, reason);
        }
        Ok(())
    }
}

/// Value listener body for a watch.
fn forward(
    clients: &Weak<ClientMap>,
    store: &Weak<StateStore>,
    client: ClientId,
    key: &str,
    value: &Value,
) {
    let Some(clients) = clients.upgrade() else {
        return;
    };
    let outcome = match clients.read().get(&client) {
        Some(entry) => entry.try_send(Message::StateUpdate {
            key: key.to_string(),
            data: value.clone(),
        }),
        None => return,
    };
    if let Err(reason) = outcome {
        if let Some(store) = store.upgrade() {
            drop_client(&clients, &store, client, reason);
        }
    }
}

fn drop_client(clients: &ClientMap, store: &StateStore, client: ClientId, reason: DropReason) {
    let removed = clients.write().remove(&client);
    if let Some(entry) = removed {
        for subscription in entry.watches {
            store.unsubscribe(subscription);
        }
        tracing::warn!(client = %client, reason = ?reason, "dropping client");
    }
}
