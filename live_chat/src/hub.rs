use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chat_protocol::ServerEvent;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// A serialized server event, shared between every recipient of a broadcast.
pub type Frame = Arc<str>;
pub type Outbound = mpsc::Sender<Frame>;

/// Broadcast scope. Every authenticated connection sits on its owner's
/// private `User` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Conversation(Uuid),
    User(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct Connection {
    user_id: Uuid,
    tx: Outbound,
    channels: HashSet<Channel>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    channels: HashMap<Channel, HashSet<ConnectionId>>,
}

impl Registry {
    fn join(&mut self, id: ConnectionId, channel: Channel) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        conn.channels.insert(channel);
        self.channels.entry(channel).or_default().insert(id);
        true
    }

    fn leave(&mut self, id: ConnectionId, channel: Channel) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.channels.remove(&channel);
        }
        if let Some(members) = self.channels.get_mut(&channel) {
            members.remove(&id);
            if members.is_empty() {
                self.channels.remove(&channel);
            }
        }
    }

    fn user_connections(&self, user_id: Uuid) -> Vec<ConnectionId> {
        self.channels
            .get(&Channel::User(user_id))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        for channel in &conn.channels {
            if let Some(members) = self.channels.get_mut(channel) {
                members.remove(&id);
                if members.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }
        Some(conn)
    }
}

/// Registry of live connections and their channel subscriptions.
///
/// The lock guards map updates and sender snapshots only; delivery happens
/// after it is released and never waits on a slow peer.
#[derive(Default)]
pub struct Hub {
    inner: RwLock<Registry>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `user_id`, already subscribed to its user channel.
    pub fn register(&self, user_id: Uuid, tx: Outbound) -> ConnectionId {
        let id = ConnectionId(Uuid::new_v4());
        let mut reg = self.inner.write();
        reg.connections.insert(
            id,
            Connection {
                user_id,
                tx,
                channels: HashSet::new(),
            },
        );
        reg.join(id, Channel::User(user_id));
        id
    }

    /// Returns false when the connection is no longer registered.
    pub fn subscribe(&self, id: ConnectionId, channel: Channel) -> bool {
        self.inner.write().join(id, channel)
    }

    pub fn unsubscribe(&self, id: ConnectionId, channel: Channel) {
        self.inner.write().leave(id, channel);
    }

    pub fn is_subscribed(&self, id: ConnectionId, channel: Channel) -> bool {
        self.inner
            .read()
            .connections
            .get(&id)
            .map_or(false, |c| c.channels.contains(&channel))
    }

    /// Subscribe every live connection of `user_id`. Returns how many were.
    pub fn subscribe_user(&self, user_id: Uuid, channel: Channel) -> usize {
        let mut reg = self.inner.write();
        let ids = reg.user_connections(user_id);
        ids.into_iter().filter(|id| reg.join(*id, channel)).count()
    }

    pub fn unsubscribe_user(&self, user_id: Uuid, channel: Channel) -> usize {
        let mut reg = self.inner.write();
        let ids = reg.user_connections(user_id);
        let count = ids.len();
        for id in ids {
            reg.leave(id, channel);
        }
        count
    }

    /// Drop a connection and every subscription it holds.
    pub fn release(&self, id: ConnectionId) {
        if let Some(conn) = self.inner.write().remove(id) {
            tracing::debug!(connection = %id, user_id = %conn.user_id, "connection released");
        }
    }

    /// Deliver `event` to every subscriber of `channel` except `except`.
    /// Returns the number of queues that accepted it.
    pub fn publish(&self, channel: Channel, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        let frame: Frame = match serde_json::to_string(event) {
            Ok(s) => s.into(),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode event");
                return 0;
            }
        };
        let targets: Vec<(ConnectionId, Outbound)> = {
            let reg = self.inner.read();
            let Some(members) = reg.channels.get(&channel) else {
                return 0;
            };
            members
                .iter()
                .filter(|id| Some(**id) != except)
                .filter_map(|id| reg.connections.get(id).map(|c| (*id, c.tx.clone())))
                .collect()
        };
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(connection = %id, ?channel, "outbound queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }
        if !closed.is_empty() {
            let mut reg = self.inner.write();
            for id in closed {
                reg.remove(id);
            }
        }
        tracing::debug!(?channel, delivered, "event published");
        delivered
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.inner
            .read()
            .channels
            .get(&channel)
            .map_or(0, HashSet::len)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }
}
