//! Connection registry
//!
//! Tracks identified overlay sockets, indexed by socket id and by
//! `"userId:addonId"`. Both indexes sit behind one lock and are updated in
//! the same critical section.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{owner_addon_key, ConnectionHandle, ConnectionRecord, Identification, ServerMessage};

/// Outcome of [`ConnectionRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    Registered,
    /// The socket already had a record; the first one was kept
    Duplicate,
}

#[derive(Default)]
struct Indexes {
    by_connection: HashMap<String, ConnectionRecord>,
    by_owner_addon: HashMap<String, Vec<ConnectionRecord>>,
}

/// Registry of live, identified overlay connections
#[derive(Default)]
pub struct ConnectionRegistry {
    indexes: RwLock<Indexes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: ConnectionHandle, ident: Identification) -> RegisterResult {
        let mut indexes = self.indexes.write().await;

        if indexes.by_connection.contains_key(handle.socket_id()) {
            warn!(
                socket_id = %handle.socket_id(),
                overlay_id = %ident.overlay_id,
                "Duplicate overlay identification, keeping the first"
            );
            return RegisterResult::Duplicate;
        }

        let record = ConnectionRecord {
            socket_id: handle.socket_id().to_string(),
            overlay_id: ident.overlay_id,
            addon_id: ident.addon_id,
            owner: ident.owner,
            handle,
        };

        indexes
            .by_owner_addon
            .entry(record.owner_addon_key())
            .or_default()
            .push(record.clone());
        indexes
            .by_connection
            .insert(record.socket_id.clone(), record.clone());

        debug!(
            socket_id = %record.socket_id,
            owner = %record.owner.user_id,
            addon_id = %record.addon_id,
            count = indexes.by_connection.len(),
            "Registered overlay connection"
        );
        RegisterResult::Registered
    }

    /// Forget a socket; unknown ids are a warning, not an error
    pub async fn unregister(&self, socket_id: &str) -> Option<ConnectionRecord> {
        let mut indexes = self.indexes.write().await;

        let Some(record) = indexes.by_connection.remove(socket_id) else {
            warn!(socket_id, "Tried to unregister an unknown overlay connection");
            return None;
        };

        let key = record.owner_addon_key();
        if let Some(list) = indexes.by_owner_addon.get_mut(&key) {
            list.retain(|r| r.socket_id != socket_id);
            if list.is_empty() {
                indexes.by_owner_addon.remove(&key);
            }
        }

        debug!(
            socket_id,
            count = indexes.by_connection.len(),
            "Unregistered overlay connection"
        );
        Some(record)
    }

    pub async fn lookup_by_connection(&self, socket_id: &str) -> Option<ConnectionRecord> {
        self.indexes.read().await.by_connection.get(socket_id).cloned()
    }

    pub async fn lookup_by_owner_and_addon(
        &self,
        user_id: &str,
        addon_id: &str,
    ) -> Vec<ConnectionRecord> {
        self.indexes
            .read()
            .await
            .by_owner_addon
            .get(&owner_addon_key(user_id, addon_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        self.indexes.read().await.by_connection.len()
    }

    /// Push a message to every open overlay of this user's addon
    ///
    /// Returns how many sockets accepted the message.
    pub async fn send_to_owner(&self, user_id: &str, addon_id: &str, message: ServerMessage) -> usize {
        let records = self.lookup_by_owner_and_addon(user_id, addon_id).await;
        records
            .iter()
            .filter(|r| r.handle.send(message.clone()))
            .count()
    }
}
