//! Process-wide lookup of live connections.
//!
//! Two maps: `connections` owns the handles, `by_user` is an index of
//! connection ids per user. Every id in `by_user[u]` is a key of
//! `connections` whose handle belongs to `u`, and a user key is dropped as
//! soon as its last connection goes.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::connection::ConnectionHandle;
use crate::types::{ConnectionId, UserId};

/// Shared registry of live connections.
///
/// Mutations take both write locks, always `connections` first, so a
/// lookup never sees a connection that is indexed but not stored. Lookups
/// take one read lock at a time.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    by_user: RwLock<HashMap<UserId, HashSet<ConnectionId>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a connection and indexes it under its user.
    ///
    /// An existing entry with the same id is overwritten; ids are generated
    /// fresh per registration so this only happens on caller error.
    pub async fn add(&self, handle: ConnectionHandle) {
        let id = handle.id();
        let user_id = handle.user_id().to_owned();

        let mut connections = self.connections.write().await;
        let mut by_user = self.by_user.write().await;

        if let Some(prev) = connections.insert(id, handle) {
            if prev.user_id() != user_id {
                unindex(&mut by_user, prev.user_id(), id);
            }
        }
        by_user.entry(user_id).or_default().insert(id);
    }

    /// Removes a connection and its index entry. Returns the removed handle.
    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write().await;
        let mut by_user = self.by_user.write().await;

        let handle = connections.remove(&id)?;
        unindex(&mut by_user, handle.user_id(), id);
        Some(handle)
    }

    /// Returns the handle for a connection id.
    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Returns the ids of every live connection owned by `user_id`.
    pub async fn connections_for_user(&self, user_id: &str) -> HashSet<ConnectionId> {
        self.by_user
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolves the handles of every live connection owned by `user_id`.
    ///
    /// Ids removed between the two lookups are skipped.
    pub(crate) async fn handles_for_user(&self, user_id: &str) -> Vec<ConnectionHandle> {
        let ids = self.connections_for_user(user_id).await;
        if ids.is_empty() {
            return Vec::new();
        }

        let connections = self.connections.read().await;
        ids.iter()
            .filter_map(|id| connections.get(id).cloned())
            .collect()
    }

    /// Empties both maps and returns every handle that was stored.
    pub(crate) async fn drain(&self) -> Vec<ConnectionHandle> {
        let mut connections = self.connections.write().await;
        let mut by_user = self.by_user.write().await;
        by_user.clear();
        connections.drain().map(|(_, handle)| handle).collect()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Number of users with at least one live connection.
    pub async fn user_count(&self) -> usize {
        self.by_user.read().await.len()
    }
}

fn unindex(by_user: &mut HashMap<UserId, HashSet<ConnectionId>>, user_id: &str, id: ConnectionId) {
    if let Some(ids) = by_user.get_mut(user_id) {
        ids.remove(&id);
        if ids.is_empty() {
            by_user.remove(user_id);
        }
    }
}
