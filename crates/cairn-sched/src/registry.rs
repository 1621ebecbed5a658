//! Owner of every connected client's [`ClientState`].
//!
//! The registry itself is plain data. It lives behind the registry lock in
//! [`SharedState`](crate::SharedState), so any read-modify-write done while
//! holding a [`RegistryGuard`](crate::RegistryGuard) is atomic.

use rustc_hash::FxHashMap;

use crate::client::{ClientId, ClientState};
use crate::coords::BlockPos;

/// Map of connected clients keyed by connection handle.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: FxHashMap<ClientId, ClientState>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly connected client.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered: lifecycle events were applied
    /// out of order upstream.
    pub fn create(&mut self, id: ClientId) -> &mut ClientState {
        assert!(
            !self.clients.contains_key(&id),
            "client {id} created twice; lifecycle queue invariant violated"
        );
        self.clients.entry(id).or_insert_with(|| ClientState::new(id))
    }

    /// Removes a client and returns its final state.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn destroy(&mut self, id: ClientId) -> ClientState {
        match self.clients.remove(&id) {
            Some(state) => state,
            None => panic!("client {id} destroyed but never created; lifecycle queue invariant violated"),
        }
    }

    /// Looks up a client.
    pub fn get(&self, id: ClientId) -> Option<&ClientState> {
        self.clients.get(&id)
    }

    /// Looks up a client for mutation.
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientState> {
        self.clients.get_mut(&id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Marks `pos` as delivered to `id` unless it already was.
    ///
    /// Returns `Some(true)` when newly marked, `Some(false)` when it was
    /// already known, and `None` for an unknown client.
    pub fn mark_block_sent(&mut self, id: ClientId, pos: BlockPos) -> Option<bool> {
        self.clients.get_mut(&id).map(|c| c.mark_block_sent(pos))
    }

    /// Clears `pos` from `id`'s delivered set after the client dropped it.
    pub fn forget_block(&mut self, id: ClientId, pos: BlockPos) -> bool {
        self.clients
            .get_mut(&id)
            .is_some_and(|c| c.forget_block(pos))
    }

    /// Advances every client's timers.
    pub fn advance_timers(&mut self, dtime: f32) {
        for client in self.clients.values_mut() {
            client.advance_timers(dtime);
        }
    }

    /// Connected client ids in ascending order.
    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Iterates over all clients.
    pub fn iter(&self) -> impl Iterator<Item = &ClientState> {
        self.clients.values()
    }

    /// Iterates mutably over all clients.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientState> {
        self.clients.values_mut()
    }

    /// Removes every client, returning their ids.
    pub fn clear(&mut self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
