//! The two coarse locks and the only sanctioned way to take both.
//!
//! World state ([`Environment`]) and the [`ClientRegistry`] each sit behind
//! their own mutex. Code needing both goes through
//! [`SharedState::lock_both`], which always takes the environment first.
//! Taking the environment lock while the same thread holds the registry
//! lock of the same [`SharedState`] panics, so an ordering mistake shows up
//! in the first test that hits it instead of as a rare deadlock.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::coords::BlockPos;
use crate::registry::ClientRegistry;
use crate::services::BlockContent;

thread_local! {
    /// Addresses of the [`SharedState`]s whose registry this thread holds.
    static REGISTRIES_HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn holds_registry(owner: usize) -> bool {
    REGISTRIES_HELD.with(|held| held.borrow().contains(&owner))
}

/// World state the server mutates under the environment lock.
#[derive(Debug, Default)]
pub struct Environment {
    blocks: FxHashMap<BlockPos, Arc<BlockContent>>,
    uptime: f64,
}

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a loaded block, replacing any previous content.
    pub fn insert_block(&mut self, pos: BlockPos, block: BlockContent) {
        self.blocks.insert(pos, Arc::new(block));
    }

    /// Shared handle to a loaded block.
    pub fn block(&self, pos: BlockPos) -> Option<Arc<BlockContent>> {
        self.blocks.get(&pos).cloned()
    }

    /// Whether `pos` is loaded.
    pub fn is_loaded(&self, pos: BlockPos) -> bool {
        self.blocks.contains_key(&pos)
    }

    /// Number of loaded blocks.
    pub fn loaded_len(&self) -> usize {
        self.blocks.len()
    }

    /// Seconds the server has been running.
    pub fn uptime(&self) -> f64 {
        self.uptime
    }

    /// Adds `dtime` seconds to the uptime.
    pub fn advance_uptime(&mut self, dtime: f32) {
        self.uptime += dtime as f64;
    }
}

/// Holder of the environment and registry locks.
#[derive(Debug, Default)]
pub struct SharedState {
    env: Mutex<Environment>,
    registry: Mutex<ClientRegistry>,
}

/// Scoped access to the [`Environment`].
pub struct EnvGuard<'a> {
    guard: MutexGuard<'a, Environment>,
}

/// Scoped access to the [`ClientRegistry`].
pub struct RegistryGuard<'a> {
    guard: MutexGuard<'a, ClientRegistry>,
    owner: usize,
}

/// Both locks, acquired environment first. Released together on drop.
pub struct BothGuard<'a> {
    /// The environment.
    pub env: EnvGuard<'a>,
    /// The client registry.
    pub registry: RegistryGuard<'a>,
}

impl SharedState {
    /// Creates empty shared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the environment.
    ///
    /// # Panics
    ///
    /// Panics if this thread holds this instance's registry lock.
    pub fn lock_env(&self) -> EnvGuard<'_> {
        assert!(
            !holds_registry(self.addr()),
            "lock order violation: environment lock requested while holding the registry lock"
        );
        EnvGuard {
            guard: self.env.lock(),
        }
    }

    /// Locks the registry.
    ///
    /// # Panics
    ///
    /// Panics if this thread already holds this instance's registry lock.
    pub fn lock_registry(&self) -> RegistryGuard<'_> {
        let owner = self.addr();
        assert!(!holds_registry(owner), "registry lock is not reentrant");
        let guard = self.registry.lock();
        REGISTRIES_HELD.with(|held| held.borrow_mut().push(owner));
        RegistryGuard { guard, owner }
    }

    /// Locks the environment, then the registry.
    pub fn lock_both(&self) -> BothGuard<'_> {
        let env = self.lock_env();
        let registry = self.lock_registry();
        BothGuard { env, registry }
    }

    /// Identity of this instance for the held-lock marker. Stable while
    /// any guard borrows `self`.
    fn addr(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        REGISTRIES_HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(i) = held.iter().position(|&a| a == self.owner) {
                held.swap_remove(i);
            }
        });
    }
}

impl Deref for EnvGuard<'_> {
    type Target = Environment;
    fn deref(&self) -> &Environment {
        &self.guard
    }
}

impl DerefMut for EnvGuard<'_> {
    fn deref_mut(&mut self) -> &mut Environment {
        &mut self.guard
    }
}

impl Deref for RegistryGuard<'_> {
    type Target = ClientRegistry;
    fn deref(&self) -> &ClientRegistry {
        &self.guard
    }
}

impl DerefMut for RegistryGuard<'_> {
    fn deref_mut(&mut self) -> &mut ClientRegistry {
        &mut self.guard
    }
}
