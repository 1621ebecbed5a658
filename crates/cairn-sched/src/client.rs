//! Per-client synchronization state.
//!
//! A [`ClientState`] records what the server believes a connected client
//! already has: the negotiated serialization version, the blocks and
//! remote objects it was sent, and the timers that pace how far out the
//! server sweeps for more blocks.

use std::fmt;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::coords::BlockPos;
use crate::error::HandshakeError;

/// Opaque connection handle assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a remote (active) object the client may know about.
pub type ObjectId = u16;

/// Where a client is looking from and how far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientView {
    /// Block containing the client's viewpoint.
    pub center: BlockPos,
    /// Requested view radius in blocks.
    pub radius: i16,
}

impl ClientView {
    /// Whether `pos` lies inside this view, clamped to `max_radius`.
    pub fn covers(&self, pos: BlockPos, max_radius: i16) -> bool {
        let radius = self.radius.clamp(0, max_radius.max(0));
        self.center.chebyshev_distance(pos) <= radius as u16
    }
}

/// Initial value of [`ClientState::time_from_building`]: "never built".
pub const NEVER_BUILT: f32 = 9999.0;

/// Server-side bookkeeping for one connected client.
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Connection handle.
    pub id: ClientId,
    /// Player name announced in `Init`.
    pub player_name: String,
    /// Serialization version in use, set once `Init2` completes the handshake.
    pub serialization_version: Option<u8>,
    /// Version agreed in `Init`, waiting for `Init2`.
    pub pending_serialization_version: Option<u8>,
    /// Network protocol version announced by the client.
    pub protocol_version: u16,
    /// Whether static definitions were sent.
    pub definitions_sent: bool,
    /// Latest viewpoint reported by the client.
    pub view: Option<ClientView>,
    /// Seconds since the client last placed or removed something.
    pub time_from_building: f32,
    /// Remote objects the client knows about.
    pub known_objects: FxHashSet<ObjectId>,

    blocks_sent: FxHashSet<BlockPos>,
    pub(crate) nearest_unsent_d: i16,
    pub(crate) last_center: Option<BlockPos>,
    pub(crate) nearest_unsent_reset_timer: f32,
    pub(crate) nothing_to_send_counter: u32,
    pub(crate) nothing_to_send_pause_timer: f32,
}

impl ClientState {
    /// Fresh state for a newly connected peer.
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            player_name: String::new(),
            serialization_version: None,
            pending_serialization_version: None,
            protocol_version: 0,
            definitions_sent: false,
            view: None,
            time_from_building: NEVER_BUILT,
            known_objects: FxHashSet::default(),
            blocks_sent: FxHashSet::default(),
            nearest_unsent_d: 0,
            last_center: None,
            nearest_unsent_reset_timer: 0.0,
            nothing_to_send_counter: 0,
            nothing_to_send_pause_timer: 0.0,
        }
    }

    /// Handles `Init`: picks the highest version both sides support and
    /// stores it as pending.
    pub fn begin_handshake(
        &mut self,
        client_max_version: u8,
        protocol_version: u16,
        player_name: &str,
        min: u8,
        max: u8,
    ) -> Result<u8, HandshakeError> {
        if self.pending_serialization_version.is_some() || self.serialization_version.is_some() {
            return Err(HandshakeError::AlreadyInitialized);
        }
        let version = client_max_version.min(max);
        if version < min {
            return Err(HandshakeError::VersionMismatch {
                client: client_max_version,
                min,
                max,
            });
        }
        self.pending_serialization_version = Some(version);
        self.protocol_version = protocol_version;
        self.player_name = player_name.to_string();
        Ok(version)
    }

    /// Handles `Init2`: promotes the pending version.
    pub fn complete_handshake(&mut self) -> Result<u8, HandshakeError> {
        if let Some(version) = self.serialization_version {
            return Ok(version);
        }
        let version = self
            .pending_serialization_version
            .ok_or(HandshakeError::NotInitialized)?;
        self.serialization_version = Some(version);
        self.definitions_sent = true;
        Ok(version)
    }

    /// Whether blocks may be sent to this client.
    pub fn is_ready(&self) -> bool {
        self.serialization_version.is_some()
    }

    /// Records a new viewpoint.
    pub fn set_view(&mut self, view: ClientView) {
        self.view = Some(view);
    }

    /// Whether `pos` is recorded as delivered.
    pub fn is_block_sent(&self, pos: BlockPos) -> bool {
        self.blocks_sent.contains(&pos)
    }

    /// Records `pos` as delivered. Returns `false` if it already was.
    pub fn mark_block_sent(&mut self, pos: BlockPos) -> bool {
        self.blocks_sent.insert(pos)
    }

    /// The client reported it dropped `pos`; it may be sent again.
    pub fn forget_block(&mut self, pos: BlockPos) -> bool {
        let removed = self.blocks_sent.remove(&pos);
        if removed {
            // Restart the sweep so the block is found again promptly.
            self.nearest_unsent_d = 0;
        }
        removed
    }

    /// Number of blocks recorded as delivered.
    pub fn blocks_sent_len(&self) -> usize {
        self.blocks_sent.len()
    }

    /// Records a remote object as known. Returns `false` if it already was.
    pub fn mark_object_known(&mut self, id: ObjectId) -> bool {
        self.known_objects.insert(id)
    }

    /// Forgets a remote object. Returns `false` if it was not known.
    pub fn forget_object(&mut self, id: ObjectId) -> bool {
        self.known_objects.remove(&id)
    }

    /// The client placed or removed something.
    pub fn note_building(&mut self) {
        self.time_from_building = 0.0;
    }

    /// Advances every per-client timer by `dtime` seconds.
    pub fn advance_timers(&mut self, dtime: f32) {
        self.time_from_building = (self.time_from_building + dtime).min(NEVER_BUILT);
        self.nearest_unsent_reset_timer += dtime;
        if self.nothing_to_send_pause_timer > 0.0 {
            self.nothing_to_send_pause_timer = (self.nothing_to_send_pause_timer - dtime).max(0.0);
        }
    }

    /// Distance the next sweep starts from.
    pub fn nearest_unsent_distance(&self) -> i16 {
        self.nearest_unsent_d
    }

    /// Whether planning is paused after repeated empty sweeps.
    pub fn is_send_paused(&self) -> bool {
        self.nothing_to_send_pause_timer > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_client_knows_nothing() {
        let c = ClientState::new(ClientId(7));
        assert_eq!(c.blocks_sent_len(), 0);
        assert!(c.known_objects.is_empty());
        assert!(!c.is_ready());
        assert!(!c.definitions_sent);
        assert_eq!(c.time_from_building, NEVER_BUILT);
    }

    #[test]
    fn test_handshake_picks_highest_common_version() {
        let mut c = ClientState::new(ClientId(1));
        assert_eq!(c.begin_handshake(40, 3, "alice", 22, 25), Ok(25));
        assert_eq!(c.pending_serialization_version, Some(25));
        assert!(!c.is_ready());

        assert_eq!(c.complete_handshake(), Ok(25));
        assert!(c.is_ready());
        assert!(c.definitions_sent);
        assert_eq!(c.player_name, "alice");
    }

    #[test]
    fn test_handshake_downgrades_to_client_version() {
        let mut c = ClientState::new(ClientId(1));
        assert_eq!(c.begin_handshake(23, 3, "bob", 22, 25), Ok(23));
    }

    #[test]
    fn test_handshake_rejects_too_old_client() {
        let mut c = ClientState::new(ClientId(1));
        let err = c.begin_handshake(10, 3, "carol", 22, 25).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::VersionMismatch {
                client: 10,
                min: 22,
                max: 25
            }
        );
        assert!(c.pending_serialization_version.is_none());
    }

    #[test]
    fn test_handshake_order_enforced() {
        let mut c = ClientState::new(ClientId(1));
        assert_eq!(c.complete_handshake(), Err(HandshakeError::NotInitialized));
        c.begin_handshake(25, 3, "dave", 22, 25).unwrap();
        assert_eq!(
            c.begin_handshake(25, 3, "dave", 22, 25),
            Err(HandshakeError::AlreadyInitialized)
        );
    }

    #[test]
    fn test_known_sent_only_cleared_by_forget() {
        let mut c = ClientState::new(ClientId(1));
        let p = BlockPos::new(1, 0, 0);
        assert!(c.mark_block_sent(p));
        assert!(!c.mark_block_sent(p));
        c.nearest_unsent_d = 4;

        assert!(c.forget_block(p));
        assert!(!c.is_block_sent(p));
        assert_eq!(c.nearest_unsent_distance(), 0);
        assert!(!c.forget_block(p));
    }

    #[test]
    fn test_known_objects() {
        let mut c = ClientState::new(ClientId(1));
        assert!(c.mark_object_known(12));
        assert!(!c.mark_object_known(12));
        assert!(c.forget_object(12));
        assert!(!c.forget_object(12));
    }

    #[test]
    fn test_timers_advance_and_pause_expires() {
        let mut c = ClientState::new(ClientId(1));
        c.note_building();
        c.nothing_to_send_pause_timer = 1.0;
        c.advance_timers(0.4);
        assert!((c.time_from_building - 0.4).abs() < 1e-6);
        assert!(c.is_send_paused());
        c.advance_timers(0.7);
        assert!(!c.is_send_paused());
        assert!((c.nearest_unsent_reset_timer - 1.1).abs() < 1e-6);
    }

    #[test]
    fn test_view_covers_clamps_radius() {
        let view = ClientView {
            center: BlockPos::new(0, 0, 0),
            radius: 8,
        };
        assert!(view.covers(BlockPos::new(3, -3, 3), 4));
        assert!(!view.covers(BlockPos::new(5, 0, 0), 4));
        assert!(view.covers(BlockPos::new(8, 0, 0), 10));
    }
}
