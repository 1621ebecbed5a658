//! Nearest-first selection of the blocks a client should get next.
//!
//! Each tick the server sweeps outwards from the client's view center one
//! Chebyshev shell at a time, starting at the nearest distance that still
//! had unsent blocks last time. Loaded blocks become send offers; blocks
//! not yet loaded become emerge requests.

use cairn_config::StreamingConfig;

use crate::client::ClientState;
use crate::coords::{BlockPos, shell};
use crate::shared::Environment;

/// Consecutive empty sweeps that start a pause.
pub const EMPTY_SWEEPS_BEFORE_PAUSE: u32 = 3;

/// Work found by one sweep for one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockPlan {
    /// Loaded blocks to offer to the send scheduler, with priorities.
    pub sends: Vec<(BlockPos, f32)>,
    /// Unloaded blocks to request from the emerge scheduler, with priorities.
    pub emerges: Vec<(BlockPos, f32)>,
}

impl BlockPlan {
    /// Whether the sweep found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.emerges.is_empty()
    }

    fn actions(&self) -> usize {
        self.sends.len() + self.emerges.len()
    }
}

/// Scheduling priority of a block `d` shells away from the viewer.
pub fn priority_for_distance(d: i16) -> f32 {
    -(d as f32)
}

/// Sweeps the client's view and updates its pacing state.
///
/// `send_pending` reports blocks already queued for this client, or ones
/// it can never be sent; they are neither offered again nor counted
/// against the limits. `emerge_pending`
/// reports blocks that must not be requested now, either because a
/// request is in flight or because an earlier attempt failed recently.
pub fn plan_client(
    client: &mut ClientState,
    env: &Environment,
    limits: &StreamingConfig,
    mut send_pending: impl FnMut(BlockPos) -> bool,
    mut emerge_pending: impl FnMut(BlockPos) -> bool,
) -> BlockPlan {
    let mut plan = BlockPlan::default();
    if !client.is_ready() || client.is_send_paused() {
        return plan;
    }
    let Some(view) = client.view else {
        return plan;
    };

    if client.last_center != Some(view.center) {
        client.last_center = Some(view.center);
        client.nearest_unsent_d = 0;
    }
    if client.nearest_unsent_reset_timer >= limits.nearest_unsent_reset_s {
        client.nearest_unsent_reset_timer = 0.0;
        client.nearest_unsent_d = 0;
    }

    let mut radius = view.radius.clamp(0, limits.max_view_radius.max(0));
    if client.time_from_building < limits.full_send_min_time_from_building_s {
        radius = radius.min(limits.max_distance_while_building.max(0));
    }

    let start = client.nearest_unsent_d.max(0);
    let mut new_nearest = None;
    let mut stopped_at = None;

    'sweep: for d in start..=radius {
        let priority = priority_for_distance(d);
        for pos in shell(view.center, d) {
            if client.is_block_sent(pos) {
                continue;
            }
            new_nearest.get_or_insert(d);
            if send_pending(pos) {
                continue;
            }
            if env.is_loaded(pos) {
                plan.sends.push((pos, priority));
            } else if !emerge_pending(pos) {
                plan.emerges.push((pos, priority));
            } else {
                continue;
            }
            if plan.actions() >= limits.max_blocks_planned_per_client
                || plan.emerges.len() >= limits.max_emerges_per_client
            {
                stopped_at = Some(d);
                break 'sweep;
            }
        }
    }

    // A sweep that ran to the edge with nothing unsent resumes past it.
    client.nearest_unsent_d = new_nearest
        .or(stopped_at)
        .unwrap_or(radius.saturating_add(1).max(start));

    if plan.is_empty() {
        client.nothing_to_send_counter += 1;
        if client.nothing_to_send_counter >= EMPTY_SWEEPS_BEFORE_PAUSE {
            client.nothing_to_send_counter = 0;
            client.nothing_to_send_pause_timer = limits.nothing_to_send_pause_s;
        }
    } else {
        client.nothing_to_send_counter = 0;
    }
    plan
}
