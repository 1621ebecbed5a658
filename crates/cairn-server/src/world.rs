//! Deterministic generated world used as the server's block storage.
//!
//! Terrain is a 2D fBm height field over simplex noise. Each block is a
//! 16^3 array of material ids laid out `x + 16 * (y + 16 * z)`.

use cairn_sched::{BlockContent, BlockPos, StorageError, WorldStorage};
use dashmap::DashMap;
use noise::{NoiseFn, Simplex};
use tracing::trace;

/// Edge length of a block in nodes.
pub const BLOCK_SIZE: i32 = 16;

/// Farthest node coordinate the world generates, on every axis.
pub const MAP_GENERATION_LIMIT: i32 = 31_000;

/// Material ids written into block content.
pub mod material {
    pub const AIR: u8 = 0;
    pub const STONE: u8 = 1;
    pub const DIRT: u8 = 2;
    pub const GRASS: u8 = 3;
}

const OCTAVES: u32 = 4;
const BASE_FREQUENCY: f64 = 0.01;
const AMPLITUDE: f64 = 24.0;

/// World storage that generates terrain on first request and caches it.
pub struct GeneratedWorld {
    noise: Simplex,
    blocks: DashMap<BlockPos, BlockContent>,
}

impl GeneratedWorld {
    /// Creates an empty world whose terrain is fixed by `seed`.
    pub fn new(seed: u32) -> Self {
        Self {
            noise: Simplex::new(seed),
            blocks: DashMap::new(),
        }
    }

    /// Number of blocks generated so far.
    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Whether every node of `pos` lies within [`MAP_GENERATION_LIMIT`].
    pub fn within_limit(pos: BlockPos) -> bool {
        let limit = MAP_GENERATION_LIMIT / BLOCK_SIZE;
        [pos.x, pos.y, pos.z]
            .iter()
            .all(|&c| (-limit..limit).contains(&i32::from(c)))
    }

    /// Surface height in nodes at column `(x, z)`.
    pub fn surface_height(&self, x: i32, z: i32) -> f64 {
        let mut total = 0.0;
        let mut frequency = BASE_FREQUENCY;
        let mut amplitude = AMPLITUDE;
        for _ in 0..OCTAVES {
            total += self.noise.get([f64::from(x) * frequency, f64::from(z) * frequency]) * amplitude;
            frequency *= 2.0;
            amplitude *= 0.5;
        }
        total
    }

    fn generate(&self, pos: BlockPos) -> BlockContent {
        let size = BLOCK_SIZE as usize;
        let base_x = i32::from(pos.x) * BLOCK_SIZE;
        let base_y = i32::from(pos.y) * BLOCK_SIZE;
        let base_z = i32::from(pos.z) * BLOCK_SIZE;

        let mut data = vec![material::AIR; size * size * size];
        for lz in 0..size {
            for lx in 0..size {
                let surface = self.surface_height(base_x + lx as i32, base_z + lz as i32);
                for ly in 0..size {
                    let wy = f64::from(base_y + ly as i32);
                    let id = if wy < surface - 4.0 {
                        material::STONE
                    } else if wy < surface - 1.0 {
                        material::DIRT
                    } else if wy < surface {
                        material::GRASS
                    } else {
                        continue;
                    };
                    data[lx + size * (ly + size * lz)] = id;
                }
            }
        }
        BlockContent::new(data)
    }
}

impl WorldStorage for GeneratedWorld {
    fn load_or_generate(&self, pos: BlockPos) -> Result<BlockContent, StorageError> {
        if !Self::within_limit(pos) {
            return Err(StorageError::Unavailable {
                pos,
                reason: "outside map generation limit".into(),
            });
        }
        if let Some(block) = self.blocks.get(&pos) {
            return Ok(block.clone());
        }
        let block = self.generate(pos);
        trace!(%pos, "generated block");
        Ok(self.blocks.entry(pos).or_insert(block).clone())
    }
}
