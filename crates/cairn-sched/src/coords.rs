//! Block coordinates and distance-shell iteration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer coordinate of a fixed-size block of world content.
///
/// `Ord` exists so positions can live in ordered sets; it carries no
/// scheduling meaning.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockPos {
    /// X coordinate in blocks.
    pub x: i16,
    /// Y coordinate in blocks.
    pub y: i16,
    /// Z coordinate in blocks.
    pub z: i16,
}

impl BlockPos {
    /// Creates a new position.
    pub const fn new(x: i16, y: i16, z: i16) -> Self {
        Self { x, y, z }
    }

    /// Returns this position displaced by `(dx, dy, dz)`, or `None` if any
    /// component leaves the `i16` range.
    pub fn offset(self, dx: i16, dy: i16, dz: i16) -> Option<Self> {
        Some(Self {
            x: self.x.checked_add(dx)?,
            y: self.y.checked_add(dy)?,
            z: self.z.checked_add(dz)?,
        })
    }

    /// Largest per-axis distance between two positions.
    pub fn chebyshev_distance(self, other: Self) -> u16 {
        let dx = (self.x as i32 - other.x as i32).unsigned_abs();
        let dy = (self.y as i32 - other.y as i32).unsigned_abs();
        let dz = (self.z as i32 - other.z as i32).unsigned_abs();
        dx.max(dy).max(dz) as u16
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

impl From<(i16, i16, i16)> for BlockPos {
    fn from((x, y, z): (i16, i16, i16)) -> Self {
        Self { x, y, z }
    }
}

/// All positions whose Chebyshev distance from `center` is exactly `d`.
///
/// The hollow cube is enumerated face by face; positions that would leave
/// the `i16` range are skipped. `d == 0` yields `center` alone.
pub fn shell(center: BlockPos, d: i16) -> Vec<BlockPos> {
    if d <= 0 {
        return vec![center];
    }
    let mut out = Vec::with_capacity(shell_len(d));
    for dy in -d..=d {
        let y_face = dy.abs() == d;
        for dz in -d..=d {
            let z_face = dz.abs() == d;
            if y_face || z_face {
                for dx in -d..=d {
                    if let Some(p) = center.offset(dx, dy, dz) {
                        out.push(p);
                    }
                }
            } else {
                // Interior rows only contribute their two x-extremes.
                for dx in [-d, d] {
                    if let Some(p) = center.offset(dx, dy, dz) {
                        out.push(p);
                    }
                }
            }
        }
    }
    out
}

fn shell_len(d: i16) -> usize {
    let outer = (2 * d as usize + 1).pow(3);
    let inner = (2 * d as usize - 1).pow(3);
    outer - inner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_zero_is_center() {
        let c = BlockPos::new(3, -2, 7);
        assert_eq!(shell(c, 0), vec![c]);
    }

    #[test]
    fn test_shell_sizes_match_hollow_cube() {
        let c = BlockPos::default();
        assert_eq!(shell(c, 1).len(), 26);
        assert_eq!(shell(c, 2).len(), 98);
        assert_eq!(shell(c, 3).len(), 218);
    }

    #[test]
    fn test_shell_positions_are_at_exact_distance() {
        let c = BlockPos::new(10, 0, -10);
        let positions = shell(c, 2);
        assert!(positions.iter().all(|p| p.chebyshev_distance(c) == 2));

        let unique: std::collections::HashSet<_> = positions.iter().collect();
        assert_eq!(unique.len(), positions.len());
    }

    #[test]
    fn test_shell_skips_out_of_range_positions() {
        let c = BlockPos::new(i16::MAX, 0, 0);
        let positions = shell(c, 1);
        assert!(positions.iter().all(|p| p.x >= i16::MAX - 1));
        assert_eq!(positions.len(), 26 - 9);
    }

    #[test]
    fn test_display_and_distance() {
        let a = BlockPos::new(1, -2, 3);
        assert_eq!(a.to_string(), "(1,-2,3)");
        assert_eq!(a.chebyshev_distance(BlockPos::new(-4, 0, 3)), 5);
    }
}
