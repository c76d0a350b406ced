use std::fmt;

use serde::{Deserialize, Serialize};

/// Chunk-sized position identifying one unit of schedulable work.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct WorkKey {
    pub x: i32,
    pub z: i32,
}

impl WorkKey {
    /// Width of a chunk in blocks, as a shift.
    const CHUNK_SHIFT: u32 = 4;

    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The chunk containing the given block coordinates.
    pub const fn from_block_pos(block_x: i32, block_z: i32) -> Self {
        Self::new(block_x >> Self::CHUNK_SHIFT, block_z >> Self::CHUNK_SHIFT)
    }

    pub fn squared_distance(&self, other: &WorkKey) -> u64 {
        let dx = (i64::from(self.x) - i64::from(other.x)).unsigned_abs();
        let dz = (i64::from(self.z) - i64::from(other.z)).unsigned_abs();
        (dx * dx).saturating_add(dz * dz)
    }

    /// The 3x3 block of keys centered on this one, including itself.
    ///
    /// Offsets past the `i32` range are left out, so keys on the edge of the
    /// coordinate space have fewer neighbors.
    pub fn neighborhood(self) -> impl Iterator<Item = WorkKey> {
        (-1..=1)
            .filter_map(move |dx| self.x.checked_add(dx))
            .flat_map(move |x| {
                (-1..=1)
                    .filter_map(move |dz| self.z.checked_add(dz))
                    .map(move |z| WorkKey::new(x, z))
            })
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

impl From<(i32, i32)> for WorkKey {
    fn from((x, z): (i32, i32)) -> Self {
        Self::new(x, z)
    }
}

/// A queued unit of work.
///
/// `neighbors` lists the keys whose data the work needs to be correct
/// (lighting crosses chunk borders, for instance). When `expand_neighbors` is
/// set, neighbors promoted alongside this item get their own neighborhoods
/// resolved too.
#[derive(Debug, Clone)]
pub struct QueuedItem<P> {
    pub key: WorkKey,
    pub payload: P,
    pub neighbors: Option<Vec<WorkKey>>,
    pub expand_neighbors: bool,
}

impl<P> QueuedItem<P> {
    pub fn new(key: WorkKey, payload: P) -> Self {
        Self {
            key,
            payload,
            neighbors: None,
            expand_neighbors: false,
        }
    }

    pub fn with_neighbors(mut self, neighbors: Vec<WorkKey>, expand_neighbors: bool) -> Self {
        self.neighbors = Some(neighbors);
        self.expand_neighbors = expand_neighbors;
        self
    }
}
