//! The persistent voxel block store.
//!
//! Blocks are handed out by a bump allocator from a fixed pool. A block index
//! stays valid until [`MapStruct::reset`]. Besides the hash table and the pool
//! the map owns the two per-frame lists computed by the visibility pass.

use crate::config::MapConfig;
use crate::error::MapError;
use crate::hash_table::{HashTable, InsertFailure, Insertion};
use crate::visibility::RenderingBlock;
use crate::voxel::{BLOCK_SIZE, BLOCK_VOLUME, Voxel, local_index, voxel_to_block, voxel_to_local};
use glam::{IVec3, Vec3};
use tracing::{info, warn};

/// Outcome of one [`MapStruct::allocate_blocks`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationSummary {
    pub found: usize,
    pub inserted: usize,
    pub excess_full: usize,
    pub pool_full: usize,
}

impl AllocationSummary {
    pub fn failed(&self) -> usize {
        self.excess_full + self.pool_full
    }
}

#[derive(Debug)]
pub struct MapStruct {
    config: MapConfig,
    table: HashTable,
    voxels: Vec<Voxel>,
    block_coords: Vec<IVec3>,
    visible_blocks: Vec<u32>,
    rendering_blocks: Vec<RenderingBlock>,
    allocation_failures: u64,
}

fn reserve<T: Clone>(what: &'static str, len: usize, fill: T) -> Result<Vec<T>, MapError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|source| MapError::Allocation {
            what,
            requested: len,
            source,
        })?;
    v.resize(len, fill);
    Ok(v)
}

impl MapStruct {
    /// Allocate all storage up front. Fails on an invalid configuration or
    /// when memory cannot be reserved.
    pub fn allocate(config: MapConfig) -> Result<Self, MapError> {
        config.validate()?;

        let table = HashTable::new(config.bucket_count, config.excess_count)?;
        let voxels = reserve("voxels", config.block_capacity * BLOCK_VOLUME, Voxel::EMPTY)?;
        let mut block_coords = Vec::new();
        block_coords
            .try_reserve_exact(config.block_capacity)
            .map_err(|source| MapError::Allocation {
                what: "block coordinates",
                requested: config.block_capacity,
                source,
            })?;

        info!(
            "Allocated map: {} buckets, {} excess entries, {} blocks ({:.1} MiB of voxels)",
            config.bucket_count,
            config.excess_count,
            config.block_capacity,
            (voxels.len() * size_of::<Voxel>()) as f64 / (1024.0 * 1024.0)
        );

        Ok(Self {
            config,
            table,
            voxels,
            block_coords,
            visible_blocks: Vec::new(),
            rendering_blocks: Vec::new(),
            allocation_failures: 0,
        })
    }

    /// Return to the freshly allocated state without releasing memory.
    pub fn reset(&mut self) {
        self.table.reset();
        let used = self.block_coords.len() * BLOCK_VOLUME;
        self.voxels[..used].fill(Voxel::EMPTY);
        self.block_coords.clear();
        self.visible_blocks.clear();
        self.rendering_blocks.clear();
        self.allocation_failures = 0;
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn allocated_block_count(&self) -> usize {
        self.block_coords.len()
    }

    pub fn visible_block_count(&self) -> usize {
        self.visible_blocks.len()
    }

    pub fn rendering_block_count(&self) -> usize {
        self.rendering_blocks.len()
    }

    /// Insertions that failed since the last reset.
    pub fn allocation_failures(&self) -> u64 {
        self.allocation_failures
    }

    pub fn visible_blocks(&self) -> &[u32] {
        &self.visible_blocks
    }

    pub fn rendering_blocks(&self) -> &[RenderingBlock] {
        &self.rendering_blocks
    }

    pub(crate) fn set_visible_blocks(&mut self, blocks: Vec<u32>) {
        self.visible_blocks = blocks;
    }

    pub(crate) fn set_rendering_blocks(&mut self, blocks: Vec<RenderingBlock>) {
        self.rendering_blocks = blocks;
    }

    /// Insert every coordinate of `coords` in order. Uniqueness is the hash
    /// table's job, so duplicates are harmless.
    pub fn allocate_blocks(&mut self, coords: &[IVec3]) -> AllocationSummary {
        let mut summary = AllocationSummary::default();
        let capacity = self.config.block_capacity;
        for &coord in coords {
            let next = self.block_coords.len();
            let outcome = self.table.find_or_insert(coord, || (next < capacity).then_some(next as u32));
            match outcome {
                Insertion::Found(_) => summary.found += 1,
                Insertion::Inserted(_) => {
                    self.block_coords.push(coord);
                    summary.inserted += 1;
                }
                Insertion::Failed(InsertFailure::ExcessFull) => summary.excess_full += 1,
                Insertion::Failed(InsertFailure::PoolFull) => summary.pool_full += 1,
            }
        }

        if summary.failed() > 0 {
            self.allocation_failures += summary.failed() as u64;
            warn!(
                "Block allocation failed for {} coordinates ({} excess list full, {} pool full)",
                summary.failed(),
                summary.excess_full,
                summary.pool_full
            );
        }
        summary
    }

    pub fn find_block(&self, coord: IVec3) -> Option<u32> {
        self.table.find(coord)
    }

    /// Block coordinate of an allocated block.
    pub fn block_coord(&self, block: u32) -> IVec3 {
        self.block_coords[block as usize]
    }

    /// Coordinates of all allocated blocks, indexed by block.
    pub fn block_coords(&self) -> &[IVec3] {
        &self.block_coords
    }

    pub fn block_voxels(&self, block: u32) -> &[Voxel] {
        let start = block as usize * BLOCK_VOLUME;
        &self.voxels[start..start + BLOCK_VOLUME]
    }

    /// Allocated block coordinates with their voxels, `BLOCK_VOLUME` per block.
    pub(crate) fn allocated_blocks_mut(&mut self) -> (&[IVec3], &mut [Voxel]) {
        let used = self.block_coords.len() * BLOCK_VOLUME;
        (&self.block_coords, &mut self.voxels[..used])
    }

    /// Global voxel coordinate containing a world point.
    pub fn world_to_voxel(&self, point: Vec3) -> IVec3 {
        (point / self.config.voxel_size).floor().as_ivec3()
    }

    pub fn voxel_center(&self, voxel: IVec3) -> Vec3 {
        (voxel.as_vec3() + 0.5) * self.config.voxel_size
    }

    /// World position of a block's minimum corner.
    pub fn block_origin(&self, block: IVec3) -> Vec3 {
        (block * BLOCK_SIZE).as_vec3() * self.config.voxel_size
    }

    /// Voxel at a global voxel coordinate, if its block is allocated.
    pub fn voxel(&self, voxel: IVec3) -> Option<&Voxel> {
        let block = self.find_block(voxel_to_block(voxel))?;
        Some(&self.block_voxels(block)[local_index(voxel_to_local(voxel))])
    }

    pub fn sampler(&self) -> VoxelSampler<'_> {
        VoxelSampler::new(self)
    }

    pub fn sdf_nearest(&self, point: Vec3) -> Option<f32> {
        self.sampler().sdf_nearest(point)
    }

    pub fn sdf_trilinear(&self, point: Vec3) -> Option<f32> {
        self.sampler().sdf_trilinear(point)
    }

    pub fn sdf_blended(&self, point: Vec3) -> Option<f32> {
        self.sampler().sdf_blended(point)
    }

    pub fn sdf_gradient(&self, point: Vec3) -> Option<Vec3> {
        self.sampler().gradient(point)
    }
}

/// Voxel reader that remembers the last block it resolved.
///
/// Marching along a ray or a cell neighbourhood mostly stays inside one block,
/// so the hash lookup is skipped for consecutive samples in the same block.
pub struct VoxelSampler<'a> {
    map: &'a MapStruct,
    cached: Option<(IVec3, Option<u32>)>,
}

impl<'a> VoxelSampler<'a> {
    pub fn new(map: &'a MapStruct) -> Self {
        Self { map, cached: None }
    }

    pub fn voxel(&mut self, voxel: IVec3) -> Option<&'a Voxel> {
        let coord = voxel_to_block(voxel);
        let block = match self.cached {
            Some((cached, block)) if cached == coord => block,
            _ => {
                let block = self.map.find_block(coord);
                self.cached = Some((coord, block));
                block
            }
        }?;
        Some(&self.map.block_voxels(block)[local_index(voxel_to_local(voxel))])
    }

    /// Normalised SDF of the voxel containing `point`; `None` when unobserved.
    pub fn sdf_nearest(&mut self, point: Vec3) -> Option<f32> {
        let voxel = self.voxel(self.map.world_to_voxel(point))?;
        voxel.is_observed().then_some(voxel.sdf)
    }

    /// Trilinear interpolation between the eight surrounding voxel centres.
    /// `None` if any of them is unobserved.
    pub fn sdf_trilinear(&mut self, point: Vec3) -> Option<f32> {
        let grid = point / self.map.config.voxel_size - 0.5;
        let base = grid.floor();
        let t = grid - base;
        let base = base.as_ivec3();

        let mut s = [0.0f32; 8];
        for (i, value) in s.iter_mut().enumerate() {
            let offset = IVec3::new((i & 1) as i32, ((i >> 1) & 1) as i32, ((i >> 2) & 1) as i32);
            let voxel = self.voxel(base + offset)?;
            if !voxel.is_observed() {
                return None;
            }
            *value = voxel.sdf;
        }

        let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
        let x00 = lerp(s[0], s[1], t.x);
        let x10 = lerp(s[2], s[3], t.x);
        let x01 = lerp(s[4], s[5], t.x);
        let x11 = lerp(s[6], s[7], t.x);
        let y0 = lerp(x00, x10, t.y);
        let y1 = lerp(x01, x11, t.y);
        Some(lerp(y0, y1, t.z))
    }

    /// Trilinear blend over only the observed voxels among the eight
    /// surrounding centres, renormalised by their weights. `None` if none of
    /// them is observed.
    pub fn sdf_blended(&mut self, point: Vec3) -> Option<f32> {
        let grid = point / self.map.config.voxel_size - 0.5;
        let base = grid.floor();
        let t = grid - base;
        let base = base.as_ivec3();

        let (mut sum, mut total) = (0.0f32, 0.0f32);
        for i in 0..8 {
            let corner = IVec3::new((i & 1) as i32, ((i >> 1) & 1) as i32, ((i >> 2) & 1) as i32);
            let Some(voxel) = self.voxel(base + corner).filter(|v| v.is_observed()) else {
                continue;
            };
            let w = corner.as_vec3();
            let weight = (w * t + (Vec3::ONE - w) * (Vec3::ONE - t)).element_product();
            sum += weight * voxel.sdf;
            total += weight;
        }
        (total > f32::EPSILON).then(|| sum / total)
    }

    /// Finite-difference gradient of the trilinear field, one voxel apart.
    ///
    /// Axes with only one fully observed side use a one-sided difference.
    /// Axes with neither fall back to the blended field.
    pub fn gradient(&mut self, point: Vec3) -> Option<Vec3> {
        let h = self.map.config.voxel_size;
        let centre = self.sdf_trilinear(point).or_else(|| self.sdf_blended(point));
        let difference = |forward: Option<f32>, backward: Option<f32>| match (forward, backward) {
            (Some(forward), Some(backward)) => Some((forward - backward) / (2.0 * h)),
            (Some(forward), None) => centre.map(|c| (forward - c) / h),
            (None, Some(backward)) => centre.map(|c| (c - backward) / h),
            (None, None) => None,
        };

        let mut g = Vec3::ZERO;
        for axis in 0..3 {
            let mut offset = Vec3::ZERO;
            offset[axis] = h;
            g[axis] = match difference(self.sdf_trilinear(point + offset), self.sdf_trilinear(point - offset)) {
                Some(d) => d,
                None => difference(self.sdf_blended(point + offset), self.sdf_blended(point - offset))?,
            };
        }
        Some(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn small_config() -> MapConfig {
        MapConfig::default()
            .with_capacity(64, 16, 8)
            .with_resolution(0.1, 0.3)
    }

    #[test]
    fn test_allocate_rejects_invalid_config() {
        let config = MapConfig::default().with_capacity(0, 0, 0);
        assert!(matches!(MapStruct::allocate(config), Err(MapError::InvalidConfig(_))));
    }

    #[test]
    fn test_fresh_map_is_empty() {
        let map = MapStruct::allocate(small_config()).unwrap();
        assert_eq!(map.allocated_block_count(), 0);
        assert_eq!(map.visible_block_count(), 0);
        assert_eq!(map.rendering_block_count(), 0);
        assert!(map.sdf_nearest(Vec3::ZERO).is_none());
    }

    #[test]
    fn test_allocate_blocks_deduplicates() {
        let mut map = MapStruct::allocate(small_config()).unwrap();
        let coords = [IVec3::ZERO, IVec3::X, IVec3::ZERO, IVec3::new(-3, 2, 1)];
        let summary = map.allocate_blocks(&coords);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.found, 1);
        assert_eq!(map.allocated_block_count(), 3);
        assert_eq!(map.block_coord(2), IVec3::new(-3, 2, 1));
        assert_eq!(map.find_block(IVec3::X), Some(1));
    }

    #[test]
    fn test_pool_exhaustion_is_counted() {
        let mut map = MapStruct::allocate(small_config()).unwrap();
        let coords: Vec<IVec3> = (0..10).map(|i| IVec3::new(i, 0, 0)).collect();
        let summary = map.allocate_blocks(&coords);
        assert_eq!(summary.inserted, 8);
        assert_eq!(summary.pool_full, 2);
        assert_eq!(map.allocation_failures(), 2);
        assert_eq!(map.allocated_block_count(), 8);
    }

    #[test]
    fn test_reset_restores_empty_state() {
        let mut map = MapStruct::allocate(small_config()).unwrap();
        map.allocate_blocks(&[IVec3::ZERO]);
        {
            let (_, voxels) = map.allocated_blocks_mut();
            voxels[0].fuse(0.5, [1, 2, 3], 10.0);
        }
        map.set_visible_blocks(vec![0]);
        map.reset();
        assert_eq!(map.allocated_block_count(), 0);
        assert_eq!(map.visible_block_count(), 0);
        assert!(map.find_block(IVec3::ZERO).is_none());

        map.allocate_blocks(&[IVec3::ONE]);
        assert_eq!(map.block_voxels(0)[0], Voxel::EMPTY);
    }

    #[test]
    fn test_trilinear_matches_linear_field() {
        let mut map = MapStruct::allocate(small_config()).unwrap();
        map.allocate_blocks(&[IVec3::ZERO]);
        let voxel_size = map.config().voxel_size;
        {
            let (_, voxels) = map.allocated_blocks_mut();
            for (i, voxel) in voxels.iter_mut().enumerate() {
                let local = crate::voxel::local_coord(i);
                // sdf = 0.4 - x in world units, normalised by the 0.3 truncation
                let x = (local.x as f32 + 0.5) * voxel_size;
                voxel.fuse((0.4 - x) / 0.3, [0, 0, 0], 10.0);
            }
        }

        let p = Vec3::new(0.33, 0.42, 0.27);
        let sdf = map.sdf_trilinear(p).unwrap();
        assert_relative_eq!(sdf, (0.4 - 0.33) / 0.3, epsilon = 1e-5);

        let g = map.sdf_gradient(p).unwrap();
        assert_relative_eq!(g.x, -1.0 / 0.3, epsilon = 1e-3);
        assert_relative_eq!(g.y, 0.0, epsilon = 1e-4);

        // Outside the block the neighbourhood is unallocated.
        assert!(map.sdf_trilinear(Vec3::new(0.79, 0.4, 0.4)).is_none());
        assert_relative_eq!(map.sdf_nearest(Vec3::new(0.26, 0.05, 0.05)).unwrap(), 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_block_edge_uses_observed_voxels() {
        let mut map = MapStruct::allocate(small_config()).unwrap();
        map.allocate_blocks(&[IVec3::ZERO]);
        let voxel_size = map.config().voxel_size;
        {
            let (_, voxels) = map.allocated_blocks_mut();
            for (i, voxel) in voxels.iter_mut().enumerate() {
                let x = (crate::voxel::local_coord(i).x as f32 + 0.5) * voxel_size;
                voxel.fuse((0.4 - x) / 0.3, [0, 0, 0], 10.0);
            }
        }

        // Past the last voxel centre only the x = 0.75 layer is observed.
        let edge = Vec3::new(0.78, 0.42, 0.27);
        assert!(map.sdf_trilinear(edge).is_none());
        assert_relative_eq!(map.sdf_blended(edge).unwrap(), (0.4 - 0.75) / 0.3, epsilon = 1e-5);
        assert!(map.sdf_blended(Vec3::new(1.5, 0.4, 0.4)).is_none());

        // The +x neighbourhood is incomplete, so x falls back to one side.
        let g = map.sdf_gradient(Vec3::new(0.72, 0.42, 0.27)).unwrap();
        assert_relative_eq!(g.x, -1.0 / 0.3, epsilon = 1e-3);
        assert_relative_eq!(g.z, 0.0, epsilon = 1e-4);
        let g = map.sdf_gradient(edge).unwrap();
        assert!(g.x < 0.0);
    }
}
