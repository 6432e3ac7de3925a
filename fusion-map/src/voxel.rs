//! Voxels and block-local addressing.

use bytemuck::{Pod, Zeroable};
use glam::IVec3;

/// Voxels per block edge.
pub const BLOCK_SIZE: i32 = 8;
/// Voxels per block.
pub const BLOCK_VOLUME: usize = (BLOCK_SIZE * BLOCK_SIZE * BLOCK_SIZE) as usize;

/// One cell of the distance field.
///
/// `sdf` is normalised by the truncation distance to `[-1, 1]`, positive in
/// front of the surface. A zero `weight` means no evidence has been fused.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Voxel {
    pub sdf: f32,
    pub weight: f32,
    /// RGB plus one unused byte.
    pub color: [u8; 4],
}

impl Voxel {
    pub const EMPTY: Voxel = Voxel {
        sdf: 1.0,
        weight: 0.0,
        color: [0; 4],
    };

    #[inline]
    pub fn is_observed(&self) -> bool {
        self.weight > 0.0
    }

    pub fn rgb(&self) -> [u8; 3] {
        [self.color[0], self.color[1], self.color[2]]
    }

    /// Running weighted average with an observation of weight one.
    pub fn fuse(&mut self, sdf: f32, rgb: [u8; 3], max_weight: f32) {
        let w = self.weight;
        let blend = |old: f32, new: f32| (old * w + new) / (w + 1.0);

        self.sdf = blend(self.sdf, sdf).clamp(-1.0, 1.0);
        for (channel, observed) in self.color.iter_mut().zip(rgb) {
            *channel = blend(*channel as f32, observed as f32).round().clamp(0.0, 255.0) as u8;
        }
        self.weight = (w + 1.0).min(max_weight);
    }
}

impl Default for Voxel {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Linear index of a block-local coordinate (x fastest).
#[inline]
pub fn local_index(local: IVec3) -> usize {
    (local.x + local.y * BLOCK_SIZE + local.z * BLOCK_SIZE * BLOCK_SIZE) as usize
}

/// Inverse of [`local_index`].
#[inline]
pub fn local_coord(index: usize) -> IVec3 {
    let i = index as i32;
    IVec3::new(
        i % BLOCK_SIZE,
        (i / BLOCK_SIZE) % BLOCK_SIZE,
        i / (BLOCK_SIZE * BLOCK_SIZE),
    )
}

/// Block containing a global voxel coordinate.
#[inline]
pub fn voxel_to_block(voxel: IVec3) -> IVec3 {
    voxel.div_euclid(IVec3::splat(BLOCK_SIZE))
}

/// Position of a global voxel coordinate inside its block.
#[inline]
pub fn voxel_to_local(voxel: IVec3) -> IVec3 {
    voxel.rem_euclid(IVec3::splat(BLOCK_SIZE))
}
