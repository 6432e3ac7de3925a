//! Visible-block selection and per-tile depth bounds.
//!
//! The image is divided into square tiles of [`TILE_SIZE`] pixels. Every
//! visible block is projected to a tile rectangle carrying the block's depth
//! interval; wide rectangles are split into spans of at most
//! [`RENDERING_BLOCK_TILES`] tiles per side. The [`ZRangeMap`] then stores, per
//! tile, the union of the intervals covering it, which bounds where the
//! raycaster needs to march.

use crate::map_struct::MapStruct;
use fusion_data::{Intrinsics, PixelMap};
use glam::{Affine3A, IVec3, UVec2, Vec2, Vec3};
use rayon::prelude::*;
use tracing::{debug, warn};

/// Pixels per tile edge.
pub const TILE_SIZE: u32 = 8;
/// Maximum tiles per rendering block edge.
pub const RENDERING_BLOCK_TILES: u32 = 16;

/// A screen rectangle in tile coordinates (inclusive) with a depth interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderingBlock {
    pub upper_left: UVec2,
    pub lower_right: UVec2,
    /// `(near, far)` camera depth.
    pub z_range: Vec2,
}

/// Per-tile `(near, far)` depth bounds for the current view.
#[derive(Debug, Clone)]
pub struct ZRangeMap {
    near: PixelMap<f32>,
    far: PixelMap<f32>,
}

impl ZRangeMap {
    /// Tile grid covering an image of the given intrinsics.
    pub fn new(intrinsics: &Intrinsics) -> Self {
        let width = intrinsics.width.div_ceil(TILE_SIZE);
        let height = intrinsics.height.div_ceil(TILE_SIZE);
        Self {
            near: PixelMap::new(width, height, f32::INFINITY),
            far: PixelMap::new(width, height, f32::NEG_INFINITY),
        }
    }

    pub fn tile_dimensions(&self) -> (u32, u32) {
        self.near.dimensions()
    }

    pub fn clear(&mut self) {
        self.near.fill(f32::INFINITY);
        self.far.fill(f32::NEG_INFINITY);
    }

    /// Bounds of the tile containing pixel `(x, y)`, `None` if no block covers it.
    pub fn range_for_pixel(&self, x: u32, y: u32) -> Option<(f32, f32)> {
        let (tx, ty) = (x / TILE_SIZE, y / TILE_SIZE);
        let near = self.near.get_checked(tx as i64, ty as i64)?;
        let far = self.far.get_checked(tx as i64, ty as i64)?;
        (near <= far).then_some((near, far))
    }

    /// Tiles with a depth interval.
    pub fn covered_tiles(&self) -> usize {
        self.near
            .as_slice()
            .iter()
            .zip(self.far.as_slice())
            .filter(|(n, f)| n <= f)
            .count()
    }

    fn include(&mut self, block: &RenderingBlock) {
        let (width, height) = self.tile_dimensions();
        for ty in block.upper_left.y..=block.lower_right.y.min(height - 1) {
            for tx in block.upper_left.x..=block.lower_right.x.min(width - 1) {
                if self.near.get(tx, ty) > block.z_range.x {
                    self.near.set(tx, ty, block.z_range.x);
                }
                if self.far.get(tx, ty) < block.z_range.y {
                    self.far.set(tx, ty, block.z_range.y);
                }
            }
        }
    }
}

/// Screen footprint of one block in continuous pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Footprint {
    min: Vec2,
    max: Vec2,
    z_near: f32,
    z_far: f32,
}

const CORNERS: [Vec3; 8] = [
    Vec3::new(0.0, 0.0, 0.0),
    Vec3::new(1.0, 0.0, 0.0),
    Vec3::new(1.0, 1.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
    Vec3::new(0.0, 0.0, 1.0),
    Vec3::new(1.0, 0.0, 1.0),
    Vec3::new(1.0, 1.0, 1.0),
    Vec3::new(0.0, 1.0, 1.0),
];

fn block_footprint(
    map: &MapStruct,
    coord: IVec3,
    world_to_camera: &Affine3A,
    intrinsics: &Intrinsics,
) -> Option<Footprint> {
    let config = map.config();
    let origin = map.block_origin(coord);
    let extent = config.block_extent();
    let corners = CORNERS.map(|c| world_to_camera.transform_point3(origin + c * extent));

    let z_min = corners.iter().map(|c| c.z).fold(f32::INFINITY, f32::min);
    let z_max = corners.iter().map(|c| c.z).fold(f32::NEG_INFINITY, f32::max);
    if z_max <= config.min_depth || z_min > config.max_depth {
        return None;
    }

    let image_max = Vec2::new(intrinsics.width as f32 - 1.0, intrinsics.height as f32 - 1.0);
    let z_far = z_max.min(config.max_depth);

    // A block straddling the near plane cannot be projected; cover everything.
    if z_min < config.min_depth {
        return Some(Footprint {
            min: Vec2::ZERO,
            max: image_max,
            z_near: config.min_depth,
            z_far,
        });
    }

    let mut min = Vec2::splat(f32::INFINITY);
    let mut max = Vec2::splat(f32::NEG_INFINITY);
    for corner in corners {
        let uv = intrinsics.project(corner)?;
        min = min.min(uv);
        max = max.max(uv);
    }
    if max.x < 0.0 || max.y < 0.0 || min.x > image_max.x || min.y > image_max.y {
        return None;
    }

    Some(Footprint {
        min: min.max(Vec2::ZERO),
        max: max.min(image_max),
        z_near: z_min,
        z_far,
    })
}

/// Recompute the list of allocated blocks inside the view frustum.
#[tracing::instrument(skip_all)]
pub fn update_visible_blocks(map: &mut MapStruct, pose: &Affine3A, intrinsics: &Intrinsics) -> usize {
    let world_to_camera = pose.inverse();
    let visible: Vec<u32> = {
        let map = &*map;
        map.block_coords()
            .par_iter()
            .enumerate()
            .filter(|(_, coord)| block_footprint(map, **coord, &world_to_camera, intrinsics).is_some())
            .map(|(index, _)| index as u32)
            .collect()
    };
    let count = visible.len();
    debug!("{} of {} blocks visible", count, map.allocated_block_count());
    map.set_visible_blocks(visible);
    count
}

/// Split a footprint into rendering blocks of at most
/// [`RENDERING_BLOCK_TILES`] tiles per side.
fn split_footprint(footprint: &Footprint, out: &mut Vec<RenderingBlock>) {
    let ul = (footprint.min.floor().as_uvec2()) / TILE_SIZE;
    let lr = (footprint.max.ceil().as_uvec2()) / TILE_SIZE;
    let z_range = Vec2::new(footprint.z_near, footprint.z_far);

    let mut y = ul.y;
    while y <= lr.y {
        let y_end = (y + RENDERING_BLOCK_TILES - 1).min(lr.y);
        let mut x = ul.x;
        while x <= lr.x {
            let x_end = (x + RENDERING_BLOCK_TILES - 1).min(lr.x);
            out.push(RenderingBlock {
                upper_left: UVec2::new(x, y),
                lower_right: UVec2::new(x_end, y_end),
                z_range,
            });
            x = x_end + 1;
        }
        y = y_end + 1;
    }
}

/// Project the visible blocks into rendering blocks and rebuild `zrange`.
///
/// Rendering blocks past the configured capacity are dropped with a warning.
/// Returns the number kept.
#[tracing::instrument(skip_all)]
pub fn create_rendering_blocks(
    map: &mut MapStruct,
    zrange: &mut ZRangeMap,
    pose: &Affine3A,
    intrinsics: &Intrinsics,
) -> usize {
    let world_to_camera = pose.inverse();
    let mut blocks: Vec<RenderingBlock> = {
        let map = &*map;
        map.visible_blocks()
            .par_iter()
            .map(|&index| {
                let mut out = Vec::new();
                if let Some(footprint) = block_footprint(map, map.block_coord(index), &world_to_camera, intrinsics) {
                    split_footprint(&footprint, &mut out);
                }
                out
            })
            .flatten_iter()
            .collect()
    };

    let capacity = map.config().rendering_block_capacity;
    if blocks.len() > capacity {
        warn!(
            "{} rendering blocks exceed capacity {}, dropping the rest",
            blocks.len(),
            capacity
        );
        blocks.truncate(capacity);
    }

    zrange.clear();
    for block in &blocks {
        zrange.include(block);
    }

    let count = blocks.len();
    debug!("{} rendering blocks, {} tiles covered", count, zrange.covered_tiles());
    map.set_rendering_blocks(blocks);
    count
}
