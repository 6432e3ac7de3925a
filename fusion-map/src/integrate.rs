//! Depth integration: allocate blocks along the observed band, then fuse.
//!
//! The allocation pass walks every valid pixel's ray through the block grid
//! over `[d - trunc, d + trunc]` in parallel and collects candidate block
//! coordinates. Candidates are sorted and deduplicated, then committed to the
//! hash table serially, so which insertions fail under pressure is a pure
//! function of the input. The fuse pass then visits every allocated block in
//! parallel, one task per block.

use crate::config::MapConfig;
use crate::map_struct::MapStruct;
use crate::voxel::{BLOCK_SIZE, BLOCK_VOLUME, Voxel, local_coord};
use fusion_data::{Intrinsics, PixelMap};
use glam::{Affine3A, IVec3, Vec3};
use image::RgbImage;
use rayon::prelude::*;
use tracing::{debug, warn};

/// Counters from one [`update`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrationReport {
    /// Pixels whose depth was in range.
    pub valid_pixels: usize,
    /// Distinct block coordinates touched by the truncation band.
    pub candidate_blocks: usize,
    /// Blocks newly inserted this frame.
    pub allocated_blocks: usize,
    /// Candidates that could not be inserted.
    pub failed_allocations: usize,
    /// Voxel updates applied.
    pub fused_voxels: usize,
}

/// Fuse one depth image taken from `pose` (camera-to-world) into `map`.
///
/// `color` must have the same dimensions as `depth`; otherwise nothing is
/// integrated.
#[tracing::instrument(skip_all, fields(width = depth.width(), height = depth.height()))]
pub fn update(
    map: &mut MapStruct,
    depth: &PixelMap<f32>,
    color: &RgbImage,
    pose: &Affine3A,
    intrinsics: &Intrinsics,
) -> IntegrationReport {
    let mut report = IntegrationReport::default();
    if color.dimensions() != depth.dimensions() || depth.dimensions() != (intrinsics.width, intrinsics.height) {
        warn!(
            "Skipping integration: depth {:?}, colour {:?}, intrinsics {}x{}",
            depth.dimensions(),
            color.dimensions(),
            intrinsics.width,
            intrinsics.height
        );
        return report;
    }

    let config = *map.config();
    let (valid_pixels, candidates) = collect_candidate_blocks(depth, pose, intrinsics, &config);
    report.valid_pixels = valid_pixels;
    report.candidate_blocks = candidates.len();
    if valid_pixels == 0 {
        debug!("No valid depth in range, nothing to integrate");
        return report;
    }

    let summary = map.allocate_blocks(&candidates);
    report.allocated_blocks = summary.inserted;
    report.failed_allocations = summary.failed();

    let world_to_camera = pose.inverse();
    let (coords, voxels) = map.allocated_blocks_mut();
    report.fused_voxels = voxels
        .par_chunks_mut(BLOCK_VOLUME)
        .zip(coords.par_iter())
        .map(|(block, &coord)| fuse_block(block, coord, depth, color, &world_to_camera, intrinsics, &config))
        .sum();

    debug!(
        "Integrated {} pixels: {} candidate blocks, {} new, {} fused voxels",
        report.valid_pixels, report.candidate_blocks, report.allocated_blocks, report.fused_voxels
    );
    report
}

/// Sorted, unique block coordinates touched by the truncation band.
fn collect_candidate_blocks(
    depth: &PixelMap<f32>,
    pose: &Affine3A,
    intrinsics: &Intrinsics,
    config: &MapConfig,
) -> (usize, Vec<IVec3>) {
    let origin = Vec3::from(pose.translation);
    let extent = config.block_extent();
    let trunc = config.truncation_distance;

    let (valid, mut candidates) = depth
        .as_slice()
        .par_chunks(depth.width() as usize)
        .enumerate()
        .map(|(y, row)| {
            let mut valid = 0;
            let mut blocks = Vec::new();
            for (x, &d) in row.iter().enumerate() {
                if !config.depth_in_range(d) {
                    continue;
                }
                valid += 1;
                let point = intrinsics.backproject(x as f32, y as f32, d);
                let distance = point.length();
                let direction = pose.transform_vector3(point / distance);
                let start = origin + direction * (distance - trunc).max(0.0);
                let end = origin + direction * (distance + trunc);
                blocks_on_segment(start, end, extent, &mut blocks);
            }
            blocks.sort_unstable_by_key(|c| (c.x, c.y, c.z));
            blocks.dedup();
            (valid, blocks)
        })
        .reduce(
            || (0, Vec::new()),
            |(a, mut left), (b, mut right)| {
                left.append(&mut right);
                (a + b, left)
            },
        );

    candidates.par_sort_unstable_by_key(|c| (c.x, c.y, c.z));
    candidates.dedup();
    (valid, candidates)
}

/// Every block cell the segment passes through (3D DDA).
pub(crate) fn blocks_on_segment(start: Vec3, end: Vec3, extent: f32, out: &mut Vec<IVec3>) {
    let a = start / extent;
    let b = end / extent;
    let mut cell = a.floor().as_ivec3();
    let last = b.floor().as_ivec3();
    let delta = b - a;

    let mut step = IVec3::ZERO;
    let mut t_max = Vec3::splat(f32::INFINITY);
    let mut t_delta = Vec3::splat(f32::INFINITY);
    for axis in 0..3 {
        if delta[axis] > 0.0 {
            step[axis] = 1;
            t_max[axis] = ((cell[axis] + 1) as f32 - a[axis]) / delta[axis];
            t_delta[axis] = 1.0 / delta[axis];
        } else if delta[axis] < 0.0 {
            step[axis] = -1;
            t_max[axis] = (cell[axis] as f32 - a[axis]) / delta[axis];
            t_delta[axis] = -1.0 / delta[axis];
        }
    }

    out.push(cell);
    let steps = (last - cell).abs().element_sum();
    for _ in 0..steps {
        let axis = if t_max.x <= t_max.y && t_max.x <= t_max.z {
            0
        } else if t_max.y <= t_max.z {
            1
        } else {
            2
        };
        if t_max[axis] > 1.0 {
            break;
        }
        cell[axis] += step[axis];
        t_max[axis] += t_delta[axis];
        out.push(cell);
    }
    if cell != last {
        out.push(last);
    }
}

/// Fuse the current observation into one block. Returns the voxels updated.
fn fuse_block(
    block: &mut [Voxel],
    coord: IVec3,
    depth: &PixelMap<f32>,
    color: &RgbImage,
    world_to_camera: &Affine3A,
    intrinsics: &Intrinsics,
    config: &MapConfig,
) -> usize {
    let voxel_size = config.voxel_size;
    let trunc = config.truncation_distance;

    // Cull blocks whose bounding sphere misses the depth range.
    let half = config.block_extent() * 0.5;
    let centre = world_to_camera.transform_point3((coord * BLOCK_SIZE).as_vec3() * voxel_size + half);
    let radius = half * 3f32.sqrt();
    if centre.z + radius <= 0.0 || centre.z - radius > config.max_depth + trunc {
        return 0;
    }

    let base = coord * BLOCK_SIZE;
    let mut fused = 0;
    for (i, voxel) in block.iter_mut().enumerate() {
        let world = ((base + local_coord(i)).as_vec3() + 0.5) * voxel_size;
        let point = world_to_camera.transform_point3(world);
        if point.z <= 0.0 {
            continue;
        }
        // Voxels within one projected voxel of the image edge take the border
        // pixel, so rays through the outermost pixels find observed samples.
        let margin = intrinsics.fx.max(intrinsics.fy) * voxel_size / point.z;
        let Some((u, v)) = intrinsics.project_to_pixel_clamped(point, margin) else {
            continue;
        };
        let d = depth.get(u, v);
        if !config.depth_in_range(d) {
            continue;
        }
        // Distance along the viewing ray, not along the optical axis.
        let sdf = (d - point.z) * (point / point.z).length();
        if sdf.abs() > trunc {
            continue;
        }
        voxel.fuse(sdf / trunc, color.get_pixel(u, v).0, config.max_weight);
        fused += 1;
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;

    fn plane_setup(distance: f32) -> (MapStruct, PixelMap<f32>, RgbImage, Intrinsics) {
        let k = Intrinsics::new(16, 12, 12.0, 12.0, 7.5, 5.5);
        let config = MapConfig::default()
            .with_capacity(1024, 256, 512)
            .with_resolution(0.02, 0.08);
        let map = MapStruct::allocate(config).unwrap();
        let depth = PixelMap::new(16, 12, distance);
        let color = RgbImage::from_pixel(16, 12, Rgb([200, 100, 50]));
        (map, depth, color, k)
    }

    #[test]
    fn test_segment_walk_is_connected() {
        let mut cells = Vec::new();
        blocks_on_segment(Vec3::new(0.05, 0.05, 0.05), Vec3::new(0.95, 0.35, -0.25), 0.1, &mut cells);
        assert_eq!(cells.first(), Some(&IVec3::new(0, 0, 0)));
        assert_eq!(cells.last(), Some(&IVec3::new(9, 3, -3)));
        for pair in cells.windows(2) {
            assert_eq!((pair[1] - pair[0]).abs().element_sum(), 1);
        }
    }

    #[test]
    fn test_segment_inside_one_cell() {
        let mut cells = Vec::new();
        blocks_on_segment(Vec3::splat(0.01), Vec3::splat(0.02), 1.0, &mut cells);
        assert_eq!(cells, vec![IVec3::ZERO]);
    }

    #[test]
    fn test_plane_integration_fuses_band() {
        let (mut map, depth, color, k) = plane_setup(1.0);
        let report = update(&mut map, &depth, &color, &Affine3A::IDENTITY, &k);

        assert_eq!(report.valid_pixels, 16 * 12);
        assert_eq!(report.failed_allocations, 0);
        assert_eq!(report.allocated_blocks, map.allocated_block_count());
        assert!(report.fused_voxels > 0);

        // Right in front of the plane along the optical axis.
        let sdf = map.sdf_nearest(Vec3::new(0.0, 0.0, 0.97)).unwrap();
        assert!(sdf > 0.0);
        let sdf = map.sdf_nearest(Vec3::new(0.0, 0.0, 1.03)).unwrap();
        assert!(sdf < 0.0);
        let voxel = map.voxel(map.world_to_voxel(Vec3::new(0.0, 0.0, 0.99))).unwrap();
        assert_eq!(voxel.rgb(), [200, 100, 50]);
        assert_relative_eq!(voxel.weight, 1.0);

        // Far outside the band nothing was observed.
        assert!(map.sdf_nearest(Vec3::new(0.0, 0.0, 0.5)).is_none());
    }

    #[test]
    fn test_voxels_at_the_frustum_edge_are_fused() {
        let (mut map, depth, color, k) = plane_setup(1.0);
        update(&mut map, &depth, &color, &Affine3A::IDENTITY, &k);

        // Projects to u = -0.62, just left of the first pixel column.
        let edge = Vec3::new(-0.67, 0.01, 0.99);
        assert!(k.project_to_pixel(edge).is_none());
        let voxel = map.voxel(map.world_to_voxel(edge)).unwrap();
        assert!(voxel.is_observed());
        assert!(voxel.sdf > 0.0);
    }

    #[test]
    fn test_repeated_integration_grows_weight_only() {
        let (mut map, depth, color, k) = plane_setup(1.0);
        update(&mut map, &depth, &color, &Affine3A::IDENTITY, &k);
        let blocks = map.allocated_block_count();
        let second = update(&mut map, &depth, &color, &Affine3A::IDENTITY, &k);
        assert_eq!(second.allocated_blocks, 0);
        assert_eq!(map.allocated_block_count(), blocks);
        let voxel = map.voxel(map.world_to_voxel(Vec3::new(0.0, 0.0, 0.99))).unwrap();
        assert_relative_eq!(voxel.weight, 2.0);
    }

    #[test]
    fn test_invalid_depth_is_a_no_op() {
        let (mut map, _, color, k) = plane_setup(1.0);
        let depth = PixelMap::new(16, 12, 0.0);
        let report = update(&mut map, &depth, &color, &Affine3A::IDENTITY, &k);
        assert_eq!(report, IntegrationReport::default());
        assert_eq!(map.allocated_block_count(), 0);
    }

    #[test]
    fn test_mismatched_colour_is_rejected() {
        let (mut map, depth, _, k) = plane_setup(1.0);
        let report = update(&mut map, &depth, &RgbImage::new(4, 4), &Affine3A::IDENTITY, &k);
        assert_eq!(report.valid_pixels, 0);
        assert_eq!(map.allocated_block_count(), 0);
    }

    #[test]
    fn test_tiny_pool_fails_deterministically() {
        let (_, depth, color, k) = plane_setup(1.0);
        let config = MapConfig::default()
            .with_capacity(1024, 256, 3)
            .with_resolution(0.02, 0.08);
        let mut a = MapStruct::allocate(config).unwrap();
        let mut b = MapStruct::allocate(config).unwrap();
        let ra = update(&mut a, &depth, &color, &Affine3A::IDENTITY, &k);
        let rb = update(&mut b, &depth, &color, &Affine3A::IDENTITY, &k);
        assert_eq!(ra, rb);
        assert_eq!(a.allocated_block_count(), 3);
        assert!(ra.failed_allocations > 0);
        assert_eq!(a.block_coords(), b.block_coords());
    }
}
