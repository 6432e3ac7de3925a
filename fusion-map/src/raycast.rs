//! Surface prediction by marching the distance field.

use crate::map_struct::{MapStruct, VoxelSampler};
use crate::visibility::ZRangeMap;
use fusion_data::{Intrinsics, NormalMap, PixelMap, VertexMap};
use glam::{Affine3A, Vec3};
use image::{Rgb, RgbImage};
use rayon::prelude::*;
use tracing::debug;

/// Camera-frame vertex and normal maps rendered from the map.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfacePrediction {
    pub vmap: VertexMap,
    pub nmap: NormalMap,
    /// Camera-to-world pose the maps were rendered from.
    pub pose: Affine3A,
}

impl SurfacePrediction {
    pub fn hit_count(&self) -> usize {
        self.vmap.valid_count()
    }
}

/// Render vertices and normals seen from `pose` (camera-to-world).
///
/// Each ray is marched only through its tile's depth interval, with a step of
/// half the truncation distance. The first front-to-back zero crossing is
/// refined linearly; a back-to-front crossing ends the ray without a hit.
#[tracing::instrument(skip_all)]
pub fn raycast(map: &MapStruct, zrange: &ZRangeMap, pose: &Affine3A, intrinsics: &Intrinsics) -> SurfacePrediction {
    let (width, height) = (intrinsics.width, intrinsics.height);
    let mut vmap = PixelMap::new(width, height, None);
    let mut nmap = PixelMap::new(width, height, None);
    let world_to_camera = pose.inverse();
    let step = map.config().raycast_step();

    vmap.as_mut_slice()
        .par_chunks_mut(width as usize)
        .zip(nmap.as_mut_slice().par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(y, (vrow, nrow))| {
            let mut sampler = map.sampler();
            for x in 0..width as usize {
                let Some((near, far)) = zrange.range_for_pixel(x as u32, y as u32) else {
                    continue;
                };
                let ray = intrinsics.ray(x as f32, y as f32);
                let Some((vertex, normal)) = cast_ray(&mut sampler, ray, near, far, step, pose, &world_to_camera)
                else {
                    continue;
                };
                vrow[x] = Some(vertex);
                nrow[x] = normal;
            }
        });

    let prediction = SurfacePrediction {
        vmap,
        nmap,
        pose: *pose,
    };
    debug!("Raycast hit {} of {} pixels", prediction.hit_count(), width * height);
    prediction
}

/// March one camera ray (with `z == 1`) between the camera depths `near` and
/// `far`. Returns the camera-frame hit and its normal if one could be formed.
///
/// Samples use the voxel containing the point, or a blend of the observed
/// neighbours when that voxel is unobserved. The last observed sample is kept
/// across unobserved gaps of up to one truncation distance.
fn cast_ray(
    sampler: &mut VoxelSampler<'_>,
    ray: Vec3,
    near: f32,
    far: f32,
    step: f32,
    pose: &Affine3A,
    world_to_camera: &Affine3A,
) -> Option<(Vec3, Option<Vec3>)> {
    let length = ray.length();
    let direction = ray / length;
    let origin = Vec3::from(pose.translation);
    let world_direction = pose.transform_vector3(direction);
    let t_end = far * length;
    let max_gap = 2.0 * step;

    let mut t = near * length;
    let mut previous: Option<(f32, f32)> = None;
    while t <= t_end {
        let point = origin + world_direction * t;
        let sample = sampler.sdf_nearest(point).or_else(|| sampler.sdf_blended(point));
        let hit = match (previous, sample) {
            (_, Some(s)) if s == 0.0 && previous.is_none_or(|(_, sp)| sp > 0.0) => Some(t),
            (Some((tp, sp)), Some(s)) if sp > 0.0 && s < 0.0 => Some(tp + (t - tp) * sp / (sp - s)),
            (Some((_, sp)), Some(s)) if sp <= 0.0 && s > 0.0 => return None,
            _ => None,
        };
        if let Some(hit) = hit {
            let normal = sampler
                .gradient(origin + world_direction * hit)
                .map(|g| world_to_camera.transform_vector3(g).normalize_or_zero())
                .filter(|n| *n != Vec3::ZERO);
            return Some((direction * hit, normal));
        }
        match sample {
            Some(s) => previous = Some((t, s)),
            None if previous.is_some_and(|(tp, _)| t - tp > max_gap) => previous = None,
            None => {}
        }
        t += step;
    }
    None
}

/// Headlight Lambertian term for a camera-frame vertex and normal.
fn headlight(vertex: Vec3, normal: Vec3) -> f32 {
    let light = -vertex.normalize_or_zero();
    0.2 + 0.8 * normal.dot(light).max(0.0)
}

fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Headlight Lambertian shading of a surface prediction. Pixels without a
/// vertex and normal are black.
pub fn render_shaded(vmap: &VertexMap, nmap: &NormalMap) -> RgbImage {
    let (width, height) = vmap.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let (Some(vertex), Some(Some(normal))) = (vmap.get(x, y), nmap.get_checked(x as i64, y as i64)) else {
            return Rgb([0, 0, 0]);
        };
        let value = to_channel(headlight(vertex, normal) * 255.0);
        Rgb([value, value, value])
    })
}

/// [`render_shaded`] modulated by the fused colour of the voxel under each
/// hit. Hits on unobserved voxels keep the plain grey shade.
pub fn render_textured(map: &MapStruct, prediction: &SurfacePrediction) -> RgbImage {
    let (width, height) = prediction.vmap.dimensions();
    let mut sampler = map.sampler();
    RgbImage::from_fn(width, height, |x, y| {
        let (Some(vertex), Some(Some(normal))) = (
            prediction.vmap.get(x, y),
            prediction.nmap.get_checked(x as i64, y as i64),
        ) else {
            return Rgb([0, 0, 0]);
        };
        let world = prediction.pose.transform_point3(vertex);
        let rgb = sampler
            .voxel(map.world_to_voxel(world))
            .filter(|v| v.is_observed())
            .map_or([255; 3], |v| v.rgb());
        let shade = headlight(vertex, normal);
        Rgb(rgb.map(|c| to_channel(c as f32 * shade)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::integrate;
    use crate::visibility::{create_rendering_blocks, update_visible_blocks};
    use approx::assert_relative_eq;

    fn fused_plane(distance: f32) -> (MapStruct, ZRangeMap, Intrinsics) {
        let k = Intrinsics::new(24, 16, 20.0, 20.0, 11.5, 7.5);
        let config = MapConfig::default()
            .with_capacity(2048, 512, 1024)
            .with_resolution(0.01, 0.04);
        let mut map = MapStruct::allocate(config).unwrap();
        let depth = PixelMap::new(24, 16, distance);
        let color = RgbImage::new(24, 16);
        integrate::update(&mut map, &depth, &color, &Affine3A::IDENTITY, &k);
        update_visible_blocks(&mut map, &Affine3A::IDENTITY, &k);
        let mut zrange = ZRangeMap::new(&k);
        create_rendering_blocks(&mut map, &mut zrange, &Affine3A::IDENTITY, &k);
        (map, zrange, k)
    }

    #[test]
    fn test_plane_prediction() {
        let (map, zrange, k) = fused_plane(1.0);
        let prediction = raycast(&map, &zrange, &Affine3A::IDENTITY, &k);
        assert_eq!(prediction.hit_count(), 24 * 16);
        for vertex in prediction.vmap.as_slice().iter().flatten() {
            assert!((vertex.z - 1.0).abs() < 0.04, "vertex {vertex:?}");
        }
        let n = prediction.nmap.get(12, 8).unwrap();
        assert_relative_eq!(n.z, -1.0, epsilon = 0.05);

        // Rim pixels get normals from one-sided differences.
        assert_eq!(prediction.nmap.valid_count(), 24 * 16);
        assert!(prediction.nmap.get(0, 0).is_some_and(|n| n.z < -0.8));
        assert!(prediction.nmap.get(23, 15).is_some_and(|n| n.z < -0.8));
    }

    /// One block with voxel 0.1 whose layers along z hold the given values,
    /// `None` leaving a layer unobserved.
    fn layered_map(layer: impl Fn(i32) -> Option<f32>) -> MapStruct {
        let config = MapConfig::default()
            .with_capacity(64, 16, 8)
            .with_resolution(0.1, 0.3);
        let mut map = MapStruct::allocate(config).unwrap();
        map.allocate_blocks(&[glam::IVec3::ZERO]);
        let (_, voxels) = map.allocated_blocks_mut();
        for (i, voxel) in voxels.iter_mut().enumerate() {
            if let Some(sdf) = layer(crate::voxel::local_coord(i).z) {
                voxel.fuse(sdf, [40, 80, 120], 10.0);
            }
        }
        map
    }

    fn march(map: &MapStruct, near: f32) -> Option<(Vec3, Option<Vec3>)> {
        let step = map.config().raycast_step();
        let identity = Affine3A::IDENTITY;
        cast_ray(&mut map.sampler(), Vec3::Z, near, 0.7, step, &identity, &identity)
    }

    #[test]
    fn test_zero_first_sample_is_a_hit() {
        let map = layered_map(|z| Some(match z.cmp(&2) {
            std::cmp::Ordering::Less => 0.5,
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Greater => -0.5,
        }));
        let (vertex, _) = march(&map, 0.25).unwrap();
        assert_relative_eq!(vertex.z, 0.25, epsilon = 1e-5);
    }

    #[test]
    fn test_crossing_spans_unobserved_layer() {
        let map = layered_map(|z| match z {
            2 => None,
            z if z < 2 => Some(0.5),
            _ => Some(-0.5),
        });
        let (vertex, _) = march(&map, 0.1).unwrap();
        assert_relative_eq!(vertex.z, 0.25, epsilon = 1e-4);
    }

    #[test]
    fn test_back_face_ends_the_ray() {
        let map = layered_map(|z| Some(if z < 3 { -0.5 } else { 0.5 }));
        assert!(march(&map, 0.1).is_none());
    }

    #[test]
    fn test_empty_map_predicts_nothing() {
        let k = Intrinsics::new(8, 8, 10.0, 10.0, 3.5, 3.5);
        let map = MapStruct::allocate(MapConfig::default().with_capacity(64, 16, 16)).unwrap();
        let prediction = raycast(&map, &ZRangeMap::new(&k), &Affine3A::IDENTITY, &k);
        assert_eq!(prediction.hit_count(), 0);
        assert_eq!(prediction.nmap.valid_count(), 0);
    }

    #[test]
    fn test_shading() {
        let mut vmap = PixelMap::new(2, 1, None);
        let mut nmap = PixelMap::new(2, 1, None);
        vmap.set(0, 0, Some(Vec3::new(0.0, 0.0, 1.0)));
        nmap.set(0, 0, Some(Vec3::new(0.0, 0.0, -1.0)));
        let image = render_shaded(&vmap, &nmap);
        assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_textured_shading_uses_voxel_colour() {
        let map = layered_map(|_| Some(0.0));
        let mut vmap = PixelMap::new(2, 1, None);
        let mut nmap = PixelMap::new(2, 1, None);
        vmap.set(0, 0, Some(Vec3::new(0.05, 0.05, 0.25)));
        nmap.set(0, 0, Some(-Vec3::new(0.05, 0.05, 0.25).normalize()));
        vmap.set(1, 0, Some(Vec3::new(5.0, 5.0, 5.0)));
        nmap.set(1, 0, Some(-Vec3::ONE.normalize()));
        let prediction = SurfacePrediction {
            vmap,
            nmap,
            pose: Affine3A::IDENTITY,
        };

        let image = render_textured(&map, &prediction);
        assert_eq!(image.get_pixel(0, 0).0, [40, 80, 120]);
        // Outside the map the plain shade remains.
        assert_eq!(image.get_pixel(1, 0).0, [255, 255, 255]);
    }
}
