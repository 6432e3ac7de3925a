//! Immutable RGB-D captures.
//!
//! A frame is shared between the orchestration layer, the odometry and the
//! map, so it is handed around as [`FrameRef`]. Only the pose and the
//! reference link are mutable after construction.

use crate::intrinsics::Intrinsics;
use crate::pixel_map::{NormalMap, PixelMap, VertexMap, is_valid_depth};
use glam::Affine3A;
use image::{ImageBuffer, Luma, RgbImage};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::debug;

/// Metric single-channel depth image.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Shared handle to a frame.
pub type FrameRef = Arc<RgbdFrame>;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Depth is {depth:?} but colour is {color:?}")]
    DimensionMismatch {
        depth: (u32, u32),
        color: (u32, u32),
    },

    #[error("Image is {image:?} but intrinsics expect {intrinsics:?}")]
    IntrinsicsMismatch {
        image: (u32, u32),
        intrinsics: (u32, u32),
    },

    #[error("Empty image")]
    Empty,
}

/// One captured depth + colour pair with its derived geometry.
#[derive(Debug)]
pub struct RgbdFrame {
    id: usize,
    timestamp: f64,
    image: RgbImage,
    depth: PixelMap<f32>,
    vmap: VertexMap,
    nmap: NormalMap,
    pose: RwLock<Option<Affine3A>>,
    reference: RwLock<Weak<RgbdFrame>>,
}

impl RgbdFrame {
    /// Create a frame from aligned depth and colour images.
    ///
    /// Depth samples that are not finite and positive are stored as `0.0`
    /// (no measurement). The vertex and normal maps are computed here, once.
    pub fn new(
        depth: &DepthImage,
        image: RgbImage,
        id: usize,
        timestamp: f64,
        intrinsics: &Intrinsics,
    ) -> Result<Self, FrameError> {
        if depth.dimensions() != image.dimensions() {
            return Err(FrameError::DimensionMismatch {
                depth: depth.dimensions(),
                color: image.dimensions(),
            });
        }
        if depth.dimensions() != (intrinsics.width, intrinsics.height) {
            return Err(FrameError::IntrinsicsMismatch {
                image: depth.dimensions(),
                intrinsics: (intrinsics.width, intrinsics.height),
            });
        }
        let (width, height) = depth.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }

        let samples: Vec<f32> = depth
            .as_raw()
            .iter()
            .map(|&d| if is_valid_depth(d) { d } else { 0.0 })
            .collect();
        let depth = PixelMap::from_vec(width, height, samples).ok_or(FrameError::Empty)?;
        let vmap = vertex_map_from_depth(&depth, intrinsics);
        let nmap = normal_map_from_vertices(&vmap);

        debug!(
            "Frame {} created: {}x{}, {} valid depth samples",
            id,
            width,
            height,
            vmap.valid_count()
        );

        Ok(Self {
            id,
            timestamp,
            image,
            depth,
            vmap,
            nmap,
            pose: RwLock::new(None),
            reference: RwLock::new(Weak::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Source colour image (8-bit RGB).
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Sanitised metric depth.
    pub fn depth(&self) -> &PixelMap<f32> {
        &self.depth
    }

    pub fn vmap(&self) -> &VertexMap {
        &self.vmap
    }

    pub fn nmap(&self) -> &NormalMap {
        &self.nmap
    }

    /// Camera-to-world pose, `None` until tracking has succeeded.
    pub fn pose(&self) -> Option<Affine3A> {
        *self.pose.read()
    }

    pub fn set_pose(&self, pose: Affine3A) {
        *self.pose.write() = Some(pose);
    }

    /// The frame this one was tracked against, if it is still alive.
    pub fn reference_frame(&self) -> Option<FrameRef> {
        self.reference.read().upgrade()
    }

    pub fn set_reference_frame(&self, reference: &FrameRef) {
        *self.reference.write() = Arc::downgrade(reference);
    }
}

/// Back-project every valid depth sample into camera space.
pub fn vertex_map_from_depth(depth: &PixelMap<f32>, intrinsics: &Intrinsics) -> VertexMap {
    let (width, height) = depth.dimensions();
    let mut vmap = PixelMap::new(width, height, None);
    vmap.as_mut_slice()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let d = depth.get(x as u32, y as u32);
                if is_valid_depth(d) {
                    *out = Some(intrinsics.backproject(x as f32, y as f32, d));
                }
            }
        });
    vmap
}

/// Normals from the cross product of forward neighbour differences, oriented
/// toward the camera. The last row and column have no forward neighbour.
pub fn normal_map_from_vertices(vmap: &VertexMap) -> NormalMap {
    let (width, height) = vmap.dimensions();
    let mut nmap = PixelMap::new(width, height, None);
    nmap.as_mut_slice()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i64;
            for (x, out) in row.iter_mut().enumerate() {
                let x = x as i64;
                let (Some(Some(v)), Some(Some(vx)), Some(Some(vy))) = (
                    vmap.get_checked(x, y),
                    vmap.get_checked(x + 1, y),
                    vmap.get_checked(x, y + 1),
                ) else {
                    continue;
                };
                let n = (vx - v).cross(vy - v).normalize_or_zero();
                if n == glam::Vec3::ZERO {
                    continue;
                }
                *out = Some(if n.dot(v) > 0.0 { -n } else { n });
            }
        });
    nmap
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn flat_depth(width: u32, height: u32, value: f32) -> DepthImage {
        DepthImage::from_pixel(width, height, Luma([value]))
    }

    fn small_intrinsics() -> Intrinsics {
        Intrinsics::new(8, 6, 10.0, 10.0, 3.5, 2.5)
    }

    #[test]
    fn test_frame_derives_geometry() {
        let k = small_intrinsics();
        let frame = RgbdFrame::new(&flat_depth(8, 6, 2.0), RgbImage::new(8, 6), 0, 0.0, &k).unwrap();
        let v = frame.vmap().get(3, 2).unwrap();
        assert_relative_eq!(v.z, 2.0);
        let n = frame.nmap().get(3, 2).unwrap();
        // Facing the camera.
        assert_relative_eq!(n.z, -1.0, epsilon = 1e-5);
        assert!(frame.nmap().get(7, 5).is_none());
    }

    #[test]
    fn test_frame_sanitises_depth() {
        let k = small_intrinsics();
        let mut depth = flat_depth(8, 6, 1.0);
        depth.put_pixel(1, 1, Luma([f32::NAN]));
        depth.put_pixel(2, 1, Luma([-3.0]));
        let frame = RgbdFrame::new(&depth, RgbImage::new(8, 6), 0, 0.0, &k).unwrap();
        assert_eq!(frame.depth().get(1, 1), 0.0);
        assert_eq!(frame.depth().get(2, 1), 0.0);
        assert!(frame.vmap().get(1, 1).is_none());
        assert_eq!(frame.vmap().valid_count(), 46);
    }

    #[test]
    fn test_frame_rejects_mismatched_images() {
        let k = small_intrinsics();
        let err = RgbdFrame::new(&flat_depth(8, 6, 1.0), RgbImage::new(4, 4), 0, 0.0, &k);
        assert!(matches!(err, Err(FrameError::DimensionMismatch { .. })));

        let err = RgbdFrame::new(&flat_depth(4, 4, 1.0), RgbImage::new(4, 4), 0, 0.0, &k);
        assert!(matches!(err, Err(FrameError::IntrinsicsMismatch { .. })));
    }

    #[test]
    fn test_pose_and_reference() {
        let k = small_intrinsics();
        let a = Arc::new(RgbdFrame::new(&flat_depth(8, 6, 1.0), RgbImage::new(8, 6), 0, 0.0, &k).unwrap());
        let b = Arc::new(RgbdFrame::new(&flat_depth(8, 6, 1.0), RgbImage::new(8, 6), 1, 0.1, &k).unwrap());
        assert!(b.pose().is_none());
        b.set_pose(Affine3A::from_translation(glam::Vec3::X));
        assert_eq!(b.pose().unwrap().translation.x, 1.0);

        b.set_reference_frame(&a);
        assert_eq!(b.reference_frame().unwrap().id(), 0);
        drop(a);
        assert!(b.reference_frame().is_none());
    }
}
