//! RGB-D stream interfaces for frame ingestion

use crate::frame::DepthImage;
use crate::intrinsics::Intrinsics;
use glam::{Affine3A, Vec3};
use image::{Luma, Rgb, RgbImage};
use rayon::prelude::*;

/// A single depth + colour capture from a stream
#[derive(Debug, Clone)]
pub struct RgbdCapture {
    /// Metric depth, 0 where there is no measurement
    pub depth: DepthImage,
    /// 8-bit RGB aligned with `depth`
    pub color: RgbImage,
    /// Timestamp in seconds (relative to stream start)
    pub timestamp: f64,
    /// Camera-to-world pose when the source knows it (synthetic or recorded)
    pub ground_truth: Option<Affine3A>,
}

impl RgbdCapture {
    /// Get image dimensions (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.depth.dimensions()
    }
}

/// Trait for RGB-D stream sources
pub trait RgbdStream {
    /// Get the next capture from the stream
    /// Returns None when the stream ends
    fn next_frame(&mut self) -> Result<Option<RgbdCapture>, StreamError>;

    /// Get the frame rate (frames per second), if known
    fn frame_rate(&self) -> Option<f32>;

    /// Check if the stream is still active
    fn is_active(&self) -> bool;
}

/// Reasons a stream cannot produce its next capture.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Invalid intrinsics: {0:?}")]
    InvalidIntrinsics(Intrinsics),
    #[error("Pose {0} of the trajectory is not finite")]
    InvalidPose(usize),
}

/// Analytic scenes that can be rendered to exact depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyntheticScene {
    /// The world plane `z = distance`.
    Plane { distance: f32 },
    /// A solid sphere.
    Sphere { center: Vec3, radius: f32 },
}

impl SyntheticScene {
    /// First positive hit parameter `t` of `origin + t * direction`.
    pub fn intersect(&self, origin: Vec3, direction: Vec3) -> Option<f32> {
        match *self {
            SyntheticScene::Plane { distance } => {
                if direction.z.abs() < f32::EPSILON {
                    return None;
                }
                let t = (distance - origin.z) / direction.z;
                (t > 0.0).then_some(t)
            }
            SyntheticScene::Sphere { center, radius } => {
                let oc = origin - center;
                let a = direction.length_squared();
                let b = 2.0 * direction.dot(oc);
                let c = oc.length_squared() - radius * radius;
                let disc = b * b - 4.0 * a * c;
                if disc < 0.0 {
                    return None;
                }
                let sqrt = disc.sqrt();
                let near = (-b - sqrt) / (2.0 * a);
                let far = (-b + sqrt) / (2.0 * a);
                if near > 0.0 {
                    Some(near)
                } else if far > 0.0 {
                    Some(far)
                } else {
                    None
                }
            }
        }
    }

    /// Render depth and a checkerboard colour image seen from `pose`
    /// (camera-to-world).
    pub fn render(&self, intrinsics: &Intrinsics, pose: &Affine3A) -> (DepthImage, RgbImage) {
        let (width, height) = (intrinsics.width, intrinsics.height);
        let origin = Vec3::from(pose.translation);

        let samples: Vec<(f32, [u8; 3])> = (0..intrinsics.pixel_count())
            .into_par_iter()
            .map(|i| {
                let x = (i % width as usize) as f32;
                let y = (i / width as usize) as f32;
                // z == 1 in camera space, so the hit parameter is the depth.
                let direction = pose.transform_vector3(intrinsics.ray(x, y));
                match self.intersect(origin, direction) {
                    Some(t) => (t, checker(origin + direction * t)),
                    None => (0.0, [0, 0, 0]),
                }
            })
            .collect();

        let depth = DepthImage::from_fn(width, height, |x, y| {
            Luma([samples[(y * width + x) as usize].0])
        });
        let color = RgbImage::from_fn(width, height, |x, y| {
            Rgb(samples[(y * width + x) as usize].1)
        });
        (depth, color)
    }
}

fn checker(point: Vec3) -> [u8; 3] {
    let cell = (point / 0.1).floor().as_ivec3();
    if (cell.x + cell.y + cell.z).rem_euclid(2) == 0 {
        [210, 190, 170]
    } else {
        [60, 80, 110]
    }
}

/// A stream that renders a [`SyntheticScene`] along a fixed trajectory.
pub struct SyntheticStream {
    scene: SyntheticScene,
    intrinsics: Intrinsics,
    trajectory: Vec<Affine3A>,
    next: usize,
    frame_rate: f32,
}

impl SyntheticStream {
    pub fn new(scene: SyntheticScene, intrinsics: Intrinsics, trajectory: Vec<Affine3A>) -> Self {
        Self {
            scene,
            intrinsics,
            trajectory,
            next: 0,
            frame_rate: 30.0,
        }
    }

    /// A camera that stays at the origin for `frames` frames.
    pub fn stationary(scene: SyntheticScene, intrinsics: Intrinsics, frames: usize) -> Self {
        Self::new(scene, intrinsics, vec![Affine3A::IDENTITY; frames])
    }

    pub fn len(&self) -> usize {
        self.trajectory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectory.is_empty()
    }
}

impl RgbdStream for SyntheticStream {
    fn next_frame(&mut self) -> Result<Option<RgbdCapture>, StreamError> {
        let Some(pose) = self.trajectory.get(self.next).copied() else {
            return Ok(None);
        };
        if !self.intrinsics.is_valid() {
            return Err(StreamError::InvalidIntrinsics(self.intrinsics));
        }
        if !pose.is_finite() {
            return Err(StreamError::InvalidPose(self.next));
        }
        let (depth, color) = self.scene.render(&self.intrinsics, &pose);
        let timestamp = self.next as f64 / self.frame_rate as f64;
        self.next += 1;
        Ok(Some(RgbdCapture {
            depth,
            color,
            timestamp,
            ground_truth: Some(pose),
        }))
    }

    fn frame_rate(&self) -> Option<f32> {
        Some(self.frame_rate)
    }

    fn is_active(&self) -> bool {
        self.next < self.trajectory.len()
    }
}
