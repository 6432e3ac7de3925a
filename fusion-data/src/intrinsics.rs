//! Pinhole camera intrinsics and the per-level pyramid derived from them.

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics for one image resolution.
///
/// Pixel coordinates follow the usual convention where integer `(x, y)` is the
/// pixel centre, so `u = fx * X / Z + cx`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl Intrinsics {
    pub fn new(width: u32, height: u32, fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self {
            width,
            height,
            fx,
            fy,
            cx,
            cy,
        }
    }

    /// Project a camera-space point to continuous pixel coordinates.
    ///
    /// Returns `None` for points on or behind the image plane.
    pub fn project(&self, point: Vec3) -> Option<Vec2> {
        if point.z <= f32::EPSILON {
            return None;
        }
        Some(Vec2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }

    /// Project and round to the nearest pixel, rejecting out-of-image results.
    pub fn project_to_pixel(&self, point: Vec3) -> Option<(u32, u32)> {
        let uv = self.project(point)?.round();
        if uv.x < 0.0 || uv.y < 0.0 || uv.x >= self.width as f32 || uv.y >= self.height as f32 {
            return None;
        }
        Some((uv.x as u32, uv.y as u32))
    }

    /// Like [`Intrinsics::project_to_pixel`], but points up to `margin` pixels
    /// outside the image are snapped onto its border.
    pub fn project_to_pixel_clamped(&self, point: Vec3, margin: f32) -> Option<(u32, u32)> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let uv = self.project(point)?;
        let size = Vec2::new(self.width as f32, self.height as f32);
        let (lo, hi) = (Vec2::splat(-0.5 - margin), size - 0.5 + margin);
        if uv.cmplt(lo).any() || uv.cmpge(hi).any() {
            return None;
        }
        let uv = uv.round().clamp(Vec2::ZERO, size - 1.0);
        Some((uv.x as u32, uv.y as u32))
    }

    /// Non-empty image with positive, finite focal lengths.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.fx.is_finite() && self.fy.is_finite() && self.fx > 0.0 && self.fy > 0.0
    }

    /// Lift a pixel with metric depth into camera space.
    pub fn backproject(&self, x: f32, y: f32, depth: f32) -> Vec3 {
        Vec3::new(
            (x - self.cx) * depth / self.fx,
            (y - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// Camera-space ray through a pixel, scaled so that `z == 1`.
    pub fn ray(&self, x: f32, y: f32) -> Vec3 {
        self.backproject(x, y, 1.0)
    }

    /// Intrinsics for the next coarser pyramid level (half resolution).
    pub fn downscaled(&self) -> Self {
        Self {
            width: (self.width / 2).max(1),
            height: (self.height / 2).max(1),
            fx: self.fx * 0.5,
            fy: self.fy * 0.5,
            cx: (self.cx + 0.5) * 0.5 - 0.5,
            cy: (self.cy + 0.5) * 0.5 - 0.5,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for Intrinsics {
    /// Typical structured-light sensor at VGA resolution.
    fn default() -> Self {
        Self::new(640, 480, 525.0, 525.0, 319.5, 239.5)
    }
}

/// Intrinsics for every level of an image pyramid, finest first.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicsPyramid {
    levels: Vec<Intrinsics>,
}

impl IntrinsicsPyramid {
    /// Build `level_count` levels starting from `base`. At least one level is
    /// always present.
    pub fn new(base: Intrinsics, level_count: usize) -> Self {
        let mut levels = Vec::with_capacity(level_count.max(1));
        levels.push(base);
        for _ in 1..level_count {
            let coarser = levels[levels.len() - 1].downscaled();
            levels.push(coarser);
        }
        Self { levels }
    }

    pub fn level(&self, level: usize) -> Option<&Intrinsics> {
        self.levels.get(level)
    }

    pub fn base(&self) -> &Intrinsics {
        &self.levels[0]
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Intrinsics> {
        self.levels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_backproject_roundtrip() {
        let k = Intrinsics::default();
        let p = k.backproject(100.0, 200.0, 1.5);
        let uv = k.project(p).unwrap();
        assert_relative_eq!(uv.x, 100.0, epsilon = 1e-3);
        assert_relative_eq!(uv.y, 200.0, epsilon = 1e-3);
    }

    #[test]
    fn test_project_behind_camera() {
        let k = Intrinsics::default();
        assert!(k.project(Vec3::new(0.0, 0.0, -1.0)).is_none());
        assert!(k.project_to_pixel(Vec3::new(10.0, 0.0, 1.0)).is_none());
    }

    #[test]
    fn test_clamped_projection_snaps_border() {
        let k = Intrinsics::new(8, 6, 10.0, 10.0, 3.5, 2.5);
        // u = -0.9 rounds to -1, which plain projection rejects.
        let p = k.backproject(-0.9, 5.8, 1.0);
        assert!(k.project_to_pixel(p).is_none());
        assert_eq!(k.project_to_pixel_clamped(p, 0.5), Some((0, 5)));
        assert!(k.project_to_pixel_clamped(k.backproject(-1.2, 2.0, 1.0), 0.5).is_none());
        assert_eq!(k.project_to_pixel_clamped(k.backproject(3.2, 2.0, 1.0), 0.0), Some((3, 2)));
    }

    #[test]
    fn test_validity() {
        assert!(Intrinsics::default().is_valid());
        assert!(!Intrinsics::new(0, 6, 10.0, 10.0, 0.0, 0.0).is_valid());
        assert!(!Intrinsics::new(8, 6, f32::NAN, 10.0, 0.0, 0.0).is_valid());
    }

    #[test]
    fn test_pyramid_levels() {
        let pyramid = IntrinsicsPyramid::new(Intrinsics::default(), 3);
        assert_eq!(pyramid.len(), 3);
        let l2 = pyramid.level(2).unwrap();
        assert_eq!((l2.width, l2.height), (160, 120));
        assert_relative_eq!(l2.fx, 525.0 / 4.0);
        // Pixel centre convention keeps the optical axis on the same ray.
        assert_relative_eq!(l2.cx, 79.5);
        assert!(pyramid.level(3).is_none());
    }

    #[test]
    fn test_pyramid_never_empty() {
        let pyramid = IntrinsicsPyramid::new(Intrinsics::default(), 0);
        assert_eq!(pyramid.len(), 1);
    }
}
