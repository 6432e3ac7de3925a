//! Multi-resolution working set derived from a frame.
//!
//! An [`RgbdImage`] is rebuilt every time a new frame is uploaded. Each level
//! holds depth, colour, vertex and normal maps plus grayscale intensity and
//! its two derivatives, which is what photometric/geometric odometry consumes.

use crate::frame::{FrameRef, normal_map_from_vertices, vertex_map_from_depth};
use crate::intrinsics::IntrinsicsPyramid;
use crate::pixel_map::{NormalMap, PixelMap, VertexMap, is_valid_depth};
use image::RgbImage;
use image::imageops::{self, FilterType};
use rayon::prelude::*;
use tracing::debug;

#[derive(Debug, Clone)]
struct ImageLevel {
    depth: PixelMap<f32>,
    color: RgbImage,
    vmap: VertexMap,
    nmap: NormalMap,
    intensity: PixelMap<f32>,
    intensity_dx: PixelMap<f32>,
    intensity_dy: PixelMap<f32>,
}

/// Pyramid working set for one frame.
#[derive(Debug, Clone, Default)]
pub struct RgbdImage {
    levels: Vec<ImageLevel>,
    reference: Option<FrameRef>,
}

impl RgbdImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild every level from `frame` using the calibration `pyramid`.
    #[tracing::instrument(skip_all, fields(frame = frame.id(), levels = pyramid.len()))]
    pub fn upload(&mut self, frame: FrameRef, pyramid: &IntrinsicsPyramid) {
        self.levels.clear();

        let mut depth = frame.depth().clone();
        let mut color = frame.image().clone();
        for (level, intrinsics) in pyramid.iter().enumerate() {
            if level > 0 {
                depth = downsample_depth(&depth);
                color = imageops::resize(&color, depth.width(), depth.height(), FilterType::Triangle);
            }
            let vmap = if level == 0 {
                frame.vmap().clone()
            } else {
                vertex_map_from_depth(&depth, intrinsics)
            };
            let nmap = if level == 0 {
                frame.nmap().clone()
            } else {
                normal_map_from_vertices(&vmap)
            };
            let intensity = intensity_from_color(&color);
            let (intensity_dx, intensity_dy) = sobel(&intensity);

            self.levels.push(ImageLevel {
                depth: depth.clone(),
                color: color.clone(),
                vmap,
                nmap,
                intensity,
                intensity_dx,
                intensity_dy,
            });
        }

        debug!("Uploaded frame {} into {} pyramid levels", frame.id(), self.levels.len());
        self.reference = Some(frame);
    }

    /// The frame this working set was built from.
    pub fn reference_frame(&self) -> Option<&FrameRef> {
        self.reference.as_ref()
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn depth(&self, level: usize) -> Option<&PixelMap<f32>> {
        self.levels.get(level).map(|l| &l.depth)
    }

    /// Full-resolution depth exactly as captured (after sanitising).
    pub fn raw_depth(&self) -> Option<&PixelMap<f32>> {
        self.reference.as_ref().map(|f| f.depth())
    }

    pub fn image(&self, level: usize) -> Option<&RgbImage> {
        self.levels.get(level).map(|l| &l.color)
    }

    pub fn vmap(&self, level: usize) -> Option<&VertexMap> {
        self.levels.get(level).map(|l| &l.vmap)
    }

    pub fn nmap(&self, level: usize) -> Option<&NormalMap> {
        self.levels.get(level).map(|l| &l.nmap)
    }

    pub fn intensity(&self, level: usize) -> Option<&PixelMap<f32>> {
        self.levels.get(level).map(|l| &l.intensity)
    }

    pub fn intensity_dx(&self, level: usize) -> Option<&PixelMap<f32>> {
        self.levels.get(level).map(|l| &l.intensity_dx)
    }

    pub fn intensity_dy(&self, level: usize) -> Option<&PixelMap<f32>> {
        self.levels.get(level).map(|l| &l.intensity_dy)
    }

    /// Replace the finest vertex/normal maps with a rendered surface
    /// prediction. Returns `false` (and leaves the image untouched) if the
    /// image is empty or the maps have the wrong size.
    pub fn set_prediction(&mut self, vmap: VertexMap, nmap: NormalMap) -> bool {
        let Some(level) = self.levels.first_mut() else {
            return false;
        };
        if vmap.dimensions() != level.depth.dimensions() || nmap.dimensions() != level.depth.dimensions() {
            return false;
        }
        level.vmap = vmap;
        level.nmap = nmap;
        true
    }
}

/// Halve resolution by averaging the valid samples of each 2x2 block.
fn downsample_depth(depth: &PixelMap<f32>) -> PixelMap<f32> {
    let width = (depth.width() / 2).max(1);
    let height = (depth.height() / 2).max(1);
    let mut out = PixelMap::new(width, height, 0.0);
    out.as_mut_slice()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, value) in row.iter_mut().enumerate() {
                let (mut sum, mut count) = (0.0, 0);
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    if let Some(d) = depth.get_checked(2 * x as i64 + dx, 2 * y as i64 + dy) {
                        if is_valid_depth(d) {
                            sum += d;
                            count += 1;
                        }
                    }
                }
                if count > 0 {
                    *value = sum / count as f32;
                }
            }
        });
    out
}

/// Rec.601 luma in `[0, 1]`.
fn intensity_from_color(color: &RgbImage) -> PixelMap<f32> {
    let data = color
        .pixels()
        .map(|p| (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32) / 255.0)
        .collect();
    PixelMap::from_vec(color.width(), color.height(), data)
        .unwrap_or_else(|| PixelMap::new(color.width(), color.height(), 0.0))
}

/// Sobel gradients normalised by 1/8; the one-pixel border is zero.
fn sobel(intensity: &PixelMap<f32>) -> (PixelMap<f32>, PixelMap<f32>) {
    let (width, height) = intensity.dimensions();
    let mut dx = PixelMap::new(width, height, 0.0);
    let mut dy = PixelMap::new(width, height, 0.0);
    if width < 3 || height < 3 {
        return (dx, dy);
    }
    dx.as_mut_slice()
        .par_chunks_mut(width as usize)
        .zip(dy.as_mut_slice().par_chunks_mut(width as usize))
        .enumerate()
        .skip(1)
        .take(height as usize - 2)
        .for_each(|(y, (row_dx, row_dy))| {
            let i = |x: usize, y: usize| intensity.get(x as u32, y as u32);
            for x in 1..width as usize - 1 {
                row_dx[x] = (i(x + 1, y - 1) + 2.0 * i(x + 1, y) + i(x + 1, y + 1)
                    - i(x - 1, y - 1)
                    - 2.0 * i(x - 1, y)
                    - i(x - 1, y + 1))
                    / 8.0;
                row_dy[x] = (i(x - 1, y + 1) + 2.0 * i(x, y + 1) + i(x + 1, y + 1)
                    - i(x - 1, y - 1)
                    - 2.0 * i(x, y - 1)
                    - i(x + 1, y - 1))
                    / 8.0;
            }
        });
    (dx, dy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DepthImage, RgbdFrame};
    use crate::intrinsics::Intrinsics;
    use approx::assert_relative_eq;
    use image::{Luma, Rgb};
    use std::sync::Arc;

    fn gradient_frame() -> (FrameRef, IntrinsicsPyramid) {
        let k = Intrinsics::new(16, 12, 20.0, 20.0, 7.5, 5.5);
        let depth = DepthImage::from_pixel(16, 12, Luma([1.0]));
        let color = RgbImage::from_fn(16, 12, |x, _| {
            let v = (x * 16) as u8;
            Rgb([v, v, v])
        });
        let frame = Arc::new(RgbdFrame::new(&depth, color, 3, 0.0, &k).unwrap());
        (frame, IntrinsicsPyramid::new(k, 3))
    }

    #[test]
    fn test_upload_builds_all_levels() {
        let (frame, pyramid) = gradient_frame();
        let mut image = RgbdImage::new();
        image.upload(frame, &pyramid);

        assert_eq!(image.level_count(), 3);
        assert_eq!(image.depth(1).unwrap().dimensions(), (8, 6));
        assert_eq!(image.image(2).unwrap().dimensions(), (4, 3));
        assert_relative_eq!(image.depth(2).unwrap().get(1, 1), 1.0);
        assert!(image.vmap(1).unwrap().get(2, 2).is_some());
        assert_eq!(image.reference_frame().unwrap().id(), 3);
        assert!(image.depth(3).is_none());
    }

    #[test]
    fn test_intensity_gradient_along_x() {
        let (frame, pyramid) = gradient_frame();
        let mut image = RgbdImage::new();
        image.upload(frame, &pyramid);

        let dx = image.intensity_dx(0).unwrap();
        let dy = image.intensity_dy(0).unwrap();
        // Ramp of 16/255 per pixel along x.
        assert_relative_eq!(dx.get(5, 5), 16.0 / 255.0, epsilon = 1e-4);
        assert_relative_eq!(dy.get(5, 5), 0.0, epsilon = 1e-6);
        assert_eq!(dx.get(0, 5), 0.0);
    }

    #[test]
    fn test_downsample_ignores_invalid() {
        let mut depth = PixelMap::new(2, 2, 0.0);
        depth.set(0, 0, 2.0);
        depth.set(1, 1, 4.0);
        let half = downsample_depth(&depth);
        assert_eq!(half.dimensions(), (1, 1));
        assert_relative_eq!(half.get(0, 0), 3.0);
    }

    #[test]
    fn test_set_prediction_checks_size() {
        let (frame, pyramid) = gradient_frame();
        let mut image = RgbdImage::new();
        image.upload(frame, &pyramid);

        assert!(!image.set_prediction(PixelMap::new(2, 2, None), PixelMap::new(2, 2, None)));
        let vmap = PixelMap::new(16, 12, Some(glam::Vec3::Z));
        assert!(image.set_prediction(vmap, PixelMap::new(16, 12, None)));
        assert_eq!(image.vmap(0).unwrap().valid_count(), 16 * 12);
    }
}
